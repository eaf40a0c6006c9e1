mod service;

pub use service::{DeviceStateService, MergeOptions, MergeOutcome, PersistenceWriter};
