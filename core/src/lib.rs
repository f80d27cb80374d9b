use std::time;

mod context;
mod error;
mod path;
mod range;
mod request;
mod scheduler;
mod statistics;
mod streamer;

pub mod stack;

#[cfg(test)]
mod tests;

pub use context::StreamerContext;
pub use error::StreamerError;
pub use path::RequestPath;
pub use range::FileRange;
pub use request::{
    CancelData, Command, CreateDedicatedCacheData, CustomData, DefaultRequestMemoryAllocator,
    DestroyDedicatedCacheData, FileRequest, FlushAllData, FlushData, Priority, ReadData,
    ReadOutput, ReportData, ReportType, RequestHandle, RequestMemoryAllocator, RequestStatus,
    RescheduleData,
};
pub use stack::{
    shared, BlockCache, BlockCacheConfig, BlockSize, DedicatedCache, DedicatedCacheConfig,
    HardwareInformation, StackConfig, StackEntryConfig, StackEntryPtr, StackLink, Status,
    StreamStackEntry,
};
pub use statistics::{AverageWindow, Statistic, StatisticValue};
pub use streamer::{Streamer, StreamerOptions};

/// How long the scheduler waits for new requests when it's idle, by default.
pub const DEFAULT_POLL_INTERVAL: time::Duration = time::Duration::from_millis(5);

/// How often blocking calls check whether a request has finished.
pub const BLOCKING_POLL_INTERVAL: time::Duration = time::Duration::from_millis(1);
