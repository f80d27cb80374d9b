//! Asynchronous file streaming through a configurable stack of caches.
//!
//! Requests are submitted to a [`Streamer`], which hands them to a stack of entries on
//! its own thread. The stack is built from a [`StackConfig`] on top of a storage
//! entry such as the filesystem [`StorageDrive`].

pub use sluice_core::*;

#[cfg(feature = "storage-fs")]
pub use sluice_storage_fs::{error::StorageError, StorageDrive, StorageDriveOptions};

/// Options for [`open_streamer`].
#[cfg(feature = "storage-fs")]
#[derive(Debug, Clone, Default)]
pub struct StreamerConfig {
    pub stack: StackConfig,
    pub hardware: HardwareInformation,
    pub storage: StorageDriveOptions,
    pub streamer: StreamerOptions,
}

/// Build the stack described by `config` on top of a [`StorageDrive`] and start a
/// [`Streamer`] for it.
#[cfg(feature = "storage-fs")]
pub fn open_streamer(config: &StreamerConfig) -> Result<Streamer, StreamerError> {
    let drive = StorageDrive::new(config.storage.clone());
    let stack = config.stack.build(&config.hardware, shared(drive));
    Streamer::new(stack, config.streamer.clone())
}
