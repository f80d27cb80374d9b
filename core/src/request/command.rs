use std::any::Any;
use std::fmt;
use std::time::Instant;

use super::{Priority, RequestHandle};
use crate::{FileRange, RequestPath, Statistic};

/// The work a [`FileRequest`](crate::FileRequest) carries. Exactly one command is active per request.
#[derive(Debug)]
pub enum Command {
    Read(ReadData),
    CreateDedicatedCache(CreateDedicatedCacheData),
    DestroyDedicatedCache(DestroyDedicatedCacheData),
    Flush(FlushData),
    FlushAll(FlushAllData),
    Report(ReportData),
    Cancel(CancelData),
    Reschedule(RescheduleData),
    Custom(CustomData),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Read(_) => "Read",
            Command::CreateDedicatedCache(_) => "CreateDedicatedCache",
            Command::DestroyDedicatedCache(_) => "DestroyDedicatedCache",
            Command::Flush(_) => "Flush",
            Command::FlushAll(_) => "FlushAll",
            Command::Report(_) => "Report",
            Command::Cancel(_) => "Cancel",
            Command::Reschedule(_) => "Reschedule",
            Command::Custom(_) => "Custom",
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Command::Read(_))
    }
}

/// Read `size` bytes starting at `offset` into `output`.
pub struct ReadData {
    pub path: RequestPath,
    pub offset: u64,
    pub size: u64,
    /// The destination buffer. This is at least `size` bytes long.
    pub output: Vec<u8>,
    /// The number of bytes that were read once the request has completed.
    pub bytes_read: u64,
    /// Whether reading fewer than `size` bytes (i.e. at the end of the file) counts
    /// as a success. Only used for internal reads such as cache block fetches.
    pub allow_short: bool,
}

impl ReadData {
    pub fn range(&self) -> FileRange {
        FileRange::new(self.offset, self.size)
    }
}

impl fmt::Debug for ReadData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadData")
            .field("path", &self.path)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("output_len", &self.output.len())
            .field("bytes_read", &self.bytes_read)
            .field("allow_short", &self.allow_short)
            .finish()
    }
}

/// Create a dedicated cache for a file, or a range within a file.
///
/// A range of `None` is resolved to the entire file when the request is prepared.
#[derive(Debug, Clone)]
pub struct CreateDedicatedCacheData {
    pub path: RequestPath,
    pub range: Option<FileRange>,
}

/// Release a dedicated cache previously created with the same path and range.
#[derive(Debug, Clone)]
pub struct DestroyDedicatedCacheData {
    pub path: RequestPath,
    pub range: Option<FileRange>,
}

/// Flush anything cached for a single file.
#[derive(Debug, Clone)]
pub struct FlushData {
    pub path: RequestPath,
}

/// Flush every cache in the stack.
#[derive(Debug, Clone, Default)]
pub struct FlushAllData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportType {
    /// The configuration of every stack entry.
    Config,
    /// The files currently held open by the stack.
    FileLocks,
}

/// Ask every stack entry to append information to `output`.
#[derive(Debug)]
pub struct ReportData {
    pub report_type: ReportType,
    pub output: Vec<Statistic>,
}

/// Cancel the request referred to by `target`.
#[derive(Debug)]
pub struct CancelData {
    pub target: RequestHandle,
}

/// Change the deadline and priority of the request referred to by `target`.
#[derive(Debug)]
pub struct RescheduleData {
    pub target: RequestHandle,
    pub new_deadline: Option<Instant>,
    pub new_priority: Priority,
}

/// A user-defined command for custom stack entries.
pub struct CustomData {
    pub payload: Box<dyn Any + Send>,
    /// If no stack entry handles this command, the request fails when this is true
    /// and completes otherwise.
    pub fail_when_unhandled: bool,
}

impl fmt::Debug for CustomData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomData")
            .field("fail_when_unhandled", &self.fail_when_unhandled)
            .finish_non_exhaustive()
    }
}
