mod allocator;
mod command;
mod file_request;
mod handle;

pub use allocator::{DefaultRequestMemoryAllocator, ReadOutput, RequestMemoryAllocator};
pub use command::{
    CancelData, Command, CreateDedicatedCacheData, CustomData, DestroyDedicatedCacheData,
    FlushAllData, FlushData, ReadData, ReportData, ReportType, RescheduleData,
};
pub use file_request::FileRequest;
pub use handle::RequestHandle;

pub(crate) use handle::lock;

/// The status of a request.
///
/// A request only ever moves forward through these states:
/// `Pending -> Queued -> Completed | Canceled | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    /// The request has been created or submitted but hasn't been queued on the stack yet.
    Pending,
    /// The request has been queued on the stack and is being processed.
    Queued,
    /// The request finished successfully.
    Completed,
    /// The request was canceled before it could finish.
    Canceled,
    /// The request could not be processed.
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Canceled | RequestStatus::Failed
        )
    }

    fn rank(self) -> u8 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::Queued => 1,
            RequestStatus::Completed | RequestStatus::Canceled | RequestStatus::Failed => 2,
        }
    }

    /// Returns true if a request in this status is allowed to move to `next`.
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

/// The scheduling priority of a request. Higher values are processed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    pub const LOWEST: Priority = Priority(0);
    pub const LOW: Priority = Priority(64);
    pub const MEDIUM: Priority = Priority(128);
    pub const HIGH: Priority = Priority(192);
    pub const HIGHEST: Priority = Priority(255);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::MEDIUM
    }
}
