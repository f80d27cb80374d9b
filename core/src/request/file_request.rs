use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use super::handle::{RequestOutcome, RequestState};
use super::{
    CancelData, Command, CreateDedicatedCacheData, CustomData, DestroyDedicatedCacheData,
    FlushAllData, FlushData, Priority, ReadData, ReadOutput, ReportData, ReportType,
    RequestHandle, RequestStatus, RescheduleData,
};
use crate::{FileRange, RequestPath};

/// Called instead of the regular finalization when a request that a stack entry
/// issued for itself completes. The entry gets the request back by value.
pub(crate) type InternalCompletion = Box<dyn FnOnce(FileRequest) + Send>;

/// A request as it travels through the streaming stack.
///
/// A `FileRequest` is owned by exactly one queue at a time and is moved from the
/// submission channel to the prepared queue, into the stack entries and finally to
/// the completed queue of the [`StreamerContext`](crate::StreamerContext). The caller
/// keeps a [`RequestHandle`] to the same request.
///
/// If a request is dropped before it was finalized (for example because the stack
/// was torn down) it resolves as [`RequestStatus::Canceled`].
pub struct FileRequest {
    state: Arc<RequestState>,
    command: Command,
    status: RequestStatus,
    deadline: Option<Instant>,
    priority: Priority,
    submitted: Instant,
    on_completion: Option<InternalCompletion>,
    finalized: bool,
}

impl FileRequest {
    fn new(command: Command, state: Arc<RequestState>) -> Self {
        Self {
            state,
            command,
            status: RequestStatus::Pending,
            deadline: None,
            priority: Priority::default(),
            submitted: Instant::now(),
            on_completion: None,
            finalized: false,
        }
    }

    /// Create a request that reads `size` bytes starting at `offset`.
    ///
    /// A buffer passed through `output` is grown to `size` bytes if it is smaller.
    pub fn create_read(
        path: impl Into<RequestPath>,
        output: ReadOutput,
        offset: u64,
        size: u64,
        deadline: Option<Instant>,
        priority: Priority,
    ) -> Self {
        let len = size as usize;
        let (buffer, allocator) = match output {
            ReadOutput::Buffer(mut buffer) => {
                if buffer.len() < len {
                    buffer.resize(len, 0);
                }
                (buffer, None)
            }
            ReadOutput::Allocator(allocator) => (allocator.allocate(len), Some(allocator)),
        };

        let mut request = Self::new(
            Command::Read(ReadData {
                path: path.into(),
                offset,
                size,
                output: buffer,
                bytes_read: 0,
                allow_short: false,
            }),
            RequestState::new(allocator),
        );
        request.deadline = deadline;
        request.priority = priority;
        request
    }

    /// A read issued by a stack entry on its own behalf. `on_completion` receives the
    /// request back once it's done instead of it being finalized.
    pub(crate) fn create_internal_read(
        path: RequestPath,
        offset: u64,
        size: u64,
        allow_short: bool,
        deadline: Option<Instant>,
        priority: Priority,
        on_completion: InternalCompletion,
    ) -> Self {
        let mut request = Self::new(
            Command::Read(ReadData {
                path,
                offset,
                size,
                output: vec![0; size as usize],
                bytes_read: 0,
                allow_short,
            }),
            RequestState::new(None),
        );
        request.deadline = deadline;
        request.priority = priority;
        request.on_completion = Some(on_completion);
        request
    }

    pub fn create_dedicated_cache_creation(
        path: impl Into<RequestPath>,
        range: Option<FileRange>,
    ) -> Self {
        Self::new(
            Command::CreateDedicatedCache(CreateDedicatedCacheData {
                path: path.into(),
                range,
            }),
            RequestState::new(None),
        )
    }

    pub fn create_dedicated_cache_destruction(
        path: impl Into<RequestPath>,
        range: Option<FileRange>,
    ) -> Self {
        Self::new(
            Command::DestroyDedicatedCache(DestroyDedicatedCacheData {
                path: path.into(),
                range,
            }),
            RequestState::new(None),
        )
    }

    pub fn create_cancel(target: RequestHandle) -> Self {
        Self::new(
            Command::Cancel(CancelData { target }),
            RequestState::new(None),
        )
    }

    pub fn create_reschedule(
        target: RequestHandle,
        new_deadline: Option<Instant>,
        new_priority: Priority,
    ) -> Self {
        Self::new(
            Command::Reschedule(RescheduleData {
                target,
                new_deadline,
                new_priority,
            }),
            RequestState::new(None),
        )
    }

    pub fn create_flush(path: impl Into<RequestPath>) -> Self {
        Self::new(
            Command::Flush(FlushData { path: path.into() }),
            RequestState::new(None),
        )
    }

    pub fn create_flush_all() -> Self {
        Self::new(Command::FlushAll(FlushAllData), RequestState::new(None))
    }

    pub fn create_report(report_type: ReportType) -> Self {
        Self::new(
            Command::Report(ReportData {
                report_type,
                output: Vec::new(),
            }),
            RequestState::new(None),
        )
    }

    pub fn create_custom(payload: Box<dyn Any + Send>, fail_when_unhandled: bool) -> Self {
        Self::new(
            Command::Custom(CustomData {
                payload,
                fail_when_unhandled,
            }),
            RequestState::new(None),
        )
    }

    pub fn id(&self) -> u64 {
        self.state.id()
    }

    /// A handle the caller can use to follow this request.
    pub fn handle(&self) -> RequestHandle {
        RequestHandle {
            state: Arc::clone(&self.state),
        }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn command_mut(&mut self) -> &mut Command {
        &mut self.command
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Move the request to `status`.
    ///
    /// The status only ever moves forward. Trying to move it backwards, or away from a
    /// terminal status, is a bug in the calling stack entry: it's reported and ignored.
    /// A terminal status becomes visible to the caller once the request is finalized.
    pub fn set_status(&mut self, status: RequestStatus) {
        if self.status == status {
            return;
        }

        if !self.status.can_transition_to(status) {
            log::warn!(
                "{} request {} can't move from {:?} to {:?}.",
                self.command.name(),
                self.id(),
                self.status,
                status
            );
            debug_assert!(false, "Request status can only move forward.");
            return;
        }

        self.status = status;
        if status == RequestStatus::Queued {
            self.state.set_status(status);
        }
    }

    /// Returns true if this request is the one `handle` refers to.
    pub fn works_on(&self, handle: &RequestHandle) -> bool {
        Arc::ptr_eq(&self.state, &handle.state)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// When the request was created.
    pub fn submitted(&self) -> Instant {
        self.submitted
    }

    pub fn estimated_completion(&self) -> Option<Instant> {
        self.state.estimated_completion()
    }

    pub fn set_estimated_completion(&self, time: Instant) {
        self.state.set_estimated_completion(time);
    }

    /// Returns true if a stack entry issued this request for itself.
    pub fn is_internal(&self) -> bool {
        self.on_completion.is_some()
    }

    pub(crate) fn take_completion_hook(&mut self) -> Option<InternalCompletion> {
        self.on_completion.take()
    }

    /// Publish the result to the caller and fire the completion callback.
    pub(crate) fn finalize(mut self) {
        self.finalized = true;
        let outcome = self.take_outcome();
        self.state.resolve(self.status, outcome);
    }

    fn take_outcome(&mut self) -> Option<RequestOutcome> {
        match &mut self.command {
            Command::Read(data) => Some(RequestOutcome::Read {
                buffer: Some(std::mem::take(&mut data.output)),
                bytes_read: data.bytes_read,
            }),
            Command::Report(data) => Some(RequestOutcome::Report(Some(std::mem::take(
                &mut data.output,
            )))),
            _ => None,
        }
    }
}

impl Drop for FileRequest {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }

        let status = if self.status.is_terminal() {
            self.status
        } else {
            RequestStatus::Canceled
        };
        let outcome = self.take_outcome();
        self.state.resolve(status, outcome);
    }
}

impl std::fmt::Debug for FileRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRequest")
            .field("id", &self.id())
            .field("command", &self.command)
            .field("status", &self.status)
            .field("deadline", &self.deadline)
            .field("priority", &self.priority)
            .field("internal", &self.is_internal())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DefaultRequestMemoryAllocator;

    #[test]
    fn read_buffer_grows_to_size() {
        let request = FileRequest::create_read(
            "foo.bin",
            ReadOutput::Buffer(vec![1, 2, 3]),
            0,
            100,
            None,
            Priority::HIGH,
        );

        match request.command() {
            Command::Read(data) => {
                assert_eq!(data.output.len(), 100);
                assert_eq!(&data.output[..3], &[1, 2, 3]);
                assert!(!data.allow_short);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(request.priority(), Priority::HIGH);
    }

    #[test]
    fn terminal_status_is_published_on_finalize() {
        let mut request = FileRequest::create_flush_all();
        let handle = request.handle();

        request.set_status(RequestStatus::Queued);
        assert_eq!(handle.status(), RequestStatus::Queued);

        request.set_status(RequestStatus::Failed);
        assert_eq!(handle.status(), RequestStatus::Queued);

        request.finalize();
        assert_eq!(handle.status(), RequestStatus::Failed);
    }

    #[test]
    fn unfinished_status_finalizes_as_completed() {
        let request = FileRequest::create_report(ReportType::Config);
        let handle = request.handle();
        request.finalize();
        assert_eq!(handle.status(), RequestStatus::Completed);
    }

    #[test]
    fn dropped_request_is_canceled() {
        let allocator = Arc::new(DefaultRequestMemoryAllocator::new());
        let request = FileRequest::create_read(
            "foo.bin",
            ReadOutput::Allocator(allocator.clone()),
            0,
            64,
            None,
            Priority::default(),
        );
        let handle = request.handle();
        assert_eq!(allocator.num_outstanding_allocations(), 1);

        drop(request);
        assert_eq!(handle.status(), RequestStatus::Canceled);

        drop(handle);
        assert_eq!(allocator.num_outstanding_allocations(), 0);
    }

    #[test]
    fn works_on_uses_identity() {
        let a = FileRequest::create_flush("a");
        let b = FileRequest::create_flush("a");
        assert!(a.works_on(&a.handle()));
        assert!(!a.works_on(&b.handle()));
    }
}
