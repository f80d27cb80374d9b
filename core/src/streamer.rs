use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use rtrb::{Producer, RingBuffer};

use crate::request::lock;
use crate::scheduler::{Scheduler, SchedulerMsg};
use crate::stack::StackEntryPtr;
use crate::{
    FileRange, FileRequest, Priority, ReadOutput, ReportType, RequestHandle, RequestPath,
    RequestStatus, Statistic, StreamerContext, StreamerError, DEFAULT_POLL_INTERVAL,
};

/// Options for a [`Streamer`].
#[derive(Debug, Clone)]
pub struct StreamerOptions {
    /// How long the scheduler thread waits for new requests when it has nothing to do.
    ///
    /// By default this is set to 5 ms.
    pub poll_interval: Duration,
}

impl Default for StreamerOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// The entry point for streaming files.
///
/// A `Streamer` owns a stack of entries and the scheduler thread that drives it.
/// Every operation creates a request, submits it and returns a [`RequestHandle`]
/// that can be polled or given a callback. All methods can be called from any
/// thread.
///
/// Dropping the streamer stops the scheduler. Requests that haven't completed by then
/// are canceled.
pub struct Streamer {
    to_scheduler_tx: Sender<SchedulerMsg>,
    close_signal_tx: Mutex<Producer<()>>,

    stack: StackEntryPtr,
    context: Arc<StreamerContext>,

    join_handle: Option<JoinHandle<()>>,
}

impl Streamer {
    /// Attach a new context to `stack` and start the scheduler thread.
    pub fn new(stack: StackEntryPtr, options: StreamerOptions) -> Result<Self, StreamerError> {
        let context = Arc::new(StreamerContext::new());
        lock(&stack).set_context(Arc::clone(&context));

        let (to_scheduler_tx, from_client_rx) = crossbeam_channel::unbounded();

        // Create dedicated close signal.
        let (close_signal_tx, close_signal_rx) = RingBuffer::<()>::new(1);

        let join_handle = Scheduler::spawn(
            Arc::clone(&stack),
            Arc::clone(&context),
            options.poll_interval,
            from_client_rx,
            close_signal_rx,
        )?;

        Ok(Self {
            to_scheduler_tx,
            close_signal_tx: Mutex::new(close_signal_tx),
            stack,
            context,
            join_handle: Some(join_handle),
        })
    }

    /// Submit a request that was created by hand.
    ///
    /// If the scheduler is gone the request is canceled right away.
    pub fn queue_request(&self, request: FileRequest) -> RequestHandle {
        let handle = request.handle();
        if let Err(e) = self.to_scheduler_tx.send(SchedulerMsg::Request(request)) {
            log::warn!("Scheduler is closed, request {} is canceled.", handle.id());
            // Dropping the request cancels it.
            drop(e);
        }
        handle
    }

    /// Read `size` bytes from `path` starting at `offset`.
    pub fn read(
        &self,
        path: impl Into<RequestPath>,
        output: ReadOutput,
        size: u64,
        deadline: Option<Instant>,
        priority: Priority,
        offset: u64,
    ) -> RequestHandle {
        self.queue_request(FileRequest::create_read(
            path, output, offset, size, deadline, priority,
        ))
    }

    /// Cancel `target`. Cancellation is a request of its own and goes through the same
    /// queue as everything else.
    pub fn cancel(&self, target: &RequestHandle) -> RequestHandle {
        self.queue_request(FileRequest::create_cancel(target.clone()))
    }

    /// Change the deadline and priority of a request that hasn't been queued yet.
    pub fn reschedule_request(
        &self,
        target: &RequestHandle,
        new_deadline: Option<Instant>,
        new_priority: Priority,
    ) -> RequestHandle {
        self.queue_request(FileRequest::create_reschedule(
            target.clone(),
            new_deadline,
            new_priority,
        ))
    }

    pub fn create_dedicated_cache(&self, path: impl Into<RequestPath>) -> RequestHandle {
        self.queue_request(FileRequest::create_dedicated_cache_creation(path, None))
    }

    pub fn create_dedicated_cache_range(
        &self,
        path: impl Into<RequestPath>,
        range: FileRange,
    ) -> RequestHandle {
        self.queue_request(FileRequest::create_dedicated_cache_creation(
            path,
            Some(range),
        ))
    }

    pub fn destroy_dedicated_cache(&self, path: impl Into<RequestPath>) -> RequestHandle {
        self.queue_request(FileRequest::create_dedicated_cache_destruction(path, None))
    }

    pub fn destroy_dedicated_cache_range(
        &self,
        path: impl Into<RequestPath>,
        range: FileRange,
    ) -> RequestHandle {
        self.queue_request(FileRequest::create_dedicated_cache_destruction(
            path,
            Some(range),
        ))
    }

    /// Drop anything cached for `path`.
    pub fn flush_cache(&self, path: impl Into<RequestPath>) -> RequestHandle {
        self.queue_request(FileRequest::create_flush(path))
    }

    /// Drop everything in every cache.
    pub fn flush_caches(&self) -> RequestHandle {
        self.queue_request(FileRequest::create_flush_all())
    }

    /// Ask every stack entry for information. Collect the result with
    /// [`Streamer::get_report_result`].
    pub fn report(&self, report_type: ReportType) -> RequestHandle {
        self.queue_request(FileRequest::create_report(report_type))
    }

    pub fn custom(&self, payload: Box<dyn Any + Send>, fail_when_unhandled: bool) -> RequestHandle {
        self.queue_request(FileRequest::create_custom(payload, fail_when_unhandled))
    }

    /// Call `callback` once the request has completed, failed or was canceled.
    ///
    /// The callback runs on the scheduler thread. If the request already finished it
    /// runs right away on the calling thread.
    pub fn set_request_complete_callback<F>(&self, handle: &RequestHandle, callback: F)
    where
        F: FnOnce(&RequestHandle) + Send + 'static,
    {
        handle.state.set_callback(Box::new(callback));
    }

    pub fn get_request_status(&self, handle: &RequestHandle) -> RequestStatus {
        handle.status()
    }

    pub fn has_request_completed(&self, handle: &RequestHandle) -> bool {
        handle.has_completed()
    }

    pub fn get_estimated_request_completion_time(
        &self,
        handle: &RequestHandle,
    ) -> Option<Instant> {
        handle.estimated_completion()
    }

    /// The number of bytes a completed read returned.
    pub fn get_read_request_result(&self, handle: &RequestHandle) -> Result<u64, StreamerError> {
        handle.bytes_read()
    }

    /// Take the buffer of a completed read. The buffer is truncated to the number of
    /// bytes read and the caller becomes responsible for it.
    ///
    /// Claiming the buffer of a read that hasn't completed is a bug and is caught by a
    /// debug assertion.
    pub fn claim_read_buffer(&self, handle: &RequestHandle) -> Result<Vec<u8>, StreamerError> {
        handle.claim_read_buffer()
    }

    /// Look at the data of a completed read without claiming it.
    pub fn with_read_buffer<R>(
        &self,
        handle: &RequestHandle,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, StreamerError> {
        handle.with_read_buffer(f)
    }

    /// Take the statistics of a completed report.
    pub fn get_report_result(
        &self,
        handle: &RequestHandle,
    ) -> Result<Vec<Statistic>, StreamerError> {
        handle.take_report()
    }

    /// Collect statistics from every stack entry and the scheduler.
    ///
    /// This briefly locks the stack, which blocks the scheduler thread.
    pub fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        lock(&self.stack).collect_statistics(statistics);
        self.context.collect_statistics(statistics);
    }

    /// Stop handing new requests to the stack. Requests that are already queued keep
    /// being processed.
    pub fn suspend_processing(&self) -> Result<(), StreamerError> {
        self.to_scheduler_tx
            .send(SchedulerMsg::Suspend)
            .map_err(|_| StreamerError::SchedulerClosed)
    }

    pub fn resume_processing(&self) -> Result<(), StreamerError> {
        self.to_scheduler_tx
            .send(SchedulerMsg::Resume)
            .map_err(|_| StreamerError::SchedulerClosed)
    }

    /// Block the calling thread until the request finished or `timeout` passed.
    ///
    /// This is *NOT* realtime-safe.
    pub fn block_until_completed(
        &self,
        handle: &RequestHandle,
        timeout: Duration,
    ) -> RequestStatus {
        handle.block_until_completed(timeout)
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        // Tell the scheduler to stop.
        let close_signal_tx = self
            .close_signal_tx
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if close_signal_tx.push(()).is_err() {
            log::error!("Streamer failed to send close signal to the scheduler.");
        }

        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                log::error!("Scheduler thread panicked.");
            }
        }
    }
}

impl std::fmt::Debug for Streamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streamer")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
