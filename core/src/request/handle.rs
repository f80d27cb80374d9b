use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{RequestMemoryAllocator, RequestStatus};
use crate::{Statistic, StreamerError, BLOCKING_POLL_INTERVAL};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Lock a mutex, recovering the data if another thread panicked while holding it.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) type RequestCallback = Box<dyn FnOnce(&RequestHandle) + Send>;

/// What a finished request hands back to the caller.
pub(crate) enum RequestOutcome {
    Read {
        /// `None` once the caller claimed the buffer.
        buffer: Option<Vec<u8>>,
        bytes_read: u64,
    },
    Report(Option<Vec<Statistic>>),
}

struct StateInner {
    status: RequestStatus,
    estimated_completion: Option<Instant>,
    outcome: Option<RequestOutcome>,
    callback: Option<RequestCallback>,
}

/// The part of a request that is shared between the caller and the streaming stack.
pub(crate) struct RequestState {
    id: u64,
    inner: Mutex<StateInner>,
    allocator: Option<Arc<dyn RequestMemoryAllocator>>,
}

impl RequestState {
    pub(crate) fn new(allocator: Option<Arc<dyn RequestMemoryAllocator>>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(StateInner {
                status: RequestStatus::Pending,
                estimated_completion: None,
                outcome: None,
                callback: None,
            }),
            allocator,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn status(&self) -> RequestStatus {
        lock(&self.inner).status
    }

    /// Move to `status`. Returns false and leaves the status untouched if that would
    /// move the request backwards or out of a terminal status.
    pub(crate) fn set_status(&self, status: RequestStatus) -> bool {
        let mut inner = lock(&self.inner);
        if inner.status == status {
            return !status.is_terminal();
        }
        if !inner.status.can_transition_to(status) {
            log::warn!(
                "Request {} can't move from {:?} to {:?}.",
                self.id,
                inner.status,
                status
            );
            debug_assert!(
                inner.status.is_terminal(),
                "Request status can only move forward."
            );
            return false;
        }
        inner.status = status;
        true
    }

    pub(crate) fn estimated_completion(&self) -> Option<Instant> {
        lock(&self.inner).estimated_completion
    }

    pub(crate) fn set_estimated_completion(&self, time: Instant) {
        lock(&self.inner).estimated_completion = Some(time);
    }

    /// Move the request into a terminal status, store its outcome and fire the
    /// completion callback. `status` is replaced by `Completed` if it isn't terminal.
    pub(crate) fn resolve(self: &Arc<Self>, status: RequestStatus, outcome: Option<RequestOutcome>) {
        let status = if status.is_terminal() {
            status
        } else {
            RequestStatus::Completed
        };

        let callback = {
            let mut inner = lock(&self.inner);
            if inner.status.is_terminal() {
                log::debug!("Request {} was resolved more than once.", self.id);
                drop(inner);
                if let Some(RequestOutcome::Read {
                    buffer: Some(buffer),
                    ..
                }) = outcome
                {
                    self.release_buffer(buffer);
                }
                return;
            }

            inner.status = status;
            if outcome.is_some() {
                inner.outcome = outcome;
            }
            inner.callback.take()
        };

        if let Some(callback) = callback {
            callback(&RequestHandle {
                state: Arc::clone(self),
            });
        }
    }

    /// Register the completion callback. If the request already finished the callback
    /// is called right away on the calling thread.
    pub(crate) fn set_callback(self: &Arc<Self>, callback: RequestCallback) {
        let mut inner = lock(&self.inner);
        if inner.status.is_terminal() {
            drop(inner);
            callback(&RequestHandle {
                state: Arc::clone(self),
            });
        } else {
            inner.callback = Some(callback);
        }
    }

    /// Give a read buffer that will never reach the caller back to its allocator.
    pub(crate) fn release_buffer(&self, buffer: Vec<u8>) {
        if let Some(allocator) = &self.allocator {
            allocator.release(buffer);
        }
    }

    pub(crate) fn read_result(&self) -> Result<(u64, bool), StreamerError> {
        let inner = lock(&self.inner);
        if !inner.status.is_terminal() {
            return Err(StreamerError::NotCompleted);
        }
        match &inner.outcome {
            Some(RequestOutcome::Read { buffer, bytes_read }) => Ok((*bytes_read, buffer.is_some())),
            Some(RequestOutcome::Report(_)) => Err(StreamerError::NotARead),
            None => Err(StreamerError::NotARead),
        }
    }

    pub(crate) fn with_read_buffer<R>(
        &self,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, StreamerError> {
        let inner = lock(&self.inner);
        if !inner.status.is_terminal() {
            return Err(StreamerError::NotCompleted);
        }
        match &inner.outcome {
            Some(RequestOutcome::Read {
                buffer: Some(buffer),
                bytes_read,
            }) => {
                let len = (*bytes_read as usize).min(buffer.len());
                Ok(f(&buffer[..len]))
            }
            Some(RequestOutcome::Read { buffer: None, .. }) => Err(StreamerError::BufferClaimed),
            _ => Err(StreamerError::NotARead),
        }
    }

    pub(crate) fn claim_read_buffer(&self) -> Result<Vec<u8>, StreamerError> {
        let mut inner = lock(&self.inner);
        debug_assert!(
            inner.status.is_terminal(),
            "Claiming memory from a read that hasn't completed yet."
        );
        if !inner.status.is_terminal() {
            return Err(StreamerError::NotCompleted);
        }
        match &mut inner.outcome {
            Some(RequestOutcome::Read { buffer, bytes_read }) => {
                let mut buffer = buffer.take().ok_or(StreamerError::BufferClaimed)?;
                buffer.truncate(*bytes_read as usize);
                Ok(buffer)
            }
            _ => Err(StreamerError::NotARead),
        }
    }

    pub(crate) fn take_report(&self) -> Result<Vec<Statistic>, StreamerError> {
        let mut inner = lock(&self.inner);
        if !inner.status.is_terminal() {
            return Err(StreamerError::NotCompleted);
        }
        match &mut inner.outcome {
            Some(RequestOutcome::Report(statistics)) => {
                statistics.take().ok_or(StreamerError::ReportClaimed)
            }
            _ => Err(StreamerError::NotAReport),
        }
    }
}

impl Drop for RequestState {
    fn drop(&mut self) {
        if let Some(allocator) = &self.allocator {
            let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
            if let Some(RequestOutcome::Read {
                buffer: Some(buffer),
                ..
            }) = inner.outcome.take()
            {
                allocator.release(buffer);
            }
        }
    }
}

/// A handle to a request that was handed to the streaming stack.
///
/// Handles are cheap to clone and can be used from any thread to poll the status
/// of the request. Two handles are equal if they refer to the same request.
#[derive(Clone)]
pub struct RequestHandle {
    pub(crate) state: Arc<RequestState>,
}

impl RequestHandle {
    pub fn id(&self) -> u64 {
        self.state.id()
    }

    pub fn status(&self) -> RequestStatus {
        self.state.status()
    }

    /// Returns true once the request completed, failed or was canceled.
    pub fn has_completed(&self) -> bool {
        self.state.status().is_terminal()
    }

    /// The best guess of the stack for when this request will complete. This is
    /// updated while the request is being processed and is not a guarantee.
    pub fn estimated_completion(&self) -> Option<Instant> {
        self.state.estimated_completion()
    }

    /// The number of bytes a completed read returned.
    pub fn bytes_read(&self) -> Result<u64, StreamerError> {
        self.state.read_result().map(|(bytes_read, _)| bytes_read)
    }

    /// Take the buffer of a completed read, truncated to the number of bytes read.
    pub fn claim_read_buffer(&self) -> Result<Vec<u8>, StreamerError> {
        self.state.claim_read_buffer()
    }

    pub fn with_read_buffer<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, StreamerError> {
        self.state.with_read_buffer(f)
    }

    /// Take the statistics of a completed report.
    pub fn take_report(&self) -> Result<Vec<Statistic>, StreamerError> {
        self.state.take_report()
    }

    /// Block the calling thread until the request finished or `timeout` passed.
    ///
    /// This is *NOT* realtime-safe.
    pub fn block_until_completed(&self, timeout: Duration) -> RequestStatus {
        let start = Instant::now();
        loop {
            let status = self.status();
            if status.is_terminal() || start.elapsed() >= timeout {
                return status;
            }

            std::thread::sleep(BLOCKING_POLL_INTERVAL);
        }
    }
}

impl PartialEq for RequestHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Eq for RequestHandle {}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}
