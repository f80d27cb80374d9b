//! The entries that make up a streaming stack.
//!
//! A stack is a chain of [`StreamStackEntry`]s. Requests enter at the root and every
//! entry either handles a request, looks at it and passes it on, or passes it on
//! untouched. Whatever reaches the end of the chain without being handled is
//! completed there.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::request::lock;
use crate::{Command, FileRequest, RequestStatus, Statistic, StreamerContext};

mod block_cache;
mod config;
mod dedicated_cache;

pub use block_cache::BlockCache;
pub use config::{
    BlockCacheConfig, BlockSize, DedicatedCacheConfig, HardwareInformation, StackConfig,
    StackEntryConfig,
};
pub use dedicated_cache::DedicatedCache;

/// A shared pointer to a stack entry.
///
/// Entries are shared because a dedicated cache hands its own successor to every
/// block cache it creates.
pub type StackEntryPtr = Arc<Mutex<dyn StreamStackEntry>>;

/// Wrap a stack entry so it can be used as the successor of another entry.
pub fn shared<E: StreamStackEntry + 'static>(entry: E) -> StackEntryPtr {
    Arc::new(Mutex::new(entry))
}

/// The state of the stack, collected from the root down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// The number of requests the stack can accept before it's saturated.
    pub num_available_slots: i32,
    /// True if no entry in the stack has any work left.
    pub is_idle: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            num_available_slots: i32::MAX,
            is_idle: true,
        }
    }
}

/// The wiring every stack entry carries: its name, its successor and the shared
/// context. It also implements the behavior an entry falls back on for requests it
/// isn't interested in.
pub struct StackLink {
    name: String,
    next: Option<StackEntryPtr>,
    context: Option<Arc<StreamerContext>>,
}

impl StackLink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next: None,
            context: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn next(&self) -> Option<&StackEntryPtr> {
        self.next.as_ref()
    }

    pub fn set_next(&mut self, next: Option<StackEntryPtr>) {
        self.next = next;
    }

    pub fn context(&self) -> Option<&Arc<StreamerContext>> {
        self.context.as_ref()
    }

    /// Attach the context to this entry and every entry after it.
    pub fn set_context(&mut self, context: Arc<StreamerContext>) {
        if let Some(next) = &self.next {
            lock(next).set_context(Arc::clone(&context));
        }
        self.context = Some(context);
    }

    /// The name of the next entry, for reports.
    pub fn next_name(&self) -> String {
        match &self.next {
            Some(next) => lock(next).name().to_owned(),
            None => String::from("<None>"),
        }
    }

    /// Pass the request on to the next entry. Fails the request if there is none.
    pub fn prepare_request(&mut self, mut request: FileRequest) {
        if let Some(next) = &self.next {
            lock(next).prepare_request(request);
        } else {
            log::debug!(
                "No stack entry after '{}' to prepare {} request {}.",
                self.name,
                request.command().name(),
                request.id()
            );
            request.set_status(RequestStatus::Failed);
            self.complete(request);
        }
    }

    /// Pass the request on to the next entry.
    ///
    /// At the end of the chain, requests that every entry gets to see (flushes and
    /// reports) complete, custom requests complete or fail depending on how they were
    /// created, and anything else fails because nothing was able to handle it.
    pub fn queue_request(&mut self, mut request: FileRequest) {
        if let Some(next) = &self.next {
            lock(next).queue_request(request);
            return;
        }

        let status = match request.command() {
            Command::Flush(_) | Command::FlushAll(_) | Command::Report(_) => {
                RequestStatus::Completed
            }
            Command::Custom(data) => {
                if data.fail_when_unhandled {
                    RequestStatus::Failed
                } else {
                    RequestStatus::Completed
                }
            }
            Command::Read(_)
            | Command::CreateDedicatedCache(_)
            | Command::DestroyDedicatedCache(_)
            | Command::Cancel(_)
            | Command::Reschedule(_) => RequestStatus::Failed,
        };

        if status == RequestStatus::Failed {
            log::debug!(
                "{} request {} reached the end of the stack without being handled.",
                request.command().name(),
                request.id()
            );
        }

        request.set_status(status);
        self.complete(request);
    }

    /// Claim a request during preparation by putting it on the prepared queue.
    pub fn push_prepared(&self, mut request: FileRequest) {
        if let Some(context) = &self.context {
            context.push_prepared_request(request);
        } else {
            log::error!(
                "'{}' has no streamer context to prepare {} request {} on.",
                self.name,
                request.command().name(),
                request.id()
            );
            request.set_status(RequestStatus::Failed);
            request.finalize();
        }
    }

    /// Hand a finished request to the context.
    pub fn complete(&self, request: FileRequest) {
        if let Some(context) = &self.context {
            context.mark_request_as_completed(request);
        } else {
            log::error!(
                "'{}' has no streamer context to complete {} request {} with.",
                self.name,
                request.command().name(),
                request.id()
            );
            request.finalize();
        }
    }

    pub fn execute_requests(&mut self) -> bool {
        match &self.next {
            Some(next) => lock(next).execute_requests(),
            None => false,
        }
    }

    pub fn update_status(&self, status: &mut Status) {
        if let Some(next) = &self.next {
            lock(next).update_status(status);
        }
    }

    pub fn update_completion_estimates(
        &mut self,
        now: Instant,
        internal_pending: &[&FileRequest],
        pending: &[&FileRequest],
    ) {
        if let Some(next) = &self.next {
            lock(next).update_completion_estimates(now, internal_pending, pending);
        }
    }

    pub fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        if let Some(next) = &self.next {
            lock(next).collect_statistics(statistics);
        }
    }
}

impl std::fmt::Debug for StackLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackLink")
            .field("name", &self.name)
            .field("next", &self.next.as_ref().map(|_| self.next_name()))
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

/// One stage of the streaming stack.
///
/// Every method has a default that defers to the entry's [`StackLink`], so an entry
/// only needs to implement the commands it cares about. All methods are called from
/// the scheduler thread.
pub trait StreamStackEntry: Send {
    fn link(&self) -> &StackLink;

    fn link_mut(&mut self) -> &mut StackLink;

    fn name(&self) -> &str {
        self.link().name()
    }

    /// Replace the successor of this entry. Entries that own other entries must pass
    /// the new successor on to them.
    fn set_next(&mut self, next: Option<StackEntryPtr>) {
        self.link_mut().set_next(next);
    }

    fn next(&self) -> Option<StackEntryPtr> {
        self.link().next().cloned()
    }

    /// Attach the shared context. Entries that own other entries must pass it on.
    fn set_context(&mut self, context: Arc<StreamerContext>) {
        self.link_mut().set_context(context);
    }

    /// Called once when a request is submitted. An entry that wants a request pushes
    /// it onto the context's prepared queue.
    fn prepare_request(&mut self, request: FileRequest) {
        self.link_mut().prepare_request(request);
    }

    /// Called when the scheduler hands a prepared request to the stack.
    fn queue_request(&mut self, request: FileRequest) {
        self.link_mut().queue_request(request);
    }

    /// Do pending work. Returns true if any work was done in this entry or any entry
    /// after it.
    fn execute_requests(&mut self) -> bool {
        self.link_mut().execute_requests()
    }

    fn update_status(&self, status: &mut Status) {
        self.link().update_status(status);
    }

    /// Estimate when requests will complete.
    ///
    /// `internal_pending` are requests that entries higher up the stack are holding
    /// back, `pending` are requests that haven't been queued yet. Both will reach
    /// the entries further down eventually.
    fn update_completion_estimates(
        &mut self,
        now: Instant,
        internal_pending: &[&FileRequest],
        pending: &[&FileRequest],
    ) {
        self.link_mut()
            .update_completion_estimates(now, internal_pending, pending);
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        self.link().collect_statistics(statistics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileRequest, ReportType};

    struct PassThrough {
        link: StackLink,
    }

    impl StreamStackEntry for PassThrough {
        fn link(&self) -> &StackLink {
            &self.link
        }

        fn link_mut(&mut self) -> &mut StackLink {
            &mut self.link
        }
    }

    fn chain(context: &Arc<StreamerContext>) -> PassThrough {
        let mut tail = PassThrough {
            link: StackLink::new("Tail"),
        };
        tail.set_context(Arc::clone(context));

        let mut head = PassThrough {
            link: StackLink::new("Head"),
        };
        head.set_next(Some(shared(tail)));
        head.set_context(Arc::clone(context));
        head
    }

    #[test]
    fn unhandled_requests_resolve_at_chain_end() {
        let context = Arc::new(StreamerContext::new());
        let mut head = chain(&context);

        let read = FileRequest::create_read(
            "foo.bin",
            crate::ReadOutput::Buffer(Vec::new()),
            0,
            10,
            None,
            Default::default(),
        );
        let flush = FileRequest::create_flush("foo.bin");
        let report = FileRequest::create_report(ReportType::Config);
        let custom_fail = FileRequest::create_custom(Box::new(1u32), true);
        let custom_ok = FileRequest::create_custom(Box::new(1u32), false);

        let handles = [
            (read.handle(), RequestStatus::Failed),
            (flush.handle(), RequestStatus::Completed),
            (report.handle(), RequestStatus::Completed),
            (custom_fail.handle(), RequestStatus::Failed),
            (custom_ok.handle(), RequestStatus::Completed),
        ];

        for request in [read, flush, report, custom_fail, custom_ok] {
            head.queue_request(request);
        }
        context.finalize_completed_requests();

        for (handle, expected) in handles.iter() {
            assert_eq!(handle.status(), *expected);
        }
    }

    #[test]
    fn prepare_without_successor_fails() {
        let context = Arc::new(StreamerContext::new());
        let mut head = chain(&context);

        let request = FileRequest::create_dedicated_cache_creation("foo.bin", None);
        let handle = request.handle();
        head.prepare_request(request);
        assert_eq!(context.num_prepared_requests(), 0);

        context.finalize_completed_requests();
        assert_eq!(handle.status(), RequestStatus::Failed);
    }

    #[test]
    fn missing_context_completes_in_place() {
        let mut entry = PassThrough {
            link: StackLink::new("Lonely"),
        };
        let request = FileRequest::create_flush_all();
        let handle = request.handle();
        entry.queue_request(request);
        assert_eq!(handle.status(), RequestStatus::Completed);
    }

    #[test]
    fn status_defaults_to_idle() {
        let context = Arc::new(StreamerContext::new());
        let head = chain(&context);
        let mut status = Status::default();
        head.update_status(&mut status);
        assert!(status.is_idle);
        assert_eq!(status.num_available_slots, i32::MAX);
        assert_eq!(head.link().next_name(), "Tail");
    }
}
