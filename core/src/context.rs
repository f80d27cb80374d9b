use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::request::lock;
use crate::{AverageWindow, FileRequest, Statistic};

const STATISTICS_WINDOW_SIZE: usize = 128;

#[derive(Default)]
struct ContextStatistics {
    missed_deadlines: AverageWindow<STATISTICS_WINDOW_SIZE>,
    completion_time: AverageWindow<STATISTICS_WINDOW_SIZE>,
    completed_requests: u64,
}

/// State shared by every entry in the streaming stack.
///
/// The context holds the requests that are prepared but not queued yet, and the
/// requests that completed but haven't been finalized yet. Stack entries use it to
/// hand requests back to the scheduler.
#[derive(Default)]
pub struct StreamerContext {
    prepared: Mutex<VecDeque<FileRequest>>,
    completed: Mutex<Vec<FileRequest>>,
    statistics: Mutex<ContextStatistics>,
}

impl StreamerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request that's ready to be queued on the stack.
    pub fn push_prepared_request(&self, request: FileRequest) {
        lock(&self.prepared).push_back(request);
    }

    /// Remove and return the prepared request that `order` ranks first. Requests that
    /// compare equal are returned in the order they were prepared.
    pub fn pop_prepared_request_by<F>(&self, mut order: F) -> Option<FileRequest>
    where
        F: FnMut(&FileRequest, &FileRequest) -> Ordering,
    {
        let mut prepared = lock(&self.prepared);
        let index = prepared
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| order(a, b))
            .map(|(index, _)| index)?;
        prepared.remove(index)
    }

    pub fn num_prepared_requests(&self) -> usize {
        lock(&self.prepared).len()
    }

    /// Temporarily take every prepared request out of the context.
    ///
    /// Used by the scheduler to look at prepared requests without holding the lock.
    /// Hand them back with [`StreamerContext::restore_prepared_requests`].
    pub fn take_prepared_requests(&self) -> VecDeque<FileRequest> {
        std::mem::take(&mut *lock(&self.prepared))
    }

    pub fn restore_prepared_requests(&self, mut requests: VecDeque<FileRequest>) {
        let mut prepared = lock(&self.prepared);
        // Anything prepared in the meantime goes after the restored requests.
        requests.append(&mut prepared);
        *prepared = requests;
    }

    /// Hand a request that is done back to the scheduler. The request's status is
    /// published to the caller when the completed requests are finalized.
    pub fn mark_request_as_completed(&self, request: FileRequest) {
        lock(&self.completed).push(request);
    }

    /// Finalize every completed request.
    ///
    /// Internal requests are handed back to the stack entry that issued them, all
    /// other requests publish their results and fire their callbacks. Finalizing can
    /// complete more requests, so this keeps going until nothing is left. Returns true
    /// if any request was finalized.
    pub fn finalize_completed_requests(&self) -> bool {
        profiling::scope!("finalize_completed_requests");

        let mut did_work = false;
        loop {
            let completed = std::mem::take(&mut *lock(&self.completed));
            if completed.is_empty() {
                break;
            }
            did_work = true;

            let now = Instant::now();
            for mut request in completed {
                if let Some(hook) = request.take_completion_hook() {
                    hook(request);
                    continue;
                }

                self.record_completion(&request, now);
                request.finalize();
            }
        }
        did_work
    }

    fn record_completion(&self, request: &FileRequest, now: Instant) {
        let mut statistics = lock(&self.statistics);
        if let Some(deadline) = request.deadline() {
            statistics
                .missed_deadlines
                .push_entry(if now > deadline { 1.0 } else { 0.0 });
        }
        statistics
            .completion_time
            .push_entry(now.saturating_duration_since(request.submitted()).as_secs_f64());
        statistics.completed_requests += 1;
    }

    pub fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        const OWNER: &str = "Streamer context";

        let stats = lock(&self.statistics);
        if !stats.missed_deadlines.is_empty() {
            statistics.push(Statistic::create_percentage(
                OWNER,
                "Missed deadlines",
                stats.missed_deadlines.average(),
                "The percentage of recent requests with a deadline that completed after it.",
            ));
        }
        if !stats.completion_time.is_empty() {
            statistics.push(Statistic::create_time_range(
                OWNER,
                "Completion time",
                Duration::from_secs_f64(stats.completion_time.average()),
                Duration::from_secs_f64(stats.completion_time.minimum()),
                Duration::from_secs_f64(stats.completion_time.maximum()),
                "The time between creating a request and it completing.",
            ));
        }
        statistics.push(Statistic::create_integer(
            OWNER,
            "Completed requests",
            stats.completed_requests as i64,
            "The total number of requests that have been finalized.",
        ));
    }
}

impl std::fmt::Debug for StreamerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamerContext")
            .field("prepared", &self.num_prepared_requests())
            .field("completed", &lock(&self.completed).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Priority, RequestStatus};
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::sync::Arc;

    #[test]
    fn pop_prepared_keeps_fifo_for_ties() {
        let context = StreamerContext::new();
        let a = FileRequest::create_flush("a");
        let b = FileRequest::create_flush("b");
        let (a_id, b_id) = (a.id(), b.id());
        context.push_prepared_request(a);
        context.push_prepared_request(b);

        let first = context
            .pop_prepared_request_by(|_, _| Ordering::Equal)
            .unwrap();
        assert_eq!(first.id(), a_id);
        let second = context
            .pop_prepared_request_by(|_, _| Ordering::Equal)
            .unwrap();
        assert_eq!(second.id(), b_id);
        assert!(context.pop_prepared_request_by(|_, _| Ordering::Equal).is_none());
    }

    #[test]
    fn pop_prepared_by_priority() {
        let context = StreamerContext::new();
        let mut low = FileRequest::create_flush("a");
        low.set_priority(Priority::LOW);
        let mut high = FileRequest::create_flush("b");
        high.set_priority(Priority::HIGH);
        let high_id = high.id();
        context.push_prepared_request(low);
        context.push_prepared_request(high);

        let first = context
            .pop_prepared_request_by(|a, b| b.priority().cmp(&a.priority()))
            .unwrap();
        assert_eq!(first.id(), high_id);
        assert_eq!(context.num_prepared_requests(), 1);
    }

    #[test]
    fn restore_keeps_newer_requests_last() {
        let context = StreamerContext::new();
        let old = FileRequest::create_flush("old");
        let old_id = old.id();
        context.push_prepared_request(old);

        let taken = context.take_prepared_requests();
        context.push_prepared_request(FileRequest::create_flush("new"));
        context.restore_prepared_requests(taken);

        let all = context.take_prepared_requests();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id(), old_id);
    }

    #[test]
    fn finalize_runs_callbacks_and_counts() {
        let context = StreamerContext::new();
        let mut request = FileRequest::create_flush_all();
        let handle = request.handle();

        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        handle.state.set_callback(Box::new(move |handle| {
            assert_eq!(handle.status(), RequestStatus::Completed);
            f.store(true, AtomicOrdering::SeqCst);
        }));

        request.set_status(RequestStatus::Completed);
        context.mark_request_as_completed(request);
        assert!(context.finalize_completed_requests());
        assert!(!context.finalize_completed_requests());
        assert!(fired.load(AtomicOrdering::SeqCst));

        let mut statistics = Vec::new();
        context.collect_statistics(&mut statistics);
        assert!(statistics.iter().any(|s| s.name == "Completed requests"
            && s.value == crate::StatisticValue::Integer(1)));
    }
}
