use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::request::lock;
use crate::stack::{StackLink, Status, StreamStackEntry};
use crate::{
    Command, DedicatedCache, DefaultRequestMemoryAllocator, FileRequest, Priority, ReadOutput,
    ReportType, RequestPath, RequestStatus, StackEntryPtr, Statistic, StatisticValue,
    Streamer, StreamerContext, StreamerOptions,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// The content of every mock file.
pub(crate) fn file_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

#[derive(Debug, Clone)]
pub(crate) struct Received {
    pub id: u64,
    pub command: &'static str,
    pub internal: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockLog(Arc<Mutex<Vec<Received>>>);

impl MockLog {
    fn push(&self, request: &FileRequest) {
        lock(&self.0).push(Received {
            id: request.id(),
            command: request.command().name(),
            internal: request.is_internal(),
        });
    }

    /// The number of reads that reached the storage.
    pub(crate) fn reads(&self) -> usize {
        lock(&self.0).iter().filter(|r| r.command == "Read").count()
    }

    pub(crate) fn received(&self, id: u64) -> bool {
        lock(&self.0).iter().any(|r| r.id == id)
    }

    /// The ids of the external reads in the order they were queued.
    pub(crate) fn external_reads(&self) -> Vec<u64> {
        lock(&self.0)
            .iter()
            .filter(|r| r.command == "Read" && !r.internal)
            .map(|r| r.id)
            .collect()
    }
}

/// A storage stage that serves reads from generated files, one read per execute.
pub(crate) struct MockStorage {
    link: StackLink,
    files: HashMap<RequestPath, u64>,
    queue: VecDeque<FileRequest>,
    log: MockLog,
}

impl MockStorage {
    const MAX_QUEUED: usize = 8;

    pub(crate) fn new() -> (Self, MockLog) {
        let log = MockLog::default();
        (
            Self {
                link: StackLink::new("Mock storage"),
                files: HashMap::new(),
                queue: VecDeque::new(),
                log: log.clone(),
            },
            log,
        )
    }

    pub(crate) fn with_file(mut self, path: &str, len: u64) -> Self {
        self.files.insert(RequestPath::new(path), len);
        self
    }

    fn serve(&self, request: &mut FileRequest) -> RequestStatus {
        let files = &self.files;
        match request.command_mut() {
            Command::Read(read) => match files.get(&read.path) {
                Some(&len) => {
                    let available = len.saturating_sub(read.offset).min(read.size);
                    for i in 0..available {
                        read.output[i as usize] = file_byte(read.offset + i);
                    }
                    read.bytes_read = available;
                    if available == read.size || read.allow_short {
                        RequestStatus::Completed
                    } else {
                        RequestStatus::Failed
                    }
                }
                None => RequestStatus::Failed,
            },
            _ => RequestStatus::Failed,
        }
    }
}

impl StreamStackEntry for MockStorage {
    fn link(&self) -> &StackLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut StackLink {
        &mut self.link
    }

    fn prepare_request(&mut self, request: FileRequest) {
        if request.command().is_read() {
            self.link.push_prepared(request);
        } else {
            self.link.prepare_request(request);
        }
    }

    fn queue_request(&mut self, mut request: FileRequest) {
        self.log.push(&request);

        if request.command().is_read() {
            self.queue.push_back(request);
            return;
        }

        let index = match request.command() {
            Command::Cancel(cancel) => self.queue.iter().position(|r| r.works_on(&cancel.target)),
            _ => None,
        };
        match index.and_then(|index| self.queue.remove(index)) {
            Some(mut target) => {
                target.set_status(RequestStatus::Canceled);
                self.link.complete(target);
                request.set_status(RequestStatus::Completed);
                self.link.complete(request);
            }
            None => self.link.queue_request(request),
        }
    }

    fn execute_requests(&mut self) -> bool {
        match self.queue.pop_front() {
            Some(mut request) => {
                let status = self.serve(&mut request);
                request.set_status(status);
                self.link.complete(request);
                true
            }
            None => false,
        }
    }

    fn update_status(&self, status: &mut Status) {
        status.num_available_slots = status
            .num_available_slots
            .min(Self::MAX_QUEUED as i32 - self.queue.len() as i32);
        status.is_idle &= self.queue.is_empty();
    }

    fn update_completion_estimates(
        &mut self,
        now: Instant,
        internal_pending: &[&FileRequest],
        pending: &[&FileRequest],
    ) {
        let mut estimate = now;
        let requests = self
            .queue
            .iter()
            .chain(internal_pending.iter().copied())
            .chain(pending.iter().copied());
        for request in requests {
            estimate += Duration::from_millis(1);
            request.set_estimated_completion(estimate);
        }
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        statistics.push(Statistic::create_integer(
            self.link.name(),
            "Queued reads",
            self.queue.len() as i64,
            "",
        ));
        self.link.collect_statistics(statistics);
    }
}

/// Run `entry` until neither it nor the context has anything left to do.
pub(crate) fn pump(entry: &mut dyn StreamStackEntry, context: &StreamerContext) {
    for _ in 0..10_000 {
        let executed = entry.execute_requests();
        let finalized = context.finalize_completed_requests();
        if !executed && !finalized {
            return;
        }
    }
    panic!("stack never became idle");
}

struct Setup {
    streamer: Streamer,
    cache: Arc<Mutex<DedicatedCache>>,
    log: MockLog,
}

fn setup() -> Setup {
    let (storage, log) = MockStorage::new();
    let storage = storage.with_file("foo.bin", 64 * 1024).with_file("bar.bin", 1024);

    let cache = Arc::new(Mutex::new(DedicatedCache::new(4096, 512, 16, false)));
    lock(&cache).set_next(Some(crate::shared(storage)));

    let root: StackEntryPtr = cache.clone();
    let streamer = Streamer::new(
        root,
        StreamerOptions {
            poll_interval: Duration::from_millis(1),
        },
    )
    .unwrap();

    Setup {
        streamer,
        cache,
        log,
    }
}

fn expected(offset: u64, size: u64) -> Vec<u8> {
    (offset..offset + size).map(file_byte).collect()
}

#[test]
fn dedicated_cache_lifecycle() {
    let s = setup();

    let read = |s: &Setup| {
        let handle = s.streamer.read(
            "foo.bin",
            ReadOutput::Buffer(Vec::new()),
            100,
            None,
            Priority::default(),
            0,
        );
        assert_eq!(
            s.streamer.block_until_completed(&handle, TIMEOUT),
            RequestStatus::Completed
        );
        assert_eq!(s.streamer.get_read_request_result(&handle).unwrap(), 100);
        assert_eq!(
            s.streamer.claim_read_buffer(&handle).unwrap(),
            expected(0, 100)
        );
        handle
    };

    // No dedicated cache yet: the read is passed on.
    let first = read(&s);
    assert_eq!(lock(&s.cache).last_usage_sample(), Some(0.0));
    assert!(s.log.received(first.id()));

    let create = s.streamer.create_dedicated_cache("foo.bin");
    assert_eq!(
        s.streamer.block_until_completed(&create, TIMEOUT),
        RequestStatus::Completed
    );
    assert_eq!(lock(&s.cache).num_caches(), 1);
    assert_eq!(lock(&s.cache).ref_count(0), Some(1));

    // Served by the dedicated cache.
    let second = read(&s);
    assert_eq!(lock(&s.cache).last_usage_sample(), Some(1.0));
    assert!(!s.log.received(second.id()));

    let destroy = s.streamer.destroy_dedicated_cache("foo.bin");
    assert_eq!(
        s.streamer.block_until_completed(&destroy, TIMEOUT),
        RequestStatus::Completed
    );
    assert_eq!(lock(&s.cache).num_caches(), 0);

    // Passed on again.
    let third = read(&s);
    assert_eq!(lock(&s.cache).last_usage_sample(), Some(0.0));
    assert!(s.log.received(third.id()));

    let destroy = s.streamer.destroy_dedicated_cache("foo.bin");
    assert_eq!(
        s.streamer.block_until_completed(&destroy, TIMEOUT),
        RequestStatus::Failed
    );
}

#[test]
fn callback_fires_once_on_completion() {
    let s = setup();

    let (tx, rx) = crossbeam_channel::unbounded();
    let handle = s.streamer.read(
        "bar.bin",
        ReadOutput::Buffer(Vec::new()),
        10,
        None,
        Priority::default(),
        0,
    );
    s.streamer.set_request_complete_callback(&handle, move |handle| {
        let _ = tx.send(handle.status());
    });

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), RequestStatus::Completed);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn failed_read_reports_failure() {
    let s = setup();

    let missing = s.streamer.read(
        "missing.bin",
        ReadOutput::Buffer(Vec::new()),
        10,
        None,
        Priority::default(),
        0,
    );
    assert_eq!(
        s.streamer.block_until_completed(&missing, TIMEOUT),
        RequestStatus::Failed
    );

    let past_end = s.streamer.read(
        "bar.bin",
        ReadOutput::Buffer(Vec::new()),
        100,
        None,
        Priority::default(),
        1000,
    );
    assert_eq!(
        s.streamer.block_until_completed(&past_end, TIMEOUT),
        RequestStatus::Failed
    );
}

#[test]
fn cancel_prepared_request() {
    let s = setup();
    s.streamer.suspend_processing().unwrap();

    let read = s.streamer.read(
        "foo.bin",
        ReadOutput::Buffer(Vec::new()),
        10,
        None,
        Priority::default(),
        0,
    );
    let cancel = s.streamer.cancel(&read);
    s.streamer.resume_processing().unwrap();

    assert_eq!(
        s.streamer.block_until_completed(&cancel, TIMEOUT),
        RequestStatus::Completed
    );
    assert_eq!(
        s.streamer.block_until_completed(&read, TIMEOUT),
        RequestStatus::Canceled
    );
    assert!(!s.log.received(read.id()));
}

#[test]
fn cancel_of_finished_request_fails() {
    let s = setup();

    let read = s.streamer.read(
        "bar.bin",
        ReadOutput::Buffer(Vec::new()),
        10,
        None,
        Priority::default(),
        0,
    );
    assert_eq!(
        s.streamer.block_until_completed(&read, TIMEOUT),
        RequestStatus::Completed
    );

    let cancel = s.streamer.cancel(&read);
    assert_eq!(
        s.streamer.block_until_completed(&cancel, TIMEOUT),
        RequestStatus::Failed
    );
    assert_eq!(read.status(), RequestStatus::Completed);
}

#[test]
fn requests_are_queued_by_priority() {
    let s = setup();
    s.streamer.suspend_processing().unwrap();

    let submit = |priority: Priority| {
        s.streamer.read(
            "foo.bin",
            ReadOutput::Buffer(Vec::new()),
            10,
            None,
            priority,
            0,
        )
    };
    let low = submit(Priority::LOW);
    let high = submit(Priority::HIGH);
    let medium = submit(Priority::MEDIUM);

    s.streamer.resume_processing().unwrap();
    for handle in [&low, &high, &medium] {
        assert_eq!(
            s.streamer.block_until_completed(handle, TIMEOUT),
            RequestStatus::Completed
        );
    }

    assert_eq!(
        s.log.external_reads(),
        vec![high.id(), medium.id(), low.id()]
    );
}

#[test]
fn reschedule_moves_request_forward() {
    let s = setup();
    s.streamer.suspend_processing().unwrap();

    let submit = || {
        s.streamer.read(
            "foo.bin",
            ReadOutput::Buffer(Vec::new()),
            10,
            None,
            Priority::LOW,
            0,
        )
    };
    let first = submit();
    let second = submit();
    let reschedule = s
        .streamer
        .reschedule_request(&second, None, Priority::HIGHEST);

    s.streamer.resume_processing().unwrap();
    assert_eq!(
        s.streamer.block_until_completed(&reschedule, TIMEOUT),
        RequestStatus::Completed
    );
    for handle in [&first, &second] {
        assert_eq!(
            s.streamer.block_until_completed(handle, TIMEOUT),
            RequestStatus::Completed
        );
    }

    assert_eq!(s.log.external_reads(), vec![second.id(), first.id()]);
}

#[test]
fn unclaimed_allocator_buffers_are_released() {
    let s = setup();
    let allocator = Arc::new(DefaultRequestMemoryAllocator::new());

    let handle = s.streamer.read(
        "bar.bin",
        ReadOutput::Allocator(allocator.clone()),
        10,
        None,
        Priority::default(),
        0,
    );
    assert_eq!(
        s.streamer.block_until_completed(&handle, TIMEOUT),
        RequestStatus::Completed
    );
    assert_eq!(
        s.streamer
            .with_read_buffer(&handle, |data| data.to_vec())
            .unwrap(),
        expected(0, 10)
    );

    drop(s);
    drop(handle);
    assert_eq!(allocator.num_outstanding_allocations(), 0);
}

#[test]
fn shutdown_cancels_pending_requests() {
    let s = setup();
    s.streamer.suspend_processing().unwrap();

    let handle = s.streamer.read(
        "foo.bin",
        ReadOutput::Buffer(Vec::new()),
        10,
        None,
        Priority::default(),
        0,
    );

    drop(s);
    assert_eq!(handle.status(), RequestStatus::Canceled);
}

#[test]
fn report_and_statistics() {
    let s = setup();

    let create = s.streamer.create_dedicated_cache("foo.bin");
    s.streamer.block_until_completed(&create, TIMEOUT);

    let report = s.streamer.report(ReportType::Config);
    assert_eq!(
        s.streamer.block_until_completed(&report, TIMEOUT),
        RequestStatus::Completed
    );
    let statistics = s.streamer.get_report_result(&report).unwrap();
    assert!(statistics
        .iter()
        .any(|stat| stat.owner == "Dedicated cache" && stat.name == "Cache size"));
    assert!(s.streamer.get_read_request_result(&report).is_err());

    let mut statistics = Vec::new();
    s.streamer.collect_statistics(&mut statistics);
    assert!(statistics
        .iter()
        .any(|stat| stat.name == "Num dedicated caches" && stat.value == StatisticValue::Integer(1)));
    assert!(statistics.iter().any(|stat| stat.name == "Completed requests"));
}

#[test]
fn custom_requests_at_end_of_stack() {
    let s = setup();

    let fails = s.streamer.custom(Box::new("ping"), true);
    let completes = s.streamer.custom(Box::new("ping"), false);
    assert_eq!(
        s.streamer.block_until_completed(&fails, TIMEOUT),
        RequestStatus::Failed
    );
    assert_eq!(
        s.streamer.block_until_completed(&completes, TIMEOUT),
        RequestStatus::Completed
    );
}
