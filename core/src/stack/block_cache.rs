use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};

use super::{StackLink, Status, StreamStackEntry};
use crate::{
    AverageWindow, Command, FileRequest, ReportType, RequestHandle, RequestPath, RequestStatus,
    Statistic,
};

const HIT_RATE_WINDOW_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Empty,
    /// A sub-read is filling the block.
    Fetching,
    Ready,
}

#[derive(Debug)]
struct CacheBlock {
    path: Option<RequestPath>,
    /// The file offset of the first byte in the block.
    offset: u64,
    /// The number of valid bytes. Less than the block size at the end of a file.
    len: u64,
    state: BlockState,
    /// Set when the block is flushed while it's being fetched.
    invalidated: bool,
    last_used: u64,
    data: Vec<u8>,
}

impl CacheBlock {
    fn empty() -> Self {
        Self {
            path: None,
            offset: 0,
            len: 0,
            state: BlockState::Empty,
            invalidated: false,
            last_used: 0,
            data: Vec::new(),
        }
    }

    fn holds(&self, path: &RequestPath, offset: u64) -> bool {
        self.offset == offset && self.path.as_ref() == Some(path)
    }

    fn clear(&mut self) {
        self.path = None;
        self.len = 0;
        self.state = BlockState::Empty;
        self.invalidated = false;
    }

    /// The valid bytes of `[start, end)` in file offsets.
    fn slice(&self, start: u64, end: u64) -> &[u8] {
        let rel_start = (start - self.offset).min(self.len) as usize;
        let rel_end = (end - self.offset).min(self.len) as usize;
        &self.data[rel_start..rel_end]
    }
}

/// A part of a read, in file offsets.
#[derive(Debug, Clone, Copy)]
struct Section {
    start: u64,
    end: u64,
    /// The offset of the cache block this section falls in, if it goes through the cache.
    block_offset: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
enum SubReadTarget {
    /// Fills a cache block. The parent wants `[start, end)` out of it.
    Block { index: usize, start: u64, end: u64 },
    /// Reads `[start, end)` straight into the parent.
    Direct { start: u64, end: u64 },
}

struct Arrival {
    parent: u64,
    target: SubReadTarget,
    request: FileRequest,
}

/// A read that is waiting for its sub-reads to come back.
struct WaitingRead {
    request: FileRequest,
    offset: u64,
    size: u64,
    outstanding: usize,
    bytes_covered: u64,
    failed: bool,
    canceled: bool,
    sub_reads: Vec<RequestHandle>,
}

/// A cache of fixed-size blocks.
///
/// Reads are split along block boundaries. The unaligned first block (the prolog) and
/// the unaligned last block (the epilog) go through the cache, the aligned blocks in
/// between are read directly by the next entry. Blocks are replaced least recently
/// used first.
///
/// A block cache can be used as an entry of its own or as the backing cache of a
/// [`DedicatedCache`](super::DedicatedCache).
pub struct BlockCache {
    link: StackLink,

    cache_size: u64,
    block_size: u64,
    alignment: u64,
    only_epilog_writes: bool,

    blocks: Vec<CacheBlock>,
    clock: u64,

    waiting: Vec<WaitingRead>,
    /// Reads that need a block that is still being fetched for another read.
    delayed: Vec<FileRequest>,

    arrivals_tx: Sender<Arrival>,
    arrivals_rx: Receiver<Arrival>,

    hit_rate: AverageWindow<HIT_RATE_WINDOW_SIZE>,
    cacheable: AverageWindow<HIT_RATE_WINDOW_SIZE>,
}

impl BlockCache {
    pub fn new(cache_size: u64, block_size: u64, alignment: u64, only_epilog_writes: bool) -> Self {
        Self::with_name(
            "Block cache",
            cache_size,
            block_size,
            alignment,
            only_epilog_writes,
        )
    }

    /// Create a block cache. The block size is rounded up to the alignment and the
    /// cache size is raised to one block if it's smaller than that.
    pub fn with_name(
        name: impl Into<String>,
        cache_size: u64,
        block_size: u64,
        alignment: u64,
        only_epilog_writes: bool,
    ) -> Self {
        let name = name.into();

        let alignment = alignment.max(1);
        let block_size = aligned_block_size(block_size, alignment);
        let cache_size = if cache_size < block_size {
            log::warn!(
                "'{}': cache size {} is smaller than the block size {}, using one block.",
                name,
                cache_size,
                block_size
            );
            block_size
        } else {
            cache_size
        };

        let num_blocks = (cache_size / block_size) as usize;
        let (arrivals_tx, arrivals_rx) = crossbeam_channel::unbounded();

        Self {
            link: StackLink::new(name),
            cache_size,
            block_size,
            alignment,
            only_epilog_writes,
            blocks: (0..num_blocks).map(|_| CacheBlock::empty()).collect(),
            clock: 0,
            waiting: Vec::new(),
            delayed: Vec::new(),
            arrivals_tx,
            arrivals_rx,
            hit_rate: AverageWindow::new(),
            cacheable: AverageWindow::new(),
        }
    }

    pub fn cache_size(&self) -> u64 {
        self.cache_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn only_epilog_writes(&self) -> bool {
        self.only_epilog_writes
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// The number of blocks that hold data.
    pub fn num_filled_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.state == BlockState::Ready)
            .count()
    }

    /// Returns true if no read is waiting on this cache.
    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.delayed.is_empty()
    }

    /// Forget everything cached for `path`.
    pub fn flush_cache(&mut self, path: &RequestPath) {
        for block in self.blocks.iter_mut() {
            if block.path.as_ref() != Some(path) {
                continue;
            }
            match block.state {
                BlockState::Ready => block.clear(),
                BlockState::Fetching => block.invalidated = true,
                BlockState::Empty => {}
            }
        }
    }

    pub fn flush_entire_cache(&mut self) {
        for block in self.blocks.iter_mut() {
            match block.state {
                BlockState::Ready => block.clear(),
                BlockState::Fetching => block.invalidated = true,
                BlockState::Empty => {}
            }
        }
    }

    /// Cancel `target` if it's waiting in this cache. Returns false if this cache
    /// doesn't hold the request.
    pub fn try_cancel(&mut self, target: &RequestHandle) -> bool {
        if let Some(index) = self.delayed.iter().position(|r| r.works_on(target)) {
            let mut request = self.delayed.remove(index);
            request.set_status(RequestStatus::Canceled);
            self.link.complete(request);
            return true;
        }

        if let Some(waiting) = self
            .waiting
            .iter_mut()
            .find(|w| w.request.works_on(target))
        {
            // Completes as canceled once its sub-reads are back.
            waiting.canceled = true;
            return true;
        }

        false
    }

    /// Add the reads that are held back in this cache.
    pub fn add_delayed_requests<'a>(&'a self, requests: &mut Vec<&'a FileRequest>) {
        requests.extend(self.delayed.iter());
    }

    /// Update the estimates of waiting reads from the estimates of their sub-reads.
    pub fn update_pending_request_estimations(&mut self) {
        for waiting in self.waiting.iter() {
            let latest = waiting
                .sub_reads
                .iter()
                .filter_map(|sub_read| sub_read.estimated_completion())
                .max();
            if let Some(latest) = latest {
                waiting.request.set_estimated_completion(latest);
            }
        }
    }

    fn split(&self, offset: u64, size: u64) -> Vec<Section> {
        let bs = self.block_size;
        let end = offset + size;
        let mut sections = Vec::with_capacity(3);
        let mut cursor = offset;

        let first_block = offset - offset % bs;
        if offset % bs != 0 || end < first_block + bs {
            let prolog_end = end.min(first_block + bs);
            sections.push(Section {
                start: offset,
                end: prolog_end,
                block_offset: Some(first_block),
            });
            cursor = prolog_end;
        }

        let last_block = end - end % bs;
        let main_end = if end % bs != 0 && last_block >= cursor && cursor < end {
            last_block
        } else {
            end
        };

        if main_end > cursor {
            sections.push(Section {
                start: cursor,
                end: main_end,
                block_offset: None,
            });
            cursor = main_end;
        }

        if cursor < end {
            sections.push(Section {
                start: cursor,
                end,
                block_offset: Some(last_block),
            });
        }

        sections
    }

    fn find_block(&self, path: &RequestPath, offset: u64) -> Option<usize> {
        self.blocks
            .iter()
            .position(|b| b.state == BlockState::Ready && b.holds(path, offset))
    }

    fn is_fetching(&self, path: &RequestPath, offset: u64) -> bool {
        self.blocks.iter().any(|b| {
            b.state == BlockState::Fetching && !b.invalidated && b.holds(path, offset)
        })
    }

    /// Claim the least recently used block that isn't being fetched.
    fn reserve_block(&mut self, path: &RequestPath, offset: u64) -> Option<usize> {
        let index = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.state != BlockState::Fetching)
            .min_by_key(|(_, b)| (b.state == BlockState::Ready, b.last_used))
            .map(|(index, _)| index)?;

        let block = &mut self.blocks[index];
        block.clear();
        block.path = Some(path.clone());
        block.offset = offset;
        block.state = BlockState::Fetching;
        Some(index)
    }

    fn queue_read(&mut self, request: FileRequest, path: RequestPath, offset: u64, size: u64) {
        profiling::scope!("BlockCache::queue_read");

        if size == 0 {
            let mut request = request;
            request.set_status(RequestStatus::Completed);
            self.link.complete(request);
            return;
        }

        // The blocks around the read must be addressable.
        let block_end = offset
            .checked_add(size)
            .and_then(|end| round_up(end, self.block_size));
        if block_end.is_none() {
            log::warn!(
                "'{}': read of {} bytes at offset {} in '{}' is out of range.",
                self.link.name(),
                size,
                offset,
                path
            );
            let mut request = request;
            request.set_status(RequestStatus::Failed);
            self.link.complete(request);
            return;
        }

        let sections = self.split(offset, size);
        let blocked = sections.iter().any(|s| match s.block_offset {
            Some(block_offset) => self.is_fetching(&path, block_offset),
            None => false,
        });
        if blocked {
            self.delayed.push(request);
            return;
        }

        let any_cacheable = sections.iter().any(|s| s.block_offset.is_some());
        self.cacheable
            .push_entry(if any_cacheable { 1.0 } else { 0.0 });

        let mut waiting = WaitingRead {
            request,
            offset,
            size,
            outstanding: 0,
            bytes_covered: 0,
            failed: false,
            canceled: false,
            sub_reads: Vec::new(),
        };

        for section in sections {
            if let Some(block_offset) = section.block_offset {
                if let Some(index) = self.find_block(&path, block_offset) {
                    self.hit_rate.push_entry(1.0);
                    self.clock += 1;
                    self.blocks[index].last_used = self.clock;

                    let src = self.blocks[index].slice(section.start, section.end);
                    waiting.bytes_covered += copy_into(&mut waiting.request, offset, section.start, src);
                    continue;
                }

                self.hit_rate.push_entry(0.0);

                // Only a section that ends inside a block continues into the next read.
                let store = !self.only_epilog_writes || section.end % self.block_size != 0;
                if store {
                    if let Some(index) = self.reserve_block(&path, block_offset) {
                        self.issue_sub_read(
                            &mut waiting,
                            path.clone(),
                            block_offset,
                            self.block_size,
                            true,
                            SubReadTarget::Block {
                                index,
                                start: section.start,
                                end: section.end,
                            },
                        );
                        continue;
                    }
                }
            }

            self.issue_sub_read(
                &mut waiting,
                path.clone(),
                section.start,
                section.end - section.start,
                false,
                SubReadTarget::Direct {
                    start: section.start,
                    end: section.end,
                },
            );
        }

        if waiting.outstanding == 0 {
            self.finish(waiting);
        } else {
            self.waiting.push(waiting);
        }
    }

    fn issue_sub_read(
        &mut self,
        waiting: &mut WaitingRead,
        path: RequestPath,
        offset: u64,
        size: u64,
        allow_short: bool,
        target: SubReadTarget,
    ) {
        let parent = waiting.request.id();
        let tx = self.arrivals_tx.clone();

        let mut sub_read = FileRequest::create_internal_read(
            path,
            offset,
            size,
            allow_short,
            waiting.request.deadline(),
            waiting.request.priority(),
            Box::new(move |request| {
                // The cache is gone if this fails. Dropping the request is all that's left.
                let _ = tx.send(Arrival {
                    parent,
                    target,
                    request,
                });
            }),
        );

        waiting.sub_reads.push(sub_read.handle());
        waiting.outstanding += 1;

        sub_read.set_status(RequestStatus::Queued);
        self.link.queue_request(sub_read);
    }

    fn process_arrivals(&mut self) -> bool {
        let mut did_work = false;
        let mut block_landed = false;

        while let Ok(arrival) = self.arrivals_rx.try_recv() {
            did_work = true;

            let Arrival {
                parent,
                target,
                mut request,
            } = arrival;

            let succeeded = request.status() == RequestStatus::Completed;
            let (data, bytes_read) = match request.command_mut() {
                Command::Read(read) => (std::mem::take(&mut read.output), read.bytes_read),
                _ => (Vec::new(), 0),
            };
            let data_len = (bytes_read as usize).min(data.len());

            let waiting_index = self.waiting.iter().position(|w| w.request.id() == parent);

            match target {
                SubReadTarget::Block { index, start, end } => {
                    block_landed = true;

                    let block = &mut self.blocks[index];
                    let keep = succeeded && !block.invalidated;
                    block.data = data;
                    block.len = data_len as u64;

                    if let Some(w) = waiting_index {
                        let waiting = &mut self.waiting[w];
                        let src = block.slice(start, end);
                        waiting.bytes_covered +=
                            copy_into(&mut waiting.request, waiting.offset, start, src);
                        waiting.failed |= !succeeded;
                    }

                    if keep {
                        self.clock += 1;
                        block.state = BlockState::Ready;
                        block.last_used = self.clock;
                    } else {
                        block.clear();
                    }
                }
                SubReadTarget::Direct { start, end } => {
                    if let Some(w) = waiting_index {
                        let waiting = &mut self.waiting[w];
                        let len = data_len.min((end - start) as usize);
                        waiting.bytes_covered +=
                            copy_into(&mut waiting.request, waiting.offset, start, &data[..len]);
                        waiting.failed |= !succeeded;
                    }
                }
            }

            if let Some(w) = waiting_index {
                let waiting = &mut self.waiting[w];
                waiting.outstanding -= 1;
                if waiting.outstanding == 0 {
                    let waiting = self.waiting.remove(w);
                    self.finish(waiting);
                }
            }
        }

        if block_landed && !self.delayed.is_empty() {
            for request in std::mem::take(&mut self.delayed) {
                self.requeue(request);
            }
        }

        did_work
    }

    fn requeue(&mut self, request: FileRequest) {
        let read = match request.command() {
            Command::Read(read) => Some((read.path.clone(), read.offset, read.size)),
            _ => None,
        };
        match read {
            Some((path, offset, size)) => self.queue_read(request, path, offset, size),
            None => self.link.queue_request(request),
        }
    }

    fn finish(&mut self, waiting: WaitingRead) {
        let WaitingRead {
            mut request,
            size,
            bytes_covered,
            failed,
            canceled,
            ..
        } = waiting;

        if let Command::Read(read) = request.command_mut() {
            read.bytes_read = bytes_covered;
        }

        let status = if canceled {
            RequestStatus::Canceled
        } else if failed || bytes_covered < size {
            RequestStatus::Failed
        } else {
            RequestStatus::Completed
        };
        request.set_status(status);
        self.link.complete(request);
    }

    fn report_config(&self, statistics: &mut Vec<Statistic>) {
        let owner = self.link.name();
        statistics.push(Statistic::create_byte_size(
            owner,
            "Cache size",
            self.cache_size,
            "The total amount of memory the cache uses for blocks.",
        ));
        statistics.push(Statistic::create_byte_size(
            owner,
            "Block size",
            self.block_size,
            "The size of a single cache block.",
        ));
        statistics.push(Statistic::create_byte_size(
            owner,
            "Alignment",
            self.alignment,
            "The alignment of cache blocks.",
        ));
        statistics.push(Statistic::create_boolean(
            owner,
            "Only epilog writes",
            self.only_epilog_writes,
            "If only the last block of a read is stored in the cache.",
        ));
        statistics.push(Statistic::create_persistent_string(
            owner,
            "Next node",
            self.link.next_name(),
            "The stack entry after this one.",
        ));
    }
}

/// Round `value` up to a multiple of `alignment`, or `None` if that doesn't fit in a `u64`.
fn round_up(value: u64, alignment: u64) -> Option<u64> {
    let rem = value % alignment;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(alignment - rem)
    }
}

/// The block size a cache actually uses: at least one byte and a multiple of `alignment`.
pub(super) fn aligned_block_size(block_size: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    round_up(block_size.max(1), alignment).unwrap_or(u64::MAX / alignment * alignment)
}

/// Copy `src`, which starts at `file_offset`, into the output of a read that starts at
/// `read_offset`. Returns the number of bytes copied.
fn copy_into(request: &mut FileRequest, read_offset: u64, file_offset: u64, src: &[u8]) -> u64 {
    if let Command::Read(read) = request.command_mut() {
        let dst_start = (file_offset - read_offset) as usize;
        let len = src.len().min(read.output.len().saturating_sub(dst_start));
        read.output[dst_start..dst_start + len].copy_from_slice(&src[..len]);
        len as u64
    } else {
        0
    }
}

impl StreamStackEntry for BlockCache {
    fn link(&self) -> &StackLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut StackLink {
        &mut self.link
    }

    fn queue_request(&mut self, mut request: FileRequest) {
        match request.command_mut() {
            Command::Read(read) => {
                let (path, offset, size) = (read.path.clone(), read.offset, read.size);
                self.queue_read(request, path, offset, size);
            }
            Command::Flush(flush) => {
                let path = flush.path.clone();
                self.flush_cache(&path);
                self.link.queue_request(request);
            }
            Command::FlushAll(_) => {
                self.flush_entire_cache();
                self.link.queue_request(request);
            }
            Command::Report(report) => {
                if report.report_type == ReportType::Config {
                    self.report_config(&mut report.output);
                }
                self.link.queue_request(request);
            }
            Command::Cancel(cancel) => {
                let target = cancel.target.clone();
                if self.try_cancel(&target) {
                    request.set_status(RequestStatus::Completed);
                    self.link.complete(request);
                } else {
                    self.link.queue_request(request);
                }
            }
            Command::CreateDedicatedCache(_)
            | Command::DestroyDedicatedCache(_)
            | Command::Reschedule(_)
            | Command::Custom(_) => self.link.queue_request(request),
        }
    }

    fn execute_requests(&mut self) -> bool {
        let mut did_work = self.process_arrivals();
        did_work |= self.link.execute_requests();
        did_work
    }

    fn update_status(&self, status: &mut Status) {
        status.is_idle &= self.is_idle();
        self.link.update_status(status);
    }

    fn update_completion_estimates(
        &mut self,
        now: Instant,
        internal_pending: &[&FileRequest],
        pending: &[&FileRequest],
    ) {
        let mut internal: Vec<&FileRequest> = internal_pending.to_vec();
        internal.extend(self.delayed.iter());
        self.link.update_completion_estimates(now, &internal, pending);
        drop(internal);

        self.update_pending_request_estimations();
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        let owner = self.link.name();
        statistics.push(Statistic::create_percentage(
            owner,
            "Cache hit rate",
            self.hit_rate.average(),
            "The percentage of cacheable sections that were found in the cache.",
        ));
        statistics.push(Statistic::create_percentage(
            owner,
            "Cacheable",
            self.cacheable.average(),
            "The percentage of reads that had at least one section that could be cached.",
        ));
        statistics.push(Statistic::create_integer(
            owner,
            "Available blocks",
            self.blocks
                .iter()
                .filter(|b| b.state != BlockState::Fetching)
                .count() as i64,
            "The number of blocks that aren't being filled.",
        ));

        self.link.collect_statistics(statistics);
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("name", &self.link.name())
            .field("cache_size", &self.cache_size)
            .field("block_size", &self.block_size)
            .field("alignment", &self.alignment)
            .field("only_epilog_writes", &self.only_epilog_writes)
            .field("waiting", &self.waiting.len())
            .field("delayed", &self.delayed.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::shared;
    use crate::tests::{file_byte, pump, MockStorage};
    use crate::{Priority, ReadOutput, StreamerContext};
    use std::sync::Arc;

    fn setup(cache: BlockCache) -> (BlockCache, Arc<StreamerContext>, crate::tests::MockLog) {
        let context = Arc::new(StreamerContext::new());
        let (storage, log) = MockStorage::new();
        let storage = storage.with_file("data.bin", 1000);

        let mut cache = cache;
        let mut storage = storage;
        storage.set_context(Arc::clone(&context));
        cache.set_next(Some(shared(storage)));
        cache.set_context(Arc::clone(&context));
        (cache, context, log)
    }

    fn read(offset: u64, size: u64) -> FileRequest {
        FileRequest::create_read(
            "data.bin",
            ReadOutput::Buffer(Vec::new()),
            offset,
            size,
            None,
            Priority::default(),
        )
    }

    fn expected(offset: u64, size: u64) -> Vec<u8> {
        (offset..offset + size).map(file_byte).collect()
    }

    #[test]
    fn splits_reads_on_block_boundaries() {
        let cache = BlockCache::new(256, 64, 16, false);

        let s = cache.split(10, 200);
        assert_eq!(s.len(), 3);
        assert_eq!((s[0].start, s[0].end, s[0].block_offset), (10, 64, Some(0)));
        assert_eq!((s[1].start, s[1].end, s[1].block_offset), (64, 192, None));
        assert_eq!((s[2].start, s[2].end, s[2].block_offset), (192, 210, Some(192)));

        // Aligned start and end: a single direct section.
        let s = cache.split(64, 128);
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].block_offset, None);

        // Entirely inside one block.
        let s = cache.split(70, 10);
        assert_eq!(s.len(), 1);
        assert_eq!((s[0].start, s[0].end, s[0].block_offset), (70, 80, Some(64)));
    }

    #[test]
    fn cache_size_is_clamped_to_one_block() {
        let cache = BlockCache::new(10, 64, 16, false);
        assert_eq!(cache.cache_size(), 64);
        assert_eq!(cache.num_blocks(), 1);

        // Block size is rounded up to the alignment.
        let cache = BlockCache::new(1024, 100, 64, false);
        assert_eq!(cache.block_size(), 128);
    }

    #[test]
    fn rounding_saturates_at_the_end_of_the_offset_space() {
        assert_eq!(round_up(100, 64), Some(128));
        assert_eq!(round_up(128, 64), Some(128));
        assert_eq!(round_up(u64::MAX - 10, 512), None);
        assert_eq!(aligned_block_size(0, 0), 1);
        assert_eq!(aligned_block_size(u64::MAX, 512) % 512, 0);
    }

    #[test]
    fn reads_past_the_offset_space_fail() {
        let (mut cache, context, log) = setup(BlockCache::new(256, 64, 1, false));

        let overflowing = read(u64::MAX - 10, 100);
        let handle = overflowing.handle();
        cache.queue_request(overflowing);
        pump(&mut cache, &context);
        assert_eq!(handle.status(), RequestStatus::Failed);

        // Fits in a u64, but its last block doesn't.
        let unaligned_tail = read(u64::MAX - 10, 5);
        let handle = unaligned_tail.handle();
        cache.queue_request(unaligned_tail);
        pump(&mut cache, &context);
        assert_eq!(handle.status(), RequestStatus::Failed);

        assert_eq!(log.reads(), 0);
        assert!(cache.is_idle());
    }

    #[test]
    fn second_read_is_served_from_cache() {
        let (mut cache, context, log) = setup(BlockCache::new(256, 64, 1, false));

        let first = read(10, 20);
        let first_handle = first.handle();
        cache.queue_request(first);
        pump(&mut cache, &context);

        assert_eq!(first_handle.status(), RequestStatus::Completed);
        assert_eq!(
            first_handle.state.claim_read_buffer().unwrap(),
            expected(10, 20)
        );
        assert_eq!(log.reads(), 1);

        let second = read(12, 8);
        let second_handle = second.handle();
        cache.queue_request(second);
        pump(&mut cache, &context);

        assert_eq!(second_handle.status(), RequestStatus::Completed);
        assert_eq!(
            second_handle.state.claim_read_buffer().unwrap(),
            expected(12, 8)
        );
        assert_eq!(log.reads(), 1);
        assert!(cache.is_idle());
    }

    #[test]
    fn large_reads_combine_cache_and_direct_sections() {
        let (mut cache, context, log) = setup(BlockCache::new(256, 64, 1, false));

        let request = read(10, 200);
        let handle = request.handle();
        cache.queue_request(request);
        pump(&mut cache, &context);

        assert_eq!(handle.status(), RequestStatus::Completed);
        assert_eq!(handle.state.claim_read_buffer().unwrap(), expected(10, 200));
        // Prolog block, main section, epilog block.
        assert_eq!(log.reads(), 3);
        assert_eq!(cache.num_filled_blocks(), 2);
    }

    #[test]
    fn only_epilog_writes_skips_prolog_blocks() {
        let (mut cache, context, _log) = setup(BlockCache::new(256, 64, 1, true));

        // Starts unaligned and ends on a block boundary: prolog only.
        let request = read(10, 54);
        let handle = request.handle();
        cache.queue_request(request);
        pump(&mut cache, &context);
        assert_eq!(handle.status(), RequestStatus::Completed);
        assert_eq!(cache.num_filled_blocks(), 0);

        // Ends unaligned: the last block is kept.
        let request = read(64, 80);
        let handle = request.handle();
        cache.queue_request(request);
        pump(&mut cache, &context);
        assert_eq!(handle.status(), RequestStatus::Completed);
        assert_eq!(cache.num_filled_blocks(), 1);
    }

    #[test]
    fn flush_invalidates_blocks() {
        let (mut cache, context, log) = setup(BlockCache::new(256, 64, 1, false));

        cache.queue_request(read(0, 10));
        pump(&mut cache, &context);
        assert_eq!(cache.num_filled_blocks(), 1);

        cache.queue_request(FileRequest::create_flush("data.bin"));
        pump(&mut cache, &context);
        assert_eq!(cache.num_filled_blocks(), 0);

        cache.queue_request(read(0, 10));
        pump(&mut cache, &context);
        assert_eq!(log.reads(), 2);
    }

    #[test]
    fn reads_waiting_on_the_same_block_are_delayed() {
        let (mut cache, context, log) = setup(BlockCache::new(256, 64, 1, false));

        let a = read(0, 10);
        let b = read(20, 10);
        let (ha, hb) = (a.handle(), b.handle());
        cache.queue_request(a);
        cache.queue_request(b);
        assert_eq!(cache.delayed.len(), 1);

        pump(&mut cache, &context);
        assert_eq!(ha.status(), RequestStatus::Completed);
        assert_eq!(hb.status(), RequestStatus::Completed);
        assert_eq!(hb.state.claim_read_buffer().unwrap(), expected(20, 10));
        assert_eq!(log.reads(), 1);
    }

    #[test]
    fn cancel_delayed_read() {
        let (mut cache, context, _log) = setup(BlockCache::new(256, 64, 1, false));

        let a = read(0, 10);
        let b = read(20, 10);
        let hb = b.handle();
        cache.queue_request(a);
        cache.queue_request(b);

        let cancel = FileRequest::create_cancel(hb.clone());
        let cancel_handle = cancel.handle();
        cache.queue_request(cancel);
        pump(&mut cache, &context);

        assert_eq!(hb.status(), RequestStatus::Canceled);
        assert_eq!(cancel_handle.status(), RequestStatus::Completed);
    }

    #[test]
    fn read_past_end_of_file_fails() {
        let (mut cache, context, _log) = setup(BlockCache::new(256, 64, 1, false));

        let request = read(990, 20);
        let handle = request.handle();
        cache.queue_request(request);
        pump(&mut cache, &context);

        assert_eq!(handle.status(), RequestStatus::Failed);
    }

    #[test]
    fn reports_config() {
        let (mut cache, context, _log) = setup(BlockCache::new(256, 64, 16, true));

        let report = FileRequest::create_report(ReportType::Config);
        let handle = report.handle();
        cache.queue_request(report);
        pump(&mut cache, &context);

        let statistics = handle.state.take_report().unwrap();
        assert!(statistics
            .iter()
            .any(|s| s.name == "Block size" && s.value == crate::StatisticValue::ByteSize(64)));
        assert!(statistics
            .iter()
            .any(|s| s.name == "Next node"
                && s.value == crate::StatisticValue::PersistentString("Mock storage".into())));
    }
}
