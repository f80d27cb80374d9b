use std::time::Instant;

use super::block_cache::aligned_block_size;
use super::{BlockCache, StackEntryPtr, StackLink, Status, StreamStackEntry};
use crate::{
    AverageWindow, Command, FileRange, FileRequest, ReportType, RequestPath, RequestStatus,
    Statistic, StreamerContext,
};
use std::sync::Arc;

const USAGE_WINDOW_SIZE: usize = 64;

/// Keeps a block cache per file, or per range in a file.
///
/// Caches are created and destroyed with requests and are reference counted, so
/// several users can ask for the same cache as long as every creation is matched by
/// a destruction. Reads that fall inside a cached file go to that file's cache, all
/// other reads continue down the stack.
pub struct DedicatedCache {
    link: StackLink,

    cached_file_names: Vec<RequestPath>,
    cached_file_ranges: Vec<FileRange>,
    cached_file_caches: Vec<Box<BlockCache>>,
    cached_file_ref_counts: Vec<usize>,

    usage_percentage: AverageWindow<USAGE_WINDOW_SIZE>,

    cache_size: u64,
    block_size: u64,
    alignment: u64,
    only_epilog_writes: bool,
}

impl DedicatedCache {
    /// Create a dedicated cache entry. `cache_size`, `block_size`, `alignment` and
    /// `only_epilog_writes` configure every block cache it creates.
    ///
    /// The block size is rounded up to the alignment, and a cache size smaller than one
    /// block is raised to one block, the same way every created block cache does it.
    pub fn new(cache_size: u64, block_size: u64, alignment: u64, only_epilog_writes: bool) -> Self {
        let alignment = alignment.max(1);
        let block_size = aligned_block_size(block_size, alignment);
        let cache_size = if cache_size < block_size {
            log::warn!(
                "Dedicated cache size {} is smaller than the block size {}, using one block.",
                cache_size,
                block_size
            );
            block_size
        } else {
            cache_size
        };

        Self {
            link: StackLink::new("Dedicated cache"),
            cached_file_names: Vec::new(),
            cached_file_ranges: Vec::new(),
            cached_file_caches: Vec::new(),
            cached_file_ref_counts: Vec::new(),
            usage_percentage: AverageWindow::new(),
            cache_size,
            block_size,
            alignment,
            only_epilog_writes,
        }
    }

    pub fn cache_size(&self) -> u64 {
        self.cache_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn num_caches(&self) -> usize {
        self.cached_file_names.len()
    }

    /// The number of users of the cache at `index`.
    pub fn ref_count(&self, index: usize) -> Option<usize> {
        self.cached_file_ref_counts.get(index).copied()
    }

    pub fn cache(&self, index: usize) -> Option<&BlockCache> {
        self.cached_file_caches.get(index).map(|c| c.as_ref())
    }

    /// The most recent read sample: `1.0` if the last read was served by a dedicated
    /// cache and `0.0` if it was passed on.
    pub fn last_usage_sample(&self) -> Option<f64> {
        self.usage_percentage.most_recent_sample()
    }

    /// Find the cache for `path` whose range contains `offset`.
    pub fn find_cache(&self, path: &RequestPath, offset: u64) -> Option<usize> {
        (0..self.cached_file_names.len()).find(|&i| {
            self.cached_file_names[i] == *path && self.cached_file_ranges[i].is_in_range(offset)
        })
    }

    /// Find the cache for `path` that was created for exactly `range`.
    pub fn find_cache_for_range(&self, path: &RequestPath, range: &FileRange) -> Option<usize> {
        (0..self.cached_file_names.len())
            .find(|&i| self.cached_file_names[i] == *path && self.cached_file_ranges[i] == *range)
    }

    fn create_dedicated_cache(&mut self, path: RequestPath, range: FileRange) {
        if let Some(index) = self.find_cache_for_range(&path, &range) {
            self.cached_file_ref_counts[index] += 1;
            log::debug!(
                "Dedicated cache for '{}' ({}) now has {} users.",
                path,
                range,
                self.cached_file_ref_counts[index]
            );
            return;
        }

        let mut cache = Box::new(BlockCache::with_name(
            format!("Dedicated cache '{}'", path),
            self.cache_size,
            self.block_size,
            self.alignment,
            self.only_epilog_writes,
        ));
        cache.set_next(self.link.next().cloned());
        if let Some(context) = self.link.context() {
            cache.set_context(Arc::clone(context));
        }

        log::debug!("Created dedicated cache for '{}' ({}).", path, range);

        self.cached_file_names.push(path);
        self.cached_file_ranges.push(range);
        self.cached_file_caches.push(cache);
        self.cached_file_ref_counts.push(1);
    }

    /// Returns false if there is no cache for `path` and `range`.
    fn destroy_dedicated_cache(&mut self, path: &RequestPath, range: &FileRange) -> bool {
        let index = match self.find_cache_for_range(path, range) {
            Some(index) => index,
            None => {
                log::warn!(
                    "No dedicated cache for '{}' ({}) to destroy.",
                    path,
                    range
                );
                return false;
            }
        };

        self.cached_file_ref_counts[index] -= 1;
        if self.cached_file_ref_counts[index] == 0 {
            log::debug!("Destroyed dedicated cache for '{}' ({}).", path, range);

            self.cached_file_names.remove(index);
            self.cached_file_ranges.remove(index);
            self.cached_file_caches.remove(index);
            self.cached_file_ref_counts.remove(index);
        }
        true
    }

    fn flush_cache(&mut self, path: &RequestPath) {
        for i in 0..self.cached_file_names.len() {
            if self.cached_file_names[i] == *path {
                self.cached_file_caches[i].flush_cache(path);
            }
        }
    }

    fn flush_entire_cache(&mut self) {
        for cache in self.cached_file_caches.iter_mut() {
            cache.flush_entire_cache();
        }
    }

    fn report_config(&self, statistics: &mut Vec<Statistic>) {
        let owner = self.link.name();
        statistics.push(Statistic::create_byte_size(
            owner,
            "Cache size",
            self.cache_size,
            "The amount of memory each dedicated cache uses.",
        ));
        statistics.push(Statistic::create_byte_size(
            owner,
            "Block size",
            self.block_size,
            "The size of the blocks in each dedicated cache.",
        ));
        statistics.push(Statistic::create_byte_size(
            owner,
            "Alignment",
            self.alignment,
            "The alignment of the blocks in each dedicated cache.",
        ));
        statistics.push(Statistic::create_boolean(
            owner,
            "Only epilog writes",
            self.only_epilog_writes,
            "If dedicated caches only store the last block of a read.",
        ));
        statistics.push(Statistic::create_integer(
            owner,
            "Num dedicated caches",
            self.cached_file_names.len() as i64,
            "The number of dedicated caches that are active.",
        ));
        statistics.push(Statistic::create_persistent_string(
            owner,
            "Next node",
            self.link.next_name(),
            "The stack entry after this one.",
        ));
    }
}

impl StreamStackEntry for DedicatedCache {
    fn link(&self) -> &StackLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut StackLink {
        &mut self.link
    }

    fn set_next(&mut self, next: Option<StackEntryPtr>) {
        for cache in self.cached_file_caches.iter_mut() {
            cache.set_next(next.clone());
        }
        self.link.set_next(next);
    }

    fn set_context(&mut self, context: Arc<StreamerContext>) {
        for cache in self.cached_file_caches.iter_mut() {
            cache.set_context(Arc::clone(&context));
        }
        self.link.set_context(context);
    }

    fn prepare_request(&mut self, mut request: FileRequest) {
        match request.command_mut() {
            Command::CreateDedicatedCache(data) => {
                data.range.get_or_insert(FileRange::EntireFile);
                self.link.push_prepared(request);
            }
            Command::DestroyDedicatedCache(data) => {
                data.range.get_or_insert(FileRange::EntireFile);
                self.link.push_prepared(request);
            }
            _ => self.link.prepare_request(request),
        }
    }

    fn queue_request(&mut self, mut request: FileRequest) {
        profiling::scope!("DedicatedCache::queue_request");

        match request.command_mut() {
            Command::Read(read) => match self.find_cache(&read.path, read.offset) {
                Some(index) => {
                    self.usage_percentage.push_entry(1.0);
                    self.cached_file_caches[index].queue_request(request);
                }
                None => {
                    self.usage_percentage.push_entry(0.0);
                    self.link.queue_request(request);
                }
            },
            Command::CreateDedicatedCache(data) => {
                let (path, range) = (data.path.clone(), data.range.unwrap_or_default());
                self.create_dedicated_cache(path, range);
                request.set_status(RequestStatus::Completed);
                self.link.complete(request);
            }
            Command::DestroyDedicatedCache(data) => {
                let (path, range) = (data.path.clone(), data.range.unwrap_or_default());
                let status = if self.destroy_dedicated_cache(&path, &range) {
                    RequestStatus::Completed
                } else {
                    RequestStatus::Failed
                };
                request.set_status(status);
                self.link.complete(request);
            }
            Command::Flush(data) => {
                let path = data.path.clone();
                self.flush_cache(&path);
                self.link.queue_request(request);
            }
            Command::FlushAll(_) => {
                self.flush_entire_cache();
                self.link.queue_request(request);
            }
            Command::Report(data) => {
                if data.report_type == ReportType::Config {
                    self.report_config(&mut data.output);
                }
                self.link.queue_request(request);
            }
            Command::Cancel(data) => {
                let target = data.target.clone();
                let canceled = self
                    .cached_file_caches
                    .iter_mut()
                    .any(|cache| cache.try_cancel(&target));
                if canceled {
                    request.set_status(RequestStatus::Completed);
                    self.link.complete(request);
                } else {
                    self.link.queue_request(request);
                }
            }
            Command::Reschedule(_) | Command::Custom(_) => self.link.queue_request(request),
        }
    }

    fn execute_requests(&mut self) -> bool {
        let mut did_work = false;
        for cache in self.cached_file_caches.iter_mut() {
            did_work |= cache.execute_requests();
        }
        did_work |= self.link.execute_requests();
        did_work
    }

    fn update_status(&self, status: &mut Status) {
        // Each dedicated cache is small, so their slots aren't counted. Only whether
        // they are idle matters.
        for cache in self.cached_file_caches.iter() {
            status.is_idle &= cache.is_idle();
        }
        self.link.update_status(status);
    }

    fn update_completion_estimates(
        &mut self,
        now: Instant,
        internal_pending: &[&FileRequest],
        pending: &[&FileRequest],
    ) {
        let mut internal: Vec<&FileRequest> = internal_pending.to_vec();
        for cache in self.cached_file_caches.iter() {
            cache.add_delayed_requests(&mut internal);
        }
        self.link.update_completion_estimates(now, &internal, pending);
        drop(internal);

        for cache in self.cached_file_caches.iter_mut() {
            cache.update_pending_request_estimations();
        }
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        if !self.cached_file_names.is_empty() {
            let owner = self.link.name();
            statistics.push(Statistic::create_percentage(
                owner,
                "Reads from dedicated cache",
                self.usage_percentage.average(),
                "The percentage of recent reads that were served by a dedicated cache.",
            ));
            statistics.push(Statistic::create_integer(
                owner,
                "Num dedicated caches",
                self.cached_file_names.len() as i64,
                "The number of dedicated caches that are active.",
            ));
        }

        self.link.collect_statistics(statistics);
    }
}

impl std::fmt::Debug for DedicatedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedicatedCache")
            .field("cached_file_names", &self.cached_file_names)
            .field("cached_file_ranges", &self.cached_file_ranges)
            .field("cached_file_ref_counts", &self.cached_file_ref_counts)
            .field("cache_size", &self.cache_size)
            .field("block_size", &self.block_size)
            .field("alignment", &self.alignment)
            .field("only_epilog_writes", &self.only_epilog_writes)
            .finish()
    }
}
