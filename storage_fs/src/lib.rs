#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(clippy::missing_panics_doc)]
#![warn(clippy::clone_on_ref_ptr)]
#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sluice_core::{
    AverageWindow, Command, FileRequest, ReadData, ReportType, RequestPath, RequestStatus,
    StackLink, Statistic, Status, StreamStackEntry,
};

pub mod error;
mod handles;


use error::StorageError;
use handles::FileHandleCache;

const STATISTICS_WINDOW_SIZE: usize = 64;

/// The read speed assumed for estimates before anything was read.
const DEFAULT_READ_SPEED: f64 = 100.0 * 1024.0 * 1024.0;

/// Options for a [`StorageDrive`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageDriveOptions {
    /// The directories this drive reads from. Reads for files outside of these are
    /// passed on to the next stack entry.
    ///
    /// If this is empty the drive reads every file.
    pub drive_paths: Vec<String>,

    /// The maximum number of files that are kept open.
    ///
    /// By default this is set to `32`.
    pub max_file_handles: usize,

    /// The number of reads the drive accepts before it reports itself as saturated.
    ///
    /// By default this is set to `8`.
    pub overcommit: usize,
}

impl Default for StorageDriveOptions {
    fn default() -> Self {
        Self {
            drive_paths: Vec::new(),
            max_file_handles: 32,
            overcommit: 8,
        }
    }
}

/// The stack entry at the bottom of a stack that reads from the filesystem.
///
/// Reads are done synchronously on the scheduler thread, one per call to
/// `execute_requests`.
pub struct StorageDrive {
    link: StackLink,

    drive_paths: Vec<RequestPath>,
    overcommit: usize,
    max_file_handles: usize,

    handles: FileHandleCache,
    pending: VecDeque<FileRequest>,

    read_speed: AverageWindow<STATISTICS_WINDOW_SIZE>,
    open_close_time: AverageWindow<STATISTICS_WINDOW_SIZE>,
    available_slots: AverageWindow<STATISTICS_WINDOW_SIZE>,
}

impl StorageDrive {
    pub fn new(options: StorageDriveOptions) -> Self {
        let overcommit = if options.overcommit == 0 {
            log::warn!("A storage drive needs room for at least one read, using 1.");
            1
        } else {
            options.overcommit
        };

        Self {
            link: StackLink::new("Storage drive"),
            drive_paths: options.drive_paths.iter().map(RequestPath::new).collect(),
            overcommit,
            max_file_handles: options.max_file_handles,
            handles: FileHandleCache::new(options.max_file_handles),
            pending: VecDeque::with_capacity(overcommit),
            read_speed: AverageWindow::new(),
            open_close_time: AverageWindow::new(),
            available_slots: AverageWindow::new(),
        }
    }

    /// Returns true if this drive reads `path`.
    pub fn services(&self, path: &RequestPath) -> bool {
        self.drive_paths.is_empty() || self.drive_paths.iter().any(|d| path.starts_with(d))
    }

    pub fn num_pending_reads(&self) -> usize {
        self.pending.len()
    }

    pub fn num_open_files(&self) -> usize {
        self.handles.len()
    }

    fn services_request(&self, request: &FileRequest) -> bool {
        match request.command() {
            Command::Read(read) => self.services(&read.path),
            _ => false,
        }
    }

    fn sample_available_slots(&mut self) {
        let slots = self.overcommit as f64 - self.pending.len() as f64;
        self.available_slots.push_entry(slots);
    }

    fn cancel_pending(&mut self, mut request: FileRequest) {
        let target = match request.command() {
            Command::Cancel(cancel) => cancel.target.clone(),
            _ => return self.link.queue_request(request),
        };

        let mut canceled = false;
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].works_on(&target) {
                if let Some(mut read) = self.pending.remove(i) {
                    read.set_status(RequestStatus::Canceled);
                    self.link.complete(read);
                    canceled = true;
                }
            } else {
                i += 1;
            }
        }

        if canceled {
            self.sample_available_slots();
            request.set_status(RequestStatus::Completed);
            self.link.complete(request);
        } else {
            self.link.queue_request(request);
        }
    }

    fn report(&self, report_type: ReportType, output: &mut Vec<Statistic>) {
        let name = self.link.name();
        match report_type {
            ReportType::Config => {
                let drive_paths = if self.drive_paths.is_empty() {
                    String::from("<All>")
                } else {
                    self.drive_paths
                        .iter()
                        .map(|p| p.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                output.push(Statistic::create_persistent_string(
                    name,
                    "Drive paths",
                    drive_paths,
                    "The directories this drive reads from.",
                ));
                output.push(Statistic::create_integer(
                    name,
                    "Max file handles",
                    self.max_file_handles as i64,
                    "The maximum number of files kept open.",
                ));
                output.push(Statistic::create_integer(
                    name,
                    "Overcommit",
                    self.overcommit as i64,
                    "The number of reads accepted before the drive is saturated.",
                ));
                output.push(Statistic::create_persistent_string(
                    name,
                    "Next node",
                    self.link.next_name(),
                    "The stack entry after this one.",
                ));
            }
            ReportType::FileLocks => {
                for path in self.handles.paths() {
                    output.push(Statistic::create_persistent_string(
                        name,
                        "File lock",
                        path.to_string(),
                        "A file this drive holds open.",
                    ));
                }
            }
        }
    }

    fn read(&mut self, request: &mut FileRequest) -> RequestStatus {
        profiling::scope!("storage_drive_read");

        let read = match request.command_mut() {
            Command::Read(read) => read,
            _ => return RequestStatus::Failed,
        };

        let start = Instant::now();
        match read_file(&mut self.handles, read) {
            Ok(open_close_time) => {
                let mut elapsed = start.elapsed();
                if let Some(open_close_time) = open_close_time {
                    self.open_close_time.push_entry(open_close_time.as_secs_f64());
                    elapsed = elapsed.saturating_sub(open_close_time);
                }
                if read.bytes_read > 0 && !elapsed.is_zero() {
                    self.read_speed
                        .push_entry(read.bytes_read as f64 / elapsed.as_secs_f64());
                }

                if read.bytes_read == read.size || read.allow_short {
                    RequestStatus::Completed
                } else {
                    log::warn!(
                        "Read of {} bytes at offset {} from {} returned only {} bytes.",
                        read.size,
                        read.offset,
                        read.path,
                        read.bytes_read
                    );
                    RequestStatus::Failed
                }
            }
            Err(e) => {
                log::warn!("Failed to read from {}: {}", read.path, e);
                RequestStatus::Failed
            }
        }
    }

    fn estimated_read_speed(&self) -> f64 {
        if self.read_speed.is_empty() {
            DEFAULT_READ_SPEED
        } else {
            self.read_speed.average()
        }
    }

    fn estimated_open_time(&self) -> Duration {
        if self.open_close_time.is_empty() {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(self.open_close_time.average())
        }
    }
}

/// Read into the request's buffer until it's full or the file ends. Returns the time
/// spent opening files, if one had to be opened.
fn read_file(
    handles: &mut FileHandleCache,
    read: &mut ReadData,
) -> Result<Option<Duration>, StorageError> {
    read.bytes_read = 0;

    let (file, open_close_time) = handles.get_or_open(&read.path)?;
    file.seek(SeekFrom::Start(read.offset))
        .map_err(StorageError::Seek)?;

    let size = (read.size as usize).min(read.output.len());
    let buffer = &mut read.output[..size];

    let mut total = 0;
    while total < size {
        match file.read(&mut buffer[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(StorageError::Read(e)),
        }
    }

    read.bytes_read = total as u64;
    Ok(open_close_time)
}

impl StreamStackEntry for StorageDrive {
    fn link(&self) -> &StackLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut StackLink {
        &mut self.link
    }

    fn prepare_request(&mut self, request: FileRequest) {
        if self.services_request(&request) {
            self.link.push_prepared(request);
        } else {
            self.link.prepare_request(request);
        }
    }

    fn queue_request(&mut self, mut request: FileRequest) {
        match request.command_mut() {
            Command::Read(read) => {
                if self.services(&read.path) {
                    self.pending.push_back(request);
                    self.sample_available_slots();
                } else {
                    self.link.queue_request(request);
                }
            }
            Command::Cancel(_) => self.cancel_pending(request),
            Command::Flush(flush) => {
                if self.handles.close(&flush.path) {
                    log::debug!("Closed file {} on flush.", flush.path);
                }
                self.link.queue_request(request);
            }
            Command::FlushAll(_) => {
                self.handles.close_all();
                self.link.queue_request(request);
            }
            Command::Report(report) => {
                self.report(report.report_type, &mut report.output);
                self.link.queue_request(request);
            }
            Command::CreateDedicatedCache(_)
            | Command::DestroyDedicatedCache(_)
            | Command::Reschedule(_)
            | Command::Custom(_) => self.link.queue_request(request),
        }
    }

    fn execute_requests(&mut self) -> bool {
        let executed = match self.pending.pop_front() {
            Some(mut request) => {
                let status = self.read(&mut request);
                request.set_status(status);
                self.link.complete(request);
                self.sample_available_slots();
                true
            }
            None => false,
        };

        self.link.execute_requests() || executed
    }

    fn update_status(&self, status: &mut Status) {
        let available = self.overcommit as i32 - self.pending.len() as i32;
        status.num_available_slots = status.num_available_slots.min(available);
        status.is_idle &= self.pending.is_empty();
        self.link.update_status(status);
    }

    fn update_completion_estimates(
        &mut self,
        now: Instant,
        internal_pending: &[&FileRequest],
        pending: &[&FileRequest],
    ) {
        let speed = self.estimated_read_speed();
        let open_time = self.estimated_open_time();

        let mut estimate = now;
        let requests = self
            .pending
            .iter()
            .chain(internal_pending.iter().copied())
            .chain(pending.iter().copied());
        for request in requests {
            if let Command::Read(read) = request.command() {
                if !self.services(&read.path) {
                    continue;
                }
                if !self.handles.is_open(&read.path) {
                    estimate += open_time;
                }
                estimate += Duration::from_secs_f64(read.size as f64 / speed);
                request.set_estimated_completion(estimate);
            }
        }

        self.link
            .update_completion_estimates(now, internal_pending, pending);
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        let name = self.link.name();

        if !self.read_speed.is_empty() {
            statistics.push(Statistic::create_bytes_per_second(
                name,
                "Read speed",
                self.read_speed.average(),
                "The average speed of reads.",
            ));
        }
        if !self.open_close_time.is_empty() {
            statistics.push(Statistic::create_time_range(
                name,
                "File open & close",
                Duration::from_secs_f64(self.open_close_time.average()),
                Duration::from_secs_f64(self.open_close_time.minimum()),
                Duration::from_secs_f64(self.open_close_time.maximum()),
                "The time spent opening and closing files.",
            ));
        }
        if !self.available_slots.is_empty() {
            statistics.push(Statistic::create_float_range(
                name,
                "Available slots",
                self.available_slots.average(),
                self.available_slots.minimum(),
                self.available_slots.maximum(),
                "The number of reads the drive could still accept.",
            ));
        }

        self.link.collect_statistics(statistics);
    }
}

impl std::fmt::Debug for StorageDrive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageDrive")
            .field("link", &self.link)
            .field("drive_paths", &self.drive_paths)
            .field("pending", &self.pending.len())
            .field("open_files", &self.handles.len())
            .finish()
    }
}
