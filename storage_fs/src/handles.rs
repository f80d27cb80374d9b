use std::fs::File;
use std::time::{Duration, Instant};

use sluice_core::RequestPath;

use crate::error::StorageError;

struct CachedHandle {
    path: RequestPath,
    file: File,
    last_used: u64,
}

/// Keeps up to `max_handles` files open. When full, the least recently used file is
/// closed to make room.
pub(crate) struct FileHandleCache {
    handles: Vec<CachedHandle>,
    max_handles: usize,
    clock: u64,
}

impl FileHandleCache {
    pub(crate) fn new(max_handles: usize) -> Self {
        let max_handles = max_handles.max(1);
        Self {
            handles: Vec::with_capacity(max_handles),
            max_handles,
            clock: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn is_open(&self, path: &RequestPath) -> bool {
        self.handles.iter().any(|h| &h.path == path)
    }

    pub(crate) fn paths(&self) -> impl Iterator<Item = &RequestPath> {
        self.handles.iter().map(|h| &h.path)
    }

    /// Returns the open file for `path`, opening it if needed. The second value is the
    /// time spent opening and closing files, if any had to be.
    pub(crate) fn get_or_open(
        &mut self,
        path: &RequestPath,
    ) -> Result<(&mut File, Option<Duration>), StorageError> {
        self.clock += 1;
        let clock = self.clock;

        if let Some(index) = self.handles.iter().position(|h| &h.path == path) {
            let handle = &mut self.handles[index];
            handle.last_used = clock;
            return Ok((&mut handle.file, None));
        }

        let start = Instant::now();

        if self.handles.len() >= self.max_handles {
            if let Some(index) = self
                .handles
                .iter()
                .enumerate()
                .min_by_key(|(_, h)| h.last_used)
                .map(|(index, _)| index)
            {
                let evicted = self.handles.swap_remove(index);
                log::trace!("Closing file {} to make room.", evicted.path);
            }
        }

        let file = File::open(path.to_path_buf()).map_err(|error| StorageError::Open {
            path: path.to_path_buf(),
            error,
        })?;

        let index = self.handles.len();
        self.handles.push(CachedHandle {
            path: path.clone(),
            file,
            last_used: clock,
        });

        Ok((&mut self.handles[index].file, Some(start.elapsed())))
    }

    /// Close the file for `path`. Returns true if it was open.
    pub(crate) fn close(&mut self, path: &RequestPath) -> bool {
        let before = self.handles.len();
        self.handles.retain(|h| &h.path != path);
        self.handles.len() != before
    }

    pub(crate) fn close_all(&mut self) {
        self.handles.clear();
    }
}
