use serde::{Deserialize, Serialize};

/// A byte range within a file, or the entire file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRange {
    /// The whole file, regardless of its size.
    #[default]
    EntireFile,
    /// The half-open byte interval `[offset, end)`.
    Span { offset: u64, end: u64 },
}

impl FileRange {
    pub fn entire_file() -> Self {
        FileRange::EntireFile
    }

    /// Create a range covering `size` bytes starting at `offset`.
    pub fn new(offset: u64, size: u64) -> Self {
        FileRange::Span {
            offset,
            end: offset.saturating_add(size),
        }
    }

    pub fn from_bounds(offset: u64, end: u64) -> Self {
        debug_assert!(offset <= end, "File range has an end before its start.");
        FileRange::Span {
            offset,
            end: end.max(offset),
        }
    }

    pub fn is_entire_file(&self) -> bool {
        matches!(self, FileRange::EntireFile)
    }

    /// Returns true if `offset` falls inside this range.
    pub fn is_in_range(&self, offset: u64) -> bool {
        match *self {
            FileRange::EntireFile => true,
            FileRange::Span { offset: start, end } => offset >= start && offset < end,
        }
    }

    /// Returns true if `other` lies completely inside this range.
    pub fn contains(&self, other: &FileRange) -> bool {
        match (*self, *other) {
            (FileRange::EntireFile, _) => true,
            (FileRange::Span { .. }, FileRange::EntireFile) => false,
            (FileRange::Span { offset, end }, FileRange::Span { offset: o, end: e }) => {
                o >= offset && e <= end
            }
        }
    }

    pub fn offset(&self) -> u64 {
        match *self {
            FileRange::EntireFile => 0,
            FileRange::Span { offset, .. } => offset,
        }
    }

    /// The size of the range, or `u64::MAX` for the entire file.
    pub fn size(&self) -> u64 {
        match *self {
            FileRange::EntireFile => u64::MAX,
            FileRange::Span { offset, end } => end - offset,
        }
    }

    /// The exclusive end of the range, or `u64::MAX` for the entire file.
    pub fn end(&self) -> u64 {
        match *self {
            FileRange::EntireFile => u64::MAX,
            FileRange::Span { end, .. } => end,
        }
    }
}

impl std::fmt::Display for FileRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileRange::EntireFile => write!(f, "[entire file]"),
            FileRange::Span { offset, end } => write!(f, "[{}, {})", offset, end),
        }
    }
}
