use std::error::Error;
use std::path::PathBuf;

/// An error reading from the filesystem.
#[derive(Debug)]
pub enum StorageError {
    /// The file couldn't be opened.
    Open { path: PathBuf, error: std::io::Error },
    /// Seeking to the start of the read failed.
    Seek(std::io::Error),
    /// Reading from the file failed.
    Read(std::io::Error),
}

impl Error for StorageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StorageError::Open { error, .. } => Some(error),
            StorageError::Seek(e) => Some(e),
            StorageError::Read(e) => Some(e),
        }
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Open { path, error } => {
                write!(f, "Failed to open file {:?}: {}", path, error)
            }
            StorageError::Seek(e) => write!(f, "Failed to seek in file: {}", e),
            StorageError::Read(e) => write!(f, "Failed to read from file: {}", e),
        }
    }
}
