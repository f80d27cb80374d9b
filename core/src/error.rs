use std::error::Error;

/// An error using the [`Streamer`](crate::Streamer) or the result of a request.
#[derive(Debug)]
pub enum StreamerError {
    /// The request hasn't completed yet.
    NotCompleted,
    /// The request isn't a read.
    NotARead,
    /// The request isn't a report.
    NotAReport,
    /// The buffer of the read was already claimed.
    BufferClaimed,
    /// The statistics of the report were already taken.
    ReportClaimed,
    /// The scheduler thread is no longer running.
    SchedulerClosed,
    /// The scheduler thread could not be started.
    SpawnFailed(std::io::Error),
}

impl Error for StreamerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StreamerError::SpawnFailed(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for StreamerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamerError::NotCompleted => write!(f, "The request has not completed yet"),
            StreamerError::NotARead => write!(f, "The request is not a read request"),
            StreamerError::NotAReport => write!(f, "The request is not a report request"),
            StreamerError::BufferClaimed => {
                write!(f, "The buffer of the read request was already claimed")
            }
            StreamerError::ReportClaimed => {
                write!(f, "The result of the report request was already taken")
            }
            StreamerError::SchedulerClosed => write!(f, "The scheduler thread is closed"),
            StreamerError::SpawnFailed(e) => {
                write!(f, "Failed to start the scheduler thread: {}", e)
            }
        }
    }
}

impl From<std::io::Error> for StreamerError {
    fn from(e: std::io::Error) -> Self {
        StreamerError::SpawnFailed(e)
    }
}
