//! Sorting error types.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;

/// Errors surfaced by the sorter and its collaborators.
#[derive(Debug)]
pub enum SortError {
    /// The memory budget is too small to hold the minimum number of blocks.
    InsufficientMemory {
        /// Bytes required for the requested configuration.
        required: usize,
        /// Bytes actually provided.
        provided: usize,
    },
    /// The comparator's sentinels violate the strict weak ordering contract.
    BadComparator,
    /// Backing file creation error.
    TempFile(io::Error),
    /// Device read/write error.
    Io(io::Error),
    /// The request was cancelled before it reached the device.
    Cancelled,
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SortError::TempFile(err) => Some(err),
            SortError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortError::InsufficientMemory { required, provided } => write!(
                f,
                "insufficient memory: {} bytes required, {} provided",
                required, provided
            ),
            SortError::BadComparator => {
                write!(f, "comparator sentinels violate the strict weak ordering")
            }
            SortError::TempFile(err) => write!(f, "backing file not created: {}", err),
            SortError::Io(err) => write!(f, "device I/O operation failed: {}", err),
            SortError::Cancelled => write!(f, "I/O request cancelled"),
        }
    }
}

impl From<io::Error> for SortError {
    fn from(err: io::Error) -> Self {
        SortError::Io(err)
    }
}

#[cfg(test)]
mod test {
    use std::error::Error;
    use std::io;

    use super::SortError;

    #[test]
    fn test_source_chain() {
        let err = SortError::Io(io::Error::new(io::ErrorKind::Other, "disk gone"));
        assert!(err.source().is_some());
        assert!(err.to_string().contains("disk gone"));

        let err = SortError::InsufficientMemory {
            required: 256,
            provided: 64,
        };
        assert!(err.source().is_none());
        assert!(err.to_string().contains("256"));
    }
}
