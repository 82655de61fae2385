use std::{fmt, io, path::PathBuf};

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Map write operations, carried in [`MapError::Write`] for logging.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteOp {
    Upsert,
    Delete,
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteOp::Upsert => f.write_str("upsert"),
            WriteOp::Delete => f.write_str("delete"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MapError {
    /// The map could be neither attached from its pin nor created.
    #[error("failed to open or create devices map at {}", path.display())]
    Init {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("device map {op} failed for ifindex {ifindex}")]
    Write {
        op: WriteOp,
        ifindex: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to read device map")]
    Read {
        #[source]
        source: io::Error,
    },

    /// Absent key. A normal outcome of lookup and delete.
    #[error("ifindex {ifindex} not present in device map")]
    NotFound { ifindex: u32 },
}

impl MapError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MapError::NotFound { .. })
    }
}

/// Terminal result of the sync loop.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SyncError {
    #[error("devices map sync cancelled")]
    Cancelled,

    /// Every stop sender was dropped; treated like cancellation.
    #[error("devices map sync stop signal closed")]
    StopSignalClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_error_names_operation_and_ifindex() {
        let err = MapError::Write {
            op: WriteOp::Delete,
            ifindex: 7,
            source: io::Error::from_raw_os_error(libc::EPERM),
        };
        assert_eq!(err.to_string(), "device map delete failed for ifindex 7");
        assert!(!err.is_not_found());
        assert!(MapError::NotFound { ifindex: 7 }.is_not_found());
    }
}
