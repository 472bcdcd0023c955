//! Error types for the sandbox bridge.
//!
//! Every failure, local or host-reported, collapses to an [`Errno`] and a
//! signed status so that callers which only understand status codes see one
//! uniform contract.

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Host error number (WASI preview1 numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub u16);

impl Errno {
    pub const SUCCESS: Errno = Errno(0);
    pub const BADF: Errno = Errno(8);
    pub const ILSEQ: Errno = Errno(25);
    pub const INVAL: Errno = Errno(28);
    pub const IO: Errno = Errno(29);
    pub const MFILE: Errno = Errno(33);
    pub const NAMETOOLONG: Errno = Errno(37);
    pub const NOBUFS: Errno = Errno(42);
    pub const NOENT: Errno = Errno(44);
    pub const NOSYS: Errno = Errno(52);
    pub const NOTSUP: Errno = Errno(58);
    pub const NOTTY: Errno = Errno(59);
    pub const RANGE: Errno = Errno(68);
    pub const SRCH: Errno = Errno(71);

    /// Interpret a raw host status. Negative and positive values name the same errno.
    pub fn from_status(status: i32) -> Option<Errno> {
        match status {
            0 => None,
            s => Some(Errno(s.unsigned_abs().min(u16::MAX as u32) as u16)),
        }
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn name(self) -> &'static str {
        match self {
            Errno::SUCCESS => "ESUCCESS",
            Errno::BADF => "EBADF",
            Errno::ILSEQ => "EILSEQ",
            Errno::INVAL => "EINVAL",
            Errno::IO => "EIO",
            Errno::MFILE => "EMFILE",
            Errno::NAMETOOLONG => "ENAMETOOLONG",
            Errno::NOBUFS => "ENOBUFS",
            Errno::NOENT => "ENOENT",
            Errno::NOSYS => "ENOSYS",
            Errno::NOTSUP => "ENOTSUP",
            Errno::NOTTY => "ENOTTY",
            Errno::RANGE => "ERANGE",
            Errno::SRCH => "ESRCH",
            _ => "EUNKNOWN",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Host error: {0}")]
    Host(Errno),

    #[error("Tunnel unreachable: {0}")]
    Unreachable(String),

    #[error("Response truncated: {needed} bytes do not fit in {capacity}")]
    Truncated { needed: usize, capacity: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Too many open files: no free descriptor in {floor}..{ceiling}")]
    TooManyOpenFiles { floor: u32, ceiling: u32 },

    #[error("Bad file descriptor: {0}")]
    BadDescriptor(u32),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// The errno this failure is reported as.
    pub fn errno(&self) -> Errno {
        match self {
            Error::Host(errno) => *errno,
            Error::Unreachable(_) => Errno::IO,
            Error::Truncated { .. } => Errno::NOBUFS,
            Error::InvalidArgument(_) => Errno::INVAL,
            Error::TooManyOpenFiles { .. } => Errno::MFILE,
            Error::BadDescriptor(_) => Errno::BADF,
            Error::Protocol(_) | Error::Json(_) => Errno::ILSEQ,
            Error::Io(_) => Errno::IO,
        }
    }

    /// Signed status: always negative for an error.
    pub fn status(&self) -> i32 {
        -(self.errno().raw() as i32)
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

/// Collapse a result into the signed status convention (`0` on success).
pub fn status_of<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.status(),
    }
}
