//! Error types for 9P operations.
//!
//! Handlers report failures as POSIX errnos; the dispatcher turns them
//! into `Rlerror` replies carrying the positive error number.

use std::{error, fmt, io};

use nix::errno::Errno;

/// POSIX errno values, re-exported for handler use.
pub mod errno {
    pub use nix::errno::Errno::{self, *};
}

/// The error type for 9P server operations.
#[derive(Debug)]
pub enum Error {
    /// An errno to be delivered to the client as-is
    No(Errno),
    /// An I/O failure, projected to an errno at reply time
    Io(io::Error),
}

impl Error {
    /// The errno representing this error on the wire.
    pub fn errno(&self) -> Errno {
        match self {
            Error::No(errno) => *errno,
            Error::Io(e) => match e.raw_os_error() {
                Some(n) => Errno::from_raw(n),
                None => match e.kind() {
                    io::ErrorKind::UnexpectedEof => Errno::EINVAL,
                    io::ErrorKind::WriteZero => Errno::EMSGSIZE,
                    io::ErrorKind::NotFound => Errno::ENOENT,
                    io::ErrorKind::PermissionDenied => Errno::EACCES,
                    io::ErrorKind::AlreadyExists => Errno::EEXIST,
                    _ => Errno::EIO,
                },
            },
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::No(errno) => write!(f, "{}", errno.desc()),
            Error::Io(e) => e.fmt(f),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::No(_) => None,
            Error::Io(e) => Some(e),
        }
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Error {
        Error::No(errno)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}
