//! Error handling for the http server

use std::fmt;
use std::io;
use std::panic::Location;

/// A Result for internal operations.
pub type Result<T> = ::std::result::Result<T, Error>;

/// An error that ends the current request, plus the source line that raised
/// it. The line ends up in the access log.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    line: u32
}

/// All errors which might arise while handling a request
#[derive(Debug)]
pub enum ErrorKind {
    Io(io::Error),
    /// The request line did not carry an `HTTP/x.y` token
    BadProtocol,
    MethodNotImplemented(String),
    /// The Host header contained bytes outside the allowed set
    ForbiddenHost,
    NotFound,
    /// Credentials missing or wrong; carries the realm to challenge with
    Unauthorized(String),
    RequestTooLarge,
    ScriptWritable,
    CgiFailed,
    Malfunction(String),
    Timeout
}

impl Error {
    #[track_caller]
    pub fn new(kind: ErrorKind) -> Error {
        Error {
            kind: kind,
            line: Location::caller().line()
        }
    }

    #[inline]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Source line that raised this error
    #[inline]
    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn is_timeout(&self) -> bool {
        match self.kind {
            ErrorKind::Timeout => true,
            _ => false
        }
    }
}

impl From<io::Error> for Error {
    #[track_caller]
    fn from(e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::TimedOut => Error::new(ErrorKind::Timeout),
            _ => Error::new(ErrorKind::Io(e))
        }
    }
}

impl From<ErrorKind> for Error {
    #[track_caller]
    fn from(kind: ErrorKind) -> Error {
        Error::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        (match self.kind {
            ErrorKind::Io(ref e) => write!(f, "I/O error: {}", e),
            ErrorKind::BadProtocol => write!(f, "unrecognized protocol"),
            ErrorKind::MethodNotImplemented(ref m) =>
                write!(f, "method {} not implemented", m),
            ErrorKind::ForbiddenHost => write!(f, "illegal Host header"),
            ErrorKind::NotFound => write!(f, "not found"),
            ErrorKind::Unauthorized(ref realm) =>
                write!(f, "authorization required for {}", realm),
            ErrorKind::RequestTooLarge => write!(f, "request body too large"),
            ErrorKind::ScriptWritable =>
                write!(f, "CGI program writable by non-owner"),
            ErrorKind::CgiFailed => write!(f, "CGI program failed"),
            ErrorKind::Malfunction(ref m) => write!(f, "malfunction: {}", m),
            ErrorKind::Timeout => write!(f, "deadline expired")
        })?;
        write!(f, " (line {})", self.line)
    }
}

#[test]
fn error_remembers_raising_line() {
    let here = line!() + 1;
    let e = Error::new(ErrorKind::NotFound);
    assert_eq!(e.line(), here);
}

#[test]
fn timed_out_io_becomes_timeout() {
    let e = Error::from(io::Error::new(io::ErrorKind::TimedOut, "slow"));
    assert!(e.is_timeout());

    let e = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
    assert!(!e.is_timeout());
}
