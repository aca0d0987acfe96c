//! 9P error representations.
//!
//! In 9P2000 an error crosses the wire as a human-readable string carried
//! by an Rerror message. The server never aborts on a client-caused error;
//! whatever a handler returns is rendered into the reply's `ename`.

use std::{fmt, io};

/// Error type whose rendering becomes the Rerror `ename`.
#[derive(Debug)]
pub enum Error {
    /// Protocol or filesystem error string.
    Msg(String),
    /// I/O error, rendered as its errno description.
    Io(io::Error),
}

impl Error {
    /// The string sent to the client.
    pub fn ename(&self) -> String {
        match self {
            Error::Msg(s) => s.clone(),
            Error::Io(e) => match e.raw_os_error() {
                Some(n) => nix::errno::Errno::from_raw(n).desc().to_owned(),
                None => e.to_string(),
            },
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Msg(s) => write!(f, "{s}"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Msg(_) => None,
            Error::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Io(io::Error::from_raw_os_error(e as i32))
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Msg(s.to_owned())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Msg(s)
    }
}

/// 9P error strings, following Plan 9 conventions.
pub mod string {
    pub const EUNKNOWNFID: &str = "unknown fid";
    pub const EDUPFID: &str = "duplicate fid";
    pub const EDUPTAG: &str = "duplicate tag";
    pub const EBOTCH: &str = "9P protocol botch";
    pub const EBADOFFSET: &str = "bad offset";
    pub const EISDIR: &str = "is a directory";
    pub const EWALKNODIR: &str = "walk in non-directory";
    pub const ECREATENONDIR: &str = "create in non-directory";
    pub const EPERM: &str = "permission denied";
    pub const ENOCREATE: &str = "create prohibited";
    pub const ENOREAD: &str = "read prohibited";
    pub const ENOWRITE: &str = "write prohibited";
    pub const ENOREMOVE: &str = "remove prohibited";
    pub const ENOSTAT: &str = "stat prohibited";
    pub const ENOWSTAT: &str = "wstat prohibited";
    pub const ENOTFOUND: &str = "file not found";
    pub const EBADDIR: &str = "bad directory in wstat";
    pub const ENOAUTH: &str = "authentication not required";
    pub const ENOWALK: &str = "no walk function";
    pub const EOPENFID: &str = "cannot clone open fid";
    pub const EMSIZE: &str = "version: message size too small";
    pub const EUNKNOWNMSG: &str = "unknown message";
    pub const ENODIRREAD: &str = "opendirfile failed";
    pub const EINPLACEWALK: &str = "unused documented feature not implemented";
    pub const EWSTATPATH: &str = "wstat -- attempt to change qid.path";
    pub const EWSTATVERS: &str = "wstat -- attempt to change qid.vers";
    pub const EWSTATMODE: &str = "wstat -- unknown bits in mode";
    pub const EWSTATMISMATCH: &str = "wstat -- qid.type/mode mismatch";
    pub const EWSTATTYPE: &str = "wstat -- attempt to change qid.type";
}
