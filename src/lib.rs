#![forbid(unsafe_code)]
//! Server-side 9P2000 file-service framework.
//!
//! This crate is the machinery between one bidirectional byte stream
//! speaking 9P2000 and a [`srv::Filesystem`] implementation: it frames and
//! decodes requests, keeps the per-connection fid and tag tables, enforces
//! the protocol state machine for each of the 13 request types, and writes
//! the replies back — in whatever order they complete, with flushes answered
//! strictly after their targets.
//!
//! # Overview
//!
//! 9P is Plan 9's remote file protocol. A server presents a file tree,
//! synthetic or real, by answering `version`, `auth`, `attach`, `flush`,
//! `walk`, `open`, `create`, `read`, `write`, `clunk`, `remove`, `stat` and
//! `wstat` requests. All of the protocol bookkeeping lives here, so a
//! filesystem only supplies the semantics:
//!
//! 1. Implement [`srv::Filesystem`] for your type; every method is optional.
//! 2. Optionally hang a file tree (see [`tree`]) off the connection to get
//!    walks, permission checks and directory reads served for you.
//! 3. Hand a reader/writer pair to [`srv::Srv::serve`].
//!
//! # Request lifecycle
//!
//! One task reads and validates messages in arrival order; each request that
//! reaches a callback then runs on its own task, so a slow `read` does not
//! stall the connection. Tags disambiguate the interleaved replies. A
//! duplicate tag is answered with Rerror without disturbing the in-flight
//! request, and Tflush piggybacks on its target: the Rflush is written after
//! the target's reply, which clients rely on for ordering.
//!
//! # Errors
//!
//! A 9P2000 error is a string carried by Rerror. Handlers return
//! [`error::Error`], which renders protocol strings as-is and I/O errors as
//! their errno description. The strings the engine itself produces follow
//! Plan 9 conventions ("unknown fid", "duplicate tag", …) and live in
//! [`error::string`].

pub mod error;
pub mod fcall;
mod pool;
pub mod serialize;
pub mod srv;
pub mod tree;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
