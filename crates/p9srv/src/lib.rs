#![forbid(unsafe_code)]
//! 9P2000.L server core for exporting a host filesystem subtree.
//!
//! This crate implements the server half of the 9P2000.L protocol the way
//! a virtualized guest's filesystem client expects to speak it: requests
//! arrive as framed messages in scatter-gather buffers, are translated
//! into operations on a designated root directory, and are answered with
//! 9P-encoded replies.
//!
//! # Overview
//!
//! The building blocks, bottom up:
//!
//! 1. [`serialize`] — the PDU codec: [`Encodable`]/[`Decodable`] wire
//!    types over a bounded [`Pdu`] buffer.
//! 2. [`sgio`] — [`SgReader`]/[`SgWriter`], the transport's borrowed
//!    scatter-gather views. Large reads and writes move file bytes
//!    through these directly, without touching a PDU.
//! 3. [`fid`] — the session's table of client-held fids.
//! 4. [`vfs`] — the [`Filesystem`] facade the handlers drive;
//!    [`hostfs::HostFs`] is the passthrough implementation over a host
//!    directory.
//! 5. [`srv`] — one handler per 9P2000.L operation, and [`do_request`],
//!    the single entry point a transport calls per message.
//!
//! # Message Flow
//!
//! 1. **Version negotiation**: `Tversion`/`Rversion`; only `"9P2000.L"`
//!    is spoken, anything else is answered with `"unknown"`.
//! 2. **Attach**: `Tattach` binds a fid to the export root. There is no
//!    authentication; an auth handshake is answered with an error.
//! 3. **Operations**: walk, open, read, write, readdir and friends.
//! 4. **Cleanup**: `Tclunk` releases fids; the session drop releases
//!    whatever the client leaked.
//!
//! # Fid Management
//!
//! A fid is a client-chosen 32-bit handle naming a server-side object.
//!
//! **Invariants:**
//! - Every live fid names a valid path below the export root.
//! - A fid holds an open file iff an open or create succeeded on it and
//!   no clunk has happened since; the handle is closed exactly once.
//! - Clunking an unknown fid succeeds (clunk is idempotent).
//! - Create and mkdir re-point the fid they were called on at the new
//!   object; walk re-points only when `newfid == fid`.
//!
//! # Error Handling
//!
//! Handlers return [`error::Error`]; the dispatcher converts whatever
//! reaches it into exactly one `Rlerror` carrying a positive errno.
//! Unknown or unsupported opcodes are answered with `EOPNOTSUPP`.
//!
//! # Transport
//!
//! The core does not own a socket. A transport hands [`do_request`] one
//! request/response buffer pair per message; the `p9expd` crate is a
//! small TCP/Unix-socket server built on exactly that contract.

pub mod error;
pub mod fcall;
pub mod fid;
pub mod hostfs;
pub mod serialize;
pub mod sgio;
pub mod srv;
#[macro_use]
pub mod utils;
pub mod vfs;

pub use crate::error::{Error, errno};
pub use crate::fcall::*;
pub use crate::fid::{FidEntry, FidTable};
pub use crate::hostfs::{HostFile, HostFs};
pub use crate::serialize::{Decodable, Encodable, Pdu};
pub use crate::sgio::{SgReader, SgWriter};
pub use crate::srv::{Server, do_request};
pub use crate::utils::Result;
pub use crate::vfs::{Dirent, Filesystem};
