//! A small 9P2000.L server for exporting a host directory to a guest.
//!
//! The guest mounts the share with `mount -t 9p -o trans=tcp,version=9p2000.L`.
//! Only the subset of the protocol Linux's v9fs client uses for regular file
//! access is implemented; anything else is answered with `EOPNOTSUPP`.
#![cfg_attr(not(test), deny(missing_docs))]

pub mod errors;
pub mod fcall;
#[cfg(unix)]
mod fs;
#[cfg(unix)]
pub mod server;

#[doc(inline)]
pub use errors::Error;
#[doc(inline)]
pub use fcall::{Qid, Rmessage, Tmessage};
#[cfg(unix)]
#[doc(inline)]
pub use server::Server;

/// The only protocol dialect this server speaks.
pub const VERSION_9P2000_L: &str = "9P2000.L";
/// Largest message size the server offers during version negotiation.
pub const DEFAULT_MSIZE: u32 = 262_144;
