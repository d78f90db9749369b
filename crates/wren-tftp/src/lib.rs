//! Read-only TFTP server engine (RFC 1350, with RFC 2347/2348/2349 options).
//!
//! [`TftpServer`] listens on the well-known port and hands every new client
//! to its own [`Session`], which runs the lock-step transfer on a fresh
//! ephemeral socket.

pub mod audit;
pub mod buffer;
pub mod config;
pub mod error;
pub mod options;
pub mod packet;
pub mod path;
pub mod server;
pub mod session;
mod transfer;

pub use config::TftpConfig;
pub use error::{Result, TftpError};
pub use packet::{ErrorCode, Opcode, Packet, TftpOption};
pub use path::{PathResolver, RootJail};
pub use server::TftpServer;
pub use session::{Session, SessionConfig, SessionOutcome};

// RFC 1350 - The TFTP Protocol (Revision 2)
pub const TFTP_PORT: u16 = 69;
pub const DEFAULT_BLOCK_SIZE: usize = 512; // RFC 1350 standard block size
pub const MIN_BLOCK_SIZE: usize = 8; // RFC 2348 minimum block size
pub const MAX_BLOCK_SIZE: usize = 65464; // RFC 2348 maximum block size
pub const MAX_PACKET_SIZE: usize = 65468; // Max block size + 4 byte header
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
