use thiserror::Error;

#[derive(Error, Debug)]
pub enum TftpError {
    #[error("TFTP error: {0}")]
    Tftp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Invalid opcode: {0}")]
    UnknownOpcode(u16),

    #[error("Unsupported opcode: {0}")]
    UnsupportedOpcode(u16),

    #[error("Packet of {needed} bytes exceeds buffer limit of {limit} bytes")]
    BufferOverflow { needed: usize, limit: usize },

    #[error("Failed to allocate {0} bytes for transfer buffer")]
    OutOfMemory(usize),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TftpError>;
