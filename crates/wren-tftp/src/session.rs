//! One TFTP session: the control block and the loop that drives it.
//!
//! A session owns its working buffer, the client address it latched onto,
//! and at most one open transfer. It runs until the transfer completes, the
//! client reports an error, a request is refused, or the client goes quiet
//! for longer than the inactivity timeout.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, warn};

use crate::audit::AuditLogger;
use crate::buffer::WorkBuffer;
use crate::error::{Result, TftpError};
use crate::options::AcceptedOptions;
use crate::packet::{ERROR_HEADER_LEN, ErrorCode, Packet};
use crate::path::{PathResolver, RootJail};
use crate::transfer::Transfer;
use crate::{DEFAULT_BLOCK_SIZE, DEFAULT_TIMEOUT_SECS};

/// Per-session settings handed down by the session manager.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// How long to wait for the next datagram before giving up
    pub inactivity_timeout: Duration,
    /// Resends of the last block before a silent client ends the session.
    /// Zero keeps the plain behaviour: the first timeout ends it.
    pub max_retransmits: u32,
    /// Largest file served, 0 for no limit
    pub max_file_size_bytes: u64,
    pub audit_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retransmits: 0,
            max_file_size_bytes: 0,
            audit_enabled: false,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The last block was acknowledged
    Completed,
    /// The request was answered with an ERROR packet
    Rejected,
    /// Reading the file failed mid-transfer
    Failed,
    /// The client sent an ERROR packet
    ClientError,
    /// Nothing arrived within the inactivity timeout
    TimedOut,
    /// An ACK arrived with no transfer open
    Idle,
}

pub(crate) enum Flow {
    Continue,
    Stop(SessionOutcome),
}

pub struct Session {
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) root: PathBuf,
    pub(crate) resolver: Arc<dyn PathResolver>,
    pub(crate) config: SessionConfig,
    pub(crate) client: Option<SocketAddr>,
    pub(crate) buffer: WorkBuffer,
    pub(crate) accepted: AcceptedOptions,
    pub(crate) transfer: Option<Transfer>,
}

impl Session {
    /// Allocate the control block for a session served from `root`.
    pub fn new(
        socket: Arc<UdpSocket>,
        root: impl Into<PathBuf>,
        config: SessionConfig,
    ) -> Result<Self> {
        Ok(Self {
            socket,
            root: root.into(),
            resolver: Arc::new(RootJail),
            config,
            client: None,
            buffer: WorkBuffer::new(DEFAULT_BLOCK_SIZE)?,
            accepted: AcceptedOptions::default(),
            transfer: None,
        })
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn PathResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve a session whose first datagram has not been read yet.
    pub async fn run(self) -> Result<SessionOutcome> {
        self.drive(None).await
    }

    /// Serve a session whose first datagram was already received elsewhere,
    /// typically on the listening socket.
    pub async fn run_with_request(
        self,
        datagram: &[u8],
        from: SocketAddr,
    ) -> Result<SessionOutcome> {
        self.drive(Some((datagram, from))).await
    }

    async fn drive(mut self, initial: Option<(&[u8], SocketAddr)>) -> Result<SessionOutcome> {
        debug!("Entering TFTP session on {:?}", self.socket.local_addr().ok());

        if let Some((datagram, from)) = initial
            && let Flow::Stop(outcome) = self.dispatch(Packet::decode(datagram), from).await?
        {
            return Ok(outcome);
        }

        // Only the session's own client moves the deadline
        let base_timeout = self.config.inactivity_timeout;
        let mut wait = base_timeout;
        let mut deadline = Instant::now() + wait;
        let mut retransmits = 0;

        loop {
            let received = {
                let slot = self.buffer.recv_slot();
                timeout_at(deadline, self.socket.recv_from(slot)).await
            };

            let (len, from) = match received {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    error!("Failed reading from client: {}", e);
                    return Err(TftpError::Io(e));
                }
                Err(_) => {
                    if self.transfer.is_some() && retransmits < self.config.max_retransmits {
                        retransmits += 1;
                        wait = wait.saturating_mul(2);
                        deadline = Instant::now() + wait;
                        debug!(
                            "Timeout waiting for ACK, retransmitting (attempt {} of {})",
                            retransmits, self.config.max_retransmits
                        );
                        if let Flow::Stop(outcome) = self.retransmit().await? {
                            return Ok(outcome);
                        }
                        continue;
                    }
                    return Ok(self.timed_out(wait));
                }
            };

            let decoded = Packet::decode(self.buffer.received(len));
            match self.dispatch(decoded, from).await? {
                Flow::Continue => {
                    if self.client == Some(from) {
                        retransmits = 0;
                        wait = base_timeout;
                        deadline = Instant::now() + wait;
                    }
                }
                Flow::Stop(outcome) => {
                    debug!("Leaving TFTP session: {:?}", outcome);
                    return Ok(outcome);
                }
            }
        }
    }

    async fn dispatch(&mut self, decoded: Result<Packet>, from: SocketAddr) -> Result<Flow> {
        match self.client {
            None => self.client = Some(from),
            Some(client) if client != from => {
                warn!("Datagram from {} does not belong to session with {}", from, client);
                self.reject_stranger(from).await?;
                return Ok(Flow::Continue);
            }
            Some(_) => {}
        }

        let packet = match decoded {
            Ok(packet) => packet,
            Err(TftpError::UnsupportedOpcode(opcode)) => {
                warn!("Opcode {} from {} is not supported, ignoring", opcode, from);
                return Ok(Flow::Continue);
            }
            Err(e) => {
                warn!("Ignoring datagram from {}: {}", from, e);
                if self.config.audit_enabled {
                    AuditLogger::protocol_violation(from, &e.to_string());
                }
                return Ok(Flow::Continue);
            }
        };

        match packet {
            Packet::ReadRequest {
                filename,
                mode,
                options,
            } => self.handle_read_request(filename, mode, options).await,
            Packet::Ack { block } => {
                debug!("tftp ACK, block # {}", block);
                self.handle_ack(block).await
            }
            Packet::Error { code, message } => Ok(self.handle_client_error(code, &message)),
            other => {
                debug!("Ignoring {:?} from {}", other.opcode(), from);
                Ok(Flow::Continue)
            }
        }
    }

    fn timed_out(&mut self, waited: Duration) -> SessionOutcome {
        let client = self.client;
        warn!(
            "Timeout waiting for client {}",
            client.map_or_else(|| "<none>".to_string(), |c| c.to_string())
        );

        if self.config.audit_enabled
            && let Some(client) = client
        {
            if let Some(transfer) = self.transfer.take() {
                AuditLogger::transfer_failed(
                    client,
                    transfer.filename(),
                    "inactivity timeout",
                    transfer.last_sent(),
                    transfer.correlation_id(),
                );
            }
            AuditLogger::session_timeout(client, waited.as_secs());
        }

        SessionOutcome::TimedOut
    }

    /// RFC 1350: a packet from the wrong port gets an ERROR and does not
    /// disturb the session.
    async fn reject_stranger(&mut self, stranger: SocketAddr) -> Result<()> {
        self.buffer.encode(&Packet::Error {
            code: ErrorCode::UnknownTid,
            message: "Unknown transfer ID".to_string(),
        })?;
        self.socket.send_to(self.buffer.as_slice(), stranger).await?;
        Ok(())
    }

    pub(crate) fn client_addr(&self) -> Result<SocketAddr> {
        self.client
            .ok_or_else(|| TftpError::Tftp("Session has no client address".to_string()))
    }

    /// Send whatever the working buffer currently holds to the client.
    pub(crate) async fn transmit(&self) -> Result<()> {
        let client = self.client_addr()?;
        let sent = self.socket.send_to(self.buffer.as_slice(), client).await?;
        debug!("tftp sent {} bytes to {}", sent, client);
        Ok(())
    }

    pub(crate) async fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        self.buffer.encode(packet)?;
        self.transmit().await
    }

    /// Send an ERROR, shortening the message if the buffer cannot hold it.
    pub(crate) async fn send_error(&mut self, code: ErrorCode, message: &str) -> Result<()> {
        let room = self.buffer.capacity().saturating_sub(ERROR_HEADER_LEN + 1);
        let mut end = message.len().min(room);
        while !message.is_char_boundary(end) {
            end -= 1;
        }

        self.send_packet(&Packet::Error {
            code,
            message: message[..end].to_string(),
        })
        .await?;
        debug!("Sent ERROR packet: code={:?}, msg={}", code, &message[..end]);
        Ok(())
    }
}
