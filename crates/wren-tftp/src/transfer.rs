//! Read transfers: the open-file state and the request/ACK/ERROR handlers
//! that move a session through it.
//!
//! ```text
//!   Idle --RRQ--> Transferring --final ACK--> done
//!                      |
//!                      +--ERROR / refusal / timeout--> done
//! ```
//!
//! Blocks are tracked internally as 64-bit indices starting at 1; the wire
//! block number is the index truncated to 16 bits, so block numbers roll
//! over from 65535 to 0 on very large files.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::fs::File;
use tokio::io::AsyncSeekExt;
use tracing::{debug, error, info, warn};

use crate::DEFAULT_BLOCK_SIZE;
use crate::audit::AuditLogger;
use crate::buffer::WorkBuffer;
use crate::error::{Result, TftpError};
use crate::options::{self, negotiate};
use crate::packet::{ErrorCode, TftpOption};
use crate::session::{Flow, Session, SessionOutcome};

pub(crate) struct Transfer {
    file: File,
    path: PathBuf,
    filename: String,
    correlation_id: String,
    segment_size: usize,
    file_size: u64,
    /// Offset the next sequential read starts from
    position: u64,
    /// Index of the last DATA block sent; 0 while only the OACK is out
    last_sent: u64,
    /// The last block sent was short
    eof: bool,
    started: Instant,
}

impl Transfer {
    pub(crate) async fn open(
        path: &Path,
        filename: &str,
        segment_size: usize,
        correlation_id: &str,
    ) -> std::io::Result<Self> {
        let file = File::open(path).await?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                ErrorKind::NotFound,
                "not a regular file",
            ));
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            filename: filename.to_string(),
            correlation_id: correlation_id.to_string(),
            segment_size,
            file_size: metadata.len(),
            position: 0,
            last_sent: 0,
            eof: false,
            started: Instant::now(),
        })
    }

    pub(crate) fn filename(&self) -> &str {
        &self.filename
    }

    pub(crate) fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub(crate) fn file_size(&self) -> u64 {
        self.file_size
    }

    pub(crate) fn last_sent(&self) -> u64 {
        self.last_sent
    }

    /// Block number the client must acknowledge next.
    pub(crate) fn expected_ack(&self) -> u16 {
        self.last_sent as u16
    }

    /// The final, short block has gone out.
    pub(crate) fn is_complete(&self) -> bool {
        self.eof && self.last_sent > 0
    }

    /// Build the next DATA message in `buffer`.
    ///
    /// With `resend` set, the file is rewound to the start of that block
    /// first; otherwise reading continues from the current position and the
    /// block index follows from it. Returns the index that was built.
    pub(crate) async fn read_block(
        &mut self,
        buffer: &mut WorkBuffer,
        resend: Option<u64>,
    ) -> Result<u64> {
        let segment = self.segment_size as u64;

        let index = match resend {
            Some(index) => {
                let pos = index.saturating_sub(1) * segment;
                self.file.seek(SeekFrom::Start(pos)).await?;
                self.position = pos;
                index.max(1)
            }
            None => self.position / segment + 1,
        };

        debug!(
            "tftp block {} reading {} bytes from {}",
            index,
            self.segment_size,
            self.path.display()
        );
        let len = buffer.fill_data(index as u16, &mut self.file).await?;

        self.position += len as u64;
        self.eof = len < self.segment_size;
        self.last_sent = index;
        Ok(index)
    }
}

impl Session {
    pub(crate) async fn handle_read_request(
        &mut self,
        filename: String,
        mode: String,
        options: Vec<TftpOption>,
    ) -> Result<Flow> {
        let client = self.client_addr()?;
        let correlation_id = AuditLogger::generate_correlation_id();

        info!(
            "RRQ from {}: {} (mode: {}, options: {:?})",
            client, filename, mode, options
        );
        if self.config.audit_enabled {
            let requested: serde_json::Map<String, serde_json::Value> = options
                .iter()
                .map(|o| (o.name.clone(), serde_json::Value::String(o.value.clone())))
                .collect();
            AuditLogger::read_request(
                client,
                &filename,
                &mode,
                serde_json::Value::Object(requested),
                &correlation_id,
            );
        }

        if let Some(previous) = self.transfer.take() {
            warn!(
                "New request from {} abandons transfer of {} at block {}",
                client,
                previous.filename(),
                previous.last_sent()
            );
        }

        // Both modes are served byte for byte; MAIL is obsolete (RFC 1350)
        let mode_lower = mode.to_ascii_lowercase();
        if mode_lower != "octet" && mode_lower != "netascii" {
            return self
                .refuse(
                    &filename,
                    ErrorCode::IllegalOperation,
                    &format!("Unsupported transfer mode: {}", mode),
                    &correlation_id,
                )
                .await;
        }

        // Every request negotiates from the default segment size
        self.buffer.resize(DEFAULT_BLOCK_SIZE)?;
        self.accepted = match negotiate(&options, &mut self.buffer) {
            Ok(accepted) => accepted,
            Err(TftpError::OutOfMemory(size)) => {
                error!("Failed reallocating TFTP buffer to {} bytes", size);
                return self
                    .refuse(
                        &filename,
                        ErrorCode::DiskFull,
                        "Allocation exceeded",
                        &correlation_id,
                    )
                    .await;
            }
            Err(e) => return Err(e),
        };

        let path = match self.resolver.resolve(&self.root, &filename) {
            Ok(path) => path,
            Err(e) => {
                return self
                    .refuse(
                        &filename,
                        ErrorCode::AccessViolation,
                        &e.to_string(),
                        &correlation_id,
                    )
                    .await;
            }
        };

        let segment_size = self.buffer.segment_size();
        let opened = Transfer::open(&path, &filename, segment_size, &correlation_id).await;
        let transfer = match opened {
            Ok(transfer) => transfer,
            Err(e) => {
                error!("Failed opening {}: {}", path.display(), e);
                let (code, message) = match e.kind() {
                    ErrorKind::NotFound => (ErrorCode::FileNotFound, "File not found".to_string()),
                    ErrorKind::PermissionDenied => {
                        (ErrorCode::AccessViolation, "Access denied".to_string())
                    }
                    _ => (ErrorCode::NotDefined, e.to_string()),
                };
                return self
                    .refuse(&filename, code, &message, &correlation_id)
                    .await;
            }
        };

        let max_size = self.config.max_file_size_bytes;
        if max_size > 0 && transfer.file_size() > max_size {
            error!(
                "File size {} exceeds maximum allowed size {} for {}",
                transfer.file_size(),
                max_size,
                path.display()
            );
            return self
                .refuse(&filename, ErrorCode::DiskFull, "File too large", &correlation_id)
                .await;
        }

        if self.config.audit_enabled {
            AuditLogger::transfer_started(
                client,
                &filename,
                transfer.file_size(),
                segment_size,
                &correlation_id,
            );
        }

        let oack = options::acknowledgement(self.accepted, segment_size, transfer.file_size());
        self.transfer = Some(transfer);

        match oack {
            // The client answers an OACK with ACK 0, which releases block 1
            Some(packet) => {
                debug!("Sending OACK with options: {:?}", packet);
                self.send_packet(&packet).await?;
                Ok(Flow::Continue)
            }
            None => self.send_data(None).await,
        }
    }

    pub(crate) async fn handle_ack(&mut self, block: u16) -> Result<Flow> {
        let Some(transfer) = self.transfer.as_ref() else {
            debug!("ACK block {} with no transfer open", block);
            return Ok(Flow::Stop(SessionOutcome::Idle));
        };

        let expected = transfer.expected_ack();
        if block != expected {
            debug!(
                "Ignoring ACK for block {} while waiting for {}",
                block, expected
            );
            return Ok(Flow::Continue);
        }

        if transfer.is_complete() {
            self.finish()?;
            return Ok(Flow::Stop(SessionOutcome::Completed));
        }

        debug!("ACK block {}, file still open ...", block);
        self.send_data(None).await
    }

    pub(crate) fn handle_client_error(&mut self, code: ErrorCode, message: &str) -> Flow {
        let client = self.client.map(|c| c.to_string()).unwrap_or_default();
        warn!("Client {} sent error {:?}: {}", client, code, message);

        if let Some(transfer) = self.transfer.take()
            && self.config.audit_enabled
            && let Some(client) = self.client
        {
            AuditLogger::transfer_failed(
                client,
                transfer.filename(),
                &format!("client error {}: {}", code as u16, message),
                transfer.last_sent(),
                transfer.correlation_id(),
            );
        }

        Flow::Stop(SessionOutcome::ClientError)
    }

    /// Send the next block, or rebuild block `resend`.
    pub(crate) async fn send_data(&mut self, resend: Option<u64>) -> Result<Flow> {
        let Some(transfer) = self.transfer.as_mut() else {
            return Ok(Flow::Continue);
        };

        if let Err(e) = transfer.read_block(&mut self.buffer, resend).await {
            error!("Failed reading {}: {}", transfer.filename(), e);
            let filename = transfer.filename().to_string();
            let correlation_id = transfer.correlation_id().to_string();
            let blocks = transfer.last_sent();
            self.transfer = None;

            self.send_error(ErrorCode::NotDefined, "Read error").await?;
            if self.config.audit_enabled {
                AuditLogger::transfer_failed(
                    self.client_addr()?,
                    &filename,
                    &e.to_string(),
                    blocks,
                    &correlation_id,
                );
            }
            return Ok(Flow::Stop(SessionOutcome::Failed));
        }

        self.transmit().await?;
        Ok(Flow::Continue)
    }

    /// Resend whatever the client has not acknowledged yet.
    pub(crate) async fn retransmit(&mut self) -> Result<Flow> {
        let Some(transfer) = self.transfer.as_ref() else {
            return Ok(Flow::Continue);
        };

        let last = transfer.last_sent();
        if last == 0 {
            let oack = options::acknowledgement(
                self.accepted,
                self.buffer.segment_size(),
                transfer.file_size(),
            );
            if let Some(packet) = oack {
                self.send_packet(&packet).await?;
            }
            return Ok(Flow::Continue);
        }

        self.send_data(Some(last)).await
    }

    /// Close the completed transfer.
    fn finish(&mut self) -> Result<()> {
        let client = self.client_addr()?;
        let Some(transfer) = self.transfer.take() else {
            return Ok(());
        };

        let duration_ms = transfer.started.elapsed().as_millis() as u64;
        info!(
            "Transfer of {} to {} complete: {} blocks, {} bytes in {} ms",
            transfer.filename(),
            client,
            transfer.last_sent(),
            transfer.position,
            duration_ms
        );

        if self.config.audit_enabled {
            AuditLogger::transfer_completed(
                client,
                transfer.filename(),
                transfer.position,
                transfer.last_sent(),
                duration_ms,
                transfer.correlation_id(),
            );
        }

        Ok(())
    }

    async fn refuse(
        &mut self,
        filename: &str,
        code: ErrorCode,
        reason: &str,
        correlation_id: &str,
    ) -> Result<Flow> {
        warn!("Refusing {} to {:?}: {}", filename, self.client, reason);
        self.send_error(code, reason).await?;
        if self.config.audit_enabled {
            AuditLogger::read_denied(self.client_addr()?, filename, reason, correlation_id);
        }
        Ok(Flow::Stop(SessionOutcome::Rejected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{DATA_HEADER_LEN, Packet};

    async fn fixture(
        len: usize,
    ) -> std::result::Result<(tempfile::TempDir, PathBuf, Vec<u8>), Box<dyn std::error::Error>>
    {
        let dir = tempfile::tempdir()?;
        let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let path = dir.path().join("image.bin");
        tokio::fs::write(&path, &content).await?;
        Ok((dir, path, content))
    }

    fn payload(buffer: &WorkBuffer) -> Vec<u8> {
        buffer.as_slice()[DATA_HEADER_LEN..].to_vec()
    }

    #[tokio::test]
    async fn sequential_blocks_cover_the_file()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (_dir, path, content) = fixture(1300).await?;
        let mut buffer = WorkBuffer::new(512)?;
        let mut transfer = Transfer::open(&path, "image.bin", 512, "t").await?;

        let mut received = Vec::new();
        for expected in 1..=3u64 {
            let index = transfer.read_block(&mut buffer, None).await?;
            assert_eq!(index, expected);
            received.extend(payload(&buffer));
        }

        assert!(transfer.is_complete());
        assert_eq!(received, content);
        assert_eq!(transfer.expected_ack(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn exact_multiple_ends_with_empty_block()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (_dir, path, _content) = fixture(1024).await?;
        let mut buffer = WorkBuffer::new(512)?;
        let mut transfer = Transfer::open(&path, "image.bin", 512, "t").await?;

        transfer.read_block(&mut buffer, None).await?;
        transfer.read_block(&mut buffer, None).await?;
        assert!(!transfer.is_complete());

        assert_eq!(transfer.read_block(&mut buffer, None).await?, 3);
        assert_eq!(buffer.as_slice(), &[0, 3, 0, 3]);
        assert!(transfer.is_complete());
        Ok(())
    }

    #[tokio::test]
    async fn resend_reproduces_the_original_block()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (_dir, path, _content) = fixture(2000).await?;
        let mut buffer = WorkBuffer::new(512)?;
        let mut transfer = Transfer::open(&path, "image.bin", 512, "t").await?;

        transfer.read_block(&mut buffer, None).await?;
        transfer.read_block(&mut buffer, None).await?;
        let original = buffer.as_slice().to_vec();
        transfer.read_block(&mut buffer, None).await?;

        assert_eq!(transfer.read_block(&mut buffer, Some(2)).await?, 2);
        assert_eq!(buffer.as_slice(), &original[..]);

        // Sequential reads carry on after the resent block
        assert_eq!(transfer.read_block(&mut buffer, None).await?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn block_numbers_wrap_past_65535()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (_dir, path, _content) = fixture(8 * 65536 + 3).await?;
        let mut buffer = WorkBuffer::new(8)?;
        let mut transfer = Transfer::open(&path, "image.bin", 8, "t").await?;

        assert_eq!(transfer.read_block(&mut buffer, Some(65535)).await?, 65535);
        assert_eq!(transfer.expected_ack(), 65535);

        assert_eq!(transfer.read_block(&mut buffer, None).await?, 65536);
        assert_eq!(transfer.expected_ack(), 0);
        match Packet::decode(buffer.as_slice())? {
            Packet::Data { block, payload } => {
                assert_eq!(block, 0);
                assert_eq!(payload.len(), 8);
            }
            other => panic!("expected DATA, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn directories_are_not_served() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        match Transfer::open(dir.path(), "dir", 512, "t").await {
            Err(e) => assert_eq!(e.kind(), ErrorKind::NotFound),
            Ok(_) => panic!("directory opened as a transfer"),
        }
        Ok(())
    }
}
