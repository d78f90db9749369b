use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::{Level, event};

/// Structured events describing what the server did for each client.
///
/// Serialized to JSON and emitted through `tracing`, so they land wherever
/// the subscriber writes (stderr or the configured log file).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        bind_addr: String,
        root_dir: String,
    },

    ServerShutdown {
        #[serde(flatten)]
        common: CommonFields,
        reason: String,
    },

    ReadRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
        options: serde_json::Value,
    },

    ReadDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        reason: String,
    },

    TransferStarted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        file_size: u64,
        block_size: usize,
    },

    TransferCompleted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        bytes_transferred: u64,
        blocks_sent: u64,
        duration_ms: u64,
        /// Transfer throughput in bytes per second
        throughput_bps: u64,
    },

    TransferFailed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        error: String,
        blocks_sent: u64,
    },

    /// Client went quiet for longer than the inactivity timeout
    SessionTimeout {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        idle_secs: u64,
    },

    ProtocolViolation {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        violation: String,
    },

    ConfigurationLoaded {
        #[serde(flatten)]
        common: CommonFields,
        config_file: String,
    },
}

/// Fields shared by every audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub hostname: String,
    pub service: String,
    /// info, warn or error
    pub severity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: "wren-tftp".to_string(),
            severity: severity.to_string(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(severity: &str, correlation_id: &str) -> Self {
        let mut fields = Self::new(severity);
        fields.correlation_id = Some(correlation_id.to_string());
        fields
    }
}

impl AuditEvent {
    pub fn log(&self) {
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"Failed to serialize audit event: {:?}\"}}",
                self
            )
        });

        match self.common().severity.as_str() {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }

    fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ServerShutdown { common, .. }
            | AuditEvent::ReadRequest { common, .. }
            | AuditEvent::ReadDenied { common, .. }
            | AuditEvent::TransferStarted { common, .. }
            | AuditEvent::TransferCompleted { common, .. }
            | AuditEvent::TransferFailed { common, .. }
            | AuditEvent::SessionTimeout { common, .. }
            | AuditEvent::ProtocolViolation { common, .. }
            | AuditEvent::ConfigurationLoaded { common, .. } => common,
        }
    }
}

pub struct AuditLogger;

impl AuditLogger {
    pub fn server_started(bind_addr: SocketAddr, root_dir: &Path) {
        AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            bind_addr: bind_addr.to_string(),
            root_dir: root_dir.display().to_string(),
        }
        .log();
    }

    pub fn server_shutdown(reason: &str) {
        AuditEvent::ServerShutdown {
            common: CommonFields::new("info"),
            reason: reason.to_string(),
        }
        .log();
    }

    /// A fresh id tying together the events of one transfer.
    pub fn generate_correlation_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn read_request(
        client_addr: SocketAddr,
        filename: &str,
        mode: &str,
        options: serde_json::Value,
        correlation_id: &str,
    ) {
        AuditEvent::ReadRequest {
            common: CommonFields::with_correlation("info", correlation_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            mode: mode.to_string(),
            options,
        }
        .log();
    }

    pub fn read_denied(
        client_addr: SocketAddr,
        filename: &str,
        reason: &str,
        correlation_id: &str,
    ) {
        AuditEvent::ReadDenied {
            common: CommonFields::with_correlation("warn", correlation_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn transfer_started(
        client_addr: SocketAddr,
        filename: &str,
        file_size: u64,
        block_size: usize,
        correlation_id: &str,
    ) {
        AuditEvent::TransferStarted {
            common: CommonFields::with_correlation("info", correlation_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            file_size,
            block_size,
        }
        .log();
    }

    pub fn transfer_completed(
        client_addr: SocketAddr,
        filename: &str,
        bytes_transferred: u64,
        blocks_sent: u64,
        duration_ms: u64,
        correlation_id: &str,
    ) {
        let throughput_bps = if duration_ms > 0 {
            (bytes_transferred * 1000) / duration_ms
        } else {
            0
        };

        AuditEvent::TransferCompleted {
            common: CommonFields::with_correlation("info", correlation_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            bytes_transferred,
            blocks_sent,
            duration_ms,
            throughput_bps,
        }
        .log();
    }

    pub fn transfer_failed(
        client_addr: SocketAddr,
        filename: &str,
        error: &str,
        blocks_sent: u64,
        correlation_id: &str,
    ) {
        AuditEvent::TransferFailed {
            common: CommonFields::with_correlation("error", correlation_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            error: error.to_string(),
            blocks_sent,
        }
        .log();
    }

    pub fn session_timeout(client_addr: SocketAddr, idle_secs: u64) {
        AuditEvent::SessionTimeout {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            idle_secs,
        }
        .log();
    }

    pub fn protocol_violation(client_addr: SocketAddr, violation: &str) {
        AuditEvent::ProtocolViolation {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            violation: violation.to_string(),
        }
        .log();
    }

    pub fn configuration_loaded(config_file: &Path) {
        AuditEvent::ConfigurationLoaded {
            common: CommonFields::new("info"),
            config_file: config_file.display().to_string(),
        }
        .log();
    }
}
