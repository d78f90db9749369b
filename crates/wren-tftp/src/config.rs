use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TftpError};
use crate::session::SessionConfig;
use crate::{DEFAULT_TIMEOUT_SECS, TFTP_PORT};

/// Daemon configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    pub root_dir: PathBuf,
    pub bind_addr: SocketAddr,
    pub session: SessionSettings,
    pub logging: LoggingConfig,
    /// Maximum file size in bytes that can be served (default: 100MB)
    /// Set to 0 for unlimited
    pub max_file_size_bytes: u64,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/srv/tftp"),
            bind_addr: SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), TFTP_PORT),
            session: SessionSettings::default(),
            logging: LoggingConfig::default(),
            max_file_size_bytes: 104_857_600,
        }
    }
}

impl TftpConfig {
    /// The slice of configuration a single session needs.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            inactivity_timeout: Duration::from_secs(self.session.inactivity_timeout_secs),
            max_retransmits: self.session.max_retransmits,
            max_file_size_bytes: self.max_file_size_bytes,
            audit_enabled: self.logging.audit_enabled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Seconds to wait for the next client datagram before ending the session
    pub inactivity_timeout_secs: u64,
    /// Resends of an unacknowledged block before giving up (0 disables)
    pub max_retransmits: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retransmits: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    /// Emit structured audit events alongside regular logs
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            audit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// One JSON object per line, for log aggregators
    Json,
}

pub fn load_config(path: &Path) -> Result<TftpConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TftpConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Config(format!("Invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &TftpConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Check the configuration before the server binds anything.
///
/// With `validate_bind` set, also confirm `bind_addr` can be bound right now.
pub fn validate_config(config: &TftpConfig, validate_bind: bool) -> Result<()> {
    if !config.root_dir.is_absolute() {
        return Err(TftpError::Config(
            "root_dir must be an absolute path".to_string(),
        ));
    }

    match std::fs::metadata(&config.root_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TftpError::Config("root_dir must be a directory".to_string()));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TftpError::Config(
                "root_dir does not exist; create it or adjust config".to_string(),
            ));
        }
        Err(e) => return Err(TftpError::Io(e)),
    }

    if let Err(e) = std::fs::read_dir(&config.root_dir) {
        return Err(TftpError::Config(format!("root_dir is not readable: {}", e)));
    }

    if config.bind_addr.port() == 0 {
        return Err(TftpError::Config(
            "bind_addr port must be non-zero".to_string(),
        ));
    }

    if validate_bind && let Err(e) = std::net::UdpSocket::bind(config.bind_addr) {
        return Err(TftpError::Config(format!(
            "bind_addr is not available: {}",
            e
        )));
    }

    // RFC 2349 bounds a negotiated timeout to 1-255 seconds; keep ours inside it
    if !(1..=255).contains(&config.session.inactivity_timeout_secs) {
        return Err(TftpError::Config(
            "session.inactivity_timeout_secs must be in range 1-255".to_string(),
        ));
    }

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            TftpError::Config("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(TftpError::Config(
                        "logging.file parent must be a directory".to_string(),
                    ));
                }
            }
            Err(e) => {
                return Err(TftpError::Config(format!(
                    "logging.file parent error: {}",
                    e
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> std::io::Result<PathBuf> {
        let mut dir = std::env::temp_dir();
        dir.push(format!("wren_tftp_test_{}_{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    #[test]
    fn parses_minimal_toml() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let root_dir = temp_dir("parse")?;
        let log_dir = temp_dir("parse_log")?;
        let toml = format!(
            r#"
root_dir = "{}"
bind_addr = "127.0.0.1:6969"

[session]
inactivity_timeout_secs = 3

[logging]
file = "{}/tftp.log"
format = "json"
"#,
            root_dir.display(),
            log_dir.display()
        );
        let config: TftpConfig = toml::from_str(&toml)?;
        validate_config(&config, false)?;

        assert_eq!(config.session.inactivity_timeout_secs, 3);
        assert_eq!(config.session.max_retransmits, 0);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.max_file_size_bytes, 104_857_600);
        Ok(())
    }

    #[test]
    fn write_then_load_preserves_values() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = temp_dir("roundtrip")?;
        let path = dir.join("tftp.toml");

        let mut config = TftpConfig::default();
        config.root_dir = dir.clone();
        config.session.max_retransmits = 4;
        write_config(&path, &config)?;

        let loaded = load_config(&path)?;
        assert_eq!(loaded.root_dir, dir);
        assert_eq!(loaded.session.max_retransmits, 4);
        assert_eq!(loaded.bind_addr, config.bind_addr);
        Ok(())
    }

    #[test]
    fn session_config_reflects_settings() {
        let mut config = TftpConfig::default();
        config.session.inactivity_timeout_secs = 9;
        config.session.max_retransmits = 2;
        config.max_file_size_bytes = 0;
        config.logging.audit_enabled = false;

        let session = config.session_config();
        assert_eq!(session.inactivity_timeout, Duration::from_secs(9));
        assert_eq!(session.max_retransmits, 2);
        assert_eq!(session.max_file_size_bytes, 0);
        assert!(!session.audit_enabled);
    }

    #[test]
    fn rejects_non_absolute_root_dir() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let config = TftpConfig {
            root_dir: PathBuf::from("relative/path"),
            ..Default::default()
        };
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for relative root_dir".into()),
            Err(err) => {
                assert!(format!("{err}").contains("root_dir must be an absolute path"));
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_missing_root_dir() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let config = TftpConfig {
            root_dir: PathBuf::from("/nonexistent/wren-tftp"),
            ..Default::default()
        };
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for missing root_dir".into()),
            Err(err) => {
                assert!(format!("{err}").contains("root_dir does not exist"));
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_zero_bind_port() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("bind")?;
        config.bind_addr = "127.0.0.1:0".parse()?;
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for zero bind port".into()),
            Err(err) => {
                assert!(format!("{err}").contains("bind_addr port must be non-zero"));
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_timeout() -> std::result::Result<(), Box<dyn std::error::Error>> {
        for secs in [0, 256] {
            let mut config = TftpConfig::default();
            config.root_dir = temp_dir("timeout")?;
            config.session.inactivity_timeout_secs = secs;
            match validate_config(&config, false) {
                Ok(()) => return Err(format!("expected error for timeout {secs}").into()),
                Err(err) => {
                    assert!(format!("{err}").contains("inactivity_timeout_secs"));
                }
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_logging_file_with_missing_parent()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("logfile")?;
        config.logging.file = Some(PathBuf::from("/nonexistent/wren-tftp/log.txt"));
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for logging.file parent".into()),
            Err(err) => {
                assert!(format!("{err}").contains("logging.file parent error"));
            }
        }
        Ok(())
    }

    #[test]
    fn validates_bind_addr_availability_on_free_port()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let port = socket.local_addr()?.port();
        drop(socket);

        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("bind-available")?;
        config.bind_addr = format!("127.0.0.1:{port}").parse()?;
        validate_config(&config, true)?;
        Ok(())
    }

    #[test]
    fn rejects_bind_addr_when_in_use() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let port = socket.local_addr()?.port();

        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("bind-in-use")?;
        config.bind_addr = format!("127.0.0.1:{port}").parse()?;
        match validate_config(&config, true) {
            Ok(()) => return Err("expected error for bind_addr in use".into()),
            Err(err) => {
                assert!(format!("{err}").contains("bind_addr is not available"));
            }
        }
        Ok(())
    }
}
