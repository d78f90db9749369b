// Wren TFTP daemon

use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use wren_tftp::audit::AuditLogger;
use wren_tftp::config::{LogFormat, LoggingConfig, load_config, validate_config, write_config};
use wren_tftp::{Result, TftpConfig, TftpError, TftpServer};

#[derive(Parser, Debug)]
#[command(name = "wren-tftpd", about = "Read-only TFTP server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/wren/tftp.toml")]
    config: PathBuf,

    /// Write a default TOML configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Create the root directory if it does not exist
    #[arg(long)]
    create_root_dir: bool,

    /// Root directory to serve files from
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Bind address for the TFTP server
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Seconds of client silence before a session is dropped
    #[arg(long)]
    inactivity_timeout_secs: Option<u64>,

    /// Resends of an unacknowledged block before giving up
    #[arg(long)]
    max_retransmits: Option<u32>,

    /// Log filter, e.g. "debug" or "wren_tftp=trace"
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

fn init_logging(
    logging: &LoggingConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let (writer, guard) = match logging.file {
        Some(ref log_file) => {
            let dir = log_file.parent().unwrap_or_else(|| Path::new("."));
            let file_name = log_file
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| {
                    TftpError::Config("logging.file must include a file name".to_string())
                })?;
            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let filter = EnvFilter::new(logging.level.clone());
    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .init(),
    }

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_exists = cli.config.exists();
    let mut config = if config_exists {
        load_config(&cli.config)?
    } else {
        TftpConfig::default()
    };

    if let Some(root_dir) = cli.root_dir {
        config.root_dir = root_dir;
    }
    if let Some(bind_addr) = cli.bind {
        config.bind_addr = bind_addr;
    }
    if let Some(secs) = cli.inactivity_timeout_secs {
        config.session.inactivity_timeout_secs = secs;
    }
    if let Some(retransmits) = cli.max_retransmits {
        config.session.max_retransmits = retransmits;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    if cli.init_config {
        write_config(&cli.config, &config)?;
        if cli.create_root_dir {
            tokio::fs::create_dir_all(&config.root_dir).await?;
        }
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.create_root_dir {
        tokio::fs::create_dir_all(&config.root_dir).await?;
    }

    if cli.check_config {
        validate_config(&config, false)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    validate_config(&config, true)?;

    let _log_guard = init_logging(&config.logging)?;

    if config_exists {
        if config.logging.audit_enabled {
            AuditLogger::configuration_loaded(&cli.config);
        }
    } else {
        warn!(
            "Config file {} not found, using defaults",
            cli.config.display()
        );
    }
    info!("Serving files from {}", config.root_dir.display());

    let server = TftpServer::bind(&config).await?;

    tokio::select! {
        result = server.run() => result,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Received interrupt, shutting down");
            if config.logging.audit_enabled {
                AuditLogger::server_shutdown("interrupt");
            }
            Ok(())
        }
    }
}
