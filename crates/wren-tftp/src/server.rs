use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, error, info};

use crate::MAX_PACKET_SIZE;
use crate::audit::AuditLogger;
use crate::config::TftpConfig;
use crate::error::Result;
use crate::path::{PathResolver, RootJail};
use crate::session::{Session, SessionConfig};

/// Listens for initial requests and spawns one session task per client.
pub struct TftpServer {
    socket: Arc<UdpSocket>,
    root_dir: PathBuf,
    session_config: SessionConfig,
    resolver: Arc<dyn PathResolver>,
}

impl TftpServer {
    pub async fn bind(config: &TftpConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        info!("TFTP server listening on {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            root_dir: config.root_dir.clone(),
            session_config: config.session_config(),
            resolver: Arc::new(RootJail),
        })
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn PathResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Accept clients until the listening socket fails.
    pub async fn run(&self) -> Result<()> {
        let local = self.socket.local_addr()?;
        if self.session_config.audit_enabled {
            AuditLogger::server_started(local, &self.root_dir);
        }

        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((size, client_addr)) => {
                    let data = buf[..size].to_vec();
                    let root_dir = self.root_dir.clone();
                    let config = self.session_config;
                    let resolver = Arc::clone(&self.resolver);

                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::serve_client(data, client_addr, local, root_dir, config, resolver)
                                .await
                        {
                            error!("Error handling TFTP client {}: {}", client_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error receiving TFTP packet: {}", e);
                }
            }
        }
    }

    async fn serve_client(
        data: Vec<u8>,
        client_addr: SocketAddr,
        local: SocketAddr,
        root_dir: PathBuf,
        config: SessionConfig,
        resolver: Arc<dyn PathResolver>,
    ) -> Result<()> {
        // RFC 1350: each transfer gets its own TID, i.e. a new local port
        let socket = UdpSocket::bind(ephemeral_addr(local)).await?;
        let session = Session::new(Arc::new(socket), root_dir, config)?.with_resolver(resolver);

        debug!(
            "Session for {} on {}",
            client_addr,
            session.local_addr()?
        );
        let outcome = session.run_with_request(&data, client_addr).await?;
        debug!("Session for {} ended: {:?}", client_addr, outcome);
        Ok(())
    }
}

/// Same interface as the listener, any free port.
fn ephemeral_addr(local: SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        ip if !ip.is_unspecified() => ip,
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}
