//! End-to-end transfers through the listening server.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use wren_tftp::{ErrorCode, MAX_PACKET_SIZE, Packet, TftpConfig, TftpOption, TftpServer};

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

async fn start_server(
    root: &std::path::Path,
) -> std::result::Result<SocketAddr, Box<dyn std::error::Error>> {
    let mut config = TftpConfig {
        root_dir: root.to_path_buf(),
        bind_addr: "127.0.0.1:0".parse()?,
        ..Default::default()
    };
    config.session.inactivity_timeout_secs = 1;
    config.logging.audit_enabled = false;

    let server = TftpServer::bind(&config).await?;
    let addr = server.local_addr()?;
    tokio::spawn(async move { server.run().await });
    Ok(addr)
}

async fn recv(
    client: &UdpSocket,
) -> std::result::Result<(Packet, SocketAddr), Box<dyn std::error::Error>> {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let (len, from) = tokio::time::timeout(RECV_TIMEOUT, client.recv_from(&mut buf)).await??;
    Ok((Packet::decode(&buf[..len])?, from))
}

fn rrq(filename: &str, options: Vec<TftpOption>) -> Packet {
    Packet::ReadRequest {
        filename: filename.to_string(),
        mode: "octet".to_string(),
        options,
    }
}

#[tokio::test]
async fn transfer_runs_on_a_fresh_port() -> TestResult {
    let root = tempfile::tempdir()?;
    let content: Vec<u8> = (0..1500u32).map(|i| (i % 253) as u8).collect();
    std::fs::write(root.path().join("pxelinux.0"), &content)?;
    let server = start_server(root.path()).await?;

    let client = UdpSocket::bind("127.0.0.1:0").await?;
    client
        .send_to(&rrq("pxelinux.0", vec![]).encode()?, server)
        .await?;

    let mut received = Vec::new();
    let (mut packet, session) = recv(&client).await?;
    assert_ne!(session, server, "transfer must not use the listening port");

    loop {
        let Packet::Data { block, payload } = packet else {
            panic!("expected DATA, got {:?}", packet);
        };
        received.extend_from_slice(&payload);
        client
            .send_to(&Packet::Ack { block }.encode()?, session)
            .await?;
        if payload.len() < 512 {
            break;
        }
        let (next, from) = recv(&client).await?;
        assert_eq!(from, session);
        packet = next;
    }

    assert_eq!(received, content);
    Ok(())
}

#[tokio::test]
async fn concurrent_clients_get_separate_sessions() -> TestResult {
    let root = tempfile::tempdir()?;
    std::fs::write(root.path().join("a.img"), vec![b'a'; 100])?;
    std::fs::write(root.path().join("b.img"), vec![b'b'; 100])?;
    let server = start_server(root.path()).await?;

    let first = UdpSocket::bind("127.0.0.1:0").await?;
    let second = UdpSocket::bind("127.0.0.1:0").await?;
    first.send_to(&rrq("a.img", vec![]).encode()?, server).await?;
    second.send_to(&rrq("b.img", vec![]).encode()?, server).await?;

    let (a, a_from) = recv(&first).await?;
    let (b, b_from) = recv(&second).await?;
    assert_ne!(a_from, b_from);
    assert!(matches!(a, Packet::Data { block: 1, ref payload } if payload[..] == [b'a'; 100]));
    assert!(matches!(b, Packet::Data { block: 1, ref payload } if payload[..] == [b'b'; 100]));
    Ok(())
}

#[tokio::test]
async fn negotiated_transfer_through_server() -> TestResult {
    let root = tempfile::tempdir()?;
    std::fs::write(root.path().join("grub.efi"), vec![7u8; 5000])?;
    let server = start_server(root.path()).await?;

    let client = UdpSocket::bind("127.0.0.1:0").await?;
    client
        .send_to(
            &rrq("grub.efi", vec![TftpOption::new("blksize", "1468")]).encode()?,
            server,
        )
        .await?;

    let (oack, session) = recv(&client).await?;
    assert_eq!(
        oack,
        Packet::OptionAck {
            options: vec![TftpOption::new("blksize", "1468")],
        }
    );

    client.send_to(&Packet::Ack { block: 0 }.encode()?, session).await?;
    match recv(&client).await?.0 {
        Packet::Data { block, payload } => {
            assert_eq!(block, 1);
            assert_eq!(payload.len(), 1468);
        }
        other => panic!("expected DATA, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn missing_file_is_reported_from_session_port() -> TestResult {
    let root = tempfile::tempdir()?;
    let server = start_server(root.path()).await?;

    let client = UdpSocket::bind("127.0.0.1:0").await?;
    client
        .send_to(&rrq("absent.cfg", vec![]).encode()?, server)
        .await?;

    let (packet, from) = recv(&client).await?;
    assert_ne!(from, server);
    match packet {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::FileNotFound),
        other => panic!("expected ERROR, got {:?}", other),
    }
    Ok(())
}
