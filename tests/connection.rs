//! End-to-end exercises: real handshakes, framed messages, dispatch,
//! cancellation, and server accept loops.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use smb_session::netbios::encode_name;
use smb_session::protocol::{SmbCommand, SmbHeader, SMB_HEADER_LEN};
use smb_session::registry::SessionRegistry;
use smb_session::transport::TransportKind;
use smb_session::{
    AuthRequest, AuthResponse, Authenticator, CommandDispatcher, Connection, Request,
    ServerConfig, Session, SmbResult, SmbServer, WorkerPool,
};

struct NoopAuthenticator;

#[async_trait]
impl Authenticator for NoopAuthenticator {
    async fn authenticate(&self, _request: &AuthRequest) -> SmbResult<AuthResponse> {
        unreachable!("not exercised here")
    }
}

/// Echoes every command back; READ_ANDX blocks until canceled or granted.
struct TestDispatcher;

#[async_trait]
impl CommandDispatcher for TestDispatcher {
    async fn dispatch(
        &self,
        _session: &Arc<Session>,
        request: &Arc<Request>,
    ) -> SmbResult<Option<Bytes>> {
        if request.header.command == SmbCommand::ReadAndx.as_u8() {
            request.wait_on_lock().await?;
        }
        Ok(Some(request.buf.clone()))
    }
}

fn message(command: SmbCommand, pid: u16, mid: u16, body: &[u8]) -> Vec<u8> {
    let mut header = SmbHeader::new_request(command.as_u8());
    header.pid = pid;
    header.mid = mid;

    let mut buf = BytesMut::with_capacity(SMB_HEADER_LEN + body.len());
    header.encode(&mut buf);
    buf.put_slice(body);
    buf.to_vec()
}

fn direct_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut frame = vec![0, (len >> 16) as u8, (len >> 8) as u8, len as u8];
    frame.extend_from_slice(payload);
    frame
}

fn netbios_frame(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut frame = vec![
        frame_type,
        ((len >> 16) & 1) as u8,
        (len >> 8) as u8,
        len as u8,
    ];
    frame.extend_from_slice(payload);
    frame
}

fn session_request() -> Vec<u8> {
    let mut payload = encode_name("fileserver", 0x20);
    payload.extend(encode_name("client1", 0x00));
    payload
}

fn make_connection(
    kind: TransportKind,
) -> (
    Arc<Session>,
    tokio::io::DuplexStream,
    tokio::task::JoinHandle<SmbResult<()>>,
    Arc<SessionRegistry>,
) {
    let (client, server) = tokio::io::duplex(1 << 20);
    let registry = SessionRegistry::new(5400);
    let pool = WorkerPool::new(8, Arc::new(TestDispatcher));
    let connection = Connection::new(
        server,
        kind,
        "10.0.0.1:139".parse().unwrap(),
        "10.0.0.2:50000".parse().unwrap(),
        registry.clone(),
        pool,
        Arc::new(NoopAuthenticator),
        &ServerConfig::new(),
    );
    let session = connection.session().clone();
    let handle = tokio::spawn(connection.run());
    (session, client, handle, registry)
}

#[tokio::test]
async fn netbios_session_full_exchange() {
    let (session, mut client, handle, registry) = make_connection(TransportKind::NetBios);

    // opening exchange
    client
        .write_all(&netbios_frame(0x81, &session_request()))
        .await
        .unwrap();
    let mut response = [0u8; 4];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(response[0], 0x82);
    assert_eq!(session.client_name(), "CLIENT1");

    // a keep-alive frame is tolerated and refreshes the idle budget
    client.write_all(&netbios_frame(0x85, &[])).await.unwrap();

    // an echo round trip
    let msg = message(SmbCommand::Echo, 100, 1, b"payload");
    client.write_all(&netbios_frame(0x00, &msg)).await.unwrap();

    let mut reply_header = [0u8; 4];
    client.read_exact(&mut reply_header).await.unwrap();
    let len = u32::from_be_bytes(reply_header) & 0x1FFFF;
    assert_eq!(len as usize, msg.len());
    let mut reply = vec![0u8; len as usize];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, msg);

    let (rx, tx) = session.byte_counts();
    assert!(rx > 0 && tx > 0);

    drop(client);
    handle.await.unwrap().unwrap();
    assert!(registry.is_empty());
}

#[tokio::test]
async fn message_before_handshake_is_refused() {
    let (_session, mut client, handle, registry) = make_connection(TransportKind::NetBios);

    let msg = message(SmbCommand::Echo, 100, 1, b"");
    client.write_all(&netbios_frame(0x00, &msg)).await.unwrap();

    assert!(handle.await.unwrap().is_err());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn parallel_circuits_from_one_client_all_survive() {
    let registry = SessionRegistry::new(5400);
    let pool = WorkerPool::new(8, Arc::new(TestDispatcher));

    let mut clients = Vec::new();
    let mut sessions = Vec::new();
    for port in [50000u16, 50001] {
        let (client, server) = tokio::io::duplex(1 << 20);
        let connection = Connection::new(
            server,
            TransportKind::NetBios,
            "10.0.0.1:139".parse().unwrap(),
            format!("10.0.0.2:{port}").parse().unwrap(),
            registry.clone(),
            pool.clone(),
            Arc::new(NoopAuthenticator),
            &ServerConfig::new(),
        );
        sessions.push(connection.session().clone());
        tokio::spawn(connection.run());
        clients.push(client);
    }

    // both circuits handshake with the same workstation name
    for client in clients.iter_mut() {
        client
            .write_all(&netbios_frame(0x81, &session_request()))
            .await
            .unwrap();
        let mut response = [0u8; 4];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[0], 0x82);
    }

    // with no single-VC declaration the earlier circuit keeps working
    let msg = message(SmbCommand::Echo, 1, 1, b"first circuit");
    clients[0]
        .write_all(&netbios_frame(0x00, &msg))
        .await
        .unwrap();
    let mut reply_header = [0u8; 4];
    clients[0].read_exact(&mut reply_header).await.unwrap();
    let len = u32::from_be_bytes(reply_header) & 0x1FFFF;
    let mut reply = vec![0u8; len as usize];
    clients[0].read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, msg);
    assert_eq!(registry.len(), 2);

    // once the client declares the second circuit its only one, the
    // first becomes stale and is dropped
    sessions[1].declare_sole_connection();
    registry.reconnection_check(&sessions[1]).await;
    while registry.len() > 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(registry.lookup(sessions[1].id).is_some());
    assert!(registry.lookup(sessions[0].id).is_none());
}

#[tokio::test]
async fn cancel_unblocks_waiting_request() {
    let (session, mut client, handle, _registry) = make_connection(TransportKind::DirectTcp);

    // READ_ANDX blocks in the dispatcher until granted or canceled
    let blocked = message(SmbCommand::ReadAndx, 200, 7, b"");
    client.write_all(&direct_frame(&blocked)).await.unwrap();

    // give the worker time to park
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.requests.len(), 1);

    // a cancel for the same pid/mid releases it without a reply
    let cancel = message(SmbCommand::NtCancel, 200, 7, b"");
    client.write_all(&direct_frame(&cancel)).await.unwrap();

    session.requests.wait_empty().await;

    // the connection still works afterwards
    let msg = message(SmbCommand::Echo, 200, 8, b"still here");
    client.write_all(&direct_frame(&msg)).await.unwrap();
    let mut reply_header = [0u8; 4];
    client.read_exact(&mut reply_header).await.unwrap();
    let len = u32::from_be_bytes(reply_header);
    let mut reply = vec![0u8; len as usize];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, msg);

    drop(client);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_for_unknown_mid_is_harmless() {
    let (_session, mut client, handle, _registry) = make_connection(TransportKind::DirectTcp);

    let cancel = message(SmbCommand::NtCancel, 1, 99, b"");
    client.write_all(&direct_frame(&cancel)).await.unwrap();

    let msg = message(SmbCommand::Echo, 1, 100, b"ok");
    client.write_all(&direct_frame(&msg)).await.unwrap();
    let mut reply_header = [0u8; 4];
    client.read_exact(&mut reply_header).await.unwrap();
    let len = u32::from_be_bytes(reply_header);
    let mut reply = vec![0u8; len as usize];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, msg);

    drop(client);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn teardown_drains_blocked_requests() {
    let (session, mut client, handle, registry) = make_connection(TransportKind::DirectTcp);

    let blocked = message(SmbCommand::ReadAndx, 300, 1, b"");
    client.write_all(&direct_frame(&blocked)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.requests.len(), 1);

    // closing the connection cancels the parked request and drains the list
    drop(client);
    handle.await.unwrap().unwrap();
    assert!(session.requests.is_empty());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn server_accepts_direct_connections() {
    let config = ServerConfig::new()
        .direct("127.0.0.1:0".parse().unwrap())
        .disable_netbios();
    let server = SmbServer::new(config, Arc::new(NoopAuthenticator), Arc::new(TestDispatcher));
    let running = server.clone();
    tokio::spawn(running.run());

    let addr = loop {
        if let Some(addr) = server.direct_local_addr() {
            break addr;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    let mut client = TcpStream::connect(addr).await.unwrap();
    let msg = message(SmbCommand::Echo, 10, 1, b"over tcp");
    client.write_all(&direct_frame(&msg)).await.unwrap();

    let mut reply_header = [0u8; 4];
    client.read_exact(&mut reply_header).await.unwrap();
    let len = u32::from_be_bytes(reply_header);
    let mut reply = vec![0u8; len as usize];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, msg);

    assert_eq!(server.registry().len(), 1);
    server.stop().await;
}

#[tokio::test]
async fn server_runs_session_service_listener() {
    let config = ServerConfig::new()
        .direct("127.0.0.1:0".parse().unwrap())
        .netbios("127.0.0.1:0".parse().unwrap());
    let server = SmbServer::new(config, Arc::new(NoopAuthenticator), Arc::new(TestDispatcher));
    let running = server.clone();
    tokio::spawn(running.run());

    let addr = loop {
        if let Some(addr) = server.netbios_local_addr() {
            break addr;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&netbios_frame(0x81, &session_request()))
        .await
        .unwrap();
    let mut response = [0u8; 4];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(response[0], 0x82);

    server.stop().await;
}
