//! Transport level behavior against the scripted server.

mod common;

use common::{client_config, connect, connect_with, init_tracing, MockServer};
use std::sync::Arc;
use tern_platform::TernError;
use tern_proto::ssh::buffer::Buffer;
use tern_proto::ssh::hostkey::{FingerprintVerifier, Signer};
use tern_proto::ssh::message::MessageType;
use tern_proto::ssh::transport::disconnect_payload;
use tern_proto::ssh::DisconnectReason;

#[tokio::test]
async fn test_handshake_establishes_session() {
    let (client, server) = connect().await;

    let transport = client.transport();
    assert!(transport.is_open());
    assert_eq!(transport.kex_count(), 1);
    assert_eq!(transport.server_version().to_string(), common::SERVER_VERSION);
    assert_eq!(transport.session_id().as_deref(), server.session_id());
    assert_eq!(
        client.server_host_key_fingerprint(),
        Some(server.host_key().public_key().fingerprint())
    );
    assert!(!client.is_authenticated());
}

#[tokio::test]
async fn test_host_key_rejected_by_verifier() {
    init_tracing();
    let verifier = Arc::new(FingerprintVerifier::new(["SHA256:not-the-server-key"]));
    let (client, _server) = connect_with(client_config(), verifier).await;

    match client {
        Err(TernError::Disconnect { code, .. }) => {
            assert_eq!(code, DisconnectReason::HostKeyNotVerifiable.code())
        }
        other => panic!("expected host key rejection, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_host_key_accepted_by_fingerprint() {
    init_tracing();
    // the mock server's key is deterministic
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let server = MockServer::new(server_io);
    let fingerprint = server.host_key().public_key().fingerprint();
    let verifier = Arc::new(FingerprintVerifier::new([fingerprint]));

    let (client, server) = tokio::join!(
        tern_proto::ssh::SshClient::connect_stream(client_io, "mock", 22, client_config(), verifier),
        server.handshake()
    );
    assert!(client.unwrap().is_open());
    assert_eq!(server.unwrap().kex_rounds, 1);
}

#[tokio::test]
async fn test_client_initiated_rekey_keeps_session_id() {
    let (client, mut server) = connect().await;
    let session_id = client.transport().session_id();

    let server_side = async {
        let kexinit = server.expect(MessageType::KexInit).await?;
        server.kex(Some(kexinit.body.into_vec())).await?;
        Ok::<_, TernError>(server)
    };
    let (rekeyed, server) = tokio::join!(client.rekey(), server_side);
    rekeyed.unwrap();
    let mut server = server.unwrap();

    assert_eq!(client.transport().kex_count(), 2);
    assert_eq!(client.transport().session_id(), session_id);

    // traffic still flows under the new keys
    server
        .send(&disconnect_payload(DisconnectReason::ByApplication, "done"))
        .await
        .unwrap();
    let err = client.transport().closed().await;
    assert!(matches!(err, TernError::Disconnect { code: 11, .. }));
}

#[tokio::test]
async fn test_server_initiated_rekey() {
    let (client, mut server) = connect().await;

    server.kex(None).await.unwrap();
    assert_eq!(server.kex_rounds, 2);

    // the client has switched both directions once it answers a request
    let mut ping = Buffer::for_message(MessageType::Debug);
    ping.put_bool(false).put_str("still here").put_str("");
    server.send(ping.as_slice()).await.unwrap();
    server.send(&[200]).await.unwrap();
    let reply = server.expect(MessageType::Unimplemented).await.unwrap();
    assert!(reply.seq > 0);
    assert_eq!(client.transport().kex_count(), 2);
}

#[tokio::test]
async fn test_unknown_message_answered_with_unimplemented() {
    let (_client, mut server) = connect().await;

    let seq = server.next_seq();
    server.send(&[150, 1, 2, 3]).await.unwrap();

    let mut reply = server.expect(MessageType::Unimplemented).await.unwrap();
    assert_eq!(reply.body.read_u32().unwrap(), seq);
}

#[tokio::test]
async fn test_peer_disconnect_surfaces_reason() {
    let (client, mut server) = connect().await;

    server
        .send(&disconnect_payload(DisconnectReason::TooManyConnections, "busy"))
        .await
        .unwrap();

    match client.transport().closed().await {
        TernError::Disconnect { code, message } => {
            assert_eq!(code, 12);
            assert_eq!(message, "busy");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!client.is_open());
    assert!(client.open_session().await.is_err());
}

#[tokio::test]
async fn test_client_disconnect_notifies_peer() {
    let (client, mut server) = connect().await;

    client.disconnect().await.unwrap();
    let mut msg = server.expect(MessageType::Disconnect).await.unwrap();
    assert_eq!(msg.body.read_u32().unwrap(), DisconnectReason::ByApplication.code());
    assert!(!client.is_open());

    // closing twice is a no-op
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_connection_loss_is_terminal() {
    let (client, server) = connect().await;

    server.hang_up().await;
    let err = client.transport().closed().await;
    assert!(matches!(err, TernError::Closed(_) | TernError::Io(_)));
    assert_eq!(client.transport().error().map(|e| e.to_string()), Some(err.to_string()));
}
