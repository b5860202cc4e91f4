//! Authentication against the scripted server.

mod common;

use common::{connect, connect_with, MockServer, PASSWORD, USER};
use std::sync::Arc;
use std::time::Duration;
use tern_platform::{SeededRandom, TernError, TernResult};
use tern_proto::ssh::auth::signature_data;
use tern_proto::ssh::buffer::Buffer;
use tern_proto::ssh::hostkey::{verify_signature, AcceptAnyHostKey, Ed25519Signer, PublicKey, Signer};
use tern_proto::ssh::message::MessageType;
use tern_proto::ssh::userauth::{AuthMethod, PasswordResponder};
use tern_proto::ssh::{SshClient, SshConfig};

/// Connects with a short wait bound so authentication attempts time out quickly.
async fn connect_impatient() -> (SshClient, MockServer) {
    let config = SshConfig::builder()
        .with_timeout(Duration::from_millis(500))
        .with_random(SeededRandom::shared(1))
        .build()
        .unwrap();
    let (client, server) = connect_with(config, Arc::new(AcceptAnyHostKey)).await;
    (client.unwrap(), server.unwrap())
}

/// Reads a publickey request and checks its signature.
async fn verify_publickey_request(server: &mut MockServer) -> TernResult<PublicKey> {
    let msg = server.expect(MessageType::UserauthRequest).await?;
    let payload = msg.body.as_slice().to_vec();
    let mut body = msg.body;
    assert_eq!(body.read_string()?, USER);
    assert_eq!(body.read_string()?, "ssh-connection");
    assert_eq!(body.read_string()?, "publickey");
    assert!(body.read_bool()?);
    assert_eq!(body.read_string()?, "ssh-ed25519");
    let key = PublicKey::from_blob(&body.read_bytes()?)?;
    let signed_len = body.rpos();
    let signature = body.read_bytes()?;

    let session_id = server.session_id().map(<[u8]>::to_vec).unwrap_or_default();
    verify_signature(&key, &signature_data(&session_id, &payload[..signed_len]), &signature)?;
    Ok(key)
}

#[tokio::test]
async fn test_failure_narrows_allowed_methods() {
    let (client, mut server) = connect().await;
    let signer = Arc::new(Ed25519Signer::generate(&SeededRandom::new(11)));
    let methods = [
        AuthMethod::Password("wrong".to_string()),
        AuthMethod::KeyboardInteractive(Arc::new(PasswordResponder::new("wrong"))),
        AuthMethod::PublicKey(signer.clone()),
    ];

    let server_side = async {
        server.accept_service("ssh-userauth").await?;
        let request = server.recv_auth_request().await?;
        assert_eq!(request.method, "password");
        server.send_auth_failure(&["publickey"], false).await?;

        // keyboard-interactive is no longer allowed and must be skipped
        let key = verify_publickey_request(&mut server).await?;
        server.send_auth_success().await?;
        Ok::<_, TernError>(key)
    };
    let (auth, key) = tokio::join!(client.authenticate(USER, &methods), server_side);

    auth.unwrap();
    assert_eq!(key.unwrap(), signer.public_key());
    assert!(client.is_authenticated());
    assert_eq!(client.username(), Some(USER));
    assert_eq!(
        client.transport().active_service_name().as_deref(),
        Some("ssh-connection")
    );
}

#[tokio::test]
async fn test_exhausted_methods_report_most_recent_first() {
    let (client, mut server) = connect().await;
    let methods = [
        AuthMethod::Password("bad".to_string()),
        AuthMethod::KeyboardInteractive(Arc::new(PasswordResponder::new("bad"))),
    ];

    let server_side = async {
        server.accept_service("ssh-userauth").await?;
        let first = server.recv_auth_request().await?;
        assert_eq!(first.method, "password");
        server
            .send_auth_failure(&["password", "keyboard-interactive"], false)
            .await?;
        let second = server.recv_auth_request().await?;
        assert_eq!(second.method, "keyboard-interactive");
        server.send_auth_failure(&["password"], false).await
    };
    let (auth, served) = tokio::join!(client.authenticate(USER, &methods), server_side);
    served.unwrap();

    match auth {
        Err(err @ TernError::Auth { .. }) => {
            let recent = err.most_recent_cause().map(|e| e.to_string()).unwrap();
            assert!(recent.contains("keyboard-interactive auth failed"), "{}", recent);
            if let TernError::Auth { causes, .. } = &err {
                assert_eq!(causes.len(), 2);
                assert!(causes[1].to_string().contains("password auth failed"));
            }
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }
    assert!(client.is_open());
    assert!(!client.is_authenticated());
}

#[tokio::test]
async fn test_keyboard_interactive_challenge() {
    let (client, mut server) = connect().await;

    let server_side = async {
        server.accept_service("ssh-userauth").await?;

        let mut banner = Buffer::for_message(MessageType::UserauthBanner);
        banner.put_str("Authorized use only\n").put_str("");
        server.send(banner.as_slice()).await?;

        let first = server.recv_auth_request().await?;
        assert_eq!(first.method, "password");
        server.send_auth_failure(&["keyboard-interactive"], false).await?;

        let request = server.recv_auth_request().await?;
        assert_eq!(request.method, "keyboard-interactive");

        let mut challenge = Buffer::for_message(MessageType::Userauth60);
        challenge
            .put_str("")
            .put_str("")
            .put_str("")
            .put_u32(2)
            .put_str("Password: ")
            .put_bool(false)
            .put_str("Verification code: ")
            .put_bool(true);
        server.send(challenge.as_slice()).await?;

        let mut response = server.expect(MessageType::UserauthInfoResponse).await?;
        assert_eq!(response.body.read_u32()?, 2);
        assert_eq!(response.body.read_string()?, PASSWORD);
        assert_eq!(response.body.read_string()?, "");
        server.send_auth_success().await
    };
    let (auth, served) = tokio::join!(client.authenticate_password(USER, PASSWORD), server_side);

    served.unwrap();
    auth.unwrap();
    assert_eq!(client.banner().as_deref(), Some("Authorized use only\n"));
    assert!(client.is_authenticated());
}

#[tokio::test]
async fn test_password_change_request_is_an_error() {
    let (client, mut server) = connect().await;

    let server_side = async {
        server.accept_service("ssh-userauth").await?;
        server.recv_auth_request().await?;
        let mut change = Buffer::for_message(MessageType::Userauth60);
        change.put_str("Password expired").put_str("");
        server.send(change.as_slice()).await
    };
    let methods = [AuthMethod::Password(PASSWORD.to_string())];
    let (auth, served) = tokio::join!(
        client.authenticate(USER, &methods),
        server_side
    );
    served.unwrap();

    let err = auth.unwrap_err();
    let cause = err.most_recent_cause().map(|e| e.to_string()).unwrap_or_default();
    assert!(cause.contains("password change"), "{}", cause);
}

#[tokio::test]
async fn test_connection_loss_during_authentication() {
    let (client, mut server) = connect().await;

    let server_side = async {
        server.accept_service("ssh-userauth").await?;
        server.recv_auth_request().await?;
        server.hang_up().await;
        Ok::<_, TernError>(())
    };
    let methods = [AuthMethod::Password(PASSWORD.to_string())];
    let (auth, served) = tokio::join!(
        client.authenticate(USER, &methods),
        server_side
    );
    served.unwrap();

    let err = auth.unwrap_err();
    assert!(!matches!(err, TernError::Auth { .. }), "{:?}", err);
    assert!(!client.is_open());
}

#[tokio::test]
async fn test_late_failure_not_credited_to_next_method() {
    let (client, mut server) = connect_impatient().await;
    let methods = [
        AuthMethod::Password(PASSWORD.to_string()),
        AuthMethod::KeyboardInteractive(Arc::new(PasswordResponder::new(PASSWORD))),
    ];

    let server_side = async {
        server.accept_service("ssh-userauth").await?;
        let first = server.recv_auth_request().await?;
        assert_eq!(first.method, "password");

        // only answered once the client has moved on
        let second = server.recv_auth_request().await?;
        assert_eq!(second.method, "keyboard-interactive");
        server
            .send_auth_failure(&["password", "keyboard-interactive"], false)
            .await?;
        server.send_auth_success().await
    };
    let (auth, served) = tokio::join!(client.authenticate(USER, &methods), server_side);
    served.unwrap();

    auth.unwrap();
    assert!(client.is_authenticated());
}

#[tokio::test]
async fn test_late_failure_after_giving_up_keeps_connection() {
    let (client, mut server) = connect_impatient().await;
    let methods = [AuthMethod::Password(PASSWORD.to_string())];

    let server_side = async {
        server.accept_service("ssh-userauth").await?;
        server.recv_auth_request().await?;
        Ok::<_, TernError>(())
    };
    let (auth, served) = tokio::join!(client.authenticate(USER, &methods), server_side);
    served.unwrap();
    let err = auth.unwrap_err();
    assert!(err.most_recent_cause().map_or(false, TernError::is_timeout), "{:?}", err);

    server.send_auth_failure(&["password"], false).await.unwrap();

    let server_side = async {
        let retry = server.recv_auth_request().await?;
        assert_eq!(retry.method, "password");
        server.send_auth_success().await
    };
    let (auth, accepted) = tokio::join!(client.authenticate(USER, &methods), server_side);
    accepted.unwrap();
    auth.unwrap();
    assert!(client.is_open());
    assert!(client.is_authenticated());
}
