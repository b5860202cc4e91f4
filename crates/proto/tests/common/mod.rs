//! Scripted SSH server for integration tests.
//!
//! Built from the crate's own codec and key exchange pieces. It speaks
//! curve25519-sha256 with an Ed25519 host key and otherwise does exactly
//! what each test tells it to, one message at a time.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tern_platform::{RandomSource, SeededRandom, TernError, TernResult};
use tern_proto::ssh::buffer::Buffer;
use tern_proto::ssh::hostkey::{AcceptAnyHostKey, Ed25519Signer, HostKeyVerifier, Signer};
use tern_proto::ssh::kex::{KexInit, Negotiated, NewKeys};
use tern_proto::ssh::kex_dh::{derive_keys, exchange_hash, KexContext};
use tern_proto::ssh::message::MessageType;
use tern_proto::ssh::packet::{Decoder, Encoder};
use tern_proto::ssh::userauth::AuthMethod;
use tern_proto::ssh::{SshClient, SshConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

pub const SERVER_VERSION: &str = "SSH-2.0-MockServer_1.0";
pub const USER: &str = "alice";
pub const PASSWORD: &str = "secret";

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Client configuration used by the tests.
pub fn client_config() -> SshConfig {
    SshConfig::builder()
        .with_timeout(Duration::from_secs(5))
        .with_random(SeededRandom::shared(1))
        .build()
        .expect("valid test config")
}

/// A message received by the server.
pub struct Message {
    pub code: u8,
    pub seq: u32,
    pub body: Buffer,
}

impl Message {
    pub fn is(&self, msg: MessageType) -> bool {
        self.code == msg.code()
    }
}

/// CHANNEL_OPEN sent by the client.
#[derive(Debug)]
pub struct OpenRequest {
    pub kind: String,
    pub sender: u32,
    pub window: u32,
    pub max_packet: u32,
}

/// USERAUTH_REQUEST sent by the client.
pub struct AuthRequest {
    pub user: String,
    pub service: String,
    pub method: String,
    pub rest: Buffer,
}

pub struct MockServer {
    stream: DuplexStream,
    encoder: Encoder,
    decoder: Decoder,
    host_key: Ed25519Signer,
    config: SshConfig,
    random: SeededRandom,
    client_line: String,
    session_id: Option<Vec<u8>>,
    pub kex_rounds: u32,
}

impl MockServer {
    pub fn new(stream: DuplexStream) -> Self {
        let random = SeededRandom::new(99);
        let config = SshConfig::builder()
            .with_kex_algorithms(vec!["curve25519-sha256".to_string()])
            .with_host_key_algorithms(vec!["ssh-ed25519".to_string()])
            .with_random(SeededRandom::shared(7))
            .build()
            .expect("valid server config");
        Self {
            stream,
            encoder: Encoder::new(SeededRandom::shared(5)),
            decoder: Decoder::new(),
            host_key: Ed25519Signer::generate(&random),
            config,
            random,
            client_line: String::new(),
            session_id: None,
            kex_rounds: 0,
        }
    }

    pub fn host_key(&self) -> &Ed25519Signer {
        &self.host_key
    }

    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Sequence number the next outgoing packet will carry.
    pub fn next_seq(&self) -> u32 {
        self.encoder.sequence()
    }

    /// Identification exchange plus the first key exchange.
    pub async fn handshake(mut self) -> TernResult<Self> {
        self.stream
            .write_all(format!("{}\r\n", SERVER_VERSION).as_bytes())
            .await?;

        let mut line = Vec::new();
        loop {
            let byte = self.stream.read_u8().await?;
            if byte == b'\n' {
                break;
            }
            line.push(byte);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        self.client_line = String::from_utf8(line)
            .map_err(|_| TernError::Protocol("client version is not UTF-8".to_string()))?;

        self.kex(None).await?;
        Ok(self)
    }

    /// Runs a key exchange. `client_kexinit` is the client's KEXINIT when
    /// it has already been received.
    pub async fn kex(&mut self, client_kexinit: Option<Vec<u8>>) -> TernResult<()> {
        let server_kexinit = KexInit::from_config(&self.config).to_bytes();
        self.send(&server_kexinit).await?;

        let client_kexinit = match client_kexinit {
            Some(payload) => payload,
            None => self.expect(MessageType::KexInit).await?.body.into_vec(),
        };
        let negotiated = Negotiated::new(
            &KexInit::from_bytes(&client_kexinit)?,
            &KexInit::from_bytes(&server_kexinit)?,
        )?;

        let mut init = self.expect(MessageType::KexdhInit).await?;
        let client_public: [u8; 32] = init
            .body
            .read_bytes()?
            .try_into()
            .map_err(|_| TernError::Protocol("bad client public value".to_string()))?;

        let mut secret_bytes = [0u8; 32];
        self.random.fill(&mut secret_bytes);
        let secret = StaticSecret::from(secret_bytes);
        let server_public = X25519Public::from(&secret).to_bytes();
        let shared_secret = secret
            .diffie_hellman(&X25519Public::from(client_public))
            .to_bytes();

        let host_key_blob = self.host_key.public_key().to_blob();
        let ctx = KexContext {
            client_version: &self.client_line,
            server_version: SERVER_VERSION,
            client_kexinit: &client_kexinit,
            server_kexinit: &server_kexinit,
        };
        let hash = exchange_hash(
            negotiated.kex,
            &ctx,
            &host_key_blob,
            &client_public,
            &server_public,
            &shared_secret,
        );
        let signature = self.host_key.sign(&hash)?;

        let mut reply = Buffer::for_message(MessageType::KexdhReply);
        reply
            .put_bytes(&host_key_blob)
            .put_bytes(&server_public)
            .put_bytes(&signature);
        self.send(reply.as_slice()).await?;
        self.send(&NewKeys::new().to_bytes()).await?;

        let session_id = self.session_id.get_or_insert_with(|| hash.clone()).clone();
        let keys = derive_keys(&negotiated, &shared_secret, &hash, &session_id);
        self.encoder.set_keys(
            negotiated.cipher_s2c.create(&keys.enc_s2c, &keys.iv_s2c)?,
            Some(negotiated.mac_s2c.create(&keys.mac_s2c)?),
        );

        self.expect(MessageType::NewKeys).await?;
        self.decoder.set_keys(
            negotiated.cipher_c2s.create(&keys.enc_c2s, &keys.iv_c2s)?,
            Some(negotiated.mac_c2s.create(&keys.mac_c2s)?),
        );
        self.kex_rounds += 1;
        Ok(())
    }

    pub async fn send(&mut self, payload: &[u8]) -> TernResult<()> {
        let packet = self.encoder.encode(payload)?;
        self.stream.write_all(&packet).await?;
        Ok(())
    }

    /// Next message other than IGNORE.
    pub async fn recv(&mut self) -> TernResult<Message> {
        loop {
            while let Some(packet) = self.decoder.next_packet()? {
                let mut body = Buffer::from_vec(packet.payload);
                let code = body.read_u8()?;
                if code == MessageType::Ignore.code() {
                    continue;
                }
                return Ok(Message {
                    code,
                    seq: packet.seq,
                    body,
                });
            }
            let n = self.stream.read_buf(self.decoder.input_mut()).await?;
            if n == 0 {
                return Err(TernError::Closed("client went away".to_string()));
            }
        }
    }

    /// Next message, which must be `msg`.
    pub async fn expect(&mut self, msg: MessageType) -> TernResult<Message> {
        let received = self.recv().await?;
        if !received.is(msg) {
            return Err(TernError::Protocol(format!(
                "expected {}, got message {}",
                msg, received.code
            )));
        }
        Ok(received)
    }

    /// Drops the connection.
    pub async fn hang_up(mut self) {
        let _ = self.stream.shutdown().await;
    }

    // ---- service and authentication ----

    pub async fn accept_service(&mut self, name: &str) -> TernResult<()> {
        let mut request = self.expect(MessageType::ServiceRequest).await?;
        let requested = request.body.read_string()?;
        if requested != name {
            return Err(TernError::Protocol(format!("unexpected service {}", requested)));
        }
        let mut accept = Buffer::for_message(MessageType::ServiceAccept);
        accept.put_str(name);
        self.send(accept.as_slice()).await
    }

    pub async fn recv_auth_request(&mut self) -> TernResult<AuthRequest> {
        let mut msg = self.expect(MessageType::UserauthRequest).await?;
        Ok(AuthRequest {
            user: msg.body.read_string()?,
            service: msg.body.read_string()?,
            method: msg.body.read_string()?,
            rest: msg.body,
        })
    }

    pub async fn send_auth_failure(&mut self, methods: &[&str], partial: bool) -> TernResult<()> {
        let mut buf = Buffer::for_message(MessageType::UserauthFailure);
        buf.put_name_list(methods).put_bool(partial);
        self.send(buf.as_slice()).await
    }

    pub async fn send_auth_success(&mut self) -> TernResult<()> {
        self.send(&[MessageType::UserauthSuccess.code()]).await
    }

    /// Accepts the user's first password request.
    pub async fn accept_password(&mut self) -> TernResult<()> {
        self.accept_service("ssh-userauth").await?;
        let mut request = self.recv_auth_request().await?;
        if request.method != "password" || request.rest.read_bool()? {
            return Err(TernError::Protocol("expected a password request".to_string()));
        }
        let password = request.rest.read_string()?;
        if request.user != USER || password != PASSWORD {
            return Err(TernError::Security("wrong credentials".to_string()));
        }
        self.send_auth_success().await
    }

    // ---- connection ----

    pub async fn recv_channel_open(&mut self) -> TernResult<OpenRequest> {
        let mut msg = self.expect(MessageType::ChannelOpen).await?;
        Ok(OpenRequest {
            kind: msg.body.read_string()?,
            sender: msg.body.read_u32()?,
            window: msg.body.read_u32()?,
            max_packet: msg.body.read_u32()?,
        })
    }

    pub async fn confirm_channel(
        &mut self,
        recipient: u32,
        sender: u32,
        window: u32,
        max_packet: u32,
    ) -> TernResult<()> {
        let mut buf = Buffer::for_message(MessageType::ChannelOpenConfirmation);
        buf.put_u32(recipient)
            .put_u32(sender)
            .put_u32(window)
            .put_u32(max_packet);
        self.send(buf.as_slice()).await
    }

    /// Confirms the next channel open with our id 100.
    pub async fn accept_channel(&mut self, window: u32, max_packet: u32) -> TernResult<OpenRequest> {
        let open = self.recv_channel_open().await?;
        self.confirm_channel(open.sender, 100, window, max_packet).await?;
        Ok(open)
    }

    pub async fn send_channel_data(&mut self, recipient: u32, data: &[u8]) -> TernResult<()> {
        let mut buf = Buffer::for_message(MessageType::ChannelData);
        buf.put_u32(recipient).put_bytes(data);
        self.send(buf.as_slice()).await
    }

    /// Next CHANNEL_DATA payload.
    pub async fn recv_channel_data(&mut self) -> TernResult<Vec<u8>> {
        let mut msg = self.expect(MessageType::ChannelData).await?;
        let _recipient = msg.body.read_u32()?;
        msg.body.read_bytes()
    }

    /// Answers the next channel request, returning its name.
    pub async fn answer_channel_request(&mut self, recipient: u32, success: bool) -> TernResult<String> {
        let mut msg = self.expect(MessageType::ChannelRequest).await?;
        let _channel = msg.body.read_u32()?;
        let name = msg.body.read_string()?;
        if msg.body.read_bool()? {
            let reply = if success {
                MessageType::ChannelSuccess
            } else {
                MessageType::ChannelFailure
            };
            let mut buf = Buffer::for_message(reply);
            buf.put_u32(recipient);
            self.send(buf.as_slice()).await?;
        }
        Ok(name)
    }
}

/// Connects a client to a fresh mock server.
pub async fn connect_with(
    config: SshConfig,
    verifier: Arc<dyn HostKeyVerifier>,
) -> (TernResult<SshClient>, TernResult<MockServer>) {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = MockServer::new(server_io);
    tokio::join!(
        SshClient::connect_stream(client_io, "mock", 22, config, verifier),
        server.handshake()
    )
}

/// Connects and completes key exchange.
pub async fn connect() -> (SshClient, MockServer) {
    init_tracing();
    let (client, server) = connect_with(client_config(), Arc::new(AcceptAnyHostKey)).await;
    (client.expect("client connects"), server.expect("server handshake"))
}

/// Connects and authenticates with a password.
pub async fn connect_authenticated() -> (SshClient, MockServer) {
    connect_authenticated_with(client_config()).await
}

/// Like [`connect_authenticated`] with a custom client configuration.
pub async fn connect_authenticated_with(config: SshConfig) -> (SshClient, MockServer) {
    init_tracing();
    let (client, server) = connect_with(config, Arc::new(AcceptAnyHostKey)).await;
    let (client, mut server) = (client.expect("client connects"), server.expect("server handshake"));
    let methods = [AuthMethod::Password(PASSWORD.to_string())];
    let (auth, accepted) = tokio::join!(
        client.authenticate(USER, &methods),
        server.accept_password()
    );
    auth.expect("client authenticates");
    accepted.expect("server accepts password");
    (client, server)
}
