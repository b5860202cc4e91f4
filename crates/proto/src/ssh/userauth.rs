//! User authentication state machine (the `ssh-userauth` service).
//!
//! ```text
//! IDLE -> REQUESTING(method) -> SUCCESS
//!                            -> FAILURE(allowed, partial) -> REQUESTING(next) | EXHAUSTED
//! ```
//!
//! The allowed set starts as every method the caller offers and is only ever
//! narrowed by the server's failure replies. Methods outside it are skipped
//! without being tried. Each failure is saved, most recent first, and
//! reported together once the list is exhausted.
//!
//! On success the transport switches to the next service from the reader
//! task itself, so no message for the next service can slip through to
//! this one.

use crate::ssh::auth::{info_response, signature_data, AuthBanner, AuthFailure, InfoRequest};
use crate::ssh::buffer::Buffer;
use crate::ssh::disconnect::DisconnectReason;
use crate::ssh::hostkey::Signer;
use crate::ssh::message::MessageType;
use crate::ssh::service::Service;
use crate::ssh::transport::{lock, Transport};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use tern_platform::{TernError, TernResult};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

/// Service name.
pub const SERVICE_NAME: &str = "ssh-userauth";

/// Answers keyboard-interactive challenges (RFC 4256).
pub trait ChallengeResponder: Send + Sync {
    /// Submethods hint sent with the request.
    fn submethods(&self) -> Vec<String> {
        Vec::new()
    }

    /// Called with each challenge before its prompts are answered.
    fn init(&self, _name: &str, _instruction: &str) {}

    /// Answer for one prompt.
    fn response(&self, prompt: &str, echo: bool) -> Zeroizing<String>;

    /// Whether to try again after the server refuses the answers.
    fn should_retry(&self) -> bool {
        false
    }
}

/// Answers password prompts of a keyboard-interactive challenge.
pub struct PasswordResponder {
    password: Zeroizing<String>,
}

impl PasswordResponder {
    /// Creates a responder answering with `password`.
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: Zeroizing::new(password.into()),
        }
    }
}

impl ChallengeResponder for PasswordResponder {
    fn response(&self, prompt: &str, _echo: bool) -> Zeroizing<String> {
        if prompt.to_ascii_lowercase().contains("password") {
            self.password.clone()
        } else {
            Zeroizing::new(String::new())
        }
    }
}

impl fmt::Debug for PasswordResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordResponder([REDACTED])")
    }
}

/// An authentication method.
#[derive(Clone)]
pub enum AuthMethod {
    /// Reveals the allowed methods; expected to fail.
    None,
    /// Password authentication.
    Password(String),
    /// Public key authentication, signed by `signer`.
    PublicKey(Arc<dyn Signer>),
    /// Keyboard-interactive authentication.
    KeyboardInteractive(Arc<dyn ChallengeResponder>),
    /// Host-based authentication.
    Hostbased {
        /// Host key signer
        signer: Arc<dyn Signer>,
        /// Client host name (fully qualified)
        host: String,
        /// User name on the client host
        host_user: String,
    },
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey(_) => "publickey",
            AuthMethod::KeyboardInteractive(_) => "keyboard-interactive",
            AuthMethod::Hostbased { .. } => "hostbased",
        }
    }

    /// Whether a failure that still allows this method should be retried.
    fn should_retry(&self) -> bool {
        match self {
            AuthMethod::KeyboardInteractive(responder) => responder.should_retry(),
            _ => false,
        }
    }

    /// Builds SSH_MSG_USERAUTH_REQUEST.
    ///
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn request(&self, user: &str, service: &str, session_id: &[u8]) -> TernResult<Vec<u8>> {
        let mut buf = Buffer::for_message(MessageType::UserauthRequest);
        buf.put_str(user).put_str(service).put_str(self.name());

        match self {
            AuthMethod::None => {}
            AuthMethod::Password(password) => {
                let mut copy = password.clone();
                buf.put_bool(false).put_sensitive_string(&mut copy);
            }
            AuthMethod::PublicKey(signer) => {
                buf.put_bool(true)
                    .put_str(signer.algorithm().name())
                    .put_bytes(&signer.public_key().to_blob());
                let signature = signer.sign(&signature_data(session_id, buf.as_slice()))?;
                buf.put_bytes(&signature);
            }
            AuthMethod::KeyboardInteractive(responder) => {
                buf.put_str("").put_str(&responder.submethods().join(","));
            }
            AuthMethod::Hostbased {
                signer,
                host,
                host_user,
            } => {
                buf.put_str(signer.algorithm().name())
                    .put_bytes(&signer.public_key().to_blob())
                    .put_str(host)
                    .put_str(host_user);
                let signature = signer.sign(&signature_data(session_id, buf.as_slice()))?;
                buf.put_bytes(&signature);
            }
        }

        Ok(buf.into_vec())
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password(ref mut password) = self {
            password.zeroize();
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password([REDACTED])"),
            AuthMethod::PublicKey(signer) => {
                write!(f, "PublicKey({})", signer.public_key().fingerprint())
            }
            AuthMethod::Hostbased { host, host_user, .. } => {
                write!(f, "Hostbased({}@{})", host_user, host)
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Method currently being tried.
struct Attempt {
    method: AuthMethod,
    user: String,
    service: String,
    session_id: Vec<u8>,
    result: Option<oneshot::Sender<TernResult<bool>>>,
}

impl Attempt {
    fn finish(&mut self, result: TernResult<bool>) {
        if let Some(tx) = self.result.take() {
            let _ = tx.send(result);
        }
    }
}

#[derive(Default)]
struct State {
    allowed: HashSet<String>,
    seeded: bool,
    banner: Option<String>,
    partial_success: bool,
    attempt: Option<Attempt>,
    /// Requests abandoned on timeout whose final reply is still owed.
    stale_replies: u32,
    next: Option<Arc<dyn Service>>,
    error: Option<TernError>,
}

struct Inner {
    transport: Transport,
    state: Mutex<State>,
    in_progress: AsyncMutex<()>,
}

/// The `ssh-userauth` service.
#[derive(Clone)]
pub struct UserAuth {
    inner: Arc<Inner>,
}

impl UserAuth {
    /// Creates the service for `transport`.
    pub fn new(transport: Transport) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                state: Mutex::new(State::default()),
                in_progress: AsyncMutex::new(()),
            }),
        }
    }

    /// Banner sent by the server, if any.
    pub fn banner(&self) -> Option<String> {
        lock(&self.inner.state).banner.clone()
    }

    /// Whether any method succeeded partially.
    pub fn had_partial_success(&self) -> bool {
        lock(&self.inner.state).partial_success
    }

    /// Methods currently allowed, in no particular order.
    pub fn allowed_methods(&self) -> Vec<String> {
        lock(&self.inner.state).allowed.iter().cloned().collect()
    }

    /// Authenticates `user` for `next`, trying `methods` in order.
    ///
    /// Only one authentication runs at a time. On success `next` becomes the
    /// active service. When every method fails, returns [`TernError::Auth`]
    /// with the failures most recent first.
    pub async fn authenticate(
        &self,
        user: &str,
        next: Arc<dyn Service>,
        methods: &[AuthMethod],
    ) -> TernResult<()> {
        let _running = self.inner.in_progress.lock().await;
        let transport = &self.inner.transport;

        if transport.is_authenticated() {
            return Err(TernError::Protocol("Already authenticated".to_string()));
        }
        if transport.active_service_name().as_deref() != Some(SERVICE_NAME) {
            transport.request_service(Arc::new(self.clone())).await?;
        }

        let session_id = transport
            .session_id()
            .ok_or_else(|| TernError::Protocol("No session id before authentication".to_string()))?;

        {
            let mut state = lock(&self.inner.state);
            state.next = Some(next.clone());
            state.banner = None;
            if !state.seeded {
                state.allowed = methods.iter().map(|m| m.name().to_string()).collect();
                state.seeded = true;
            }
        }

        let mut causes: Vec<TernError> = Vec::new();
        for method in methods {
            let allowed = lock(&self.inner.state).allowed.contains(method.name());
            if !allowed {
                debug!(method = method.name(), "Skipping method not allowed by server");
                causes.insert(
                    0,
                    TernError::Security(format!("{} auth not allowed by server", method.name())),
                );
                continue;
            }

            info!(method = method.name(), user, "Trying authentication");
            match self.try_with(method, user, next.name(), &session_id).await {
                Ok(true) => {
                    info!(method = method.name(), user, "Authentication successful");
                    return Ok(());
                }
                Ok(false) => {
                    info!(method = method.name(), "Authentication failed");
                    causes.insert(
                        0,
                        TernError::Security(format!("{} auth failed", method.name())),
                    );
                }
                Err(err) => {
                    if !transport.is_open() {
                        return Err(err);
                    }
                    debug!(method = method.name(), error = %err, "Saving authentication error");
                    causes.insert(0, err);
                }
            }
        }

        debug!(saved = causes.len(), "Authentication methods exhausted");
        Err(TernError::Auth {
            message: "Exhausted available authentication methods".to_string(),
            causes,
        })
    }

    async fn try_with(
        &self,
        method: &AuthMethod,
        user: &str,
        service: &str,
        session_id: &[u8],
    ) -> TernResult<bool> {
        let request = Zeroizing::new(method.request(user, service, session_id)?);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = lock(&self.inner.state);
            if let Some(err) = &state.error {
                return Err(err.clone());
            }
            state.attempt = Some(Attempt {
                method: method.clone(),
                user: user.to_string(),
                service: service.to_string(),
                session_id: session_id.to_vec(),
                result: Some(tx),
            });
        }

        let sent = self.inner.transport.send(&request).await;
        let delivered = sent.is_ok();
        let outcome = match sent {
            Ok(()) => match timeout(self.inner.transport.config().timeout, rx).await {
                Err(_) => Err(TernError::Timeout(format!("{} auth", method.name()))),
                Ok(Err(_)) => Err(self
                    .inner
                    .transport
                    .error()
                    .unwrap_or_else(|| TernError::Closed("Authentication aborted".to_string()))),
                Ok(Ok(result)) => result,
            },
            Err(err) => Err(err),
        };

        let mut state = lock(&self.inner.state);
        let unanswered = state
            .attempt
            .take()
            .map_or(false, |attempt| attempt.result.is_some());
        if unanswered && delivered {
            // the server still answers this request, ahead of the next one
            state.stale_replies += 1;
            debug!(method = method.name(), "Abandoned authentication request");
        }
        outcome
    }

    fn on_failure(&self, buf: &mut Buffer) -> TernResult<()> {
        let failure = AuthFailure::parse(buf)?;
        let mut state = lock(&self.inner.state);
        state.allowed = failure.methods.iter().cloned().collect();
        state.partial_success |= failure.partial_success;
        debug!(allowed = ?failure.methods, partial = failure.partial_success, "Authentication failure");

        if state.stale_replies > 0 {
            state.stale_replies -= 1;
            debug!("Late failure for an abandoned request");
            return Ok(());
        }

        let retry = match &state.attempt {
            Some(attempt) => {
                state.allowed.contains(attempt.method.name()) && attempt.method.should_retry()
            }
            None => {
                return Err(DisconnectReason::ProtocolError
                    .error("USERAUTH_FAILURE without a request"))
            }
        };

        if let Some(attempt) = state.attempt.as_mut() {
            if retry {
                debug!(method = attempt.method.name(), "Retrying");
                match attempt
                    .method
                    .request(&attempt.user, &attempt.service, &attempt.session_id)
                {
                    Ok(request) => self.inner.transport.enqueue(request),
                    Err(err) => attempt.finish(Err(err)),
                }
            } else {
                attempt.finish(Ok(false));
            }
        }
        Ok(())
    }

    fn on_success(&self) -> TernResult<()> {
        let (next, result) = {
            let mut state = lock(&self.inner.state);
            let next = state.next.clone().ok_or_else(|| {
                DisconnectReason::ProtocolError.error("USERAUTH_SUCCESS without a request")
            })?;
            // a late success still authenticates the connection
            state.stale_replies = state.stale_replies.saturating_sub(1);
            (next, state.attempt.as_mut().and_then(|a| a.result.take()))
        };

        // set_service may call back into notify_error
        let transport = &self.inner.transport;
        transport.set_authenticated();
        transport.set_service(next);
        if let Some(tx) = result {
            let _ = tx.send(Ok(true));
        }
        Ok(())
    }

    fn on_method_specific(&self, buf: &mut Buffer) -> TernResult<()> {
        let mut state = lock(&self.inner.state);
        if state.stale_replies > 0 {
            debug!("Ignoring USERAUTH_60 for an abandoned request");
            return Ok(());
        }
        let attempt = state.attempt.as_mut().ok_or_else(|| {
            DisconnectReason::ProtocolError.error("USERAUTH_60 without a request")
        })?;

        let responder = match &attempt.method {
            AuthMethod::KeyboardInteractive(responder) => responder.clone(),
            AuthMethod::Password(_) => {
                attempt.finish(Err(TernError::Security(
                    "Server requested a password change".to_string(),
                )));
                return Ok(());
            }
            other => {
                let err = TernError::Protocol(format!(
                    "Unexpected USERAUTH_60 for {} auth",
                    other.name()
                ));
                attempt.finish(Err(err));
                return Ok(());
            }
        };

        let challenge = InfoRequest::parse(buf)?;
        responder.init(&challenge.name, &challenge.instruction);
        let mut responses: Vec<String> = challenge
            .prompts
            .iter()
            .map(|prompt| {
                debug!(prompt = %prompt.text, echo = prompt.echo, "Answering challenge");
                responder.response(&prompt.text, prompt.echo).as_str().to_string()
            })
            .collect();
        self.inner.transport.enqueue(info_response(&mut responses));
        Ok(())
    }
}

impl Service for UserAuth {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn handle(&self, msg: MessageType, buf: &mut Buffer) -> TernResult<()> {
        if !msg.is_userauth() {
            return Err(DisconnectReason::ProtocolError
                .error(format!("{} received during authentication", msg)));
        }
        match msg {
            MessageType::UserauthBanner => {
                let banner = AuthBanner::parse(buf)?;
                debug!(len = banner.message.len(), "Received banner");
                lock(&self.inner.state).banner = Some(banner.message);
                Ok(())
            }
            MessageType::UserauthSuccess => self.on_success(),
            MessageType::UserauthFailure => self.on_failure(buf),
            MessageType::Userauth60 => self.on_method_specific(buf),
            _ => Err(DisconnectReason::ProtocolError.error(format!("Unexpected {}", msg))),
        }
    }

    fn notify_error(&self, err: &TernError) {
        let mut state = lock(&self.inner.state);
        state.error = Some(err.clone());
        state.next = None;
        if let Some(attempt) = state.attempt.as_mut() {
            attempt.finish(Err(err.clone()));
        }
    }
}

impl fmt::Debug for UserAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserAuth")
            .field("allowed", &self.allowed_methods())
            .finish_non_exhaustive()
    }
}
