//! SSH authentication protocol messages (RFC 4252, RFC 4256).
//!
//! Parsing for what the server sends during user authentication, and the
//! signed-data layout shared by the `publickey` and `hostbased` methods.
//! The state machine that drives them lives in
//! [`userauth`](crate::ssh::userauth).

use crate::ssh::buffer::Buffer;
use crate::ssh::message::MessageType;
use tern_platform::TernResult;

/// SSH_MSG_USERAUTH_FAILURE (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    /// Methods that can continue
    pub methods: Vec<String>,
    /// Whether the attempted method succeeded as one step of several
    pub partial_success: bool,
}

impl AuthFailure {
    /// Parses the message body (after the message number).
    ///
    /// ```text
    /// name-list  authentications that can continue
    /// boolean    partial success
    /// ```
    pub fn parse(buf: &mut Buffer) -> TernResult<Self> {
        Ok(Self {
            methods: buf.read_name_list()?,
            partial_success: buf.read_bool()?,
        })
    }

    /// Serializes the whole message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::for_message(MessageType::UserauthFailure);
        buf.put_name_list(&self.methods).put_bool(self.partial_success);
        buf.into_vec()
    }
}

/// SSH_MSG_USERAUTH_BANNER (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    /// Text to show the user
    pub message: String,
    /// Language tag
    pub language: String,
}

impl AuthBanner {
    /// Parses the message body (after the message number).
    pub fn parse(buf: &mut Buffer) -> TernResult<Self> {
        Ok(Self {
            message: buf.read_string()?,
            language: buf.read_string().unwrap_or_default(),
        })
    }
}

/// One prompt of a keyboard-interactive challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Prompt text
    pub text: String,
    /// Whether the answer may be echoed
    pub echo: bool,
}

/// SSH_MSG_USERAUTH_INFO_REQUEST (RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Challenge name
    pub name: String,
    /// Instruction text
    pub instruction: String,
    /// Prompts, in order
    pub prompts: Vec<Prompt>,
}

impl InfoRequest {
    /// Parses the message body (after the message number).
    pub fn parse(buf: &mut Buffer) -> TernResult<Self> {
        let name = buf.read_string()?;
        let instruction = buf.read_string()?;
        let _language = buf.read_string()?;
        let count = buf.read_u32()?;

        // each prompt takes at least five bytes; don't trust the count
        let mut prompts = Vec::with_capacity((count as usize).min(buf.available() / 5));
        for _ in 0..count {
            prompts.push(Prompt {
                text: buf.read_string()?,
                echo: buf.read_bool()?,
            });
        }
        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// Builds SSH_MSG_USERAUTH_INFO_RESPONSE. Each response is zeroized once
/// written.
pub fn info_response(responses: &mut [String]) -> Vec<u8> {
    let mut buf = Buffer::for_message(MessageType::UserauthInfoResponse);
    buf.put_u32(responses.len() as u32);
    for response in responses.iter_mut() {
        buf.put_sensitive_string(response);
    }
    buf.into_vec()
}

/// Data signed by `publickey` and `hostbased` requests: the session id as a
/// string followed by the request up to (excluding) the signature.
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    method name
/// ....      method fields before the signature
/// ```
pub fn signature_data(session_id: &[u8], request: &[u8]) -> Vec<u8> {
    let mut buf = Buffer::with_capacity(4 + session_id.len() + request.len());
    buf.put_bytes(session_id).put_raw(request);
    buf.into_vec()
}
