//! X11 forwarding (RFC 4254 Section 6.3).
//!
//! After an `x11-req` on a session channel the server opens an `x11`
//! channel for every X client that connects to its proxy display. The
//! [`X11Forwarder`] accepts those channels and hands each to a
//! [`ConnectListener`], usually one relaying to the local X server.

use super::remote::read_addr;
use super::types::{ConnectListener, ForwardAddr, ForwardedConnection};
use crate::ssh::buffer::Buffer;
use crate::ssh::channel::OpenFailureReason;
use crate::ssh::connection::{ChannelOpener, Connection, IncomingOpen, OpenRejection, OpenedHandler};
use std::sync::Arc;
use tracing::{debug, warn};

/// Channel type opened by the server for X11 clients.
pub const X11_CHANNEL: &str = "x11";

struct X11Opener {
    listener: Arc<dyn ConnectListener>,
}

impl ChannelOpener for X11Opener {
    fn channel_type(&self) -> &str {
        X11_CHANNEL
    }

    fn handle_open(&self, open: &IncomingOpen) -> Result<OpenedHandler, OpenRejection> {
        let originator = read_addr(&mut Buffer::from(open.data.as_slice())).map_err(|err| {
            OpenRejection::new(OpenFailureReason::ConnectFailed, err.to_string())
        })?;
        debug!(%originator, "X11 channel requested");

        let listener = self.listener.clone();
        Ok(Box::new(move |channel| {
            tokio::spawn(async move {
                let connection = ForwardedConnection {
                    forward: X11Forwarder::display(),
                    originator,
                    channel,
                };
                if let Err(err) = listener.got_connect(connection).await {
                    warn!(error = %err, "X11 connection failed");
                }
            });
        }))
    }
}

/// Accepts `x11` channels while registered.
///
/// X11 channels are not tied to a bound address, so every delivered
/// [`ForwardedConnection`] carries [`X11Forwarder::display`] as its forward.
#[derive(Clone)]
pub struct X11Forwarder {
    connection: Connection,
}

impl X11Forwarder {
    /// Registers `listener` for `x11` channels, replacing any earlier one.
    pub fn start(connection: Connection, listener: Arc<dyn ConnectListener>) -> Self {
        connection.attach(Arc::new(X11Opener { listener }));
        Self { connection }
    }

    /// Placeholder forward address of X11 connections.
    pub fn display() -> ForwardAddr {
        ForwardAddr::new(X11_CHANNEL, 0)
    }

    /// Stops accepting `x11` channels; later ones are refused as unknown.
    pub fn stop(&self) -> bool {
        self.connection.detach(X11_CHANNEL)
    }
}

impl std::fmt::Debug for X11Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X11Forwarder").finish_non_exhaustive()
    }
}
