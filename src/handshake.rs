//! Socket handshake: connect and authenticate
//!
//! Turns a connector and credentials into an authenticated socket or a
//! definitive error. Auth rejection is terminal; everything else is retried
//! on a fixed delay until the caller's budget runs out.

use std::time::Duration;

use tracing::{debug, warn};

use crate::auth::TokenGate;
use crate::error::{HearthError, Result};
use crate::protocol::{self, ServerMessage};
use crate::transport::{Connector, TransportSink, TransportStream};

/// Fixed delay between handshake attempts.
const RETRY_DELAY: Duration = Duration::from_millis(1000);

/// A socket that made it through the auth exchange. The capability
/// announcement (when the hub is new enough) has already been sent on it.
pub(crate) struct AuthenticatedSocket {
    pub sink: Box<dyn TransportSink>,
    pub stream: Box<dyn TransportStream>,
    pub ha_version: String,
}

/// Open a transport and drive it through the auth exchange.
///
/// `retries` is the number of failed attempts to retry after: `None` means
/// retry forever, `Some(0)` means a single attempt. Auth rejection aborts
/// immediately no matter the budget.
pub(crate) async fn establish(
    connector: &dyn Connector,
    credentials: &TokenGate,
    retries: Option<u32>,
) -> Result<AuthenticatedSocket> {
    let mut tries_left = retries;

    loop {
        let err = match attempt(connector, credentials).await {
            Ok(socket) => return Ok(socket),
            Err(err @ HearthError::InvalidAuth(_)) => return Err(err),
            Err(err) => err,
        };

        match tries_left.as_mut() {
            Some(0) => {
                warn!(error = %err, "Handshake retries exhausted");
                return Err(HearthError::CannotConnect(err.to_string()));
            }
            Some(n) => *n -= 1,
            None => {}
        }

        warn!(error = %err, "Handshake failed, retrying");
        tokio::time::sleep(RETRY_DELAY).await;
    }
}

/// One handshake attempt: fresh token, connect, auth exchange.
async fn attempt(connector: &dyn Connector, credentials: &TokenGate) -> Result<AuthenticatedSocket> {
    // Refresh first so the auth frame carries a live token. InvalidAuth from
    // a failed refresh propagates out of the retry loop.
    let token = credentials.fresh_token().await?;

    let (mut sink, mut stream) = connector.connect().await?;
    sink.send(protocol::auth_message(&token).to_string()).await?;

    loop {
        let frame = match stream.next_frame().await? {
            Some(frame) => frame,
            None => {
                return Err(HearthError::Transport(
                    "Socket closed during auth exchange".to_string(),
                ))
            }
        };

        let messages = match protocol::parse_frame(&frame) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "Unparseable frame during auth exchange, skipping");
                continue;
            }
        };

        for message in messages {
            match message {
                ServerMessage::AuthOk { ha_version } => {
                    debug!(version = %ha_version, "Authentication accepted");
                    if protocol::at_least_version(&ha_version, 2022, 9, 0) {
                        sink.send(protocol::supported_features_message().to_string())
                            .await?;
                    }
                    return Ok(AuthenticatedSocket { sink, stream, ha_version });
                }
                ServerMessage::AuthInvalid { message } => {
                    sink.close().await;
                    let reason = if message.is_empty() {
                        "Access token rejected".to_string()
                    } else {
                        message
                    };
                    return Err(HearthError::InvalidAuth(reason));
                }
                ServerMessage::AuthRequired { ha_version } => {
                    debug!(version = %ha_version, "Hub requests authentication");
                }
                other => {
                    debug!(message = ?other, "Ignoring pre-auth frame");
                }
            }
        }
    }
}
