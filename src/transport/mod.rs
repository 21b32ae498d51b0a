//! Transport abstraction for push connections.
//!
//! The gateway never touches sockets directly: every peer is reached through
//! a [`Transport`] capability that exposes a send with an enumerated outcome
//! and a best-effort close. The payload schema is owned by the surrounding
//! application protocol; liveness decisions here depend only on the outcome.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// WebSocket-style close codes used by the gateway.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Server going away (shutdown, eviction, staleness).
    pub const GOING_AWAY: u16 = 1001;
    /// Admission rejected by capacity policy.
    pub const POLICY_VIOLATION: u16 = 1008;
}

/// Outbound unit handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Liveness probe frame.
    Ping,
    /// Application payload, already serialized by the caller.
    Data(String),
    /// Terminal close frame.
    Close { code: u16, reason: String },
}

/// Outcome of a failed transport send.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("send timed out")]
    Timeout,

    #[error("peer disconnected")]
    Closed,

    #[error("transport failure: {0}")]
    Io(String),
}

/// Capability interface for a single peer connection.
///
/// Any concrete transport (WebSocket pump, in-process channel, stream)
/// implements this; the registry owns exactly one per connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one envelope to the peer.
    async fn send(&self, envelope: Envelope) -> Result<(), SendError>;

    /// Best-effort graceful close. A peer that cannot be told goodbye is
    /// already gone, so this never fails.
    async fn close(&self, code: u16, reason: &str);
}

/// Transport backed by an mpsc channel whose receiving end is drained by a
/// socket pump task.
pub struct ChannelTransport {
    sender: mpsc::Sender<Envelope>,
    closed: AtomicBool,
}

impl ChannelTransport {
    pub fn new(sender: mpsc::Sender<Envelope>) -> Self {
        Self {
            sender,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        self.sender
            .send(envelope)
            .await
            .map_err(|_| SendError::Closed)
    }

    async fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // try_send keeps close non-blocking when the pump has stalled
        let _ = self.sender.try_send(Envelope::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport_delivers_envelopes() {
        let (tx, mut rx) = mpsc::channel(8);
        let transport = ChannelTransport::new(tx);

        transport.send(Envelope::Ping).await.unwrap();
        transport
            .send(Envelope::Data("hello".to_string()))
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(Envelope::Ping));
        assert_eq!(rx.recv().await, Some(Envelope::Data("hello".to_string())));
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let (tx, mut rx) = mpsc::channel(8);
        let transport = ChannelTransport::new(tx);

        transport.close(close_code::NORMAL, "done").await;

        assert_eq!(transport.send(Envelope::Ping).await, Err(SendError::Closed));
        assert_eq!(
            rx.recv().await,
            Some(Envelope::Close {
                code: close_code::NORMAL,
                reason: "done".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_close_emits_exactly_one_close_frame() {
        let (tx, mut rx) = mpsc::channel(8);
        let transport = ChannelTransport::new(tx);

        transport.close(close_code::GOING_AWAY, "server_shutdown").await;
        transport.close(close_code::GOING_AWAY, "server_shutdown").await;

        assert!(matches!(rx.recv().await, Some(Envelope::Close { .. })));
        drop(transport);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_to_dropped_receiver_reports_closed() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let transport = ChannelTransport::new(tx);

        assert_eq!(
            transport.send(Envelope::Data("x".to_string())).await,
            Err(SendError::Closed)
        );
    }
}
