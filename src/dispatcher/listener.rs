//! Host Listener
//!
//! Schnittstelle, über die der Dispatcher Engine-Events an den Host
//! weitergibt. Alle Methoden werden auf einem Engine-Thread aufgerufen.

use crate::call::{CallDirection, CallId, VideoFrame};
use crate::codec::OpaqueBlob;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    #[error("Listener failed: {0}")]
    Failed(String),

    #[error("Listener panicked: {0}")]
    Panicked(String),

    #[error("Listener channel closed")]
    ChannelClosed,
}

impl ListenerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

// ============================================================================
// STATUS
// ============================================================================

/// Art eines Status-Updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Ringing,
    Connected,
    Connecting,
    Concluded,
    Ended,
}

impl StatusKind {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Self::Ringing),
            2 => Some(Self::Connected),
            3 => Some(Self::Connecting),
            4 => Some(Self::Concluded),
            5 => Some(Self::Ended),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Self::Ringing => 1,
            Self::Connected => 2,
            Self::Connecting => 3,
            Self::Concluded => 4,
            Self::Ended => 5,
        }
    }
}

/// Status-Update der Engine, unverändert weitergereicht
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallStatus {
    pub call_id: CallId,
    pub peer_id: u64,
    pub direction: i32,
    pub kind: i32,
}

impl CallStatus {
    pub fn direction(&self) -> Option<CallDirection> {
        CallDirection::from_raw(self.direction)
    }

    pub fn kind(&self) -> Option<StatusKind> {
        StatusKind::from_raw(self.kind)
    }
}

// ============================================================================
// LISTENER
// ============================================================================

/// Vom Host implementierter Empfänger der Engine-Callbacks
///
/// Fehler und Panics werden vom Dispatcher abgefangen und geloggt; sie
/// erreichen die Engine nie. Implementierungen dürfen keine
/// Lifecycle-Operationen synchron aus einem Callback heraus aufrufen.
pub trait CallListener: Send + Sync {
    fn on_status(&self, status: CallStatus) -> Result<(), ListenerError>;

    fn on_answer(&self, call_id: CallId, answer: OpaqueBlob) -> Result<(), ListenerError>;

    fn on_offer(&self, call_id: CallId, offer: OpaqueBlob) -> Result<(), ListenerError>;

    fn on_ice_candidates(
        &self,
        call_id: CallId,
        candidates: Vec<OpaqueBlob>,
    ) -> Result<(), ListenerError>;

    /// Hosts ohne Video müssen diese Methode nicht implementieren
    fn on_video_frame(&self, call_id: CallId, frame: VideoFrame) -> Result<(), ListenerError> {
        tracing::trace!("Dropping video frame {:?} for call {}", frame, call_id);
        Ok(())
    }
}

// ============================================================================
// CHANNEL LISTENER
// ============================================================================

/// Ein Engine-Callback als Wert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Status(CallStatus),
    Answer(CallId, OpaqueBlob),
    Offer(CallId, OpaqueBlob),
    IceCandidates(CallId, Vec<OpaqueBlob>),
    VideoFrame(CallId, VideoFrame),
}

/// Listener, der jeden Callback in einen Tokio-Channel schreibt
///
/// Der Host verarbeitet die Events auf seinem eigenen Task und kann von
/// dort aus gefahrlos Lifecycle-Operationen aufrufen.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ListenerEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ListenerEvent) -> Result<(), ListenerError> {
        self.tx.send(event).map_err(|_| ListenerError::ChannelClosed)
    }
}

impl CallListener for ChannelListener {
    fn on_status(&self, status: CallStatus) -> Result<(), ListenerError> {
        self.forward(ListenerEvent::Status(status))
    }

    fn on_answer(&self, call_id: CallId, answer: OpaqueBlob) -> Result<(), ListenerError> {
        self.forward(ListenerEvent::Answer(call_id, answer))
    }

    fn on_offer(&self, call_id: CallId, offer: OpaqueBlob) -> Result<(), ListenerError> {
        self.forward(ListenerEvent::Offer(call_id, offer))
    }

    fn on_ice_candidates(
        &self,
        call_id: CallId,
        candidates: Vec<OpaqueBlob>,
    ) -> Result<(), ListenerError> {
        self.forward(ListenerEvent::IceCandidates(call_id, candidates))
    }

    fn on_video_frame(&self, call_id: CallId, frame: VideoFrame) -> Result<(), ListenerError> {
        self.forward(ListenerEvent::VideoFrame(call_id, frame))
    }
}
