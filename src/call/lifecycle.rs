//! Call Lifecycle
//!
//! Ausgehende Signaling-Operationen. Jede Operation läuft in drei Schritten:
//! 1. Phase gegen die [`CallStateCell`] validieren
//! 2. Argumente in einen eigenen [`MarshalFrame`] marshalen
//! 3. Transition übernehmen und Entry Point aufrufen
//!
//! Die Transition gilt schon während des Foreign Calls, damit synchrone
//! Callbacks der Engine den neuen Call sehen. Lehnt die Engine ab, wird sie
//! zurückgenommen. Während des Foreign Calls wird kein Lock gehalten.

use super::media::{MediaType, PixelFormat};
use super::state::{
    ActiveCall, CallEvent, CallId, CallOperation, CallPhase, CallStateCell, DeviceId, Rejection,
    Ticket,
};
use crate::codec::{
    encode_blob, encode_blob_batch, encode_text, preview, CodecError, MarshalFrame, OpaqueBlob,
};
use crate::config::BridgeConfig;
use crate::dispatcher::inside_callback;
use crate::engine::{EngineError, Session};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("{operation} is not valid while the call is {phase:?}")]
    InvalidTransition {
        operation: CallOperation,
        phase: CallPhase,
    },

    #[error("{operation} requires an active call")]
    NoActiveCall { operation: CallOperation },

    #[error("Call {requested} does not match active call {active}")]
    CallIdMismatch { requested: CallId, active: CallId },

    #[error("Invalid video frame: {0}")]
    InvalidFrame(String),

    #[error("{0} was invoked from inside an engine callback")]
    Reentrant(&'static str),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl CallError {
    /// Operation war in der aktuellen Phase nicht erlaubt
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. } | Self::NoActiveCall { .. } | Self::CallIdMismatch { .. }
        )
    }

    fn rejected(operation: CallOperation, rejection: Rejection) -> Self {
        match rejection {
            Rejection::NoActiveCall => Self::NoActiveCall { operation },
            Rejection::InvalidPhase(phase) => Self::InvalidTransition { operation, phase },
            Rejection::CallIdMismatch { requested, active } => {
                Self::CallIdMismatch { requested, active }
            }
        }
    }
}

// ============================================================================
// PARAMETERS
// ============================================================================

/// Eingehendes Offer, wie es vom Signaling-Transport des Hosts kommt
#[derive(Debug, Clone)]
pub struct ReceivedOffer {
    pub peer_id: String,
    pub call_id: CallId,
    pub sender_device: DeviceId,
    pub receiver_device: DeviceId,
    pub sender_key: Vec<u8>,
    pub receiver_key: Vec<u8>,
    pub opaque: OpaqueBlob,
}

/// Eingehende Answer auf einen ausgehenden Call
#[derive(Debug, Clone)]
pub struct ReceivedAnswer {
    pub peer_id: String,
    pub call_id: CallId,
    pub sender_device: DeviceId,
    pub sender_key: Vec<u8>,
    pub receiver_key: Vec<u8>,
    pub opaque: OpaqueBlob,
}

/// Werte, die nicht pro Operation übergeben werden
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallDefaults {
    pub audio_input: u16,
    pub audio_output: u16,
    pub offer_media_type: MediaType,
    pub offer_age_secs: u64,
    pub bandwidth_mode: i32,
    pub audio_levels_interval_ms: i32,
}

impl From<&BridgeConfig> for CallDefaults {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            audio_input: config.audio_input_device,
            audio_output: config.audio_output_device,
            offer_media_type: config.offer_media_type,
            offer_age_secs: config.offer_age_secs,
            bandwidth_mode: config.bandwidth_mode,
            audio_levels_interval_ms: config.audio_levels_interval_ms,
        }
    }
}

// ============================================================================
// CALL LIFECYCLE
// ============================================================================

/// Lifecycle-Operationen des aktiven Calls
pub struct CallLifecycle {
    session: Arc<Session>,
    calls: CallStateCell,
    defaults: CallDefaults,
}

impl CallLifecycle {
    pub fn new(session: Arc<Session>, calls: CallStateCell, defaults: CallDefaults) -> Self {
        Self {
            session,
            calls,
            defaults,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.calls.subscribe()
    }

    pub fn phase(&self) -> CallPhase {
        self.calls.phase()
    }

    pub fn active_call(&self) -> Option<ActiveCall> {
        self.calls.snapshot()
    }

    // ------------------------------------------------------------------------
    // Incoming
    // ------------------------------------------------------------------------

    /// Übergibt ein eingehendes Offer an die Engine
    pub fn received_offer(&self, offer: ReceivedOffer) -> Result<(), CallError> {
        let ticket = self.begin(CallOperation::ReceivedOffer, Some(offer.call_id))?;
        tracing::info!(
            "Received offer for call {} from {} ({} bytes: {})",
            offer.call_id,
            offer.peer_id,
            offer.opaque.len(),
            preview(offer.opaque.as_bytes())
        );

        let defaults = self.defaults;
        let mut frame = self.frame();
        let peer_id = encode_text(&mut frame, &offer.peer_id)?;
        let sender_key = encode_blob(&mut frame, &offer.sender_key)?;
        let receiver_key = encode_blob(&mut frame, &offer.receiver_key)?;
        let opaque = encode_blob(&mut frame, offer.opaque.as_bytes())?;

        self.transition(ticket, Some(offer.peer_id.clone()), || {
            self.session.invoke("received_offer", |api, session| unsafe {
                (api.received_offer)(
                    session,
                    peer_id,
                    offer.call_id.as_u64(),
                    defaults.offer_media_type.as_raw(),
                    offer.sender_device,
                    offer.receiver_device,
                    sender_key,
                    receiver_key,
                    opaque,
                    defaults.offer_age_secs,
                )
            })?;
            Ok(())
        })?;
        drop(frame);
        Ok(())
    }

    /// Übergibt die Answer des Peers an die Engine
    pub fn received_answer(&self, answer: ReceivedAnswer) -> Result<(), CallError> {
        let ticket = self.begin(CallOperation::ReceivedAnswer, Some(answer.call_id))?;
        tracing::info!(
            "Received answer for call {} from {} ({} bytes)",
            answer.call_id,
            answer.peer_id,
            answer.opaque.len()
        );

        let mut frame = self.frame();
        let peer_id = encode_text(&mut frame, &answer.peer_id)?;
        let sender_key = encode_blob(&mut frame, &answer.sender_key)?;
        let receiver_key = encode_blob(&mut frame, &answer.receiver_key)?;
        let opaque = encode_blob(&mut frame, answer.opaque.as_bytes())?;

        self.transition(ticket, Some(answer.peer_id.clone()), || {
            self.session.invoke("received_answer", |api, session| unsafe {
                (api.received_answer)(
                    session,
                    peer_id,
                    answer.call_id.as_u64(),
                    answer.sender_device,
                    sender_key,
                    receiver_key,
                    opaque,
                )
            })?;
            Ok(())
        })?;
        drop(frame);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Outgoing
    // ------------------------------------------------------------------------

    /// Startet einen ausgehenden Call
    ///
    /// Der Host vergibt die Call-ID; sie wird unverändert zurückgegeben.
    pub fn start_outgoing_call(
        &self,
        call_id: CallId,
        peer_id: &str,
        local_device: DeviceId,
        enable_video: bool,
    ) -> Result<CallId, CallError> {
        let ticket = self.begin(CallOperation::StartOutgoingCall, Some(call_id))?;
        tracing::info!("Starting outgoing call {} to {}", call_id, peer_id);

        let defaults = self.defaults;
        let mut frame = self.frame();
        let peer = encode_text(&mut frame, peer_id)?;

        self.transition(ticket, Some(peer_id.to_string()), || {
            self.session.invoke("set_audio_input", |api, session| unsafe {
                (api.set_audio_input)(session, defaults.audio_input)
            })?;
            self.session.invoke("set_audio_output", |api, session| unsafe {
                (api.set_audio_output)(session, defaults.audio_output)
            })?;
            self.session.invoke("create_outgoing_call", |api, session| unsafe {
                (api.create_outgoing_call)(
                    session,
                    peer,
                    enable_video,
                    local_device,
                    call_id.as_u64(),
                )
            })?;
            Ok(())
        })?;
        drop(frame);
        Ok(call_id)
    }

    /// Übergibt ICE-Credentials und lokale Kandidaten
    pub fn proceed<R: AsRef<[u8]>>(
        &self,
        call_id: CallId,
        ice_user: &str,
        ice_password: &str,
        candidates: &[R],
    ) -> Result<(), CallError> {
        let ticket = self.begin(CallOperation::Proceed, Some(call_id))?;
        tracing::info!(
            "Proceeding call {} with {} ICE candidates",
            call_id,
            candidates.len()
        );

        let defaults = self.defaults;
        let mut frame = self.frame();
        let user = encode_text(&mut frame, ice_user)?;
        let password = encode_text(&mut frame, ice_password)?;
        let batch = encode_blob_batch(&mut frame, candidates)?;

        self.transition(ticket, None, || {
            self.session.invoke("proceed_call", |api, session| unsafe {
                (api.proceed_call)(
                    session,
                    call_id.as_u64(),
                    defaults.bandwidth_mode,
                    defaults.audio_levels_interval_ms,
                    user,
                    password,
                    batch,
                )
            })?;
            Ok(())
        })?;
        drop(frame);
        Ok(())
    }

    /// Leitet ICE-Kandidaten des Peers weiter (keine Phasenänderung)
    pub fn received_ice<R: AsRef<[u8]>>(
        &self,
        call_id: CallId,
        sender_device: DeviceId,
        candidates: &[R],
    ) -> Result<(), CallError> {
        self.begin(CallOperation::ReceivedIce, Some(call_id))?;
        tracing::debug!(
            "Forwarding {} ICE candidates for call {}",
            candidates.len(),
            call_id
        );

        let mut frame = self.frame();
        let batch = encode_blob_batch(&mut frame, candidates)?;
        self.session.invoke("received_ice", |api, session| unsafe {
            (api.received_ice)(session, call_id.as_u64(), sender_device, batch)
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accept / Ignore / Hangup
    // ------------------------------------------------------------------------

    /// Nimmt den eingehenden Call an
    pub fn accept_call(&self) -> Result<(), CallError> {
        let ticket = self.begin(CallOperation::Accept, None)?;
        let call_id = ticket.call_id();
        tracing::info!("Accepting call {}", call_id);

        let audio_input = self.defaults.audio_input;
        self.transition(ticket, None, || {
            self.session.invoke("set_audio_input", |api, session| unsafe {
                (api.set_audio_input)(session, audio_input)
            })?;
            self.session
                .invoke("set_outgoing_audio_enabled", |api, session| unsafe {
                    (api.set_outgoing_audio_enabled)(session, true)
                })?;
            self.session.invoke("accept_call", |api, session| unsafe {
                (api.accept_call)(session, call_id.as_u64())
            })?;
            Ok(())
        })
    }

    /// Lehnt den eingehenden Call ab
    pub fn ignore_call(&self) -> Result<(), CallError> {
        let ticket = self.begin(CallOperation::Ignore, None)?;
        let call_id = ticket.call_id();
        tracing::info!("Ignoring call {}", call_id);

        self.transition(ticket, None, || {
            self.session.invoke("ignore_call", |api, session| unsafe {
                (api.ignore_call)(session, call_id.as_u64())
            })?;
            Ok(())
        })
    }

    /// Beendet den aktiven Call
    pub fn hangup_call(&self) -> Result<(), CallError> {
        let ticket = self.begin(CallOperation::Hangup, None)?;
        tracing::info!("Hanging up call {}", ticket.call_id());

        self.transition(ticket, None, || {
            self.session
                .invoke("hangup_call", |api, session| unsafe { (api.hangup_call)(session) })?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------------

    /// Schaltet ausgehendes Video ein oder aus
    pub fn enable_outgoing_video(&self, enable: bool) -> Result<(), CallError> {
        self.begin(CallOperation::EnableOutgoingVideo, None)?;
        tracing::info!("Outgoing video: {}", enable);

        self.session
            .invoke("set_outgoing_video_enabled", |api, session| unsafe {
                (api.set_outgoing_video_enabled)(session, enable)
            })?;
        Ok(())
    }

    /// Sendet einen Video-Frame ohne Pufferung
    pub fn send_video_frame(
        &self,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        data: &[u8],
    ) -> Result<(), CallError> {
        self.begin(CallOperation::SendVideoFrame, None)?;

        if width == 0 || height == 0 {
            return Err(CallError::InvalidFrame(format!(
                "zero dimension {}x{}",
                width, height
            )));
        }
        if let Some(expected) = pixel_format.frame_len(width, height) {
            if data.len() != expected {
                return Err(CallError::InvalidFrame(format!(
                    "{:?} {}x{} needs {} bytes, got {}",
                    pixel_format,
                    width,
                    height,
                    expected,
                    data.len()
                )));
            }
        }

        let mut frame = self.frame();
        let blob = encode_blob(&mut frame, data)?;
        self.session.invoke("send_video_frame", |api, session| unsafe {
            (api.send_video_frame)(session, width, height, pixel_format.as_raw(), blob)
        })?;
        Ok(())
    }

    /// Fordert den letzten Remote-Frame über den Video-Callback an
    ///
    /// Gibt `true` zurück, wenn die Engine einen Frame ausgeliefert hat.
    pub fn request_remote_video_frame(&self) -> Result<bool, CallError> {
        self.begin(CallOperation::RequestRemoteVideoFrame, None)?;

        let delivered = self
            .session
            .query("retrieve_remote_video_frame", |api, session| unsafe {
                (api.retrieve_remote_video_frame)(session)
            })?;
        Ok(delivered > 0)
    }

    /// Übergibt die UUID des lokalen Users (in jeder Phase erlaubt)
    pub fn set_self_uuid(&self, uuid: Uuid) -> Result<(), CallError> {
        if self.session.is_closed() {
            return Err(CallError::Engine(EngineError::SessionClosed));
        }
        if inside_callback() {
            tracing::warn!("Refusing set_self_uuid from inside an engine callback");
            return Err(CallError::Reentrant("set_self_uuid"));
        }
        tracing::info!("Setting self uuid {}", uuid);

        let mut frame = self.frame();
        let text = encode_text(&mut frame, &uuid.hyphenated().to_string())?;
        self.session.invoke("set_self_uuid", |api, session| unsafe {
            (api.set_self_uuid)(session, text)
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Prüft Session, Reentrancy und Phase vor jedem Foreign Call
    fn begin(&self, operation: CallOperation, call_id: Option<CallId>) -> Result<Ticket, CallError> {
        if self.session.is_closed() {
            return Err(CallError::Engine(EngineError::SessionClosed));
        }
        if inside_callback() {
            tracing::warn!("Refusing {} from inside an engine callback", operation);
            return Err(CallError::Reentrant(operation.name()));
        }
        self.calls.validate(operation, call_id).map_err(|rejection| {
            let err = CallError::rejected(operation, rejection);
            tracing::warn!("Rejected {}: {}", operation, err);
            err
        })
    }

    /// Übernimmt die Transition vor `invoke` und nimmt sie bei einem Fehler
    /// zurück
    fn transition<T>(
        &self,
        ticket: Ticket,
        peer_id: Option<String>,
        invoke: impl FnOnce() -> Result<T, CallError>,
    ) -> Result<T, CallError> {
        let Some(applied) = self.calls.commit(ticket, peer_id) else {
            return Err(CallError::InvalidTransition {
                operation: ticket.operation(),
                phase: self.calls.phase(),
            });
        };
        invoke().map_err(|err| {
            self.calls.rollback(applied);
            err
        })
    }

    fn frame(&self) -> MarshalFrame {
        self.session.engine().arena().frame()
    }
}

// ============================================================================
// TESTS
// ============================================================================
