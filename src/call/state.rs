//! Call State
//!
//! Hält den einzigen aktiven Call und entscheidet, welche Operationen in
//! welcher Phase erlaubt sind. Lifecycle und Callback Dispatcher greifen
//! über dieselbe [`CallStateCell`] zu.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Opaker 64-bit Identifier eines Calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Zufällige Call-ID für Hosts ohne eigene ID-Vergabe
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for CallId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Geräte-ID eines Teilnehmers
pub type DeviceId = u32;

/// Richtung eines Calls aus Sicht des Hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

impl CallDirection {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Incoming),
            1 => Some(Self::Outgoing),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Self::Incoming => 0,
            Self::Outgoing => 1,
        }
    }
}

// ============================================================================
// PHASES & OPERATIONS
// ============================================================================

/// Phase des aktiven Calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    /// Noch kein Call
    Idle,
    /// Eingehendes Offer wurde an die Engine übergeben
    OfferReceived,
    /// Ausgehender Call wurde angefordert
    OutgoingRequested,
    /// ICE/Answer werden ausgetauscht
    Negotiating,
    /// Call ist verbunden
    Active,
    /// Call beendet (kein automatischer Rückfall auf Idle)
    Terminated,
}

impl CallPhase {
    /// Ein Call existiert und ist noch nicht beendet
    pub fn is_live(self) -> bool {
        matches!(
            self,
            Self::OfferReceived | Self::OutgoingRequested | Self::Negotiating | Self::Active
        )
    }
}

/// Alle Operationen, die den Call-State lesen oder verändern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOperation {
    ReceivedOffer,
    ReceivedAnswer,
    StartOutgoingCall,
    Proceed,
    ReceivedIce,
    Accept,
    Ignore,
    Hangup,
    EnableOutgoingVideo,
    SendVideoFrame,
    RequestRemoteVideoFrame,
    /// Engine meldet "connected" für den aktiven Call
    RemoteConnected,
    /// Engine meldet das Ende des aktiven Calls
    RemoteEnded,
}

impl CallOperation {
    pub fn name(self) -> &'static str {
        match self {
            Self::ReceivedOffer => "received_offer",
            Self::ReceivedAnswer => "received_answer",
            Self::StartOutgoingCall => "start_outgoing_call",
            Self::Proceed => "proceed",
            Self::ReceivedIce => "received_ice",
            Self::Accept => "accept_call",
            Self::Ignore => "ignore_call",
            Self::Hangup => "hangup_call",
            Self::EnableOutgoingVideo => "enable_outgoing_video",
            Self::SendVideoFrame => "send_video_frame",
            Self::RequestRemoteVideoFrame => "request_remote_video_frame",
            Self::RemoteConnected => "remote_connected",
            Self::RemoteEnded => "remote_ended",
        }
    }

    /// Operation legt einen neuen Call an
    pub fn starts_call(self) -> bool {
        matches!(self, Self::ReceivedOffer | Self::StartOutgoingCall)
    }

    /// Prüft ob die Operation in `phase` erlaubt ist
    ///
    /// `direction` ist die Richtung des aktiven Calls (falls vorhanden).
    pub fn permitted_in(self, phase: CallPhase, direction: Option<CallDirection>) -> bool {
        use CallPhase::*;
        match self {
            Self::ReceivedOffer | Self::StartOutgoingCall => matches!(phase, Idle | Terminated),
            Self::ReceivedAnswer => phase == OutgoingRequested,
            Self::Proceed => matches!(phase, OfferReceived | Negotiating),
            Self::ReceivedIce | Self::RemoteEnded => phase.is_live(),
            // Ein eingehender Call kann auch nach proceed noch angenommen werden
            Self::Accept | Self::Ignore => {
                phase == OfferReceived
                    || (phase == Negotiating && direction == Some(CallDirection::Incoming))
            }
            Self::Hangup => matches!(phase, Active | Negotiating),
            Self::EnableOutgoingVideo | Self::SendVideoFrame | Self::RequestRemoteVideoFrame => {
                phase == Active
            }
            Self::RemoteConnected => phase == Negotiating,
        }
    }

    /// Zielphase nach erfolgreicher Operation
    pub fn next_phase(self, phase: CallPhase) -> CallPhase {
        match self {
            Self::ReceivedOffer => CallPhase::OfferReceived,
            Self::StartOutgoingCall => CallPhase::OutgoingRequested,
            Self::ReceivedAnswer | Self::Proceed => CallPhase::Negotiating,
            Self::Accept | Self::RemoteConnected => CallPhase::Active,
            Self::Ignore | Self::Hangup | Self::RemoteEnded => CallPhase::Terminated,
            Self::ReceivedIce
            | Self::EnableOutgoingVideo
            | Self::SendVideoFrame
            | Self::RequestRemoteVideoFrame => phase,
        }
    }
}

impl fmt::Display for CallOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// ACTIVE CALL & EVENTS
// ============================================================================

/// Snapshot des aktiven Calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveCall {
    pub call_id: CallId,
    pub direction: CallDirection,
    pub peer_id: Option<String>,
    pub phase: CallPhase,
    pub started_at: DateTime<Utc>,
    pub phase_since: DateTime<Utc>,
}

/// Events der CallStateCell
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    /// Phase des aktiven Calls hat sich geändert
    PhaseChanged {
        call_id: CallId,
        previous: CallPhase,
        phase: CallPhase,
        at: DateTime<Utc>,
    },
    /// Callback gehört nicht zum aktiven Call
    StaleCallback {
        call_id: CallId,
        active: Option<CallId>,
    },
}

/// Ergebnis einer erfolgreichen Validierung
///
/// Hält fest, welchen Zustand die Operation gesehen hat. Beim Commit wird
/// geprüft, dass sich dieser Zustand nicht geändert hat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    operation: CallOperation,
    call_id: CallId,
    from: CallPhase,
}

impl Ticket {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn operation(&self) -> CallOperation {
        self.operation
    }

    pub fn from_phase(&self) -> CallPhase {
        self.from
    }
}

/// Transition, die vor dem Foreign Call übernommen wurde
///
/// Hält den vorherigen State, damit [`CallStateCell::rollback`] ihn
/// wiederherstellen kann.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    ticket: Ticket,
    previous: Option<ActiveCall>,
    phase: CallPhase,
}

impl Applied {
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }
}

/// Grund einer abgelehnten Validierung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NoActiveCall,
    InvalidPhase(CallPhase),
    CallIdMismatch { requested: CallId, active: CallId },
}

// ============================================================================
// CALL STATE CELL
// ============================================================================

/// Geteilter, synchronisierter Call-State
#[derive(Clone)]
pub struct CallStateCell {
    state: Arc<RwLock<Option<ActiveCall>>>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallStateCell {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            state: Arc::new(RwLock::new(None)),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    pub fn snapshot(&self) -> Option<ActiveCall> {
        self.state.read().clone()
    }

    /// Aktuelle Phase (Idle wenn noch kein Call existiert)
    pub fn phase(&self) -> CallPhase {
        self.state
            .read()
            .as_ref()
            .map(|c| c.phase)
            .unwrap_or(CallPhase::Idle)
    }

    pub fn active_call_id(&self) -> Option<CallId> {
        self.state.read().as_ref().map(|c| c.call_id)
    }

    /// Prüft eine Operation gegen den aktuellen State
    ///
    /// Für Operationen, die einen Call anlegen, ist `call_id` die neue ID.
    /// Sonst muss sie (falls angegeben) zum aktiven Call passen.
    pub fn validate(
        &self,
        operation: CallOperation,
        call_id: Option<CallId>,
    ) -> Result<Ticket, Rejection> {
        let state = self.state.read();
        let phase = state.as_ref().map(|c| c.phase).unwrap_or(CallPhase::Idle);
        let direction = state.as_ref().map(|c| c.direction);

        if operation.starts_call() {
            return match call_id {
                Some(call_id) if operation.permitted_in(phase, direction) => Ok(Ticket {
                    operation,
                    call_id,
                    from: phase,
                }),
                _ => Err(Rejection::InvalidPhase(phase)),
            };
        }

        let Some(active) = state.as_ref() else {
            return Err(Rejection::NoActiveCall);
        };

        if let Some(requested) = call_id {
            if requested != active.call_id {
                return Err(Rejection::CallIdMismatch {
                    requested,
                    active: active.call_id,
                });
            }
        }

        if !operation.permitted_in(active.phase, Some(active.direction)) {
            return Err(Rejection::InvalidPhase(active.phase));
        }

        Ok(Ticket {
            operation,
            call_id: active.call_id,
            from: active.phase,
        })
    }

    /// Übernimmt die Transition eines Tickets
    ///
    /// Wird vor dem Foreign Call aufgerufen, damit Callbacks der Engine den
    /// neuen State sehen. Gibt `None` zurück, wenn sich der State seit der
    /// Validierung geändert hat.
    pub fn commit(&self, ticket: Ticket, peer_id: Option<String>) -> Option<Applied> {
        let now = Utc::now();
        let next = ticket.operation.next_phase(ticket.from);

        let previous = {
            let mut state = self.state.write();
            let current_phase = state.as_ref().map(|c| c.phase).unwrap_or(CallPhase::Idle);

            if ticket.operation.starts_call() {
                if current_phase != ticket.from {
                    None
                } else {
                    let direction = match ticket.operation {
                        CallOperation::ReceivedOffer => CallDirection::Incoming,
                        _ => CallDirection::Outgoing,
                    };
                    let replaced = state.replace(ActiveCall {
                        call_id: ticket.call_id,
                        direction,
                        peer_id,
                        phase: next,
                        started_at: now,
                        phase_since: now,
                    });
                    Some(replaced)
                }
            } else {
                match state.as_mut() {
                    Some(call) if call.call_id == ticket.call_id && call.phase == ticket.from => {
                        let before = call.clone();
                        if call.phase != next {
                            call.phase = next;
                            call.phase_since = now;
                        }
                        if call.peer_id.is_none() {
                            call.peer_id = peer_id;
                        }
                        Some(Some(before))
                    }
                    _ => None,
                }
            }
        };

        match previous {
            Some(previous) => {
                if ticket.from != next || ticket.operation.starts_call() {
                    self.publish_phase(ticket.call_id, ticket.from, next, now);
                }
                Some(Applied {
                    ticket,
                    previous,
                    phase: next,
                })
            }
            None => {
                tracing::warn!(
                    "Call state changed before {} for call {} was applied",
                    ticket.operation,
                    ticket.call_id
                );
                None
            }
        }
    }

    /// Nimmt eine Transition zurück, deren Foreign Call fehlgeschlagen ist
    ///
    /// Hat die Engine den Call inzwischen selbst weiterbewegt, bleibt deren
    /// State stehen und es wird `false` zurückgegeben.
    pub fn rollback(&self, applied: Applied) -> bool {
        let Applied {
            ticket,
            previous,
            phase,
        } = applied;
        let now = Utc::now();

        let restored = {
            let mut state = self.state.write();
            match state.as_ref() {
                Some(call) if call.call_id == ticket.call_id && call.phase == phase => {
                    *state = previous;
                    true
                }
                _ => false,
            }
        };

        if !restored {
            tracing::debug!(
                "Not rolling back {} for call {}: state moved on",
                ticket.operation,
                ticket.call_id
            );
            return false;
        }

        tracing::warn!("Rolled back {} for call {}", ticket.operation, ticket.call_id);
        if phase != ticket.from || ticket.operation.starts_call() {
            self.publish_phase(ticket.call_id, phase, ticket.from, now);
        }
        true
    }

    /// Transition, die von der Engine gemeldet wurde
    ///
    /// Wird ignoriert, wenn `call_id` nicht der aktive Call ist oder die
    /// Phase die Transition nicht erlaubt.
    pub fn apply_remote(&self, operation: CallOperation, call_id: CallId) -> bool {
        let now = Utc::now();
        let previous = {
            let mut state = self.state.write();
            match state.as_mut() {
                Some(call)
                    if call.call_id == call_id
                        && operation.permitted_in(call.phase, Some(call.direction)) =>
                {
                    let previous = call.phase;
                    call.phase = operation.next_phase(previous);
                    call.phase_since = now;
                    Some(previous)
                }
                _ => None,
            }
        };

        match previous {
            Some(previous) => {
                let next = operation.next_phase(previous);
                tracing::info!(
                    "Engine moved call {} from {:?} to {:?}",
                    call_id,
                    previous,
                    next
                );
                self.publish_phase(call_id, previous, next, now);
                true
            }
            None => {
                tracing::debug!("Ignoring {} for call {}", operation, call_id);
                false
            }
        }
    }

    /// Meldet einen Callback, der nicht zum aktiven Call gehört
    pub fn report_stale(&self, call_id: CallId) {
        let active = self.active_call_id();
        tracing::warn!(
            "Callback for call {} while active call is {:?}",
            call_id,
            active
        );
        let _ = self
            .event_tx
            .send(CallEvent::StaleCallback { call_id, active });
    }

    fn publish_phase(
        &self,
        call_id: CallId,
        previous: CallPhase,
        phase: CallPhase,
        at: DateTime<Utc>,
    ) {
        tracing::info!("Call {} phase: {:?} -> {:?}", call_id, previous, phase);
        let _ = self.event_tx.send(CallEvent::PhaseChanged {
            call_id,
            previous,
            phase,
            at,
        });
    }
}

impl Default for CallStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallStateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStateCell")
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
