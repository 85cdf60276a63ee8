//! Foreign Entry Points
//!
//! Die native Engine wird ausschließlich über eine Tabelle von
//! `extern "C"` Funktionen angesprochen. Callbacks zurück in den Host
//! laufen über eine [`CallbackTable`], die bei der Session-Erstellung
//! registriert wird.
//!
//! Jeder Entry Point gibt einen `i64` Status zurück; Werte `<= 0` sind
//! Fehler (Ausnahme: `retrieve_remote_video_frame`, dort bedeutet `0`
//! "kein Frame").

use super::handle::EngineError;
use crate::codec::{BatchRecord, BlobRecord, VideoFrameRecord};
use std::ffi::c_void;

/// Roher Session-Handle der Engine
pub type RawSession = i64;

// ============================================================================
// CALLBACKS (Engine -> Host)
// ============================================================================

pub type StatusCallback = unsafe extern "C" fn(
    context: *mut c_void,
    call_id: u64,
    peer_id: u64,
    direction: i32,
    kind: i32,
);

/// Gemeinsame Signatur für Answer- und Offer-Callbacks
pub type SignalCallback = unsafe extern "C" fn(context: *mut c_void, call_id: u64, payload: BlobRecord);

pub type IceCallback =
    unsafe extern "C" fn(context: *mut c_void, call_id: u64, candidates: *const BatchRecord);

pub type VideoFrameCallback =
    unsafe extern "C" fn(context: *mut c_void, call_id: u64, frame: VideoFrameRecord);

/// Callback-Tabelle, die der Engine bei `create_session` übergeben wird
///
/// `context` wird bei jedem Aufruf unverändert zurückgegeben.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CallbackTable {
    pub context: *mut c_void,
    pub on_status: StatusCallback,
    pub on_answer: SignalCallback,
    pub on_offer: SignalCallback,
    pub on_ice: IceCallback,
    pub on_video_frame: VideoFrameCallback,
}

// Der Context zeigt auf einen prozessweit lebenden, synchronisierten Wert
unsafe impl Send for CallbackTable {}
unsafe impl Sync for CallbackTable {}

// ============================================================================
// ENTRY POINTS (Host -> Engine)
// ============================================================================

/// Entry-Point-Tabelle einer geladenen Engine
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EntryPoints {
    pub init: unsafe extern "C" fn(greeting: BlobRecord) -> i64,
    /// `callbacks` bleibt bis zum Prozessende gültig und darf gespeichert werden
    pub create_session: unsafe extern "C" fn(callbacks: *const CallbackTable) -> RawSession,
    pub destroy_session: unsafe extern "C" fn(session: RawSession) -> i64,
    pub set_self_uuid: unsafe extern "C" fn(session: RawSession, uuid: BlobRecord) -> i64,
    pub received_offer: unsafe extern "C" fn(
        session: RawSession,
        peer_id: BlobRecord,
        call_id: u64,
        media_type: i32,
        sender_device: u32,
        receiver_device: u32,
        sender_key: BlobRecord,
        receiver_key: BlobRecord,
        opaque: BlobRecord,
        age_secs: u64,
    ) -> i64,
    pub received_answer: unsafe extern "C" fn(
        session: RawSession,
        peer_id: BlobRecord,
        call_id: u64,
        sender_device: u32,
        sender_key: BlobRecord,
        receiver_key: BlobRecord,
        opaque: BlobRecord,
    ) -> i64,
    pub create_outgoing_call: unsafe extern "C" fn(
        session: RawSession,
        peer_id: BlobRecord,
        video_enabled: bool,
        local_device: u32,
        call_id: u64,
    ) -> i64,
    pub proceed_call: unsafe extern "C" fn(
        session: RawSession,
        call_id: u64,
        bandwidth_mode: i32,
        audio_levels_interval_ms: i32,
        ice_user: BlobRecord,
        ice_password: BlobRecord,
        candidates: *const BatchRecord,
    ) -> i64,
    pub received_ice: unsafe extern "C" fn(
        session: RawSession,
        call_id: u64,
        sender_device: u32,
        candidates: *const BatchRecord,
    ) -> i64,
    pub accept_call: unsafe extern "C" fn(session: RawSession, call_id: u64) -> i64,
    pub ignore_call: unsafe extern "C" fn(session: RawSession, call_id: u64) -> i64,
    pub hangup_call: unsafe extern "C" fn(session: RawSession) -> i64,
    /// Acknowledgment für einen zugestellten Callback
    pub message_sent: unsafe extern "C" fn(session: RawSession, call_id: u64) -> i64,
    pub set_audio_input: unsafe extern "C" fn(session: RawSession, index: u16) -> i64,
    pub set_audio_output: unsafe extern "C" fn(session: RawSession, index: u16) -> i64,
    pub set_outgoing_audio_enabled: unsafe extern "C" fn(session: RawSession, enable: bool) -> i64,
    pub set_outgoing_video_enabled: unsafe extern "C" fn(session: RawSession, enable: bool) -> i64,
    pub send_video_frame: unsafe extern "C" fn(
        session: RawSession,
        width: u32,
        height: u32,
        pixel_format: i32,
        frame: BlobRecord,
    ) -> i64,
    pub retrieve_remote_video_frame: unsafe extern "C" fn(session: RawSession) -> i64,
}

// ============================================================================
// LOADER
// ============================================================================

/// Liefert die Entry-Point-Tabelle genau einer Engine-Implementierung
///
/// Laden, Entpacken und Versionsprüfung der nativen Library sind Sache des
/// Loaders.
pub trait EngineLoader {
    fn load(&self) -> Result<EntryPoints, EngineError>;

    /// Name für Logs
    fn describe(&self) -> String {
        "native engine".to_string()
    }
}

/// Loader für eine zur Build-Zeit gewählte Tabelle
#[derive(Debug, Clone, Copy)]
pub struct StaticLoader {
    name: &'static str,
    entry_points: EntryPoints,
}

impl StaticLoader {
    pub const fn new(name: &'static str, entry_points: EntryPoints) -> Self {
        Self { name, entry_points }
    }
}

impl EngineLoader for StaticLoader {
    fn load(&self) -> Result<EntryPoints, EngineError> {
        Ok(self.entry_points)
    }

    fn describe(&self) -> String {
        self.name.to_string()
    }
}
