//! In-Process Fake Engine für Tests
//!
//! Stellt eine echte `extern "C"` Entry-Point-Tabelle bereit, die jeden
//! Aufruf pro Session aufzeichnet und die registrierten Callbacks von
//! beliebigen Threads aus feuern kann.

use super::ffi::{CallbackTable, EntryPoints, RawSession};
use crate::codec::{
    decode_blob, decode_blob_batch, decode_text, encode_blob_batch, ArenaPolicy, BatchRecord,
    BlobRecord, BoundaryArena, VideoFrameRecord,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicI64, Ordering};

/// Status, den ein per [`reject_next`] abgelehnter Aufruf zurückgibt
pub const REJECT_STATUS: i64 = -7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    SetSelfUuid(String),
    ReceivedOffer {
        peer_id: String,
        call_id: u64,
        media_type: i32,
        sender_device: u32,
        receiver_device: u32,
        sender_key: Vec<u8>,
        receiver_key: Vec<u8>,
        opaque: Vec<u8>,
        age_secs: u64,
    },
    ReceivedAnswer {
        peer_id: String,
        call_id: u64,
        sender_device: u32,
        sender_key: Vec<u8>,
        receiver_key: Vec<u8>,
        opaque: Vec<u8>,
    },
    CreateOutgoingCall {
        peer_id: String,
        video_enabled: bool,
        local_device: u32,
        call_id: u64,
    },
    ProceedCall {
        call_id: u64,
        bandwidth_mode: i32,
        audio_levels_interval_ms: i32,
        ice_user: String,
        ice_password: String,
        candidates: Vec<Vec<u8>>,
    },
    ReceivedIce {
        call_id: u64,
        sender_device: u32,
        candidates: Vec<Vec<u8>>,
    },
    AcceptCall(u64),
    IgnoreCall(u64),
    HangupCall,
    MessageSent(u64),
    SetAudioInput(u16),
    SetAudioOutput(u16),
    SetOutgoingAudioEnabled(bool),
    SetOutgoingVideoEnabled(bool),
    SendVideoFrame {
        width: u32,
        height: u32,
        pixel_format: i32,
        data: Vec<u8>,
    },
    RetrieveRemoteVideoFrame,
    DestroySession,
}

type Hook = Box<dyn FnOnce() + Send>;

struct FakeSession {
    /// Die Engine behält den Pointer statt die Tabelle zu kopieren
    callbacks: &'static CallbackTable,
    recorded: Vec<Recorded>,
    reject: Vec<&'static str>,
    hooks: Vec<(&'static str, Hook)>,
    remote_frame: Option<(i32, i32, Vec<u8>)>,
    current_call: u64,
}

static SESSIONS: Lazy<Mutex<HashMap<RawSession, FakeSession>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static GREETINGS: Lazy<Mutex<Vec<String>>> = Lazy::new(|| Mutex::new(Vec::new()));
static NEXT_SESSION: AtomicI64 = AtomicI64::new(1);

// ============================================================================
// INSPECTION
// ============================================================================

pub fn greetings() -> Vec<String> {
    GREETINGS.lock().clone()
}

pub fn recorded(session: RawSession) -> Vec<Recorded> {
    SESSIONS
        .lock()
        .get(&session)
        .map(|s| s.recorded.clone())
        .unwrap_or_default()
}

/// Adresse der Callback-Tabelle, die bei `create_session` übergeben wurde
pub fn registered_table(session: RawSession) -> Option<*const CallbackTable> {
    SESSIONS
        .lock()
        .get(&session)
        .map(|s| s.callbacks as *const CallbackTable)
}

/// Call-IDs aller Acknowledgments in Reihenfolge
pub fn acks(session: RawSession) -> Vec<u64> {
    recorded(session)
        .into_iter()
        .filter_map(|r| match r {
            Recorded::MessageSent(call_id) => Some(call_id),
            _ => None,
        })
        .collect()
}

/// Der nächste Aufruf von `entry_point` gibt [`REJECT_STATUS`] zurück
pub fn reject_next(session: RawSession, entry_point: &'static str) {
    if let Some(s) = SESSIONS.lock().get_mut(&session) {
        s.reject.push(entry_point);
    }
}

/// Der nächste erfolgreiche Aufruf von `entry_point` führt `hook` aus,
/// bevor er zurückkehrt (z.B. um Callbacks synchron zu feuern)
pub fn on_next(
    session: RawSession,
    entry_point: &'static str,
    hook: impl FnOnce() + Send + 'static,
) {
    if let Some(s) = SESSIONS.lock().get_mut(&session) {
        s.hooks.push((entry_point, Box::new(hook)));
    }
}

/// Frame, den `retrieve_remote_video_frame` ausliefert
pub fn set_remote_frame(session: RawSession, width: i32, height: i32, data: Vec<u8>) {
    if let Some(s) = SESSIONS.lock().get_mut(&session) {
        s.remote_frame = Some((width, height, data));
    }
}

// ============================================================================
// FIRING CALLBACKS
// ============================================================================

fn callbacks(session: RawSession) -> &'static CallbackTable {
    match SESSIONS.lock().get(&session) {
        Some(s) => s.callbacks,
        None => panic!("unknown fake session {}", session),
    }
}

fn blob(bytes: &[u8]) -> BlobRecord {
    BlobRecord {
        len: bytes.len() as u64,
        data: if bytes.is_empty() {
            std::ptr::null()
        } else {
            bytes.as_ptr()
        },
    }
}

pub fn fire_status(session: RawSession, call_id: u64, peer_id: u64, direction: i32, kind: i32) {
    let table = callbacks(session);
    unsafe { (table.on_status)(table.context, call_id, peer_id, direction, kind) }
}

pub fn fire_answer(session: RawSession, call_id: u64, payload: &[u8]) {
    fire_answer_record(session, call_id, blob(payload));
}

pub fn fire_answer_record(session: RawSession, call_id: u64, record: BlobRecord) {
    let table = callbacks(session);
    unsafe { (table.on_answer)(table.context, call_id, record) }
}

pub fn fire_offer(session: RawSession, call_id: u64, payload: &[u8]) {
    let table = callbacks(session);
    unsafe { (table.on_offer)(table.context, call_id, blob(payload)) }
}

pub fn fire_ice(session: RawSession, call_id: u64, rows: &[Vec<u8>]) {
    // Die Engine besitzt ihren eigenen Speicher
    let arena = BoundaryArena::new(ArenaPolicy::Release, None);
    let mut frame = arena.frame();
    let batch = match encode_blob_batch(&mut frame, rows) {
        Ok(batch) => batch,
        Err(e) => panic!("fake engine could not build batch: {}", e),
    };
    fire_ice_record(session, call_id, batch);
}

pub fn fire_ice_record(session: RawSession, call_id: u64, batch: *const BatchRecord) {
    let table = callbacks(session);
    unsafe { (table.on_ice)(table.context, call_id, batch) }
}

pub fn fire_video_frame(session: RawSession, call_id: u64, width: i32, height: i32, data: &[u8]) {
    fire_video_record(
        session,
        call_id,
        VideoFrameRecord {
            data: data.as_ptr(),
            width,
            height,
            byte_size: data.len() as u64,
        },
    );
}

pub fn fire_video_record(session: RawSession, call_id: u64, record: VideoFrameRecord) {
    let table = callbacks(session);
    unsafe { (table.on_video_frame)(table.context, call_id, record) }
}

// ============================================================================
// ENTRY POINTS
// ============================================================================

fn set_current_call(session: RawSession, call_id: u64) {
    if let Some(s) = SESSIONS.lock().get_mut(&session) {
        s.current_call = call_id;
    }
}

/// Zeichnet einen Aufruf auf; unbekannte Sessions liefern `-1`
///
/// Ein registrierter Hook läuft ohne gehaltenen Lock.
fn record(session: RawSession, entry_point: &'static str, call: Recorded) -> i64 {
    let hook = {
        let mut sessions = SESSIONS.lock();
        let Some(s) = sessions.get_mut(&session) else {
            return -1;
        };
        if let Some(pos) = s.reject.iter().position(|e| *e == entry_point) {
            s.reject.remove(pos);
            return REJECT_STATUS;
        }
        s.recorded.push(call);
        s.hooks
            .iter()
            .position(|(e, _)| *e == entry_point)
            .map(|pos| s.hooks.remove(pos).1)
    };
    if let Some(hook) = hook {
        hook();
    }
    1
}

unsafe fn bytes(record: BlobRecord) -> Vec<u8> {
    decode_blob(&record).unwrap_or_default()
}

unsafe fn text(record: BlobRecord) -> String {
    decode_text(&record).unwrap_or_default()
}

unsafe fn rows(batch: *const BatchRecord) -> Vec<Vec<u8>> {
    decode_blob_batch(batch).unwrap_or_default()
}

unsafe extern "C" fn init(greeting: BlobRecord) -> i64 {
    GREETINGS.lock().push(text(greeting));
    1
}

unsafe extern "C" fn init_failing(_greeting: BlobRecord) -> i64 {
    -3
}

unsafe extern "C" fn create_session(callbacks: *const CallbackTable) -> RawSession {
    let id = NEXT_SESSION.fetch_add(1, Ordering::SeqCst);
    SESSIONS.lock().insert(
        id,
        FakeSession {
            callbacks: &*callbacks,
            recorded: Vec::new(),
            reject: Vec::new(),
            hooks: Vec::new(),
            remote_frame: None,
            current_call: 0,
        },
    );
    id
}

unsafe extern "C" fn create_session_failing(_callbacks: *const CallbackTable) -> RawSession {
    0
}

unsafe extern "C" fn destroy_session(session: RawSession) -> i64 {
    record(session, "destroy_session", Recorded::DestroySession)
}

unsafe extern "C" fn set_self_uuid(session: RawSession, uuid: BlobRecord) -> i64 {
    record(session, "set_self_uuid", Recorded::SetSelfUuid(text(uuid)))
}

unsafe extern "C" fn received_offer(
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
) -> i64 {
    let call = Recorded::ReceivedOffer {
        peer_id: text(peer_id),
        call_id,
        media_type,
        sender_device,
        receiver_device,
        sender_key: bytes(sender_key),
        receiver_key: bytes(receiver_key),
        opaque: bytes(opaque),
        age_secs,
    };
    let status = record(session, "received_offer", call);
    if status > 0 {
        set_current_call(session, call_id);
    }
    status
}

unsafe extern "C" fn received_answer(
    session: RawSession,
    peer_id: BlobRecord,
    call_id: u64,
    sender_device: u32,
    sender_key: BlobRecord,
    receiver_key: BlobRecord,
    opaque: BlobRecord,
) -> i64 {
    let call = Recorded::ReceivedAnswer {
        peer_id: text(peer_id),
        call_id,
        sender_device,
        sender_key: bytes(sender_key),
        receiver_key: bytes(receiver_key),
        opaque: bytes(opaque),
    };
    record(session, "received_answer", call)
}

unsafe extern "C" fn create_outgoing_call(
    session: RawSession,
    peer_id: BlobRecord,
    video_enabled: bool,
    local_device: u32,
    call_id: u64,
) -> i64 {
    let call = Recorded::CreateOutgoingCall {
        peer_id: text(peer_id),
        video_enabled,
        local_device,
        call_id,
    };
    let status = record(session, "create_outgoing_call", call);
    if status > 0 {
        set_current_call(session, call_id);
    }
    status
}

unsafe extern "C" fn proceed_call(
    session: RawSession,
    call_id: u64,
    bandwidth_mode: i32,
    audio_levels_interval_ms: i32,
    ice_user: BlobRecord,
    ice_password: BlobRecord,
    candidates: *const BatchRecord,
) -> i64 {
    let call = Recorded::ProceedCall {
        call_id,
        bandwidth_mode,
        audio_levels_interval_ms,
        ice_user: text(ice_user),
        ice_password: text(ice_password),
        candidates: rows(candidates),
    };
    record(session, "proceed_call", call)
}

unsafe extern "C" fn received_ice(
    session: RawSession,
    call_id: u64,
    sender_device: u32,
    candidates: *const BatchRecord,
) -> i64 {
    let call = Recorded::ReceivedIce {
        call_id,
        sender_device,
        candidates: rows(candidates),
    };
    record(session, "received_ice", call)
}

unsafe extern "C" fn accept_call(session: RawSession, call_id: u64) -> i64 {
    record(session, "accept_call", Recorded::AcceptCall(call_id))
}

unsafe extern "C" fn ignore_call(session: RawSession, call_id: u64) -> i64 {
    record(session, "ignore_call", Recorded::IgnoreCall(call_id))
}

unsafe extern "C" fn hangup_call(session: RawSession) -> i64 {
    record(session, "hangup_call", Recorded::HangupCall)
}

unsafe extern "C" fn message_sent(session: RawSession, call_id: u64) -> i64 {
    record(session, "message_sent", Recorded::MessageSent(call_id))
}

unsafe extern "C" fn set_audio_input(session: RawSession, index: u16) -> i64 {
    record(session, "set_audio_input", Recorded::SetAudioInput(index))
}

unsafe extern "C" fn set_audio_output(session: RawSession, index: u16) -> i64 {
    record(session, "set_audio_output", Recorded::SetAudioOutput(index))
}

unsafe extern "C" fn set_outgoing_audio_enabled(session: RawSession, enable: bool) -> i64 {
    record(
        session,
        "set_outgoing_audio_enabled",
        Recorded::SetOutgoingAudioEnabled(enable),
    )
}

unsafe extern "C" fn set_outgoing_video_enabled(session: RawSession, enable: bool) -> i64 {
    record(
        session,
        "set_outgoing_video_enabled",
        Recorded::SetOutgoingVideoEnabled(enable),
    )
}

unsafe extern "C" fn send_video_frame(
    session: RawSession,
    width: u32,
    height: u32,
    pixel_format: i32,
    frame: BlobRecord,
) -> i64 {
    let call = Recorded::SendVideoFrame {
        width,
        height,
        pixel_format,
        data: bytes(frame),
    };
    record(session, "send_video_frame", call)
}

/// Liefert den hinterlegten Frame synchron über den Video-Callback aus
unsafe extern "C" fn retrieve_remote_video_frame(session: RawSession) -> i64 {
    let status = record(
        session,
        "retrieve_remote_video_frame",
        Recorded::RetrieveRemoteVideoFrame,
    );
    if status <= 0 {
        return status;
    }

    let pending = {
        let mut sessions = SESSIONS.lock();
        sessions
            .get_mut(&session)
            .and_then(|s| {
                let call_id = s.current_call;
                s.remote_frame
                    .take()
                    .map(|frame| (s.callbacks, call_id, frame))
            })
    };

    match pending {
        Some((table, call_id, (width, height, data))) => {
            let record = VideoFrameRecord {
                data: data.as_ptr(),
                width,
                height,
                byte_size: data.len() as u64,
            };
            (table.on_video_frame)(table.context, call_id, record);
            1
        }
        None => 0,
    }
}

pub fn entry_points() -> EntryPoints {
    EntryPoints {
        init,
        create_session,
        destroy_session,
        set_self_uuid,
        received_offer,
        received_answer,
        create_outgoing_call,
        proceed_call,
        received_ice,
        accept_call,
        ignore_call,
        hangup_call,
        message_sent,
        set_audio_input,
        set_audio_output,
        set_outgoing_audio_enabled,
        set_outgoing_video_enabled,
        send_video_frame,
        retrieve_remote_video_frame,
    }
}

pub fn entry_points_failing_init() -> EntryPoints {
    EntryPoints {
        init: init_failing,
        ..entry_points()
    }
}

pub fn entry_points_failing_session() -> EntryPoints {
    EntryPoints {
        create_session: create_session_failing,
        ..entry_points()
    }
}

// ============================================================================
// NULL CALLBACKS
// ============================================================================

unsafe extern "C" fn ignore_status(_: *mut c_void, _: u64, _: u64, _: i32, _: i32) {}
unsafe extern "C" fn ignore_signal(_: *mut c_void, _: u64, _: BlobRecord) {}
unsafe extern "C" fn ignore_ice(_: *mut c_void, _: u64, _: *const BatchRecord) {}
unsafe extern "C" fn ignore_video(_: *mut c_void, _: u64, _: VideoFrameRecord) {}

static NULL_CALLBACKS: CallbackTable = CallbackTable {
    context: std::ptr::null_mut(),
    on_status: ignore_status,
    on_answer: ignore_signal,
    on_offer: ignore_signal,
    on_ice: ignore_ice,
    on_video_frame: ignore_video,
};

/// Callback-Tabelle ohne Host-Seite
pub fn null_callbacks() -> &'static CallbackTable {
    &NULL_CALLBACKS
}
