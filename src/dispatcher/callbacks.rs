//! Callback Dispatcher
//!
//! Die Engine ruft die `extern "C"` Thunks dieses Moduls auf eigenen
//! Threads auf. Jeder Thunk:
//! 1. löst den Context-Pointer in einen [`CallbackContext`] auf
//! 2. kopiert den Payload vollständig in Host-Speicher
//! 3. ruft den Listener auf (Fehler und Panics werden abgefangen)
//! 4. bestätigt das Event mit der Call-ID des Callbacks
//!
//! Der Context lebt bis zum Prozessende, damit späte Callbacks nach
//! `close()` nur ein geschlossenes Flag sehen.

use super::listener::{CallListener, CallStatus, ListenerError, StatusKind};
use crate::call::{CallId, CallOperation, CallStateCell, PixelFormat, VideoFrame};
use crate::codec::{
    decode_blob, decode_blob_batch, decode_raw, preview, BatchRecord, BlobRecord, OpaqueBlob,
    VideoFrameRecord,
};
use crate::engine::{CallbackTable, Session};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::any::Any;
use std::cell::Cell;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

// ============================================================================
// REENTRANCY GUARD
// ============================================================================

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Läuft der aktuelle Thread gerade in einem Listener-Callback?
pub fn inside_callback() -> bool {
    IN_CALLBACK.with(|flag| flag.get())
}

struct CallbackScope {
    previous: bool,
}

impl CallbackScope {
    fn enter() -> Self {
        Self {
            previous: IN_CALLBACK.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        IN_CALLBACK.with(|flag| flag.set(self.previous));
    }
}

// ============================================================================
// OUTCOME
// ============================================================================

/// Ergebnis eines einzelnen Callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { acknowledged: bool },
    /// Listener hat einen Fehler geliefert oder gepanict
    ListenerFailed { acknowledged: bool },
    /// Payload verletzt das Wire-Layout; kein Listener-Aufruf, kein Ack
    Malformed,
    /// Context wurde geschlossen
    Closed,
}

// ============================================================================
// CALLBACK CONTEXT
// ============================================================================

/// Zustand, den die Callback-Thunks sehen
pub struct CallbackContext {
    calls: CallStateCell,
    listener: RwLock<Option<Arc<dyn CallListener>>>,
    ack_target: RwLock<Option<Arc<Session>>>,
    table: OnceCell<CallbackTable>,
}

impl CallbackContext {
    /// Legt einen Context an, der bis zum Prozessende lebt
    pub fn register(listener: Arc<dyn CallListener>, calls: CallStateCell) -> &'static Self {
        Box::leak(Box::new(Self {
            calls,
            listener: RwLock::new(Some(listener)),
            ack_target: RwLock::new(None),
            table: OnceCell::new(),
        }))
    }

    /// Callback-Tabelle für `create_session`
    ///
    /// Lebt im Context, die Engine darf den Pointer also behalten.
    pub fn callback_table(&'static self) -> &'static CallbackTable {
        self.table.get_or_init(|| CallbackTable {
            context: self as *const Self as *mut c_void,
            on_status: status_thunk,
            on_answer: answer_thunk,
            on_offer: offer_thunk,
            on_ice: ice_thunk,
            on_video_frame: video_frame_thunk,
        })
    }

    /// Setzt die Session, über die Acks gesendet werden
    pub fn attach(&self, session: Arc<Session>) {
        let mut target = self.ack_target.write();
        if target.is_some() {
            tracing::warn!("Callback context already attached; replacing session");
        }
        *target = Some(session);
    }

    /// Schaltet alle weiteren Callbacks auf No-op
    ///
    /// Gibt Listener und Session frei.
    pub fn close(&self) {
        let listener = self.listener.write().take();
        let session = self.ack_target.write().take();
        if listener.is_some() || session.is_some() {
            tracing::info!("Callback context closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.listener.read().is_none()
    }

    fn listener(&self) -> Option<Arc<dyn CallListener>> {
        self.listener.read().clone()
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Status-Update: wird unverändert weitergereicht, ohne Ack
    pub fn dispatch_status(
        &self,
        call_id: CallId,
        peer_id: u64,
        direction: i32,
        kind: i32,
    ) -> DispatchOutcome {
        let Some(listener) = self.listener() else {
            return DispatchOutcome::Closed;
        };

        let status = CallStatus {
            call_id,
            peer_id,
            direction,
            kind,
        };
        tracing::debug!("<- status {:?}", status);

        match status.kind() {
            Some(StatusKind::Connected) => {
                self.calls.apply_remote(CallOperation::RemoteConnected, call_id);
            }
            Some(StatusKind::Ended) | Some(StatusKind::Concluded) => {
                self.calls.apply_remote(CallOperation::RemoteEnded, call_id);
            }
            _ => {}
        }

        if self.deliver("status", call_id, || listener.on_status(status)) {
            DispatchOutcome::Delivered {
                acknowledged: false,
            }
        } else {
            DispatchOutcome::ListenerFailed {
                acknowledged: false,
            }
        }
    }

    /// Answer-Payload für einen ausgehenden Call
    ///
    /// # Safety
    /// `payload` muss ein von der Engine geliefertes Blob-Record sein.
    pub unsafe fn dispatch_answer(&self, call_id: CallId, payload: &BlobRecord) -> DispatchOutcome {
        self.dispatch_signal("answer", call_id, payload, |listener, blob| {
            listener.on_answer(call_id, blob)
        })
    }

    /// Offer-Payload für einen ausgehenden Call
    ///
    /// # Safety
    /// `payload` muss ein von der Engine geliefertes Blob-Record sein.
    pub unsafe fn dispatch_offer(&self, call_id: CallId, payload: &BlobRecord) -> DispatchOutcome {
        self.dispatch_signal("offer", call_id, payload, |listener, blob| {
            listener.on_offer(call_id, blob)
        })
    }

    /// Lokale ICE-Kandidaten, in einem Listener-Aufruf zugestellt
    ///
    /// # Safety
    /// `batch` muss null sein oder auf ein gültiges Batch-Record zeigen.
    pub unsafe fn dispatch_ice(&self, call_id: CallId, batch: *const BatchRecord) -> DispatchOutcome {
        let Some(listener) = self.listener() else {
            return DispatchOutcome::Closed;
        };

        let rows = match decode_blob_batch(batch) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!("Dropping ICE callback for call {}: {}", call_id, e);
                return DispatchOutcome::Malformed;
            }
        };
        tracing::debug!("<- {} ICE candidates for call {}", rows.len(), call_id);

        let candidates = rows.into_iter().map(OpaqueBlob::new).collect();
        self.finish("ice", call_id, || {
            listener.on_ice_candidates(call_id, candidates)
        })
    }

    /// Remote-Video-Frame (RGBA)
    ///
    /// # Safety
    /// `frame.data` muss für `frame.byte_size` Bytes lesbar sein.
    pub unsafe fn dispatch_video_frame(
        &self,
        call_id: CallId,
        frame: &VideoFrameRecord,
    ) -> DispatchOutcome {
        let Some(listener) = self.listener() else {
            return DispatchOutcome::Closed;
        };

        if frame.width < 0 || frame.height < 0 {
            tracing::error!(
                "Dropping video frame for call {}: negative size {}x{}",
                call_id,
                frame.width,
                frame.height
            );
            return DispatchOutcome::Malformed;
        }

        let data = match decode_raw(frame.data, frame.byte_size) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!("Dropping video frame for call {}: {}", call_id, e);
                return DispatchOutcome::Malformed;
            }
        };
        tracing::trace!(
            "<- video frame {}x{} ({} bytes) for call {}",
            frame.width,
            frame.height,
            data.len(),
            call_id
        );

        let frame = VideoFrame {
            width: frame.width as u32,
            height: frame.height as u32,
            pixel_format: PixelFormat::Rgba,
            data,
        };
        self.finish("video frame", call_id, || {
            listener.on_video_frame(call_id, frame)
        })
    }

    unsafe fn dispatch_signal(
        &self,
        what: &'static str,
        call_id: CallId,
        payload: &BlobRecord,
        forward: impl FnOnce(&dyn CallListener, OpaqueBlob) -> Result<(), ListenerError>,
    ) -> DispatchOutcome {
        let Some(listener) = self.listener() else {
            return DispatchOutcome::Closed;
        };

        let bytes = match decode_blob(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Dropping {} callback for call {}: {}", what, call_id, e);
                return DispatchOutcome::Malformed;
            }
        };
        tracing::debug!(
            "<- {} for call {} ({} bytes: {})",
            what,
            call_id,
            bytes.len(),
            preview(&bytes)
        );

        self.finish(what, call_id, || {
            forward(listener.as_ref(), OpaqueBlob::new(bytes))
        })
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Listener aufrufen und danach bestätigen
    fn finish(
        &self,
        what: &'static str,
        call_id: CallId,
        deliver: impl FnOnce() -> Result<(), ListenerError>,
    ) -> DispatchOutcome {
        let delivered = self.deliver(what, call_id, deliver);
        let acknowledged = self.acknowledge(call_id);
        if delivered {
            DispatchOutcome::Delivered { acknowledged }
        } else {
            DispatchOutcome::ListenerFailed { acknowledged }
        }
    }

    fn deliver(
        &self,
        what: &'static str,
        call_id: CallId,
        deliver: impl FnOnce() -> Result<(), ListenerError>,
    ) -> bool {
        let _scope = CallbackScope::enter();
        match catch_unwind(AssertUnwindSafe(deliver)) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!("Listener failed on {} for call {}: {}", what, call_id, e);
                false
            }
            Err(panic) => {
                let e = ListenerError::Panicked(panic_message(panic.as_ref()));
                tracing::error!("Listener panicked on {} for call {}: {}", what, call_id, e);
                false
            }
        }
    }

    fn acknowledge(&self, call_id: CallId) -> bool {
        let Some(session) = self.ack_target.read().clone() else {
            tracing::warn!("No session attached; cannot acknowledge call {}", call_id);
            return false;
        };

        if self.calls.active_call_id() != Some(call_id) {
            self.calls.report_stale(call_id);
        }

        match session.acknowledge(call_id) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Acknowledgment for call {} failed: {}", call_id, e);
                false
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// THUNKS
// ============================================================================

unsafe fn context<'a>(ctx: *mut c_void) -> Option<&'a CallbackContext> {
    (ctx as *const CallbackContext).as_ref()
}

/// Kein Panic darf in den Foreign Frame zurück laufen
fn guard(what: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!("Panic while dispatching {} callback", what);
    }
}

unsafe extern "C" fn status_thunk(
    ctx: *mut c_void,
    call_id: u64,
    peer_id: u64,
    direction: i32,
    kind: i32,
) {
    let Some(context) = context(ctx) else { return };
    guard("status", || {
        context.dispatch_status(CallId::new(call_id), peer_id, direction, kind);
    });
}

unsafe extern "C" fn answer_thunk(ctx: *mut c_void, call_id: u64, payload: BlobRecord) {
    let Some(context) = context(ctx) else { return };
    guard("answer", || {
        context.dispatch_answer(CallId::new(call_id), &payload);
    });
}

unsafe extern "C" fn offer_thunk(ctx: *mut c_void, call_id: u64, payload: BlobRecord) {
    let Some(context) = context(ctx) else { return };
    guard("offer", || {
        context.dispatch_offer(CallId::new(call_id), &payload);
    });
}

unsafe extern "C" fn ice_thunk(ctx: *mut c_void, call_id: u64, batch: *const BatchRecord) {
    let Some(context) = context(ctx) else { return };
    guard("ice", || {
        context.dispatch_ice(CallId::new(call_id), batch);
    });
}

unsafe extern "C" fn video_frame_thunk(ctx: *mut c_void, call_id: u64, frame: VideoFrameRecord) {
    let Some(context) = context(ctx) else { return };
    guard("video frame", || {
        context.dispatch_video_frame(CallId::new(call_id), &frame);
    });
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallEvent, CallPhase};
    use crate::config::BridgeConfig;
    use crate::dispatcher::{ChannelListener, ListenerEvent};
    use crate::engine::fake;
    use crate::engine::{EngineHandle, StaticLoader};
    use parking_lot::Mutex;

    struct Harness {
        calls: CallStateCell,
        context: &'static CallbackContext,
        session: i64,
    }

    fn harness(listener: Arc<dyn CallListener>) -> Harness {
        let engine = EngineHandle::initialize(
            &StaticLoader::new("fake", fake::entry_points()),
            &BridgeConfig::default(),
        )
        .unwrap();
        let calls = CallStateCell::new();
        let context = CallbackContext::register(listener, calls.clone());
        let session = Arc::new(engine.create_session(context.callback_table()).unwrap());
        let raw = session.raw();
        context.attach(session);
        Harness {
            calls,
            context,
            session: raw,
        }
    }

    fn start_call(calls: &CallStateCell, call_id: u64) {
        let ticket = calls
            .validate(CallOperation::StartOutgoingCall, Some(CallId::new(call_id)))
            .unwrap();
        assert!(calls.commit(ticket, Some("alice".to_string())).is_some());
    }

    /// Listener, der immer fehlschlägt oder panict
    struct BrokenListener {
        panic: bool,
        calls: Mutex<usize>,
    }

    impl BrokenListener {
        fn fail(&self) -> Result<(), ListenerError> {
            *self.calls.lock() += 1;
            if self.panic {
                panic!("listener exploded");
            }
            Err(ListenerError::failed("host rejected event"))
        }
    }

    impl CallListener for BrokenListener {
        fn on_status(&self, _: CallStatus) -> Result<(), ListenerError> {
            self.fail()
        }
        fn on_answer(&self, _: CallId, _: OpaqueBlob) -> Result<(), ListenerError> {
            self.fail()
        }
        fn on_offer(&self, _: CallId, _: OpaqueBlob) -> Result<(), ListenerError> {
            self.fail()
        }
        fn on_ice_candidates(&self, _: CallId, _: Vec<OpaqueBlob>) -> Result<(), ListenerError> {
            self.fail()
        }
    }

    /// Zeichnet auf, ob der Listener im Callback-Scope läuft
    #[derive(Default)]
    struct ScopeListener {
        seen: Mutex<Vec<bool>>,
    }

    impl CallListener for ScopeListener {
        fn on_status(&self, _: CallStatus) -> Result<(), ListenerError> {
            self.seen.lock().push(inside_callback());
            Ok(())
        }
        fn on_answer(&self, _: CallId, _: OpaqueBlob) -> Result<(), ListenerError> {
            Ok(())
        }
        fn on_offer(&self, _: CallId, _: OpaqueBlob) -> Result<(), ListenerError> {
            Ok(())
        }
        fn on_ice_candidates(&self, _: CallId, _: Vec<OpaqueBlob>) -> Result<(), ListenerError> {
            Ok(())
        }
    }

    #[test]
    fn test_engine_keeps_context_table() {
        let (listener, mut rx) = ChannelListener::new();
        let h = harness(Arc::new(listener));

        let table: *const CallbackTable = h.context.callback_table();
        assert_eq!(fake::registered_table(h.session), Some(table));
        assert!(std::ptr::eq(h.context.callback_table(), table));

        // Die Engine liest die Tabelle erst beim Callback
        start_call(&h.calls, 3);
        fake::fire_offer(h.session, 3, b"offer");
        assert_eq!(
            rx.try_recv().unwrap(),
            ListenerEvent::Offer(CallId::new(3), OpaqueBlob::from(b"offer".to_vec()))
        );
    }

    #[test]
    fn test_ice_batch_with_mixed_row_lengths() {
        let (listener, mut rx) = ChannelListener::new();
        let h = harness(Arc::new(listener));
        start_call(&h.calls, 42);

        let rows = vec![vec![], vec![1; 5], vec![2; 12]];
        fake::fire_ice(h.session, 42, &rows);

        match rx.try_recv().unwrap() {
            ListenerEvent::IceCandidates(call_id, candidates) => {
                assert_eq!(call_id, CallId::new(42));
                let lengths: Vec<usize> = candidates.iter().map(|c| c.len()).collect();
                assert_eq!(lengths, vec![0, 5, 12]);
                assert_eq!(candidates[2].as_bytes(), &[2; 12]);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(fake::acks(h.session), vec![42]);
    }

    #[test]
    fn test_empty_video_frame_is_delivered_and_acked() {
        let (listener, mut rx) = ChannelListener::new();
        let h = harness(Arc::new(listener));
        start_call(&h.calls, 3);

        let record = VideoFrameRecord {
            data: std::ptr::null(),
            width: 0,
            height: 0,
            byte_size: 0,
        };
        fake::fire_video_record(h.session, 3, record);

        match rx.try_recv().unwrap() {
            ListenerEvent::VideoFrame(_, frame) => {
                assert!(frame.data.is_empty());
                assert_eq!(frame.pixel_format, PixelFormat::Rgba);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(fake::acks(h.session), vec![3]);
    }

    #[test]
    fn test_video_frame_copy_is_bounded_by_byte_size() {
        let (listener, mut rx) = ChannelListener::new();
        let h = harness(Arc::new(listener));
        start_call(&h.calls, 3);

        let buffer = [9u8; 32];
        let record = VideoFrameRecord {
            data: buffer.as_ptr(),
            width: 2,
            height: 2,
            byte_size: 16,
        };
        fake::fire_video_record(h.session, 3, record);

        match rx.try_recv().unwrap() {
            ListenerEvent::VideoFrame(_, frame) => {
                assert_eq!(frame.data, vec![9; 16]);
                assert_eq!((frame.width, frame.height), (2, 2));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_status_is_not_acknowledged() {
        let (listener, mut rx) = ChannelListener::new();
        let h = harness(Arc::new(listener));
        start_call(&h.calls, 8);

        fake::fire_status(h.session, 8, 1234, 1, 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            ListenerEvent::Status(CallStatus {
                call_id: CallId::new(8),
                peer_id: 1234,
                direction: 1,
                kind: 1,
            })
        );
        assert!(fake::acks(h.session).is_empty());
    }

    #[test]
    fn test_connected_and_ended_status_drive_state() {
        let (listener, _rx) = ChannelListener::new();
        let h = harness(Arc::new(listener));
        start_call(&h.calls, 8);
        let ticket = h
            .calls
            .validate(CallOperation::ReceivedAnswer, Some(CallId::new(8)))
            .unwrap();
        h.calls.commit(ticket, None);

        // Connected für einen anderen Call wird ignoriert
        fake::fire_status(h.session, 9, 0, 1, StatusKind::Connected.as_raw());
        assert_eq!(h.calls.phase(), CallPhase::Negotiating);

        fake::fire_status(h.session, 8, 0, 1, StatusKind::Connected.as_raw());
        assert_eq!(h.calls.phase(), CallPhase::Active);

        fake::fire_status(h.session, 8, 0, 1, StatusKind::Ended.as_raw());
        assert_eq!(h.calls.phase(), CallPhase::Terminated);
    }

    #[test]
    fn test_listener_failure_still_acks() {
        for panic in [false, true] {
            let listener = Arc::new(BrokenListener {
                panic,
                calls: Mutex::new(0),
            });
            let h = harness(listener.clone());
            start_call(&h.calls, 5);

            let outcome = unsafe {
                h.context.dispatch_answer(
                    CallId::new(5),
                    &BlobRecord {
                        len: 3,
                        data: b"sdp".as_ptr(),
                    },
                )
            };
            assert_eq!(
                outcome,
                DispatchOutcome::ListenerFailed { acknowledged: true }
            );

            fake::fire_offer(h.session, 5, b"offer");
            assert_eq!(*listener.calls.lock(), 2);
            assert_eq!(fake::acks(h.session), vec![5, 5]);
        }
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        let (listener, mut rx) = ChannelListener::new();
        let h = harness(Arc::new(listener));
        start_call(&h.calls, 5);

        let record = BlobRecord {
            len: 5,
            data: std::ptr::null(),
        };
        let outcome = unsafe { h.context.dispatch_answer(CallId::new(5), &record) };
        assert_eq!(outcome, DispatchOutcome::Malformed);

        fake::fire_answer_record(h.session, 5, record);
        fake::fire_ice_record(h.session, 5, std::ptr::null());

        assert!(rx.try_recv().is_err());
        assert!(fake::acks(h.session).is_empty());
    }

    #[test]
    fn test_callbacks_after_close_are_noops() {
        let (listener, mut rx) = ChannelListener::new();
        let h = harness(Arc::new(listener));
        start_call(&h.calls, 5);

        h.context.close();
        assert!(h.context.is_closed());

        fake::fire_answer(h.session, 5, b"late");
        fake::fire_status(h.session, 5, 0, 1, 1);
        let outcome = unsafe {
            h.context
                .dispatch_offer(CallId::new(5), &BlobRecord::empty())
        };
        assert_eq!(outcome, DispatchOutcome::Closed);

        assert!(rx.try_recv().is_err());
        assert!(fake::acks(h.session).is_empty());
    }

    #[test]
    fn test_callbacks_from_engine_thread() {
        let (listener, mut rx) = ChannelListener::new();
        let h = harness(Arc::new(listener));
        start_call(&h.calls, 11);

        let session = h.session;
        std::thread::spawn(move || {
            fake::fire_answer(session, 11, b"answer-from-engine");
            fake::fire_ice(session, 11, &[b"c1".to_vec()]);
        })
        .join()
        .unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            ListenerEvent::Answer(
                CallId::new(11),
                OpaqueBlob::from(b"answer-from-engine".to_vec())
            )
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            ListenerEvent::IceCandidates(_, ref c) if c.len() == 1
        ));
        assert_eq!(fake::acks(h.session), vec![11, 11]);
    }

    #[test]
    fn test_stale_callback_acks_its_own_call() {
        let (listener, _rx) = ChannelListener::new();
        let h = harness(Arc::new(listener));
        start_call(&h.calls, 2);
        let mut events = h.calls.subscribe();

        fake::fire_offer(h.session, 1, b"old-offer");

        assert_eq!(fake::acks(h.session), vec![1]);
        match events.try_recv().unwrap() {
            CallEvent::StaleCallback { call_id, active } => {
                assert_eq!(call_id, CallId::new(1));
                assert_eq!(active, Some(CallId::new(2)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_listener_runs_inside_callback_scope() {
        let listener = Arc::new(ScopeListener::default());
        let h = harness(listener.clone());

        assert!(!inside_callback());
        fake::fire_status(h.session, 1, 0, 0, 1);
        assert!(!inside_callback());
        assert_eq!(*listener.seen.lock(), vec![true]);
    }
}
