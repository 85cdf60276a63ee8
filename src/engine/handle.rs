//! Engine Handle & Session
//!
//! Der [`EngineHandle`] kapselt eine initialisierte Engine und die
//! Boundary Arena. Eine [`Session`] ist die registrierte Callback-Tabelle
//! plus der rohe Session-Handle der Engine.

use super::ffi::{CallbackTable, EngineLoader, EntryPoints, RawSession};
use crate::call::CallId;
use crate::codec::{encode_text, BoundaryArena, CodecError};
use crate::config::BridgeConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Failed to load native engine: {0}")]
    Load(String),

    #[error("Native engine rejected initialization (status {0})")]
    InitRejected(i64),

    #[error("Native engine rejected session creation (status {0})")]
    SessionRejected(i64),

    #[error("Engine already has a session")]
    SessionExists,

    #[error("Session has been shut down")]
    SessionClosed,

    #[error("Entry point {entry_point} failed with status {code}")]
    Rejected { entry_point: &'static str, code: i64 },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

// ============================================================================
// ENGINE HANDLE
// ============================================================================

/// Initialisierte Engine
pub struct EngineHandle {
    name: String,
    api: EntryPoints,
    arena: BoundaryArena,
    session_claimed: AtomicBool,
}

impl EngineHandle {
    /// Lädt die Engine und ruft ihre Init-Routine mit dem Greeting auf
    pub fn initialize(
        loader: &dyn EngineLoader,
        config: &BridgeConfig,
    ) -> Result<Arc<Self>, EngineError> {
        let name = loader.describe();
        tracing::info!("Loading engine: {}", name);

        let api = loader.load().map_err(|e| {
            tracing::error!("Engine {} could not be loaded: {}", name, e);
            e
        })?;

        let arena = BoundaryArena::new(config.arena_policy, config.arena_limit_bytes);

        let status = {
            let mut frame = arena.frame();
            let greeting = encode_text(&mut frame, &config.greeting)?;
            unsafe { (api.init)(greeting) }
        };

        if status <= 0 {
            tracing::error!("Engine {} rejected init with status {}", name, status);
            return Err(EngineError::InitRejected(status));
        }

        tracing::info!("Engine {} initialized (greeting: {})", name, config.greeting);

        Ok(Arc::new(Self {
            name,
            api,
            arena,
            session_claimed: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arena(&self) -> &BoundaryArena {
        &self.arena
    }

    pub(crate) fn api(&self) -> &EntryPoints {
        &self.api
    }

    /// Registriert die Callback-Tabelle und erstellt die einzige Session
    ///
    /// Die Tabelle muss bis zum Prozessende leben, weil die Engine den
    /// Pointer behalten darf.
    pub fn create_session(
        self: &Arc<Self>,
        callbacks: &'static CallbackTable,
    ) -> Result<Session, EngineError> {
        if self.session_claimed.swap(true, Ordering::SeqCst) {
            tracing::warn!("Rejecting second session for engine {}", self.name);
            return Err(EngineError::SessionExists);
        }

        let raw = unsafe { (self.api.create_session)(callbacks) };
        if raw <= 0 {
            self.session_claimed.store(false, Ordering::SeqCst);
            tracing::error!("Engine {} rejected session with status {}", self.name, raw);
            return Err(EngineError::SessionRejected(raw));
        }

        tracing::info!("Session {} created", raw);

        Ok(Session {
            engine: Arc::clone(self),
            raw,
            closed: AtomicBool::new(false),
        })
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("name", &self.name)
            .field("arena", &self.arena)
            .finish()
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// Registrierte Session einer Engine
#[derive(Debug)]
pub struct Session {
    engine: Arc<EngineHandle>,
    raw: RawSession,
    closed: AtomicBool,
}

impl Session {
    pub fn raw(&self) -> RawSession {
        self.raw
    }

    pub fn engine(&self) -> &Arc<EngineHandle> {
        &self.engine
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ruft einen Entry Point auf; Status `<= 0` ist ein Fehler
    pub fn invoke(
        &self,
        entry_point: &'static str,
        call: impl FnOnce(&EntryPoints, RawSession) -> i64,
    ) -> Result<i64, EngineError> {
        let code = self.invoke_raw(entry_point, call)?;
        if code <= 0 {
            tracing::warn!("{} failed with status {}", entry_point, code);
            return Err(EngineError::Rejected { entry_point, code });
        }
        Ok(code)
    }

    /// Wie [`Session::invoke`], aber `0` ist ein gültiges Ergebnis
    pub fn query(
        &self,
        entry_point: &'static str,
        call: impl FnOnce(&EntryPoints, RawSession) -> i64,
    ) -> Result<i64, EngineError> {
        let code = self.invoke_raw(entry_point, call)?;
        if code < 0 {
            tracing::warn!("{} failed with status {}", entry_point, code);
            return Err(EngineError::Rejected { entry_point, code });
        }
        Ok(code)
    }

    fn invoke_raw(
        &self,
        entry_point: &'static str,
        call: impl FnOnce(&EntryPoints, RawSession) -> i64,
    ) -> Result<i64, EngineError> {
        if self.is_closed() {
            return Err(EngineError::SessionClosed);
        }
        tracing::debug!("-> {} (session {})", entry_point, self.raw);
        Ok(call(self.engine.api(), self.raw))
    }

    /// Bestätigt einen zugestellten Callback
    pub fn acknowledge(&self, call_id: CallId) -> Result<(), EngineError> {
        self.invoke("message_sent", |api, session| unsafe {
            (api.message_sent)(session, call_id.as_u64())
        })?;
        Ok(())
    }

    /// Zerstört die Session und gibt zurückgehaltenen Arena-Speicher frei
    ///
    /// Mehrfache Aufrufe sind ein No-op.
    pub fn shutdown(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let api = self.engine.api();
        let status = unsafe { (api.destroy_session)(self.raw) };
        let released = self.engine.arena().release_retained();
        tracing::info!(
            "Session {} shut down ({} retained bytes released)",
            self.raw,
            released
        );

        if status <= 0 {
            return Err(EngineError::Rejected {
                entry_point: "destroy_session",
                code: status,
            });
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
