//! Call Bridge - Binding Layer für eine native Call-Engine
//!
//! Verbindet eine Host-Applikation mit einer nativen Real-Time-Call-Engine
//! hinter einer Foreign-Call-Grenze:
//! - Lifecycle-State des aktiven Calls
//! - Marshaling in feste Binär-Layouts und zurück
//! - Zustellung der Engine-Callbacks an den Host, inklusive Acknowledgment

pub mod call;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod engine;

pub use call::{
    ActiveCall, CallError, CallEvent, CallId, CallLifecycle, CallPhase, PixelFormat,
    ReceivedAnswer, ReceivedOffer, VideoFrame,
};
pub use codec::{CodecError, OpaqueBlob};
pub use config::{BridgeConfig, ConfigError};
pub use dispatcher::{CallListener, CallStatus, ChannelListener, ListenerError, ListenerEvent};
pub use engine::{EngineError, EngineHandle, EngineLoader, StaticLoader};

use call::{CallDefaults, CallStateCell};
use dispatcher::CallbackContext;
use engine::Session;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tokio::sync::broadcast;

// ============================================================================
// LOGGING
// ============================================================================

static LOGGING: OnceCell<()> = OnceCell::new();

/// Installiert einen fmt-Subscriber mit EnvFilter
///
/// `RUST_LOG` hat Vorrang vor `default_filter`. Mehrfache Aufrufe und ein
/// bereits installierter globaler Subscriber sind kein Fehler.
pub fn init_logging(default_filter: &str) {
    LOGGING.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

        if tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .is_err()
        {
            tracing::debug!("Global subscriber already installed");
        }
    });
}

// ============================================================================
// CALL BRIDGE
// ============================================================================

/// Composition Root: Engine, Session, Dispatcher und Lifecycle
pub struct CallBridge {
    config: BridgeConfig,
    engine: Arc<EngineHandle>,
    session: Arc<Session>,
    context: &'static CallbackContext,
    calls: CallLifecycle,
}

impl CallBridge {
    /// Lädt die Engine, registriert die Callbacks und erstellt die Session
    ///
    /// Installiert das Logging mit `config.log_filter`, falls der Host noch
    /// keinen Subscriber gesetzt hat.
    pub fn init(
        config: BridgeConfig,
        loader: &dyn EngineLoader,
        listener: Arc<dyn CallListener>,
    ) -> Result<Self, EngineError> {
        init_logging(&config.log_filter);
        tracing::info!("Initializing call bridge...");

        let engine = EngineHandle::initialize(loader, &config)?;

        let state = CallStateCell::new();
        let context = CallbackContext::register(listener, state.clone());

        let session = match engine.create_session(context.callback_table()) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                context.close();
                return Err(e);
            }
        };
        context.attach(Arc::clone(&session));

        let calls = CallLifecycle::new(Arc::clone(&session), state, CallDefaults::from(&config));

        tracing::info!("Call bridge ready (session {})", session.raw());

        Ok(Self {
            config,
            engine,
            session,
            context,
            calls,
        })
    }

    /// Lifecycle-Operationen des aktiven Calls
    pub fn calls(&self) -> &CallLifecycle {
        &self.calls
    }

    pub fn engine(&self) -> &Arc<EngineHandle> {
        &self.engine
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Gibt einen Event-Receiver für Phasenwechsel zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.calls.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.session.is_closed()
    }

    /// Schließt die Callbacks, zerstört die Session und gibt Speicher frei
    ///
    /// Späte Callbacks der Engine werden danach ignoriert. Mehrfache
    /// Aufrufe sind ein No-op.
    pub fn shutdown(&self) -> Result<(), EngineError> {
        if self.session.is_closed() {
            return Ok(());
        }
        tracing::info!("Shutting down call bridge...");
        self.context.close();
        self.session.shutdown()
    }
}

// ============================================================================
// TESTS
// ============================================================================
