//! Dispatcher Module - Engine Callbacks zum Host
//!
//! Dieses Modul verwaltet:
//! - Die `extern "C"` Callback-Thunks und ihren Context
//! - Das Kopieren der Payloads in Host-Speicher
//! - Das Listener-Interface des Hosts und die Acknowledgments

mod callbacks;
mod listener;

pub use callbacks::{inside_callback, CallbackContext, DispatchOutcome};
pub use listener::{
    CallListener, CallStatus, ChannelListener, ListenerError, ListenerEvent, StatusKind,
};
