//! Native Engine
//!
//! Entry-Point-Tabelle, Loader, Engine Handle und Session.

mod ffi;
mod handle;

#[cfg(test)]
pub(crate) mod fake;

pub use ffi::{
    CallbackTable, EngineLoader, EntryPoints, IceCallback, RawSession, SignalCallback,
    StaticLoader, StatusCallback, VideoFrameCallback,
};
pub use handle::{EngineError, EngineHandle, Session};
