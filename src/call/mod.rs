//! Call Module - Lifecycle des aktiven Calls
//!
//! Dieses Modul verwaltet:
//! - Call-State und erlaubte Transitions
//! - Ausgehende Signaling-Operationen an die Engine
//! - Media-Typen (Offer-Media, Pixel-Formate, Video-Frames)

mod lifecycle;
mod media;
mod state;

pub use lifecycle::{CallDefaults, CallError, CallLifecycle, ReceivedAnswer, ReceivedOffer};
pub use media::{MediaType, PixelFormat, VideoFrame};
pub use state::{
    ActiveCall, Applied, CallDirection, CallEvent, CallId, CallOperation, CallPhase,
    CallStateCell, DeviceId, Rejection, Ticket,
};
