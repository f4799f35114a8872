//! ISO 11783 / J1939-21 Transport Protocol: multi-frame message
//! reassembly and transmission via RTS/CTS and BAM (spec.md §4.2).

pub mod engine;
pub mod session;

pub use engine::{OutboundFrame, TransportConfig, TransportEngine, TransportError, TransportEvent};
pub use session::{AbortReason, Session, SessionKey, SessionMode, SessionState};
