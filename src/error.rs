//! Crate-level error composition for [`crate::manager::ProtocolManager`].
//!
//! Each subsystem already defines its own focused error enum
//! (`codec::{DecodeError, EncodeError}`, `transport::TransportError`,
//! `address::IsoNameBuildError`, `diagnostics::DiagnosticsError`,
//! `queue::QueueError`); this follows the teacher's `error.rs` of
//! composing them behind one top-level enum with `#[error(transparent)]`
//! `#[from]` variants instead of re-stating their messages.
use thiserror::Error;

use crate::address::IsoNameBuildError;
use crate::codec::{DecodeError, EncodeError, IdentifierBuildError};
use crate::diagnostics::DiagnosticsError;
use crate::queue::QueueError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Identifier(#[from] IdentifierBuildError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Name(#[from] IsoNameBuildError),

    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("frame payload length {got} is invalid for an extended J1939 identifier (expected 0..={max})")]
    FrameMalformed { got: usize, max: usize },

    #[error("background task panicked during shutdown: {0}")]
    BackgroundTaskFailed(#[from] tokio::task::JoinError),
}
