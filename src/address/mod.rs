//! ISO 11783-5 NAME and address claim registry (spec.md §4.3).

pub mod name;
pub mod registry;

pub use name::{IsoName, IsoNameBuildError, IsoNameBuilder, IsobusFunction};
pub use registry::{ArbitrationPolicy, ClaimOutcome, ConflictEvent, Device, Registry};
