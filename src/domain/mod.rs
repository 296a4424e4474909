//! Domain layer - collaborator ports and naming rules
//!
//! Defines the traits adapters implement and the pure derivation functions
//! shared by every reconciler component.

pub mod naming;
pub mod ports;

pub use ports::*;
