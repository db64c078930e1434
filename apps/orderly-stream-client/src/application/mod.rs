//! Application Layer - Port definitions.
//!
//! This layer defines how the domain reaches the outside world. The
//! streaming client depends on these traits, never on a socket library.

/// Port interfaces for external systems (socket connector and transport).
pub mod ports;
