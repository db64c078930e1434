//! Domain Layer - Core streaming types and routing rules.
//!
//! This layer contains the connection lifecycle, wire frame classification
//! and per-topic queues. Nothing here performs I/O.

/// Connection lifecycle state machine.
pub mod connection;

/// Inbound frame classification and outbound frame shapes.
pub mod frame;

/// Per-topic bounded queues and the topic registry.
pub mod topic;
