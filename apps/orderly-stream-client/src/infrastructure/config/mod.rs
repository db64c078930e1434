//! Configuration Module
//!
//! Environment-driven settings for the stream client.

mod settings;

pub use settings::{ConfigError, Environment, KeyPair, StreamSettings};
