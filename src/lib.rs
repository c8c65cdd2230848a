//! A delay-tolerant, store-and-forward peer-to-peer messaging engine.
//!
//! Messages hop through intermediate devices until they reach their
//! addressee or expire. The engine guarantees eventual delivery under
//! intermittent connectivity, loop-free forwarding, and confidentiality and
//! integrity of payloads on the wire.

pub mod config;
pub mod crypto;
pub mod database;
pub mod engine;
pub mod error;
pub mod logging;
pub mod mesh;
pub mod protocol;
pub mod scheduler;
pub mod transport;

// Re-export commonly used types
pub use error::{Error, Result};
