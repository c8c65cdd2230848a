//! Store-and-forward message routing.
//!
//! [`Forwarder`] is the ingress/egress pipeline: it decodes and verifies
//! inbound bytes, persists and delivers, re-broadcasts within hop/TTL
//! limits, and drives the egress path for locally originated sends. Loop
//! suppression is a bounded [`SeenSet`] owned entirely by the forwarder's
//! single worker task.

pub mod forwarder;
pub mod seen_set;

pub use forwarder::Forwarder;
pub use seen_set::SeenSet;
