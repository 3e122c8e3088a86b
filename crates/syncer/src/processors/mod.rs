//! Shipped update processors.

mod bgppeer;
mod profile;
pub mod rules;

pub use bgppeer::bgp_peer_processor;
pub use profile::ProfileProcessor;
