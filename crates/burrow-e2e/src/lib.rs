//! End-to-end test utilities for the Burrow tunnel server
//!
//! Runs a real HTTP plane on a loopback port backed by the in-process
//! message bus, with scripted tunnel clients answering on the bus.

pub mod harness;
pub mod test_client;

pub use harness::TestServer;
pub use test_client::{RecordedRequest, TestTunnelClient};
