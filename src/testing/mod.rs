//! Test doubles shared by unit and integration tests.

pub mod fake_server;
pub mod pgoutput;
pub mod sinks;
