//! Integration test helpers: an in-process daemon backed by the memory
//! connector, and a raw socket client that speaks the line protocol.

pub mod harness;
