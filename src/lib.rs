//! sigline library: the sync core shared by the binary and integration
//! tests.

pub mod bridge;
pub mod chat;
pub mod contacts;
pub mod daemon;
pub mod envelope;
pub mod proc;
pub mod state;
