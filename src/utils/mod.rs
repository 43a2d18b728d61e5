//! Shared helpers for binaries and callers of the controller.

pub mod bootstrap;
pub mod retry;
