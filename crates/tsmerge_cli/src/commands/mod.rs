//! CLI command implementations.

pub mod compact;
pub mod inspect_log;
pub mod recover;
pub mod verify;
