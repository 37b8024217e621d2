//! CPU-management side-band bus support: byte-exact command records and
//! the typed command helpers built on top of them.

pub mod commands;
pub mod wire;

pub use commands::{CpuCommands, CpuCommandsHandle, PeciCommands};
