//! Portable Interpreter Builder.
//!
//! This library builds self-contained interpreter trees that keep working
//! after being copied anywhere. It is organized into several modules:
//! - `toolchain`: Cross-compilation toolchains, cached per architecture pair.
//! - `deps`: The ordered build of native dependencies into a staging prefix.
//! - `interpreter`: Configure, compile and finalize the interpreter.
//! - `relocate`: Rewrite binaries and scripts to be self-relative.
//! - `verify`: Check a relocated tree from a throwaway copy.
//! - `pipeline`: Run the stages for every requested target.

pub mod arch;
pub mod config;
pub mod deps;
pub mod error;
pub mod fetch;
pub mod interpreter;
pub mod logging;
pub mod manifest;
pub mod pipeline;
pub mod platform;
pub mod process;
pub mod record;
pub mod relocate;
pub mod toolchain;
pub mod tree;
pub mod utils;
pub mod verify;

#[cfg(test)]
mod fixtures;

pub use error::{Error, Result};
