// src/exec/mod.rs

//! Task execution layer.
//!
//! - [`backend`] provides the `RunnerBackend` trait the engine dispatches
//!   through, so tests can replace it with a fake implementation.
//! - [`process`] is the production runner: local shell processes via
//!   `tokio::process::Command`, reporting back with `RuntimeEvent`s.

pub mod backend;
pub mod process;

pub use backend::RunnerBackend;
pub use process::ProcessRunner;
