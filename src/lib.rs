//! ai-harness library crate
//!
//! Runs a command, asks a language model why it failed, installs what it says is
//! missing, and retries once. The binary is a thin front-end over [`pipeline::Pipeline`];
//! everything it wires together is exposed here so tests and benchmarks can drive it
//! without a terminal.

pub mod cache;
pub mod config;
pub mod diagnosis;
pub mod failure;
pub mod matcher;
pub mod pipeline;
pub mod runner;
pub mod util;
