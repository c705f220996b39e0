//! Daemon module for llmd.
//!
//! The daemon is a long-running process that:
//! - Reads one JSON request per line from stdin
//! - Keeps loaded models cached across requests
//! - Streams each generation concurrently as token events
//! - Writes every event as one JSON line on stdout

pub mod cache;
pub mod llm;
pub mod output;
pub mod pool;
pub mod server;
pub mod session;

pub use server::{DaemonServer, Shutdown};
