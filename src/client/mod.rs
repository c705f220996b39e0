//! Client module for llmd.
//!
//! The client runs the daemon as a child process and speaks the line
//! protocol over its stdin/stdout. `llmd generate` is built on it.

pub mod process;

pub use process::{DaemonClient, TokenStream};
