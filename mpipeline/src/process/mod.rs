//! Worker processes.
//!
//! A process slot starts a child process, speaks the line protocol in
//! [`protocol`] with it, and the child serves requests through [`serve`].

mod host;
pub mod protocol;

pub use host::{serve, serve_if_worker_process, HostConfig};
