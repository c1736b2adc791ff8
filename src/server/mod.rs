//! Process-level plumbing for the backend daemon.

pub mod signals;
