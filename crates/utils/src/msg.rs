//! Single-line status output for user-facing decision paths.
//!
//! Every decision path emits exactly one of these lines; detailed
//! diagnostics go through `tracing` instead.

use std::fmt::Display;

pub fn ok(msg: impl Display) {
    println!("[ok] {msg}");
}

pub fn warn(msg: impl Display) {
    println!("[warn] {msg}");
}

pub fn error(msg: impl Display) {
    println!("[error] {msg}");
}

/// An in-progress step, e.g. while waiting on the agent server.
pub fn progress(msg: impl Display) {
    println!("[..] {msg}");
}
