//! Tasklink - local task tracking synchronized with GitHub issues.
//!
//! This crate provides both the `tasklink` CLI and a library for embedding
//! the sync engine: change detection, conflict analysis and resolution, and
//! durable sync state written through `tasklink-store`'s write queue.

#![forbid(unsafe_code)]

// Public modules for library usage
pub mod config;
pub mod domain;
pub mod error;
pub mod github;
pub mod hashing;
pub mod storage;
pub mod sync;

// Public CLI module (needed by binary)
pub mod cli;

// Command implementations
pub mod commands;

// Application context and output formatting
pub mod app;
pub mod output;
