//! Engram - Bounded, compressed conversational memory
//!
//! Each response of a conversation is graded, compressed and kept in a
//! per-session store with a token budget. Stored memories are reinjected
//! into the prompt on a fixed turn interval or when the budget fills up,
//! and can be recalled on demand by similarity.

pub mod admin;
pub mod chat;
pub mod codec;
pub mod completion;
pub mod config;
pub mod error;
pub mod generator;
pub mod grader;
pub mod memory;
pub mod server;
pub mod session;
pub mod storage;
pub mod testing;

pub use error::{EngramError, Result};
