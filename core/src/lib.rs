//! Root of the orchestrator domain crate: session registry, per-session
//! process manager, NDJSON stream parser, event bus, LRU cache, and the
//! sandbox interface the rest of this crate treats as an external
//! collaborator.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod error;
pub mod event_bus;
pub mod lru_cache;
pub mod process_manager;
pub mod registry;
pub mod sandbox;
pub mod shell_safety;
pub mod store;
pub mod stream_parser;

pub use error::CoreError;
pub use error::Result;
