//! The stateful session orchestrator's RPC surface: transport (duplex
//! WebSocket + batched HTTP), auth, rate limiting, capability passing, and
//! the method dispatcher sitting in front of `orchestrator-core`'s
//! `SessionRegistry`.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod auth;
pub mod call_table;
pub mod capability;
pub mod client;
pub mod dispatch;
pub mod facade;
pub mod rate_limit;
pub mod server;
pub mod transport;

pub use facade::Facade;
pub use server::router;
pub use server::ServerState;
