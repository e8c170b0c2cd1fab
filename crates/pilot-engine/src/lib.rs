//! pilot-engine: agent execution and control engine
//!
//! Drives an LLM through a think/act loop whose browser actions are carried
//! out by a remote automation peer over a file-polling RPC channel, and
//! exposes each run as an externally controllable session.

pub mod agent;
pub mod batch;
pub mod config;
pub mod controller;
pub mod delegate;
pub mod deps;
pub mod error;
pub mod replay;
pub mod rpc;
pub mod store;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;

pub use config::EngineConfig;
pub use controller::{SessionController, SessionEvent, SessionStatus, StartRequest};
pub use error::{ChannelError, ControlError, ResolveError, SessionError};
