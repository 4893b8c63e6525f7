//! The consensus core: a pure, tick-driven Raft state machine
//!
//! Everything in this module is deterministic and free of I/O. The
//! host owns timers, transport, and persistence and talks to the core
//! through [`raft_core::RaftCore`]'s entry points and the
//! [`raft_core::RaftCallback`] façade.

pub mod config;
pub mod log;
pub mod message;
pub mod peer;
pub mod read_only;
pub mod raft_core;

pub use config::{ConfigError, RaftConfig};
pub use message::{Entry, HardState, Message, MessageKind, ReadState, Snapshot, SnapshotMetadata};
pub use raft_core::{ProposeError, RaftCallback, RaftCore, Role};
