//! Task scheduling core of a metric collection agent.
//!
//! The scheduler decides when, and how many, units of collection work run
//! against a dynamic set of plugins. Plugins expose any subset of five
//! capabilities (see [`plugin`]); the [`scheduler`] keeps a two level
//! priority queue of plugins and their tasks, enforces per-plugin capacity
//! and tracks which request owners still need each plugin.

pub mod alias;
pub mod config;
pub mod error;
pub mod itemutil;
pub mod logging;
pub mod plugin;
pub mod scheduler;

pub use error::{Error, Result};
