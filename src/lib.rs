//! `gale` — a distributed task runner node. The runner registers with a
//! coordinator, receives tasks over an inbound webhook, executes them,
//! and reports results back over HTTP.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod gate;
pub mod heartbeat;
pub mod metrics;
pub mod model;
pub mod ollama;
pub mod runner;
pub mod tunnel;
