//! Worker agent: registers with the master, heartbeats, pulls jobs, and
//! executes encoders through the wrapper.

pub mod agent;
pub mod capabilities;
pub mod client;
pub mod engine;
pub mod readiness;

pub use agent::{Agent, AgentState};
pub use client::{ClientError, MasterClient};
