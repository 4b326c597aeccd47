//! Shared data model and policies for the transcode control plane.
//!
//! This crate holds everything the master, the worker agent, and the process
//! wrapper agree on: the job/node/tenant models, the job state machine and its
//! retry/timeout policies, the wire protocol types, the error taxonomy, and
//! configuration loading.

pub mod config;
pub mod error;
pub mod fsm;
pub mod job;
pub mod node;
pub mod protocol;
pub mod tenant;

pub use error::ApiError;
pub use fsm::{validate_transition, RetryPolicy, TimeoutPolicy, TransitionError};
pub use job::{
    EngineKind, FailureClass, Job, JobClass, JobPriority, JobStatus, QueueClass, StateTransition,
    WrapperConstraints,
};
pub use node::{Node, NodeCapabilities, NodeStatus, NodeType};
pub use tenant::{Tenant, TenantQuotas, TenantStatus, DEFAULT_TENANT_NAME};
