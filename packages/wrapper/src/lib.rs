//! Process governance: supervise an encoder without owning it.
//!
//! The wrapper runs (or attaches to) a workload, applies cgroup resource
//! limits, and emits one immutable post-mortem record. Three rules hold on
//! every path:
//!
//! 1. If the wrapper crashes, the workload continues. The encoder lives in
//!    its own process group; the wrapper is never its session leader.
//! 2. Retries never apply to the workload. A failed encoder is not restarted
//!    here; the master decides retries later.
//! 3. Cleanup never kills work. Cgroup removal is best effort and skipped
//!    while the workload still holds it.

pub mod cgroup;
pub mod metrics;
pub mod result;
pub mod supervise;

pub use cgroup::{CgroupManager, CgroupVersion};
pub use metrics::{SlaViolation, WrapperMetrics};
pub use supervise::{Supervisor, WorkloadSpec};
