//! Rate limiting logic and state management.

mod backend;
mod coordinator;
mod counter;
mod decision;
mod distributed;
mod key;
mod local;
mod maintenance;
mod registry;
mod violations;

pub use backend::{BackendKind, RateLimitBackend, SecurityInfo};
pub use coordinator::{
    BackendHealthState, RateLimitCoordinator, AUTO_BLOCK_REASON, MAX_CONSECUTIVE_FAILURES,
};
pub use counter::{window_duration, WindowCounter, WINDOW_SECS};
pub use decision::RateLimitDecision;
pub use distributed::{DistributedBackend, StoreKeys};
pub use key::LimitKey;
pub use local::LocalBackend;
pub use maintenance::{Maintenance, MaintenanceSchedule};
pub use registry::{BlockRecord, BlockRegistry, WhitelistRegistry};
pub use violations::{minute_bucket, ViolationRecord, ViolationSummary, ViolationTracker};
