//! # Zapflow Scheduler
//!
//! Rate-limited, resumable bulk dispatch. Campaigns (contacts) and warm-up
//! sessions (instance pairs) run through the same loop.
//!
//! ## Architecture
//! ```text
//! DispatchEngine (one detached tokio task per running job)
//!   ├── WorkQueue      next pending item, resolve exactly once
//!   ├── PacingPolicy   business hours, jitter, batch pauses, quota math
//!   ├── TargetResolver Contact | InstancePair → (instance, phone, text)
//!   └── MessageSender  zapflow-channels (UAZAPI)
//! DispatchDb (SQLite): jobs, items, quotas, instances, append-only log
//! ```

pub mod engine;
pub mod job;
pub mod pacing;
pub mod persistence;
pub mod queue;
pub mod target;

pub use engine::{DispatchEngine, EngineSettings, JobStats};
pub use job::{
    BusinessHours, DispatchJob, DispatchLogEntry, DispatchTarget, ItemStatus, JobKind, JobStatus,
    LogEvent, NewInstance, NewItem, NewJob, PacingConfig, SendQuota, SendingInstance, WorkItem,
};
pub use pacing::PacingPolicy;
pub use persistence::{DispatchDb, ItemCounts};
pub use queue::{AttachOutcome, Outcome, Resolution, WorkQueue};
pub use target::{ResolveError, ResolvedSend, TargetResolver, plan_warming_pairs};
