//! # testcycle-store
//!
//! Durable iteration history for the test-fix loop.
//!
//! History is append-only: one [`IterationRecord`](testcycle_policy::IterationRecord)
//! per evaluated iteration, keyed by session id. Reloading it is what lets an
//! interrupted session resume without replaying fixes that already ran.

mod catalog;
mod error;
mod parser;
mod store;
mod types;

pub use catalog::SessionCatalog;
pub use error::StoreError;
pub use parser::parse_session;
pub use store::{AppendOutcome, IterationStateStore, JsonlStateStore, MemoryStateStore};
pub use types::{Session, SessionEnd, SessionLine, SessionStart, SessionSummary, TaskCompletion};
