//! # testcycle-core
//!
//! The convergence loop of testcycle.
//!
//! [`IterationController`] pulls tasks from a [`TaskQueue`], dispatches them
//! to the collaborators in [`Collaborators`], runs every test result through
//! the metrics evaluator and convergence policy, and head-inserts synthesized
//! fix tasks until the cycle reaches a [`CycleOutcome`].
//!
//! ```rust,ignore
//! let mut queue = TaskQueue::new(vec![TaskDescriptor::test_run("suite")])?;
//! let controller = IterationController::new(
//!     Collaborators::new(&tests, &fixer, &analyzer).with_rollback(&rollback),
//!     &store,
//!     logger,
//! );
//! let outcome = controller
//!     .run(&mut queue, CycleContext::new(session_id, working_dir))
//!     .await?;
//! ```

mod context;
mod controller;
mod error;
mod outcome;
mod queue;

pub use context::{CycleContext, DEFAULT_MAX_ITERATIONS};
pub use controller::{Collaborators, IterationController};
pub use error::CycleError;
pub use outcome::{BlockReason, CycleOutcome};
pub use queue::{QueueError, TaskQueue};
