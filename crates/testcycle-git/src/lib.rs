//! # testcycle-git
//!
//! Git support for the test cycle.
//!
//! - [`ChangeCapture`] detects which files a fix touched by comparing the
//!   dirty files of the working tree before and after the fix runs, keeping
//!   the pre-fix content of every dirty file.
//! - [`GitRollback`] puts those files back the way they were before the most
//!   recent fix when the convergence policy reports a regression. Files that
//!   were clean before the fix go back to `HEAD`.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use testcycle_executor::CommandFixExecutor;
//! use testcycle_git::{ChangeCapture, GitRollback};
//!
//! let capture = Arc::new(ChangeCapture::new());
//! let fixer = CommandFixExecutor::new("./fix.sh").with_tracker(capture.clone());
//! let rollback = GitRollback::with_baseline(capture);
//! ```

mod error;
mod rollback;
mod status;

pub use error::GitError;
pub use rollback::{GitRollback, RestoreSummary};
pub use status::{ChangeCapture, WorkdirSnapshot};
