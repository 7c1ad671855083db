//! Retrieval core shared by every data-heavy dashboard view.
//!
//! - [`retry`]: bounded constant-delay retry around a single call
//! - [`session`]: fetch sessions, generation guard and the published view state
//! - [`job`]: submit → poll → fetch lifecycle of a backend aggregation job
//! - [`pager`]: exhaustive offset/limit pagination until a short page
//!
//! Every asynchronous write goes through [`session::ViewState::apply`], which
//! compares the caller's generation with the current one under the same lock
//! that performs the write. Results from a superseded session never land.

pub mod job;
pub mod pager;
pub mod retry;
pub mod session;

pub use job::{JobConfig, JobController, JobHandle, SubmitError};
pub use pager::{ExhaustivePager, FetchSummary, FetchedPage, PageCursor, PageSequence, PagerError};
pub use retry::{GateError, RetryPolicy};
pub use session::{FetchSession, Generation, JobPhase, LoadStatus, ViewSnapshot, ViewState};
