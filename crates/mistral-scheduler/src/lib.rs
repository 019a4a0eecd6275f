//! `mistral-scheduler`: deferred work that runs effectively once across any
//! number of processes sharing one database.
//!
//! # Overview
//!
//! | Piece                         | Role                                                  |
//! |-------------------------------|-------------------------------------------------------|
//! | [`Job`]                       | what to call, with which arguments, after how long    |
//! | [`Registry`]                  | string keys -> functions, factories, serializers      |
//! | [`engine::DefaultScheduler`]  | local timer plus table polling, CAS capture           |
//! | [`legacy::LegacyScheduler`]   | one transaction per call, stuck-call recovery         |
//! | [`post_tx::PostTxQueue`]      | side effects that run only after a commit             |

pub mod engine;
pub mod error;
pub mod job;
pub mod legacy;
pub mod post_tx;
pub mod registry;

pub use engine::DefaultScheduler;
pub use error::{Result, SchedulerError};
pub use job::Job;
pub use legacy::LegacyScheduler;
pub use post_tx::{OperationContext, OperationQueue, PostTxQueue};
pub use registry::{ArgSerializer, InvocationContext, JobTarget, Registry, Target, JSON_TEXT};
