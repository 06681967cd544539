//! Hemmer Converge
//!
//! Desired-state convergence for Hemmer providers. Cloud control planes are
//! asynchronous and eventually consistent: a create returns long before the
//! resource is usable, a role created a second ago is rejected as invalid,
//! and labels have to be diffed against what the platform injected on its
//! own. This crate is the one place providers handle all of that.
//!
//! # Overview
//!
//! - **Set reconciler** ([`tags`]): diffs a declared label set against the
//!   observed one, skipping platform-reserved keys, and yields the minimal
//!   remove and create operations.
//! - **State poller** ([`poll`]): a bounded retry loop over a probe, with
//!   transient/fatal classification, a timeout budget, and cancellation.
//! - **Lifecycle orchestrator** ([`converge`]): create, read, update and
//!   delete built from the two, talking to a [`RemoteApi`] and a
//!   [`StateStore`].
//!
//! Around them: an error signature table ([`classify`]), serde-driven
//! configuration ([`config`]), cancellation tokens ([`cancel`]), logging
//! setup ([`logging`]) and test doubles ([`testing`]).
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use hemmer_converge::poll::StatusWaiter;
//! use hemmer_converge::tags::ReservedKeys;
//! use hemmer_converge::testing::FakeRemote;
//! use hemmer_converge::{ConvergeConfig, Converger, ResourceProfile};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let config = ConvergeConfig::from_value(json!({
//!     "poll_interval": "10ms",
//!     "timeouts": { "create": "30m" },
//!     "default_labels": { "managed-by": "hemmer" }
//! }))
//! .unwrap();
//!
//! let remote = Arc::new(FakeRemote::new());
//! let converger = Converger::new(remote, config).with_profile(
//!     "aws_msk_cluster",
//!     ResourceProfile::new()
//!         .with_labels(ReservedKeys::aws())
//!         .provisions_async(StatusWaiter::new(["CREATING"], ["ACTIVE"]))
//!         .deletes_async(StatusWaiter::gone(["DELETING"])),
//! );
//!
//! let mut state = converger.state(json!({ "name": "events", "tags": { "env": "prod" } }));
//! converger.apply("aws_msk_cluster", &mut state).await.unwrap();
//!
//! let doc = state.value();
//! assert_eq!(doc["tags"], json!({ "env": "prod" }));
//! assert_eq!(doc["tags_all"], json!({ "env": "prod", "managed-by": "hemmer" }));
//! # });
//! ```
//!
//! # Failure reporting
//!
//! Every lifecycle operation returns [`ConvergeError`]. Timeouts name the
//! resource, the expected states, the last observed state and the elapsed
//! time; fatal errors carry the remote message verbatim along with the
//! operation that was attempted. Nothing is retried at the operation level.
//! Handlers answering over gRPC can convert a [`ConvergeError`] straight
//! into a `tonic::Status`.

#![warn(missing_docs)]

pub mod cancel;
pub mod classify;
pub mod client;
pub mod config;
pub mod converge;
pub mod error;
pub mod logging;
pub mod poll;
pub mod tags;
pub mod testing;

// Re-export main types at crate root
pub use cancel::{cancel_pair, CancelToken, CancelTrigger};
pub use classify::{ErrorClass, ErrorClassifier, Signature};
pub use client::{JsonState, Mutation, MutationResponse, Observed, RemoteApi, StateStore};
pub use config::{parse_duration, ConvergeConfig, Timeouts};
pub use converge::{ConvergenceRequest, Converger, ResourceProfile};
pub use error::{ConvergeError, Operation, RemoteError};
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use poll::{poll_until, PollConfig, PollOutcome, ProbeResult, StatusWaiter};
pub use tags::{reconcile, DefaultLabels, LabelSet, ReconciliationPlan, ReservedKeys};

// Re-export commonly used dependencies
pub use async_trait::async_trait;
pub use serde_json;
pub use tracing;
