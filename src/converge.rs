//! The lifecycle orchestrator.
//!
//! A [`Converger`] runs create, read, update and delete for registered
//! resource types against a [`RemoteApi`]. Each phase is built from the
//! same pieces:
//!
//! 1. the mutation, retried while the remote answers with a known
//!    transient error (IAM propagation, throttling);
//! 2. label reconciliation for types that carry labels: removes are issued
//!    before creates;
//! 3. a status wait for types whose infrastructure provisions (or deletes)
//!    asynchronously.
//!
//! Whole operations are never retried. A failure is returned to the caller
//! with the context needed to decide whether to run the operation again.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use hemmer_converge::{ConvergeConfig, ConvergenceRequest, Converger, LabelSet, ResourceProfile};
//! use hemmer_converge::tags::ReservedKeys;
//! use hemmer_converge::testing::FakeRemote;
//!
//! # tokio_test::block_on(async {
//! let remote = Arc::new(FakeRemote::new());
//! let converger = Converger::new(remote.clone(), ConvergeConfig::default())
//!     .with_profile("aws_sqs_queue", ResourceProfile::new().with_labels(ReservedKeys::aws()));
//!
//! let request = ConvergenceRequest::new("aws_sqs_queue")
//!     .with_labels(LabelSet::from_pairs([("env", "prod")]));
//! let observed = converger.create(&request).await.unwrap();
//!
//! assert_eq!(observed.labels.get("env"), Some("prod"));
//! # });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn, Span};

use crate::cancel::CancelToken;
use crate::classify::{ErrorClass, ErrorClassifier};
use crate::client::{JsonState, Mutation, MutationResponse, Observed, RemoteApi, StateStore};
use crate::config::ConvergeConfig;
use crate::error::{ConvergeError, Operation, RemoteError};
use crate::poll::{
    poll_until, Abort, PollConfig, PollOutcome, PollTimeout, ProbeResult, StatusWaiter, WaitError,
};
use crate::tags::{reconcile, LabelSet, ReconciliationPlan, ReservedKeys};

/// Target state reported when a mutation never got through.
const ACCEPTED: &str = "accepted";

/// Target state reported when a resource never became visible.
const EXISTS: &str = "exists";

/// The input to a create or update.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceRequest {
    /// Resource type name, used to look up the [`ResourceProfile`].
    pub resource_type: String,
    /// Remote identifier. Required for updates.
    pub id: Option<String>,
    /// Declared fields, labels excluded.
    pub fields: Value,
    /// Declared labels.
    pub labels: LabelSet,
    /// Overall budget. Defaults to the configured timeout for the operation.
    pub timeout: Option<Duration>,
}

impl ConvergenceRequest {
    /// A request with no fields and no labels.
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: None,
            fields: Value::Object(Map::new()),
            labels: LabelSet::new(),
            timeout: None,
        }
    }

    /// Build a request from whatever a state store declares.
    pub fn from_store<S: StateStore + ?Sized>(resource_type: impl Into<String>, store: &S) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: store.id(),
            fields: store.desired_fields(),
            labels: store.desired_labels(),
            timeout: None,
        }
    }

    /// Set the remote identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the declared fields.
    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = fields;
        self
    }

    /// Set the declared labels.
    pub fn with_labels(mut self, labels: LabelSet) -> Self {
        self.labels = labels;
        self
    }

    /// Set the overall budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// How one resource type converges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceProfile {
    /// Whether the type carries labels at all.
    pub supports_labels: bool,
    /// Keys the platform manages on this type.
    pub reserved: ReservedKeys,
    /// Status wait after a create, for types that provision asynchronously.
    pub create_wait: Option<StatusWaiter>,
    /// Status wait after an update.
    pub update_wait: Option<StatusWaiter>,
    /// Status wait after a delete; its target is normally empty ("gone").
    pub delete_wait: Option<StatusWaiter>,
    /// Labels per tag/untag call. Falls back to the engine configuration.
    pub label_batch_size: Option<usize>,
    /// Error signatures specific to this type, consulted first.
    pub error_signatures: ErrorClassifier,
}

impl ResourceProfile {
    /// A synchronous, unlabelled resource type.
    pub fn new() -> Self {
        Self::default()
    }

    /// The type carries labels; `reserved` keys are left alone.
    pub fn with_labels(mut self, reserved: ReservedKeys) -> Self {
        self.supports_labels = true;
        self.reserved = reserved;
        self
    }

    /// Wait for this status transition after a create.
    pub fn provisions_async(mut self, waiter: StatusWaiter) -> Self {
        self.create_wait = Some(waiter);
        self
    }

    /// Wait for this status transition after an update.
    pub fn updates_async(mut self, waiter: StatusWaiter) -> Self {
        self.update_wait = Some(waiter);
        self
    }

    /// Wait for this status transition after a delete.
    pub fn deletes_async(mut self, waiter: StatusWaiter) -> Self {
        self.delete_wait = Some(waiter);
        self
    }

    /// Cap the labels sent per call.
    pub fn with_label_batch_size(mut self, size: usize) -> Self {
        self.label_batch_size = Some(size);
        self
    }

    /// Add type-specific error signatures.
    pub fn with_error_signatures(mut self, signatures: ErrorClassifier) -> Self {
        self.error_signatures = signatures;
        self
    }
}

/// A profile with everything derived from the engine configuration.
#[derive(Debug)]
struct Registered {
    profile: ResourceProfile,
    classifier: ErrorClassifier,
    reserved: ReservedKeys,
}

/// One resource instance within an operation.
struct Handle<'a> {
    resource_type: &'a str,
    id: &'a str,
    name: String,
    registered: &'a Registered,
}

/// An overall deadline shared by every step of one operation.
#[derive(Debug, Clone, Copy)]
struct Budget {
    started: Instant,
    total: Duration,
}

impl Budget {
    fn start(total: Duration) -> Self {
        Self {
            started: Instant::now(),
            total,
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.elapsed())
    }
}

/// Drives resources to their declared state.
///
/// Cheap to share: wrap it in an `Arc` and run operations on different
/// resources concurrently. Operations hold no state between calls.
pub struct Converger<C: ?Sized> {
    client: Arc<C>,
    config: ConvergeConfig,
    classifier: ErrorClassifier,
    profiles: HashMap<String, Registered>,
    cancel: CancelToken,
}

impl<C: ?Sized> fmt::Debug for Converger<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converger")
            .field("config", &self.config)
            .field("resource_types", &self.profiles.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<C: RemoteApi + ?Sized> Converger<C> {
    /// Create an engine over `client`.
    ///
    /// Configured error signatures take precedence over the built-in table.
    pub fn new(client: Arc<C>, config: ConvergeConfig) -> Self {
        let classifier = ErrorClassifier::defaults().with_overrides(config.error_signatures.clone());
        Self {
            client,
            config,
            classifier,
            profiles: HashMap::new(),
            cancel: CancelToken::never(),
        }
    }

    /// Register a resource type.
    pub fn with_profile(mut self, resource_type: impl Into<String>, profile: ResourceProfile) -> Self {
        let classifier = self
            .classifier
            .clone()
            .with_overrides(profile.error_signatures.clone());
        let reserved = profile.reserved.clone().union(&self.config.ignore_labels);
        self.profiles.insert(
            resource_type.into(),
            Registered {
                profile,
                classifier,
                reserved,
            },
        );
        self
    }

    /// Observe `cancel` in every wait.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The engine configuration.
    pub fn config(&self) -> &ConvergeConfig {
        &self.config
    }

    /// The remote client.
    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Wrap a state document, applying the configured default labels.
    pub fn state(&self, doc: Value) -> JsonState {
        JsonState::new(doc).with_defaults(self.config.default_labels.clone())
    }

    /// The profile registered for a resource type.
    pub fn profile(&self, resource_type: &str) -> Option<&ResourceProfile> {
        self.profiles.get(resource_type).map(|r| &r.profile)
    }

    /// Plan the label changes for a resource without applying them.
    pub fn plan_labels(
        &self,
        resource_type: &str,
        desired: &LabelSet,
        observed: &LabelSet,
    ) -> Result<ReconciliationPlan, ConvergeError> {
        let registered = self.registered(resource_type)?;
        let desired = self.config.default_labels.merge_into(desired);
        Ok(reconcile(&desired, observed, &registered.reserved))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a resource and wait for it to converge.
    #[instrument(
        skip(self, request),
        fields(resource_type = %request.resource_type, id = tracing::field::Empty),
        name = "converge.create"
    )]
    pub async fn create(&self, request: &ConvergenceRequest) -> Result<Observed, ConvergeError> {
        debug!("Create called");
        let result = self.create_inner(request).await;
        match &result {
            Ok(observed) => info!(status = %observed.status, "Create converged"),
            Err(e) => error!(error = %e, "Create failed"),
        }
        result
    }

    /// Update a resource and wait for it to converge.
    #[instrument(
        skip(self, request),
        fields(resource_type = %request.resource_type, id = ?request.id),
        name = "converge.update"
    )]
    pub async fn update(&self, request: &ConvergenceRequest) -> Result<Observed, ConvergeError> {
        debug!("Update called");
        let result = self.update_inner(request).await;
        match &result {
            Ok(observed) => info!(status = %observed.status, "Update converged"),
            Err(e) => error!(error = %e, "Update failed"),
        }
        result
    }

    /// Describe a resource once.
    ///
    /// `Ok(None)` means the resource does not exist; the caller should
    /// treat its declared state as absent. Errors are not retried.
    #[instrument(skip(self), name = "converge.read")]
    pub async fn read(&self, resource_type: &str, id: &str) -> Result<Option<Observed>, ConvergeError> {
        debug!("Read called");
        let registered = self.registered(resource_type)?;
        let name = display_name(resource_type, Some(id));

        if self.cancel.is_cancelled() {
            return Err(ConvergeError::Cancelled {
                resource: name,
                operation: Operation::Read,
            });
        }

        match self.describe(resource_type, id).await {
            Ok(Some(observed)) => Ok(Some(visible(observed, registered))),
            Ok(None) => {
                info!("Resource not found, treating as absent");
                Ok(None)
            },
            Err(source) => {
                error!(error = %source, "Read failed");
                Err(ConvergeError::Fatal {
                    resource: name,
                    operation: Operation::Read,
                    source,
                })
            },
        }
    }

    /// Delete a resource and, for asynchronous types, wait until it is gone.
    ///
    /// A resource that is already missing counts as deleted.
    #[instrument(skip(self), name = "converge.delete")]
    pub async fn delete(&self, resource_type: &str, id: &str) -> Result<(), ConvergeError> {
        debug!("Delete called");
        let result = self.delete_inner(resource_type, id).await;
        match &result {
            Ok(()) => info!("Delete converged"),
            Err(e) => error!(error = %e, "Delete failed"),
        }
        result
    }

    // =========================================================================
    // State store integration
    // =========================================================================

    /// Create or update the resource behind `store`, then record what was
    /// observed.
    #[instrument(skip(self, store), name = "converge.apply")]
    pub async fn apply<S: StateStore + ?Sized>(
        &self,
        resource_type: &str,
        store: &mut S,
    ) -> Result<Observed, ConvergeError> {
        let request = ConvergenceRequest::from_store(resource_type, store);
        let observed = if request.id.is_some() {
            self.update(&request).await?
        } else {
            self.create(&request).await?
        };
        store.record(&observed);
        Ok(observed)
    }

    /// Refresh `store` from the remote. Returns false, and clears the
    /// store, when the resource no longer exists.
    #[instrument(skip(self, store), name = "converge.refresh")]
    pub async fn refresh<S: StateStore + ?Sized>(
        &self,
        resource_type: &str,
        store: &mut S,
    ) -> Result<bool, ConvergeError> {
        let Some(id) = store.id() else {
            return Ok(false);
        };
        match self.read(resource_type, &id).await? {
            Some(observed) => {
                store.record(&observed);
                Ok(true)
            },
            None => {
                store.clear();
                Ok(false)
            },
        }
    }

    /// Delete the resource behind `store` and clear it.
    #[instrument(skip(self, store), name = "converge.destroy")]
    pub async fn destroy<S: StateStore + ?Sized>(
        &self,
        resource_type: &str,
        store: &mut S,
    ) -> Result<(), ConvergeError> {
        if let Some(id) = store.id() {
            self.delete(resource_type, &id).await?;
        }
        store.clear();
        Ok(())
    }

    // =========================================================================
    // Phases
    // =========================================================================

    async fn create_inner(&self, request: &ConvergenceRequest) -> Result<Observed, ConvergeError> {
        let registered = self.registered(&request.resource_type)?;
        let budget = Budget::start(
            request
                .timeout
                .unwrap_or(self.config.timeouts.for_operation(Operation::Create)),
        );

        let mutation = Mutation::Create {
            resource_type: request.resource_type.clone(),
            fields: request.fields.clone(),
        };
        let name = display_name(&request.resource_type, request.id.as_deref());
        let response = self
            .mutate(&mutation, &name, &budget, &registered.classifier)
            .await?;

        let Some(id) = response.id.or_else(|| request.id.clone()) else {
            return Err(ConvergeError::Fatal {
                resource: name,
                operation: Operation::Create,
                source: RemoteError::new("create response carried no identifier"),
            });
        };
        Span::current().record("id", id.as_str());
        info!("Resource created");

        let handle = Handle {
            resource_type: &request.resource_type,
            id: &id,
            name: display_name(&request.resource_type, Some(&id)),
            registered,
        };
        self.settle(
            &handle,
            &request.labels,
            registered.profile.create_wait.as_ref(),
            Operation::Create,
            &budget,
        )
        .await
    }

    async fn update_inner(&self, request: &ConvergenceRequest) -> Result<Observed, ConvergeError> {
        let registered = self.registered(&request.resource_type)?;
        let Some(id) = request.id.as_deref() else {
            return Err(ConvergeError::Configuration(format!(
                "cannot update {} without an identifier",
                request.resource_type
            )));
        };
        let budget = Budget::start(
            request
                .timeout
                .unwrap_or(self.config.timeouts.for_operation(Operation::Update)),
        );
        let handle = Handle {
            resource_type: &request.resource_type,
            id,
            name: display_name(&request.resource_type, Some(id)),
            registered,
        };

        if has_fields(&request.fields) {
            let mutation = Mutation::Update {
                resource_type: request.resource_type.clone(),
                id: id.to_string(),
                fields: request.fields.clone(),
            };
            self.mutate(&mutation, &handle.name, &budget, &registered.classifier)
                .await?;
            info!("Resource updated");
        } else {
            debug!("No field changes, skipping update call");
        }

        self.settle(
            &handle,
            &request.labels,
            registered.profile.update_wait.as_ref(),
            Operation::Update,
            &budget,
        )
        .await
    }

    async fn delete_inner(&self, resource_type: &str, id: &str) -> Result<(), ConvergeError> {
        let registered = self.registered(resource_type)?;
        let budget = Budget::start(self.config.timeouts.for_operation(Operation::Delete));
        let handle = Handle {
            resource_type,
            id,
            name: display_name(resource_type, Some(id)),
            registered,
        };

        let mutation = Mutation::Delete {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
        };
        match self
            .mutate(&mutation, &handle.name, &budget, &registered.classifier)
            .await
        {
            Ok(_) => info!("Delete accepted"),
            Err(ConvergeError::Fatal { source, .. }) if source.is_not_found() => {
                info!("Resource already gone");
                return Ok(());
            },
            Err(e) => return Err(e),
        }

        if let Some(waiter) = &registered.profile.delete_wait {
            let waiter = waiter.clone().accepting_absence();
            self.wait_for(&handle, &waiter, Operation::Delete, &budget, true)
                .await?;
        }
        Ok(())
    }

    /// Everything after the field mutation: labels, then the status wait.
    async fn settle(
        &self,
        handle: &Handle<'_>,
        labels: &LabelSet,
        wait: Option<&StatusWaiter>,
        operation: Operation,
        budget: &Budget,
    ) -> Result<Observed, ConvergeError> {
        let mut observed = None;

        if handle.registered.profile.supports_labels {
            let mut current = self.observe_present(handle, operation, budget, true).await?;
            let desired = self.config.default_labels.merge_into(labels);
            let plan = reconcile(&desired, &current.labels, &handle.registered.reserved);
            self.apply_labels(handle, &plan, budget).await?;
            current.labels = plan.apply(&current.labels);
            observed = Some(current);
        } else if !labels.is_empty() {
            debug!(labels = labels.len(), "Resource type has no labels, ignoring declared labels");
        }

        if let Some(waiter) = wait {
            if let Some(waited) = self
                .wait_for(handle, waiter, operation, budget, observed.is_none())
                .await?
            {
                observed = Some(waited);
            }
        }

        let observed = match observed {
            Some(observed) => observed,
            None => self.observe_present(handle, operation, budget, true).await?,
        };
        Ok(visible(observed, handle.registered))
    }

    /// Issue the untag calls, then the tag calls.
    async fn apply_labels(
        &self,
        handle: &Handle<'_>,
        plan: &ReconciliationPlan,
        budget: &Budget,
    ) -> Result<(), ConvergeError> {
        if plan.is_empty() {
            debug!("Labels already converged");
            return Ok(());
        }
        info!(
            to_remove = plan.to_remove.len(),
            to_create = plan.to_create.len(),
            "Reconciling labels"
        );

        let batch = handle
            .registered
            .profile
            .label_batch_size
            .unwrap_or(self.config.label_batch_size);
        let classifier = &handle.registered.classifier;

        for chunk in plan.to_remove.chunks(batch) {
            let mutation = Mutation::Untag {
                resource_type: handle.resource_type.to_string(),
                id: handle.id.to_string(),
                keys: chunk.keys(),
            };
            self.mutate(&mutation, &handle.name, budget, classifier).await?;
        }
        for labels in plan.to_create.chunks(batch) {
            let mutation = Mutation::Tag {
                resource_type: handle.resource_type.to_string(),
                id: handle.id.to_string(),
                labels,
            };
            self.mutate(&mutation, &handle.name, budget, classifier).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Building blocks
    // =========================================================================

    /// Issue a mutation, retrying transient errors within the retry budget.
    async fn mutate(
        &self,
        mutation: &Mutation,
        name: &str,
        budget: &Budget,
        classifier: &ErrorClassifier,
    ) -> Result<MutationResponse, ConvergeError> {
        let operation = mutation.operation();
        let config = self.config.mutation_poll(budget.remaining());

        let outcome = poll_until(
            || async move {
                match self.client.mutate(mutation).await {
                    Ok(response) => ProbeResult::Ready(response),
                    Err(e) if classifier.is_transient(&e) => {
                        debug!(%operation, error = %e, "Transient error, retrying");
                        ProbeResult::TransientError(e)
                    },
                    Err(e) => ProbeResult::FatalError(e),
                }
            },
            &config,
            &self.cancel,
        )
        .await;

        match outcome {
            PollOutcome::Success(response) => Ok(response),
            PollOutcome::TimedOut(timeout) => Err(timed_out(
                name,
                operation,
                &[ACCEPTED.to_string()],
                timeout,
                budget.elapsed(),
            )),
            PollOutcome::Aborted(Abort::Cancelled) => Err(cancelled(name, operation)),
            PollOutcome::Aborted(Abort::Fatal(source)) => Err(ConvergeError::Fatal {
                resource: name.to_string(),
                operation,
                source,
            }),
        }
    }

    /// Describe until the resource is visible, tolerating a few not-found
    /// answers right after a mutation.
    async fn observe_present(
        &self,
        handle: &Handle<'_>,
        operation: Operation,
        budget: &Budget,
        first: bool,
    ) -> Result<Observed, ConvergeError> {
        let limit = self.config.not_found_checks;
        let misses = AtomicU32::new(0);
        let classifier = &handle.registered.classifier;
        let config = self.status_poll(budget, first);

        let outcome = poll_until(
            || {
                let misses = &misses;
                async move {
                    match self.describe(handle.resource_type, handle.id).await {
                        Ok(Some(observed)) => ProbeResult::Ready(observed),
                        Ok(None) => {
                            let checks = misses.fetch_add(1, Ordering::Relaxed) + 1;
                            if checks > limit {
                                ProbeResult::FatalError(WaitError::NotFound { checks })
                            } else {
                                debug!(checks, "Resource not visible yet");
                                ProbeResult::not_yet_ready()
                            }
                        },
                        Err(e) => match classifier.classify(&e) {
                            ErrorClass::Transient => ProbeResult::TransientError(WaitError::Remote(e)),
                            ErrorClass::Fatal => ProbeResult::FatalError(WaitError::Remote(e)),
                        },
                    }
                }
            },
            &config,
            &self.cancel,
        )
        .await;

        wait_result(outcome, &handle.name, operation, &[EXISTS.to_string()], budget)
    }

    /// Run a status wait against the resource.
    async fn wait_for(
        &self,
        handle: &Handle<'_>,
        waiter: &StatusWaiter,
        operation: Operation,
        budget: &Budget,
        first: bool,
    ) -> Result<Option<Observed>, ConvergeError> {
        debug!(pending = ?waiter.pending, target = ?waiter.target, "Waiting for status");
        let classifier = &handle.registered.classifier;
        let config = self.status_poll(budget, first);

        let outcome = waiter
            .wait(
                || self.describe(handle.resource_type, handle.id),
                |e: &RemoteError| classifier.classify(e),
                &config,
                &self.cancel,
            )
            .await;

        wait_result(outcome, &handle.name, operation, &waiter.target, budget)
    }

    /// Describe, folding not-found errors into `None`.
    async fn describe(&self, resource_type: &str, id: &str) -> Result<Option<Observed>, RemoteError> {
        match self.client.describe(resource_type, id).await {
            Err(e) if e.is_not_found() => Ok(None),
            other => other,
        }
    }

    /// Status poll timing. Only the first describe after a mutation waits
    /// out the configured delay.
    fn status_poll(&self, budget: &Budget, first: bool) -> PollConfig {
        let config = self.config.status_poll(budget.remaining());
        if first {
            config
        } else {
            config.with_delay(Duration::ZERO)
        }
    }

    fn registered(&self, resource_type: &str) -> Result<&Registered, ConvergeError> {
        self.profiles
            .get(resource_type)
            .ok_or_else(|| ConvergeError::UnknownResource(resource_type.to_string()))
    }
}

/// Strip reserved labels from what the caller gets to see.
fn visible(mut observed: Observed, registered: &Registered) -> Observed {
    observed.labels = observed.labels.without_reserved(&registered.reserved);
    observed
}

fn has_fields(fields: &Value) -> bool {
    match fields {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

fn display_name(resource_type: &str, id: Option<&str>) -> String {
    match id {
        Some(id) => format!("{} ({})", resource_type, id),
        None => resource_type.to_string(),
    }
}

fn cancelled(name: &str, operation: Operation) -> ConvergeError {
    warn!(%operation, "Cancelled");
    ConvergeError::Cancelled {
        resource: name.to_string(),
        operation,
    }
}

fn timed_out<E: fmt::Display>(
    name: &str,
    operation: Operation,
    target: &[String],
    timeout: PollTimeout<E>,
    elapsed: Duration,
) -> ConvergeError {
    warn!(
        %operation,
        attempts = timeout.attempts,
        last_status = ?timeout.last_status,
        last_error = %timeout.last_error,
        "Timed out"
    );
    ConvergeError::TimedOut {
        resource: name.to_string(),
        operation,
        target: target.to_vec(),
        last_status: timeout.last_status,
        last_error: timeout.last_error.transient().map(ToString::to_string),
        elapsed,
    }
}

fn wait_result<T>(
    outcome: PollOutcome<T, WaitError<RemoteError>>,
    name: &str,
    operation: Operation,
    target: &[String],
    budget: &Budget,
) -> Result<T, ConvergeError> {
    match outcome {
        PollOutcome::Success(value) => Ok(value),
        PollOutcome::TimedOut(timeout) => {
            Err(timed_out(name, operation, target, timeout, budget.elapsed()))
        },
        PollOutcome::Aborted(Abort::Cancelled) => Err(cancelled(name, operation)),
        PollOutcome::Aborted(Abort::Fatal(WaitError::Remote(source))) => Err(ConvergeError::Fatal {
            resource: name.to_string(),
            operation,
            source,
        }),
        PollOutcome::Aborted(Abort::Fatal(WaitError::UnexpectedState { status })) => {
            Err(ConvergeError::UnexpectedState {
                resource: name.to_string(),
                status,
                target: target.to_vec(),
            })
        },
        PollOutcome::Aborted(Abort::Fatal(WaitError::NotFound { checks })) => {
            debug!(checks, "Gave up waiting for the resource to appear");
            Err(ConvergeError::NotFound(name.to_string()))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::tags::DefaultLabels;
    use crate::testing::{assert_operations, labels, FakeRemote};
    use serde_json::json;

    const QUEUE: &str = "aws_sqs_queue";
    const CLUSTER: &str = "aws_msk_cluster";
    const APPLICATION: &str = "aws_kinesisanalyticsv2_application";

    fn test_config() -> ConvergeConfig {
        ConvergeConfig {
            poll_interval: Duration::from_secs(1),
            mutation_retry_interval: Duration::from_secs(1),
            ..ConvergeConfig::default()
        }
    }

    fn converger_with(remote: &Arc<FakeRemote>, config: ConvergeConfig) -> Converger<FakeRemote> {
        Converger::new(remote.clone(), config)
            .with_profile(QUEUE, ResourceProfile::new().with_labels(ReservedKeys::aws()))
            .with_profile(
                CLUSTER,
                ResourceProfile::new()
                    .with_labels(ReservedKeys::aws())
                    .provisions_async(StatusWaiter::new(["CREATING"], ["ACTIVE"]))
                    .updates_async(StatusWaiter::new(["UPDATING"], ["ACTIVE"]))
                    .deletes_async(StatusWaiter::gone(["DELETING"])),
            )
            .with_profile(APPLICATION, ResourceProfile::new())
    }

    fn converger(remote: &Arc<FakeRemote>) -> Converger<FakeRemote> {
        converger_with(remote, test_config())
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_applies_labels_and_hides_reserved() {
        let remote = Arc::new(
            FakeRemote::new().with_injected_labels(labels(&[("aws:cloudformation:stack-name", "s")])),
        );
        let converger = converger(&remote);

        let request = ConvergenceRequest::new(QUEUE)
            .with_fields(json!({"name": "orders"}))
            .with_labels(labels(&[("env", "prod")]));
        let observed = converger.create(&request).await.unwrap();

        assert_eq!(observed.id, "res-1");
        assert_eq!(observed.labels, labels(&[("env", "prod")]));
        assert_operations(&remote, &[Operation::Create, Operation::Tag]);

        let stored = remote.resource(QUEUE, "res-1").unwrap();
        assert_eq!(stored.labels.get("aws:cloudformation:stack-name"), Some("s"));
        assert_eq!(stored.labels.get("env"), Some("prod"));
        assert_eq!(stored.fields["name"], "orders");
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_retries_iam_propagation() {
        let remote = Arc::new(FakeRemote::new());
        remote.fail_times(
            Operation::Create,
            RemoteError::with_code(
                "InvalidArgumentException",
                "Kinesis Analytics service doesn't have sufficient privileges to assume the role",
            ),
            2,
        );
        let converger = converger(&remote);
        let start = Instant::now();

        let observed = converger
            .create(&ConvergenceRequest::new(APPLICATION))
            .await
            .unwrap();

        assert_eq!(observed.status, "ACTIVE");
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_operations(
            &remote,
            &[Operation::Create, Operation::Create, Operation::Create],
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_fatal_error_is_not_retried() {
        let remote = Arc::new(FakeRemote::new());
        remote.fail_times(
            Operation::Create,
            RemoteError::with_code("ValidationException", "name must match [a-z]+"),
            1,
        );
        let converger = converger(&remote);

        let err = converger
            .create(&ConvergenceRequest::new(QUEUE))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "error creating aws_sqs_queue: ValidationException: name must match [a-z]+"
        );
        assert_operations(&remote, &[Operation::Create]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_retry_budget_runs_out() {
        let remote = Arc::new(FakeRemote::new());
        remote.fail_times(
            Operation::Create,
            RemoteError::with_code("ThrottlingException", "Rate exceeded"),
            100,
        );
        let config = ConvergeConfig {
            mutation_retry_timeout: Duration::from_secs(5),
            ..test_config()
        };
        let converger = converger_with(&remote, config);

        let err = converger
            .create(&ConvergenceRequest::new(APPLICATION))
            .await
            .unwrap_err();

        match err {
            ConvergeError::TimedOut {
                operation,
                target,
                last_error,
                elapsed,
                ..
            } => {
                assert_eq!(operation, Operation::Create);
                assert_eq!(target, vec!["accepted".to_string()]);
                assert_eq!(last_error.as_deref(), Some("ThrottlingException: Rate exceeded"));
                assert_eq!(elapsed, Duration::from_secs(5));
            },
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_removes_before_creating() {
        let remote = Arc::new(FakeRemote::new().strict_tags());
        remote.insert(
            QUEUE,
            Observed::new("q-1", "ACTIVE").with_labels(labels(&[
                ("env", "dev"),
                ("owner", "a"),
                ("aws:createdBy", "x"),
            ])),
        );
        let converger = converger(&remote);

        let request = ConvergenceRequest::new(QUEUE)
            .with_id("q-1")
            .with_labels(labels(&[("env", "prod"), ("team", "core")]));
        let observed = converger.update(&request).await.unwrap();

        assert_eq!(observed.labels, labels(&[("env", "prod"), ("team", "core")]));
        assert_operations(&remote, &[Operation::Untag, Operation::Tag]);

        let calls = remote.calls();
        assert_eq!(
            calls[0],
            Mutation::Untag {
                resource_type: QUEUE.to_string(),
                id: "q-1".to_string(),
                keys: vec!["env".to_string(), "owner".to_string()],
            }
        );

        let stored = remote.resource(QUEUE, "q-1").unwrap();
        assert_eq!(
            stored.labels,
            labels(&[("aws:createdBy", "x"), ("env", "prod"), ("team", "core")])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_with_fields_and_async_wait() {
        let remote = Arc::new(FakeRemote::new().with_status_script(
            CLUSTER,
            Operation::Update,
            ["UPDATING", "UPDATING", "ACTIVE"],
        ));
        remote.insert(CLUSTER, Observed::new("c-1", "ACTIVE"));
        let converger = converger(&remote);
        let start = Instant::now();

        let request = ConvergenceRequest::new(CLUSTER)
            .with_id("c-1")
            .with_fields(json!({"broker_count": 6}));
        let observed = converger.update(&request).await.unwrap();

        assert_eq!(observed.status, "ACTIVE");
        assert_eq!(observed.fields["broker_count"], 6);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_operations(&remote, &[Operation::Update]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_requires_id() {
        let remote = Arc::new(FakeRemote::new());
        let converger = converger(&remote);

        let err = converger
            .update(&ConvergenceRequest::new(QUEUE))
            .await
            .unwrap_err();

        assert!(matches!(err, ConvergeError::Configuration(_)));
        assert!(remote.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_create_waits_for_active() {
        let remote = Arc::new(FakeRemote::new().with_status_script(
            CLUSTER,
            Operation::Create,
            ["CREATING", "CREATING", "ACTIVE"],
        ));
        let converger = converger(&remote);
        let start = Instant::now();

        let observed = converger
            .create(&ConvergenceRequest::new(CLUSTER))
            .await
            .unwrap();

        assert_eq!(observed.status, "ACTIVE");
        assert_eq!(remote.describe_calls(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_create_times_out_with_diagnostics() {
        let remote = Arc::new(FakeRemote::new().with_status_script(
            CLUSTER,
            Operation::Create,
            ["CREATING"],
        ));
        let converger = converger(&remote);

        let request = ConvergenceRequest::new(CLUSTER).with_timeout(Duration::from_secs(5));
        let err = converger.create(&request).await.unwrap_err();

        let message = err.to_string();
        assert!(message.contains("creating aws_msk_cluster (res-1)"));
        assert!(message.contains("[ACTIVE]"));
        assert!(message.contains("last state: CREATING"));
        match err {
            ConvergeError::TimedOut {
                last_status,
                elapsed,
                ..
            } => {
                assert_eq!(last_status.as_deref(), Some("CREATING"));
                assert_eq!(elapsed, Duration::from_secs(5));
            },
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_create_unexpected_state() {
        let remote = Arc::new(FakeRemote::new().with_status_script(
            CLUSTER,
            Operation::Create,
            ["CREATING", "FAILED"],
        ));
        let converger = converger(&remote);

        let err = converger
            .create(&ConvergenceRequest::new(CLUSTER))
            .await
            .unwrap_err();

        match err {
            ConvergeError::UnexpectedState { status, target, .. } => {
                assert_eq!(status, "FAILED");
                assert_eq!(target, vec!["ACTIVE".to_string()]);
            },
            other => panic!("expected unexpected state, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_tolerates_read_lag() {
        let remote = Arc::new(FakeRemote::new().with_read_lag(2));
        let converger = converger(&remote);
        let start = Instant::now();

        let observed = converger
            .create(&ConvergenceRequest::new(QUEUE))
            .await
            .unwrap();

        assert_eq!(observed.id, "res-1");
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(remote.describe_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_gives_up_when_never_visible() {
        let remote = Arc::new(FakeRemote::new().with_read_lag(100));
        let config = ConvergeConfig {
            not_found_checks: 3,
            ..test_config()
        };
        let converger = converger_with(&remote, config);

        let err = converger
            .create(&ConvergenceRequest::new(QUEUE))
            .await
            .unwrap_err();

        assert!(matches!(err, ConvergeError::NotFound(ref name) if name == "aws_sqs_queue (res-1)"));
        assert_eq!(remote.describe_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_waits_until_gone() {
        let remote = Arc::new(FakeRemote::new().with_status_script(
            CLUSTER,
            Operation::Delete,
            ["DELETING", "DELETING"],
        ));
        remote.insert(CLUSTER, Observed::new("c-1", "ACTIVE"));
        let converger = converger(&remote);
        let start = Instant::now();

        converger.delete(CLUSTER, "c-1").await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert!(remote.resource(CLUSTER, "c-1").is_none());
        assert_eq!(converger.read(CLUSTER, "c-1").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_with_deleted_target_accepts_disappearance() {
        let remote = Arc::new(FakeRemote::new().with_status_script(
            CLUSTER,
            Operation::Delete,
            ["DELETING"],
        ));
        remote.insert(CLUSTER, Observed::new("c-1", "ACTIVE"));
        let converger = Converger::new(remote.clone(), test_config()).with_profile(
            CLUSTER,
            ResourceProfile::new().deletes_async(StatusWaiter::new(["DELETING"], ["DELETED"])),
        );
        let start = Instant::now();

        converger.delete(CLUSTER, "c-1").await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(remote.describe_calls(), 2);
        assert!(remote.resource(CLUSTER, "c-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_of_missing_resource_succeeds() {
        let remote = Arc::new(FakeRemote::new());
        let converger = converger(&remote);

        converger.delete(CLUSTER, "gone").await.unwrap();

        assert_operations(&remote, &[Operation::Delete]);
        assert_eq!(remote.describe_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read() {
        let remote = Arc::new(FakeRemote::new());
        remote.insert(
            QUEUE,
            Observed::new("q-1", "ACTIVE").with_labels(labels(&[("env", "dev"), ("aws:x", "y")])),
        );
        let converger = converger(&remote);

        let observed = converger.read(QUEUE, "q-1").await.unwrap().unwrap();
        assert_eq!(observed.labels, labels(&[("env", "dev")]));

        assert_eq!(converger.read(QUEUE, "missing").await.unwrap(), None);

        remote.fail_describe(RemoteError::with_code("ResourceNotFoundException", "no queue"));
        assert_eq!(converger.read(QUEUE, "q-1").await.unwrap(), None);

        remote.fail_describe(RemoteError::with_code("AccessDeniedException", "not allowed"));
        let err = converger.read(QUEUE, "q-1").await.unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::Fatal {
                operation: Operation::Read,
                ..
            }
        ));
        assert!(remote.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_resource_type() {
        let remote = Arc::new(FakeRemote::new());
        let converger = converger(&remote);

        let err = converger
            .create(&ConvergenceRequest::new("aws_unknown"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergeError::UnknownResource(ref t) if t == "aws_unknown"));

        let err = converger.read("aws_unknown", "x").await.unwrap_err();
        assert!(matches!(err, ConvergeError::UnknownResource(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let remote = Arc::new(FakeRemote::new().with_status_script(
            CLUSTER,
            Operation::Create,
            ["CREATING"],
        ));
        let (trigger, token) = cancel_pair();
        let converger = converger(&remote).with_cancel(token);
        let start = Instant::now();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });
        let err = converger
            .create(&ConvergenceRequest::new(CLUSTER))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ConvergeError::Cancelled {
                operation: Operation::Create,
                ..
            }
        ));
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_label_batches() {
        let remote = Arc::new(FakeRemote::new());
        let converger = Converger::new(remote.clone(), test_config()).with_profile(
            QUEUE,
            ResourceProfile::new()
                .with_labels(ReservedKeys::aws())
                .with_label_batch_size(2),
        );

        let request = ConvergenceRequest::new(QUEUE).with_labels(labels(&[
            ("a", "1"),
            ("b", "2"),
            ("c", "3"),
            ("d", "4"),
            ("e", "5"),
        ]));
        converger.create(&request).await.unwrap();

        assert_operations(
            &remote,
            &[Operation::Create, Operation::Tag, Operation::Tag, Operation::Tag],
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_signatures_take_precedence() {
        let remote = Arc::new(FakeRemote::new());
        remote.fail_times(
            Operation::Create,
            RemoteError::with_code("InvalidParameterValue", "cluster has no associated IAM Roles"),
            1,
        );
        let converger = Converger::new(remote.clone(), test_config()).with_profile(
            APPLICATION,
            ResourceProfile::new().with_error_signatures(
                ErrorClassifier::new()
                    .with(crate::classify::Signature::message("no associated IAM Roles").fatal()),
            ),
        );

        let err = converger
            .create(&ConvergenceRequest::new(APPLICATION))
            .await
            .unwrap_err();

        assert!(err.remote().is_some());
        assert_operations(&remote, &[Operation::Create]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_json_state_lifecycle() {
        let remote = Arc::new(FakeRemote::new());
        let config = ConvergeConfig {
            default_labels: DefaultLabels(labels(&[("team", "core")])),
            ..test_config()
        };
        let converger = converger_with(&remote, config);

        let mut state = converger.state(json!({"name": "orders", "tags": {"env": "prod"}}));
        converger.apply(QUEUE, &mut state).await.unwrap();

        let doc = state.value();
        assert_eq!(doc["id"], "res-1");
        assert_eq!(doc["tags"], json!({"env": "prod"}));
        assert_eq!(doc["tags_all"], json!({"env": "prod", "team": "core"}));

        // Second apply is an update with nothing left to reconcile.
        converger.apply(QUEUE, &mut state).await.unwrap();
        assert_operations(
            &remote,
            &[Operation::Create, Operation::Tag, Operation::Update],
        );

        assert!(converger.refresh(QUEUE, &mut state).await.unwrap());

        converger.destroy(QUEUE, &mut state).await.unwrap();
        assert_eq!(state.value(), json!({}));
        assert!(remote.resource(QUEUE, "res-1").is_none());
        assert!(!converger.refresh(QUEUE, &mut state).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_operations_share_one_client() {
        let remote = Arc::new(FakeRemote::new());
        let client: Arc<dyn RemoteApi> = remote.clone();
        let converger = Arc::new(
            Converger::new(client, test_config())
                .with_profile(QUEUE, ResourceProfile::new().with_labels(ReservedKeys::aws())),
        );

        let first = ConvergenceRequest::new(QUEUE).with_labels(labels(&[("n", "1")]));
        let second = ConvergenceRequest::new(QUEUE).with_labels(labels(&[("n", "2")]));
        let (a, b) = tokio::join!(converger.create(&first), converger.create(&second));

        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.id, b.id);
        assert_eq!(remote.resource(QUEUE, &a.id).unwrap().labels.get("n"), Some("1"));
        assert_eq!(remote.resource(QUEUE, &b.id).unwrap().labels.get("n"), Some("2"));
    }

    #[test]
    fn test_plan_labels_merges_defaults() {
        let remote = Arc::new(FakeRemote::new());
        let config = ConvergeConfig {
            default_labels: DefaultLabels(labels(&[("team", "core")])),
            ..test_config()
        };
        let converger = converger_with(&remote, config);

        let plan = converger
            .plan_labels(QUEUE, &labels(&[("env", "prod")]), &labels(&[("aws:x", "y")]))
            .unwrap();

        assert_eq!(plan.to_create, labels(&[("env", "prod"), ("team", "core")]));
        assert!(plan.to_remove.is_empty());
    }
}
