//! Test doubles for code built on the engine.
//!
//! - [`ScriptedProbe`] replays a fixed sequence of [`ProbeResult`]s, so a
//!   poll loop can be tested without any remote system.
//! - [`FakeRemote`] is an in-memory [`RemoteApi`] that records every call,
//!   plays scripted status transitions after mutations, and injects errors.
//!
//! Both are meant to be driven under `#[tokio::test(start_paused = true)]`,
//! where sleeps complete instantly and elapsed time is exact.
//!
//! # Example
//!
//! ```
//! use hemmer_converge::client::{Mutation, RemoteApi};
//! use hemmer_converge::testing::FakeRemote;
//! use hemmer_converge::Operation;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let remote = FakeRemote::new().with_status_script("aws_msk_cluster", Operation::Create, ["CREATING", "ACTIVE"]);
//! let created = remote
//!     .mutate(&Mutation::Create { resource_type: "aws_msk_cluster".into(), fields: json!({}) })
//!     .await
//!     .unwrap();
//! let id = created.id.unwrap();
//!
//! let first = remote.describe("aws_msk_cluster", &id).await.unwrap().unwrap();
//! let second = remote.describe("aws_msk_cluster", &id).await.unwrap().unwrap();
//! assert_eq!((first.status.as_str(), second.status.as_str()), ("CREATING", "ACTIVE"));
//! # });
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Ready;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::client::{Mutation, MutationResponse, Observed, RemoteApi};
use crate::error::{Operation, RemoteError};
use crate::poll::ProbeResult;
use crate::tags::{LabelSet, ReconciliationPlan};

/// Status a created resource reports when no script says otherwise.
pub const DEFAULT_STATUS: &str = "ACTIVE";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A probe that replays a script of results.
///
/// Once the script runs out the last result repeats forever.
#[derive(Debug)]
pub struct ScriptedProbe<T, E> {
    script: Mutex<VecDeque<ProbeResult<T, E>>>,
    last: Mutex<Option<ProbeResult<T, E>>>,
    calls: AtomicU32,
}

impl<T: Clone, E: Clone> ScriptedProbe<T, E> {
    /// Replay `script` in order.
    ///
    /// # Panics
    ///
    /// [`next`](Self::next) panics if the script is empty.
    pub fn new(script: Vec<ProbeResult<T, E>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            calls: AtomicU32::new(0),
        }
    }

    /// Return `result` on every call.
    pub fn repeat(result: ProbeResult<T, E>) -> Self {
        Self::new(vec![result])
    }

    /// The next result, as a future for `poll_until`.
    pub fn next(&self) -> Ready<ProbeResult<T, E>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut last = lock(&self.last);
        let result = match lock(&self.script).pop_front() {
            Some(result) => result,
            None => match last.clone() {
                Some(result) => result,
                None => panic!("ScriptedProbe called with an empty script"),
            },
        };
        *last = Some(result.clone());
        std::future::ready(result)
    }

    /// How many times the probe has been called.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct FakeResource {
    observed: Observed,
    pending: VecDeque<String>,
    removed_after_pending: bool,
    hidden_reads: u32,
}

impl FakeResource {
    fn play(&mut self, mut script: VecDeque<String>) {
        if let Some(first) = script.pop_front() {
            self.observed.status = first;
        }
        self.pending = script;
    }
}

#[derive(Debug, Default)]
struct FakeState {
    resources: BTreeMap<(String, String), FakeResource>,
    next_id: u64,
    calls: Vec<Mutation>,
    describes: u32,
    failures: HashMap<Operation, VecDeque<RemoteError>>,
    describe_failures: VecDeque<RemoteError>,
    scripts: HashMap<(String, Operation), Vec<String>>,
    injected_labels: LabelSet,
    read_lag: u32,
    strict_tags: bool,
}

impl FakeState {
    fn script(&self, resource_type: &str, operation: Operation) -> VecDeque<String> {
        self.scripts
            .get(&(resource_type.to_string(), operation))
            .cloned()
            .unwrap_or_default()
            .into()
    }

    fn existing(&mut self, resource_type: &str, id: &str) -> Result<&mut FakeResource, RemoteError> {
        self.resources
            .get_mut(&(resource_type.to_string(), id.to_string()))
            .ok_or_else(|| not_found(resource_type, id))
    }
}

fn not_found(resource_type: &str, id: &str) -> RemoteError {
    RemoteError::with_code(
        "ResourceNotFoundException",
        format!("{} {} does not exist", resource_type, id),
    )
}

/// An in-memory remote API.
///
/// Created resources get identifiers `res-1`, `res-2`, ... and report
/// [`DEFAULT_STATUS`] unless a status script is registered. A script is
/// played one status per describe after the matching mutation; the last
/// status sticks, except after a delete, where the resource disappears
/// once the script is exhausted.
#[derive(Debug, Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    /// An empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Play `statuses` after every `operation` on `resource_type`.
    pub fn with_status_script<S: Into<String>>(
        self,
        resource_type: impl Into<String>,
        operation: Operation,
        statuses: impl IntoIterator<Item = S>,
    ) -> Self {
        lock(&self.state).scripts.insert(
            (resource_type.into(), operation),
            statuses.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Labels the platform adds to every created resource.
    pub fn with_injected_labels(self, labels: LabelSet) -> Self {
        lock(&self.state).injected_labels = labels;
        self
    }

    /// Newly created resources are invisible to the first `reads` describes.
    pub fn with_read_lag(self, reads: u32) -> Self {
        lock(&self.state).read_lag = reads;
        self
    }

    /// Reject a tag call that sets a key the resource already carries.
    pub fn strict_tags(self) -> Self {
        lock(&self.state).strict_tags = true;
        self
    }

    /// Fail the next `times` mutations of `operation` with `error`.
    pub fn fail_times(&self, operation: Operation, error: RemoteError, times: usize) {
        let mut state = lock(&self.state);
        let queue = state.failures.entry(operation).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Fail the next describe with `error`.
    pub fn fail_describe(&self, error: RemoteError) {
        lock(&self.state).describe_failures.push_back(error);
    }

    /// Seed an existing resource.
    pub fn insert(&self, resource_type: impl Into<String>, observed: Observed) {
        let key = (resource_type.into(), observed.id.clone());
        lock(&self.state).resources.insert(
            key,
            FakeResource {
                observed,
                pending: VecDeque::new(),
                removed_after_pending: false,
                hidden_reads: 0,
            },
        );
    }

    /// Every mutation received, failed ones included, in order.
    pub fn calls(&self) -> Vec<Mutation> {
        lock(&self.state).calls.clone()
    }

    /// The operations of every mutation received, in order.
    pub fn operations(&self) -> Vec<Operation> {
        lock(&self.state)
            .calls
            .iter()
            .map(Mutation::operation)
            .collect()
    }

    /// How many describes were received.
    pub fn describe_calls(&self) -> u32 {
        lock(&self.state).describes
    }

    /// The resource as currently stored, without advancing any script.
    pub fn resource(&self, resource_type: &str, id: &str) -> Option<Observed> {
        lock(&self.state)
            .resources
            .get(&(resource_type.to_string(), id.to_string()))
            .map(|r| r.observed.clone())
    }

    fn apply(&self, mutation: &Mutation) -> Result<MutationResponse, RemoteError> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        state.calls.push(mutation.clone());

        if let Some(error) = state
            .failures
            .get_mut(&mutation.operation())
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        match mutation {
            Mutation::Create {
                resource_type,
                fields,
            } => {
                state.next_id += 1;
                let id = format!("res-{}", state.next_id);
                let mut resource = FakeResource {
                    observed: Observed::new(id.clone(), DEFAULT_STATUS)
                        .with_fields(fields.clone())
                        .with_labels(state.injected_labels.clone()),
                    pending: VecDeque::new(),
                    removed_after_pending: false,
                    hidden_reads: state.read_lag,
                };
                resource.play(state.script(resource_type, Operation::Create));
                state
                    .resources
                    .insert((resource_type.clone(), id.clone()), resource);
                Ok(MutationResponse::with_id(id))
            },
            Mutation::Update {
                resource_type,
                id,
                fields,
            } => {
                let script = state.script(resource_type, Operation::Update);
                let resource = state.existing(resource_type, id)?;
                merge_fields(&mut resource.observed.fields, fields);
                resource.play(script);
                Ok(MutationResponse::default())
            },
            Mutation::Delete { resource_type, id } => {
                let script = state.script(resource_type, Operation::Delete);
                if script.is_empty() {
                    state
                        .resources
                        .remove(&(resource_type.clone(), id.clone()))
                        .ok_or_else(|| not_found(resource_type, id))?;
                } else {
                    let resource = state.existing(resource_type, id)?;
                    resource.play(script);
                    resource.removed_after_pending = true;
                }
                Ok(MutationResponse::default())
            },
            Mutation::Tag {
                resource_type,
                id,
                labels,
            } => {
                let strict = state.strict_tags;
                let resource = state.existing(resource_type, id)?;
                if strict {
                    if let Some((key, _)) = labels
                        .iter()
                        .find(|(k, _)| resource.observed.labels.contains_key(k))
                    {
                        return Err(RemoteError::with_code(
                            "InvalidParameterException",
                            format!("duplicate tag key: {}", key),
                        ));
                    }
                }
                resource.observed.labels = resource.observed.labels.merge(labels);
                Ok(MutationResponse::default())
            },
            Mutation::Untag {
                resource_type,
                id,
                keys,
            } => {
                let resource = state.existing(resource_type, id)?;
                resource.observed.labels = resource.observed.labels.ignore_keys(keys);
                Ok(MutationResponse::default())
            },
        }
    }

    fn observe(&self, resource_type: &str, id: &str) -> Result<Option<Observed>, RemoteError> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        state.describes += 1;

        if let Some(error) = state.describe_failures.pop_front() {
            return Err(error);
        }

        let key = (resource_type.to_string(), id.to_string());
        let Some(resource) = state.resources.get_mut(&key) else {
            return Ok(None);
        };
        if resource.hidden_reads > 0 {
            resource.hidden_reads -= 1;
            return Ok(None);
        }

        let snapshot = resource.observed.clone();
        match resource.pending.pop_front() {
            Some(next) => resource.observed.status = next,
            None if resource.removed_after_pending => {
                state.resources.remove(&key);
            },
            None => {},
        }
        Ok(Some(snapshot))
    }
}

fn merge_fields(target: &mut Value, fields: &Value) {
    match (target, fields) {
        (Value::Object(target), Value::Object(fields)) => {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
        },
        (target, fields) => *target = fields.clone(),
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn mutate(&self, mutation: &Mutation) -> Result<MutationResponse, RemoteError> {
        self.apply(mutation)
    }

    async fn describe(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Option<Observed>, RemoteError> {
        self.observe(resource_type, id)
    }
}

/// Build a label set from pairs.
pub fn labels(pairs: &[(&str, &str)]) -> LabelSet {
    LabelSet::from_pairs(pairs.iter().copied())
}

/// Assert a plan creates and removes exactly the given labels.
#[track_caller]
pub fn assert_plan(plan: &ReconciliationPlan, create: &[(&str, &str)], remove: &[(&str, &str)]) {
    assert_eq!(plan.to_create, labels(create), "labels to create");
    assert_eq!(plan.to_remove, labels(remove), "labels to remove");
}

/// Assert the remote received mutations for exactly these operations, in order.
#[track_caller]
pub fn assert_operations(remote: &FakeRemote, expected: &[Operation]) {
    assert_eq!(remote.operations(), expected, "mutations received");
}
