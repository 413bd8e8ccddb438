//! The provisioning walk.
//!
//! Nodes are scheduled as soon as their last producer is Ready and run
//! concurrently on a [`JoinSet`]. A node whose producer failed or was
//! skipped is never started; it is marked Skipped and the mark spreads
//! to its own dependents. Independent branches keep going, so a stuck
//! certificate does not stop the network from completing.
//!
//! Every Ready node is persisted as soon as it completes. A re-run reads
//! those records back and keeps, updates or replaces each node according
//! to its fingerprint. Superseded generations are only retired after a
//! walk in which every node reached Ready.

use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use sha2::{Digest, Sha256};
use stackgrid_cloud::{Provisioner, RetryPolicy};
use stackgrid_state::{
    ApplyRun, EntityRecord, EntityStatus, RunOutcome, StateError, StateStore,
};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{FailedNode, ProvisionError, ProvisionResult};
use crate::executor::Executor;
use crate::graph::{NodeId, TopologyGraph};
use crate::outputs::{Inputs, NodeOutput};
use crate::plan::Plan;
use crate::providers::Providers;
use crate::report::{ApplyReport, NodeFate};

/// Per-run switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Replace the certificate chain even if a terminal failure is on
    /// record.
    pub reissue_certificate: bool,
}

/// Drives one stack's plan against the providers and the state store.
pub struct Orchestrator {
    executor: Arc<Executor>,
    store: StateStore,
}

impl Orchestrator {
    pub fn new(plan: Plan, providers: Providers, store: StateStore) -> Self {
        let retry = RetryPolicy::from(&plan.stack.retry);
        let provisioner = Provisioner::new(providers.cloud.clone(), retry);
        Self::with_provisioner(plan, providers, provisioner, store)
    }

    /// Use a pre-configured provisioner, e.g. with a shorter readiness
    /// poll.
    pub fn with_provisioner(
        plan: Plan,
        providers: Providers,
        provisioner: Provisioner,
        store: StateStore,
    ) -> Self {
        Self {
            executor: Arc::new(Executor::new(Arc::new(plan), providers, provisioner)),
            store,
        }
    }

    pub fn plan(&self) -> &Plan {
        self.executor.plan()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Walk the graph once.
    ///
    /// Returns the report when every node reached Ready. Otherwise the
    /// run is still recorded and the error is `PartialApplyFailure`, or
    /// `CertificateTerminal` when a failed certificate blocks the run
    /// before anything is attempted.
    pub async fn apply(
        &self,
        options: ApplyOptions,
        shutdown: watch::Receiver<bool>,
    ) -> ProvisionResult<ApplyReport> {
        let started = Instant::now();
        let started_at = epoch_secs();
        let run_id = new_run_id();
        let stack = self.plan().stack.name.clone();
        info!(
            %stack,
            %run_id,
            reissue_certificate = options.reissue_certificate,
            "apply started"
        );

        // Fail fast on a certificate that needs re-issuance.
        if !options.reissue_certificate {
            if let Some(err) = self.terminal_certificate()? {
                warn!(%stack, error = %err, "apply rejected");
                self.store.put_run(&ApplyRun {
                    id: run_id,
                    stack,
                    started_at,
                    finished_at: epoch_secs(),
                    outcome: RunOutcome::Rejected,
                    created: Vec::new(),
                    kept: Vec::new(),
                    updated: Vec::new(),
                    retired: Vec::new(),
                    failed: vec![format!("{}: {err}", NodeId::CertificateValidation)],
                    skipped: Vec::new(),
                    ready_unused: Vec::new(),
                })?;
                return Err(err);
            }
        }

        let walk = self.walk(options, shutdown).await?;
        let ready_unused = walk.ready_unused(&self.plan().graph);
        let skipped: Vec<NodeId> = walk
            .fates
            .iter()
            .filter(|(_, fate)| matches!(fate, NodeFate::Skipped { .. }))
            .map(|(node, _)| *node)
            .collect();
        let complete = walk.failures.is_empty() && skipped.is_empty();

        let retired = if complete {
            self.retire_superseded().await?
        } else {
            Vec::new()
        };

        let names = |pick: fn(&NodeFate) -> bool| -> Vec<String> {
            walk.fates
                .iter()
                .filter(|(_, fate)| pick(fate))
                .map(|(node, _)| node.to_string())
                .collect()
        };
        let run = ApplyRun {
            id: run_id.clone(),
            stack: stack.clone(),
            started_at,
            finished_at: epoch_secs(),
            outcome: if complete {
                RunOutcome::Succeeded
            } else {
                RunOutcome::PartiallyApplied
            },
            created: names(|f| matches!(f, NodeFate::Created { .. })),
            kept: names(|f| matches!(f, NodeFate::Kept { .. })),
            updated: names(|f| matches!(f, NodeFate::Updated { .. })),
            retired: retired.clone(),
            failed: walk
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.node, f.error))
                .collect(),
            skipped: skipped.iter().map(NodeId::to_string).collect(),
            ready_unused: ready_unused.iter().map(NodeId::to_string).collect(),
        };
        self.store.put_run(&run)?;

        let elapsed = started.elapsed();
        if !complete {
            error!(
                %stack,
                %run_id,
                failed = walk.failures.len(),
                skipped = skipped.len(),
                ready_unused = ready_unused.len(),
                "apply partially failed"
            );
            return Err(ProvisionError::PartialApplyFailure {
                failed: walk.failures,
                skipped,
                ready_unused,
            });
        }

        info!(
            %stack,
            %run_id,
            created = run.created.len(),
            updated = run.updated.len(),
            kept = run.kept.len(),
            retired = run.retired.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "apply complete"
        );
        Ok(ApplyReport {
            run_id,
            stack,
            fates: walk.fates,
            retired,
            elapsed,
        })
    }

    fn terminal_certificate(&self) -> ProvisionResult<Option<ProvisionError>> {
        let key = NodeId::CertificateValidation.key();
        let Some(record) = self.store.get_entity(&key)? else {
            return Ok(None);
        };
        match record.status {
            EntityStatus::Failed {
                reason,
                terminal: true,
            } => Ok(Some(ProvisionError::CertificateTerminal {
                domain: self.plan().stack.domain.clone(),
                reason,
            })),
            _ => Ok(None),
        }
    }

    async fn walk(
        &self,
        options: ApplyOptions,
        shutdown: watch::Receiver<bool>,
    ) -> ProvisionResult<Walk> {
        let graph = &self.plan().graph;
        let mut previous = BTreeMap::new();
        for node in graph.nodes() {
            if let Some(record) = self.store.get_entity(&node.key())? {
                previous.insert(node, record);
            }
        }

        let mut walk = Walk::new(graph);
        let mut tasks = JoinSet::new();
        loop {
            while let Some(node) = walk.queue.pop_front() {
                if *shutdown.borrow() {
                    debug!(%node, "not started, apply cancelled");
                    walk.settle(
                        graph,
                        node,
                        NodeFate::Skipped {
                            reason: "apply cancelled".to_string(),
                        },
                    );
                    continue;
                }

                let step = Step {
                    node,
                    inputs: walk.inputs_for(graph, node),
                    producers: graph
                        .deps(node)
                        .iter()
                        .filter_map(|dep| walk.identities.get(dep).map(|id| (*dep, id.clone())))
                        .collect(),
                    previous: previous.get(&node).cloned(),
                    forced: options.reissue_certificate && node.is_certificate_chain(),
                };
                let executor = self.executor.clone();
                let store = self.store.clone();
                let shutdown = shutdown.clone();
                tasks.spawn(async move {
                    let result = run_step(&executor, &store, step, shutdown).await;
                    (node, result)
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((node, Ok(done))) => {
                    walk.outputs.insert(node, Arc::new(done.output));
                    walk.identities.insert(node, done.identity);
                    walk.settle(graph, node, done.fate);
                }
                Ok((node, Err(err))) => {
                    warn!(%node, error = %err, "node failed");
                    walk.settle(
                        graph,
                        node,
                        NodeFate::Failed {
                            reason: err.to_string(),
                        },
                    );
                    walk.failures.push(FailedNode {
                        node,
                        error: Box::new(err),
                    });
                }
                Err(e) => error!(error = %e, "node task aborted"),
            }
        }

        // A node whose task aborted never settled.
        for node in graph.order() {
            if walk.fates.contains_key(node) {
                continue;
            }
            let fate = if walk.deps_ready(graph, *node) {
                walk.failures.push(FailedNode {
                    node: *node,
                    error: Box::new(ProvisionError::Cancelled {
                        node: node.to_string(),
                    }),
                });
                NodeFate::Failed {
                    reason: "task aborted".to_string(),
                }
            } else {
                NodeFate::Skipped {
                    reason: "producer did not become ready".to_string(),
                }
            };
            walk.fates.insert(*node, fate);
        }
        Ok(walk)
    }

    /// Delete superseded generations, consumers before producers.
    async fn retire_superseded(&self) -> ProvisionResult<Vec<String>> {
        let rank = self.plan().graph.rank();
        let mut pending = self.store.pending_retirements()?;
        pending.sort_by_key(|record| {
            let position = NodeId::from_key(&record.table_key())
                .and_then(|node| rank.get(&node).copied())
                .unwrap_or(0);
            (Reverse(position), Reverse(record.generation))
        });

        let mut retired = Vec::new();
        for record in pending {
            let label = record.history_key();
            let result = match serde_json::from_value::<NodeOutput>(record.output.clone()) {
                Ok(output) => self.executor.retire(&output).await,
                Err(e) => {
                    warn!(entity = %label, error = %e, "stored output unreadable, nothing to delete");
                    Ok(())
                }
            };
            match result {
                Ok(()) => {
                    self.store.mark_retired(&record, epoch_secs())?;
                    info!(entity = %label, "generation retired");
                    retired.push(label);
                }
                Err(e) => {
                    warn!(entity = %label, error = %e, "retirement failed, left pending");
                }
            }
        }
        Ok(retired)
    }
}

/// Bookkeeping for one walk.
struct Walk {
    pending: BTreeMap<NodeId, usize>,
    queue: VecDeque<NodeId>,
    outputs: BTreeMap<NodeId, Arc<NodeOutput>>,
    identities: BTreeMap<NodeId, String>,
    fates: BTreeMap<NodeId, NodeFate>,
    failures: Vec<FailedNode>,
}

impl Walk {
    fn new(graph: &TopologyGraph) -> Self {
        let pending: BTreeMap<NodeId, usize> = graph
            .nodes()
            .map(|node| (node, graph.deps(node).len()))
            .collect();
        let queue = graph
            .order()
            .iter()
            .copied()
            .filter(|node| pending.get(node) == Some(&0))
            .collect();
        Self {
            pending,
            queue,
            outputs: BTreeMap::new(),
            identities: BTreeMap::new(),
            fates: BTreeMap::new(),
            failures: Vec::new(),
        }
    }

    fn inputs_for(&self, graph: &TopologyGraph, node: NodeId) -> Inputs {
        let outputs = graph
            .deps(node)
            .iter()
            .filter_map(|dep| self.outputs.get(dep).map(|out| (*dep, out.clone())))
            .collect();
        Inputs::new(node, outputs)
    }

    fn deps_ready(&self, graph: &TopologyGraph, node: NodeId) -> bool {
        graph
            .deps(node)
            .iter()
            .all(|dep| self.fates.get(dep).is_some_and(NodeFate::is_ready))
    }

    /// Record `node`'s fate and release its dependents. A dependent whose
    /// last producer settled is queued if all producers are Ready and
    /// skipped otherwise.
    fn settle(&mut self, graph: &TopologyGraph, node: NodeId, fate: NodeFate) {
        let mut settled = VecDeque::from([(node, fate)]);
        while let Some((node, fate)) = settled.pop_front() {
            self.fates.insert(node, fate);
            for dependent in graph.dependents(node) {
                let Some(remaining) = self.pending.get_mut(dependent) else {
                    continue;
                };
                *remaining = remaining.saturating_sub(1);
                if *remaining > 0 {
                    continue;
                }
                if self.deps_ready(graph, *dependent) {
                    self.queue.push_back(*dependent);
                } else {
                    let blocker = graph
                        .deps(*dependent)
                        .iter()
                        .find(|dep| !self.fates.get(*dep).is_some_and(NodeFate::is_ready))
                        .map(NodeId::to_string)
                        .unwrap_or_default();
                    debug!(node = %dependent, %blocker, "skipped");
                    settled.push_back((
                        *dependent,
                        NodeFate::Skipped {
                            reason: format!("{blocker} did not become ready"),
                        },
                    ));
                }
            }
        }
    }

    /// Ready nodes with at least one dependent that is not.
    fn ready_unused(&self, graph: &TopologyGraph) -> Vec<NodeId> {
        self.fates
            .iter()
            .filter(|(node, fate)| {
                fate.is_ready()
                    && graph
                        .dependents(**node)
                        .iter()
                        .any(|d| !self.fates.get(d).is_some_and(NodeFate::is_ready))
            })
            .map(|(node, _)| *node)
            .collect()
    }
}

/// Everything one node task needs, moved into the task.
struct Step {
    node: NodeId,
    inputs: Inputs,
    producers: BTreeMap<NodeId, String>,
    previous: Option<EntityRecord>,
    forced: bool,
}

struct StepDone {
    output: NodeOutput,
    identity: String,
    fate: NodeFate,
}

async fn run_step(
    executor: &Executor,
    store: &StateStore,
    step: Step,
    shutdown: watch::Receiver<bool>,
) -> ProvisionResult<StepDone> {
    let Step {
        node,
        inputs,
        producers,
        previous,
        forced,
    } = step;
    let plan = executor.plan();
    let deps = plan.graph.deps(node);

    // Barrier: every producer must have handed over its output.
    inputs.require_all(deps)?;

    let fingerprint = fingerprint(node, &plan.desired_spec(node), &producers);
    let depends_on: Vec<String> = deps.iter().map(NodeId::key).collect();
    let now = epoch_secs();

    if let Some(record) = previous.as_ref().filter(|r| r.is_ready() && !forced) {
        match serde_json::from_value::<NodeOutput>(record.output.clone()) {
            Ok(stored) => {
                if record.fingerprint == fingerprint && executor.confirm(&stored).await? {
                    debug!(%node, generation = record.generation, "kept");
                    return Ok(StepDone {
                        output: stored,
                        identity: identity(record),
                        fate: NodeFate::Kept {
                            generation: record.generation,
                        },
                    });
                }
                if record.fingerprint != fingerprint
                    && node.is_in_place()
                    && executor.can_update_in_place(node, &stored, &inputs)
                {
                    info!(%node, generation = record.generation, "updating in place");
                    let output = executor
                        .update(node, record.generation, &stored, &inputs)
                        .await?;
                    let updated = EntityRecord {
                        resource_id: output.primary_id(),
                        fingerprint,
                        status: EntityStatus::Ready,
                        depends_on,
                        output: to_stored(&output)?,
                        updated_at: now,
                        ..record.clone()
                    };
                    store.put_entity(&updated)?;
                    return Ok(StepDone {
                        identity: identity(&updated),
                        output,
                        fate: NodeFate::Updated {
                            generation: updated.generation,
                        },
                    });
                }
            }
            Err(e) => warn!(%node, error = %e, "stored output unreadable, replacing"),
        }
    }

    // A failed attempt with unchanged inputs reuses its generation so the
    // create replays its client tokens. Anything else moves past every
    // generation already in history, remnants included.
    let parked = store.latest_history_generation(&node.key())?.unwrap_or(0);
    let generation = match &previous {
        Some(r) if !r.is_ready() && !forced && r.fingerprint == fingerprint => r.generation,
        Some(r) => r.generation.max(parked) + 1,
        None => parked + 1,
    };
    info!(%node, generation, "creating");

    match executor.create(node, generation, &inputs, shutdown).await {
        Ok(output) => {
            let record = EntityRecord {
                kind: node.kind(),
                name: node.name(),
                resource_id: output.primary_id(),
                generation,
                fingerprint,
                status: EntityStatus::Ready,
                depends_on,
                output: to_stored(&output)?,
                created_at: now,
                updated_at: epoch_secs(),
            };
            if let Some(old) = store.put_entity(&record)? {
                debug!(%node, superseded = old.generation, "previous generation awaits retirement");
            }
            Ok(StepDone {
                identity: identity(&record),
                output,
                fate: NodeFate::Created { generation },
            })
        }
        Err(failure) => {
            let terminal = failure.terminal && node.is_terminal_on_failure();
            let had_ready = previous.as_ref().is_some_and(EntityRecord::is_ready);
            let left = carry_remnants(previous.as_ref(), generation, failure.output);
            let output = match &left {
                Some(output) => to_stored(output)?,
                None => Value::Null,
            };
            let record = EntityRecord {
                kind: node.kind(),
                name: node.name(),
                resource_id: left.as_ref().and_then(NodeOutput::primary_id),
                generation,
                fingerprint,
                status: EntityStatus::Failed {
                    reason: failure.error.to_string(),
                    terminal,
                },
                depends_on,
                output,
                created_at: now,
                updated_at: epoch_secs(),
            };
            // A ready generation keeps serving; only record the failure
            // over it when the failure is final. Resources the attempt
            // left behind are parked for retirement either way.
            if terminal || !had_ready {
                store.put_entity(&record)?;
            } else if record.resource_id.is_some() {
                store.put_remnant(&record)?;
            }
            Err(failure.error)
        }
    }
}

/// A retry of a failed generation still owns what the earlier attempts
/// left behind, even when this attempt created nothing.
fn carry_remnants(
    previous: Option<&EntityRecord>,
    generation: u64,
    output: Option<NodeOutput>,
) -> Option<NodeOutput> {
    let earlier = previous
        .filter(|r| !r.is_ready() && r.generation == generation)
        .and_then(|r| serde_json::from_value::<NodeOutput>(r.output.clone()).ok())
        .map(|o| o.resource_ids())
        .unwrap_or_default();
    match output {
        Some(NodeOutput::Remnants(mut ids)) => {
            for id in earlier.into_iter().rev() {
                if !ids.contains(&id) {
                    ids.insert(0, id);
                }
            }
            Some(NodeOutput::Remnants(ids))
        }
        None if !earlier.is_empty() => Some(NodeOutput::Remnants(earlier)),
        other => other,
    }
}

/// SHA-256 over the node's name, its desired spec and the identity of
/// each producer.
fn fingerprint(node: NodeId, desired: &Value, producers: &BTreeMap<NodeId, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(node.name().as_bytes());
    hasher.update([0]);
    hasher.update(desired.to_string().as_bytes());
    for (producer, identity) in producers {
        hasher.update([0]);
        hasher.update(producer.key().as_bytes());
        hasher.update(b"=");
        hasher.update(identity.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// What dependents see of a producer: its runtime id, or its key and
/// generation when it has none.
fn identity(record: &EntityRecord) -> String {
    match &record.resource_id {
        Some(id) => id.to_string(),
        None => format!("{}#{}", record.table_key(), record.generation),
    }
}

fn to_stored(output: &NodeOutput) -> ProvisionResult<Value> {
    serde_json::to_value(output).map_err(|e| StateError::Serialize(e.to_string()).into())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn new_run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos();
    format!("run-{nanos:x}")
}
