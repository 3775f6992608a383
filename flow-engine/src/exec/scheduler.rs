// Concurrent scheduler
// Central dispatch loop over the built graph: ready leaves run as spawned
// tasks bounded by a semaphore, aggregation nodes complete inline, results
// fan in over a channel. A failed node blocks its transitive dependents;
// unrelated branches keep running.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{mpsc, Semaphore};

use super::check::{self, CheckRequest, CheckState};
use super::events::{EventSender, ExecutionEvent, ProgressSender};
use super::record::{epoch_millis, ExecRecord, RecordStore};
use crate::cache::{compute_key, HashRegistry, TieredCache};
use crate::defs::{CachePolicy, CheckSpec, DataItem, Marker, Passthrough};
use crate::expression::{Evaluator, ScopeFrame, ScopeStack};
use crate::graph::{accepts_shape, NodeId, NodeKind, NodeStatus, TaskGraph};
use crate::runner::{ImplHandle, ImplRegistry, RunContext, TaskInput};
use crate::value::Value;

/// Outcome of one whole run
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Nodes whose implementation actually ran
    pub executed: usize,
    /// Nodes found up to date
    pub skipped: usize,
    /// Nodes restored from the artifact cache
    pub restored: usize,
    pub failed: Vec<String>,
    pub blocked: Vec<String>,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty()
    }
}

pub struct Scheduler {
    registry: Arc<ImplRegistry>,
    hashes: Arc<HashRegistry>,
    cache: Arc<TieredCache>,
    records: Option<Arc<RecordStore>>,
    max_jobs: usize,
    force: bool,
    stop_on_failure: bool,
    progress: Option<ProgressSender>,
}

impl Scheduler {
    pub fn new(registry: Arc<ImplRegistry>) -> Self {
        Self {
            registry,
            hashes: Arc::new(HashRegistry::new()),
            cache: Arc::new(TieredCache::new()),
            records: None,
            max_jobs: 4,
            force: false,
            stop_on_failure: false,
            progress: None,
        }
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs.max(1);
        self
    }

    /// Bypass up-to-date checks and cache reads; everything runs
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Stop launching new nodes after the first failure; nodes already
    /// running finish normally
    pub fn stop_on_first_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }

    pub fn with_records(mut self, root: impl Into<PathBuf>) -> Self {
        self.records = Some(Arc::new(RecordStore::new(root)));
        self
    }

    pub fn with_cache(mut self, cache: Arc<TieredCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_hashes(mut self, hashes: Arc<HashRegistry>) -> Self {
        self.hashes = hashes;
        self
    }

    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Execute the graph to completion. Node failures are scoped, never
    /// fatal to the run itself.
    pub async fn run(&self, graph: &mut TaskGraph) -> RunSummary {
        let total = graph.len();
        let mut remaining: Vec<usize> = (0..total).map(|id| graph.predecessors(id).len()).collect();
        let mut ready: VecDeque<NodeId> = VecDeque::new();
        for id in graph.sources() {
            graph.node_mut(id).status = NodeStatus::Ready;
            ready.push_back(id);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<(NodeId, LeafResult)>();
        let semaphore = Arc::new(Semaphore::new(self.max_jobs));
        let mut summary = RunSummary::default();
        let mut active = 0usize;
        let mut stopped = false;

        loop {
            while let Some(id) = ready.pop_front() {
                if graph.node(id).status != NodeStatus::Ready || stopped {
                    continue;
                }

                let node = graph.node(id);
                let implementation = match (node.kind, node.implementation.clone()) {
                    (NodeKind::Leaf, Some(implementation)) => implementation,
                    _ => {
                        self.complete_inline(graph, id, &mut remaining, &mut ready);
                        continue;
                    }
                };

                graph.node_mut(id).status = NodeStatus::Running;
                graph.node_mut(id).started_at = Some(SystemTime::now());
                active += 1;

                let job = self.make_job(graph, id, implementation);
                let tx = tx.clone();
                let registry = Arc::clone(&self.registry);
                let hashes = Arc::clone(&self.hashes);
                let cache = Arc::clone(&self.cache);
                let records = self.records.clone();
                let semaphore = Arc::clone(&semaphore);
                let force = self.force;
                let progress = self.progress.clone();

                tokio::spawn(async move {
                    let result =
                        run_leaf(job, registry, hashes, cache, records, semaphore, force, progress)
                            .await;
                    let _ = tx.send((id, result));
                });
            }

            if active == 0 {
                break;
            }
            let Some((id, result)) = rx.recv().await else {
                break;
            };
            active -= 1;
            self.apply_result(
                graph,
                id,
                result,
                &mut remaining,
                &mut ready,
                &mut summary,
                &mut stopped,
            );
        }

        // Anything not yet launched was cut off by a failure upstream or the
        // stop flag
        for id in 0..total {
            if matches!(
                graph.node(id).status,
                NodeStatus::Pending | NodeStatus::Ready
            ) {
                graph.node_mut(id).status = NodeStatus::Blocked;
                let name = graph.node(id).name.clone();
                self.progress
                    .send_event(ExecutionEvent::NodeBlocked { name: name.clone() });
                summary.blocked.push(name);
            }
        }

        self.progress.send_event(ExecutionEvent::RunFinished {
            failed: summary.failed.len(),
        });
        summary
    }

    /// Aggregation nodes and implementation-less leaves complete without
    /// consuming a concurrency slot
    fn complete_inline(
        &self,
        graph: &mut TaskGraph,
        id: NodeId,
        remaining: &mut [usize],
        ready: &mut VecDeque<NodeId>,
    ) {
        let (received, changed) = received_items(graph, id);
        let outputs = match graph.node(id).kind {
            // Aggregations forward everything their children emitted
            NodeKind::Aggregation => received,
            NodeKind::Leaf => emitted_outputs(graph.node(id), Vec::new(), received),
        };

        let node = graph.node_mut(id);
        node.outputs = outputs;
        node.changed = changed;
        node.status = NodeStatus::Done;
        node.finished_at = Some(SystemTime::now());

        self.unlock_successors(graph, id, remaining, ready);
    }

    fn make_job(&self, graph: &TaskGraph, id: NodeId, implementation: ImplHandle) -> LeafJob {
        let node = graph.node(id);
        let (received, inputs_changed) = received_items(graph, id);
        let inputs: Vec<DataItem> = received
            .into_iter()
            .filter(|item| accepts_shape(&node.consumes, &item.shape()))
            .collect();

        LeafJob {
            name: node.name.clone(),
            task_name: node.task_name.clone(),
            package: node.package.clone(),
            params: node.params.clone(),
            deferred: node.deferred_params.clone(),
            synthetic: node.synthetic.clone(),
            inputs,
            inputs_changed,
            cache_policy: node.cache.clone(),
            check: node.check.clone(),
            implementation,
            run_dir: node.run_dir.clone(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_result(
        &self,
        graph: &mut TaskGraph,
        id: NodeId,
        result: LeafResult,
        remaining: &mut [usize],
        ready: &mut VecDeque<NodeId>,
        summary: &mut RunSummary,
        stopped: &mut bool,
    ) {
        let name = graph.node(id).name.clone();

        if result.status != 0 {
            let node = graph.node_mut(id);
            node.status = NodeStatus::Failed;
            node.changed = result.changed;
            node.markers = result.markers;
            node.finished_at = Some(SystemTime::now());
            summary.failed.push(name);
            if self.stop_on_failure {
                *stopped = true;
            }
            self.block_dependents(graph, id, summary);
            return;
        }

        let (received, _) = received_items(graph, id);
        let outputs = emitted_outputs(graph.node(id), result.outputs, received);

        let node = graph.node_mut(id);
        node.outputs = outputs;
        node.changed = result.changed;
        node.skipped = result.skipped;
        node.markers = result.markers;
        node.status = NodeStatus::Done;
        node.finished_at = Some(SystemTime::now());

        if result.skipped {
            summary.skipped += 1;
        } else if result.restored {
            summary.restored += 1;
        } else {
            summary.executed += 1;
        }

        self.unlock_successors(graph, id, remaining, ready);
    }

    fn unlock_successors(
        &self,
        graph: &mut TaskGraph,
        id: NodeId,
        remaining: &mut [usize],
        ready: &mut VecDeque<NodeId>,
    ) {
        let successors: Vec<NodeId> = graph.successors(id).to_vec();
        for next in successors {
            remaining[next] = remaining[next].saturating_sub(1);
            if remaining[next] == 0 && graph.node(next).status == NodeStatus::Pending {
                graph.node_mut(next).status = NodeStatus::Ready;
                ready.push_back(next);
            }
        }
    }

    /// Breadth-first over successors: everything downstream of a failed node
    /// will never run
    fn block_dependents(&self, graph: &mut TaskGraph, from: NodeId, summary: &mut RunSummary) {
        let mut queue = VecDeque::from([from]);
        while let Some(id) = queue.pop_front() {
            let successors: Vec<NodeId> = graph.successors(id).to_vec();
            for next in successors {
                if !matches!(
                    graph.node(next).status,
                    NodeStatus::Pending | NodeStatus::Ready
                ) {
                    continue;
                }
                graph.node_mut(next).status = NodeStatus::Blocked;
                let name = graph.node(next).name.clone();
                self.progress
                    .send_event(ExecutionEvent::NodeBlocked { name: name.clone() });
                summary.blocked.push(name);
                queue.push_back(next);
            }
        }
    }
}

/// Everything a spawned leaf worker needs, detached from the graph
struct LeafJob {
    name: String,
    task_name: String,
    package: String,
    params: BTreeMap<String, Value>,
    deferred: Vec<String>,
    synthetic: BTreeMap<String, Value>,
    inputs: Vec<DataItem>,
    inputs_changed: bool,
    cache_policy: Option<CachePolicy>,
    check: Option<CheckSpec>,
    implementation: ImplHandle,
    run_dir: PathBuf,
}

struct LeafResult {
    status: i32,
    changed: bool,
    /// The node's own outputs; passthrough is applied by the dispatch loop
    outputs: Vec<DataItem>,
    markers: Vec<Marker>,
    skipped: bool,
    restored: bool,
}

#[allow(clippy::too_many_arguments)]
async fn run_leaf(
    job: LeafJob,
    registry: Arc<ImplRegistry>,
    hashes: Arc<HashRegistry>,
    cache: Arc<TieredCache>,
    records: Option<Arc<RecordStore>>,
    semaphore: Arc<Semaphore>,
    force: bool,
    progress: Option<ProgressSender>,
) -> LeafResult {
    let Ok(_permit) = semaphore.acquire().await else {
        return failure_result(&job, -1, "scheduler shut down");
    };
    let started = SystemTime::now();

    let record = records.as_ref().and_then(|store| store.load(&job.name));

    // Deferred defaults see the gathered inputs and the prior memento
    let params = match resolve_deferred(&job, record.as_ref()) {
        Ok(params) => params,
        Err(message) => return failure_result(&job, -1, &message),
    };

    if !force {
        let state = check::evaluate(
            CheckRequest {
                check: job.check.as_ref(),
                record: record.as_ref(),
                params: &params,
                inputs: &job.inputs,
                inputs_changed: job.inputs_changed,
                run_dir: &job.run_dir,
            },
            &registry,
        )
        .await;

        if state == CheckState::UpToDate {
            progress.send_event(ExecutionEvent::NodeSkipped {
                name: job.name.clone(),
            });
            let outputs = record.map(|r| r.outputs).unwrap_or_default();
            return LeafResult {
                status: 0,
                changed: false,
                outputs,
                markers: Vec::new(),
                skipped: true,
                restored: false,
            };
        }
    }

    let caching = job.cache_policy.as_ref().map(|c| c.enabled).unwrap_or(false) && !cache.is_empty();
    let cache_key = if caching {
        match cache_key_for(&job, &params, &hashes) {
            Ok(key) => Some(key),
            Err(message) => {
                tracing::warn!("'{}': {}; caching disabled for this run", job.name, message);
                None
            }
        }
    } else {
        None
    };

    if let (Some(key), false) = (&cache_key, force) {
        match cache.get(key, &job.run_dir).await {
            Ok(Some(mut outputs)) => {
                stamp_outputs(&mut outputs, &job.name);
                progress.send_event(ExecutionEvent::NodeRestored {
                    name: job.name.clone(),
                });
                if let Some(store) = &records {
                    write_record(
                        store,
                        &job,
                        &params,
                        0,
                        true,
                        &outputs,
                        None,
                        Vec::new(),
                        Vec::new(),
                        started,
                    );
                }
                return LeafResult {
                    status: 0,
                    changed: true,
                    outputs,
                    markers: Vec::new(),
                    skipped: false,
                    restored: true,
                };
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("cache read failed for '{}': {}", job.name, e),
        }
    }

    if let Err(e) = std::fs::create_dir_all(&job.run_dir) {
        return failure_result(&job, -1, &format!("cannot create run directory: {}", e));
    }

    progress.send_event(ExecutionEvent::NodeStarted {
        name: job.name.clone(),
    });

    let ctx = RunContext::new(&job.run_dir);
    let input = TaskInput {
        params: params.clone(),
        inputs: job.inputs.clone(),
        changed: job.inputs_changed,
        memento: record.as_ref().and_then(|r| r.memento.clone()),
    };
    let mut outcome = job.implementation.run(&ctx, input).await;
    outcome.markers.extend(ctx.take_markers());
    let invocations = ctx.take_invocations();

    stamp_outputs(&mut outcome.outputs, &job.name);

    for marker in &outcome.markers {
        progress.send_event(ExecutionEvent::NodeMarker {
            name: job.name.clone(),
            marker: marker.clone(),
        });
    }
    progress.send_event(ExecutionEvent::NodeFinished {
        name: job.name.clone(),
        status: outcome.status,
        changed: outcome.changed,
    });

    if outcome.status == 0 {
        if let Some(store) = &records {
            write_record(
                store,
                &job,
                &params,
                outcome.status,
                outcome.changed,
                &outcome.outputs,
                outcome.memento.clone(),
                outcome.markers.clone(),
                invocations,
                started,
            );
        }

        if let Some(key) = &cache_key {
            let compression = job
                .cache_policy
                .as_ref()
                .map(|c| c.compression)
                .unwrap_or_default();
            if let Err(e) = cache.put(key, &job.run_dir, &outcome.outputs, compression).await {
                tracing::warn!("not caching '{}': {}", job.name, e);
            }
        }
    }

    LeafResult {
        status: outcome.status,
        changed: outcome.changed,
        outputs: outcome.outputs,
        markers: outcome.markers,
        skipped: false,
        restored: false,
    }
}

fn failure_result(job: &LeafJob, status: i32, message: &str) -> LeafResult {
    LeafResult {
        status,
        changed: true,
        outputs: Vec::new(),
        markers: vec![Marker::error(format!("{}: {}", job.name, message))],
        skipped: false,
        restored: false,
    }
}

/// Re-evaluate deferred parameter defaults with `inputs` and `memento`
/// bound, in declaration order so later ones see earlier ones
fn resolve_deferred(
    job: &LeafJob,
    record: Option<&ExecRecord>,
) -> Result<BTreeMap<String, Value>, String> {
    if job.deferred.is_empty() {
        return Ok(job.params.clone());
    }

    let mut frame = ScopeFrame::for_task(&job.package, &job.task_name);
    for (name, value) in &job.synthetic {
        frame = frame.with_synthetic(name.clone(), value.clone());
    }
    frame = frame.with_synthetic("inputs", inputs_value(&job.inputs));
    frame = frame.with_synthetic(
        "memento",
        record.and_then(|r| r.memento.clone()).unwrap_or(Value::Null),
    );
    for (name, value) in &job.params {
        if !job.deferred.contains(name) {
            frame = frame.with_param(name.clone(), value.clone());
        }
    }

    let mut scope = ScopeStack::new(BTreeMap::new());
    scope.push(frame);

    let mut params = job.params.clone();
    for name in &job.deferred {
        let Some(raw) = params.get(name).cloned() else {
            continue;
        };
        let resolved = {
            let eval = Evaluator::new(&scope);
            eval.resolve_value(&raw).map_err(|e| e.to_string())?
        };
        params.insert(name.clone(), resolved.clone());
        if let Some(top) = scope.top_mut() {
            top.task_params.insert(name.clone(), resolved);
        }
    }
    Ok(params)
}

/// The `inputs` runtime value: one map per accepted item
fn inputs_value(inputs: &[DataItem]) -> Value {
    Value::List(
        inputs
            .iter()
            .map(|item| {
                let mut map = item.shape();
                if let Some(src) = &item.src {
                    map.insert("src".to_string(), Value::from(src.as_str()));
                }
                if let Some(basedir) = &item.basedir {
                    map.insert(
                        "basedir".to_string(),
                        Value::from(basedir.to_string_lossy().as_ref()),
                    );
                }
                map.insert(
                    "files".to_string(),
                    Value::List(item.files.iter().map(|f| Value::from(f.as_str())).collect()),
                );
                Value::Map(map)
            })
            .collect(),
    )
}

fn cache_key_for(
    job: &LeafJob,
    params: &BTreeMap<String, Value>,
    hashes: &HashRegistry,
) -> Result<crate::cache::CacheKey, String> {
    let extra_specs = job
        .cache_policy
        .as_ref()
        .map(|c| c.extra_hash.as_slice())
        .unwrap_or(&[]);

    let mut extra = Vec::with_capacity(extra_specs.len());
    if !extra_specs.is_empty() {
        let mut frame = ScopeFrame::for_task(&job.package, &job.task_name);
        for (name, value) in params {
            frame = frame.with_param(name.clone(), value.clone());
        }
        let mut scope = ScopeStack::new(BTreeMap::new());
        scope.push(frame);
        let eval = Evaluator::new(&scope);
        for spec in extra_specs {
            extra.push(eval.interpolate(spec).map_err(|e| e.to_string())?);
        }
    }

    compute_key(&job.task_name, &job.inputs, params, &extra, hashes).map_err(|e| e.to_string())
}

fn stamp_outputs(outputs: &mut [DataItem], node_name: &str) {
    for (seq, item) in outputs.iter_mut().enumerate() {
        item.src = Some(node_name.to_string());
        item.seq = seq as u32;
    }
}

#[allow(clippy::too_many_arguments)]
fn write_record(
    store: &RecordStore,
    job: &LeafJob,
    params: &BTreeMap<String, Value>,
    status: i32,
    changed: bool,
    outputs: &[DataItem],
    memento: Option<Value>,
    markers: Vec<Marker>,
    invocations: Vec<crate::runner::Invocation>,
    started: SystemTime,
) {
    let record = ExecRecord {
        name: job.name.clone(),
        status,
        changed,
        params: params.clone(),
        input_signature: ExecRecord::signature_of(&job.inputs),
        outputs: outputs.to_vec(),
        memento,
        markers,
        invocations,
        started_at: epoch_millis(started),
        finished_at: epoch_millis(SystemTime::now()),
    };
    if let Err(e) = store.store(&record) {
        tracing::warn!("cannot write record for '{}': {}", job.name, e);
    }
}

/// Concatenated outputs of all predecessors, in predecessor order, plus
/// whether any of them reported a change
fn received_items(graph: &TaskGraph, id: NodeId) -> (Vec<DataItem>, bool) {
    let mut items = Vec::new();
    let mut changed = false;
    for &pred in graph.predecessors(id) {
        let p = graph.node(pred);
        changed |= p.changed;
        items.extend(p.outputs.iter().cloned());
    }
    (items, changed)
}

/// What a leaf emits downstream: its own outputs plus the passthrough
/// portion of what it received
fn emitted_outputs(
    node: &crate::graph::TaskNode,
    own: Vec<DataItem>,
    received: Vec<DataItem>,
) -> Vec<DataItem> {
    let mut emitted = own;
    match node.passthrough {
        Passthrough::All => emitted.extend(received),
        Passthrough::None => {}
        Passthrough::Unused => emitted.extend(
            received
                .into_iter()
                .filter(|item| !accepts_shape(&node.consumes, &item.shape())),
        ),
    }
    emitted
}
