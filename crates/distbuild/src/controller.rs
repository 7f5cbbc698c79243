//! The controller daemon.
//!
//! Accepts build requests from initiators, owns one request-owner task per
//! build (the sole mutator of that build's plan state), and dispatches
//! build units to registered workers. The shared artifact cache is the
//! rendezvous point: a unit is done when its artifact is present there.

use crate::claims::{ClaimOutcome, ClaimTable};
use crate::protocol::{Message, MessageReader, MessageWriter, Stream};
use crate::Result;
use morph_artifact_cache::{RemoteCacheClient, artifact_filename};
use morph_graph::{BuildPlan, CacheKey, PlannedUnit};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Where initiators connect.
    pub initiator_addr: SocketAddr,
    /// Where workers connect.
    pub worker_addr: SocketAddr,
    /// Base URL of the shared (write-enabled) artifact cache.
    pub shared_cache_url: String,
    /// Program workers run for graph calculation and unit builds.
    pub morph_command: String,
}

/// One registered worker.
pub struct WorkerHandle {
    name: String,
    tx: mpsc::UnboundedSender<Message>,
    assigned: AtomicUsize,
}

impl WorkerHandle {
    fn send(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Registry of live workers plus the exec-id router.
#[derive(Default)]
struct WorkerRegistry {
    workers: Mutex<HashMap<String, Arc<WorkerHandle>>>,
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<OwnerEvent>>>,
}

impl WorkerRegistry {
    fn register(&self, handle: Arc<WorkerHandle>) {
        self.workers
            .lock()
            .expect("registry poisoned")
            .insert(handle.name.clone(), handle);
    }

    fn unregister(&self, name: &str) {
        self.workers.lock().expect("registry poisoned").remove(name);
    }

    fn worker_count(&self) -> usize {
        self.workers.lock().expect("registry poisoned").len()
    }

    fn least_loaded(&self) -> Option<Arc<WorkerHandle>> {
        self.workers
            .lock()
            .expect("registry poisoned")
            .values()
            .min_by_key(|w| (w.assigned.load(Ordering::SeqCst), w.name.clone()))
            .cloned()
    }

    fn route_register(&self, exec_id: &str, owner: mpsc::UnboundedSender<OwnerEvent>) {
        self.routes
            .lock()
            .expect("registry poisoned")
            .insert(exec_id.to_string(), owner);
    }

    fn route_remove(&self, exec_id: &str) {
        self.routes.lock().expect("registry poisoned").remove(exec_id);
    }

    /// Deliver a worker frame to the owner of its exec id.
    fn dispatch(&self, message: Message) {
        let Some(id) = message.id() else { return };
        let owner = self
            .routes
            .lock()
            .expect("registry poisoned")
            .get(id)
            .cloned();
        if let Some(owner) = owner {
            let _ = owner.send(OwnerEvent::Worker(message));
        } else {
            debug!(id, "Frame for unknown exec id dropped");
        }
    }
}

enum OwnerEvent {
    Worker(Message),
    WorkerLost(String),
    ClaimSettled { key: CacheKey, landed: bool },
    Cancel,
}

/// The controller daemon.
pub struct Controller {
    config: ControllerConfig,
    registry: Arc<WorkerRegistry>,
    claims: Arc<ClaimTable>,
    worker_lost: broadcast::Sender<String>,
}

impl Controller {
    /// Create a controller.
    #[must_use]
    pub fn new(config: ControllerConfig) -> Self {
        let (worker_lost, _) = broadcast::channel(64);
        Self {
            config,
            registry: Arc::new(WorkerRegistry::default()),
            claims: Arc::new(ClaimTable::new()),
            worker_lost,
        }
    }

    /// Bind both listeners and serve forever. Returns the bound addresses
    /// through `bound`, which is useful when the config asked for port 0.
    pub async fn run(
        self,
        bound: Option<tokio::sync::oneshot::Sender<(SocketAddr, SocketAddr)>>,
    ) -> Result<()> {
        let initiators = TcpListener::bind(self.config.initiator_addr).await?;
        let workers = TcpListener::bind(self.config.worker_addr).await?;
        info!(
            initiators = %initiators.local_addr()?,
            workers = %workers.local_addr()?,
            "Controller listening"
        );
        if let Some(bound) = bound {
            let _ = bound.send((initiators.local_addr()?, workers.local_addr()?));
        }

        let this = Arc::new(self);
        let worker_accept = {
            let this = Arc::clone(&this);
            tokio::spawn(async move {
                loop {
                    match workers.accept().await {
                        Ok((stream, peer)) => {
                            debug!(%peer, "Worker connection");
                            let this = Arc::clone(&this);
                            tokio::spawn(async move { this.serve_worker(stream).await });
                        }
                        Err(e) => {
                            warn!(error = %e, "Worker accept failed");
                        }
                    }
                }
            })
        };

        loop {
            match initiators.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "Initiator connection");
                    let this = Arc::clone(&this);
                    tokio::spawn(async move { this.serve_initiator(stream).await });
                }
                Err(e) => {
                    warn!(error = %e, "Initiator accept failed");
                    worker_accept.abort();
                    return Err(e.into());
                }
            }
        }
    }

    /// Serve one worker connection: registration frame, then routed frames
    /// until disconnect.
    async fn serve_worker(&self, stream: TcpStream) {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = MessageReader::new(read_half);
        let mut writer = MessageWriter::new(write_half);

        let name = match reader.read().await {
            Ok(Some(Message::WorkerRegister { name, cache_url })) => {
                info!(worker = %name, cache = %cache_url, "Worker registered");
                name
            }
            other => {
                warn!(?other, "Worker connection without registration");
                return;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let handle = Arc::new(WorkerHandle {
            name: name.clone(),
            tx,
            assigned: AtomicUsize::new(0),
        });
        self.registry.register(Arc::clone(&handle));

        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if writer.send(&message).await.is_err() {
                    break;
                }
            }
        });

        loop {
            match reader.read().await {
                Ok(Some(message @ (Message::ExecOutput { .. } | Message::ExecResponse { .. }))) => {
                    self.registry.dispatch(message);
                }
                Ok(Some(other)) => {
                    warn!(worker = %name, ?other, "Protocol violation; closing worker");
                    break;
                }
                Ok(None) => {
                    info!(worker = %name, "Worker disconnected");
                    break;
                }
                Err(e) => {
                    warn!(worker = %name, error = %e, "Worker connection error");
                    break;
                }
            }
        }

        // In-flight claims release so the units get re-dispatched elsewhere.
        self.registry.unregister(&name);
        self.claims.release_worker(&name);
        let _ = self.worker_lost.send(name);
        writer_task.abort();
    }

    /// Serve one initiator connection: a build request, then cancellation
    /// frames until done.
    async fn serve_initiator(&self, stream: TcpStream) {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = MessageReader::new(read_half);
        let mut writer = MessageWriter::new(write_half);

        let (request_id, repo, ref_name, morphology) = match reader.read().await {
            Ok(Some(Message::BuildRequest {
                id,
                repo,
                ref_name,
                morphology,
            })) => (id, repo, ref_name, morphology),
            other => {
                warn!(?other, "Initiator connection without build-request");
                return;
            }
        };
        info!(request = %request_id, repo, ref_name, morphology, "Build request accepted");

        let (initiator_tx, mut initiator_rx) = mpsc::unbounded_channel::<Message>();
        let writer_task = tokio::spawn(async move {
            while let Some(message) = initiator_rx.recv().await {
                if writer.send(&message).await.is_err() {
                    break;
                }
            }
        });

        let (owner_tx, owner_rx) = mpsc::unbounded_channel::<OwnerEvent>();
        let owner = BuildRequestOwner {
            request_id: request_id.clone(),
            repo,
            ref_name,
            morphology,
            registry: Arc::clone(&self.registry),
            claims: Arc::clone(&self.claims),
            shared_cache: RemoteCacheClient::new(&self.config.shared_cache_url),
            morph_command: self.config.morph_command.clone(),
            shared_cache_url: self.config.shared_cache_url.clone(),
            initiator: initiator_tx,
            events_tx: owner_tx.clone(),
        };
        let mut worker_lost = self.worker_lost.subscribe();
        let lost_forwarder = {
            let owner_tx = owner_tx.clone();
            tokio::spawn(async move {
                while let Ok(name) = worker_lost.recv().await {
                    if owner_tx.send(OwnerEvent::WorkerLost(name)).is_err() {
                        break;
                    }
                }
            })
        };
        let owner_task = tokio::spawn(owner.run(owner_rx));

        // Read cancellation (or EOF, which also cancels) from the initiator.
        loop {
            match reader.read().await {
                Ok(Some(Message::BuildCancel { id })) if id == request_id => {
                    info!(request = %request_id, "Build cancelled by initiator");
                    let _ = owner_tx.send(OwnerEvent::Cancel);
                }
                Ok(Some(other)) => {
                    warn!(?other, "Unexpected initiator frame");
                }
                Ok(None) | Err(_) => {
                    let _ = owner_tx.send(OwnerEvent::Cancel);
                    break;
                }
            }
        }

        let _ = owner_task.await;
        lost_forwarder.abort();
        writer_task.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Pending,
    Ready,
    Dispatched,
    Waiting,
    Done,
}

struct Slot {
    planned: PlannedUnit,
    state: SlotState,
    pending_deps: usize,
    exec_id: Option<String>,
    worker: Option<Arc<WorkerHandle>>,
}

/// Owns one build request end to end.
struct BuildRequestOwner {
    request_id: String,
    repo: String,
    ref_name: String,
    morphology: String,
    registry: Arc<WorkerRegistry>,
    claims: Arc<ClaimTable>,
    shared_cache: RemoteCacheClient,
    shared_cache_url: String,
    morph_command: String,
    initiator: mpsc::UnboundedSender<Message>,
    events_tx: mpsc::UnboundedSender<OwnerEvent>,
}

impl BuildRequestOwner {
    async fn run(self, mut events: mpsc::UnboundedReceiver<OwnerEvent>) {
        match self.run_inner(&mut events).await {
            Ok(()) => {
                let _ = self.initiator.send(Message::BuildFinished {
                    id: self.request_id.clone(),
                });
            }
            Err(reason) => {
                let _ = self.initiator.send(Message::BuildFailed {
                    id: self.request_id.clone(),
                    reason,
                });
            }
        }
    }

    /// The request state machine. Returns `Err(reason)` on request failure.
    async fn run_inner(
        &self,
        events: &mut mpsc::UnboundedReceiver<OwnerEvent>,
    ) -> std::result::Result<(), String> {
        // Resolving: delegate graph calculation to a worker.
        self.progress(0, 0, "calculating build graph");
        let plan = self.calculate_graph(events).await?;
        let total = plan.units.len();
        info!(request = %self.request_id, units = total, "Build graph resolved");

        // Scheduling: drive every unit to done, failing the request on the
        // first unit failure.
        let mut slots: Vec<Slot> = plan
            .units
            .into_iter()
            .map(|planned| Slot {
                pending_deps: planned.dependencies.len(),
                planned,
                state: SlotState::Pending,
                exec_id: None,
                worker: None,
            })
            .collect();
        let index_by_key: HashMap<CacheKey, usize> = slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.planned.cache_key.clone(), i))
            .collect();
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        for (i, slot) in slots.iter().enumerate() {
            for dep in &slot.planned.dependencies {
                if let Some(&dep_index) = index_by_key.get(dep) {
                    dependents.entry(dep_index).or_default().push(i);
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<(u8, String, usize)>> = BinaryHeap::new();
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.pending_deps == 0 {
                slot.state = SlotState::Ready;
                ready.push(Reverse((
                    slot.planned.kind.priority(),
                    slot.planned.cache_key.as_hex().to_string(),
                    i,
                )));
            }
        }

        let mut done = 0usize;
        while done < total {
            // Dispatch everything ready.
            while let Some(Reverse((_, _, index))) = ready.pop() {
                if slots[index].state != SlotState::Ready {
                    continue;
                }
                self.dispatch(&mut slots[index], index).await?;
                if slots[index].state == SlotState::Done {
                    done += 1;
                    self.progress(done, total, &format!(
                        "{} cached",
                        slots[index].planned.artifact_name
                    ));
                    Self::unlock_dependents(index, &mut slots, &dependents, &mut ready);
                }
            }
            if done >= total {
                break;
            }

            let Some(event) = events.recv().await else {
                return Err("controller shutting down".to_string());
            };
            match event {
                OwnerEvent::Worker(Message::ExecOutput { stream, text, .. }) => {
                    let _ = self.initiator.send(Message::BuildOutput {
                        id: self.request_id.clone(),
                        stream,
                        text,
                    });
                }
                OwnerEvent::Worker(Message::ExecResponse { id, exit }) => {
                    let Some(index) = slots.iter().position(|s| {
                        s.exec_id.as_deref() == Some(id.as_str())
                    }) else {
                        continue;
                    };
                    self.finish_exec(&mut slots[index]);
                    if exit == 0 {
                        let slot = &slots[index];
                        let filename = artifact_filename(
                            &slot.planned.cache_key,
                            slot.planned.kind,
                            &slot.planned.artifact_name,
                        );
                        // The worker is expected to have uploaded; verify.
                        if self.shared_cache.has(&filename).await.unwrap_or(false) {
                            self.claims.release(&slot.planned.cache_key, true);
                            slots[index].state = SlotState::Done;
                            done += 1;
                            self.progress(done, total, &format!(
                                "built {}",
                                slots[index].planned.artifact_name
                            ));
                            Self::unlock_dependents(index, &mut slots, &dependents, &mut ready);
                        } else {
                            self.claims.release(&slot.planned.cache_key, false);
                            self.fail_request(&slots, &format!(
                                "worker reported success but '{filename}' is not in the shared cache"
                            ));
                            return Err(format!(
                                "unit {} did not land in the shared cache",
                                slots[index].planned.artifact_name
                            ));
                        }
                    } else {
                        self.claims.release(&slots[index].planned.cache_key, false);
                        let reason = format!(
                            "unit {} failed with exit {exit}",
                            slots[index].planned.artifact_name
                        );
                        self.fail_request(&slots, &reason);
                        return Err(reason);
                    }
                }
                OwnerEvent::Worker(_) => {}
                OwnerEvent::WorkerLost(name) => {
                    // Re-dispatch unconditionally: the claims were released
                    // by the connection task.
                    for (i, slot) in slots.iter_mut().enumerate() {
                        let assigned_here = slot
                            .worker
                            .as_ref()
                            .is_some_and(|w| w.name == name);
                        if assigned_here && slot.state == SlotState::Dispatched {
                            warn!(
                                request = %self.request_id,
                                unit = %slot.planned.artifact_name,
                                worker = %name,
                                "Worker lost; requeueing unit"
                            );
                            if let Some(exec_id) = slot.exec_id.take() {
                                self.registry.route_remove(&exec_id);
                            }
                            slot.worker = None;
                            slot.state = SlotState::Ready;
                            ready.push(Reverse((
                                slot.planned.kind.priority(),
                                slot.planned.cache_key.as_hex().to_string(),
                                i,
                            )));
                        }
                    }
                    if self.registry.worker_count() == 0 {
                        let reason = "no workers remain".to_string();
                        self.fail_request(&slots, &reason);
                        return Err(reason);
                    }
                }
                OwnerEvent::ClaimSettled { key, landed } => {
                    let Some(&index) = index_by_key.get(&key) else { continue };
                    if slots[index].state != SlotState::Waiting {
                        continue;
                    }
                    let filename = artifact_filename(
                        &key,
                        slots[index].planned.kind,
                        &slots[index].planned.artifact_name,
                    );
                    if landed && self.shared_cache.has(&filename).await.unwrap_or(false) {
                        slots[index].state = SlotState::Done;
                        done += 1;
                        self.progress(done, total, &format!(
                            "{} landed elsewhere",
                            slots[index].planned.artifact_name
                        ));
                        Self::unlock_dependents(index, &mut slots, &dependents, &mut ready);
                    } else {
                        slots[index].state = SlotState::Ready;
                        ready.push(Reverse((
                            slots[index].planned.kind.priority(),
                            slots[index].planned.cache_key.as_hex().to_string(),
                            index,
                        )));
                    }
                }
                OwnerEvent::Cancel => {
                    self.fail_request(&slots, "cancelled");
                    return Err("cancelled".to_string());
                }
            }
        }
        Ok(())
    }

    /// Dispatch one ready slot: cache hit, claim wait, or worker exec.
    async fn dispatch(
        &self,
        slot: &mut Slot,
        index: usize,
    ) -> std::result::Result<(), String> {
        let filename = artifact_filename(
            &slot.planned.cache_key,
            slot.planned.kind,
            &slot.planned.artifact_name,
        );
        if self.shared_cache.has(&filename).await.unwrap_or(false) {
            slot.state = SlotState::Done;
            return Ok(());
        }

        let worker = self
            .registry
            .least_loaded()
            .ok_or_else(|| "no workers registered".to_string())?;

        match self.claims.claim(&slot.planned.cache_key, &worker.name) {
            ClaimOutcome::InFlight(mut waiter) => {
                slot.state = SlotState::Waiting;
                let key = slot.planned.cache_key.clone();
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let landed = match waiter.changed().await {
                        Ok(()) => *waiter.borrow(),
                        Err(_) => false,
                    };
                    let _ = events.send(OwnerEvent::ClaimSettled { key, landed });
                });
                Ok(())
            }
            ClaimOutcome::Claimed => {
                let exec_id = format!("{}/{}", self.request_id, slot.planned.cache_key);
                let argv = vec![
                    self.morph_command.clone(),
                    "build-artifact".to_string(),
                    "--repo".to_string(),
                    self.repo.clone(),
                    "--ref".to_string(),
                    self.ref_name.clone(),
                    "--morph".to_string(),
                    self.morphology.clone(),
                    "--shared-cache".to_string(),
                    self.shared_cache_url.clone(),
                    slot.planned.cache_key.as_hex().to_string(),
                ];
                self.registry.route_register(&exec_id, self.events_tx.clone());
                let sent = worker.send(Message::ExecRequest {
                    id: exec_id.clone(),
                    argv,
                    stdin_contents: String::new(),
                });
                if !sent {
                    self.registry.route_remove(&exec_id);
                    self.claims.release(&slot.planned.cache_key, false);
                    return Err(format!("worker {} vanished during dispatch", worker.name));
                }
                worker.assigned.fetch_add(1, Ordering::SeqCst);
                debug!(
                    request = %self.request_id,
                    unit = %slot.planned.artifact_name,
                    worker = %worker.name,
                    index,
                    "Dispatched unit"
                );
                slot.exec_id = Some(exec_id);
                slot.worker = Some(worker);
                slot.state = SlotState::Dispatched;
                Ok(())
            }
        }
    }

    /// Delegate `morph calculate-build-graph` to a worker and parse its
    /// stdout as a build plan.
    async fn calculate_graph(
        &self,
        events: &mut mpsc::UnboundedReceiver<OwnerEvent>,
    ) -> std::result::Result<BuildPlan, String> {
        let worker = self
            .registry
            .least_loaded()
            .ok_or_else(|| "no workers registered".to_string())?;
        let exec_id = format!("{}/graph", self.request_id);
        self.registry.route_register(&exec_id, self.events_tx.clone());
        let sent = worker.send(Message::ExecRequest {
            id: exec_id.clone(),
            argv: vec![
                self.morph_command.clone(),
                "calculate-build-graph".to_string(),
                "--repo".to_string(),
                self.repo.clone(),
                "--ref".to_string(),
                self.ref_name.clone(),
                self.morphology.clone(),
            ],
            stdin_contents: String::new(),
        });
        if !sent {
            self.registry.route_remove(&exec_id);
            return Err("worker vanished during graph calculation".to_string());
        }

        let mut stdout = String::new();
        loop {
            let Some(event) = events.recv().await else {
                self.registry.route_remove(&exec_id);
                return Err("controller shutting down".to_string());
            };
            match event {
                OwnerEvent::Worker(Message::ExecOutput { stream, text, .. }) => match stream {
                    Stream::Stdout => {
                        stdout.push_str(&text);
                        stdout.push('\n');
                    }
                    Stream::Stderr => {
                        let _ = self.initiator.send(Message::BuildOutput {
                            id: self.request_id.clone(),
                            stream,
                            text,
                        });
                    }
                },
                OwnerEvent::Worker(Message::ExecResponse { exit, .. }) => {
                    self.registry.route_remove(&exec_id);
                    if exit != 0 {
                        return Err(format!("graph calculation failed with exit {exit}"));
                    }
                    return serde_json::from_str(&stdout)
                        .map_err(|e| format!("unparsable build graph: {e}"));
                }
                OwnerEvent::Worker(_) => {}
                OwnerEvent::WorkerLost(_) => {
                    if self.registry.worker_count() == 0 {
                        self.registry.route_remove(&exec_id);
                        return Err("no workers remain".to_string());
                    }
                }
                OwnerEvent::ClaimSettled { .. } => {}
                OwnerEvent::Cancel => {
                    self.registry.route_remove(&exec_id);
                    return Err("cancelled".to_string());
                }
            }
        }
    }

    /// Cancel every still-running exec of this request and release claims.
    fn fail_request(&self, slots: &[Slot], reason: &str) {
        warn!(request = %self.request_id, reason, "Request failed");
        for slot in slots {
            if slot.state == SlotState::Dispatched {
                if let (Some(exec_id), Some(worker)) = (&slot.exec_id, &slot.worker) {
                    let _ = worker.send(Message::ExecCancel {
                        id: exec_id.clone(),
                    });
                    self.registry.route_remove(exec_id);
                }
                self.claims.release(&slot.planned.cache_key, false);
            }
        }
    }

    fn finish_exec(&self, slot: &mut Slot) {
        if let Some(exec_id) = slot.exec_id.take() {
            self.registry.route_remove(&exec_id);
        }
        if let Some(worker) = slot.worker.take() {
            worker.assigned.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn unlock_dependents(
        index: usize,
        slots: &mut [Slot],
        dependents: &HashMap<usize, Vec<usize>>,
        ready: &mut BinaryHeap<Reverse<(u8, String, usize)>>,
    ) {
        let Some(children) = dependents.get(&index) else {
            return;
        };
        for &child in children {
            let slot = &mut slots[child];
            slot.pending_deps = slot.pending_deps.saturating_sub(1);
            if slot.pending_deps == 0 && slot.state == SlotState::Pending {
                slot.state = SlotState::Ready;
                ready.push(Reverse((
                    slot.planned.kind.priority(),
                    slot.planned.cache_key.as_hex().to_string(),
                    child,
                )));
            }
        }
    }

    fn progress(&self, n: usize, total: usize, message: &str) {
        let _ = self.initiator.send(Message::BuildProgress {
            id: self.request_id.clone(),
            step: "build".to_string(),
            n,
            total,
            message: message.to_string(),
        });
    }
}
