//! Per-app sandbox context: the broker's live handle to one remote sandbox.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tonic::transport::Channel;

use sandpiper_rpc::exec::exec_service_client::ExecServiceClient;
use sandpiper_rpc::process::process_service_client::ProcessServiceClient;
use sandpiper_rpc::process::ProcessState;
use sandpiper_rpc::worktree::worktree_service_client::WorktreeServiceClient;

/// Capacity of each state-subscriber channel. Delivery is best-effort: a
/// full channel drops the update rather than stalling the tracker.
const STATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
struct StateHub {
    current: ProcessState,
    next_id: u64,
    subscribers: HashMap<u64, mpsc::Sender<ProcessState>>,
}

/// The live runtime for one app: the channel to its sandbox, the mapped
/// endpoints, the tracked process state and the expiry machinery.
///
/// Every accessor that a leaseholder can reach refreshes the idle deadline,
/// so a context in active use never expires.
#[derive(Debug)]
pub struct SandboxContext {
    sandbox_id: String,
    app_id: String,
    worktree_id: String,
    agent_index: usize,

    channel: Channel,
    app_endpoint: String,
    lsp_endpoint: String,

    expiry: Duration,
    deadline: Mutex<tokio::time::Instant>,

    hub: Mutex<StateHub>,
    tracker_stop: watch::Sender<bool>,
    tracker_task: Mutex<Option<JoinHandle<()>>>,

    refs: AtomicUsize,
    gate: Arc<RwLock<()>>,
    poisoned: AtomicBool,
}

impl SandboxContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        sandbox_id: String,
        app_id: String,
        worktree_id: String,
        agent_index: usize,
        channel: Channel,
        app_endpoint: String,
        lsp_endpoint: String,
        expiry: Duration,
    ) -> Arc<Self> {
        let (tracker_stop, _) = watch::channel(false);
        Arc::new(Self {
            sandbox_id,
            app_id,
            worktree_id,
            agent_index,
            channel,
            app_endpoint,
            lsp_endpoint,
            expiry,
            deadline: Mutex::new(tokio::time::Instant::now() + expiry),
            hub: Mutex::new(StateHub {
                current: ProcessState::NotRunning,
                next_id: 0,
                subscribers: HashMap::new(),
            }),
            tracker_stop,
            tracker_task: Mutex::new(None),
            refs: AtomicUsize::new(0),
            gate: Arc::new(RwLock::new(())),
            poisoned: AtomicBool::new(false),
        })
    }

    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Write-once: fixed for the lifetime of the context.
    pub fn worktree_id(&self) -> &str {
        &self.worktree_id
    }

    pub(crate) fn agent_index(&self) -> usize {
        self.agent_index
    }

    /// Push the idle deadline out by the full expiry duration.
    pub fn refresh(&self) {
        *self.deadline.lock() = tokio::time::Instant::now() + self.expiry;
    }

    pub(crate) fn deadline(&self) -> tokio::time::Instant {
        *self.deadline.lock()
    }

    pub fn exec_client(&self) -> ExecServiceClient<Channel> {
        self.refresh();
        ExecServiceClient::new(self.channel.clone())
    }

    pub fn process_client(&self) -> ProcessServiceClient<Channel> {
        self.refresh();
        ProcessServiceClient::new(self.channel.clone())
    }

    pub fn worktree_client(&self) -> WorktreeServiceClient<Channel> {
        self.refresh();
        WorktreeServiceClient::new(self.channel.clone())
    }

    /// Channel access for the tracker, without touching the deadline: the
    /// poll loop must not keep an idle context alive.
    pub(crate) fn raw_channel(&self) -> Channel {
        self.channel.clone()
    }

    /// External endpoint mapped to the app port.
    pub fn app_endpoint(&self) -> &str {
        self.refresh();
        &self.app_endpoint
    }

    /// External endpoint mapped to the language-server port.
    pub fn lsp_endpoint(&self) -> &str {
        self.refresh();
        &self.lsp_endpoint
    }

    /// Last state the tracker observed for the app process.
    pub fn app_state(&self) -> ProcessState {
        self.refresh();
        self.hub.lock().current
    }

    /// Register a state subscriber. The current state is delivered
    /// immediately; later updates are best-effort (dropped when the
    /// channel is full, never reordered).
    pub fn subscribe_state(&self) -> (u64, mpsc::Receiver<ProcessState>) {
        self.refresh();
        let (tx, rx) = mpsc::channel(STATE_CHANNEL_CAPACITY);
        let mut hub = self.hub.lock();
        let id = hub.next_id;
        hub.next_id += 1;
        // A freshly created channel always has room for the snapshot.
        let _ = tx.try_send(hub.current);
        hub.subscribers.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe_state(&self, id: u64) {
        self.hub.lock().subscribers.remove(&id);
    }

    /// Called by the tracker on every successful poll; fans out on change
    /// only.
    pub(crate) fn observe_state(&self, state: ProcessState) {
        let mut hub = self.hub.lock();
        if hub.current == state {
            return;
        }
        hub.current = state;
        for (id, tx) in &hub.subscribers {
            if tx.try_send(state).is_err() {
                tracing::warn!(
                    app = %self.app_id,
                    subscriber = id,
                    "App state channel full, dropping update"
                );
            }
        }
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    /// The teardown fence: leaseholders hold it shared, teardown takes it
    /// exclusively.
    pub(crate) fn gate(&self) -> Arc<RwLock<()>> {
        self.gate.clone()
    }

    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    /// True once a failed teardown has fenced this context for good.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    pub(crate) fn set_tracker_task(&self, task: JoinHandle<()>) {
        *self.tracker_task.lock() = Some(task);
    }

    pub(crate) fn tracker_stop_rx(&self) -> watch::Receiver<bool> {
        self.tracker_stop.subscribe()
    }

    /// Signal the tracker to stop and wait for it to finish its tick.
    pub(crate) async fn stop_tracker(&self) {
        let _ = self.tracker_stop.send(true);
        let task = self.tracker_task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::debug!(app = %self.app_id, error = %err, "State tracker did not exit cleanly");
            }
        }
    }
}
