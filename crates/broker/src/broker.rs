//! The broker proper: the app→context registry, lease accounting and the
//! expiry/teardown state machine.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedRwLockReadGuard};
use tonic::transport::Channel;
use tonic::Code;

use sandpiper_rpc::agent::{CloseAllReq, CloseContextReq, OpenContextReq, StorageConfig};

use crate::context::SandboxContext;
use crate::error::{BrokerError, Result};
use crate::pool::AgentPool;
use crate::tracker;

/// Well-known sandbox port the app process listens on.
pub const APP_PORT: u32 = 8080;
/// Well-known sandbox port the language server listens on.
pub const LSP_PORT: u32 = 2089;

/// Parameters for every sandbox the broker opens.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Container image to boot sandboxes from.
    pub image: String,
    pub storage_account_name: String,
    pub storage_account_key: String,
    pub storage_container: String,
    /// Where the worktree is mounted inside the sandbox.
    pub mount_point: String,
    /// Seconds between periodic worktree snapshots.
    pub autosave_interval_secs: u32,
    /// Endpoint sandboxes use to reach the internal API (log ingestion).
    pub internal_api_endpoint: String,
    /// Directories holding exec task definitions inside the sandbox.
    pub task_config_roots: Vec<String>,
    /// Idle duration after which an unleased context is torn down.
    pub context_expiry: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            image: "sandpiper/base:latest".to_string(),
            storage_account_name: String::new(),
            storage_account_key: String::new(),
            storage_container: "worktree".to_string(),
            mount_point: "/app".to_string(),
            autosave_interval_secs: 30,
            internal_api_endpoint: "http://localhost:9091".to_string(),
            task_config_roots: vec![
                "/etc/task/common".to_string(),
                "/etc/task/javascript".to_string(),
            ],
            context_expiry: Duration::from_secs(600),
        }
    }
}

struct Registry {
    pool: AgentPool,
    contexts: HashMap<String, Arc<SandboxContext>>,
}

/// Registry of live sandbox contexts, keyed by app id.
///
/// The registry mutex guards the map and the per-agent counters, and it
/// stays held across `OpenContext` on a miss: concurrent leases for the
/// same app coalesce onto one open instead of racing.
pub struct Broker {
    config: BrokerConfig,
    registry: Mutex<Registry>,
}

/// An outstanding borrow of a [`SandboxContext`].
///
/// Holds the context's fence in shared mode for its whole lifetime, which
/// is what keeps teardown out while any RPC might still be in flight.
/// Dropping the lease releases it exactly once.
#[derive(Debug)]
pub struct Lease {
    ctx: Arc<SandboxContext>,
    gate: Option<OwnedRwLockReadGuard<()>>,
}

impl Lease {
    fn new(ctx: Arc<SandboxContext>, gate: OwnedRwLockReadGuard<()>) -> Self {
        Self {
            ctx,
            gate: Some(gate),
        }
    }

    pub fn context(&self) -> &Arc<SandboxContext> {
        &self.ctx
    }
}

impl std::ops::Deref for Lease {
    type Target = SandboxContext;

    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        // The shared gate goes first: the expiry watcher takes a zero
        // refcount as proof that no reader still holds the fence.
        self.gate.take();
        self.ctx.release();
    }
}

impl Broker {
    /// Connect to every configured agent and reclaim leaked sandboxes.
    pub async fn connect(endpoints: &[String], config: BrokerConfig) -> Result<Arc<Self>> {
        let pool = AgentPool::connect(endpoints).await?;
        Ok(Arc::new(Self {
            config,
            registry: Mutex::new(Registry {
                pool,
                contexts: HashMap::new(),
            }),
        }))
    }

    /// Lease the context for `app_id`, opening a sandbox if none is live.
    ///
    /// `source_worktree_id` seeds a brand-new worktree from an existing
    /// image (forks); it is ignored on a registry hit.
    pub async fn lease(
        self: &Arc<Self>,
        app_id: &str,
        source_worktree_id: &str,
        worktree_id: &str,
    ) -> Result<Lease> {
        let mut registry = self.registry.lock().await;

        if let Some(ctx) = registry.contexts.get(app_id) {
            if ctx.worktree_id() != worktree_id {
                return Err(BrokerError::InconsistentWorktree {
                    app: app_id.to_string(),
                    have: ctx.worktree_id().to_string(),
                    requested: worktree_id.to_string(),
                });
            }
            if ctx.is_poisoned() {
                return Err(BrokerError::PoisonedContext {
                    app: app_id.to_string(),
                });
            }
            let ctx = ctx.clone();
            ctx.acquire();
            drop(registry);

            let gate = ctx.gate().read_owned().await;
            ctx.refresh();
            return Ok(Lease::new(ctx, gate));
        }

        // Miss: place and open while the registry stays locked.
        let agent = registry.pool.pick();
        registry.pool.inc(agent);
        let agent_endpoint = registry.pool.endpoint(agent).to_string();
        let mut client = registry.pool.client(agent);

        let req = OpenContextReq {
            image: self.config.image.clone(),
            storage_config: Some(StorageConfig {
                account_name: self.config.storage_account_name.clone(),
                account_key: self.config.storage_account_key.clone(),
                container: self.config.storage_container.clone(),
            }),
            worktree_id: worktree_id.to_string(),
            source_worktree_id: source_worktree_id.to_string(),
            mount_point: self.config.mount_point.clone(),
            autosave_interval: self.config.autosave_interval_secs,
            ports: vec![APP_PORT, LSP_PORT],
            env: vec![
                format!("SANDPIPER_APP_ROOT={}", self.config.mount_point),
                format!("SANDPIPER_APP_ID={app_id}"),
                format!(
                    "SANDPIPER_INTERNAL_API_ENDPOINT={}",
                    self.config.internal_api_endpoint
                ),
            ],
            task_config_roots: self.config.task_config_roots.clone(),
        };

        // The registry lock rides across this RPC; see the type docs.
        let opened_at = std::time::Instant::now();
        let resp = match client.open_context(req).await {
            Ok(resp) => resp.into_inner(),
            Err(status) => {
                registry.pool.dec(agent);
                return Err(BrokerError::OpenFailed {
                    app: app_id.to_string(),
                    agent: agent_endpoint,
                    source: status,
                });
            }
        };
        tracing::info!(
            app = %app_id,
            agent = %agent_endpoint,
            sandbox = %resp.context_id,
            elapsed_ms = opened_at.elapsed().as_millis() as u64,
            "Opened sandbox context"
        );

        // Connecting happens in the background, like the agent dial.
        let channel = match Channel::from_shared(format!("http://{}", resp.grpc_endpoint)) {
            Ok(endpoint) => endpoint.connect_lazy(),
            Err(err) => {
                registry.pool.dec(agent);
                return Err(BrokerError::InvalidEndpoint {
                    endpoint: resp.grpc_endpoint,
                    reason: err.to_string(),
                });
            }
        };

        let mut app_endpoint = String::new();
        let mut lsp_endpoint = String::new();
        for mapping in &resp.port_endpoints {
            match mapping.port {
                APP_PORT => app_endpoint = mapping.endpoint.clone(),
                LSP_PORT => lsp_endpoint = mapping.endpoint.clone(),
                other => {
                    tracing::error!(app = %app_id, port = other, "Unknown port mapping from agent")
                }
            }
        }

        let ctx = SandboxContext::new(
            resp.context_id,
            app_id.to_string(),
            worktree_id.to_string(),
            agent,
            channel,
            app_endpoint,
            lsp_endpoint,
            self.config.context_expiry,
        );
        ctx.set_tracker_task(tracker::spawn(ctx.clone()));
        tokio::spawn(Self::watch_expiry(Arc::downgrade(self), ctx.clone()));

        registry.contexts.insert(app_id.to_string(), ctx.clone());
        ctx.acquire();
        drop(registry);

        let gate = ctx.gate().read_owned().await;
        Ok(Lease::new(ctx, gate))
    }

    /// Lease the context for an app only if one is already live.
    pub async fn existing_lease(self: &Arc<Self>, app_id: &str) -> Result<Option<Lease>> {
        let registry = self.registry.lock().await;
        let Some(ctx) = registry.contexts.get(app_id) else {
            return Ok(None);
        };
        if ctx.is_poisoned() {
            return Err(BrokerError::PoisonedContext {
                app: app_id.to_string(),
            });
        }
        let ctx = ctx.clone();
        ctx.acquire();
        drop(registry);

        let gate = ctx.gate().read_owned().await;
        ctx.refresh();
        Ok(Some(Lease::new(ctx, gate)))
    }

    /// Expiry watcher: one task per context, alive until the context is
    /// torn down or fenced.
    async fn watch_expiry(broker: Weak<Broker>, ctx: Arc<SandboxContext>) {
        loop {
            let deadline = ctx.deadline();
            tokio::time::sleep_until(deadline).await;
            if ctx.deadline() > tokio::time::Instant::now() {
                // Refreshed while we slept.
                continue;
            }

            let Some(broker) = broker.upgrade() else {
                return;
            };
            let mut registry = broker.registry.lock().await;
            if ctx.ref_count() > 0 {
                // Still leased: push the deadline and keep waiting. New
                // leases only appear under the registry lock, so this
                // check cannot race an acquire.
                ctx.refresh();
                continue;
            }

            // Teardown. The registry lock stays held throughout so no new
            // lease can slip in; the exclusive gate waits out any reader
            // that is still unwinding.
            let agent = ctx.agent_index();
            let gate = ctx.gate().write_owned().await;
            ctx.stop_tracker().await;

            let mut client = registry.pool.client(agent);
            let req = CloseContextReq {
                context_id: ctx.sandbox_id().to_string(),
            };
            match client.close_context(req).await {
                Ok(_) => {}
                Err(status) if status.code() == Code::InvalidArgument => {
                    // Leftover agent-side state; the sandbox is already gone.
                    tracing::debug!(app = %ctx.app_id(), "CloseContext reported a stale context");
                }
                Err(status) => {
                    tracing::error!(
                        app = %ctx.app_id(),
                        sandbox = %ctx.sandbox_id(),
                        error = %status,
                        "CloseContext failed, fencing the context permanently"
                    );
                    ctx.poison();
                    // Leaking the exclusive guard keeps every future lease
                    // out of a sandbox whose disk state can no longer be
                    // trusted. The registry entry stays so the app cannot
                    // be reopened either.
                    std::mem::forget(gate);
                    return;
                }
            }

            registry.contexts.remove(ctx.app_id());
            registry.pool.dec(agent);
            tracing::info!(app = %ctx.app_id(), sandbox = %ctx.sandbox_id(), "Sandbox context expired");
            return;
        }
    }

    /// Issue `CloseAll` to every agent. Called once at process shutdown;
    /// the startup reclaim covers anything this misses.
    pub async fn shutdown(&self) {
        let registry = self.registry.lock().await;
        for idx in 0..registry.pool.len() {
            let endpoint = registry.pool.endpoint(idx).to_string();
            let mut client = registry.pool.client(idx);
            if let Err(status) = client.close_all(CloseAllReq {}).await {
                tracing::warn!(agent = %endpoint, error = %status, "CloseAll failed during shutdown");
            }
        }
    }

    /// Per-agent active-sandbox counters, in configuration order.
    pub async fn agent_loads(&self) -> Vec<usize> {
        self.registry.lock().await.pool.loads()
    }

    /// Number of live contexts in the registry.
    pub async fn live_contexts(&self) -> usize {
        self.registry.lock().await.contexts.len()
    }

    /// Outstanding lease count for an app, if its context is live.
    pub async fn app_ref_count(&self, app_id: &str) -> Option<usize> {
        self.registry
            .lock()
            .await
            .contexts
            .get(app_id)
            .map(|ctx| ctx.ref_count())
    }
}
