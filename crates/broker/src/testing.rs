//! In-process mock agent for tests and local development.
//!
//! Serves the agent control surface and all three per-sandbox services on
//! one ephemeral port; `OpenContext` answers with the mock's own address
//! as the sandbox endpoint, so a broker pointed at it exercises the full
//! open → track → close cycle without any real containers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Code, Request, Response, Status};

use sandpiper_rpc::agent::agent_service_server::{AgentService, AgentServiceServer};
use sandpiper_rpc::agent::{
    CloseAllReq, CloseAllResp, CloseContextReq, CloseContextResp, OpenContextReq, OpenContextResp,
    PortEndpoint,
};
use sandpiper_rpc::exec::exec_service_server::{ExecService, ExecServiceServer};
use sandpiper_rpc::exec::{ExecReq, ExecResp};
use sandpiper_rpc::process::process_service_server::{ProcessService, ProcessServiceServer};
use sandpiper_rpc::process::{
    ConfigureProcessReq, ConfigureProcessResp, GetProcessStateReq, GetProcessStateResp,
    ProcessState, RestartProcessReq, RestartProcessResp,
};
use sandpiper_rpc::worktree::worktree_service_server::{WorktreeService, WorktreeServiceServer};
use sandpiper_rpc::worktree::{SaveReq, SaveResp};

use crate::broker::{APP_PORT, LSP_PORT};

struct Inner {
    endpoint: String,
    open_reqs: Mutex<Vec<OpenContextReq>>,
    next_context: AtomicUsize,
    closes: AtomicUsize,
    close_attempts: AtomicUsize,
    close_all_calls: AtomicUsize,
    app_state: Mutex<ProcessState>,
    app_endpoint: Mutex<String>,
    lsp_endpoint: Mutex<String>,
    close_error: Mutex<Option<(Code, String)>>,
    run_delay: Mutex<Option<Duration>>,
    configures: Mutex<Vec<ConfigureProcessReq>>,
    restarts: Mutex<Vec<RestartProcessReq>>,
    execs: Mutex<Vec<ExecReq>>,
    saves: AtomicUsize,
}

/// Handle to a running mock agent.
#[derive(Clone)]
pub struct MockAgent {
    inner: Arc<Inner>,
}

impl MockAgent {
    /// Bind an ephemeral port and serve all four services on it.
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock agent");
        let addr = listener.local_addr().expect("mock agent address");
        let endpoint = addr.to_string();

        let agent = Self {
            inner: Arc::new(Inner {
                endpoint: endpoint.clone(),
                open_reqs: Mutex::new(Vec::new()),
                next_context: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                close_attempts: AtomicUsize::new(0),
                close_all_calls: AtomicUsize::new(0),
                app_state: Mutex::new(ProcessState::NotRunning),
                app_endpoint: Mutex::new(endpoint.clone()),
                lsp_endpoint: Mutex::new(endpoint),
                close_error: Mutex::new(None),
                run_delay: Mutex::new(None),
                configures: Mutex::new(Vec::new()),
                restarts: Mutex::new(Vec::new()),
                execs: Mutex::new(Vec::new()),
                saves: AtomicUsize::new(0),
            }),
        };

        let svc = agent.clone();
        tokio::spawn(async move {
            Server::builder()
                .add_service(AgentServiceServer::new(svc.clone()))
                .add_service(ProcessServiceServer::new(svc.clone()))
                .add_service(ExecServiceServer::new(svc.clone()))
                .add_service(WorktreeServiceServer::new(svc))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .ok();
        });

        agent
    }

    pub fn endpoint(&self) -> String {
        self.inner.endpoint.clone()
    }

    pub fn open_count(&self) -> usize {
        self.inner.open_reqs.lock().len()
    }

    pub fn last_open(&self) -> Option<OpenContextReq> {
        self.inner.open_reqs.lock().last().cloned()
    }

    /// Successful `CloseContext` calls (ones the configured failure did not
    /// reject).
    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// All `CloseContext` calls, including rejected ones.
    pub fn close_attempts(&self) -> usize {
        self.inner.close_attempts.load(Ordering::SeqCst)
    }

    pub fn close_all_count(&self) -> usize {
        self.inner.close_all_calls.load(Ordering::SeqCst)
    }

    pub fn set_app_state(&self, state: ProcessState) {
        *self.inner.app_state.lock() = state;
    }

    /// Endpoint `OpenContext` reports for the app port. Defaults to the
    /// mock's own address; tests point it at a real backend.
    pub fn set_app_endpoint(&self, endpoint: impl Into<String>) {
        *self.inner.app_endpoint.lock() = endpoint.into();
    }

    /// Make `ConfigureProcess` flip the app state to `Starting` right away
    /// and to `Running` after `delay`.
    pub fn set_run_delay(&self, delay: Duration) {
        *self.inner.run_delay.lock() = Some(delay);
    }

    /// Make every `CloseContext` fail with the given status.
    pub fn fail_close(&self, code: Code, message: &str) {
        *self.inner.close_error.lock() = Some((code, message.to_string()));
    }

    pub fn configure_count(&self) -> usize {
        self.inner.configures.lock().len()
    }

    pub fn restart_count(&self) -> usize {
        self.inner.restarts.lock().len()
    }

    pub fn exec_tasks(&self) -> Vec<String> {
        self.inner
            .execs
            .lock()
            .iter()
            .map(|req| req.task_name.clone())
            .collect()
    }

    pub fn save_count(&self) -> usize {
        self.inner.saves.load(Ordering::SeqCst)
    }
}

#[tonic::async_trait]
impl AgentService for MockAgent {
    async fn open_context(
        &self,
        request: Request<OpenContextReq>,
    ) -> Result<Response<OpenContextResp>, Status> {
        let req = request.into_inner();
        let seq = self.inner.next_context.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.open_reqs.lock().push(req);

        Ok(Response::new(OpenContextResp {
            context_id: format!("sandbox-{seq}"),
            grpc_endpoint: self.inner.endpoint.clone(),
            port_endpoints: vec![
                PortEndpoint {
                    port: APP_PORT,
                    endpoint: self.inner.app_endpoint.lock().clone(),
                },
                PortEndpoint {
                    port: LSP_PORT,
                    endpoint: self.inner.lsp_endpoint.lock().clone(),
                },
            ],
        }))
    }

    async fn close_context(
        &self,
        _request: Request<CloseContextReq>,
    ) -> Result<Response<CloseContextResp>, Status> {
        self.inner.close_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some((code, message)) = self.inner.close_error.lock().clone() {
            return Err(Status::new(code, message));
        }
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(CloseContextResp {}))
    }

    async fn close_all(
        &self,
        _request: Request<CloseAllReq>,
    ) -> Result<Response<CloseAllResp>, Status> {
        self.inner.close_all_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(CloseAllResp {}))
    }
}

#[tonic::async_trait]
impl ProcessService for MockAgent {
    async fn configure_process(
        &self,
        request: Request<ConfigureProcessReq>,
    ) -> Result<Response<ConfigureProcessResp>, Status> {
        let req = request.into_inner();
        self.inner.configures.lock().push(req);

        let delay = *self.inner.run_delay.lock();
        if let Some(delay) = delay {
            *self.inner.app_state.lock() = ProcessState::Starting;
            let inner = self.inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                *inner.app_state.lock() = ProcessState::Running;
            });
        }

        Ok(Response::new(ConfigureProcessResp {}))
    }

    async fn restart_process(
        &self,
        request: Request<RestartProcessReq>,
    ) -> Result<Response<RestartProcessResp>, Status> {
        self.inner.restarts.lock().push(request.into_inner());
        Ok(Response::new(RestartProcessResp {}))
    }

    async fn get_process_state(
        &self,
        _request: Request<GetProcessStateReq>,
    ) -> Result<Response<GetProcessStateResp>, Status> {
        let state = *self.inner.app_state.lock();
        Ok(Response::new(GetProcessStateResp {
            process_state: state as i32,
        }))
    }
}

#[tonic::async_trait]
impl ExecService for MockAgent {
    async fn exec(&self, request: Request<ExecReq>) -> Result<Response<ExecResp>, Status> {
        self.inner.execs.lock().push(request.into_inner());
        Ok(Response::new(ExecResp { data: Vec::new() }))
    }
}

#[tonic::async_trait]
impl WorktreeService for MockAgent {
    async fn save(&self, _request: Request<SaveReq>) -> Result<Response<SaveResp>, Status> {
        self.inner.saves.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(SaveResp {}))
    }
}
