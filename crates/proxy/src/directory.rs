//! The app-metadata seam the proxy resolves hostnames through.

use async_trait::async_trait;

/// The slice of app metadata needed to route traffic into a sandbox and
/// start the app process.
#[derive(Debug, Clone)]
pub struct AppRecord {
    pub id: String,
    pub name: String,
    pub worktree_id: String,
    /// User-supplied start command, run through the log wrapper.
    pub start_cmd: String,
    /// User-supplied environment variables.
    pub env: Vec<(String, String)>,
}

/// Wrapper that pipes the app's stdout/stderr into the log pipeline.
const LOG_RUN: &str = "/scripts/log_run";

impl AppRecord {
    /// Command line the app process is launched with.
    pub fn launch_cmd(&self) -> Vec<String> {
        vec![LOG_RUN.to_string(), self.start_cmd.clone()]
    }

    /// User environment plus the variables every app gets.
    pub fn launch_env(&self) -> Vec<(String, String)> {
        let mut env = self.env.clone();
        env.push(("SANDPIPER_APP_ID".to_string(), self.id.clone()));
        env.push(("SANDPIPER_APP_NAME".to_string(), self.name.clone()));
        env
    }
}

/// Lookup seam into the app metadata store.
#[async_trait]
pub trait AppDirectory: Send + Sync {
    async fn app_by_name(&self, name: &str) -> anyhow::Result<Option<AppRecord>>;
}
