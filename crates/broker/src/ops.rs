//! One-shot operations on a leased context, shared by the HTTP surface and
//! the reverse proxy.

use crate::context::SandboxContext;
use crate::error::Result;

use sandpiper_rpc::exec::{ExecReq, KeyValuePair as ExecKv};
use sandpiper_rpc::process::{ConfigureProcessReq, KeyValuePair as ProcessKv, RestartProcessReq};
use sandpiper_rpc::worktree::SaveReq;

/// Enable a named process with the given command line and environment.
/// Idempotent on the sandbox side: configuring an already-running process
/// is a no-op.
pub async fn configure_process(
    ctx: &SandboxContext,
    name: &str,
    start_cmd: &[String],
    run_path: &str,
    listening_port: u32,
    env: &[(String, String)],
) -> Result<()> {
    let req = ConfigureProcessReq {
        process_name: name.to_string(),
        enabled: true,
        start_cmd: start_cmd.to_vec(),
        run_path: run_path.to_string(),
        listening_port,
        env_vars: env.iter().map(|(k, v)| ProcessKv::new(k, v)).collect(),
    };
    ctx.process_client().configure_process(req).await?;
    Ok(())
}

/// Restart a named process with a fresh command line and environment.
pub async fn restart_process(
    ctx: &SandboxContext,
    name: &str,
    start_cmd: &[String],
    env: &[(String, String)],
) -> Result<()> {
    let req = RestartProcessReq {
        process_name: name.to_string(),
        start_cmd: start_cmd.to_vec(),
        env_vars: env.iter().map(|(k, v)| ProcessKv::new(k, v)).collect(),
    };
    ctx.process_client().restart_process(req).await?;
    Ok(())
}

/// Run a named task inside the sandbox and return its output.
pub async fn run_task(
    ctx: &SandboxContext,
    task: &str,
    key_values: &[(String, String)],
    wait: bool,
) -> Result<Vec<u8>> {
    let req = ExecReq {
        task_name: task.to_string(),
        key_values: key_values.iter().map(|(k, v)| ExecKv::new(k, v)).collect(),
        data: Vec::new(),
        wait_for_completion: wait,
    };
    let resp = ctx.exec_client().exec(req).await?;
    Ok(resp.into_inner().data)
}

/// Snapshot the worktree to object storage right now, ahead of the
/// periodic autosave.
pub async fn save_worktree(ctx: &SandboxContext) -> Result<()> {
    ctx.worktree_client().save(SaveReq {}).await?;
    Ok(())
}
