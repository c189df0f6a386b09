//! Background poller that mirrors the sandbox's app process state into the
//! context and notifies subscribers on change.

use std::sync::Arc;
use std::time::Duration;

use sandpiper_rpc::process::process_service_client::ProcessServiceClient;
use sandpiper_rpc::process::GetProcessStateReq;

use crate::context::SandboxContext;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Name of the per-sandbox process that runs the user's app.
pub(crate) const APP_PROCESS: &str = "app";

pub(crate) fn spawn(ctx: Arc<SandboxContext>) -> tokio::task::JoinHandle<()> {
    let mut stop = ctx.tracker_stop_rx();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = stop.changed() => return,
            }

            let mut client = ProcessServiceClient::new(ctx.raw_channel());
            let req = GetProcessStateReq {
                process_name: APP_PROCESS.to_string(),
            };
            match client.get_process_state(req).await {
                Ok(resp) => ctx.observe_state(resp.into_inner().process_state()),
                // Transient poll failures skip the tick.
                Err(_) => {}
            }
        }
    })
}
