//! Agent pool: one persistent channel per compute agent plus the load
//! counters used for placement.

use sandpiper_rpc::agent::agent_service_client::AgentServiceClient;
use sandpiper_rpc::agent::CloseAllReq;
use tonic::transport::Channel;

use crate::error::{BrokerError, Result};

/// Above this many live sandboxes per agent, placement still happens but
/// gets logged loudly.
const CROWDED_THRESHOLD: usize = 10;

struct Agent {
    endpoint: String,
    client: AgentServiceClient<Channel>,
}

/// Fixed, ordered set of agents with per-agent active-sandbox counters.
///
/// Counters are only mutated by the broker under its registry lock.
pub(crate) struct AgentPool {
    agents: Vec<Agent>,
    active: Vec<usize>,
}

impl AgentPool {
    /// Open a lazy channel to every endpoint and issue `CloseAll` to each,
    /// reclaiming sandboxes a previous run may have leaked. Fails if any
    /// agent cannot be reached.
    pub(crate) async fn connect(endpoints: &[String]) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(BrokerError::NoAgents);
        }

        let mut agents = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let channel = Channel::from_shared(format!("http://{endpoint}"))
                .map_err(|err| BrokerError::InvalidEndpoint {
                    endpoint: endpoint.clone(),
                    reason: err.to_string(),
                })?
                .connect_lazy();
            let mut client = AgentServiceClient::new(channel);
            client
                .close_all(CloseAllReq {})
                .await
                .map_err(|status| BrokerError::AgentUnreachable {
                    endpoint: endpoint.clone(),
                    source: status,
                })?;
            tracing::info!(agent = %endpoint, "Connected to agent, reclaimed leftover sandboxes");
            agents.push(Agent {
                endpoint: endpoint.clone(),
                client,
            });
        }

        let active = vec![0; agents.len()];
        Ok(Self { agents, active })
    }

    /// Least-loaded placement; ties break toward configuration order.
    pub(crate) fn pick(&self) -> usize {
        let mut best = 0;
        for (idx, load) in self.active.iter().enumerate() {
            if *load < self.active[best] {
                best = idx;
            }
        }
        if self.active[best] > CROWDED_THRESHOLD {
            tracing::warn!(
                agent = %self.agents[best].endpoint,
                active = self.active[best],
                "All agents crowded, placing on the least loaded anyway"
            );
        }
        best
    }

    pub(crate) fn inc(&mut self, idx: usize) {
        self.active[idx] += 1;
    }

    pub(crate) fn dec(&mut self, idx: usize) {
        self.active[idx] = self.active[idx].saturating_sub(1);
    }

    pub(crate) fn client(&self, idx: usize) -> AgentServiceClient<Channel> {
        self.agents[idx].client.clone()
    }

    pub(crate) fn endpoint(&self, idx: usize) -> &str {
        &self.agents[idx].endpoint
    }

    pub(crate) fn loads(&self) -> Vec<usize> {
        self.active.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.agents.len()
    }
}
