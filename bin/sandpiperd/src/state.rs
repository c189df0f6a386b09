//! Shared handles the HTTP surface works with. Constructed once in main
//! and cloned into the routers.

use std::sync::Arc;

use sandpiper_broker::Broker;
use sandpiper_logmgr::LogFanout;

use crate::config::Config;
use crate::store::AppStore;

#[derive(Clone)]
pub struct ServerState {
    pub broker: Arc<Broker>,
    pub logs: Arc<LogFanout>,
    pub store: Arc<dyn AppStore>,
    pub config: Arc<Config>,
}
