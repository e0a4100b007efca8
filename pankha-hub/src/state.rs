//! Shared hub state handed to every session task and REST handler.

use std::sync::Arc;

use crate::commands::CommandRouter;
use crate::deploy::DeployService;
use crate::history::HistoryStore;
use crate::license::LicenseOracle;
use crate::profiles::ProfileStore;
use crate::registry::FleetRegistry;
use crate::retention::RetentionBuffer;

pub struct AppState {
    pub registry: Arc<FleetRegistry>,
    pub commands: Arc<CommandRouter>,
    pub profiles: Arc<ProfileStore>,
    pub deploy: Arc<DeployService>,
    pub retention: Arc<RetentionBuffer>,
    pub history: Arc<HistoryStore>,
    pub license: Arc<dyn LicenseOracle>,
    /// HTTP base reachable by agents on the LAN, e.g. `http://192.168.1.10:3143`.
    pub http_url: String,
    /// WebSocket URL embedded in deploy tokens.
    pub ws_url: String,
}
