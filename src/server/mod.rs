//! Network surfaces: the loopback HTTP control endpoints and the
//! loopback WebSocket message channel.

pub mod dispatch;
pub mod http;
pub mod ws;

use std::sync::Arc;
use std::time::Instant;

use crate::agent::{AgentCatalog, AgentSupervisor};
use crate::audit::AuditLogger;
use crate::config::BridgeConfig;
use crate::coordinator::ExecutionCoordinator;
use crate::crypto::BridgeIdentity;
use crate::pairing::PairingRegistry;
use crate::protocol::codec::MessageCodec;
use crate::session::SessionStore;
use crate::workspace::WorkspaceAdapter;

/// Shared state threaded through both listeners.
pub struct AppState {
    /// Effective configuration.
    pub config: BridgeConfig,
    /// Origins accepted on both surfaces, precomputed from the config.
    pub allowed_origins: Vec<String>,
    /// The bridge keypair.
    pub identity: Arc<BridgeIdentity>,
    /// Outstanding pairing codes.
    pub pairing: Arc<PairingRegistry>,
    /// Authenticated sessions.
    pub sessions: Arc<SessionStore>,
    /// Envelope validator.
    pub codec: MessageCodec,
    /// Agent discovery.
    pub catalog: Arc<AgentCatalog>,
    /// Subprocess supervision (shared with the coordinator).
    pub supervisor: Arc<AgentSupervisor>,
    /// Plan/execute state machine.
    pub coordinator: Arc<ExecutionCoordinator>,
    /// Workspace boundary.
    pub workspace: Arc<dyn WorkspaceAdapter>,
    /// Audit trail.
    pub audit: Arc<dyn AuditLogger>,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
}

impl AppState {
    /// Whether a declared origin is acceptable.
    #[must_use]
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == origin)
    }
}
