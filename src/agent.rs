//! RPC agents: collaborator-owned listeners registered with the controller.
//!
//! The transport belongs to the collaborator. The controller only starts the
//! listener and, on every report tick, asks agents that opted in to report
//! their state upstream.

use async_trait::async_trait;

use crate::engine::Controller;
use crate::error::{Error, Result};

#[async_trait]
pub trait RpcAgent: Send + Sync {
    fn name(&self) -> &str;

    /// Run the listener. Spawned once on `Controller::start`; may return at
    /// once if the listener lives elsewhere.
    async fn start(&self, controller: &Controller) -> Result<()>;

    /// Report liveness upstream. Agents that did not opt in keep the default.
    async fn report_state(&self, _controller: &Controller) -> Result<()> {
        Err(Error::HookAbsent("report_state"))
    }
}
