//! Health monitor: polls service appliances for TCP reachability.
//!
//! Each configured target becomes a poll event keyed by the target name.
//! A successful connect ends polling for that target; a target that stays
//! unreachable for its whole budget is cancelled and reported unreachable.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::agent::RpcAgent;
use crate::engine::{Controller, ControllerConfig};
use crate::error::{Error, Result};
use crate::handler::{EventDescriptor, EventHandler, PeriodicTable, PeriodicTask};
use crate::model::Event;
use crate::module::ServiceModule;

pub const KIND: &str = "health_monitor";
pub const PERFORM_HEALTH_CHECK: &str = "PERFORM_HEALTH_CHECK";

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_spacing_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Spacing between checks of one target.
    #[serde(default = "default_spacing_secs")]
    pub spacing_secs: u64,
    /// Checks per target before giving up. Unset polls until reachable.
    #[serde(default)]
    pub max_times: Option<u32>,
    #[serde(default)]
    pub targets: Vec<Target>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    /// `host:port`
    pub address: String,
    /// Overrides the module-wide budget.
    #[serde(default)]
    pub max_times: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Pending,
    Reachable,
    Unreachable,
}

/// Latest status per target, shared by the handler and the state agent.
#[derive(Debug, Default)]
pub struct HealthState {
    targets: Mutex<BTreeMap<String, TargetStatus>>,
}

impl HealthState {
    fn set(&self, name: &str, status: TargetStatus) {
        self.targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), status);
    }

    pub fn status(&self, name: &str) -> Option<TargetStatus> {
        self.targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }

    /// (pending, reachable, unreachable)
    pub fn tally(&self) -> (usize, usize, usize) {
        let targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        targets
            .values()
            .fold((0, 0, 0), |(p, r, u), status| match status {
                TargetStatus::Pending => (p + 1, r, u),
                TargetStatus::Reachable => (p, r + 1, u),
                TargetStatus::Unreachable => (p, r, u + 1),
            })
    }
}

// ---------------------------------------------------------------------------
// Module
// ---------------------------------------------------------------------------

pub struct HealthMonitor {
    settings: HealthSettings,
    state: Arc<HealthState>,
}

impl HealthMonitor {
    pub fn new(settings: HealthSettings) -> Self {
        Self {
            settings,
            state: Arc::new(HealthState::default()),
        }
    }

    /// Catalog factory.
    pub fn from_settings(settings: &toml::Table) -> Result<Box<dyn ServiceModule>> {
        let settings: HealthSettings = toml::Value::Table(settings.clone()).try_into()?;
        Ok(Box::new(Self::new(settings)))
    }

    pub fn state(&self) -> Arc<HealthState> {
        Arc::clone(&self.state)
    }
}

impl ServiceModule for HealthMonitor {
    fn name(&self) -> &str {
        KIND
    }

    fn module_init(&self, controller: &Controller, _config: &ControllerConfig) -> Result<()> {
        let handler = HealthCheckHandler::new(
            Duration::from_millis(self.settings.connect_timeout_ms),
            Duration::from_secs(self.settings.spacing_secs),
            Arc::clone(&self.state),
        );
        controller.register_events(vec![EventDescriptor::new(
            PERFORM_HEALTH_CHECK,
            Arc::new(handler),
        )])?;
        controller.register_rpc_agents(vec![Arc::new(HealthStateAgent {
            state: Arc::clone(&self.state),
        })])
    }

    fn init_complete(&self, controller: &Controller, _config: &ControllerConfig) -> Result<()> {
        for target in &self.settings.targets {
            let data = serde_json::to_value(target)
                .map_err(|e| Error::Other(format!("serialize target {}: {e}", target.name)))?;
            let event = controller
                .new_event(PERFORM_HEALTH_CHECK)
                .key(format!("health:{}", target.name))
                .data(data);
            self.state.set(&target.name, TargetStatus::Pending);
            controller.poll_event(event, target.max_times.or(self.settings.max_times))?;
            info!(target = %target.name, address = %target.address, "health polling scheduled");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub struct HealthCheckHandler {
    connect_timeout: Duration,
    periodic: PeriodicTable,
    state: Arc<HealthState>,
}

impl HealthCheckHandler {
    pub fn new(connect_timeout: Duration, spacing: Duration, state: Arc<HealthState>) -> Self {
        Self {
            connect_timeout,
            periodic: PeriodicTable::new().with(
                PERFORM_HEALTH_CHECK,
                PeriodicTask::new(spacing).run_immediately(true),
            ),
            state,
        }
    }

    async fn probe(&self, target: &Target) -> bool {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&target.address)).await
        {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(target = %target.name, error = %e, "connect failed");
                false
            }
            Err(_) => {
                debug!(target = %target.name, "connect timed out");
                false
            }
        }
    }
}

fn target_of(event: &Event) -> Result<Target> {
    serde_json::from_value(event.data.clone())
        .map_err(|e| Error::Handler(format!("bad health check payload: {e}")))
}

#[async_trait]
impl EventHandler for HealthCheckHandler {
    /// One-shot check outside the poll schedule.
    async fn handle_event(&self, _controller: &Controller, event: Event) -> Result<()> {
        let target = target_of(&event)?;
        let status = if self.probe(&target).await {
            TargetStatus::Reachable
        } else {
            TargetStatus::Unreachable
        };
        self.state.set(&target.name, status);
        info!(target = %target.name, ?status, "health checked");
        Ok(())
    }

    async fn handle_poll_event(&self, controller: &Controller, event: Event) -> Result<()> {
        let target = target_of(&event)?;
        if !self.probe(&target).await {
            debug!(target = %target.name, remaining = ?event.max_times, "target not reachable yet");
            return Ok(());
        }
        self.state.set(&target.name, TargetStatus::Reachable);
        info!(target = %target.name, address = %target.address, "target reachable");
        controller.poll_event_done(&event)
    }

    async fn poll_event_cancel(&self, _controller: &Controller, event: Event) -> Result<()> {
        let target = target_of(&event)?;
        self.state.set(&target.name, TargetStatus::Unreachable);
        warn!(target = %target.name, address = %target.address, "target unreachable, giving up");
        Ok(())
    }

    fn periodic_tasks(&self) -> Option<&PeriodicTable> {
        Some(&self.periodic)
    }
}

// ---------------------------------------------------------------------------
// State agent
// ---------------------------------------------------------------------------

/// Reports health tallies on every report tick. Has no listener of its own.
pub struct HealthStateAgent {
    state: Arc<HealthState>,
}

#[async_trait]
impl RpcAgent for HealthStateAgent {
    fn name(&self) -> &str {
        KIND
    }

    async fn start(&self, _controller: &Controller) -> Result<()> {
        Ok(())
    }

    async fn report_state(&self, _controller: &Controller) -> Result<()> {
        let (pending, reachable, unreachable) = self.state.tally();
        info!(pending, reachable, unreachable, "health monitor state");
        Ok(())
    }
}
