//! Tunnel start/stop state machine
//!
//! Start: install relay -> start relay -> proxy on -> routes.
//! Stop: proxy off -> routes reverted -> relay stopped.
//!
//! Only one transition runs at a time. A `start` that finds a transition in
//! progress fails with `Busy`; a `stop` waits for it.
//!
//! Teardown and rollback always use the plan the last start ran with. With a
//! state file the state and that plan survive the process, so a later
//! process can stop a tunnel an earlier one started.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::XstreamConfig;
use crate::error::{XstreamError, XstreamResult};
use crate::privilege::CredentialProvider;
use crate::proxy::ProxyToggle;
use crate::routing::RoutingController;
use crate::service::{RelayLaunch, ServiceDescriptor, ServiceSupervisor};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum TunnelState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed(String),
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Stopped => write!(f, "stopped"),
            TunnelState::Starting => write!(f, "starting"),
            TunnelState::Running => write!(f, "running"),
            TunnelState::Stopping => write!(f, "stopping"),
            TunnelState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Everything a start/stop cycle needs to know
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelPlan {
    pub tun_interface: String,
    pub tun_address: IpNet,
    pub intercept_routes: Vec<IpNet>,
    pub exclude_routes: Vec<IpNet>,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub relay: ServiceDescriptor,
    /// Scripts installed next to the relay descriptor, by file name
    pub scripts: BTreeMap<String, String>,
}

impl TunnelPlan {
    pub fn from_config(config: &XstreamConfig) -> Self {
        let launch = RelayLaunch {
            tun_interface: config.tunnel.interface.clone(),
            proxy_address: config.proxy.address(),
            dns_address: config.tunnel.dns.clone(),
        };

        Self {
            tun_interface: config.tunnel.interface.clone(),
            tun_address: config.tunnel.address,
            intercept_routes: config.tunnel.intercept_routes.clone(),
            exclude_routes: config.tunnel.exclude_routes.clone(),
            proxy_host: config.proxy.host.clone(),
            proxy_port: config.proxy.port,
            relay: ServiceDescriptor::relay(
                &config.services.relay_label,
                config.services.relay_program.clone(),
                &launch,
                &config.services.descriptor_dir,
                config.platform,
            ),
            scripts: BTreeMap::new(),
        }
    }

    fn script_names(&self) -> Vec<String> {
        self.scripts.keys().cloned().collect()
    }
}

/// A stop step that did not complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub step: String,
    pub kind: String,
    pub message: String,
}

impl StepFailure {
    fn new(step: impl Into<String>, err: &XstreamError) -> Self {
        Self {
            step: step.into(),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub failures: Vec<StepFailure>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// What the state file holds
#[derive(Debug, Serialize, Deserialize)]
struct TunnelRecord {
    state: TunnelState,
    active: Option<TunnelPlan>,
}

impl TunnelRecord {
    /// A transition cut short by the process exiting counts as failed
    fn settled(mut self) -> Self {
        if matches!(self.state, TunnelState::Starting | TunnelState::Stopping) {
            self.state = TunnelState::Failed(format!("interrupted while {}", self.state));
        }
        self
    }
}

fn read_record(path: &Path) -> Option<TunnelRecord> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Failed to read tunnel state {:?}: {}", path, e);
            return None;
        }
    };
    match serde_json::from_slice::<TunnelRecord>(&bytes) {
        Ok(record) => Some(record.settled()),
        Err(e) => {
            warn!("Ignoring malformed tunnel state {:?}: {}", path, e);
            None
        }
    }
}

async fn write_record(path: &Path, record: &TunnelRecord) -> XstreamResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await?;

    let tmp = dir.join(format!(".tunnel-state.{}.tmp", uuid::Uuid::new_v4()));
    let content = serde_json::to_vec_pretty(record)?;
    if let Err(e) = tokio::fs::write(&tmp, &content).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartStep {
    InstallRelay,
    StartRelay,
    EnableProxy,
    ApplyRoutes,
}

pub struct TunnelLifecycle {
    supervisor: ServiceSupervisor,
    proxy: ProxyToggle,
    routing: RoutingController,
    credentials: Arc<dyn CredentialProvider>,
    plan: RwLock<TunnelPlan>,
    /// Plan of the last start, cleared once a stop has run
    active: Mutex<Option<TunnelPlan>>,
    state: watch::Sender<TunnelState>,
    state_file: Option<PathBuf>,
    transition: Mutex<()>,
}

impl TunnelLifecycle {
    pub fn new(
        supervisor: ServiceSupervisor,
        proxy: ProxyToggle,
        routing: RoutingController,
        credentials: Arc<dyn CredentialProvider>,
        plan: TunnelPlan,
    ) -> Self {
        let (state, _) = watch::channel(TunnelState::Stopped);
        Self {
            supervisor,
            proxy,
            routing,
            credentials,
            plan: RwLock::new(plan),
            active: Mutex::new(None),
            state,
            state_file: None,
            transition: Mutex::new(()),
        }
    }

    /// Persist state to `path`, picking up whatever an earlier process left there
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(record) = read_record(&path) {
            info!("Restored tunnel state {} from {:?}", record.state, path);
            self.state.send_replace(record.state);
            *self.active.get_mut() = record.active;
        }
        self.state_file = Some(path);
        self
    }

    pub fn state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    pub async fn plan(&self) -> TunnelPlan {
        self.plan.read().await.clone()
    }

    /// Use a different relay descriptor and scripts for future starts
    ///
    /// A tunnel that is already up is still torn down with the relay it was
    /// started with.
    pub async fn replace_service(&self, relay: ServiceDescriptor, scripts: BTreeMap<String, String>) {
        let mut plan = self.plan.write().await;
        info!("Relay service for future starts: {}", relay.label);
        plan.relay = relay;
        plan.scripts = scripts;
    }

    async fn set_state(&self, next: TunnelState) {
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            info!("Tunnel state: {} -> {}", previous, next);
        }

        if let Some(path) = &self.state_file {
            let record = TunnelRecord {
                state: next,
                active: self.active.lock().await.clone(),
            };
            if let Err(e) = write_record(path, &record).await {
                warn!("Failed to save tunnel state to {:?}: {}", path, e);
            }
        }
    }

    pub async fn start(&self) -> XstreamResult<()> {
        let _transition = self
            .transition
            .try_lock()
            .map_err(|_| XstreamError::Busy("a tunnel transition is already in progress".to_string()))?;

        match self.state() {
            TunnelState::Stopped | TunnelState::Failed(_) => {}
            TunnelState::Running => {
                return Err(XstreamError::InvalidState("tunnel is already running".to_string()))
            }
            TunnelState::Starting | TunnelState::Stopping => {
                return Err(XstreamError::Busy("a tunnel transition is already in progress".to_string()))
            }
        }

        let plan = self.plan().await;
        *self.active.lock().await = Some(plan.clone());
        self.set_state(TunnelState::Starting).await;

        let mut completed = Vec::new();
        match self.run_start(&plan, &mut completed).await {
            Ok(()) => {
                self.set_state(TunnelState::Running).await;
                Ok(())
            }
            Err(e) => {
                error!("Tunnel start failed: {}", e);
                self.roll_back(&plan, &completed).await;
                self.set_state(TunnelState::Failed(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn run_start(&self, plan: &TunnelPlan, completed: &mut Vec<StartStep>) -> XstreamResult<()> {
        let credential = self.credentials.credential().await?;
        self.supervisor.install(&plan.relay, &plan.scripts, &credential).await?;
        completed.push(StartStep::InstallRelay);

        let credential = self.credentials.credential().await?;
        self.supervisor.start(&plan.relay, &credential).await?;
        completed.push(StartStep::StartRelay);

        // proxy and route steps can fail partway through, so they are undone either way
        completed.push(StartStep::EnableProxy);
        let credential = self.credentials.credential().await?;
        self.proxy
            .set_enabled(true, &plan.proxy_host, plan.proxy_port, &credential)
            .await?
            .into_result()?;

        completed.push(StartStep::ApplyRoutes);
        let credential = self.credentials.credential().await?;
        let added = self
            .routing
            .apply(
                &plan.tun_interface,
                plan.tun_address,
                &plan.intercept_routes,
                &plan.exclude_routes,
                &credential,
            )
            .await?;
        debug!("Start added {} route(s)", added.len());

        Ok(())
    }

    async fn roll_back(&self, plan: &TunnelPlan, completed: &[StartStep]) {
        for step in completed.iter().rev() {
            let credential = match self.credentials.credential().await {
                Ok(c) => c,
                Err(e) => {
                    warn!("Rollback of {:?} skipped, no credential: {}", step, e);
                    continue;
                }
            };

            let result = match step {
                StartStep::ApplyRoutes => {
                    self.routing
                        .revert(&plan.tun_interface, &plan.intercept_routes, &credential)
                        .await
                }
                StartStep::EnableProxy => self
                    .proxy
                    .set_enabled(false, &plan.proxy_host, plan.proxy_port, &credential)
                    .await
                    .map(|_| ()),
                StartStep::StartRelay => self.supervisor.stop(&plan.relay, &credential).await,
                StartStep::InstallRelay => {
                    self.supervisor
                        .uninstall(&plan.relay, &plan.script_names(), &credential)
                        .await
                }
            };

            match result {
                Ok(()) => debug!("Rolled back {:?}", step),
                Err(e) => warn!("Rollback of {:?} failed: {}", step, e),
            }
        }
    }

    /// Tear the tunnel down; every step runs even if an earlier one fails
    pub async fn stop(&self) -> XstreamResult<StopReport> {
        let _transition = self.transition.lock().await;

        if self.state() == TunnelState::Stopped {
            debug!("Tunnel already stopped");
            return Ok(StopReport::default());
        }

        self.set_state(TunnelState::Stopping).await;
        let active = self.active.lock().await.clone();
        let plan = match active {
            Some(plan) => plan,
            None => self.plan().await,
        };
        let mut report = StopReport::default();

        match self.credentials.credential().await {
            Ok(credential) => match self
                .proxy
                .set_enabled(false, &plan.proxy_host, plan.proxy_port, &credential)
                .await
            {
                Ok(toggle) => report.failures.extend(toggle.failures.into_iter().map(|f| StepFailure {
                    step: format!("disable proxy on {}", f.interface),
                    kind: f.kind,
                    message: f.message,
                })),
                Err(e) => report.failures.push(StepFailure::new("disable proxy", &e)),
            },
            Err(e) => report.failures.push(StepFailure::new("disable proxy", &e)),
        }

        match self.credentials.credential().await {
            Ok(credential) => {
                if let Err(e) = self
                    .routing
                    .revert(&plan.tun_interface, &plan.intercept_routes, &credential)
                    .await
                {
                    report.failures.push(StepFailure::new("revert routes", &e));
                }
            }
            Err(e) => report.failures.push(StepFailure::new("revert routes", &e)),
        }

        match self.credentials.credential().await {
            Ok(credential) => {
                if let Err(e) = self.supervisor.stop(&plan.relay, &credential).await {
                    report.failures.push(StepFailure::new("stop relay", &e));
                }
            }
            Err(e) => report.failures.push(StepFailure::new("stop relay", &e)),
        }

        for failure in &report.failures {
            warn!("Stop step '{}' failed: {}", failure.step, failure.message);
        }

        *self.active.lock().await = None;
        self.set_state(TunnelState::Stopped).await;
        Ok(report)
    }
}
