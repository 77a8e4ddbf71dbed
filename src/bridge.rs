//! Request/response surface for embedding applications
//!
//! Requests arrive as `{"method": "...", "args": {...}}`. Every request is
//! handled on its own task and answered exactly once with either
//! `{"status":"ok","data":...}` or
//! `{"status":"error","kind":"...","message":"...","retryable":bool}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::XstreamConfig;
use crate::installer::{ArtifactFetcher, CoreInstaller, CoreLayout, CoreStatus};
use crate::error::{XstreamError, XstreamResult};
use crate::files::{FilePayload, PrivilegedWriter};
use crate::lifecycle::{TunnelLifecycle, TunnelPlan};
use crate::nodes::{self, NodeStore};
use crate::privilege::{
    CredentialProvider, PrivilegeCredential, PrivilegedExecutor, SerializedExecutor,
};
use crate::proxy::ProxyToggle;
use crate::routing::RoutingController;
use crate::service::{ServiceDescriptor, ServiceSupervisor};

const CONFIG_FILE_MODE: u32 = 0o644;
const TUNNEL_STATE_FILE: &str = "tunnel.json";

#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "camelCase")]
pub enum Request {
    StartTunnel,
    StopTunnel,
    TunnelStatus,
    SetSystemProxy {
        enable: bool,
        #[serde(default)]
        password: Option<PrivilegeCredential>,
    },
    InstallTunnelService {
        descriptor: ServiceDescriptor,
        #[serde(default)]
        scripts: BTreeMap<String, String>,
        #[serde(default)]
        password: Option<PrivilegeCredential>,
    },
    WriteConfigFiles {
        files: BTreeMap<PathBuf, String>,
        #[serde(default)]
        password: Option<PrivilegeCredential>,
    },
    MergeNodeConfig {
        nodes: Value,
    },
    StartNodeService {
        label: String,
        #[serde(default)]
        password: Option<PrivilegeCredential>,
    },
    StopNodeService {
        label: String,
        #[serde(default)]
        password: Option<PrivilegeCredential>,
    },
    CheckNodeStatus {
        label: String,
        #[serde(default)]
        password: Option<PrivilegeCredential>,
    },
    InitCore {
        /// Answer only after a started download has finished
        #[serde(default)]
        wait: bool,
    },
    UpdateCore {
        #[serde(default)]
        wait: bool,
    },
    IsCoreDownloading,
    ResetCoreAndConfig {
        #[serde(default)]
        password: Option<PrivilegeCredential>,
    },
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::StartTunnel => "startTunnel",
            Request::StopTunnel => "stopTunnel",
            Request::TunnelStatus => "tunnelStatus",
            Request::SetSystemProxy { .. } => "setSystemProxy",
            Request::InstallTunnelService { .. } => "installTunnelService",
            Request::WriteConfigFiles { .. } => "writeConfigFiles",
            Request::MergeNodeConfig { .. } => "mergeNodeConfig",
            Request::StartNodeService { .. } => "startNodeService",
            Request::StopNodeService { .. } => "stopNodeService",
            Request::CheckNodeStatus { .. } => "checkNodeStatus",
            Request::InitCore { .. } => "initCore",
            Request::UpdateCore { .. } => "updateCore",
            Request::IsCoreDownloading => "isCoreDownloading",
            Request::ResetCoreAndConfig { .. } => "resetCoreAndConfig",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Ok {
        data: Value,
    },
    Error {
        kind: String,
        message: String,
        retryable: bool,
    },
}

impl Response {
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }
}

impl From<XstreamError> for Response {
    fn from(err: XstreamError) -> Self {
        Response::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl From<XstreamResult<Value>> for Response {
    fn from(result: XstreamResult<Value>) -> Self {
        match result {
            Ok(data) => Response::Ok { data },
            Err(e) => e.into(),
        }
    }
}

pub struct NativeBridge {
    config: XstreamConfig,
    lifecycle: TunnelLifecycle,
    supervisor: ServiceSupervisor,
    proxy: ProxyToggle,
    writer: PrivilegedWriter,
    store: NodeStore,
    core: CoreInstaller,
    credentials: Arc<dyn CredentialProvider>,
}

impl NativeBridge {
    /// Wire every component to one serialized privileged channel
    pub fn from_config(
        config: XstreamConfig,
        executor: Arc<dyn PrivilegedExecutor>,
        credentials: Arc<dyn CredentialProvider>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        let executor: Arc<dyn PrivilegedExecutor> = Arc::new(SerializedExecutor::new(executor));
        let platform = config.platform;

        let writer = PrivilegedWriter::new(executor.clone(), config.paths.state_dir.join("staging"));
        let supervisor = ServiceSupervisor::new(
            executor.clone(),
            writer.clone(),
            platform,
            config.paths.script_dir.clone(),
        );
        let proxy = ProxyToggle::new(executor.clone(), platform);
        let routing = RoutingController::new(executor.clone(), platform);

        let lifecycle = TunnelLifecycle::new(
            supervisor.clone(),
            proxy.clone(),
            routing,
            credentials.clone(),
            TunnelPlan::from_config(&config),
        )
        .with_state_file(config.paths.state_dir.join(TUNNEL_STATE_FILE));
        let core = CoreInstaller::new(
            CoreLayout::from_config(&config),
            fetcher,
            writer.clone(),
            executor,
            supervisor.clone(),
            credentials.clone(),
        );
        let store = NodeStore::new(config.paths.node_store.clone());

        Self {
            config,
            lifecycle,
            supervisor,
            proxy,
            writer,
            store,
            core,
            credentials,
        }
    }

    pub fn lifecycle(&self) -> &TunnelLifecycle {
        &self.lifecycle
    }

    pub fn core(&self) -> &CoreInstaller {
        &self.core
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    /// Handle `request` on its own task; the receiver yields exactly one response
    pub fn dispatch(self: &Arc<Self>, request: Request) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        let bridge = Arc::clone(self);

        tokio::spawn(async move {
            let method = request.method();
            let response = Response::from(bridge.handle(request).await);
            if let Response::Error { kind, message, .. } = &response {
                warn!("{} failed ({}): {}", method, kind, message);
            }
            if tx.send(response).is_err() {
                debug!("Caller of {} went away before the response", method);
            }
        });

        rx
    }

    /// Parse a JSON request, dispatch it and wait for the response
    pub async fn dispatch_json(self: &Arc<Self>, raw: &str) -> Response {
        let request: Request = match serde_json::from_str(raw) {
            Ok(request) => request,
            Err(e) => {
                return XstreamError::InvalidArgument(format!("malformed request: {}", e)).into()
            }
        };

        match self.dispatch(request).await {
            Ok(response) => response,
            Err(_) => XstreamError::ChannelUnavailable("request task ended without a response".to_string()).into(),
        }
    }

    async fn credential(&self, supplied: Option<PrivilegeCredential>) -> XstreamResult<PrivilegeCredential> {
        match supplied {
            Some(credential) => Ok(credential),
            None => self.credentials.credential().await,
        }
    }

    fn node_service(&self, label: &str) -> ServiceDescriptor {
        ServiceDescriptor::installed(label, &self.config.services.descriptor_dir, self.config.platform)
    }

    pub async fn handle(&self, request: Request) -> XstreamResult<Value> {
        debug!("Handling {}", request.method());

        match request {
            Request::StartTunnel => {
                self.lifecycle.start().await?;
                Ok(serde_json::to_value(self.lifecycle.state())?)
            }
            Request::StopTunnel => {
                let report = self.lifecycle.stop().await?;
                let mut data = serde_json::to_value(self.lifecycle.state())?;
                data["failures"] = serde_json::to_value(&report.failures)?;
                Ok(data)
            }
            Request::TunnelStatus => Ok(serde_json::to_value(self.lifecycle.state())?),
            Request::SetSystemProxy { enable, password } => {
                let credential = self.credential(password).await?;
                let report = self
                    .proxy
                    .set_enabled(enable, &self.config.proxy.host, self.config.proxy.port, &credential)
                    .await?;
                Ok(serde_json::to_value(report)?)
            }
            Request::InstallTunnelService {
                descriptor,
                scripts,
                password,
            } => {
                let credential = self.credential(password).await?;
                self.supervisor.install(&descriptor, &scripts, &credential).await?;
                let label = descriptor.label.clone();
                self.lifecycle.replace_service(descriptor, scripts).await;
                Ok(json!({ "installed": label }))
            }
            Request::WriteConfigFiles { files, password } => {
                let credential = self.credential(password).await?;
                let payloads: Vec<FilePayload> = files
                    .into_iter()
                    .map(|(path, content)| FilePayload::text(path, content, CONFIG_FILE_MODE))
                    .collect();
                self.writer.write_all(&payloads, &credential).await?;
                Ok(json!({ "written": payloads.len() }))
            }
            Request::MergeNodeConfig { nodes } => {
                let incoming = nodes::parse_incoming(nodes)?;
                let outcome = self.store.merge(incoming).await?;
                Ok(json!({ "count": outcome.count(), "recovered": outcome.recovered }))
            }
            Request::StartNodeService { label, password } => {
                let credential = self.credential(password).await?;
                self.supervisor.start(&self.node_service(&label), &credential).await?;
                Ok(json!({ "label": label }))
            }
            Request::StopNodeService { label, password } => {
                let credential = self.credential(password).await?;
                self.supervisor.stop(&self.node_service(&label), &credential).await?;
                Ok(json!({ "label": label }))
            }
            Request::CheckNodeStatus { label, password } => {
                let credential = self.credential(password).await?;
                let status = self.supervisor.status(&self.node_service(&label), &credential).await?;
                Ok(json!({ "label": label, "status": status }))
            }
            Request::InitCore { wait } => {
                let launch = self.core.init().await;
                self.finish_core_launch(launch.status, launch.completion, wait).await
            }
            Request::UpdateCore { wait } => {
                let launch = self.core.update();
                self.finish_core_launch(launch.status, launch.completion, wait).await
            }
            Request::IsCoreDownloading => Ok(json!({ "downloading": self.core.is_downloading() })),
            Request::ResetCoreAndConfig { password } => {
                let credential = self.credential(password).await?;
                self.core.reset(&credential).await?;
                Ok(json!({ "reset": true }))
            }
        }
    }

    async fn finish_core_launch(
        &self,
        status: CoreStatus,
        completion: Option<oneshot::Receiver<XstreamResult<()>>>,
        wait: bool,
    ) -> XstreamResult<Value> {
        match completion {
            Some(rx) if wait => {
                rx.await.map_err(|_| {
                    XstreamError::Transfer("download task ended without a result".to_string())
                })??;
                Ok(json!({ "status": CoreStatus::Installed }))
            }
            _ => Ok(json!({ "status": status })),
        }
    }
}
