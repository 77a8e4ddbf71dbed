//! Proxy-core binary installation
//!
//! Downloads run on a background task. At most one runs at a time; callers
//! get an immediate status plus a `oneshot` that resolves exactly once when
//! the download finishes.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::XstreamConfig;
use crate::error::{XstreamError, XstreamResult};
use crate::files::{FilePayload, PrivilegedWriter};
use crate::platform::Platform;
use crate::privilege::{CredentialProvider, PrivilegeCredential, PrivilegedExecutor};
use crate::service::ServiceSupervisor;
use crate::validation::shell_quote_path;

/// Name of the proxy-core executable inside release archives
pub const CORE_BINARY_NAME: &str = "xray";

/// Per-node proxy-core config files share this prefix
pub const NODE_CONFIG_PREFIX: &str = "xray-vpn-node";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Fetches and unpacks a release archive
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Download `url`, unpack it under `work_dir` and return the core binary path
    async fn fetch(&self, url: &str, work_dir: &Path) -> XstreamResult<PathBuf>;
}

/// HTTP download with `reqwest`, unpacked by `unzip` as the current user
pub struct HttpFetcher {
    client: reqwest::Client,
    unzip: PathBuf,
}

impl HttpFetcher {
    pub fn new() -> XstreamResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("xstream-native/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| XstreamError::Transfer(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            unzip: PathBuf::from("unzip"),
        })
    }

    /// Stream `url` into `archive`, returning the number of bytes written
    async fn download(&self, url: &str, archive: &Path) -> XstreamResult<u64> {
        let transfer = |e: reqwest::Error| XstreamError::Transfer(format!("download of {} failed: {}", url, e));
        let write_failed =
            |e: std::io::Error| XstreamError::Transfer(format!("failed to write {}: {}", archive.display(), e));

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(transfer)?
            .error_for_status()
            .map_err(transfer)?;

        let mut file = tokio::fs::File::create(archive).await.map_err(write_failed)?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(transfer)? {
            file.write_all(&chunk).await.map_err(write_failed)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(write_failed)?;

        Ok(written)
    }

    async fn unpack(&self, archive: &Path, dest: &Path) -> XstreamResult<()> {
        let output = Command::new(&self.unzip)
            .arg("-o")
            .arg(archive)
            .arg("-d")
            .arg(dest)
            .output()
            .await
            .map_err(|e| XstreamError::Transfer(format!("failed to run {}: {}", self.unzip.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(XstreamError::Transfer(format!(
                "{} exited with {:?}: {}",
                self.unzip.display(),
                output.status.code(),
                crate::validation::sanitize_error_message(&stderr)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, work_dir: &Path) -> XstreamResult<PathBuf> {
        tokio::fs::create_dir_all(work_dir).await?;
        let archive = work_dir.join("core.zip");
        let unpacked = work_dir.join("unpacked");

        info!("Downloading {}", url);
        let size = self.download(url, &archive).await?;
        debug!("Downloaded {} bytes to {:?}", size, archive);

        self.unpack(&archive, &unpacked).await?;
        locate_binary(&unpacked).await
    }
}

/// Core binary at the archive root or one directory down
async fn locate_binary(unpacked: &Path) -> XstreamResult<PathBuf> {
    let direct = unpacked.join(CORE_BINARY_NAME);
    if tokio::fs::metadata(&direct).await.is_ok() {
        return Ok(direct);
    }

    let mut entries = tokio::fs::read_dir(unpacked).await?;
    while let Some(entry) = entries.next_entry().await? {
        let candidate = entry.path().join(CORE_BINARY_NAME);
        if tokio::fs::metadata(&candidate).await.is_ok() {
            return Ok(candidate);
        }
    }

    Err(XstreamError::Transfer(format!(
        "archive does not contain a {} binary",
        CORE_BINARY_NAME
    )))
}

/// Release archive URL for a platform and CPU architecture
pub fn artifact_url(base: &str, version: &str, platform: Platform, arch: &str) -> XstreamResult<String> {
    let file = match (platform, arch) {
        (Platform::Linux, "x86_64") => "Xray-linux-64.zip",
        (Platform::Linux, "aarch64") => "Xray-linux-arm64-v8a.zip",
        (Platform::MacOs, "aarch64") => "Xray-macos-arm64-v8a.zip",
        (Platform::MacOs, "x86_64") => "Xray-macos-64.zip",
        _ => {
            return Err(XstreamError::NotSupported(format!(
                "no proxy-core build for {} on {}",
                platform, arch
            )))
        }
    };
    Ok(format!("{}/{}/{}", base.trim_end_matches('/'), version, file))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoreStatus {
    Installed,
    DownloadStarted,
    AlreadyDownloading,
}

/// Immediate answer to `init`/`update`
#[derive(Debug)]
pub struct CoreLaunch {
    pub status: CoreStatus,
    /// Resolves when a download started by this call finishes
    pub completion: Option<oneshot::Receiver<XstreamResult<()>>>,
}

/// Where the core and its node configs live
#[derive(Debug, Clone)]
pub struct CoreLayout {
    pub platform: Platform,
    pub binary_path: PathBuf,
    pub node_config_dir: PathBuf,
    pub descriptor_dir: PathBuf,
    pub node_label_prefix: String,
    pub work_dir: PathBuf,
    pub download_base: String,
    pub version: String,
}

impl CoreLayout {
    pub fn from_config(config: &XstreamConfig) -> Self {
        Self {
            platform: config.platform,
            binary_path: config.paths.core_binary.clone(),
            node_config_dir: config.paths.node_config_dir.clone(),
            descriptor_dir: config.services.descriptor_dir.clone(),
            node_label_prefix: config.services.node_label_prefix.clone(),
            work_dir: config.paths.state_dir.join("downloads"),
            download_base: config.core.download_base.clone(),
            version: config.core.version.clone(),
        }
    }
}

/// Clears the single-flight flag however the download task ends
struct DownloadGuard(Arc<AtomicBool>);

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct CoreInstaller {
    layout: CoreLayout,
    fetcher: Arc<dyn ArtifactFetcher>,
    writer: PrivilegedWriter,
    executor: Arc<dyn PrivilegedExecutor>,
    supervisor: ServiceSupervisor,
    credentials: Arc<dyn CredentialProvider>,
    downloading: Arc<AtomicBool>,
}

impl CoreInstaller {
    pub fn new(
        layout: CoreLayout,
        fetcher: Arc<dyn ArtifactFetcher>,
        writer: PrivilegedWriter,
        executor: Arc<dyn PrivilegedExecutor>,
        supervisor: ServiceSupervisor,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            layout,
            fetcher,
            writer,
            executor,
            supervisor,
            credentials,
            downloading: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn layout(&self) -> &CoreLayout {
        &self.layout
    }

    pub fn is_downloading(&self) -> bool {
        self.downloading.load(Ordering::SeqCst)
    }

    /// Download the core unless it is already installed
    pub async fn init(&self) -> CoreLaunch {
        if tokio::fs::metadata(&self.layout.binary_path).await.is_ok() {
            debug!("Proxy core present at {:?}", self.layout.binary_path);
            return CoreLaunch {
                status: CoreStatus::Installed,
                completion: None,
            };
        }
        self.spawn_download()
    }

    /// Download the core even if a copy is installed
    pub fn update(&self) -> CoreLaunch {
        self.spawn_download()
    }

    fn spawn_download(&self) -> CoreLaunch {
        if self
            .downloading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("Proxy core download already in progress");
            return CoreLaunch {
                status: CoreStatus::AlreadyDownloading,
                completion: None,
            };
        }

        let guard = DownloadGuard(self.downloading.clone());
        let installer = self.clone();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let result = installer.download_and_install().await;
            match &result {
                Ok(()) => info!("Proxy core installed at {:?}", installer.layout.binary_path),
                Err(e) => error!("Proxy core download failed: {}", e),
            }
            // the flag is clear by the time the result is observable
            drop(guard);
            if tx.send(result).is_err() {
                debug!("Nobody waiting for the core download result");
            }
        });

        CoreLaunch {
            status: CoreStatus::DownloadStarted,
            completion: Some(rx),
        }
    }

    async fn download_and_install(&self) -> XstreamResult<()> {
        let url = artifact_url(
            &self.layout.download_base,
            &self.layout.version,
            self.layout.platform,
            std::env::consts::ARCH,
        )?;
        let work_dir = self
            .layout
            .work_dir
            .join(format!("core-{}", uuid::Uuid::new_v4()));

        let result = self.fetch_and_place(&url, &work_dir).await;

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to clean up {:?}: {}", work_dir, e);
            }
        }

        result.map_err(|e| match e {
            XstreamError::Transfer(_) => e,
            other => XstreamError::Transfer(other.to_string()),
        })
    }

    async fn fetch_and_place(&self, url: &str, work_dir: &Path) -> XstreamResult<()> {
        let fetched = self.fetcher.fetch(url, work_dir).await?;
        let credential = self.credentials.credential().await?;
        let owner = format!("root:{}", self.layout.platform.root_group());
        let payload = FilePayload::copy_of(&self.layout.binary_path, fetched, 0o755).owned_by(owner);
        self.writer.write_all(&[payload], &credential).await
    }

    /// Remove node services, the core binary and node configs in one step
    pub async fn reset(&self, credential: &PrivilegeCredential) -> XstreamResult<()> {
        if self.is_downloading() {
            return Err(XstreamError::Busy(
                "proxy core download in progress".to_string(),
            ));
        }

        crate::validation::validate_absolute_path(&self.layout.binary_path)?;
        crate::validation::validate_absolute_path(&self.layout.node_config_dir)?;

        let purge = self
            .supervisor
            .purge_command(&self.layout.descriptor_dir, &self.layout.node_label_prefix)?;
        let command = format!(
            "{} && rm -f {} && rm -rf {}/{}*",
            purge,
            shell_quote_path(&self.layout.binary_path),
            shell_quote_path(&self.layout.node_config_dir),
            NODE_CONFIG_PREFIX
        );

        info!("Resetting proxy core and node configuration");
        self.executor.run(&command, credential).await?;
        Ok(())
    }
}
