//! Privileged file installation
//!
//! Content is staged in a private temporary file owned by the current user,
//! then copied into place by a single privileged command. Nothing the caller
//! writes is ever interpolated into the shell command itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{XstreamError, XstreamResult};
use crate::privilege::{PrivilegeCredential, PrivilegedExecutor};
use crate::validation::{self, shell_quote, shell_quote_path};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Where the bytes for an installed file come from
#[derive(Debug, Clone)]
pub enum FileSource {
    Content(Vec<u8>),
    Local(PathBuf),
}

/// One file to place on disk with elevated privilege
#[derive(Debug, Clone)]
pub struct FilePayload {
    pub path: PathBuf,
    pub source: FileSource,
    pub mode: u32,
    /// `user:group`, left untouched when `None`
    pub owner: Option<String>,
}

impl FilePayload {
    pub fn text(path: impl Into<PathBuf>, content: impl Into<String>, mode: u32) -> Self {
        Self {
            path: path.into(),
            source: FileSource::Content(content.into().into_bytes()),
            mode,
            owner: None,
        }
    }

    pub fn copy_of(path: impl Into<PathBuf>, local: impl Into<PathBuf>, mode: u32) -> Self {
        Self {
            path: path.into(),
            source: FileSource::Local(local.into()),
            mode,
            owner: None,
        }
    }

    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

#[derive(Clone)]
pub struct PrivilegedWriter {
    executor: Arc<dyn PrivilegedExecutor>,
    staging_dir: PathBuf,
}

impl PrivilegedWriter {
    pub fn new(executor: Arc<dyn PrivilegedExecutor>, staging_dir: PathBuf) -> Self {
        Self { executor, staging_dir }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Install every payload in one elevated context, overwriting prior content
    pub async fn write_all(
        &self,
        files: &[FilePayload],
        credential: &PrivilegeCredential,
    ) -> XstreamResult<()> {
        if files.is_empty() {
            return Ok(());
        }

        for file in files {
            validation::validate_absolute_path(&file.path)?;
            if let Some(owner) = &file.owner {
                validate_owner(owner)?;
            }
        }

        fs::create_dir_all(&self.staging_dir).await?;

        let mut staged = Vec::new();
        let result = self.stage_and_copy(files, credential, &mut staged).await;

        for tmp in staged {
            if let Err(e) = fs::remove_file(&tmp).await {
                warn!("Failed to remove staged file {:?}: {}", tmp, e);
            }
        }

        result
    }

    async fn stage_and_copy(
        &self,
        files: &[FilePayload],
        credential: &PrivilegeCredential,
        staged: &mut Vec<PathBuf>,
    ) -> XstreamResult<()> {
        let mut steps = Vec::with_capacity(files.len() * 4);

        for file in files {
            let source = match &file.source {
                FileSource::Content(bytes) => {
                    let tmp = self
                        .staging_dir
                        .join(format!("xstream_{}.tmp", uuid::Uuid::new_v4()));
                    fs::write(&tmp, bytes).await?;
                    #[cfg(unix)]
                    fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
                    staged.push(tmp.clone());
                    tmp
                }
                FileSource::Local(path) => path.clone(),
            };

            let dest = shell_quote_path(&file.path);
            if let Some(parent) = file.path.parent() {
                steps.push(format!("mkdir -p {}", shell_quote_path(parent)));
            }
            steps.push(format!("cp {} {}", shell_quote_path(&source), dest));
            steps.push(format!("chmod {:o} {}", file.mode, dest));
            if let Some(owner) = &file.owner {
                steps.push(format!("chown {} {}", shell_quote(owner), dest));
            }
        }

        let command = steps.join(" && ");
        self.executor.run(&command, credential).await?;

        for file in files {
            info!("Installed {:?} (mode {:o})", file.path, file.mode);
        }
        Ok(())
    }

    /// Remove files, ignoring ones that are already gone
    pub async fn remove_all(
        &self,
        paths: &[PathBuf],
        credential: &PrivilegeCredential,
    ) -> XstreamResult<()> {
        if paths.is_empty() {
            return Ok(());
        }

        for path in paths {
            validation::validate_absolute_path(path)?;
        }

        let quoted: Vec<String> = paths.iter().map(|p| shell_quote_path(p)).collect();
        let command = format!("rm -f {}", quoted.join(" "));
        self.executor.run(&command, credential).await?;
        debug!("Removed {:?}", paths);
        Ok(())
    }
}

fn validate_owner(owner: &str) -> XstreamResult<()> {
    let valid = !owner.is_empty()
        && !owner.starts_with('-')
        && owner
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.'));
    if !valid {
        return Err(XstreamError::InvalidArgument(format!("Invalid file owner '{}'", owner)));
    }
    Ok(())
}
