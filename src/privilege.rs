//! Privileged command execution
//!
//! Every mutation of routing, service and proxy state funnels through a
//! [`PrivilegedExecutor`]: one composed `/bin/sh` command, executed in a single
//! elevated context with a one-shot credential.
//!
//! # Credentials
//!
//! - [`PrivilegeCredential`] is wiped on drop and prints as `<redacted>`
//! - The secret travels to `sudo` on stdin, never on the command line
//! - `sudo -k` discards cached timestamps so every call re-authenticates

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{XstreamError, XstreamResult};
use crate::validation;

/// Stderr fragments sudo prints when it refuses the credential
const AUTH_FAILURE_MARKERS: &[&str] = &[
    "incorrect password",
    "Sorry, try again",
    "a password is required",
    "no password was provided",
    "is not in the sudoers file",
    "Authentication failure",
];

/// Ephemeral secret handed to the elevation relay
#[derive(Clone)]
pub struct PrivilegeCredential(Zeroizing<String>);

impl PrivilegeCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    /// Credential for callers that already run as root or under NOPASSWD rules
    pub fn empty() -> Self {
        Self::new(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw secret, for executors that hand it to an elevation relay
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for PrivilegeCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivilegeCredential(<redacted>)")
    }
}

impl<'de> Deserialize<'de> for PrivilegeCredential {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let secret = Zeroizing::new(String::deserialize(deserializer)?);
        Ok(Self(secret))
    }
}

/// Runs one composed command with elevated privilege
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PrivilegedExecutor: Send + Sync {
    /// Execute `command` and return its standard output
    ///
    /// Fails with `AuthRejected` when the credential is refused,
    /// `CommandFailed` on non-zero exit and `ChannelUnavailable` when the
    /// relay itself cannot be started.
    async fn run(&self, command: &str, credential: &PrivilegeCredential) -> XstreamResult<String>;
}

#[async_trait]
impl<T: PrivilegedExecutor + ?Sized> PrivilegedExecutor for Arc<T> {
    async fn run(&self, command: &str, credential: &PrivilegeCredential) -> XstreamResult<String> {
        (**self).run(command, credential).await
    }
}

/// Elevation through `sudo -S`
pub struct SudoExecutor {
    sudo: PathBuf,
    shell: PathBuf,
}

impl SudoExecutor {
    pub fn new() -> Self {
        Self {
            sudo: PathBuf::from("sudo"),
            shell: PathBuf::from("/bin/sh"),
        }
    }

    pub fn with_sudo(mut self, sudo: impl Into<PathBuf>) -> Self {
        self.sudo = sudo.into();
        self
    }
}

impl Default for SudoExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrivilegedExecutor for SudoExecutor {
    async fn run(&self, command: &str, credential: &PrivilegeCredential) -> XstreamResult<String> {
        debug!("Running privileged command: {}", command);

        let mut child = Command::new(&self.sudo)
            .args(["-S", "-k", "-p", ""])
            .arg(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                XstreamError::ChannelUnavailable(format!(
                    "failed to launch {}: {}",
                    self.sudo.display(),
                    e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut line = Zeroizing::new(String::with_capacity(credential.expose_secret().len() + 1));
            line.push_str(credential.expose_secret());
            line.push('\n');
            // sudo may exit before reading when it refuses outright
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                debug!("Credential relay closed early: {}", e);
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| XstreamError::ChannelUnavailable(format!("privileged command lost: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            return Ok(stdout);
        }

        if is_auth_failure(&stderr) {
            warn!("Elevation relay rejected the credential");
            return Err(XstreamError::AuthRejected(
                "sudo refused the supplied credential".to_string(),
            ));
        }

        let combined = if stdout.trim().is_empty() {
            stderr
        } else {
            format!("{}\n{}", stderr.trim_end(), stdout)
        };

        Err(XstreamError::CommandFailed {
            cmd: command.to_string(),
            code: output.status.code(),
            output: validation::sanitize_error_message(&combined),
        })
    }
}

fn is_auth_failure(stderr: &str) -> bool {
    AUTH_FAILURE_MARKERS.iter().any(|marker| stderr.contains(marker))
}

/// Records commands instead of executing them
#[derive(Default)]
pub struct DryRunExecutor {
    commands: StdMutex<Vec<String>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands seen so far, in dispatch order
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PrivilegedExecutor for DryRunExecutor {
    async fn run(&self, command: &str, _credential: &PrivilegeCredential) -> XstreamResult<String> {
        info!("[dry-run] {}", command);
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command.to_string());
        }
        Ok(String::new())
    }
}

/// Allows at most one privileged command in flight
///
/// The command runs on its own task: a caller that gives up waiting does not
/// abort a command that has already been dispatched, and the next command is
/// not released until it finishes.
pub struct SerializedExecutor {
    inner: Arc<dyn PrivilegedExecutor>,
    gate: Arc<Mutex<()>>,
}

impl SerializedExecutor {
    pub fn new(inner: Arc<dyn PrivilegedExecutor>) -> Self {
        Self {
            inner,
            gate: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl PrivilegedExecutor for SerializedExecutor {
    async fn run(&self, command: &str, credential: &PrivilegeCredential) -> XstreamResult<String> {
        let permit = self.gate.clone().lock_owned().await;
        let inner = self.inner.clone();
        let command = command.to_string();
        let credential = credential.clone();

        let task = tokio::spawn(async move {
            let result = inner.run(&command, &credential).await;
            drop(permit);
            result
        });

        task.await
            .map_err(|e| XstreamError::ChannelUnavailable(format!("privileged task failed: {}", e)))?
    }
}

/// Supplies a fresh credential for each privileged step
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self) -> XstreamResult<PrivilegeCredential>;
}

/// Credential captured once from the caller (password prompt, stdin)
pub struct StaticCredential {
    secret: PrivilegeCredential,
}

impl StaticCredential {
    pub fn new(secret: PrivilegeCredential) -> Self {
        Self { secret }
    }

    pub fn empty() -> Self {
        Self::new(PrivilegeCredential::empty())
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn credential(&self) -> XstreamResult<PrivilegeCredential> {
        Ok(self.secret.clone())
    }
}

/// Check if running as root
pub fn is_root() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}
