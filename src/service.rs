//! OS service registry integration
//!
//! Descriptors are rendered as launchd property lists on macOS and systemd
//! units on Linux. Scripts backing a service live in a shared script
//! directory; both are written through the [`PrivilegedWriter`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{XstreamError, XstreamResult};
use crate::files::{FilePayload, PrivilegedWriter};
use crate::platform::Platform;
use crate::privilege::{PrivilegeCredential, PrivilegedExecutor};
use crate::validation::{self, shell_quote, shell_quote_path};

/// Placeholder substituted with the script directory in descriptor templates
pub const INSTALL_DIR_PLACEHOLDER: &str = "{{INSTALL_DIR}}";

const DESCRIPTOR_MODE: u32 = 0o644;
const SCRIPT_MODE: u32 = 0o755;

/// Output meaning the service is already unloaded / stopped
const STOP_TOLERATED: &[&str] = &[
    "Could not find specified service",
    "not loaded",
    "No such process",
    "No such file or directory",
    "does not exist",
];

/// Output meaning the service is already loaded
const START_TOLERATED: &[&str] = &["already loaded", "service already bootstrapped"];

/// Arguments for the TUN-to-proxy relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayLaunch {
    pub tun_interface: String,
    pub proxy_address: String,
    pub dns_address: String,
}

/// A unit registered with the OS service manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub label: String,
    pub program_path: PathBuf,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub run_at_load: bool,
    pub install_path: PathBuf,
    /// Raw descriptor text used verbatim instead of the generated one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl ServiceDescriptor {
    /// Descriptor for the relay started as `program <tun> <proxy> <dns>`
    pub fn relay(
        label: &str,
        program: impl Into<PathBuf>,
        launch: &RelayLaunch,
        descriptor_dir: &Path,
        platform: Platform,
    ) -> Self {
        Self {
            label: label.to_string(),
            program_path: program.into(),
            arguments: vec![
                launch.tun_interface.clone(),
                launch.proxy_address.clone(),
                launch.dns_address.clone(),
            ],
            run_at_load: true,
            install_path: descriptor_path(descriptor_dir, label, platform),
            template: None,
        }
    }

    /// Descriptor for the proxy core started with its config path
    pub fn proxy_core(
        label: &str,
        core_binary: impl Into<PathBuf>,
        config_path: &Path,
        descriptor_dir: &Path,
        platform: Platform,
    ) -> Self {
        Self {
            label: label.to_string(),
            program_path: core_binary.into(),
            arguments: vec![
                "run".to_string(),
                "-c".to_string(),
                config_path.to_string_lossy().to_string(),
            ],
            run_at_load: false,
            install_path: descriptor_path(descriptor_dir, label, platform),
            template: None,
        }
    }

    /// Handle on a descriptor installed earlier, known only by label
    pub fn installed(label: &str, descriptor_dir: &Path, platform: Platform) -> Self {
        Self {
            label: label.to_string(),
            program_path: PathBuf::new(),
            arguments: Vec::new(),
            run_at_load: false,
            install_path: descriptor_path(descriptor_dir, label, platform),
            template: None,
        }
    }

    pub fn validate(&self) -> XstreamResult<()> {
        validation::validate_service_label(&self.label)?;
        validation::validate_absolute_path(&self.install_path)?;
        if self.template.is_none() {
            validation::validate_absolute_path(&self.program_path)?;
        }
        for arg in &self.arguments {
            validation::sanitize_config_value(arg)?;
        }
        Ok(())
    }

    /// systemd unit name; launchd uses the label as is
    pub fn unit_name(&self) -> String {
        if self.label.ends_with(".service") {
            self.label.clone()
        } else {
            format!("{}.service", self.label)
        }
    }

    /// Descriptor file content for `platform`
    pub fn render(&self, platform: Platform, install_dir: &Path) -> String {
        if let Some(template) = &self.template {
            return render_template(template, install_dir);
        }
        match platform {
            Platform::MacOs => self.render_plist(),
            Platform::Linux => self.render_unit(),
        }
    }

    fn render_plist(&self) -> String {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str("<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n");
        out.push_str("<plist version=\"1.0\">\n<dict>\n");
        out.push_str(&format!("  <key>Label</key>\n  <string>{}</string>\n", xml_escape(&self.label)));
        out.push_str("  <key>ProgramArguments</key>\n  <array>\n");
        out.push_str(&format!(
            "    <string>{}</string>\n",
            xml_escape(&self.program_path.to_string_lossy())
        ));
        for arg in &self.arguments {
            out.push_str(&format!("    <string>{}</string>\n", xml_escape(arg)));
        }
        out.push_str("  </array>\n");
        out.push_str(&format!(
            "  <key>RunAtLoad</key>\n  <{}/>\n",
            if self.run_at_load { "true" } else { "false" }
        ));
        out.push_str("</dict>\n</plist>\n");
        out
    }

    fn render_unit(&self) -> String {
        let mut exec = systemd_quote(&self.program_path.to_string_lossy());
        for arg in &self.arguments {
            exec.push(' ');
            exec.push_str(&systemd_quote(arg));
        }

        let mut out = String::new();
        out.push_str("[Unit]\n");
        out.push_str(&format!("Description={}\n", self.label));
        out.push_str("After=network-online.target\n\n");
        out.push_str("[Service]\n");
        out.push_str("Type=simple\n");
        out.push_str(&format!("ExecStart={}\n", exec));
        out.push_str("Restart=on-failure\n\n");
        out.push_str("[Install]\n");
        out.push_str("WantedBy=multi-user.target\n");
        out
    }
}

fn descriptor_path(dir: &Path, label: &str, platform: Platform) -> PathBuf {
    match platform {
        Platform::MacOs => dir.join(format!("{}.plist", label)),
        Platform::Linux if label.ends_with(".service") => dir.join(label),
        Platform::Linux => dir.join(format!("{}.service", label)),
    }
}

/// Substitute `{{INSTALL_DIR}}` in a descriptor template
pub fn render_template(template: &str, install_dir: &Path) -> String {
    template.replace(INSTALL_DIR_PLACEHOLDER, &install_dir.to_string_lossy())
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Quote one `ExecStart=` word
fn systemd_quote(value: &str) -> String {
    let escaped = value.replace('%', "%%").replace('$', "$$");
    let needs_quotes = escaped.is_empty()
        || escaped
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | ';'));
    if !needs_quotes {
        return escaped;
    }
    let mut out = String::with_capacity(escaped.len() + 2);
    out.push('"');
    for c in escaped.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Script file names are plain names inside the script directory
fn validate_script_name(name: &str) -> XstreamResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if !valid {
        return Err(XstreamError::InvalidArgument(format!("Invalid script name '{}'", name)));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceStatus {
    Running,
    Stopped,
    NotInstalled,
}

fn output_matches(err: &XstreamError, markers: &[&str]) -> bool {
    err.command_output()
        .map(|output| markers.iter().any(|m| output.contains(m)))
        .unwrap_or(false)
}

#[derive(Clone)]
pub struct ServiceSupervisor {
    executor: Arc<dyn PrivilegedExecutor>,
    writer: PrivilegedWriter,
    platform: Platform,
    script_dir: PathBuf,
}

impl ServiceSupervisor {
    pub fn new(
        executor: Arc<dyn PrivilegedExecutor>,
        writer: PrivilegedWriter,
        platform: Platform,
        script_dir: PathBuf,
    ) -> Self {
        Self {
            executor,
            writer,
            platform,
            script_dir,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn script_dir(&self) -> &Path {
        &self.script_dir
    }

    /// Write scripts and descriptor, replacing whatever was there
    pub async fn install(
        &self,
        descriptor: &ServiceDescriptor,
        scripts: &BTreeMap<String, String>,
        credential: &PrivilegeCredential,
    ) -> XstreamResult<()> {
        descriptor.validate()?;
        for name in scripts.keys() {
            validate_script_name(name)?;
        }

        let owner = format!("root:{}", self.platform.root_group());
        let mut files: Vec<FilePayload> = scripts
            .iter()
            .map(|(name, content)| {
                FilePayload::text(self.script_dir.join(name), content.clone(), SCRIPT_MODE)
                    .owned_by(owner.clone())
            })
            .collect();
        files.push(
            FilePayload::text(
                &descriptor.install_path,
                descriptor.render(self.platform, &self.script_dir),
                DESCRIPTOR_MODE,
            )
            .owned_by(owner),
        );

        info!(
            "Installing service {} ({} scripts) at {:?}",
            descriptor.label,
            scripts.len(),
            descriptor.install_path
        );
        self.writer.write_all(&files, credential).await?;

        if self.platform == Platform::Linux {
            let mut command = "systemctl daemon-reload".to_string();
            if descriptor.run_at_load {
                command.push_str(&format!(" && systemctl enable {}", shell_quote(&descriptor.unit_name())));
            }
            self.executor.run(&command, credential).await?;
        }

        Ok(())
    }

    /// Load the service into the registry
    pub async fn start(
        &self,
        descriptor: &ServiceDescriptor,
        credential: &PrivilegeCredential,
    ) -> XstreamResult<()> {
        validation::validate_service_label(&descriptor.label)?;

        let command = match self.platform {
            Platform::MacOs => {
                validation::validate_absolute_path(&descriptor.install_path)?;
                format!("launchctl load -w {}", shell_quote_path(&descriptor.install_path))
            }
            Platform::Linux => format!("systemctl start {}", shell_quote(&descriptor.unit_name())),
        };

        match self.executor.run(&command, credential).await {
            Ok(_) => {
                info!("Started service {}", descriptor.label);
                Ok(())
            }
            Err(e) if output_matches(&e, START_TOLERATED) => {
                debug!("Service {} already loaded", descriptor.label);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Unload the service; an already-unloaded service is success
    pub async fn stop(
        &self,
        descriptor: &ServiceDescriptor,
        credential: &PrivilegeCredential,
    ) -> XstreamResult<()> {
        validation::validate_service_label(&descriptor.label)?;

        let command = match self.platform {
            Platform::MacOs => {
                validation::validate_absolute_path(&descriptor.install_path)?;
                format!("launchctl unload {}", shell_quote_path(&descriptor.install_path))
            }
            Platform::Linux => format!("systemctl stop {}", shell_quote(&descriptor.unit_name())),
        };

        match self.executor.run(&command, credential).await {
            Ok(_) => {
                info!("Stopped service {}", descriptor.label);
                Ok(())
            }
            Err(e) if output_matches(&e, STOP_TOLERATED) => {
                debug!("Service {} already unloaded", descriptor.label);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn status(
        &self,
        descriptor: &ServiceDescriptor,
        credential: &PrivilegeCredential,
    ) -> XstreamResult<ServiceStatus> {
        validation::validate_service_label(&descriptor.label)?;

        match self.platform {
            Platform::Linux => {
                let command = format!(
                    "systemctl show -p LoadState,ActiveState {}",
                    shell_quote(&descriptor.unit_name())
                );
                let output = self.executor.run(&command, credential).await?;
                Ok(parse_systemd_status(&output))
            }
            Platform::MacOs => {
                let command = format!("launchctl list {}", shell_quote(&descriptor.label));
                match self.executor.run(&command, credential).await {
                    Ok(output) if output.contains("\"PID\" =") => Ok(ServiceStatus::Running),
                    Ok(_) => Ok(ServiceStatus::Stopped),
                    // `launchctl list <label>` exits non-zero for unknown labels
                    Err(e) if e.command_output().is_some() => {
                        if tokio::fs::metadata(&descriptor.install_path).await.is_ok() {
                            Ok(ServiceStatus::Stopped)
                        } else {
                            Ok(ServiceStatus::NotInstalled)
                        }
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Remove the descriptor and the named scripts
    pub async fn uninstall(
        &self,
        descriptor: &ServiceDescriptor,
        scripts: &[String],
        credential: &PrivilegeCredential,
    ) -> XstreamResult<()> {
        validation::validate_service_label(&descriptor.label)?;
        for name in scripts {
            validate_script_name(name)?;
        }

        let mut paths = vec![descriptor.install_path.clone()];
        paths.extend(scripts.iter().map(|name| self.script_dir.join(name)));

        info!("Uninstalling service {}", descriptor.label);
        self.writer.remove_all(&paths, credential).await?;

        if self.platform == Platform::Linux {
            if let Err(e) = self.executor.run("systemctl daemon-reload", credential).await {
                warn!("daemon-reload after uninstalling {} failed: {}", descriptor.label, e);
            }
        }
        Ok(())
    }

    /// Shell fragment that unloads and deletes every descriptor whose label
    /// starts with `prefix` in `descriptor_dir`
    pub fn purge_command(&self, descriptor_dir: &Path, prefix: &str) -> XstreamResult<String> {
        validation::validate_service_label(prefix)?;
        validation::validate_absolute_path(descriptor_dir)?;
        let dir = shell_quote_path(descriptor_dir);

        Ok(match self.platform {
            Platform::MacOs => format!(
                "for f in {}/{}*.plist; do [ -e \"$f\" ] || continue; launchctl unload \"$f\" 2>/dev/null; rm -f \"$f\"; done",
                dir, prefix
            ),
            Platform::Linux => format!(
                "for f in {}/{}*.service; do [ -e \"$f\" ] || continue; systemctl stop \"$(basename \"$f\")\" 2>/dev/null; rm -f \"$f\"; done; systemctl daemon-reload",
                dir, prefix
            ),
        })
    }
}

fn parse_systemd_status(output: &str) -> ServiceStatus {
    let mut load_state = "";
    let mut active_state = "";
    for line in output.lines() {
        if let Some(value) = line.trim().strip_prefix("LoadState=") {
            load_state = value;
        } else if let Some(value) = line.trim().strip_prefix("ActiveState=") {
            active_state = value;
        }
    }

    if load_state == "not-found" || load_state.is_empty() {
        ServiceStatus::NotInstalled
    } else if matches!(active_state, "active" | "activating" | "reloading") {
        ServiceStatus::Running
    } else {
        ServiceStatus::Stopped
    }
}
