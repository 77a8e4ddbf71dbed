//! System SOCKS proxy toggle
//!
//! macOS: every service from `networksetup -listallnetworkservices`.
//! Linux: the GNOME desktop proxy, exposed as a single target named `gnome`.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{XstreamError, XstreamResult};
use crate::platform::Platform;
use crate::privilege::{PrivilegeCredential, PrivilegedExecutor};
use crate::validation::{self, shell_quote};

/// Target name for the desktop-wide proxy on Linux
pub const GNOME_TARGET: &str = "gnome";

const GNOME_PROXY_SCHEMA: &str = "org.gnome.system.proxy";

/// A network interface the toggle could not update
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceFailure {
    pub interface: String,
    pub kind: String,
    pub message: String,
}

/// Outcome of one toggle across all interfaces
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProxyToggleReport {
    pub affected: Vec<String>,
    pub failures: Vec<InterfaceFailure>,
}

impl ProxyToggleReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// First per-interface failure as an error, for callers that need all-or-nothing
    pub fn into_result(self) -> XstreamResult<Vec<String>> {
        match self.failures.first() {
            None => Ok(self.affected),
            Some(failure) => Err(XstreamError::Service(format!(
                "proxy update failed on {}: {}",
                failure.interface, failure.message
            ))),
        }
    }
}

#[derive(Clone)]
pub struct ProxyToggle {
    executor: Arc<dyn PrivilegedExecutor>,
    platform: Platform,
}

impl ProxyToggle {
    pub fn new(executor: Arc<dyn PrivilegedExecutor>, platform: Platform) -> Self {
        Self { executor, platform }
    }

    /// Point every interface at `host:port` (enable) or switch the proxy off
    ///
    /// Keeps going after a failing interface; the report lists both outcomes.
    pub async fn set_enabled(
        &self,
        enabled: bool,
        host: &str,
        port: u16,
        credential: &PrivilegeCredential,
    ) -> XstreamResult<ProxyToggleReport> {
        if enabled {
            validation::validate_hostname(host)?;
            validation::validate_port(port)?;
        }

        let interfaces = self.list_interfaces(credential).await?;
        let mut report = ProxyToggleReport::default();

        if interfaces.is_empty() {
            debug!("No network interfaces to update");
            return Ok(report);
        }

        for interface in interfaces {
            let command = self.toggle_command(&interface, enabled, host, port);
            match self.executor.run(&command, credential).await {
                Ok(_) => {
                    debug!("Proxy {} on {}", if enabled { "enabled" } else { "disabled" }, interface);
                    report.affected.push(interface);
                }
                Err(e) => {
                    warn!("Failed to update proxy on {}: {}", interface, e);
                    report.failures.push(InterfaceFailure {
                        interface,
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            "System proxy {}: {} updated, {} failed",
            if enabled { "enabled" } else { "disabled" },
            report.affected.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Configured network interfaces the proxy applies to
    pub async fn list_interfaces(&self, credential: &PrivilegeCredential) -> XstreamResult<Vec<String>> {
        match self.platform {
            Platform::MacOs => {
                let output = self
                    .executor
                    .run("networksetup -listallnetworkservices", credential)
                    .await?;
                Ok(parse_network_services(&output))
            }
            Platform::Linux => match self.executor.run("gsettings list-schemas", credential).await {
                Ok(output) if output.lines().any(|l| l.trim() == GNOME_PROXY_SCHEMA) => {
                    Ok(vec![GNOME_TARGET.to_string()])
                }
                Ok(_) => Ok(Vec::new()),
                Err(XstreamError::CommandFailed { code: Some(127), .. }) => {
                    debug!("gsettings not available, no desktop proxy to update");
                    Ok(Vec::new())
                }
                Err(e) => Err(e),
            },
        }
    }

    fn toggle_command(&self, interface: &str, enabled: bool, host: &str, port: u16) -> String {
        match self.platform {
            Platform::MacOs => {
                let service = shell_quote(interface);
                if enabled {
                    format!(
                        "networksetup -setsocksfirewallproxy {} {} {} && networksetup -setsocksfirewallproxystate {} on",
                        service, host, port, service
                    )
                } else {
                    format!("networksetup -setsocksfirewallproxystate {} off", service)
                }
            }
            Platform::Linux => {
                if enabled {
                    format!(
                        "gsettings set {schema}.socks host \"'{}'\" && gsettings set {schema}.socks port {} && gsettings set {schema} mode 'manual'",
                        host,
                        port,
                        schema = GNOME_PROXY_SCHEMA
                    )
                } else {
                    format!("gsettings set {} mode 'none'", GNOME_PROXY_SCHEMA)
                }
            }
        }
    }
}

/// Service names from `networksetup -listallnetworkservices`
///
/// The first line is an explanatory header; disabled services carry a
/// leading `*`.
fn parse_network_services(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .map(|line| line.trim().trim_start_matches('*').trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privilege::MockPrivilegedExecutor;

    const LISTING: &str = "An asterisk (*) denotes that a network service is disabled.\nWi-Fi\nUSB 10/100 LAN\n*Thunderbolt Bridge\n";

    #[test]
    fn test_parse_network_services() {
        assert_eq!(
            parse_network_services(LISTING),
            vec!["Wi-Fi", "USB 10/100 LAN", "Thunderbolt Bridge"]
        );
        assert!(parse_network_services("An asterisk (*) denotes...\n").is_empty());
    }

    #[test]
    fn test_toggle_commands() {
        let toggle = ProxyToggle::new(Arc::new(MockPrivilegedExecutor::new()), Platform::MacOs);
        assert_eq!(
            toggle.toggle_command("USB 10/100 LAN", false, "127.0.0.1", 1080),
            "networksetup -setsocksfirewallproxystate 'USB 10/100 LAN' off"
        );
        assert_eq!(
            toggle.toggle_command("Wi-Fi", true, "127.0.0.1", 1080),
            "networksetup -setsocksfirewallproxy Wi-Fi 127.0.0.1 1080 && networksetup -setsocksfirewallproxystate Wi-Fi on"
        );
    }

    #[tokio::test]
    async fn test_continues_after_interface_failure() {
        let mut mock = MockPrivilegedExecutor::new();
        mock.expect_run()
            .withf(|cmd, _| cmd == "networksetup -listallnetworkservices")
            .returning(|_, _| Ok(LISTING.to_string()));
        mock.expect_run()
            .withf(|cmd, _| cmd.contains("'USB 10/100 LAN'"))
            .returning(|cmd, _| {
                Err(XstreamError::CommandFailed {
                    cmd: cmd.to_string(),
                    code: Some(1),
                    output: "** Error: The parameters were not valid.".into(),
                })
            });
        mock.expect_run()
            .returning(|_, _| Ok(String::new()));

        let toggle = ProxyToggle::new(Arc::new(mock), Platform::MacOs);
        let report = toggle
            .set_enabled(true, "127.0.0.1", 1080, &PrivilegeCredential::empty())
            .await
            .unwrap();

        assert_eq!(report.affected, vec!["Wi-Fi", "Thunderbolt Bridge"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].interface, "USB 10/100 LAN");
        assert_eq!(report.failures[0].kind, "ExecutionError");
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_disable_with_no_interfaces_is_empty_success() {
        let mut mock = MockPrivilegedExecutor::new();
        mock.expect_run()
            .times(1)
            .returning(|_, _| Ok("An asterisk (*) denotes that a network service is disabled.\n".to_string()));

        let toggle = ProxyToggle::new(Arc::new(mock), Platform::MacOs);
        let report = toggle
            .set_enabled(false, "127.0.0.1", 1080, &PrivilegeCredential::empty())
            .await
            .unwrap();
        assert!(report.affected.is_empty());
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_linux_without_gsettings() {
        let mut mock = MockPrivilegedExecutor::new();
        mock.expect_run().times(1).returning(|cmd, _| {
            Err(XstreamError::CommandFailed {
                cmd: cmd.to_string(),
                code: Some(127),
                output: "/bin/sh: 1: gsettings: not found".into(),
            })
        });

        let toggle = ProxyToggle::new(Arc::new(mock), Platform::Linux);
        let report = toggle
            .set_enabled(false, "127.0.0.1", 1080, &PrivilegeCredential::empty())
            .await
            .unwrap();
        assert!(report.affected.is_empty());
    }

    #[tokio::test]
    async fn test_enable_validates_host_first() {
        let mut mock = MockPrivilegedExecutor::new();
        mock.expect_run().times(0);
        let toggle = ProxyToggle::new(Arc::new(mock), Platform::Linux);
        let err = toggle
            .set_enabled(true, "127.0.0.1;reboot", 1080, &PrivilegeCredential::empty())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ArgumentError");
    }
}
