//! Capture interface and route set management
//!
//! `apply` brings the TUN interface up and binds the intercept routes to it;
//! `revert` undoes exactly that. Every mutation is preceded by a query, so a
//! repeated `apply` issues no mutating commands at all.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{XstreamError, XstreamResult};
use crate::platform::Platform;
use crate::privilege::{PrivilegeCredential, PrivilegedExecutor};
use crate::validation;

/// Output fragments meaning "the thing you asked to remove is already gone"
const ABSENT_MARKERS: &[&str] = &[
    "No such process",
    "Cannot find device",
    "does not exist",
    "not in table",
    "No such file or directory",
    "Device not found",
    "No such device",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteTarget {
    Interface(String),
    Gateway(IpAddr),
}

/// A routing-table entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteEntry {
    pub network: IpNet,
    pub target: RouteTarget,
}

impl RouteEntry {
    pub fn via_interface(network: IpNet, interface: impl Into<String>) -> Self {
        Self {
            network,
            target: RouteTarget::Interface(interface.into()),
        }
    }
}

/// Whether an error reports an entry that is already absent
pub(crate) fn is_absent_error(err: &XstreamError) -> bool {
    match err {
        XstreamError::CommandFailed { output, .. } => {
            ABSENT_MARKERS.iter().any(|marker| output.contains(marker))
        }
        _ => false,
    }
}

#[derive(Clone)]
pub struct RoutingController {
    executor: Arc<dyn PrivilegedExecutor>,
    platform: Platform,
}

impl RoutingController {
    pub fn new(executor: Arc<dyn PrivilegedExecutor>, platform: Platform) -> Self {
        Self { executor, platform }
    }

    /// Bring the capture interface up and install the intercept routes
    ///
    /// Exclude routes are removed from the capture interface if present.
    /// Returns the routes this call actually added.
    pub async fn apply(
        &self,
        tun_interface: &str,
        tun_address: IpNet,
        intercept_routes: &[IpNet],
        exclude_routes: &[IpNet],
        credential: &PrivilegeCredential,
    ) -> XstreamResult<Vec<RouteEntry>> {
        validation::validate_interface_name(tun_interface)?;

        if let Some(overlap) = intercept_routes.iter().find(|r| exclude_routes.contains(r)) {
            return Err(XstreamError::InvalidArgument(format!(
                "Route {} is both intercepted and excluded",
                overlap
            )));
        }

        info!("Applying routes on {} ({})", tun_interface, tun_address);

        if !self.has_address(tun_interface, tun_address, credential).await? {
            self.executor
                .run(&self.address_command(tun_interface, tun_address), credential)
                .await?;
            debug!("Assigned {} to {}", tun_address, tun_interface);
        }

        if !self.is_up(tun_interface, credential).await? {
            self.executor
                .run(&self.link_command(tun_interface, true), credential)
                .await?;
            debug!("Brought {} up", tun_interface);
        }

        let mut added = Vec::new();
        for network in intercept_routes {
            if self.has_route(tun_interface, network, credential).await? {
                debug!("Route {} via {} already present", network, tun_interface);
                continue;
            }
            self.executor
                .run(&self.route_add_command(tun_interface, network), credential)
                .await?;
            added.push(RouteEntry::via_interface(*network, tun_interface));
        }

        for network in exclude_routes {
            if !self.has_route(tun_interface, network, credential).await? {
                continue;
            }
            info!("Removing excluded range {} from {}", network, tun_interface);
            match self
                .executor
                .run(&self.route_del_command(tun_interface, network), credential)
                .await
            {
                Ok(_) => {}
                Err(e) if is_absent_error(&e) => {}
                Err(e) => return Err(e),
            }
        }

        info!("Routes applied on {}: {} added", tun_interface, added.len());
        Ok(added)
    }

    /// Remove the intercept routes and bring the interface down
    ///
    /// Entries that are already gone count as success.
    pub async fn revert(
        &self,
        tun_interface: &str,
        intercept_routes: &[IpNet],
        credential: &PrivilegeCredential,
    ) -> XstreamResult<()> {
        validation::validate_interface_name(tun_interface)?;
        info!("Reverting routes on {}", tun_interface);

        let mut first_error = None;

        for network in intercept_routes {
            match self
                .executor
                .run(&self.route_del_command(tun_interface, network), credential)
                .await
            {
                Ok(_) => debug!("Removed route {} via {}", network, tun_interface),
                Err(e) if is_absent_error(&e) => debug!("Route {} already absent", network),
                Err(e) => {
                    warn!("Failed to remove route {}: {}", network, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match self
            .executor
            .run(&self.link_command(tun_interface, false), credential)
            .await
        {
            Ok(_) => {}
            Err(e) if is_absent_error(&e) => debug!("{} already gone", tun_interface),
            Err(e) => {
                warn!("Failed to bring {} down: {}", tun_interface, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // === State queries ===

    async fn has_address(
        &self,
        interface: &str,
        address: IpNet,
        credential: &PrivilegeCredential,
    ) -> XstreamResult<bool> {
        let (command, needle) = match self.platform {
            Platform::Linux => (
                format!("ip -o addr show dev {}", interface),
                format!("{} {}", family_keyword(&address), address),
            ),
            Platform::MacOs => (
                format!("ifconfig {}", interface),
                format!("{} {} ", family_keyword(&address), address.addr()),
            ),
        };

        let output = self.executor.run(&command, credential).await?;
        Ok(output.contains(&needle))
    }

    async fn is_up(&self, interface: &str, credential: &PrivilegeCredential) -> XstreamResult<bool> {
        let command = match self.platform {
            Platform::Linux => format!("ip -o link show dev {}", interface),
            Platform::MacOs => format!("ifconfig {}", interface),
        };

        let output = self.executor.run(&command, credential).await?;
        Ok(parse_link_flags(&output).iter().any(|flag| flag == "UP"))
    }

    async fn has_route(
        &self,
        interface: &str,
        network: &IpNet,
        credential: &PrivilegeCredential,
    ) -> XstreamResult<bool> {
        match self.platform {
            Platform::Linux => {
                let command = format!(
                    "ip {}route show exact {} dev {}",
                    family_flag(network),
                    network,
                    interface
                );
                let output = self.executor.run(&command, credential).await?;
                Ok(!output.trim().is_empty())
            }
            Platform::MacOs => {
                let family = if is_v6(network) { "-inet6 " } else { "" };
                let command = format!("route -n get {}-net {}", family, network);
                match self.executor.run(&command, credential).await {
                    Ok(output) => Ok(route_get_interface(&output).as_deref() == Some(interface)),
                    Err(e) if is_absent_error(&e) => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    }

    // === Command builders ===

    fn address_command(&self, interface: &str, address: IpNet) -> String {
        match self.platform {
            Platform::Linux => format!("ip addr add {} dev {}", address, interface),
            Platform::MacOs => match address {
                IpNet::V4(net) => format!(
                    "ifconfig {} inet {} {} netmask {}",
                    interface,
                    net.addr(),
                    net.addr(),
                    net.netmask()
                ),
                IpNet::V6(net) => format!(
                    "ifconfig {} inet6 {} prefixlen {}",
                    interface,
                    net.addr(),
                    net.prefix_len()
                ),
            },
        }
    }

    fn link_command(&self, interface: &str, up: bool) -> String {
        let state = if up { "up" } else { "down" };
        match self.platform {
            Platform::Linux => format!("ip link set dev {} {}", interface, state),
            Platform::MacOs => format!("ifconfig {} {}", interface, state),
        }
    }

    fn route_add_command(&self, interface: &str, network: &IpNet) -> String {
        match self.platform {
            Platform::Linux => format!(
                "ip {}route add {} dev {}",
                family_flag(network),
                network,
                interface
            ),
            Platform::MacOs => format!(
                "route -n add {}-net {} -interface {}",
                if is_v6(network) { "-inet6 " } else { "" },
                network,
                interface
            ),
        }
    }

    fn route_del_command(&self, interface: &str, network: &IpNet) -> String {
        match self.platform {
            Platform::Linux => format!(
                "ip {}route del {} dev {}",
                family_flag(network),
                network,
                interface
            ),
            Platform::MacOs => format!(
                "route -n delete {}-net {} -interface {}",
                if is_v6(network) { "-inet6 " } else { "" },
                network,
                interface
            ),
        }
    }
}

fn is_v6(network: &IpNet) -> bool {
    matches!(network, IpNet::V6(_))
}

fn family_flag(network: &IpNet) -> &'static str {
    if is_v6(network) { "-6 " } else { "" }
}

fn family_keyword(network: &IpNet) -> &'static str {
    if is_v6(network) { "inet6" } else { "inet" }
}

/// Flags between `<` and `>` in `ip link` / `ifconfig` output
fn parse_link_flags(output: &str) -> Vec<String> {
    let start = match output.find('<') {
        Some(i) => i + 1,
        None => return Vec::new(),
    };
    let end = match output[start..].find('>') {
        Some(i) => start + i,
        None => return Vec::new(),
    };
    output[start..end]
        .split(',')
        .map(|flag| flag.trim().to_string())
        .filter(|flag| !flag.is_empty())
        .collect()
}

/// `interface:` line of `route -n get` output
fn route_get_interface(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("interface:")
            .map(|iface| iface.trim().to_string())
    })
}
