//! Configuration management for xstream-native

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{XstreamError, XstreamResult};
use crate::platform::Platform;
use crate::validation;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XstreamConfig {
    /// Command dialect; defaults to the build target
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub paths: ConfigPaths,
    #[serde(default)]
    pub tunnel: TunnelSettings,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub services: ServiceSettings,
    #[serde(default)]
    pub core: CoreSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// Per-user configuration directory
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    /// Scratch space for staged files and downloads
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Where service scripts are installed
    #[serde(default = "default_script_dir")]
    pub script_dir: PathBuf,
    /// Persisted node list
    #[serde(default = "default_node_store")]
    pub node_store: PathBuf,
    /// Installed proxy-core binary
    #[serde(default = "default_core_binary")]
    pub core_binary: PathBuf,
    /// Directory holding per-node proxy-core configs
    #[serde(default = "default_node_config_dir")]
    pub node_config_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    #[serde(default = "default_tun_interface")]
    pub interface: String,
    #[serde(default = "default_tun_address")]
    pub address: IpNet,
    #[serde(default = "default_intercept_routes")]
    pub intercept_routes: Vec<IpNet>,
    #[serde(default = "default_exclude_routes")]
    pub exclude_routes: Vec<IpNet>,
    #[serde(default = "default_dns")]
    pub dns: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_proxy_host")]
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// launchd label / systemd unit of the TUN-to-proxy relay
    #[serde(default = "default_relay_label")]
    pub relay_label: String,
    #[serde(default = "default_relay_program")]
    pub relay_program: PathBuf,
    /// Where service descriptors are installed
    #[serde(default = "default_descriptor_dir")]
    pub descriptor_dir: PathBuf,
    /// Common label prefix of per-node proxy-core services
    #[serde(default = "default_node_label_prefix")]
    pub node_label_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreSettings {
    #[serde(default = "default_download_base")]
    pub download_base: String,
    #[serde(default = "default_core_version")]
    pub version: String,
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

fn default_config_dir() -> PathBuf {
    match Platform::current() {
        Platform::MacOs => home_dir().join("Library/Application Support/xstream.svc.plus"),
        Platform::Linux => home_dir().join(".config/xstream"),
    }
}

fn default_state_dir() -> PathBuf {
    std::env::temp_dir().join("xstream")
}

fn default_script_dir() -> PathBuf {
    match Platform::current() {
        Platform::MacOs => PathBuf::from("/opt/homebrew/libexec/xstream"),
        Platform::Linux => PathBuf::from("/opt/xstream/libexec"),
    }
}

fn default_node_store() -> PathBuf {
    default_config_dir().join("vpn_nodes.json")
}

fn default_core_binary() -> PathBuf {
    match Platform::current() {
        Platform::MacOs => PathBuf::from("/opt/homebrew/bin/xray"),
        Platform::Linux => PathBuf::from("/opt/bin/xray"),
    }
}

fn default_node_config_dir() -> PathBuf {
    match Platform::current() {
        Platform::MacOs => PathBuf::from("/opt/homebrew/etc"),
        Platform::Linux => PathBuf::from("/opt/etc"),
    }
}

fn default_tun_interface() -> String {
    match Platform::current() {
        Platform::MacOs => "utun123".to_string(),
        Platform::Linux => "tun0".to_string(),
    }
}

fn default_tun_address() -> IpNet {
    IpNet::V4(ipnet::Ipv4Net::new(std::net::Ipv4Addr::new(198, 18, 0, 1), 15).unwrap_or_default())
}

fn cidr(a: u8, b: u8, c: u8, d: u8, prefix: u8) -> IpNet {
    IpNet::V4(ipnet::Ipv4Net::new(std::net::Ipv4Addr::new(a, b, c, d), prefix).unwrap_or_default())
}

fn default_intercept_routes() -> Vec<IpNet> {
    vec![cidr(0, 0, 0, 0, 1), cidr(128, 0, 0, 0, 1)]
}

fn default_exclude_routes() -> Vec<IpNet> {
    vec![
        cidr(10, 0, 0, 0, 8),
        cidr(172, 16, 0, 0, 12),
        cidr(192, 168, 0, 0, 16),
    ]
}

fn default_dns() -> String {
    "8.8.8.8".to_string()
}

fn default_proxy_host() -> String {
    "127.0.0.1".to_string()
}

fn default_proxy_port() -> u16 {
    1080
}

fn default_relay_label() -> String {
    match Platform::current() {
        Platform::MacOs => "com.xstream.tun2socks".to_string(),
        Platform::Linux => "xstream-tun2socks".to_string(),
    }
}

fn default_relay_program() -> PathBuf {
    match Platform::current() {
        Platform::MacOs => PathBuf::from("/opt/homebrew/bin/tun2socks"),
        Platform::Linux => PathBuf::from("/opt/bin/tun2socks"),
    }
}

fn default_descriptor_dir() -> PathBuf {
    match Platform::current() {
        Platform::MacOs => PathBuf::from("/Library/LaunchDaemons"),
        Platform::Linux => PathBuf::from("/etc/systemd/system"),
    }
}

fn default_node_label_prefix() -> String {
    match Platform::current() {
        Platform::MacOs => "com.xstream.xray-node-".to_string(),
        Platform::Linux => "xray-node-".to_string(),
    }
}

fn default_download_base() -> String {
    "https://artifact.onwalk.net/xray-core".to_string()
}

fn default_core_version() -> String {
    "v25.3.6".to_string()
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            state_dir: default_state_dir(),
            script_dir: default_script_dir(),
            node_store: default_node_store(),
            core_binary: default_core_binary(),
            node_config_dir: default_node_config_dir(),
        }
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            interface: default_tun_interface(),
            address: default_tun_address(),
            intercept_routes: default_intercept_routes(),
            exclude_routes: default_exclude_routes(),
            dns: default_dns(),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: default_proxy_host(),
            port: default_proxy_port(),
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            relay_label: default_relay_label(),
            relay_program: default_relay_program(),
            descriptor_dir: default_descriptor_dir(),
            node_label_prefix: default_node_label_prefix(),
        }
    }
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            download_base: default_download_base(),
            version: default_core_version(),
        }
    }
}

impl ProxySettings {
    /// `host:port` as handed to the relay
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl XstreamConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> XstreamResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| XstreamError::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| XstreamError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from `path` if it exists, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> XstreamResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> XstreamResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| XstreamError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| XstreamError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Ensure the user-owned directories exist
    pub fn ensure_directories(&self) -> XstreamResult<()> {
        let store_dir = self.paths.node_store.parent().map(Path::to_path_buf);
        for dir in [Some(self.paths.config_dir.clone()), Some(self.paths.state_dir.clone()), store_dir]
            .into_iter()
            .flatten()
        {
            std::fs::create_dir_all(&dir)
                .map_err(|e| XstreamError::Config(format!("Failed to create directory {:?}: {}", dir, e)))?;
        }
        Ok(())
    }

    /// Check every value that ends up in a privileged command
    pub fn validate(&self) -> XstreamResult<()> {
        validation::validate_interface_name(&self.tunnel.interface)?;
        validation::validate_ip_address(&self.tunnel.dns)?;
        validation::validate_hostname(&self.proxy.host)?;
        validation::validate_port(self.proxy.port)?;
        validation::validate_service_label(&self.services.relay_label)?;
        validation::validate_service_label(&self.services.node_label_prefix)?;

        for path in [
            &self.paths.script_dir,
            &self.paths.core_binary,
            &self.paths.node_config_dir,
            &self.services.relay_program,
            &self.services.descriptor_dir,
        ] {
            validation::validate_absolute_path(path)?;
        }

        if let Some(overlap) = self
            .tunnel
            .intercept_routes
            .iter()
            .find(|r| self.tunnel.exclude_routes.contains(r))
        {
            return Err(XstreamError::Config(format!(
                "Route {} is both intercepted and excluded",
                overlap
            )));
        }

        if !self.core.download_base.starts_with("https://") && !self.core.download_base.starts_with("http://") {
            return Err(XstreamError::Config(format!(
                "Download base must be an http(s) URL: {}",
                self.core.download_base
            )));
        }

        Ok(())
    }
}
