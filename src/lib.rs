//! xstream-native - native support layer for the XStream VPN client
//!
//! Async library providing:
//! - Privileged command execution with a one-shot credential
//! - Capture interface and route set management
//! - launchd / systemd service installation and control
//! - System SOCKS proxy toggling
//! - The persisted proxy node store and its merge engine
//! - The tunnel start/stop state machine
//! - Proxy-core download and reset
//!
//! [`bridge::NativeBridge`] exposes all of it as JSON requests.

pub mod error;
pub mod validation;
pub mod platform;
pub mod privilege;
pub mod files;
pub mod routing;
pub mod service;
pub mod proxy;
pub mod nodes;
pub mod config;
pub mod lifecycle;
pub mod installer;
pub mod bridge;

// Re-export commonly used types
pub use error::{XstreamError, XstreamResult};
pub use platform::Platform;
pub use privilege::{
    CredentialProvider, DryRunExecutor, PrivilegeCredential, PrivilegedExecutor,
    SerializedExecutor, StaticCredential, SudoExecutor,
};
pub use files::{FilePayload, FileSource, PrivilegedWriter};
pub use routing::{RouteEntry, RouteTarget, RoutingController};
pub use service::{RelayLaunch, ServiceDescriptor, ServiceStatus, ServiceSupervisor};
pub use proxy::{InterfaceFailure, ProxyToggle, ProxyToggleReport};
pub use nodes::{MergeOutcome, NodeStore, VpnNode};
pub use config::XstreamConfig;
pub use lifecycle::{StepFailure, StopReport, TunnelLifecycle, TunnelPlan, TunnelState};
pub use installer::{ArtifactFetcher, CoreInstaller, CoreLayout, CoreStatus, HttpFetcher};
pub use bridge::{NativeBridge, Request, Response};
