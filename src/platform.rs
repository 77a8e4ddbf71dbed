//! Target platform detection
//!
//! Command dialects differ between Linux (`ip`, `systemctl`, `gsettings`) and
//! macOS (`ifconfig`/`route`, `launchctl`, `networksetup`).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    #[serde(rename = "macos")]
    MacOs,
}

impl Platform {
    /// Platform the binary was compiled for
    ///
    /// Anything that is not macOS uses the Linux dialect.
    pub fn current() -> Self {
        #[cfg(target_os = "macos")]
        {
            Platform::MacOs
        }
        #[cfg(not(target_os = "macos"))]
        {
            Platform::Linux
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
        }
    }

    /// Group owning root-installed files
    pub fn root_group(&self) -> &'static str {
        match self {
            Platform::Linux => "root",
            Platform::MacOs => "wheel",
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::current()
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
