//! Input validation and sanitization
//!
//! Every value interpolated into a privileged command passes through here first

use crate::error::{XstreamError, XstreamResult};
use std::net::IpAddr;
use std::path::Path;

/// Maximum length for interface names (Linux kernel limit is 15)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Maximum length for configuration values
const MAX_CONFIG_VALUE_LEN: usize = 255;

/// Maximum length for captured command output surfaced in errors
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Maximum length for a launchd label / systemd unit name
const MAX_SERVICE_LABEL_LEN: usize = 128;

/// Validate interface name to prevent command injection
///
/// Interface names must be alphanumeric with optional dashes and underscores,
/// and no longer than 15 characters (Linux kernel limit)
pub fn validate_interface_name(name: &str) -> XstreamResult<()> {
    if name.is_empty() {
        return Err(XstreamError::InvalidArgument(
            "Interface name cannot be empty".to_string()
        ));
    }

    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(XstreamError::InvalidArgument(
            format!("Interface name too long (max {} characters)", MAX_INTERFACE_NAME_LEN)
        ));
    }

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            return Err(XstreamError::InvalidArgument(
                format!("Invalid interface name '{}': contains invalid character '{}'", name, c)
            ));
        }
    }

    if name.starts_with('-') {
        return Err(XstreamError::InvalidArgument(
            "Interface name cannot start with dash".to_string()
        ));
    }

    Ok(())
}

/// Validate IP address
pub fn validate_ip_address(addr: &str) -> XstreamResult<IpAddr> {
    addr.parse::<IpAddr>()
        .map_err(|_| XstreamError::InvalidArgument(
            format!("Invalid IP address: {}", addr)
        ))
}

/// Validate a TCP/UDP port
pub fn validate_port(port: u16) -> XstreamResult<()> {
    if port == 0 {
        return Err(XstreamError::InvalidArgument("Port cannot be 0".to_string()));
    }
    Ok(())
}

/// Validate a launchd label or systemd unit name
///
/// Reverse-DNS style: alphanumeric plus `.`, `-`, `_` and `@`
pub fn validate_service_label(label: &str) -> XstreamResult<()> {
    if label.is_empty() {
        return Err(XstreamError::InvalidArgument(
            "Service label cannot be empty".to_string()
        ));
    }

    if label.len() > MAX_SERVICE_LABEL_LEN {
        return Err(XstreamError::InvalidArgument(
            format!("Service label too long (max {} characters)", MAX_SERVICE_LABEL_LEN)
        ));
    }

    if label.starts_with('-') || label.starts_with('.') {
        return Err(XstreamError::InvalidArgument(
            format!("Invalid service label '{}'", label)
        ));
    }

    for c in label.chars() {
        if !c.is_ascii_alphanumeric() && !matches!(c, '.' | '-' | '_' | '@') {
            return Err(XstreamError::InvalidArgument(
                format!("Invalid service label '{}': contains invalid character '{}'", label, c)
            ));
        }
    }

    Ok(())
}

/// Validate that a path is absolute and free of `..` components
pub fn validate_absolute_path(path: &Path) -> XstreamResult<()> {
    if !path.is_absolute() {
        return Err(XstreamError::InvalidArgument(
            format!("Path must be absolute: {}", path.display())
        ));
    }

    if path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(XstreamError::InvalidArgument(
            format!("Path cannot contain '..': {}", path.display())
        ));
    }

    if path.to_string_lossy().contains('\0') {
        return Err(XstreamError::InvalidArgument(
            "Path contains null byte".to_string()
        ));
    }

    Ok(())
}

/// Sanitize configuration values to prevent injection
///
/// Removes or rejects values containing dangerous characters
pub fn sanitize_config_value(value: &str) -> XstreamResult<String> {
    if value.chars().any(|c| c.is_control() && c != '\t') {
        return Err(XstreamError::InvalidArgument(
            "Configuration value contains invalid control characters".to_string()
        ));
    }

    if value.len() > MAX_CONFIG_VALUE_LEN {
        return Err(XstreamError::InvalidArgument(
            format!("Configuration value too long (max {} characters)", MAX_CONFIG_VALUE_LEN)
        ));
    }

    Ok(value.to_string())
}

/// Truncate command output before it is surfaced in an error
pub fn sanitize_error_message(stderr: &str) -> String {
    let mut sanitized = stderr.trim().to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let mut cut = MAX_ERROR_MESSAGE_LEN;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str("... (truncated)");
    }

    sanitized
}

/// Validate hostname for the proxy target
pub fn validate_hostname(host: &str) -> XstreamResult<()> {
    if host.is_empty() {
        return Err(XstreamError::InvalidArgument(
            "Hostname cannot be empty".to_string()
        ));
    }

    if host.len() > 253 {
        return Err(XstreamError::InvalidArgument(
            "Hostname too long".to_string()
        ));
    }

    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    for c in host.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '.' {
            return Err(XstreamError::InvalidArgument(
                format!("Invalid hostname character: {}", c)
            ));
        }
    }

    if host.starts_with('-') || host.starts_with('.') ||
       host.ends_with('-') || host.ends_with('.') {
        return Err(XstreamError::InvalidArgument(
            "Invalid hostname format".to_string()
        ));
    }

    Ok(())
}

/// Quote a value for `/bin/sh`
///
/// Wraps in single quotes; embedded single quotes become `'\''`.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_' | ':' | '@' | '=' | ','))
    {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// Quote a filesystem path for `/bin/sh`
pub fn shell_quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}
