//! Privilege elevation for packet filter commands
//!
//! meshwall normally runs as root from cron or a systemd timer, in which case
//! `iptables` is executed directly. When started by an unprivileged operator
//! (typically `meshwall check` or `meshwall list`) only the `iptables`
//! invocations are elevated.
//!
//! # Elevation Strategy
//!
//! - **Root**: run `iptables` directly
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `MESHWALL_ELEVATION_METHOD`: Force `sudo`, `run0` or `pkexec`, e.g. to
//!   pair with a sudoers NOPASSWD rule on a host where polkit would prompt.
//! - `MESHWALL_IPTABLES_COMMAND`: Path to the iptables binary (default: `iptables`).
//! - `MESHWALL_TEST_NO_ELEVATION`: Run the binary directly (for testing only).
//!
//! # Security
//!
//! - Only the iptables binary is ever elevated
//! - Commands are built as argument vectors, never through a shell

use std::path::PathBuf;
use std::str::FromStr;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not installed
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(Method),

    /// Invalid value for `MESHWALL_ELEVATION_METHOD`
    #[error("Invalid MESHWALL_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Not root and no elevation helper usable from this context
    #[error("Cannot elevate iptables: not root and neither run0 nor pkexec is installed")]
    NoMethod,
}

/// Helper used to run iptables with root privileges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Method {
    Sudo,
    Run0,
    Pkexec,
}

/// What the selection logic needs to know about the host.
struct Host<'a> {
    no_elevation: bool,
    is_root: bool,
    forced: Option<&'a str>,
    is_tty: bool,
    installed: &'a dyn Fn(&str) -> bool,
}

/// Picks the helper for `host`; `None` means run the binary directly.
fn select_method(host: &Host<'_>) -> Result<Option<Method>, ElevationError> {
    if host.no_elevation || host.is_root {
        return Ok(None);
    }

    if let Some(forced) = host.forced.map(str::trim).filter(|m| !m.is_empty()) {
        let method = Method::from_str(forced)
            .map_err(|_| ElevationError::InvalidMethod(forced.to_string()))?;
        if !(host.installed)(&method.to_string()) {
            return Err(ElevationError::MethodNotAvailable(method));
        }
        return Ok(Some(method));
    }

    if (host.installed)("run0") {
        Ok(Some(Method::Run0))
    } else if host.is_tty {
        Ok(Some(Method::Sudo))
    } else if (host.installed)("pkexec") {
        Ok(Some(Method::Pkexec))
    } else {
        Err(ElevationError::NoMethod)
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// The iptables binary to run, honouring `MESHWALL_IPTABLES_COMMAND`.
pub fn iptables_program() -> String {
    std::env::var("MESHWALL_IPTABLES_COMMAND")
        .ok()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "iptables".to_string())
}

/// Creates an `iptables` command with the specified arguments, elevated if needed
///
/// Arguments are passed directly to iptables without shell interpretation.
/// Callers must validate table, chain and address arguments beforehand.
pub fn create_elevated_iptables_command(args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    let forced = std::env::var("MESHWALL_ELEVATION_METHOD").ok();
    let installed = |name: &str| find_in_path(name).is_some();
    let host = Host {
        no_elevation: std::env::var_os("MESHWALL_TEST_NO_ELEVATION").is_some(),
        is_root: nix::unistd::getuid().is_root(),
        forced: forced.as_deref(),
        is_tty: nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false),
        installed: &installed,
    };

    let program = iptables_program();
    let mut cmd = match select_method(&host)? {
        None => Command::new(&program),
        Some(method) => {
            let mut cmd = Command::new(method.to_string());
            cmd.arg(&program);
            cmd
        }
    };
    cmd.args(args);
    Ok(cmd)
}
