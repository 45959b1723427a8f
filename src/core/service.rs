// External collaborators for vfio-switch
//
// Persistence daemon control through systemctl, desktop notifications,
// device-holder enumeration, device node permission toggling, and the
// re-exec-under-sudo privilege elevation.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use tracing::{debug, info, warn};

use crate::error::{Result, SwitchError};
use crate::utils::run_command;

/// Systemd unit of the NVIDIA persistence daemon
pub const PERSISTENCE_UNIT: &str = "nvidia-persistenced.service";

/// Comm name of the persistence daemon as the kernel reports it.
/// /proc/<pid>/comm truncates to 15 bytes, so match by prefix.
pub const PERSISTENCE_COMM: &str = "nvidia-persiste";

/// Start/stop control over the persistence daemon
pub trait DaemonControl {
    fn stop(&self) -> Result<()>;
    fn start(&self) -> Result<()>;
}

/// Drives the persistence daemon through systemctl
pub struct SystemdDaemon {
    unit: String,
}

impl SystemdDaemon {
    pub fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
        }
    }

    /// Enables the unit so the daemon survives reboots (install flow)
    pub fn enable(&self) -> Result<()> {
        run_command("systemctl", &["enable", "--now", &self.unit])?;
        Ok(())
    }
}

impl DaemonControl for SystemdDaemon {
    fn stop(&self) -> Result<()> {
        debug!(unit = %self.unit, "stopping persistence daemon");
        run_command("systemctl", &["stop", &self.unit])?;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        debug!(unit = %self.unit, "starting persistence daemon");
        run_command("systemctl", &["start", &self.unit])?;
        Ok(())
    }
}

/// Outward notification sink; delivery is best effort
pub trait Notifier {
    fn notify(&self, summary: &str, body: &str);
}

/// Desktop notifications via notify-send
pub struct DesktopNotifier;

impl Notifier for DesktopNotifier {
    fn notify(&self, summary: &str, body: &str) {
        if let Err(e) = run_command("notify-send", &[summary, body]) {
            warn!("could not deliver desktop notification: {}", e);
        }
    }
}

/// A process holding the device node open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHolder {
    pub pid: u32,
    pub name: String,
}

/// Enumeration of processes holding the device node open
pub trait HolderScan {
    fn holders(&self, device: &Path) -> Result<Vec<DeviceHolder>>;
}

/// Scans device holders with fuser
pub struct FuserScan;

impl HolderScan for FuserScan {
    fn holders(&self, device: &Path) -> Result<Vec<DeviceHolder>> {
        let output = Command::new("fuser")
            .arg(device)
            .output()
            .map_err(|e| SwitchError::Command {
                program: "fuser".to_string(),
                detail: format!("failed to execute: {}", e),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        // fuser exits non-zero when nothing holds the file open; that is
        // an empty holder list, not a failure.
        if !output.status.success() && stdout.trim().is_empty() {
            return Ok(Vec::new());
        }

        Ok(parse_fuser_pids(&stdout)
            .into_iter()
            .map(|pid| DeviceHolder {
                pid,
                name: process_name(pid),
            })
            .collect())
    }
}

/// Extracts the PIDs from fuser's stdout. Each entry may carry an access
/// type suffix letter (e.g. `1234m`).
pub fn parse_fuser_pids(stdout: &str) -> Vec<u32> {
    stdout
        .split_whitespace()
        .filter_map(|token| {
            let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u32>().ok()
        })
        .collect()
}

/// Resolves a PID to its comm name
fn process_name(pid: u32) -> String {
    fs::read_to_string(format!("/proc/{}/comm", pid))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "?".to_string())
}

/// Opens the device node to everyone. The vendor query tool needs this
/// window, and the daemon restart tends to reset it.
pub fn relax_device_node(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o666))?;
    Ok(())
}

/// Narrows the device node back down right after a sample. The width of
/// the 0o666 window is an unresolved race with whatever resets the mode;
/// keeping it short is a heuristic, not a fix.
pub fn restrict_device_node(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o660))?;
    Ok(())
}

/// Re-executes the whole program under sudo when not already root.
/// On success the current process image is replaced and this never
/// returns.
pub fn ensure_root() -> Result<()> {
    let uid = run_command("id", &["-u"])?;
    if uid == "0" {
        return Ok(());
    }

    info!("not running as root, re-executing under sudo");
    let exe = std::env::current_exe()?;
    let err = Command::new("sudo")
        .arg(exe)
        .args(std::env::args_os().skip(1))
        .exec();
    Err(SwitchError::Command {
        program: "sudo".to_string(),
        detail: format!("failed to re-execute: {}", err),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fuser_pids() {
        assert_eq!(parse_fuser_pids("  1234  5678m\n"), vec![1234, 5678]);
        assert_eq!(parse_fuser_pids(""), Vec::<u32>::new());
        assert_eq!(parse_fuser_pids("  901m 902e 903 "), vec![901, 902, 903]);
    }

    #[test]
    fn test_permission_toggle() {
        let path = std::env::temp_dir().join(format!(
            "vfio-switch-perms-{}",
            std::process::id()
        ));
        fs::write(&path, "").unwrap();

        relax_device_node(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);

        restrict_device_node(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);

        let _ = fs::remove_file(&path);
    }
}
