// Utility functions for vfio-switch

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Result, SwitchError};

/// Logging bootstrap
pub mod logging {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    /// Initialises the tracing subscriber. `RUST_LOG` wins when set;
    /// otherwise the debug flag selects between `info` and `debug`.
    pub fn init(debug: bool) {
        let level = if debug { "debug" } else { "info" };

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level));

        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(filter)
            .init();
    }
}

/// Runs a system command, returning its trimmed stdout on success
pub fn run_command(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| SwitchError::Command {
            program: program.to_string(),
            detail: format!("failed to execute: {}", e),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(SwitchError::Command {
            program: program.to_string(),
            detail: if stderr.is_empty() {
                format!("exit code {:?}", output.status.code())
            } else {
                stderr
            },
        })
    }
}

/// Helper to create a timestamped backup of a file
pub fn create_timestamped_backup(file_path: &Path) -> io::Result<PathBuf> {
    if !file_path.exists() {
        // No need to backup if file doesn't exist
        return Ok(file_path.to_path_buf());
    }

    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let backup_filename = format!(
        "{}.backup_{}",
        file_path.file_name().unwrap_or_default().to_string_lossy(),
        timestamp
    );
    let backup_path = file_path.with_file_name(backup_filename);

    fs::copy(file_path, &backup_path)?;
    Ok(backup_path)
}
