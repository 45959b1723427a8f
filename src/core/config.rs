// Configuration artifact handling for vfio-switch
//
// The configuration is a three-line file written once by `install` and
// read by every other command: device node path, PCI bus prefix, and the
// comma-separated host driver names in function-index order.

use std::fs;
use std::path::{Path, PathBuf};

use crate::core::pci::SysfsPci;
use crate::error::{Result, SwitchError};

/// Default location of the configuration artifact
pub const CONFIG_PATH: &str = "/etc/vfio-switch/config";

/// Device identity and driver assignment, loaded once at startup and
/// held read-only for the rest of the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Device node whose permissions are toggled around each sample
    pub device_path: PathBuf,
    /// PCI bus address prefix shared by all functions of the card
    pub bus_prefix: String,
    /// Host driver per function index, e.g. nvidia for .0, snd_hda_intel for .1
    pub host_drivers: Vec<String>,
}

impl Config {
    /// Parses the three-line configuration text
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().map(str::trim);

        let device_path = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| SwitchError::Config("missing device path (line 1)".to_string()))?;
        let bus_prefix = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| SwitchError::Config("missing PCI bus prefix (line 2)".to_string()))?;
        let drivers_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| SwitchError::Config("missing driver list (line 3)".to_string()))?;

        let host_drivers: Vec<String> = drivers_line
            .split(',')
            .map(|d| d.trim().to_string())
            .collect();
        if host_drivers.iter().any(|d| d.is_empty()) {
            return Err(SwitchError::Config(format!(
                "empty driver name in {:?}",
                drivers_line
            )));
        }

        Ok(Self {
            device_path: PathBuf::from(device_path),
            bus_prefix: bus_prefix.to_string(),
            host_drivers,
        })
    }

    /// Loads the configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            SwitchError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    /// Renders the three-line artifact
    pub fn render(&self) -> String {
        format!(
            "{}\n{}\n{}\n",
            self.device_path.display(),
            self.bus_prefix,
            self.host_drivers.join(",")
        )
    }

    /// Writes the configuration file, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.render())?;
        Ok(())
    }

    /// Enumerates the device's PCI functions and checks that the driver
    /// assignment covers them exactly, one driver per function.
    ///
    /// Runs before any binding call in both switch directions; a
    /// mismatch is a configuration error, never silently tolerated.
    pub fn functions(&self, pci: &SysfsPci) -> Result<Vec<String>> {
        let functions = pci.list_functions(&self.bus_prefix)?;
        if functions.is_empty() {
            return Err(SwitchError::Config(format!(
                "no PCI functions found under {}",
                self.bus_prefix
            )));
        }
        if functions.len() != self.host_drivers.len() {
            return Err(SwitchError::FunctionCountMismatch {
                prefix: self.bus_prefix.clone(),
                expected: self.host_drivers.len(),
                found: functions.len(),
            });
        }
        Ok(functions)
    }
}
