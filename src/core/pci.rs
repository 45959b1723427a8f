// PCI driver binding for vfio-switch
//
// This module rebinds individual PCI functions between drivers through
// the sysfs driver-binding interface (unbind, driver_override, bind)
// and enumerates the functions of a multi-function device.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, SwitchError};

/// Sysfs PCI driver-binding interface
///
/// Roots default to the live sysfs tree; tests point them at scratch
/// directories instead.
pub struct SysfsPci {
    devices_root: PathBuf,
    drivers_root: PathBuf,
}

impl Default for SysfsPci {
    fn default() -> Self {
        Self {
            devices_root: PathBuf::from("/sys/bus/pci/devices"),
            drivers_root: PathBuf::from("/sys/bus/pci/drivers"),
        }
    }
}

impl SysfsPci {
    pub fn with_roots(devices_root: PathBuf, drivers_root: PathBuf) -> Self {
        Self {
            devices_root,
            drivers_root,
        }
    }

    /// Lists the functions of a device as `<bus-prefix>.<n>` bus ids,
    /// ordered by function index
    pub fn list_functions(&self, bus_prefix: &str) -> Result<Vec<String>> {
        let mut functions: Vec<(u32, String)> = Vec::new();
        let wanted = format!("{}.", bus_prefix);

        for entry in fs::read_dir(&self.devices_root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(suffix) = name.strip_prefix(&wanted) {
                if let Ok(index) = suffix.parse::<u32>() {
                    functions.push((index, name));
                }
            }
        }

        functions.sort_by_key(|(index, _)| *index);
        Ok(functions.into_iter().map(|(_, name)| name).collect())
    }

    /// Returns the driver currently bound to a function, if any
    pub fn current_driver(&self, bdf: &str) -> Option<String> {
        let driver_path = self.devices_root.join(bdf).join("driver");
        fs::read_link(driver_path)
            .ok()
            .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()))
    }

    /// Rebinds one function to the target driver
    ///
    /// No-op when the function is already bound to the target. Otherwise
    /// unbinds the current driver (skipped when nothing is bound), sets
    /// the driver_override hint, and requests a bind on the target
    /// driver's bind interface. Any failure aborts the whole switch; a
    /// half-bound device has no cleanup path.
    pub fn bind(&self, bdf: &str, target: &str) -> Result<()> {
        let current = self.current_driver(bdf);
        if current.as_deref() == Some(target) {
            debug!(function = bdf, driver = target, "already bound, nothing to do");
            return Ok(());
        }

        info!(function = bdf, from = current.as_deref().unwrap_or("none"), to = target, "rebinding");

        if current.is_some() {
            let unbind_path = self.devices_root.join(bdf).join("driver").join("unbind");
            write_sysfs(&unbind_path, bdf, false)
                .map_err(|e| self.binding_error(bdf, target, e))?;
            // Give the kernel a moment to finish the unbind
            thread::sleep(Duration::from_millis(100));
        }

        let override_path = self.devices_root.join(bdf).join("driver_override");
        write_sysfs(&override_path, target, true)
            .map_err(|e| self.binding_error(bdf, target, e))?;

        let bind_path = self.drivers_root.join(target).join("bind");
        write_sysfs(&bind_path, bdf, false)
            .map_err(|e| self.binding_error(bdf, target, e))?;

        Ok(())
    }

    fn binding_error(&self, bdf: &str, target: &str, source: io::Error) -> SwitchError {
        SwitchError::Binding {
            function: bdf.to_string(),
            driver: target.to_string(),
            source,
        }
    }
}

/// Writes a value to an existing sysfs attribute file
fn write_sysfs(path: &std::path::Path, value: &str, truncate: bool) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .truncate(truncate)
        .open(path)?;
    write!(file, "{}", value)
}
