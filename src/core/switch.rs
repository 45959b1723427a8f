// Driver switch orchestration for vfio-switch
//
// Drives the two hand-off directions end to end: rebinding every PCI
// function of the card to the host drivers and polling until the card
// settles into its idle power state, or rebinding everything to
// vfio-pci for VM passthrough.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::core::config::Config;
use crate::core::pci::SysfsPci;
use crate::core::service::{
    relax_device_node, restrict_device_node, DaemonControl, HolderScan, Notifier,
    PERSISTENCE_COMM,
};
use crate::error::{Result, SwitchError};
use crate::gpu::sampler::PowerSampler;
use crate::gpu::{is_converged, PowerReading, TARGET_PSTATE};

/// Driver every function is bound to for the passthrough direction
pub const PASSTHROUGH_DRIVER: &str = "vfio-pci";

/// Bounds of the host-switch retry loop: outer attempt count, wall-clock
/// deadline per attempt, and the sleep between samples
#[derive(Debug, Clone)]
pub struct RetryBudget {
    pub attempts: u32,
    pub attempt_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            attempts: 4,
            attempt_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Terminal state of a host switch. Exhaustion is a reported outcome,
/// not an error; the mechanism is best effort by design.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    Converged(PowerReading),
    Exhausted,
}

/// Orchestrates both switch directions over the external collaborators
pub struct SwitchManager<'a> {
    config: &'a Config,
    pci: &'a SysfsPci,
    daemon: &'a dyn DaemonControl,
    sampler: &'a dyn PowerSampler,
    notifier: &'a dyn Notifier,
    holders: &'a dyn HolderScan,
}

impl<'a> SwitchManager<'a> {
    pub fn new(
        config: &'a Config,
        pci: &'a SysfsPci,
        daemon: &'a dyn DaemonControl,
        sampler: &'a dyn PowerSampler,
        notifier: &'a dyn Notifier,
        holders: &'a dyn HolderScan,
    ) -> Self {
        Self {
            config,
            pci,
            daemon,
            sampler,
            notifier,
            holders,
        }
    }

    /// Switches the card back to the host driver stack and waits for it
    /// to settle into the idle target.
    ///
    /// After rebinding, each attempt restarts the persistence daemon and
    /// polls the sampler under a per-attempt deadline. Every sample is
    /// bracketed by a permission relax/restrict on the device node: the
    /// query tool needs the open window, and keeping it narrow is the
    /// standing mitigation for whatever else races the mode bits.
    ///
    /// Successful convergence returns immediately and skips the
    /// post-delay; exhaustion notifies, runs the post-delay, and is
    /// still an `Ok` outcome.
    pub fn switch_to_host(&self, delay: Duration, budget: &RetryBudget) -> Result<SwitchOutcome> {
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let functions = self.config.functions(self.pci)?;
        for (function, driver) in functions.iter().zip(&self.config.host_drivers) {
            self.pci.bind(function, driver)?;
        }

        for attempt in 1..=budget.attempts {
            info!(attempt, of = budget.attempts, "restarting persistence daemon");
            self.daemon.stop()?;
            relax_device_node(&self.config.device_path)?;
            self.daemon.start()?;

            let deadline = Instant::now() + budget.attempt_timeout;
            while Instant::now() < deadline {
                // The daemon restart may have reset the mode bits
                relax_device_node(&self.config.device_path)?;
                let sampled = self.sampler.sample();
                restrict_device_node(&self.config.device_path)?;

                match sampled {
                    Ok(reading) if is_converged(&reading) => {
                        info!(pstate = %reading.pstate, watts = reading.watts, "device settled into idle state");
                        self.notifier.notify(
                            "GPU back on host driver",
                            &format!("settled at {} drawing {} W", reading.pstate, reading.watts),
                        );
                        return Ok(SwitchOutcome::Converged(reading));
                    }
                    Ok(reading) => {
                        info!(pstate = %reading.pstate, watts = reading.watts, "not settled yet");
                    }
                    Err(e) => {
                        // Counts as "not converged"; the driver often is
                        // not ready right after the restart
                        warn!("sample failed: {}", e);
                    }
                }

                thread::sleep(budget.poll_interval);
            }
        }

        warn!(
            attempts = budget.attempts,
            "device never reached {} at or below the power ceiling", TARGET_PSTATE
        );
        self.notifier.notify(
            "GPU did not settle",
            &format!(
                "no idle state after {} daemon restarts; card may stay warm",
                budget.attempts
            ),
        );

        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Ok(SwitchOutcome::Exhausted)
    }

    /// Hands every function of the card to vfio-pci.
    ///
    /// Refuses to touch any kernel state while a process other than the
    /// persistence daemon holds the device node open. The daemon is
    /// stopped before the first rebind and restarted only after the
    /// last one.
    pub fn switch_to_passthrough(&self) -> Result<()> {
        let functions = self.config.functions(self.pci)?;

        let foreign: Vec<_> = self
            .holders
            .holders(&self.config.device_path)?
            .into_iter()
            .filter(|h| !h.name.starts_with(PERSISTENCE_COMM))
            .collect();
        if !foreign.is_empty() {
            return Err(SwitchError::DeviceBusy(foreign));
        }

        self.daemon.stop()?;
        for function in &functions {
            self.pci.bind(function, PASSTHROUGH_DRIVER)?;
        }
        self.daemon.start()?;

        info!(functions = functions.len(), "device handed to {}", PASSTHROUGH_DRIVER);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::service::DeviceHolder;
    use crate::gpu::PState;
    use std::cell::Cell;
    use std::fs;
    use std::path::{Path, PathBuf};

    struct Fixture {
        config: Config,
        pci: SysfsPci,
        devices: PathBuf,
        drivers: PathBuf,
    }

    fn fixture(name: &str) -> Fixture {
        let root = std::env::temp_dir().join(format!(
            "vfio-switch-switch-{}-{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        let devices = root.join("devices");
        let drivers = root.join("drivers");
        for f in ["0000:01:00.0", "0000:01:00.1"] {
            let dir = devices.join(f);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("driver_override"), "").unwrap();
        }
        for d in ["nvidia", "snd_hda_intel", "vfio-pci"] {
            let dir = drivers.join(d);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("bind"), "").unwrap();
            fs::write(dir.join("unbind"), "").unwrap();
        }
        let device_node = root.join("nvidia0");
        fs::write(&device_node, "").unwrap();

        let config = Config {
            device_path: device_node,
            bus_prefix: "0000:01:00".to_string(),
            host_drivers: vec!["nvidia".to_string(), "snd_hda_intel".to_string()],
        };
        let pci = SysfsPci::with_roots(devices.clone(), drivers.clone());
        Fixture {
            config,
            pci,
            devices,
            drivers,
        }
    }

    #[derive(Default)]
    struct CountingDaemon {
        stops: Cell<u32>,
        starts: Cell<u32>,
    }

    impl DaemonControl for CountingDaemon {
        fn stop(&self) -> Result<()> {
            self.stops.set(self.stops.get() + 1);
            Ok(())
        }
        fn start(&self) -> Result<()> {
            self.starts.set(self.starts.get() + 1);
            Ok(())
        }
    }

    #[derive(Default)]
    struct NeverConverges {
        calls: Cell<u32>,
    }

    impl PowerSampler for NeverConverges {
        fn sample(&self) -> Result<PowerReading> {
            self.calls.set(self.calls.get() + 1);
            Ok(PowerReading {
                pstate: PState::P0,
                watts: 120,
            })
        }
    }

    #[derive(Default)]
    struct ConvergesImmediately {
        calls: Cell<u32>,
    }

    impl PowerSampler for ConvergesImmediately {
        fn sample(&self) -> Result<PowerReading> {
            self.calls.set(self.calls.get() + 1);
            Ok(PowerReading {
                pstate: PState::P8,
                watts: 11,
            })
        }
    }

    struct FailingSampler;

    impl PowerSampler for FailingSampler {
        fn sample(&self) -> Result<PowerReading> {
            Err(SwitchError::Sample("tool not ready".to_string()))
        }
    }

    #[derive(Default)]
    struct SilentNotifier {
        notifications: Cell<u32>,
    }

    impl Notifier for SilentNotifier {
        fn notify(&self, _summary: &str, _body: &str) {
            self.notifications.set(self.notifications.get() + 1);
        }
    }

    struct FixedHolders(Vec<DeviceHolder>);

    impl HolderScan for FixedHolders {
        fn holders(&self, _device: &Path) -> Result<Vec<DeviceHolder>> {
            Ok(self.0.clone())
        }
    }

    fn tight_budget() -> RetryBudget {
        RetryBudget {
            attempts: 4,
            attempt_timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_host_switch_exhausts_attempt_budget() {
        let f = fixture("exhaust");
        let daemon = CountingDaemon::default();
        let sampler = NeverConverges::default();
        let notifier = SilentNotifier::default();
        let holders = FixedHolders(vec![]);
        let manager =
            SwitchManager::new(&f.config, &f.pci, &daemon, &sampler, &notifier, &holders);

        let outcome = manager
            .switch_to_host(Duration::ZERO, &tight_budget())
            .unwrap();

        assert_eq!(outcome, SwitchOutcome::Exhausted);
        assert_eq!(daemon.stops.get(), 4);
        assert_eq!(daemon.starts.get(), 4);
        assert!(sampler.calls.get() >= 4);
        // Exhaustion is reported, once
        assert_eq!(notifier.notifications.get(), 1);
        // The rebind to the host drivers still happened
        let bound = fs::read_to_string(f.drivers.join("nvidia/bind")).unwrap();
        assert_eq!(bound, "0000:01:00.0");
    }

    #[test]
    fn test_host_switch_early_success_skips_post_delay() {
        let f = fixture("early");
        let daemon = CountingDaemon::default();
        let sampler = ConvergesImmediately::default();
        let notifier = SilentNotifier::default();
        let holders = FixedHolders(vec![]);
        let manager =
            SwitchManager::new(&f.config, &f.pci, &daemon, &sampler, &notifier, &holders);

        let delay = Duration::from_millis(200);
        let started = Instant::now();
        let outcome = manager
            .switch_to_host(
                delay,
                &RetryBudget {
                    attempts: 4,
                    attempt_timeout: Duration::from_secs(5),
                    poll_interval: Duration::from_millis(200),
                },
            )
            .unwrap();
        let elapsed = started.elapsed();

        assert!(matches!(outcome, SwitchOutcome::Converged(_)));
        assert_eq!(daemon.stops.get(), 1);
        assert_eq!(daemon.starts.get(), 1);
        assert_eq!(sampler.calls.get(), 1);
        assert_eq!(notifier.notifications.get(), 1);
        // Pre-delay ran, post-delay did not
        assert!(elapsed >= delay);
        assert!(elapsed < delay * 2);
    }

    #[test]
    fn test_host_switch_sampling_failure_is_not_fatal() {
        let f = fixture("sample-fail");
        let daemon = CountingDaemon::default();
        let sampler = FailingSampler;
        let notifier = SilentNotifier::default();
        let holders = FixedHolders(vec![]);
        let manager =
            SwitchManager::new(&f.config, &f.pci, &daemon, &sampler, &notifier, &holders);

        let budget = RetryBudget {
            attempts: 1,
            attempt_timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(10),
        };
        let outcome = manager.switch_to_host(Duration::ZERO, &budget).unwrap();
        assert_eq!(outcome, SwitchOutcome::Exhausted);
    }

    #[test]
    fn test_host_switch_count_mismatch_before_any_binding() {
        let f = fixture("mismatch");
        // Third function appears, config still assigns two drivers
        let extra = f.devices.join("0000:01:00.2");
        fs::create_dir_all(&extra).unwrap();

        let daemon = CountingDaemon::default();
        let sampler = NeverConverges::default();
        let notifier = SilentNotifier::default();
        let holders = FixedHolders(vec![]);
        let manager =
            SwitchManager::new(&f.config, &f.pci, &daemon, &sampler, &notifier, &holders);

        let err = manager
            .switch_to_host(Duration::ZERO, &tight_budget())
            .unwrap_err();

        assert!(matches!(err, SwitchError::FunctionCountMismatch { .. }));
        assert_eq!(daemon.stops.get(), 0);
        let bound = fs::read_to_string(f.drivers.join("nvidia/bind")).unwrap();
        assert_eq!(bound, "");
    }

    #[test]
    fn test_passthrough_refuses_while_device_held() {
        let f = fixture("busy");
        let daemon = CountingDaemon::default();
        let sampler = NeverConverges::default();
        let notifier = SilentNotifier::default();
        let holders = FixedHolders(vec![DeviceHolder {
            pid: 4242,
            name: "qemu-system-x86".to_string(),
        }]);
        let manager =
            SwitchManager::new(&f.config, &f.pci, &daemon, &sampler, &notifier, &holders);

        let err = manager.switch_to_passthrough().unwrap_err();

        assert!(matches!(err, SwitchError::DeviceBusy(_)));
        assert_eq!(daemon.stops.get(), 0);
        let bound = fs::read_to_string(f.drivers.join("vfio-pci/bind")).unwrap();
        assert_eq!(bound, "");
    }

    #[test]
    fn test_passthrough_ignores_persistence_daemon_handle() {
        let f = fixture("persistenced");
        let daemon = CountingDaemon::default();
        let sampler = NeverConverges::default();
        let notifier = SilentNotifier::default();
        let holders = FixedHolders(vec![DeviceHolder {
            pid: 777,
            name: "nvidia-persiste".to_string(),
        }]);
        let manager =
            SwitchManager::new(&f.config, &f.pci, &daemon, &sampler, &notifier, &holders);

        manager.switch_to_passthrough().unwrap();

        assert_eq!(daemon.stops.get(), 1);
        assert_eq!(daemon.starts.get(), 1);
        let audio_override =
            fs::read_to_string(f.devices.join("0000:01:00.1/driver_override")).unwrap();
        assert_eq!(audio_override, "vfio-pci");
    }

    // The daemon must be down across every rebind in the passthrough
    // direction. The probing daemon reads the override file of the
    // first function at stop/start time to pin the ordering.
    struct ProbingDaemon {
        override_path: PathBuf,
        stopped_before_binds: Cell<bool>,
        started_after_binds: Cell<bool>,
    }

    impl DaemonControl for ProbingDaemon {
        fn stop(&self) -> Result<()> {
            let value = fs::read_to_string(&self.override_path).unwrap();
            self.stopped_before_binds.set(value.is_empty());
            Ok(())
        }
        fn start(&self) -> Result<()> {
            let value = fs::read_to_string(&self.override_path).unwrap();
            self.started_after_binds.set(value == "vfio-pci");
            Ok(())
        }
    }

    #[test]
    fn test_passthrough_daemon_brackets_the_rebinds() {
        let f = fixture("ordering");
        let daemon = ProbingDaemon {
            override_path: f.devices.join("0000:01:00.0/driver_override"),
            stopped_before_binds: Cell::new(false),
            started_after_binds: Cell::new(false),
        };
        let sampler = NeverConverges::default();
        let notifier = SilentNotifier::default();
        let holders = FixedHolders(vec![]);
        let manager =
            SwitchManager::new(&f.config, &f.pci, &daemon, &sampler, &notifier, &holders);

        manager.switch_to_passthrough().unwrap();

        assert!(daemon.stopped_before_binds.get());
        assert!(daemon.started_after_binds.get());
    }
}
