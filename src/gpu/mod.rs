// GPU power state model for vfio-switch
//
// This module defines the performance state enumeration, the power
// reading produced by each sample, and the convergence policy that
// decides when the card has settled into its low-power idle state.

pub mod sampler;

use std::fmt;

/// Performance state the card must reach before the host switch is
/// considered complete. P8 is the deepest idle state the NVIDIA driver
/// reports for a discrete card with no workload.
pub const TARGET_PSTATE: PState = PState::P8;

/// Power draw ceiling in watts for the idle target. The reference card
/// idles around 11 W once the driver has fully settled.
pub const POWER_CEILING_WATTS: u32 = 15;

/// Performance states reported by the NVIDIA driver
///
/// The driver only ever emits a small set of labels, so unknown text is
/// kept as `Unrecognized` instead of being accepted silently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PState {
    P0,
    P1,
    P2,
    P3,
    P4,
    P5,
    P6,
    P7,
    P8,
    P10,
    P12,
    Unrecognized(String),
}

impl PState {
    /// Parses a performance state label as printed by the vendor tool
    pub fn parse(label: &str) -> PState {
        match label.trim() {
            "P0" => PState::P0,
            "P1" => PState::P1,
            "P2" => PState::P2,
            "P3" => PState::P3,
            "P4" => PState::P4,
            "P5" => PState::P5,
            "P6" => PState::P6,
            "P7" => PState::P7,
            "P8" => PState::P8,
            "P10" => PState::P10,
            "P12" => PState::P12,
            other => PState::Unrecognized(other.to_string()),
        }
    }
}

impl fmt::Display for PState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PState::P0 => write!(f, "P0"),
            PState::P1 => write!(f, "P1"),
            PState::P2 => write!(f, "P2"),
            PState::P3 => write!(f, "P3"),
            PState::P4 => write!(f, "P4"),
            PState::P5 => write!(f, "P5"),
            PState::P6 => write!(f, "P6"),
            PState::P7 => write!(f, "P7"),
            PState::P8 => write!(f, "P8"),
            PState::P10 => write!(f, "P10"),
            PState::P12 => write!(f, "P12"),
            PState::Unrecognized(label) => write!(f, "{}", label),
        }
    }
}

/// One sample of the device's power state
///
/// Produced fresh on every poll iteration and discarded afterwards;
/// nothing is persisted between samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerReading {
    pub pstate: PState,
    /// Power draw in watts, truncated from the tool's decimal figure
    pub watts: u32,
}

/// Returns true when the card has reached the idle target
pub fn is_converged(reading: &PowerReading) -> bool {
    reading.pstate == TARGET_PSTATE && reading.watts <= POWER_CEILING_WATTS
}
