// Device state sampling for vfio-switch
//
// Queries nvidia-smi for the card's current performance state and
// instantaneous power draw and parses the textual reply into a
// structured reading.

use regex::Regex;
use tracing::debug;

use crate::error::{Result, SwitchError};
use crate::gpu::{PState, PowerReading};
use crate::utils::run_command;

/// Source of power readings for the convergence loop
pub trait PowerSampler {
    fn sample(&self) -> Result<PowerReading>;
}

/// Samples the device through the nvidia-smi query interface
pub struct SmiSampler {
    /// Identifier passed to `nvidia-smi -i` (PCI bus id or index)
    query_id: String,
}

impl SmiSampler {
    pub fn new(query_id: &str) -> Self {
        Self {
            query_id: query_id.to_string(),
        }
    }
}

impl PowerSampler for SmiSampler {
    fn sample(&self) -> Result<PowerReading> {
        let raw = run_command(
            "nvidia-smi",
            &[
                "--query-gpu=pstate,power.draw",
                "--format=csv,noheader",
                "-i",
                &self.query_id,
            ],
        )?;

        let reading = parse_reading(&raw)?;
        debug!(raw = %raw.trim(), pstate = %reading.pstate, watts = reading.watts, "sampled device state");
        Ok(reading)
    }
}

/// Parses one `pstate, power.draw` line as emitted by nvidia-smi,
/// e.g. `P8, 11.40 W`.
///
/// The performance state is the first comma-delimited field verbatim.
/// The power figure is the integer part of the `NN.NN W` pattern; output
/// without that pattern (driver not ready, "[N/A]") is a sampling
/// failure, never a zero reading.
pub fn parse_reading(raw: &str) -> Result<PowerReading> {
    let mut fields = raw.splitn(2, ',');

    let pstate_field = fields
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SwitchError::Sample(format!("no performance state in {:?}", raw)))?;
    let rest = fields
        .next()
        .ok_or_else(|| SwitchError::Sample(format!("no power draw field in {:?}", raw)))?;

    let watts_re = Regex::new(r"(\d+)\.\d+ W")
        .map_err(|e| SwitchError::Sample(format!("watt pattern error: {}", e)))?;
    let watts = watts_re
        .captures(rest)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .ok_or_else(|| SwitchError::Sample(format!("no wattage figure in {:?}", raw)))?;

    Ok(PowerReading {
        pstate: PState::parse(pstate_field),
        watts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_idle_reading() {
        let reading = parse_reading("P8, 11.40 W").unwrap();
        assert_eq!(reading.pstate, PState::P8);
        assert_eq!(reading.watts, 11);
    }

    #[test]
    fn test_parse_active_reading() {
        let reading = parse_reading("P0, 120.00 W").unwrap();
        assert_eq!(reading.pstate, PState::P0);
        assert_eq!(reading.watts, 120);
    }

    #[test]
    fn test_parse_trims_trailing_newline() {
        let reading = parse_reading("P2, 54.07 W\n").unwrap();
        assert_eq!(reading.pstate, PState::P2);
        assert_eq!(reading.watts, 54);
    }

    #[test]
    fn test_parse_unknown_pstate_is_kept_not_dropped() {
        let reading = parse_reading("P15, 9.80 W").unwrap();
        assert_eq!(reading.pstate, PState::Unrecognized("P15".to_string()));
        assert_eq!(reading.watts, 9);
    }

    #[test]
    fn test_missing_wattage_is_a_failure_not_zero() {
        let err = parse_reading("P8, [N/A]").unwrap_err();
        assert!(matches!(err, SwitchError::Sample(_)));
    }

    #[test]
    fn test_garbage_output_is_a_failure() {
        assert!(parse_reading("No devices were found").is_err());
        assert!(parse_reading("").is_err());
    }

    #[test]
    fn test_integer_only_wattage_does_not_match() {
        // The tool always prints a decimal point; a bare integer means
        // we are looking at something else entirely.
        assert!(parse_reading("P8, 11 W").is_err());
    }
}
