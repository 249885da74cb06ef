//! Hybrid ratio controller.
//!
//! Decides how many of `n` independent modexp jobs go to the accelerator.
//! The controller is pure: it reads a [`HybridConfig`] and never blocks.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, offload::OperationKind};

/// Workload size at or below which offload overhead dominates.
pub const DEFAULT_WORKLOAD_THRESHOLD: usize = 128;

/// Policy governing the software/hardware split of modexp work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HybridMode {
    /// Everything is computed in software.
    #[default]
    Off,
    /// Ratio chosen per call from the workload size and operation kind.
    Optimal,
    /// Fixed hardware share in percent (`QAT` is 100, `PREF_QAT90` is 90).
    Fixed(u8),
}

impl fmt::Display for HybridMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HybridMode::Off => write!(f, "OFF"),
            HybridMode::Optimal => write!(f, "OPTIMAL"),
            HybridMode::Fixed(100) => write!(f, "QAT"),
            HybridMode::Fixed(percent) => write!(f, "PREF_QAT{percent}"),
        }
    }
}

impl FromStr for HybridMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.as_str() {
            "OFF" | "IPP" => Ok(HybridMode::Off),
            "OPTIMAL" => Ok(HybridMode::Optimal),
            "QAT" => Ok(HybridMode::Fixed(100)),
            other => other
                .strip_prefix("PREF_QAT")
                .and_then(|p| p.parse::<u8>().ok())
                .filter(|p| *p <= 100)
                .map(HybridMode::Fixed)
                .ok_or_else(|| ConfigError::UnknownMode(s.to_string())),
        }
    }
}

/// Process-wide hybrid settings, read by the controller at call time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    pub mode: HybridMode,
    pub workload_threshold: usize,
    /// Hardware share for workloads at or below `workload_threshold`.
    pub small_workload_ratio: f32,
    pub encrypt_ratio: f32,
    pub decrypt_ratio: f32,
    pub multiply_ratio: f32,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            mode: HybridMode::Off,
            workload_threshold: DEFAULT_WORKLOAD_THRESHOLD,
            small_workload_ratio: 0.0,
            encrypt_ratio: 0.75,
            decrypt_ratio: 0.75,
            multiply_ratio: 0.80,
        }
    }
}

impl HybridConfig {
    pub fn with_mode(mut self, mode: HybridMode) -> Self {
        self.mode = mode;
        self
    }

    fn large_workload_ratio(&self, kind: OperationKind) -> f32 {
        match kind {
            OperationKind::Encrypt => self.encrypt_ratio,
            OperationKind::Decrypt => self.decrypt_ratio,
            OperationKind::Multiply => self.multiply_ratio,
        }
    }

    /// Number of the `n` jobs routed to hardware; always in `0..=n`.
    pub fn hardware_share(&self, n: usize, kind: OperationKind) -> usize {
        match self.mode {
            HybridMode::Off => 0,
            HybridMode::Fixed(percent) => n * usize::from(percent.min(100)) / 100,
            HybridMode::Optimal => {
                let ratio = if n <= self.workload_threshold {
                    self.small_workload_ratio
                } else {
                    self.large_workload_ratio(kind)
                };
                share_of(n, ratio)
            }
        }
    }
}

fn share_of(n: usize, ratio: f32) -> usize {
    if !ratio.is_finite() {
        return 0;
    }
    let ratio = f64::from(ratio.clamp(0.0, 1.0));
    ((n as f64 * ratio).floor() as usize).min(n)
}
