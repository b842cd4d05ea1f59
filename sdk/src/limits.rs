//! Resource limits, presets and usage samples

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const MEMORY_MB_RANGE: (u64, u64) = (1, 65_536);
pub const CPU_PERCENT_RANGE: (u64, u64) = (1, 100);
pub const MAX_NETWORK_BYTES: u64 = 10 * 1024 * 1024 * 1024;
pub const EXECUTION_MS_RANGE: (u64, u64) = (100, 600_000);
pub const CONCURRENCY_RANGE: (u64, u64) = (1, 256);

/// Upper bounds applied to one plugin instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub max_memory_mb: u64,
    pub max_cpu_percent: u64,
    /// Network bytes allowed per recorded sample window
    pub max_network_bytes: u64,
    pub max_execution_ms: u64,
    pub max_concurrent_calls: u32,
}

impl ResourceLimits {
    /// Describe every bound this value violates
    pub fn bound_violations(&self) -> Vec<String> {
        let mut errors = Vec::new();
        check_range(
            &mut errors,
            "maxMemoryMb",
            self.max_memory_mb,
            MEMORY_MB_RANGE,
        );
        check_range(
            &mut errors,
            "maxCpuPercent",
            self.max_cpu_percent,
            CPU_PERCENT_RANGE,
        );
        if self.max_network_bytes > MAX_NETWORK_BYTES {
            errors.push(format!(
                "resourceLimits.maxNetworkBytes must be at most {}",
                MAX_NETWORK_BYTES
            ));
        }
        check_range(
            &mut errors,
            "maxExecutionMs",
            self.max_execution_ms,
            EXECUTION_MS_RANGE,
        );
        check_range(
            &mut errors,
            "maxConcurrentCalls",
            u64::from(self.max_concurrent_calls),
            CONCURRENCY_RANGE,
        );
        errors
    }

    /// Component-wise minimum of `self` and `ceiling`
    pub fn clamp_to(&self, ceiling: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            max_memory_mb: self.max_memory_mb.min(ceiling.max_memory_mb),
            max_cpu_percent: self.max_cpu_percent.min(ceiling.max_cpu_percent),
            max_network_bytes: self.max_network_bytes.min(ceiling.max_network_bytes),
            max_execution_ms: self.max_execution_ms.min(ceiling.max_execution_ms),
            max_concurrent_calls: self.max_concurrent_calls.min(ceiling.max_concurrent_calls),
        }
    }

    /// Dimensions of `sample` that are over these limits
    pub fn exceeded_by(&self, sample: &ResourceSample) -> Vec<ResourceDimension> {
        let mut exceeded = Vec::new();
        if sample.memory_mb > self.max_memory_mb as f64 {
            exceeded.push(ResourceDimension::Memory);
        }
        if sample.cpu_pct > self.max_cpu_percent as f64 {
            exceeded.push(ResourceDimension::Cpu);
        }
        if sample.network_bytes > self.max_network_bytes {
            exceeded.push(ResourceDimension::Network);
        }
        exceeded
    }
}

fn check_range(errors: &mut Vec<String>, field: &str, value: u64, (min, max): (u64, u64)) {
    if value < min || value > max {
        errors.push(format!(
            "resourceLimits.{} must be between {} and {}, got {}",
            field, min, max, value
        ));
    }
}

/// Named limit bundles a manifest may refer to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourcePreset {
    Minimal,
    Standard,
    Performance,
    Unrestricted,
}

impl ResourcePreset {
    pub const ALL: [ResourcePreset; 4] = [
        ResourcePreset::Minimal,
        ResourcePreset::Standard,
        ResourcePreset::Performance,
        ResourcePreset::Unrestricted,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Standard => "standard",
            Self::Performance => "performance",
            Self::Unrestricted => "unrestricted",
        }
    }

    pub const fn limits(self) -> ResourceLimits {
        match self {
            Self::Minimal => ResourceLimits {
                max_memory_mb: 64,
                max_cpu_percent: 10,
                max_network_bytes: 1024 * 1024,
                max_execution_ms: 5_000,
                max_concurrent_calls: 1,
            },
            Self::Standard => ResourceLimits {
                max_memory_mb: 256,
                max_cpu_percent: 25,
                max_network_bytes: 10 * 1024 * 1024,
                max_execution_ms: 30_000,
                max_concurrent_calls: 4,
            },
            Self::Performance => ResourceLimits {
                max_memory_mb: 1024,
                max_cpu_percent: 50,
                max_network_bytes: 100 * 1024 * 1024,
                max_execution_ms: 120_000,
                max_concurrent_calls: 16,
            },
            Self::Unrestricted => ResourceLimits {
                max_memory_mb: MEMORY_MB_RANGE.1,
                max_cpu_percent: CPU_PERCENT_RANGE.1,
                max_network_bytes: MAX_NETWORK_BYTES,
                max_execution_ms: EXECUTION_MS_RANGE.1,
                max_concurrent_calls: CONCURRENCY_RANGE.1 as u32,
            },
        }
    }
}

impl fmt::Display for ResourcePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResourcePreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourcePreset::ALL
            .iter()
            .copied()
            .find(|p| p.name() == s)
            .ok_or_else(|| format!("unknown resource preset '{}'", s))
    }
}

/// Limits as declared in a manifest: a preset name or explicit numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LimitsSpec {
    Preset(ResourcePreset),
    Custom(ResourceLimits),
}

impl LimitsSpec {
    pub fn resolve(&self) -> ResourceLimits {
        match self {
            Self::Preset(preset) => preset.limits(),
            Self::Custom(limits) => *limits,
        }
    }
}

/// Dimension of resource usage that can breach a limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceDimension {
    Memory,
    Cpu,
    Network,
    ExecutionTime,
    Concurrency,
}

impl ResourceDimension {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Network => "network",
            Self::ExecutionTime => "execution_time",
            Self::Concurrency => "concurrency",
        }
    }
}

impl fmt::Display for ResourceDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One usage measurement reported by the execution substrate
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSample {
    pub cpu_pct: f64,
    pub memory_mb: f64,
    pub network_bytes: u64,
}
