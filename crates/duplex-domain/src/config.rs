use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub vad: VadConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Speech planner bounds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "d_target_chars")]
    pub target_chars: usize,
    #[serde(default = "d_min_chars")]
    pub min_chars: usize,
    #[serde(default = "d_max_chars")]
    pub max_chars: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            target_chars: d_target_chars(),
            min_chars: d_min_chars(),
            max_chars: d_max_chars(),
        }
    }
}

fn d_target_chars() -> usize {
    80
}
fn d_min_chars() -> usize {
    40
}
fn d_max_chars() -> usize {
    150
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Voice activity detection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VadConfig {
    #[serde(default = "d_energy_threshold")]
    pub energy_threshold: f32,
    #[serde(default = "d_min_speech_frames")]
    pub min_speech_frames: u32,
    #[serde(default = "d_tts_cooldown_frames")]
    pub tts_cooldown_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: d_energy_threshold(),
            min_speech_frames: d_min_speech_frames(),
            tts_cooldown_frames: d_tts_cooldown_frames(),
        }
    }
}

fn d_energy_threshold() -> f32 {
    0.02
}
fn d_min_speech_frames() -> u32 {
    3
}
fn d_tts_cooldown_frames() -> u32 {
    5
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task registry caps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "d_cap_conversation")]
    pub conversation_cap: usize,
    #[serde(default = "d_cap_tool")]
    pub tool_cap: usize,
    #[serde(default = "d_cap_agent")]
    pub agent_cap: usize,
    #[serde(default = "d_cap_background")]
    pub background_cap: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            conversation_cap: d_cap_conversation(),
            tool_cap: d_cap_tool(),
            agent_cap: d_cap_agent(),
            background_cap: d_cap_background(),
        }
    }
}

fn d_cap_conversation() -> usize {
    2
}
fn d_cap_tool() -> usize {
    5
}
fn d_cap_agent() -> usize {
    10
}
fn d_cap_background() -> usize {
    20
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Deadline scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "d_max_workers")]
    pub max_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: d_max_workers(),
        }
    }
}

fn d_max_workers() -> usize {
    4
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Attention event bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "d_event_bus_capacity")]
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: d_event_bus_capacity(),
        }
    }
}

fn d_event_bus_capacity() -> usize {
    200
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session-level tunables
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "d_barge_in_cooldown_ms")]
    pub barge_in_cooldown_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            barge_in_cooldown_ms: d_barge_in_cooldown_ms(),
        }
    }
}

fn d_barge_in_cooldown_ms() -> u64 {
    500
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    pub fn load_or_default(path: &std::path::Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, path = %path.display(), "failed to parse config, using defaults");
                Self::default()
            }),
            Err(e) => {
                tracing::info!(error = %e, path = %path.display(), "no config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if !(self.planner.min_chars < self.planner.target_chars
            && self.planner.target_chars < self.planner.max_chars)
        {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "planner".into(),
                message: format!(
                    "min_chars < target_chars < max_chars must hold (got {}, {}, {})",
                    self.planner.min_chars, self.planner.target_chars, self.planner.max_chars
                ),
            });
        }

        if self.vad.energy_threshold <= 0.0 || self.vad.energy_threshold >= 1.0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "vad.energy_threshold".into(),
                message: "energy_threshold must be in (0.0, 1.0)".into(),
            });
        }

        if self.vad.min_speech_frames == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "vad.min_speech_frames".into(),
                message: "min_speech_frames must be at least 1".into(),
            });
        }

        for (field, cap) in [
            ("registry.conversation_cap", self.registry.conversation_cap),
            ("registry.tool_cap", self.registry.tool_cap),
            ("registry.agent_cap", self.registry.agent_cap),
            ("registry.background_cap", self.registry.background_cap),
        ] {
            if cap == 0 {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: field.into(),
                    message: "category cap must be greater than 0".into(),
                });
            }
        }

        if self.scheduler.max_workers == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "scheduler.max_workers".into(),
                message: "max_workers must be greater than 0".into(),
            });
        }

        if self.event_bus.capacity == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "event_bus.capacity".into(),
                message: "capacity must be greater than 0".into(),
            });
        }

        if self.event_bus.capacity < 10 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "event_bus.capacity".into(),
                message: "a capacity below 10 will drop events under light background load".into(),
            });
        }

        errors
    }
}
