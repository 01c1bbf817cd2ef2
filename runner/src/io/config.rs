//! Runner configuration (`qa-runner.toml`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::metrics::RewardConfig;
use crate::core::resolver::DEFAULT_LOWER_REGION_Y;
use crate::core::termination::DEFAULT_MAX_STEPS;
use crate::core::test_spec::CaseConfig;

/// Runner configuration (TOML).
///
/// Edited by humans; missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Hard ceiling on steps per run.
    pub max_steps: u32,

    /// Bounded wait for each device call, in seconds.
    pub step_timeout_secs: u64,

    /// Retries after the first failed device attempt.
    pub device_retries: u32,

    /// Backoff before the first retry; doubled for each further retry.
    pub retry_backoff_ms: u64,

    /// Resolver tie-break threshold in device pixels.
    pub lower_region_y: i32,

    /// Model the keyboard popup that appears after focusing an input.
    pub popup_after_focus: bool,

    /// History entries shown to the proposer.
    pub history_window: usize,

    pub reward: RewardConfig,
    pub device: DeviceConfig,
    pub proposer: ProposerConfig,
    pub evaluator: EvaluatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub adb_path: String,
    /// Target device serial; `None` lets adb pick the only attached device.
    pub serial: Option<String>,
    /// Truncate adb stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Pause after each action so the UI can settle before the next capture.
    pub settle_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            serial: None,
            output_limit_bytes: 1_000_000,
            settle_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProposerConfig {
    /// Command that reads a prompt on stdin and prints one JSON proposal.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 120,
            output_limit_bytes: 100_000,
        }
    }
}

/// Final evaluator run once per run after the loop ends. An empty command
/// leaves the runner's own verdict in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Command that reads a prompt on stdin and prints one JSON evaluation.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl EvaluatorConfig {
    pub fn is_enabled(&self) -> bool {
        !self.command.is_empty()
    }
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 120,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            step_timeout_secs: 30,
            device_retries: 2,
            retry_backoff_ms: 500,
            lower_region_y: DEFAULT_LOWER_REGION_Y,
            popup_after_focus: false,
            history_window: 5,
            reward: RewardConfig::default(),
            device: DeviceConfig::default(),
            proposer: ProposerConfig::default(),
            evaluator: EvaluatorConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        if self.step_timeout_secs == 0 {
            return Err(anyhow!("step_timeout_secs must be > 0"));
        }
        if self.lower_region_y < 0 {
            return Err(anyhow!("lower_region_y must be >= 0"));
        }
        let reward = &self.reward;
        if !reward.step_penalty.is_finite() || reward.step_penalty > 0.0 {
            return Err(anyhow!("reward.step_penalty must be <= 0"));
        }
        if !reward.subgoal_reward.is_finite() || reward.subgoal_reward < 0.0 {
            return Err(anyhow!("reward.subgoal_reward must be >= 0"));
        }
        if !reward.completion_bonus.is_finite() || reward.completion_bonus <= 0.0 {
            return Err(anyhow!("reward.completion_bonus must be > 0"));
        }
        if self.device.adb_path.trim().is_empty() {
            return Err(anyhow!("device.adb_path must be non-empty"));
        }
        if self.device.output_limit_bytes == 0 {
            return Err(anyhow!("device.output_limit_bytes must be > 0"));
        }
        if self.proposer.timeout_secs == 0 {
            return Err(anyhow!("proposer.timeout_secs must be > 0"));
        }
        if self.proposer.output_limit_bytes == 0 {
            return Err(anyhow!("proposer.output_limit_bytes must be > 0"));
        }
        if let Some(program) = self.proposer.command.first()
            && program.trim().is_empty()
        {
            return Err(anyhow!("proposer.command[0] must be non-empty"));
        }
        if self.evaluator.timeout_secs == 0 {
            return Err(anyhow!("evaluator.timeout_secs must be > 0"));
        }
        if self.evaluator.output_limit_bytes == 0 {
            return Err(anyhow!("evaluator.output_limit_bytes must be > 0"));
        }
        if let Some(program) = self.evaluator.command.first()
            && program.trim().is_empty()
        {
            return Err(anyhow!("evaluator.command[0] must be non-empty"));
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// Backoff before retry number `retry` (1-based).
    pub fn retry_backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Apply case configuration overrides on top of `base`.
pub fn apply_case_config(mut base: RunnerConfig, overrides: &CaseConfig) -> Result<RunnerConfig> {
    if let Some(max_steps) = overrides.max_steps {
        base.max_steps = max_steps;
    }
    if let Some(popup) = overrides.popup_after_focus {
        base.popup_after_focus = popup;
    }
    base.validate()?;
    Ok(base)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::write_atomic(path, &buf)
}
