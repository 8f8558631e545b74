//! Runtime configuration - flat serde records loaded from JSON.

use crate::error::{Error, Result};
use crate::stage::StageIdentifier;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-run workspace; execution dirs are created under `<workspace_dir>/executions`.
    pub workspace_dir: PathBuf,
    pub log_level: String,
    /// Abort early if fewer GPUs are visible.
    pub min_num_gpus: usize,
    pub exec: ExecConfig,
    pub agent: AgentConfig,
    pub experiment: ExperimentConfig,
    pub report: ModelConfig,
    pub telemetry: TelemetryConfig,
    pub generate_report: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("workspace"),
            log_level: "info".to_string(),
            min_num_gpus: 0,
            exec: ExecConfig::default(),
            agent: AgentConfig::default(),
            experiment: ExperimentConfig::default(),
            report: ModelConfig::default(),
            telemetry: TelemetryConfig::default(),
            generate_report: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Per-node wall clock in seconds; also passed to the Codex CLI.
    pub timeout_secs: u64,
    /// Name of the Python file Codex is expected to overwrite.
    pub agent_file_name: String,
    /// Codex CLI argv prefix; the rendered task markdown is appended.
    pub codex_argv: Vec<String>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            agent_file_name: "experiment.py".to_string(),
            codex_argv: ["codex", "exec", "--yolo", "--skip-git-repo-check", "--json"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Max concurrent node attempts per sub-stage.
    pub num_workers: usize,
    pub k_fold_validation: Option<u32>,
    pub search: SearchConfig,
    pub stages: StageIterConfig,
    pub multi_seed_eval: MultiSeedConfig,
    pub code: ModelConfig,
    pub feedback: ModelConfig,
    pub vlm_feedback: ModelConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            k_fold_validation: None,
            search: SearchConfig::default(),
            stages: StageIterConfig::default(),
            multi_seed_eval: MultiSeedConfig::default(),
            code: ModelConfig::default(),
            feedback: ModelConfig::default(),
            vlm_feedback: ModelConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Draft nodes required before debug/improve kick in.
    pub num_drafts: usize,
    /// Probability of picking a buggy leaf per iteration.
    pub debug_prob: f64,
    /// Hard cap on consecutive debug attempts.
    pub max_debug_depth: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            num_drafts: 3,
            debug_prob: 0.5,
            max_debug_depth: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StageIterConfig {
    pub stage1_max_iters: usize,
    pub stage2_max_iters: usize,
    pub stage3_max_iters: usize,
    pub stage4_max_iters: usize,
}

impl Default for StageIterConfig {
    fn default() -> Self {
        Self {
            stage1_max_iters: 20,
            stage2_max_iters: 12,
            stage3_max_iters: 12,
            stage4_max_iters: 18,
        }
    }
}

impl StageIterConfig {
    pub fn max_iters_for(&self, stage: StageIdentifier) -> usize {
        match stage {
            StageIdentifier::Stage1 => self.stage1_max_iters,
            StageIdentifier::Stage2 => self.stage2_max_iters,
            StageIdentifier::Stage3 => self.stage3_max_iters,
            StageIdentifier::Stage4 => self.stage4_max_iters,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiSeedConfig {
    /// Seeds per main-stage multi-seed pass.
    pub num_seeds: u32,
}

impl Default for MultiSeedConfig {
    fn default() -> Self {
        Self { num_seeds: 3 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model: String,
    pub temperature: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            temperature: 1.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Identifier threaded into every event and webhook path.
    pub run_id: String,
    pub base_url: String,
    pub token: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            run_id: String::new(),
            base_url: String::new(),
            token: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Hint passed into the Codex task markdown.
    pub num_syn_datasets: u32,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self { num_syn_datasets: 1 }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Config = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject contract breaches that would make the run meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.agent.num_workers == 0 {
            return Err(Error::config("agent.num_workers must be at least 1"));
        }
        if self.exec.timeout_secs == 0 {
            return Err(Error::config("exec.timeout_secs must be positive"));
        }
        if self.agent.search.debug_prob < 0.0 || self.agent.search.debug_prob > 1.0 {
            return Err(Error::config("agent.search.debug_prob must be in [0, 1]"));
        }
        Ok(())
    }

    /// `<workspace_dir>/../logs/<run_name>` - the per-run logs directory.
    pub fn run_logs_dir(&self) -> PathBuf {
        let run_name = self
            .workspace_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "run".to_string());
        let base = self
            .workspace_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("logs").join(run_name)
    }
}
