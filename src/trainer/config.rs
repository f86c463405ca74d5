//! Run configuration, training layout and metrics

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::distributed::{ShardPlan, ShardSpec, ShardingStage1};
use crate::error::{Error, Result};
use crate::nn::LossKind;
use crate::optimizer::{AdamW, AdamWConfig, Optimizer, Sgd, SgdConfig};

/// Compute backend. Only the CPU backend exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Cpu,
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Backend::Cpu),
            other => Err(Error::Configuration {
                reason: format!("backend '{other}' is not available; only 'cpu' is supported"),
            }),
        }
    }
}

/// Which base optimizer the run wraps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    #[serde(rename = "adamw")]
    AdamW,
    Sgd,
}

/// Run-wide settings, fixed before the first step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub seed: u64,
    pub backend: Backend,
    pub steps: usize,
    /// Upper bound a collective may wait for its peers.
    pub collective_timeout_ms: u64,
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// SGD momentum; ignored by AdamW.
    pub momentum: f64,
    pub max_grad_norm: Option<f64>,
    pub log_level: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 2024,
            backend: Backend::Cpu,
            steps: 5,
            collective_timeout_ms: 30_000,
            optimizer: OptimizerKind::AdamW,
            learning_rate: 1e-3,
            weight_decay: 0.01,
            momentum: 0.0,
            max_grad_norm: None,
            log_level: "info".to_string(),
        }
    }
}

impl RunConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `SHARDOPT_SEED`, `SHARDOPT_BACKEND`,
    /// `SHARDOPT_STEPS` and `SHARDOPT_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SHARDOPT_SEED") {
            self.seed = parse_var("SHARDOPT_SEED", &v)?;
        }
        if let Some(v) = lookup("SHARDOPT_BACKEND") {
            self.backend = v.parse()?;
        }
        if let Some(v) = lookup("SHARDOPT_STEPS") {
            self.steps = parse_var("SHARDOPT_STEPS", &v)?;
        }
        if let Some(v) = lookup("SHARDOPT_TIMEOUT_MS") {
            self.collective_timeout_ms = parse_var("SHARDOPT_TIMEOUT_MS", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.collective_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerKind) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_lr(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_weight_decay(mut self, wd: f64) -> Self {
        self.weight_decay = wd;
        self
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_max_grad_norm(mut self, norm: Option<f64>) -> Self {
        self.max_grad_norm = norm;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn collective_timeout(&self) -> Duration {
        Duration::from_millis(self.collective_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.steps == 0 {
            return Err(Error::config("steps must be at least 1"));
        }
        if self.collective_timeout_ms == 0 {
            return Err(Error::config("collective_timeout_ms must be positive"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::Configuration {
                reason: format!("learning_rate must be positive, got {}", self.learning_rate),
            });
        }
        if !(self.weight_decay >= 0.0) {
            return Err(Error::Configuration {
                reason: format!("weight_decay must be non-negative, got {}", self.weight_decay),
            });
        }
        if !(self.momentum >= 0.0) {
            return Err(Error::Configuration {
                reason: format!("momentum must be non-negative, got {}", self.momentum),
            });
        }
        if let Some(norm) = self.max_grad_norm {
            if !(norm > 0.0) {
                return Err(Error::Configuration {
                    reason: format!("max_grad_norm must be positive, got {norm}"),
                });
            }
        }
        Ok(())
    }

    /// Fresh base optimizer with this run's hyperparameters.
    pub fn build_optimizer(&self) -> Result<Box<dyn Optimizer + Send>> {
        Ok(match self.optimizer {
            OptimizerKind::AdamW => Box::new(AdamW::new(AdamWConfig {
                lr: self.learning_rate,
                weight_decay: self.weight_decay,
                ..AdamWConfig::default()
            })),
            OptimizerKind::Sgd => Box::new(Sgd::new(SgdConfig {
                lr: self.learning_rate,
                momentum: self.momentum,
                weight_decay: self.weight_decay,
                ..SgdConfig::default()
            })?),
        })
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| Error::Configuration {
        reason: format!("invalid {key}='{value}': {e}"),
    })
}

/// Model shape, mesh and sharding choices for one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainLayout {
    pub in_features: usize,
    pub out_features: usize,
    pub batch_size: usize,
    pub mesh_shape: Vec<usize>,
    pub mesh_dims: Vec<String>,
    pub plan: ShardPlan,
    /// Mesh dimension the input batch is split along; `None` replicates it.
    pub batch_dim: Option<String>,
    pub strategy: ShardingStage1,
    pub loss: LossKind,
}

impl TrainLayout {
    /// 10x10 linear on a 2x2 `["x", "y"]` mesh: weight columns split over
    /// "x", bias split over "y", full batch on every worker, sum loss.
    pub fn linear_2x2() -> Self {
        Self {
            in_features: 10,
            out_features: 10,
            batch_size: 10,
            mesh_shape: vec![2, 2],
            mesh_dims: vec!["x".to_string(), "y".to_string()],
            plan: ShardPlan::new()
                .with("weight", ShardSpec::shard(1, "x"))
                .with("bias", ShardSpec::shard(0, "y")),
            batch_dim: None,
            strategy: ShardingStage1::new(),
            loss: LossKind::Sum,
        }
    }

    /// [`linear_2x2`](Self::linear_2x2) with the input batch rows split over
    /// "x" as well, the layout the reference script trains with.
    pub fn linear_2x2_batch_sharded() -> Self {
        Self::linear_2x2().with_batch_dim(Some("x"))
    }

    pub fn with_mesh(mut self, shape: &[usize], dims: &[&str]) -> Self {
        self.mesh_shape = shape.to_vec();
        self.mesh_dims = dims.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_plan(mut self, plan: ShardPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_batch_dim(mut self, dim: Option<&str>) -> Self {
        self.batch_dim = dim.map(String::from);
        self
    }

    pub fn with_strategy(mut self, strategy: ShardingStage1) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_loss(mut self, loss: LossKind) -> Self {
        self.loss = loss;
        self
    }
}

/// Metrics from a training step
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingMetrics {
    pub step: u64,
    pub loss: f64,
    pub grad_norm: Option<f64>,
    pub lr: f64,
}
