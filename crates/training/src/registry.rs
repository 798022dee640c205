//! Closed sets of component `type` tags, resolved once when the config is parsed.

use burn_dataset::SamplerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::{EvaluationConfig, SsodTestConfig, SsodTrainConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SamplerSpec {
    SemiBalanceSampler(SamplerConfig),
}

impl Default for SamplerSpec {
    fn default() -> Self {
        SamplerSpec::SemiBalanceSampler(SamplerConfig::default())
    }
}

impl SamplerSpec {
    pub fn config(&self) -> &SamplerConfig {
        match self {
            SamplerSpec::SemiBalanceSampler(cfg) => cfg,
        }
    }

    pub fn config_mut(&mut self) -> &mut SamplerConfig {
        match self {
            SamplerSpec::SemiBalanceSampler(cfg) => cfg,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WrapperSpec {
    DinoDetrSsod {
        #[serde(default)]
        train_cfg: SsodTrainConfig,
        #[serde(default)]
        test_cfg: SsodTestConfig,
    },
}

impl Default for WrapperSpec {
    fn default() -> Self {
        WrapperSpec::DinoDetrSsod {
            train_cfg: SsodTrainConfig::default(),
            test_cfg: SsodTestConfig::default(),
        }
    }
}

impl WrapperSpec {
    pub fn name(&self) -> &'static str {
        match self {
            WrapperSpec::DinoDetrSsod { .. } => "DinoDetrSsod",
        }
    }

    pub fn train_cfg(&self) -> &SsodTrainConfig {
        match self {
            WrapperSpec::DinoDetrSsod { train_cfg, .. } => train_cfg,
        }
    }

    pub fn test_cfg(&self) -> &SsodTestConfig {
        match self {
            WrapperSpec::DinoDetrSsod { test_cfg, .. } => test_cfg,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunnerSpec {
    IterBasedRunner {
        #[serde(default = "default_max_iters")]
        max_iters: usize,
    },
}

fn default_max_iters() -> usize {
    20_000
}

impl Default for RunnerSpec {
    fn default() -> Self {
        RunnerSpec::IterBasedRunner {
            max_iters: default_max_iters(),
        }
    }
}

impl RunnerSpec {
    pub fn max_iters(&self) -> usize {
        match self {
            RunnerSpec::IterBasedRunner { max_iters } => *max_iters,
        }
    }

    pub fn set_max_iters(&mut self, value: usize) {
        match self {
            RunnerSpec::IterBasedRunner { max_iters } => *max_iters = value,
        }
    }
}

/// `SubModulesDistEvalHook` scores student and teacher in one pass; `DistEvalHook` scores the
/// configured inference target only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EvaluationSpec {
    SubModulesDistEvalHook(EvaluationConfig),
    DistEvalHook(EvaluationConfig),
}

impl Default for EvaluationSpec {
    fn default() -> Self {
        EvaluationSpec::SubModulesDistEvalHook(EvaluationConfig::default())
    }
}

impl EvaluationSpec {
    pub fn config(&self) -> &EvaluationConfig {
        match self {
            EvaluationSpec::SubModulesDistEvalHook(cfg) | EvaluationSpec::DistEvalHook(cfg) => cfg,
        }
    }

    pub fn sub_modules(&self) -> bool {
        matches!(self, EvaluationSpec::SubModulesDistEvalHook(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HookSpec {
    NumClassCheckHook,
    TextLoggerHook {
        #[serde(default)]
        interval: Option<usize>,
    },
    StepRecord {
        #[serde(default)]
        normalize: bool,
        /// Relative paths resolve against the work dir.
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

impl HookSpec {
    pub fn name(&self) -> &'static str {
        match self {
            HookSpec::NumClassCheckHook => "NumClassCheckHook",
            HookSpec::TextLoggerHook { .. } => "TextLoggerHook",
            HookSpec::StepRecord { .. } => "StepRecord",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Hooks {
        custom_hooks: Vec<HookSpec>,
    }

    #[test]
    fn hook_tags_resolve() {
        let parsed: Hooks = toml::from_str(
            r#"
            [[custom_hooks]]
            type = "NumClassCheckHook"

            [[custom_hooks]]
            type = "StepRecord"
            normalize = false
            "#,
        )
        .unwrap();
        assert_eq!(parsed.custom_hooks.len(), 2);
        assert_eq!(parsed.custom_hooks[0], HookSpec::NumClassCheckHook);
        assert_eq!(parsed.custom_hooks[1].name(), "StepRecord");
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = toml::from_str::<Hooks>(
            r#"
            [[custom_hooks]]
            type = "EMAHook"
            "#,
        );
        assert!(err.is_err());
    }
}
