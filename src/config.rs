//! Engine-wide tunables, built through a validating [`ConfigBuilder`] so an
//! inconsistent [`Config`] (e.g. `min_blength > max_blength`) can never reach the
//! placement or SPR code.
use crate::error::ConfigError;
use crate::model::ModelPreset;

/// Validated, immutable engine configuration. See the builder for defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub min_blength: f64,
    pub max_blength: f64,
    pub default_blength: f64,
    pub min_blength_mid: f64,
    pub min_improvement: f64,
    pub min_spr_improvement: f64,
    pub min_total_improvement: f64,
    pub max_spr_sweeps: usize,
    pub model_preset: ModelPreset,
    pub pseudocount_update_interval: usize,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// `default_blength` depends on the genome length (`0.1 / L`), so the builder
    /// exposes this helper rather than hard-coding a genome-length-independent default.
    pub fn default_blength_for(genome_length: usize) -> f64 {
        0.1 / (genome_length.max(1) as f64)
    }
}

/// The builder for a [`Config`]. Every field has the documented default; call
/// `with_*` to override before `build()`.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    min_blength: f64,
    max_blength: f64,
    default_blength: Option<f64>,
    min_blength_mid: f64,
    min_improvement: f64,
    min_spr_improvement: f64,
    min_total_improvement: f64,
    max_spr_sweeps: usize,
    model_preset: ModelPreset,
    pseudocount_update_interval: usize,
    genome_length: Option<usize>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            min_blength: 1e-9,
            max_blength: 1.0,
            default_blength: None,
            min_blength_mid: 1e-6,
            min_improvement: 0.1,
            min_spr_improvement: 0.1,
            min_total_improvement: 1.0,
            max_spr_sweeps: 20,
            model_preset: ModelPreset::Gtr,
            pseudocount_update_interval: 100,
            genome_length: None,
        }
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_blength(mut self, v: f64) -> Self {
        self.min_blength = v;
        self
    }
    pub fn with_max_blength(mut self, v: f64) -> Self {
        self.max_blength = v;
        self
    }
    pub fn with_default_blength(mut self, v: f64) -> Self {
        self.default_blength = Some(v);
        self
    }
    /// Sets `default_blength` to `0.1 / genome_length`, the documented default, for a
    /// genome of the given length. Ignored if `with_default_blength` is also called.
    pub fn with_genome_length(mut self, genome_length: usize) -> Self {
        self.genome_length = Some(genome_length);
        self
    }
    pub fn with_min_blength_mid(mut self, v: f64) -> Self {
        self.min_blength_mid = v;
        self
    }
    pub fn with_min_improvement(mut self, v: f64) -> Self {
        self.min_improvement = v;
        self
    }
    pub fn with_min_spr_improvement(mut self, v: f64) -> Self {
        self.min_spr_improvement = v;
        self
    }
    pub fn with_min_total_improvement(mut self, v: f64) -> Self {
        self.min_total_improvement = v;
        self
    }
    pub fn with_max_spr_sweeps(mut self, v: usize) -> Self {
        self.max_spr_sweeps = v;
        self
    }
    pub fn with_model_preset(mut self, v: ModelPreset) -> Self {
        self.model_preset = v;
        self
    }
    pub fn with_pseudocount_update_interval(mut self, v: usize) -> Self {
        self.pseudocount_update_interval = v;
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        if self.min_blength <= 0.0 {
            return Err(ConfigError("min_blength must be strictly positive"));
        }
        if self.max_blength <= self.min_blength {
            return Err(ConfigError("max_blength must exceed min_blength"));
        }
        if self.min_blength_mid <= 0.0 {
            return Err(ConfigError("min_blength_mid must be strictly positive"));
        }
        if self.min_improvement < 0.0
            || self.min_spr_improvement < 0.0
            || self.min_total_improvement < 0.0
        {
            return Err(ConfigError("improvement thresholds must be non-negative"));
        }
        if self.max_spr_sweeps == 0 {
            return Err(ConfigError("max_spr_sweeps must be at least 1"));
        }
        if self.pseudocount_update_interval == 0 {
            return Err(ConfigError(
                "pseudocount_update_interval must be at least 1",
            ));
        }
        let default_blength = match self.default_blength {
            Some(v) => v,
            None => Config::default_blength_for(self.genome_length.unwrap_or(1)),
        };
        if default_blength <= 0.0 {
            return Err(ConfigError("default_blength must be strictly positive"));
        }
        Ok(Config {
            min_blength: self.min_blength,
            max_blength: self.max_blength,
            default_blength,
            min_blength_mid: self.min_blength_mid,
            min_improvement: self.min_improvement,
            min_spr_improvement: self.min_spr_improvement,
            min_total_improvement: self.min_total_improvement,
            max_spr_sweeps: self.max_spr_sweeps,
            model_preset: self.model_preset,
            pseudocount_update_interval: self.pseudocount_update_interval,
        })
    }
}
