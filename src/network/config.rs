use crate::error::{Result, ZnnError};
use crate::tensor::Real;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Runtime settings shared by every edge of a network.
///
/// ```rust
/// use znn_rs::network::NetworkConfig;
///
/// let config = NetworkConfig::default().with_eta(0.05).with_momentum(0.9);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Worker threads of the task scheduler. `None` uses one per core.
    pub threads: Option<usize>,
    /// Learning rate.
    pub eta: Real,
    pub momentum: Real,
    pub weight_decay: Real,
    /// Divides every weight gradient by this value before it is applied. `0` disables it.
    pub patch_size: Real,
    /// Whether convolutions run in the frequency domain unless a group says otherwise.
    pub fft: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            threads: None,
            eta: 0.01,
            momentum: 0.0,
            weight_decay: 0.0,
            patch_size: 0.0,
            fft: false,
        }
    }
}

impl NetworkConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_eta(mut self, eta: Real) -> Self {
        self.eta = eta;
        self
    }

    pub fn with_momentum(mut self, momentum: Real) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: Real) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_patch_size(mut self, patch_size: Real) -> Self {
        self.patch_size = patch_size;
        self
    }

    pub fn with_fft(mut self, fft: bool) -> Self {
        self.fft = fft;
        self
    }

    /// Parses a configuration from JSON; missing fields take their default.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// # Errors
    ///
    /// Returns `ZnnError::Config` naming the first out-of-range field.
    pub fn validate(&self) -> Result<()> {
        if self.threads == Some(0) {
            return Err(ZnnError::Config("'threads' must be >= 1 when set".into()));
        }
        if !self.eta.is_finite() || self.eta < 0.0 {
            return Err(ZnnError::Config(format!("'eta' must be >= 0, got {}", self.eta)));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(ZnnError::Config(format!(
                "'momentum' must be in [0, 1), got {}",
                self.momentum
            )));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(ZnnError::Config(format!(
                "'weight_decay' must be >= 0, got {}",
                self.weight_decay
            )));
        }
        if !self.patch_size.is_finite() || self.patch_size < 0.0 {
            return Err(ZnnError::Config(format!(
                "'patch_size' must be >= 0, got {}",
                self.patch_size
            )));
        }
        Ok(())
    }
}
