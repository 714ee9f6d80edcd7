use serde::{Deserialize, Serialize};

/// Engine-wide tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// System MVA base for estimator power scaling
    pub base_mva: f64,
    /// Estimator convergence tolerance
    pub epsilon: f64,
    pub max_iterations: usize,
    /// Chi-square confidence level for bad-data detection
    pub confidence: f64,
    /// Huber tuning constant in standard deviations
    pub huber_k: f64,
    /// Relative sigma assigned to generated default measurements
    pub default_noise: f64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_mva: 100.0,
            epsilon: 1e-6,
            max_iterations: 20,
            confidence: 0.95,
            huber_k: 1.5,
            default_noise: 0.01,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let config: ServiceConfig = serde_json::from_str(r#"{"confidence": 0.99}"#).unwrap();
        assert!((config.confidence - 0.99).abs() < 1e-12);
        assert_eq!(config.max_iterations, 20);
        assert!((config.base_mva - 100.0).abs() < 1e-12);
    }
}
