//! Sampling configuration
//!
//! Request-level generation parameters with range validation.

use serde::{Deserialize, Serialize};

/// Sampling parameters for a single generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Temperature for logit scaling (> 0)
    pub temperature: f32,
    /// Nucleus sampling threshold in (0, 1]
    pub top_p: f32,
    /// Hard cap on generated tokens (> 0)
    pub max_new_tokens: usize,
    /// Probability divisor for tokens already generated (>= 1)
    pub repetition_penalty: f32,
    /// Ban tokens that would complete an n-gram already present (0 = off)
    pub no_repeat_ngram_size: usize,
    /// Stop generation when any of these appears in the output
    #[serde(default)]
    pub stop: Vec<String>,
    /// Seed for reproducible sampling; random when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            max_new_tokens: 512,
            repetition_penalty: 1.1,
            no_repeat_ngram_size: 0,
            stop: Vec::new(),
            seed: None,
        }
    }
}

impl SamplingConfig {
    /// Clamp all parameters into their valid ranges
    pub fn validate(&mut self) {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            self.temperature = 0.7;
        }
        self.temperature = self.temperature.min(2.0);

        if !self.top_p.is_finite() || self.top_p <= 0.0 {
            self.top_p = 1.0;
        }
        self.top_p = self.top_p.min(1.0);

        if self.max_new_tokens == 0 {
            self.max_new_tokens = 1;
        }

        if !self.repetition_penalty.is_finite() || self.repetition_penalty < 1.0 {
            self.repetition_penalty = 1.0;
        }

        self.stop.retain(|s| !s.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SamplingConfig::default();
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.top_p, 0.9);
        assert_eq!(config.max_new_tokens, 512);
        assert!(config.stop.is_empty());
    }

    #[test]
    fn test_validation_clamps_ranges() {
        let mut config = SamplingConfig {
            temperature: -1.0,
            top_p: 3.0,
            max_new_tokens: 0,
            repetition_penalty: 0.2,
            no_repeat_ngram_size: 3,
            stop: vec![String::new(), "###".to_string()],
            seed: None,
        };
        config.validate();
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.top_p, 1.0);
        assert_eq!(config.max_new_tokens, 1);
        assert_eq!(config.repetition_penalty, 1.0);
        assert_eq!(config.stop, vec!["###".to_string()]);
    }

    #[test]
    fn test_validation_keeps_valid_values() {
        let mut config = SamplingConfig {
            temperature: 0.95,
            top_p: 0.95,
            max_new_tokens: 10,
            repetition_penalty: 1.3,
            no_repeat_ngram_size: 2,
            stop: vec!["<|user|>".to_string()],
            seed: Some(7),
        };
        config.validate();
        assert_eq!(config.temperature, 0.95);
        assert_eq!(config.top_p, 0.95);
        assert_eq!(config.max_new_tokens, 10);
        assert_eq!(config.repetition_penalty, 1.3);
    }
}
