//! Per-turn throughput samples

use serde::{Deserialize, Serialize};

/// Tokens-per-second history, one sample per completed turn
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThroughputLog {
    samples: Vec<f64>,
}

impl ThroughputLog {
    pub fn record(&mut self, tokens_per_second: f64) {
        self.samples.push(tokens_per_second);
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.last().copied()
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
