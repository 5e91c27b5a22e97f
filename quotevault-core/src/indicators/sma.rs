//! Simple Moving Average (SMA) of closes.
//!
//! Lookback: window - 1 (first valid value at index window-1).

use super::Indicator;
use crate::domain::Bar;

#[derive(Debug, Clone)]
pub struct Sma {
    window: usize,
    name: String,
}

impl Sma {
    /// A zero window is treated as 1.
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            name: format!("sma_{window}"),
        }
    }
}

impl Indicator for Sma {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookback(&self) -> usize {
        self.window - 1
    }

    fn compute(&self, bars: &[Bar]) -> Vec<f64> {
        let n = bars.len();
        let mut result = vec![f64::NAN; n];
        if n < self.window {
            return result;
        }

        let mut sum: f64 = bars.iter().take(self.window).map(|b| b.close).sum();
        result[self.window - 1] = sum / self.window as f64;

        for i in self.window..n {
            sum += bars[i].close - bars[i - self.window].close;
            result[i] = sum / self.window as f64;
        }
        result
    }
}
