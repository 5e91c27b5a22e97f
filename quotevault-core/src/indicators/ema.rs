//! Exponential Moving Average (EMA) of closes.
//!
//! Recursive: EMA[t] = alpha * close[t] + (1 - alpha) * EMA[t-1], with
//! alpha = 2 / (span + 1) and EMA[0] = close[0]. Defined from the first bar.

use super::Indicator;
use crate::domain::Bar;

#[derive(Debug, Clone)]
pub struct Ema {
    span: usize,
    name: String,
}

impl Ema {
    /// A zero span is treated as 1.
    pub fn new(span: usize) -> Self {
        let span = span.max(1);
        Self {
            span,
            name: format!("ema_{span}"),
        }
    }
}

impl Indicator for Ema {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookback(&self) -> usize {
        0
    }

    fn compute(&self, bars: &[Bar]) -> Vec<f64> {
        let alpha = 2.0 / (self.span as f64 + 1.0);
        let mut result = Vec::with_capacity(bars.len());
        let mut prev: Option<f64> = None;
        for bar in bars {
            let ema = match prev {
                None => bar.close,
                Some(p) => alpha * bar.close + (1.0 - alpha) * p,
            };
            result.push(ema);
            prev = Some(ema);
        }
        result
    }
}
