use error_stack::{Report, bail};

use crate::error::IndicatorError;
use crate::indicator::Indicator;
use crate::indicator::ma::Ema;

/// MACD histogram: (fast EMA - slow EMA) minus its signal EMA.
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
}

impl Macd {
    pub fn new(
        fast_period: usize,
        slow_period: usize,
        signal_period: usize,
    ) -> Result<Self, Report<IndicatorError>> {
        if fast_period == 0 || slow_period == 0 || signal_period == 0 {
            bail!(IndicatorError::InvalidParameter {
                name: "all periods must be > 0".into(),
            });
        }
        if fast_period >= slow_period {
            bail!(IndicatorError::InvalidParameter {
                name: "fast_period must be < slow_period".into(),
            });
        }
        Ok(Self {
            fast: Ema::new(fast_period)?,
            slow: Ema::new(slow_period)?,
            signal: Ema::new(signal_period)?,
            fast_period,
            slow_period,
            signal_period,
        })
    }

    /// MACD line values, aligned to the slow EMA.
    pub fn macd_line(&self, prices: &[f64]) -> Result<Vec<f64>, Report<IndicatorError>> {
        let fast = self.fast.calculate(prices)?;
        let slow = self.slow.calculate(prices)?;
        let offset = self.slow_period - self.fast_period;
        Ok(fast[offset..]
            .iter()
            .zip(&slow)
            .map(|(f, s)| f - s)
            .collect())
    }
}

impl Indicator for Macd {
    fn name(&self) -> &str {
        "macd"
    }

    fn required_history(&self) -> usize {
        self.slow_period.saturating_add(self.signal_period)
    }

    fn calculate(&self, prices: &[f64]) -> Result<Vec<f64>, Report<IndicatorError>> {
        if prices.len() < self.required_history() {
            bail!(IndicatorError::InsufficientData {
                required: self.required_history(),
                available: prices.len(),
            });
        }
        let line = self.macd_line(prices)?;
        let signal = self.signal.calculate(&line)?;
        Ok(line[self.signal_period - 1..]
            .iter()
            .zip(&signal)
            .map(|(m, s)| m - s)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_rejects_fast_not_below_slow() {
        assert!(Macd::new(26, 12, 9).is_err());
        assert!(Macd::new(0, 26, 9).is_err());
    }

    #[test]
    fn macd_insufficient_history() {
        let macd = Macd::new(12, 26, 9).unwrap();
        assert!(macd.calculate(&[1.0; 30]).is_err());
    }

    #[test]
    fn macd_flat_prices_histogram_is_zero() {
        let macd = Macd::new(3, 5, 3).unwrap();
        for v in macd.calculate(&[10.0; 10]).unwrap() {
            assert!(v.abs() < 1e-9, "expected 0 for flat prices, got {v}");
        }
    }

    #[test]
    fn macd_line_positive_in_uptrend() {
        let macd = Macd::new(3, 5, 3).unwrap();
        let prices: Vec<f64> = (1..=12).map(f64::from).collect();
        let line = macd.macd_line(&prices).unwrap();
        assert!(line.iter().all(|&v| v > 0.0));
        assert!(!macd.calculate(&prices).unwrap().is_empty());
    }
}
