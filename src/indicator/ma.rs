use error_stack::{Report, bail};

use crate::error::IndicatorError;
use crate::indicator::Indicator;

fn check_period(period: usize) -> Result<(), Report<IndicatorError>> {
    if period == 0 {
        bail!(IndicatorError::InvalidParameter {
            name: "period must be > 0".into(),
        });
    }
    Ok(())
}

fn check_len(required: usize, available: usize) -> Result<(), Report<IndicatorError>> {
    if available < required {
        bail!(IndicatorError::InsufficientData {
            required,
            available,
        });
    }
    Ok(())
}

/// Simple Moving Average.
pub struct Sma {
    period: usize,
}

impl Sma {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        check_period(period)?;
        Ok(Self { period })
    }
}

impl Indicator for Sma {
    fn name(&self) -> &str {
        "sma"
    }

    fn required_history(&self) -> usize {
        self.period
    }

    fn calculate(&self, prices: &[f64]) -> Result<Vec<f64>, Report<IndicatorError>> {
        check_len(self.period, prices.len())?;
        Ok(prices
            .windows(self.period)
            .map(|w| w.iter().sum::<f64>() / self.period as f64)
            .collect())
    }
}

/// Exponential Moving Average, seeded with the SMA of the first `period` prices.
pub struct Ema {
    period: usize,
}

impl Ema {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        check_period(period)?;
        Ok(Self { period })
    }
}

impl Indicator for Ema {
    fn name(&self) -> &str {
        "ema"
    }

    fn required_history(&self) -> usize {
        self.period
    }

    fn calculate(&self, prices: &[f64]) -> Result<Vec<f64>, Report<IndicatorError>> {
        check_len(self.period, prices.len())?;

        let k = 2.0 / (self.period as f64 + 1.0);
        let mut ema = prices[..self.period].iter().sum::<f64>() / self.period as f64;
        let mut results = Vec::with_capacity(prices.len() - self.period + 1);
        results.push(ema);
        for &price in &prices[self.period..] {
            ema = price * k + ema * (1.0 - k);
            results.push(ema);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_period_zero_invalid() {
        assert!(Sma::new(0).is_err());
        assert!(Ema::new(0).is_err());
    }

    #[test]
    fn sma_known_values() {
        let values = Sma::new(3).unwrap().calculate(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(values.len(), 2);
        assert!((values[0] - 2.0).abs() < 1e-9);
        assert!((values[1] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn short_history_is_reported() {
        let err = Sma::new(5).unwrap().calculate(&[1.0; 4]).unwrap_err();
        assert!(matches!(
            err.current_context(),
            IndicatorError::InsufficientData {
                required: 5,
                available: 4
            }
        ));
    }

    #[test]
    fn ema_seed_equals_sma_and_tracks_trend() {
        let values = Ema::new(3).unwrap().calculate(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!((values[0] - 2.0).abs() < 1e-9);
        // k = 0.5: 4 * 0.5 + 2 * 0.5
        assert!((values[1] - 3.0).abs() < 1e-9);
    }
}
