use error_stack::{Report, bail};

use crate::error::IndicatorError;
use crate::indicator::Indicator;
use crate::indicator::ma::Sma;

/// Bollinger Bands reported as %B: where the price sits between the bands.
pub struct BollingerBands {
    sma: Sma,
    period: usize,
    std_dev_multiplier: f64,
}

impl BollingerBands {
    pub fn new(period: usize, std_dev_multiplier: f64) -> Result<Self, Report<IndicatorError>> {
        if std_dev_multiplier <= 0.0 || !std_dev_multiplier.is_finite() {
            bail!(IndicatorError::InvalidParameter {
                name: "std_dev_multiplier must be > 0".into(),
            });
        }
        Ok(Self {
            sma: Sma::new(period)?,
            period,
            std_dev_multiplier,
        })
    }

    /// (upper, middle, lower) band for each full window.
    pub fn bands(&self, prices: &[f64]) -> Result<Vec<(f64, f64, f64)>, Report<IndicatorError>> {
        let middles = self.sma.calculate(prices)?;
        Ok(prices
            .windows(self.period)
            .zip(middles)
            .map(|(window, middle)| {
                let variance = window.iter().map(|&p| (p - middle).powi(2)).sum::<f64>()
                    / self.period as f64;
                let width = self.std_dev_multiplier * variance.sqrt();
                (middle + width, middle, middle - width)
            })
            .collect())
    }
}

impl Indicator for BollingerBands {
    fn name(&self) -> &str {
        "bollinger"
    }

    fn required_history(&self) -> usize {
        self.period
    }

    /// Zero-width bands (flat prices) report 0.5.
    fn calculate(&self, prices: &[f64]) -> Result<Vec<f64>, Report<IndicatorError>> {
        let bands = self.bands(prices)?;
        let closes = &prices[self.period - 1..];
        Ok(bands
            .into_iter()
            .zip(closes)
            .map(|((upper, _, lower), &price)| {
                let width = upper - lower;
                if width.abs() < f64::EPSILON {
                    0.5
                } else {
                    (price - lower) / width
                }
            })
            .collect())
    }
}
