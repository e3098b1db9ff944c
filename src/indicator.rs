pub mod bollinger;
pub mod ma;
pub mod macd;
pub mod rsi;

use error_stack::Report;

use crate::condition::TechnicalIndicator;
use crate::error::IndicatorError;

/// A technical indicator computed over a price series.
///
/// Prices must be in ascending chronological order (oldest first).
pub trait Indicator: Send {
    fn name(&self) -> &str;

    /// Minimum number of prices required to produce at least one value.
    fn required_history(&self) -> usize;

    /// One output per point once the lookback is satisfied; the output may
    /// be shorter than the input.
    fn calculate(&self, prices: &[f64]) -> Result<Vec<f64>, Report<IndicatorError>>;
}

/// Instantiate the indicator described by a technical condition.
pub fn build(indicator: &TechnicalIndicator) -> Result<Box<dyn Indicator>, Report<IndicatorError>> {
    Ok(match *indicator {
        TechnicalIndicator::Rsi { period } => Box::new(rsi::Rsi::new(period)?),
        TechnicalIndicator::Sma { period } => Box::new(ma::Sma::new(period)?),
        TechnicalIndicator::Ema { period } => Box::new(ma::Ema::new(period)?),
        TechnicalIndicator::Macd { fast, slow, signal } => {
            Box::new(macd::Macd::new(fast, slow, signal)?)
        }
        TechnicalIndicator::Bollinger {
            period,
            std_dev_multiplier,
        } => Box::new(bollinger::BollingerBands::new(period, std_dev_multiplier)?),
    })
}

/// History length an indicator needs, without validating its parameters.
pub fn required_history(indicator: &TechnicalIndicator) -> usize {
    match *indicator {
        TechnicalIndicator::Rsi { period } => period.saturating_add(1),
        TechnicalIndicator::Sma { period }
        | TechnicalIndicator::Ema { period }
        | TechnicalIndicator::Bollinger { period, .. } => period,
        TechnicalIndicator::Macd { slow, signal, .. } => slow.saturating_add(signal),
    }
}
