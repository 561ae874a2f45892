// Volatility indicators: Wilder ATR and the multi-timeframe stop distance blend

pub mod atr;
pub mod volatility;

pub use atr::calculate_atr;
pub use volatility::{StopDistance, VolatilityEstimator};
