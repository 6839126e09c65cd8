//! Per-player game-stat forecasting: causal features over stored box
//! scores, ridge estimators behind date-stamped artifacts, walk-forward
//! backtesting, residual-calibrated intervals, and under-rate aggregates.

pub mod backtest;
pub mod cache;
pub mod config;
pub mod confidence;
pub mod error;
pub mod estimator;
pub mod features;
pub mod predict;
pub mod snapshot;
pub mod store;
pub mod table;
pub mod trainer;
pub mod under_rate;
