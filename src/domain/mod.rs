//! Core domain types and logic.

pub mod backtest;
pub mod bar;
pub mod config_validation;
pub mod context;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod order;
pub mod portfolio;
pub mod position;
pub mod progress;
pub mod replay;
pub mod strategy;
pub mod universe;
