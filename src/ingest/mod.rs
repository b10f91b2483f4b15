//! Historical data sources for training.

pub mod history;
