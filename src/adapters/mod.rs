//! The two model families behind the ensemble.
//!
//! `temporal` scores windows of raw readings with a recurrent network,
//! `tabular` scores single engineered feature vectors with boosted trees.
//! Both hold their fitted scaler and refuse queries until trained or
//! restored.

pub mod boosting;
pub mod recurrent;
pub mod tabular;
pub mod temporal;

pub use tabular::{TabularAdapter, ValidationTail};
pub use temporal::{TemporalAdapter, TemporalParams, TemporalReport};
