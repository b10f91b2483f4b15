//! Flood forecasting from hourly rainfall, river level and soil moisture.
//!
//! A temporal (recurrent) model and a tabular (gradient-boosted) model are
//! trained on the same readings, blended by [`ensemble`], and driven hour
//! by hour by [`simulation`]. [`risk`] answers one-off inference requests.

pub mod adapters;
pub mod artifacts;
pub mod buffer;
pub mod config;
pub mod context;
pub mod ensemble;
pub mod features;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod predictor;
pub mod risk;
pub mod scaler;
pub mod sequence;
pub mod simulation;
pub mod synthetic;
pub mod training;
