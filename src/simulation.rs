//! Real-time simulation driver.
//!
//! Steps hour by hour over a history buffer it owns outright. Each step
//! scores the current snapshot, emits one alert, then pulls one new
//! reading from its feed and appends it. A step either completes all of
//! that or fails the run; there is no partial step.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::buffer::HistoryBuffer;
use crate::logging::{self, Component};
use crate::model::{Alert, ForecastError, RawReading};
use crate::predictor::HybridPredictor;
use crate::synthetic::sample_reading;

/// Storm chance of each live synthetic hour.
pub const STORM_PROBABILITY: f64 = 0.02;

// ---------------------------------------------------------------------------
// Feeds
// ---------------------------------------------------------------------------

/// Source of the reading appended after each simulated hour.
pub trait ReadingFeed {
    fn next_reading(&mut self, hour: usize) -> Result<RawReading, ForecastError>;
}

/// Draws readings from the same law as the training generator.
#[derive(Debug)]
pub struct SyntheticFeed {
    rng: StdRng,
    storm_probability: f64,
}

impl SyntheticFeed {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            storm_probability: STORM_PROBABILITY,
        }
    }

    /// Seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
            storm_probability: STORM_PROBABILITY,
        }
    }

    pub fn with_storm_probability(mut self, probability: f64) -> Self {
        self.storm_probability = probability.clamp(0.0, 1.0);
        self
    }
}

impl ReadingFeed for SyntheticFeed {
    fn next_reading(&mut self, _hour: usize) -> Result<RawReading, ForecastError> {
        let storm = self.rng.random::<f64>() < self.storm_probability;
        Ok(sample_reading(&mut self.rng, storm))
    }
}

/// Replays a recorded table in order.
#[derive(Debug, Clone)]
pub struct ReplayFeed {
    readings: std::vec::IntoIter<RawReading>,
}

impl ReplayFeed {
    pub fn new(readings: Vec<RawReading>) -> Self {
        Self {
            readings: readings.into_iter(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.readings.len()
    }
}

impl ReadingFeed for ReplayFeed {
    fn next_reading(&mut self, hour: usize) -> Result<RawReading, ForecastError> {
        self.readings.next().ok_or(ForecastError::FeedExhausted { hour })
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct SimulationDriver<'a, F: ReadingFeed> {
    predictor: &'a HybridPredictor,
    buffer: HistoryBuffer,
    feed: F,
}

impl<'a, F: ReadingFeed> SimulationDriver<'a, F> {
    /// A driver over an empty buffer of `capacity` readings.
    pub fn new(predictor: &'a HybridPredictor, capacity: usize, feed: F) -> Self {
        Self {
            predictor,
            buffer: HistoryBuffer::new(capacity),
            feed,
        }
    }

    /// A driver whose buffer starts with the newest `capacity` readings of
    /// `history`.
    pub fn seeded(
        predictor: &'a HybridPredictor,
        capacity: usize,
        history: &[RawReading],
        feed: F,
    ) -> Self {
        Self {
            predictor,
            buffer: HistoryBuffer::seeded(capacity, history),
            feed,
        }
    }

    /// Pre-fills the buffer from the feed until it is full.
    pub fn warm_up(&mut self) -> Result<(), ForecastError> {
        while !self.buffer.is_full() {
            let reading = self.feed.next_reading(0)?;
            reading.validate(self.buffer.len())?;
            self.buffer.append(reading);
        }
        Ok(())
    }

    pub fn buffer(&self) -> &HistoryBuffer {
        &self.buffer
    }

    /// Scores the current buffer, then appends the next feed reading.
    pub fn step(&mut self, hour: usize) -> Result<Alert, ForecastError> {
        let snapshot = self.buffer.snapshot();
        let decision = self.predictor.evaluate(&snapshot)?;
        let next = self.feed.next_reading(hour)?;
        next.validate(snapshot.len())?;
        self.buffer.append(next);

        let subject = format!("hour {}", hour);
        if decision.is_flood {
            logging::warn(
                Component::Simulation,
                Some(&subject),
                &format!(
                    "FLOOD WARNING (p {:.2} [temporal {:.2}, tabular {:.2}])",
                    decision.probability_blended,
                    decision.probability_temporal,
                    decision.probability_tabular
                ),
            );
        } else {
            logging::debug(
                Component::Simulation,
                Some(&subject),
                &format!("normal (p {:.2})", decision.probability_blended),
            );
        }

        Ok(Alert {
            hour,
            probability: decision.probability_blended,
            is_flood: decision.is_flood,
        })
    }

    /// Runs `hours` steps, numbered from 1, and returns the alert feed.
    pub fn run(&mut self, hours: usize) -> Result<Vec<Alert>, ForecastError> {
        logging::info(
            Component::Simulation,
            None,
            &format!("simulating {} hours over {} buffered readings", hours, self.buffer.len()),
        );
        let alerts = (1..=hours)
            .map(|hour| self.step(hour))
            .collect::<Result<Vec<_>, _>>()?;

        let warnings = alerts.iter().filter(|a| a.is_flood).count();
        logging::info(
            Component::Simulation,
            None,
            &format!("simulation done: {} of {} hours flagged", warnings, hours),
        );
        Ok(alerts)
    }
}
