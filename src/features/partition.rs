//! Partitioned feature engineering on a fixed worker pool.
//!
//! The training path splits a large raw table into contiguous, disjoint row
//! ranges and engineers each range on its own worker. Workers share nothing
//! but the read-only input table; results are merged back in partition
//! order once every worker has finished.
//!
//! A partition only sees its own rows unless it carries a halo: the
//! [`MIN_TRAILING_HISTORY`] rows that precede it. With [`Halo::Carry`] the
//! merged output is identical to single-table engineering. With
//! [`Halo::Discard`] the first rows of every partition after the first are
//! dropped for lack of history.

use crossbeam_channel::unbounded;

use super::engineer_features;
use crate::logging::{self, Component};
use crate::model::{EngineeredRow, ForecastError, MIN_TRAILING_HISTORY, RawReading};

// ---------------------------------------------------------------------------
// Partition plan
// ---------------------------------------------------------------------------

/// Cross-partition overlap policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halo {
    /// Each partition reads the trailing rows of its predecessor.
    Carry,
    /// Each partition is engineered in isolation.
    Discard,
}

/// A half-open row range `[start, end)` of the input table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Splits `len` rows into at most `count` contiguous partitions of
/// near-equal size. Earlier partitions take the remainder rows.
pub fn plan_partitions(len: usize, count: usize) -> Vec<Partition> {
    let count = count.max(1).min(len.max(1));
    let base = len / count;
    let remainder = len % count;

    let mut partitions = Vec::with_capacity(count);
    let mut start = 0;
    for index in 0..count {
        let size = base + usize::from(index < remainder);
        partitions.push(Partition {
            index,
            start,
            end: start + size,
        });
        start += size;
    }
    partitions
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// A fixed number of worker threads fed from a shared job queue.
///
/// Threads are scoped to a single [`WorkerPool::run`] call, so jobs may
/// borrow data owned by the caller.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `task` on every job and returns the results in job order.
    ///
    /// Blocks until all jobs have completed.
    pub fn run<J, R, F>(&self, jobs: Vec<J>, task: F) -> Vec<R>
    where
        J: Send,
        R: Send,
        F: Fn(J) -> R + Sync,
    {
        let job_count = jobs.len();
        if job_count == 0 {
            return Vec::new();
        }
        let threads = self.workers.min(job_count);

        std::thread::scope(|scope| {
            let (job_tx, job_rx) = unbounded::<(usize, J)>();
            let (result_tx, result_rx) = unbounded::<(usize, R)>();
            let task = &task;

            for _ in 0..threads {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for (index, job) in job_rx.iter() {
                        if result_tx.send((index, task(job))).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            for job in jobs.into_iter().enumerate() {
                if job_tx.send(job).is_err() {
                    break;
                }
            }
            drop(job_tx);

            let mut slots: Vec<Option<R>> = (0..job_count).map(|_| None).collect();
            for (index, result) in result_rx.iter() {
                slots[index] = Some(result);
            }
            // A worker that panicked is re-raised when the scope joins it,
            // so every slot is filled whenever this line is reached.
            slots.into_iter().flatten().collect()
        })
    }
}

// ---------------------------------------------------------------------------
// Partitioned engineering
// ---------------------------------------------------------------------------

/// Engineers `table` partition by partition on `pool` and merges the rows
/// in table order. Output positions index into the whole `table`.
pub fn engineer_partitioned(
    table: &[RawReading],
    partitions: &[Partition],
    halo: Halo,
    pool: &WorkerPool,
) -> Result<Vec<EngineeredRow>, ForecastError> {
    let jobs: Vec<Partition> = partitions.to_vec();

    let results = pool.run(jobs, |partition| -> Result<Vec<EngineeredRow>, ForecastError> {
        let read_from = match halo {
            Halo::Carry => partition.start.saturating_sub(MIN_TRAILING_HISTORY),
            Halo::Discard => partition.start,
        };
        let rows = engineer_features(&table[read_from..partition.end]).map_err(|err| match err {
            ForecastError::InvalidReading {
                position,
                field,
                value,
            } => ForecastError::InvalidReading {
                position: position + read_from,
                field,
                value,
            },
            other => other,
        })?;

        Ok(rows
            .into_iter()
            .map(|row| EngineeredRow {
                position: row.position + read_from,
                features: row.features,
            })
            .filter(|row| row.position >= partition.start)
            .collect())
    });

    let mut merged = Vec::with_capacity(table.len().saturating_sub(MIN_TRAILING_HISTORY));
    for result in results {
        merged.extend(result?);
    }
    Ok(merged)
}

/// Plans `count` partitions over `table` and engineers them with `halo`.
pub fn engineer_distributed(
    table: &[RawReading],
    count: usize,
    halo: Halo,
    pool: &WorkerPool,
) -> Result<Vec<EngineeredRow>, ForecastError> {
    let partitions = plan_partitions(table.len(), count);
    let rows = engineer_partitioned(table, &partitions, halo, pool)?;
    logging::debug(
        Component::Features,
        None,
        &format!(
            "{} rows from {} partitions on {} workers ({:?} halo)",
            rows.len(),
            partitions.len(),
            pool.workers(),
            halo
        ),
    );
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn wavy(n: usize) -> Vec<RawReading> {
        (0..n)
            .map(|i| {
                let x = i as f64;
                RawReading::new(
                    ((x * 0.7).sin() * 15.0 + 15.0).max(0.0),
                    ((x * 0.3).cos() * 25.0 + 30.0).max(0.0),
                    2.0 + (x * 0.05).sin() * 0.4,
                )
            })
            .collect()
    }

    #[test]
    fn test_plan_partitions_covers_every_row_once() {
        let plan = plan_partitions(1003, 10);
        assert_eq!(plan.len(), 10);
        assert_eq!(plan[0].start, 0);
        assert_eq!(plan.last().map(|p| p.end), Some(1003));
        for pair in plan.windows(2) {
            assert_eq!(pair[0].end, pair[1].start, "partitions must be contiguous");
        }
        let sizes: Vec<usize> = plan.iter().map(|p| p.len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 1003);
        assert!(sizes.iter().max().unwrap() - sizes.iter().min().unwrap() <= 1);
    }

    #[test]
    fn test_plan_partitions_never_creates_empty_partitions() {
        let plan = plan_partitions(3, 10);
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().all(|p| !p.is_empty()));

        let plan = plan_partitions(0, 4);
        assert_eq!(plan.len(), 1);
        assert!(plan[0].is_empty());
    }

    #[test]
    fn test_pool_returns_results_in_job_order() {
        let pool = WorkerPool::new(4);
        let out = pool.run((0..50).collect(), |x: u64| x * x);
        assert_eq!(out, (0..50).map(|x: u64| x * x).collect::<Vec<_>>());
    }

    #[test]
    fn test_pool_handles_more_workers_than_jobs() {
        let pool = WorkerPool::new(16);
        assert_eq!(pool.run(vec![1, 2], |x: i32| x + 1), vec![2, 3]);
        assert!(pool.run(Vec::<i32>::new(), |x| x).is_empty());
    }

    #[test]
    fn test_carried_halo_matches_single_partition_exactly() {
        let table = wavy(1000);
        let single = engineer_features(&table).expect("valid table");
        for workers in [1, 3, 8] {
            let pool = WorkerPool::new(workers);
            let distributed =
                engineer_distributed(&table, 7, Halo::Carry, &pool).expect("valid table");
            assert_eq!(
                distributed, single,
                "carried halo must reproduce single-table output ({} workers)",
                workers
            );
        }
    }

    #[test]
    fn test_discarded_halo_drops_rows_after_each_boundary() {
        let table = wavy(300);
        let pool = WorkerPool::new(2);
        let partitions = plan_partitions(table.len(), 3); // boundaries at 100 and 200
        let rows = engineer_partitioned(&table, &partitions, Halo::Discard, &pool)
            .expect("valid table");

        for boundary in [100, 200] {
            assert!(
                rows.iter()
                    .all(|r| !(boundary..boundary + MIN_TRAILING_HISTORY).contains(&r.position)),
                "rows within 23 of boundary {} must be missing without a halo",
                boundary
            );
        }
        assert_eq!(rows.len(), 3 * (100 - MIN_TRAILING_HISTORY));
    }

    #[test]
    fn test_invalid_reading_position_is_global() {
        let mut table = wavy(200);
        table[150].rainfall = -1.0;
        let pool = WorkerPool::new(2);
        let err = engineer_distributed(&table, 2, Halo::Carry, &pool).unwrap_err();
        assert!(
            matches!(err, ForecastError::InvalidReading { position: 150, .. }),
            "got {:?}",
            err
        );
    }
}
