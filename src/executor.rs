//! Injected execution for per-partition work.
//!
//! Every stage expresses its work as `units` independent tasks indexed by
//! partition and hands them to an [`Executor`]. Results come back in unit
//! order, so a `run` call is also the barrier before the dependent stage.
//!
//! Both executors share the same per-unit policy:
//! - the cancel token is checked before every attempt
//! - transient failures ([`PrepError::is_transient`]) are retried up to
//!   `max_retries` times with the same inputs
//! - any other failure aborts the stage; the first error wins and is
//!   returned as [`PrepError::Task`]

use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::constants::DEFAULT_MAX_RETRIES;
use crate::error::{FirstErrorCapture, PrepError, Result};

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` once the token has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PrepError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Runs indexed units of work and joins their results.
pub trait Executor: Sync {
    /// Run `task(0..units)` and return results in unit order.
    fn run<T, F>(&self, stage: &str, units: usize, task: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Sync + Send;

    /// Token observed by units and by long-running writers.
    fn cancel_token(&self) -> &CancelToken;
}

/// Executes units on a rayon thread pool.
#[derive(Debug, Clone)]
pub struct ParallelExecutor {
    pool: Option<Arc<rayon::ThreadPool>>,
    max_retries: u32,
    cancel: CancelToken,
}

impl ParallelExecutor {
    /// Executor on rayon's global pool.
    pub fn new() -> Self {
        Self {
            pool: None,
            max_retries: DEFAULT_MAX_RETRIES,
            cancel: CancelToken::new(),
        }
    }

    /// Executor on a dedicated pool with `threads` workers.
    /// Zero threads means rayon's global pool.
    pub fn with_threads(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Ok(Self::new());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("tabprep-worker-{}", i))
            .build()
            .map_err(|e| PrepError::validation(format!("Failed to build thread pool: {}", e)))?;
        Ok(Self {
            pool: Some(Arc::new(pool)),
            ..Self::new()
        })
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Worker count of the pool this executor runs on.
    pub fn num_threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for ParallelExecutor {
    fn run<T, F>(&self, stage: &str, units: usize, task: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Sync + Send,
    {
        let t_start = Instant::now();
        let capture = FirstErrorCapture::new();

        let work = || -> Vec<Option<T>> {
            (0..units)
                .into_par_iter()
                .map(|unit| {
                    if capture.has_error() {
                        return None;
                    }
                    match run_unit(stage, unit, &task, self.max_retries, &self.cancel) {
                        Ok(value) => Some(value),
                        Err(e) => {
                            capture.store(e);
                            None
                        }
                    }
                })
                .collect()
        };

        let results = match &self.pool {
            Some(pool) => pool.install(work),
            None => work(),
        };

        if let Some(err) = capture.take() {
            return Err(err);
        }
        let results = results.into_iter().collect::<Option<Vec<T>>>().ok_or_else(|| {
            PrepError::validation(format!("Stage '{}' finished with missing results", stage))
        })?;

        log::debug!(
            "Stage '{}': {} unit(s) in {:.2?}",
            stage,
            units,
            t_start.elapsed()
        );
        Ok(results)
    }

    fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// Executes units one after another on the calling thread.
#[derive(Debug, Clone)]
pub struct SequentialExecutor {
    max_retries: u32,
    cancel: CancelToken,
}

impl SequentialExecutor {
    pub fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            cancel: CancelToken::new(),
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Default for SequentialExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for SequentialExecutor {
    fn run<T, F>(&self, stage: &str, units: usize, task: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Sync + Send,
    {
        (0..units)
            .map(|unit| run_unit(stage, unit, &task, self.max_retries, &self.cancel))
            .collect()
    }

    fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// Run one unit with cancellation checks and bounded retry.
fn run_unit<T, F>(
    stage: &str,
    unit: usize,
    task: &F,
    max_retries: u32,
    cancel: &CancelToken,
) -> Result<T>
where
    F: Fn(usize) -> Result<T>,
{
    let mut attempts = 0u32;
    loop {
        cancel.check()?;
        attempts += 1;
        match task(unit) {
            Ok(value) => return Ok(value),
            Err(PrepError::Cancelled) => return Err(PrepError::Cancelled),
            Err(e) if e.is_transient() && attempts <= max_retries => {
                log::warn!(
                    "Stage '{}' partition {} attempt {} failed: {}; retrying",
                    stage,
                    unit,
                    attempts,
                    e
                );
            }
            Err(e) => {
                return Err(PrepError::Task {
                    stage: stage.to_string(),
                    unit,
                    attempts,
                    source: Box::new(e),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    fn transient() -> PrepError {
        PrepError::io(
            "part.parquet",
            "read partition",
            io::Error::new(io::ErrorKind::Interrupted, "interrupted"),
        )
    }

    #[test]
    fn test_results_in_unit_order() {
        let exec = ParallelExecutor::with_threads(4).unwrap();
        let out = exec.run("square", 100, |i| Ok(i * i)).unwrap();
        assert_eq!(out, (0..100).map(|i| i * i).collect::<Vec<_>>());

        let seq = SequentialExecutor::new();
        assert_eq!(seq.run("square", 100, |i| Ok(i * i)).unwrap(), out);
    }

    #[test]
    fn test_zero_units() {
        let exec = ParallelExecutor::new();
        let out: Vec<usize> = exec.run("empty", 0, Ok).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let calls = AtomicUsize::new(0);
        let exec = ParallelExecutor::new().max_retries(2);
        let out = exec
            .run("flaky", 1, |_| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(transient())
                } else {
                    Ok(7)
                }
            })
            .unwrap();
        assert_eq!(out, vec![7]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retries_are_bounded() {
        let calls = AtomicUsize::new(0);
        let exec = SequentialExecutor::new().max_retries(2);
        let err = exec
            .run("always", 1, |_| -> Result<()> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            PrepError::Task {
                stage, attempts, ..
            } => {
                assert_eq!(stage, "always");
                assert_eq!(attempts, 3);
            }
            other => panic!("Expected Task error, got {:?}", other),
        }
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        let calls = AtomicUsize::new(0);
        let exec = ParallelExecutor::new();
        let err = exec
            .run("broken", 8, |i| {
                if i == 3 {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PrepError::validation("bad partition"))
                } else {
                    Ok(i)
                }
            })
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match err {
            PrepError::Task {
                unit,
                attempts,
                source,
                ..
            } => {
                assert_eq!(unit, 3);
                assert_eq!(attempts, 1);
                assert!(matches!(*source, PrepError::Validation(_)));
            }
            other => panic!("Expected Task error, got {:?}", other),
        }
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancelToken::new();
        token.cancel();
        let exec = ParallelExecutor::new().with_cancel_token(token);
        let err = exec.run("never", 4, Ok).unwrap_err();
        assert!(matches!(err, PrepError::Cancelled));
    }

    #[test]
    fn test_cancel_mid_stage_stops_sequential_run() {
        let token = CancelToken::new();
        let exec = SequentialExecutor::new().with_cancel_token(token.clone());
        let ran = AtomicUsize::new(0);
        let err = exec
            .run("partial", 10, |i| {
                ran.fetch_add(1, Ordering::SeqCst);
                if i == 2 {
                    token.cancel();
                }
                Ok(i)
            })
            .unwrap_err();
        assert!(matches!(err, PrepError::Cancelled));
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_dedicated_pool_thread_count() {
        let exec = ParallelExecutor::with_threads(3).unwrap();
        assert_eq!(exec.num_threads(), 3);
    }
}
