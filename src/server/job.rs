//! Generic job runner.
//!
//! A job is a pair of functions over one task type: discover selects the
//! next piece of work from the database, process performs it. The runner
//! is indifferent to what the work is; it only provides the loop, the
//! idle backoff and the outcome counters.
//!
//! Two discovery disciplines exist. Short jobs lock their row with
//! `FOR UPDATE SKIP LOCKED` inside a transaction that travels to process
//! inside the task item and is committed there (rolled back on drop).
//! Long jobs claim by atomically advancing their row's schedule so that
//! no lock is held across storage or network calls.

use anyhow::Error;
use async_trait::async_trait;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use tokio::sync::watch;

/// Static description of a job, used for logging and metrics.
pub struct JobDesc {
    pub name: &'static str,
    pub counter_name: &'static str,
    pub counter_help: &'static str,
}

/// One reconciliation job.
///
/// `discover` returns `Ok(None)` when there is nothing to do; the runner
/// passes that through as [Outcome::Idle] so single-cycle callers can
/// throttle on it. Process errors are counted and logged but never tear
/// down the loop.
#[async_trait]
pub trait Task: Send + Sync {
    type Item: Send;

    fn desc(&self) -> &'static JobDesc;

    async fn discover(&self) -> Result<Option<Self::Item>, Error>;

    async fn process(&self, item: Self::Item) -> Result<(), Error>;
}

/// Result of one discover/process cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Discover found a task and process ran it.
    Completed,
    /// Discover found nothing; the caller should back off.
    Idle,
}

/// Success/failure counters of one job.
pub struct JobMetrics {
    success: IntCounter,
    failure: IntCounter,
}

impl JobMetrics {
    pub fn new(registry: &Registry, desc: &JobDesc) -> Result<Self, Error> {
        let vec = IntCounterVec::new(
            Opts::new(desc.counter_name, desc.counter_help),
            &["task_outcome"],
        )?;
        registry.register(Box::new(vec.clone()))?;
        // materialize both series at zero so scrapers see them before the
        // first task runs
        Ok(Self {
            success: vec.with_label_values(&["success"]),
            failure: vec.with_label_values(&["failure"]),
        })
    }

    pub fn success_count(&self) -> u64 {
        self.success.get()
    }

    pub fn failure_count(&self) -> u64 {
        self.failure.get()
    }
}

/// Drives one [Task], either a single cycle at a time (tests) or in a
/// loop until shutdown (production).
pub struct JobRunner<T: Task> {
    task: T,
    metrics: JobMetrics,
    idle_backoff: std::time::Duration,
}

impl<T: Task> JobRunner<T> {
    pub fn new(
        task: T,
        registry: &Registry,
        idle_backoff: std::time::Duration,
    ) -> Result<Self, Error> {
        let metrics = JobMetrics::new(registry, task.desc())?;
        Ok(Self {
            task,
            metrics,
            idle_backoff,
        })
    }

    pub fn metrics(&self) -> &JobMetrics {
        &self.metrics
    }

    /// Performs exactly one discover/process cycle.
    pub async fn process_one(&self) -> Result<Outcome, Error> {
        let item = match self.task.discover().await {
            Ok(Some(item)) => item,
            Ok(None) => return Ok(Outcome::Idle),
            Err(err) => {
                self.metrics.failure.inc();
                return Err(err);
            }
        };

        match self.task.process(item).await {
            Ok(()) => {
                self.metrics.success.inc();
                Ok(Outcome::Completed)
            }
            Err(err) => {
                self.metrics.failure.inc();
                Err(err)
            }
        }
    }

    /// Runs cycles until `shutdown` flips to true. In-flight work always
    /// finishes its current row first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.process_one().await {
                Ok(Outcome::Completed) => (),
                Ok(Outcome::Idle) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.idle_backoff) => (),
                        _ = shutdown.changed() => (),
                    }
                }
                Err(err) => {
                    log::error!("{} failed: {err:#}", self.task.desc().name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static STUB_DESC: JobDesc = JobDesc {
        name: "stub job",
        counter_name: "stevedore_stub_tasks",
        counter_help: "Counter for stub operations.",
    };

    /// Yields each scripted result once, then reports no work.
    struct StubTask {
        script: Vec<Result<(), ()>>,
        position: AtomicUsize,
    }

    #[async_trait]
    impl Task for StubTask {
        type Item = Result<(), ()>;

        fn desc(&self) -> &'static JobDesc {
            &STUB_DESC
        }

        async fn discover(&self) -> Result<Option<Self::Item>, Error> {
            let pos = self.position.fetch_add(1, Ordering::SeqCst);
            Ok(self.script.get(pos).copied())
        }

        async fn process(&self, item: Self::Item) -> Result<(), Error> {
            item.map_err(|()| anyhow::anyhow!("scripted failure"))
        }
    }

    #[tokio::test]
    async fn runner_counts_outcomes() -> Result<(), Error> {
        let registry = Registry::new();
        let runner = JobRunner::new(
            StubTask {
                script: vec![Ok(()), Err(()), Ok(())],
                position: AtomicUsize::new(0),
            },
            &registry,
            std::time::Duration::from_millis(1),
        )?;

        assert_eq!(runner.process_one().await?, Outcome::Completed);
        assert!(runner.process_one().await.is_err());
        assert_eq!(runner.process_one().await?, Outcome::Completed);
        assert_eq!(runner.process_one().await?, Outcome::Idle);

        assert_eq!(runner.metrics().success_count(), 2);
        assert_eq!(runner.metrics().failure_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn counters_start_at_zero() -> Result<(), Error> {
        let registry = Registry::new();
        let _runner = JobRunner::new(
            StubTask {
                script: Vec::new(),
                position: AtomicUsize::new(0),
            },
            &registry,
            std::time::Duration::from_millis(1),
        )?;

        // both series exist before any task ran
        let families = registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "stevedore_stub_tasks")
            .expect("metric family is registered");
        assert_eq!(family.get_metric().len(), 2);
        for metric in family.get_metric() {
            assert_eq!(metric.get_counter().get_value(), 0.0);
        }
        Ok(())
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() -> Result<(), Error> {
        let registry = Registry::new();
        let runner = JobRunner::new(
            StubTask {
                script: vec![Ok(())],
                position: AtomicUsize::new(0),
            },
            &registry,
            std::time::Duration::from_millis(1),
        )?;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            runner.run(rx).await;
            runner.metrics().success_count()
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        assert_eq!(handle.await?, 1);
        Ok(())
    }
}
