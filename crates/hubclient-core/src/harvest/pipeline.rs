//! Concurrent fan-out / fan-in over many same-shaped fetches.
//!
//! Every submitted task runs on its own tokio task, bounded by the
//! configured concurrency. The pipeline waits for all of them, keeps one
//! result slot per task in submission order, flattens the successful
//! payloads and hands them to the sink as a single batch.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::{stream, FutureExt, StreamExt};
use tracing::{debug, error, info, warn};

use super::sink::{HarvestBatch, StorageSink};
use crate::error::{Error, Result};

pub struct HarvestTask<T> {
    pub id: String,
    fetch: BoxFuture<'static, anyhow::Result<Vec<T>>>,
}

impl<T> HarvestTask<T> {
    pub fn new<F>(id: impl Into<String>, fetch: F) -> Self
    where
        F: Future<Output = anyhow::Result<Vec<T>>> + Send + 'static,
    {
        Self {
            id: id.into(),
            fetch: fetch.boxed(),
        }
    }
}

#[derive(Debug)]
pub struct HarvestResult<T> {
    pub id: String,
    /// Records on success, `HarvestItemFailed` otherwise.
    pub outcome: Result<Vec<T>>,
}

impl<T> HarvestResult<T> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug)]
pub struct HarvestReport<T> {
    pub category: String,
    /// One entry per submitted task, in submission order.
    pub results: Vec<HarvestResult<T>>,
    /// Number of records handed to the sink, or the sink's error.
    pub stored: Result<usize>,
}

impl<T> HarvestReport<T> {
    pub fn succeeded(&self) -> impl Iterator<Item = &HarvestResult<T>> {
        self.results.iter().filter(|r| r.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &HarvestResult<T>> {
        self.results.iter().filter(|r| !r.is_ok())
    }

    pub fn is_complete(&self) -> bool {
        self.stored.is_ok() && self.results.iter().all(HarvestResult::is_ok)
    }

    /// Flattened records, or the first failure. Item failures take
    /// precedence over a sink failure.
    pub fn into_strict(self) -> Result<Vec<T>> {
        let mut records = Vec::new();
        for result in self.results {
            records.extend(result.outcome?);
        }
        match self.stored {
            Ok(_) => Ok(records),
            Err(Error::Storage(reason)) => Err(Error::Storage(reason)),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }
}

pub struct HarvestPipeline<T> {
    sink: Arc<dyn StorageSink<T>>,
    concurrency: usize,
}

impl<T> HarvestPipeline<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(sink: Arc<dyn StorageSink<T>>, concurrency: usize) -> Self {
        Self {
            sink,
            concurrency: concurrency.max(1),
        }
    }

    /// Build one task per id from `fetch` and run them.
    pub async fn submit<I, F, Fut>(
        &self,
        category: &str,
        account: &str,
        ids: I,
        fetch: F,
    ) -> HarvestReport<T>
    where
        I: IntoIterator,
        I::Item: Into<String>,
        F: Fn(String) -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<T>>> + Send + 'static,
    {
        let tasks = ids
            .into_iter()
            .map(|id| {
                let id = id.into();
                HarvestTask::new(id.clone(), fetch(id))
            })
            .collect();
        self.run(category, account, tasks).await
    }

    /// Run every task to completion, then persist the aggregate. Returns
    /// only once each task has produced a result.
    pub async fn run(&self, category: &str, account: &str, tasks: Vec<HarvestTask<T>>) -> HarvestReport<T> {
        let started = Instant::now();
        let total = tasks.len();
        debug!(category, total, concurrency = self.concurrency, "Starting harvest");

        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let mut slots: Vec<Option<Result<Vec<T>>>> = (0..total).map(|_| None).collect();

        let mut completions = stream::iter(tasks.into_iter().enumerate())
            .map(|(index, task)| async move { (index, tokio::spawn(task.fetch).await) })
            .buffer_unordered(self.concurrency);

        while let Some((index, joined)) = completions.next().await {
            let id = &ids[index];
            let outcome = match joined {
                Ok(Ok(records)) => {
                    debug!(id = %id, records = records.len(), "Harvest item done");
                    Ok(records)
                }
                Ok(Err(e)) => {
                    warn!(id = %id, error = %e, "Harvest item failed");
                    Err(Error::HarvestItemFailed {
                        id: id.clone(),
                        reason: format!("{:#}", e),
                    })
                }
                Err(e) => {
                    error!(id = %id, error = %e, "Harvest task aborted");
                    let reason = if e.is_panic() { "task panicked" } else { "task cancelled" };
                    Err(Error::HarvestItemFailed {
                        id: id.clone(),
                        reason: reason.to_string(),
                    })
                }
            };
            slots[index] = Some(outcome);
        }
        drop(completions);

        let results: Vec<HarvestResult<T>> = ids
            .into_iter()
            .zip(slots)
            .map(|(id, slot)| {
                let outcome = slot.unwrap_or_else(|| {
                    Err(Error::HarvestItemFailed {
                        id: id.clone(),
                        reason: "no result produced".to_string(),
                    })
                });
                HarvestResult { id, outcome }
            })
            .collect();

        let records: Vec<T> = results
            .iter()
            .filter_map(|r| r.outcome.as_ref().ok())
            .flat_map(|records| records.iter().cloned())
            .collect();

        let stored = if records.is_empty() {
            debug!(category, "Nothing harvested, skipping sink write");
            Ok(0)
        } else {
            let batch = HarvestBatch::new(category, account, records);
            match self.sink.persist(&batch).await {
                Ok(()) => Ok(batch.records.len()),
                Err(e) => {
                    error!(category, error = %e, "Failed to store harvest batch");
                    Err(e)
                }
            }
        };

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        info!(
            category,
            account,
            total,
            succeeded,
            failed = total - succeeded,
            stored = stored.as_ref().ok().copied(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Harvest complete"
        );

        HarvestReport {
            category: category.to_string(),
            results,
            stored,
        }
    }
}
