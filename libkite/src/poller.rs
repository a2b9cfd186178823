//! One poll-process-exit cycle.
//!
//! Lock the cursor, load it, connect to the queue if needed, fetch the job
//! listing, dispatch every newly finished job, disconnect and save the new
//! cursor. Jobs are handled strictly in the order the platform lists them.

use std::fmt;

use derive_getters::Getters;
use serde::Serialize;

use crate::api::{ApiClient, Job, JobSource, JobStatus};
use crate::config::Config;
use crate::dispatch::{publish_job, HookRunner, Publisher, RedisPublisher};
use crate::error::{KiteError, Result};
use crate::log::*;
use crate::payload;
use crate::store::{DedupStore, ProcessedJobSet};

/// How a listed job is treated in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Still running; not recorded, looked at again next run.
    Pending,
    /// Recorded by an earlier run; recorded again, not dispatched.
    AlreadyProcessed,
    /// Finished since the last run. `event` is the hook event to fire, if
    /// hooks are enabled and the job succeeded with a known command.
    New { event: Option<String> },
}

/// Counters for one run.
#[derive(Getters, Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    fetched: usize,
    pending: usize,
    already_processed: usize,
    new_jobs: usize,
    hooks_run: usize,
    hook_failures: usize,
    published: usize,
    dry_run: bool,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} jobs fetched: {} new, {} already processed, {} pending; {} hooks run ({} failed), {} published",
            self.fetched,
            self.new_jobs,
            self.already_processed,
            self.pending,
            self.hooks_run,
            self.hook_failures,
            self.published
        )?;
        if self.dry_run {
            write!(f, " (dry run)")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Poller<'a> {
    config: &'a Config,
    source: Box<dyn JobSource>,
    store: DedupStore,
    hooks: Option<HookRunner>,
    publisher: Option<Box<dyn Publisher>>,
    dry_run: bool,
}

impl<'a> Poller<'a> {
    /// Build a poller talking to the configured platform and queue.
    pub fn new(config: &'a Config) -> Result<Self> {
        let source = Box::new(ApiClient::new(config.platform())?);
        let publisher: Option<Box<dyn Publisher>> = if *config.queue().enabled() {
            Some(Box::new(RedisPublisher::new(config.queue())?))
        } else {
            None
        };
        Ok(Self::with_parts(config, source, publisher))
    }

    /// Build a poller from an explicit job source and publisher. Hooks and
    /// the cursor location still come from `config`.
    pub fn with_parts(
        config: &'a Config,
        source: Box<dyn JobSource>,
        publisher: Option<Box<dyn Publisher>>,
    ) -> Self {
        let hooks = if *config.hooks().enabled() {
            Some(HookRunner::new(config.hooks()))
        } else {
            None
        };
        Self {
            config,
            source,
            store: DedupStore::new(config.state().path()),
            hooks,
            publisher,
            dry_run: false,
        }
    }

    /// Only report what would be dispatched: no hooks, no publishing, no
    /// cursor write.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn classify(&self, job: &Job, previous: &ProcessedJobSet) -> Classification {
        if job.status().is_pending() {
            return Classification::Pending;
        }
        if previous.contains(job.id()) {
            return Classification::AlreadyProcessed;
        }
        let event = match (&self.hooks, job.status()) {
            (Some(_), JobStatus::Succeeded) => self
                .config
                .hooks()
                .event_for(job.cmd())
                .map(str::to_string),
            _ => None,
        };
        Classification::New { event }
    }

    #[tracing::instrument(skip(self), fields(dry_run = self.dry_run))]
    pub async fn run(&self) -> Result<RunSummary> {
        let _lock = if self.dry_run {
            None
        } else {
            Some(self.store.lock()?)
        };
        let previous = self.store.load().await;

        let mut connection = match (&self.publisher, self.dry_run) {
            (Some(publisher), false) => Some(publisher.connect().await?),
            _ => None,
        };

        let jobs = self.source.list_jobs().await?;
        let mut summary = RunSummary {
            fetched: jobs.len(),
            dry_run: self.dry_run,
            ..Default::default()
        };
        let mut processed = ProcessedJobSet::new();
        let mut failure: Option<KiteError> = None;

        for job in &jobs {
            let event = match self.classify(job, &previous) {
                Classification::Pending => {
                    trace!("job {} is still pending", job.id());
                    summary.pending += 1;
                    continue;
                }
                Classification::AlreadyProcessed => {
                    trace!("job {} was handled by an earlier run", job.id());
                    processed.insert(job.id().to_string());
                    summary.already_processed += 1;
                    continue;
                }
                Classification::New { event } => event,
            };

            processed.insert(job.id().to_string());
            summary.new_jobs += 1;
            info!("new finished job {} ({})", job.id(), job.cmd());

            if self.dry_run {
                if let Some(event) = &event {
                    info!("dry run: would trigger `{}` hooks for job {}", event, job.id());
                }
                if self.publisher.is_some() {
                    info!("dry run: would publish job {}", job.id());
                }
                continue;
            }

            if let (Some(hooks), Some(event)) = (&self.hooks, &event) {
                let flat = payload::flatten(job.raw());
                let report = hooks.dispatch(event, &flat).await;
                summary.hooks_run += report.ran();
                summary.hook_failures += report.failed().len();
            }

            if let Some(connection) = connection.as_mut() {
                if let Err(e) = publish_job(&mut **connection, job).await {
                    failure = Some(e.into());
                    break;
                }
                summary.published += 1;
            }
        }

        if connection.take().is_some() {
            debug!("disconnected from queue");
        }

        if let Some(e) = failure {
            self.save_partial(&previous, processed).await;
            return Err(e);
        }

        if !self.dry_run {
            self.store.save(&processed).await?;
        }
        info!("{}", summary);
        Ok(summary)
    }

    /// Remember everything known so far after a fatal error mid-run: the old
    /// cursor plus what this run recorded before failing.
    async fn save_partial(&self, previous: &ProcessedJobSet, processed: ProcessedJobSet) {
        let mut partial = previous.clone();
        partial.extend(processed);
        match self.store.save(&partial).await {
            Ok(()) => warn!("run aborted; saved {} processed job ids", partial.len()),
            Err(e) => error!("run aborted and saving progress failed: {}", e),
        }
    }
}
