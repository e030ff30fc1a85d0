//! Command handlers.
//!
//! Every durable collaborator is constructed here, once per process, and
//! handed to the workers.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use geoscan_ai::{MismatchDetector, OnlineLearner, SharedLearner};
use geoscan_core::{BoundingBox, Position, RuleTable, Target, TargetId, TargetSettings, TargetStatus};
use geoscan_infra::archive::ArchiveLog;
use geoscan_infra::config::GeoscanConfig;
use geoscan_infra::db::{Database, STATE_SCHEMA};
use geoscan_infra::event_store::{EventStore, SqliteEventStore};
use geoscan_infra::fetch::OfflineFetcher;
use geoscan_infra::heartbeat::HeartbeatWriter;
use geoscan_infra::jobs::{JobQueue, SqliteJobQueue};
use geoscan_infra::targets::{SqliteTargetStore, TargetStore};
use geoscan_infra::worker::{ScanWorker, WorkerConfig, WorkerDeps, WorkerStats};

use crate::cli::CreateTarget;

/// Window for the high-value rate in `status`.
const RATE_WINDOW: Duration = Duration::from_secs(5 * 60);

pub struct App {
    config: GeoscanConfig,
    queue: Arc<SqliteJobQueue>,
    targets: Arc<SqliteTargetStore>,
}

impl App {
    /// Open the state database (queue + targets).
    pub fn open(config: GeoscanConfig) -> Result<Self> {
        let path = config.storage.state_db();
        let db = Database::open(&path, &STATE_SCHEMA)
            .with_context(|| format!("failed to open state database {}", path.display()))?;
        Ok(Self {
            queue: Arc::new(SqliteJobQueue::new(db.clone())),
            targets: Arc::new(SqliteTargetStore::new(db)),
            config,
        })
    }

    pub fn config(&self) -> &GeoscanConfig {
        &self.config
    }

    fn open_events(&self) -> Result<Arc<SqliteEventStore>> {
        let path = self.config.storage.events_db();
        let store = SqliteEventStore::open(&path, self.config.events.clone())
            .with_context(|| format!("failed to open event store {}", path.display()))?;
        Ok(Arc::new(store))
    }

    fn heartbeat(&self) -> HeartbeatWriter {
        HeartbeatWriter::new(self.config.storage.heartbeat_dir())
    }

    /// Look a target up by id, falling back to an exact name match.
    pub fn resolve_target(&self, key: &str) -> Result<Target> {
        if let Ok(id) = key.parse::<TargetId>() {
            return self
                .targets
                .get(id)?
                .with_context(|| format!("target {id} not found"));
        }
        let mut matches: Vec<Target> = self.targets.list()?.into_iter().filter(|t| t.name == key).collect();
        match matches.len() {
            0 => bail!("no target named {key:?}"),
            1 => Ok(matches.remove(0)),
            n => bail!("{n} targets are named {key:?}; use the id"),
        }
    }

    pub fn create_target(&self, args: &CreateTarget, out: &mut dyn Write) -> Result<Target> {
        let bounds = BoundingBox::from_center(Position::new(args.lat, args.lon), args.radius_km)
            .context("invalid target area")?;

        let mut settings = TargetSettings::default();
        if let Some(n) = args.points_per_cycle {
            settings = settings.with_points_per_cycle(n);
        }
        if let Some(n) = args.max_points {
            settings = settings.with_max_total_points(n);
        }
        if let Some(secs) = args.interval_secs {
            settings = settings.with_scan_interval(Duration::from_secs(secs));
        }

        let mut target = Target::new(&args.name, bounds, settings).context("invalid target")?;
        if let Some(d) = &args.description {
            target = target.with_description(d);
        }
        self.targets.save(&target)?;
        info!(target_id = %target.id, name = %target.name, "target created");
        writeln!(out, "{}", target.id)?;
        Ok(target)
    }

    pub fn list_targets(&self, out: &mut dyn Write) -> Result<()> {
        for t in self.targets.list()? {
            writeln!(
                out,
                "{}  {:<20} {:<10} {:>6}/{:<6} ({:.0}%)",
                t.id,
                t.name,
                t.status.as_str(),
                t.points_collected,
                t.settings.max_total_points,
                t.progress_percent()
            )?;
        }
        Ok(())
    }

    pub fn enqueue(&self, key: &str, priority: i32, out: &mut dyn Write) -> Result<()> {
        let mut target = self.resolve_target(key)?;
        let job_id = self.queue.enqueue(target.id, priority)?;
        target.set_status(TargetStatus::Queued);
        self.targets.save(&target)?;
        info!(%job_id, target_id = %target.id, priority, "job enqueued");
        writeln!(out, "{job_id}")?;
        Ok(())
    }

    pub fn jobs(&self, key: &str, out: &mut dyn Write) -> Result<()> {
        let target = self.resolve_target(key)?;
        for job in self.queue.jobs_for_target(target.id)? {
            writeln!(
                out,
                "{}  {:<9} {:>5.1}%  {}  {}",
                job.id,
                job.status,
                job.progress_percent,
                job.worker_id.as_deref().unwrap_or("-"),
                job.error_message.or(job.progress_message).unwrap_or_default()
            )?;
        }
        Ok(())
    }

    pub fn reclaim(&self, max_age: Option<Duration>, out: &mut dyn Write) -> Result<u64> {
        let max_age = max_age.unwrap_or_else(|| self.config.worker.stale_after());
        let n = self.queue.reclaim_stale(max_age)?;
        writeln!(out, "reclaimed {n} job(s)")?;
        Ok(n)
    }

    pub fn status(&self, out: &mut dyn Write) -> Result<()> {
        let events = self.open_events()?;
        let report = json!({
            "queue": self.queue.stats()?,
            "active_jobs": self.queue.active_jobs()?,
            "events": events.stats()?,
            "high_value_rate": events.high_value_rate(RATE_WINDOW)?,
            "mismatches": events.mismatch_histogram()?,
            "learning_curve": events.learning_curve(15)?,
            "workers": self.heartbeat().read_all(),
        });
        serde_json::to_writer_pretty(&mut *out, &report)?;
        writeln!(out)?;
        Ok(())
    }

    fn worker_deps(&self) -> Result<WorkerDeps> {
        let storage = &self.config.storage;
        let archive = ArchiveLog::open(storage.archive_path())
            .with_context(|| format!("failed to open archive {}", storage.archive_path().display()))?;
        let learner: SharedLearner = OnlineLearner::open(self.config.learner.clone(), storage.model_path()).into_shared();

        Ok(WorkerDeps {
            queue: self.queue.clone(),
            targets: self.targets.clone(),
            events: self.open_events()?,
            archive: Arc::new(archive),
            learner,
            detector: MismatchDetector::new(self.config.mismatch.clone()),
            fetcher: Arc::new(OfflineFetcher),
            rules: Arc::new(RuleTable::default()),
            heartbeat: self.config.worker.heartbeat.then(|| self.heartbeat()),
        })
    }

    fn worker_config(&self, index: usize) -> WorkerConfig {
        WorkerConfig::from_settings(
            &self.config.worker,
            format!("worker-{}-{index}", std::process::id()),
        )
    }

    /// Run workers until `token` is cancelled. With `once`, a single worker
    /// processes at most one job and returns.
    pub fn run(&self, workers: Option<usize>, once: bool, token: &CancellationToken) -> Result<Vec<WorkerStats>> {
        let deps = self.worker_deps()?;

        if once {
            let mut worker = ScanWorker::new(self.worker_config(0), deps);
            worker.reclaim_stale()?;
            let claimed = worker.run_once(token)?;
            worker.finish();
            if !claimed {
                info!("no pending jobs");
            }
            return Ok(vec![worker.stats()]);
        }

        let count = workers.unwrap_or(self.config.worker.count);
        if count == 0 {
            bail!("at least one worker is required");
        }
        info!(workers = count, data_dir = %self.config.storage.data_dir.display(), "starting scan workers");

        let handles = (0..count)
            .map(|i| ScanWorker::new(self.worker_config(i), deps.clone()).spawn(token))
            .collect::<Result<Vec<_>, _>>()
            .context("failed to start workers")?;

        Ok(handles.into_iter().map(|h| h.join()).collect())
    }
}
