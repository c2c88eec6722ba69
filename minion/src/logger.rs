//! Log aggregation across minion processes.
//!
//! Reporters install a [`ReporterLayer`] that turns every `tracing` event
//! into a [`LogRecord`] and pushes it onto the logger's shared queue
//! `<logger>_log_queue`. The [`LoggerMinion`] blocks on that queue with a
//! timeout, re-emits each record locally (and optionally into
//! `<log_dir>/<minion>.log`) and terminates itself once every reporter is
//! gone. A reporter counts as seen once a poll finds it alive or one of its
//! records arrives; one never seen counts as gone when still absent after
//! the configured startup grace.

use crate::actor::Actor;
use crate::error::MinionResult;
use crate::minion::{Liveness, Minion};
use crate::scheduler::Scheduler;
use minion_common::config::{LockSettings, LogLevel, LoggerConfig};
use minion_common::consts::log_queue_name;
use minion_common::message::LogRecord;
use minion_common::status::MinionStatus;
use minion_shm::ShmQueue;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber, debug, error, info, trace, warn};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};

/// Create (or attach to) the shared queue of logger `config.name`.
pub fn open_log_queue(config: &LoggerConfig, lock: LockSettings) -> MinionResult<ShmQueue> {
    Ok(ShmQueue::open_or_create(
        &log_queue_name(&config.name),
        config.queue_capacity,
        config.slot_size,
        lock,
    )?)
}

#[derive(Debug, Default, Clone, Copy)]
struct ReporterState {
    seen_alive: bool,
    dead: bool,
}

/// Minion draining the shared log queue.
pub struct LoggerMinion {
    minion: Minion,
    config: LoggerConfig,
    queue: Option<ShmQueue>,
    reporters: BTreeMap<String, ReporterState>,
    sinks: HashMap<String, File>,
    started_at: Option<Instant>,
    last_liveness: Option<Instant>,
    received: u64,
}

impl LoggerMinion {
    /// Logger named after `config.name`, using `minion` for its own state.
    pub fn new(minion: Minion, config: LoggerConfig) -> MinionResult<Self> {
        config.validate()?;
        Ok(Self {
            minion,
            config,
            queue: None,
            reporters: BTreeMap::new(),
            sinks: HashMap::new(),
            started_at: None,
            last_liveness: None,
            received: 0,
        })
    }

    /// Track a reporter's liveness.
    pub fn add_reporter(&mut self, reporter: &str) {
        self.reporters
            .insert(reporter.to_string(), ReporterState::default());
    }

    /// Records dispatched so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Reporters currently tracked.
    pub fn reporters(&self) -> impl Iterator<Item = &str> {
        self.reporters.keys().map(String::as_str)
    }

    fn dispatch(&mut self, record: &LogRecord) {
        self.received += 1;
        if let Some(state) = self.reporters.get_mut(&record.minion) {
            state.seen_alive = true;
        }
        let minion = record.minion.as_str();
        let origin = record.target.as_str();
        match record.level {
            LogLevel::Trace => trace!(minion, origin, "{}", record.message),
            LogLevel::Debug => debug!(minion, origin, "{}", record.message),
            LogLevel::Info => info!(minion, origin, "{}", record.message),
            LogLevel::Warn => warn!(minion, origin, "{}", record.message),
            LogLevel::Error => error!(minion, origin, "{}", record.message),
        }

        if let Err(e) = self.write_sink(record) {
            warn!("Log sink for {} failed: {}", record.minion, e);
        }
    }

    fn write_sink(&mut self, record: &LogRecord) -> std::io::Result<()> {
        let Some(dir) = &self.config.log_dir else {
            return Ok(());
        };
        if !self.sinks.contains_key(&record.minion) {
            std::fs::create_dir_all(dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(format!("{}.log", record.minion)))?;
            self.sinks.insert(record.minion.clone(), file);
        }
        match self.sinks.get_mut(&record.minion) {
            Some(file) => writeln!(
                file,
                "{} {:?} {}: {}",
                record.timestamp_us, record.level, record.target, record.message
            ),
            None => Ok(()),
        }
    }

    /// Dequeue and dispatch at most one record, waiting up to `timeout`.
    pub fn receive_one(&mut self, timeout: Duration) -> bool {
        let Some(queue) = self.queue.as_mut() else {
            return false;
        };
        match queue.pop_json_timeout::<LogRecord>(timeout) {
            Ok(Some(record)) => {
                self.dispatch(&record);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Dropping unreadable log record: {}", e);
                false
            }
        }
    }

    /// Dispatch everything still queued.
    pub fn flush(&mut self) -> usize {
        let mut flushed = 0;
        while self.receive_one(Duration::ZERO) {
            flushed += 1;
        }
        flushed
    }

    /// Check every reporter. Returns `true` once every reporter is confirmed
    /// dead. Absence only counts for a reporter already seen or once the
    /// startup grace has run out.
    pub fn poll_reporters(&mut self) -> bool {
        let grace_over = self
            .started_at
            .get_or_insert_with(Instant::now)
            .elapsed()
            >= self.config.reporter_grace();
        let names: Vec<String> = self.reporters.keys().cloned().collect();
        for name in names {
            let liveness = self.minion.is_minion_alive(&name);
            let Some(state) = self.reporters.get_mut(&name) else {
                continue;
            };
            match liveness {
                Liveness::Alive => state.seen_alive = true,
                Liveness::Dead if !state.dead && state.seen_alive => {
                    state.dead = true;
                    info!("Reporter {} is gone", name);
                }
                Liveness::Dead if !state.dead && grace_over => {
                    state.dead = true;
                    warn!("Reporter {} never showed up", name);
                }
                _ => {}
            }
        }
        !self.reporters.is_empty() && self.reporters.values().all(|s| s.dead)
    }
}

impl Actor for LoggerMinion {
    fn minion(&mut self) -> &mut Minion {
        &mut self.minion
    }

    fn initialize(&mut self, _scheduler: &mut Scheduler<Self>) -> MinionResult<()> {
        self.queue = Some(open_log_queue(&self.config, self.minion.config().lock)?);
        self.started_at = Some(Instant::now());
        info!(
            "Logger {} collecting from {} reporters",
            self.config.name,
            self.reporters.len()
        );
        Ok(())
    }

    fn on_time(&mut self, _elapsed: Duration) {
        self.receive_one(self.config.record_timeout());

        let due = self
            .last_liveness
            .is_none_or(|at| at.elapsed() >= self.config.liveness_interval());
        if due {
            self.last_liveness = Some(Instant::now());
            if self.poll_reporters() {
                let flushed = self.flush();
                info!(
                    "All reporters gone; flushed {} records, {} total",
                    flushed, self.received
                );
                self.minion.set_status(MinionStatus::Terminated);
            }
        }
    }

    fn on_close(&mut self) {
        self.flush();
        if let Some(mut queue) = self.queue.take() {
            if let Err(e) = queue.terminate() {
                warn!("Failed to release log queue: {}", e);
            }
        }
        for file in self.sinks.values_mut() {
            let _ = file.flush();
        }
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: String,
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl RecordVisitor {
    fn finish(mut self) -> String {
        self.message.push_str(&self.fields);
        self.message
    }
}

/// `tracing` layer forwarding events to a logger's shared queue.
pub struct ReporterLayer {
    minion: String,
    queue: Mutex<ShmQueue>,
    dropped: AtomicU64,
}

impl ReporterLayer {
    /// Layer reporting as `minion` into the queue of logger `config.name`.
    pub fn attach(minion: &str, config: &LoggerConfig, lock: LockSettings) -> MinionResult<Self> {
        Ok(Self {
            minion: minion.to_string(),
            queue: Mutex::new(open_log_queue(config, lock)?),
            dropped: AtomicU64::new(0),
        })
    }

    /// Records that could not be queued.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<S: Subscriber> Layer<S> for ReporterLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        let record = LogRecord::now(
            &self.minion,
            LogLevel::from(metadata.level()),
            metadata.target(),
            visitor.finish(),
        );

        // try_lock: an event raised while pushing must not deadlock
        let pushed = match self.queue.try_lock() {
            Some(mut queue) => queue.push_json(&record).is_ok(),
            None => false,
        };
        if !pushed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Subscriber for a reporter process: everything at `level` and above goes
/// to the logger queue.
pub fn reporter_subscriber(layer: ReporterLayer, level: LogLevel) -> impl Subscriber + Send + Sync {
    let filter = tracing_subscriber::filter::LevelFilter::from_level(level.into());
    tracing_subscriber::registry().with(layer.with_filter(filter))
}
