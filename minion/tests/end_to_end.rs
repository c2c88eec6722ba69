//! In-process end-to-end scenarios.
//!
//! Several minions share one test process here; handles stay on the thread
//! that started them, exactly as they would in separate processes.

use minion::{Actor, Liveness, LoggerMinion, Minion, MinionResult, ReporterLayer, Scheduler, run};
use minion_common::config::{LockSettings, LogLevel, LoggerConfig, MinionConfig};
use minion_common::status::MinionStatus;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn unique(prefix: &str) -> String {
    static CTR: AtomicU32 = AtomicU32::new(0);
    let id = CTR.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{}_{id}", std::process::id())
}

fn fast_config() -> MinionConfig {
    MinionConfig {
        refresh_interval_ms: 2,
        max_idle_ms: 2,
        ..MinionConfig::default()
    }
}

#[test]
fn test_count_scenario() {
    let mut a = Minion::new(unique("scenario_a"));
    let mut b = Minion::new(unique("scenario_b"));
    let a_name = a.name().to_string();
    a.connect(&mut b).unwrap();

    a.start().unwrap();
    assert!(a.set_state("count", &0));
    b.start().unwrap();
    assert!(b.is_linked(&a_name));
    assert_eq!(b.get_state_from(&a_name, "count"), Some(json!(0)));

    assert!(a.set_state("count", &1));
    assert_eq!(b.get_state_from_as::<u32>(&a_name, "count"), Some(1));

    assert!(a.set_status(MinionStatus::ShuttingDown));
    assert_eq!(b.get_state_from(&a_name, "status"), Some(json!(-1)));
    assert_eq!(b.is_minion_alive(&a_name), Liveness::Alive);

    a.shutdown().unwrap();
    assert_eq!(b.is_minion_alive(&a_name), Liveness::Dead);
    assert_eq!(b.get_state_from(&a_name, "count"), None);
    b.shutdown().unwrap();
}

#[test]
fn test_link_waits_for_late_peer() {
    let mut early = Minion::new(unique("early"));
    let mut late = Minion::new(unique("late"));
    let late_name = late.name().to_string();
    early.connect(&mut late).unwrap();

    early.start().unwrap();
    assert!(!early.is_linked(&late_name));

    late.start().unwrap();
    late.set_state("ready", &true);
    early.pump();
    assert!(early.is_linked(&late_name));
    assert_eq!(early.get_state_from_as::<bool>(&late_name, "ready"), Some(true));

    early.shutdown().unwrap();
    late.shutdown().unwrap();
}

/// Publishes an increasing counter and stops once the observer acknowledges.
struct Publisher {
    minion: Minion,
    observer: String,
    count: u64,
    acked: bool,
}

impl Actor for Publisher {
    fn minion(&mut self) -> &mut Minion {
        &mut self.minion
    }

    fn initialize(&mut self, _scheduler: &mut Scheduler<Self>) -> MinionResult<()> {
        self.minion.set_state("count", &self.count);
        Ok(())
    }

    fn on_time(&mut self, _elapsed: Duration) {
        self.count += 1;
        self.minion.set_state("count", &self.count);
        while let Ok(Some(message)) = self.minion.get(&self.observer) {
            if message.tag == "ack" {
                self.acked = true;
            }
        }
        if (self.acked && self.count >= 10) || self.count >= 5_000 {
            self.minion.set_status(MinionStatus::ShuttingDown);
        }
    }
}

#[test]
fn test_actor_stops_after_acknowledgement() {
    let mut publisher = Minion::with_config(unique("publisher"), fast_config()).unwrap();
    let mut observer = Minion::with_config(unique("observer"), fast_config()).unwrap();
    publisher.connect(&mut observer).unwrap();
    let publisher_name = publisher.name().to_string();
    let observer_name = observer.name().to_string();

    let handle = thread::spawn(move || {
        let mut actor = Publisher {
            minion: publisher,
            observer: observer_name,
            count: 0,
            acked: false,
        };
        run(&mut actor).map(|()| (actor.count, actor.acked))
    });

    observer.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut seen = None;
    while Instant::now() < deadline {
        observer.pump();
        if let Some(count) = observer.get_state_from_as::<u64>(&publisher_name, "count") {
            if count > 0 {
                seen = Some(count);
                break;
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert!(seen.is_some(), "publisher never counted");
    assert!(observer.send(&publisher_name, "ack", json!(null)).unwrap());

    let (count, acked) = handle.join().unwrap().unwrap();
    assert!(acked);
    assert!(count >= 10);

    observer.pump();
    assert_eq!(observer.is_minion_alive(&publisher_name), Liveness::Dead);
    observer.shutdown().unwrap();
}

#[test]
fn test_watch_state_tracks_peer_changes() {
    let mut sensor = Minion::new(unique("sensor"));
    let mut display = Minion::new(unique("display"));
    let sensor_name = sensor.name().to_string();
    sensor.connect(&mut display).unwrap();
    sensor.start().unwrap();
    display.start().unwrap();

    let mut changes = 0;
    for reading in [20.0, 20.0, 21.5, 21.5, 21.5, 19.0] {
        sensor.set_state("temperature", &reading);
        let observed: f64 = display.get_state_from_as(&sensor_name, "temperature").unwrap();
        if display.watch_state("temperature", &observed) {
            changes += 1;
        }
    }
    assert_eq!(changes, 3);

    sensor.shutdown().unwrap();
    display.shutdown().unwrap();
}

#[test]
fn test_logger_collects_until_reporter_exits() {
    let log_dir = tempfile::tempdir().unwrap();
    let mut logger_config = LoggerConfig::named(unique("collector"));
    logger_config.log_dir = Some(log_dir.path().to_path_buf());
    logger_config.record_timeout_ms = 2;
    logger_config.liveness_interval_ms = 5;

    let reporter_name = unique("reporter");
    let mut logger = LoggerMinion::new(
        Minion::with_config(logger_config.name.clone(), fast_config()).unwrap(),
        logger_config.clone(),
    )
    .unwrap();
    logger.add_reporter(&reporter_name);

    let layer = ReporterLayer::attach(&reporter_name, &logger_config, LockSettings::default()).unwrap();
    let mut reporter = Minion::new(reporter_name.clone());
    reporter.start().unwrap();

    let handle = thread::spawn(move || {
        run(&mut logger).map(|()| logger.received())
    });

    // Give the logger a chance to see the reporter alive
    thread::sleep(Duration::from_millis(50));
    let subscriber = minion::logger::reporter_subscriber(layer, LogLevel::Info);
    tracing::subscriber::with_default(subscriber, || {
        for frame in 0..5 {
            tracing::info!(frame, "frame acquired");
        }
        tracing::debug!("not forwarded");
    });
    reporter.shutdown().unwrap();

    let received = handle.join().unwrap().unwrap();
    // The reporter's own shutdown is logged outside the layer's scope
    assert_eq!(received, 5);

    let written =
        std::fs::read_to_string(log_dir.path().join(format!("{reporter_name}.log"))).unwrap();
    assert_eq!(written.lines().count(), 5);
    assert!(written.lines().all(|line| line.contains("frame acquired")));
    assert!(written.contains("frame=4"));
}
