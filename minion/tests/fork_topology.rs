//! Multi-process topology test.
//!
//! Uses `fork()` through [`Manager::run`]:
//! - A counter publishes `count`, logs through a logger minion and stops
//!   itself once an observer acknowledges
//! - The observer links the counter, acknowledges, then waits until the
//!   counter's state store is gone
//! - The logger exits on its own after its only reporter died
//!
//! A second topology launches only part of its registered minions.
//!
//! Observations are written to files since children cannot assert.

use minion::{Actor, Liveness, Manager, Minion, MinionResult, Selection, run};
use minion_common::config::{LoggerConfig, MinionConfig};
use minion_common::consts::state_store_name;
use minion_common::status::MinionStatus;
use minion_shm::SharedBuffer;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

fn config() -> MinionConfig {
    MinionConfig {
        refresh_interval_ms: 5,
        max_idle_ms: 5,
        ..MinionConfig::default()
    }
}

struct Counter {
    minion: Minion,
    observer: String,
    count: u64,
    acked: bool,
}

impl Actor for Counter {
    fn minion(&mut self) -> &mut Minion {
        &mut self.minion
    }

    fn on_time(&mut self, _elapsed: Duration) {
        self.count += 1;
        self.minion.set_state("count", &self.count);
        if self.count % 10 == 0 {
            info!("count reached {}", self.count);
        }
        while let Ok(Some(message)) = self.minion.get(&self.observer) {
            self.acked |= message.tag == "ack";
        }
        if (self.acked && self.count >= 10) || self.count >= 2_000 {
            self.minion.set_status(MinionStatus::ShuttingDown);
        }
    }
}

struct Observer {
    minion: Minion,
    counter: String,
    max_seen: u64,
    acked: bool,
    saw_exit: bool,
    ticks: u64,
}

impl Actor for Observer {
    fn minion(&mut self) -> &mut Minion {
        &mut self.minion
    }

    fn on_time(&mut self, _elapsed: Duration) {
        self.ticks += 1;
        if !self.acked {
            if let Some(count) = self.minion.get_state_from_as::<u64>(&self.counter, "count") {
                self.max_seen = self.max_seen.max(count);
                if count > 0 {
                    self.acked = self.minion.send(&self.counter, "ack", json!(null)).unwrap_or(false);
                }
            }
        } else if self.minion.is_minion_alive(&self.counter) == Liveness::Dead {
            self.saw_exit = true;
        }
        if self.saw_exit || self.ticks >= 4_000 {
            self.minion.set_status(MinionStatus::ShuttingDown);
        }
    }
}

/// Runs a fixed number of ticks, then stops itself.
struct Ticker {
    minion: Minion,
    ticks: u64,
}

impl Actor for Ticker {
    fn minion(&mut self) -> &mut Minion {
        &mut self.minion
    }

    fn on_time(&mut self, _elapsed: Duration) {
        self.ticks += 1;
        self.minion.set_state("ticks", &self.ticks);
        if self.ticks >= 5 {
            self.minion.set_status(MinionStatus::ShuttingDown);
        }
    }
}

fn tick(minion: Minion) -> MinionResult<()> {
    run(&mut Ticker { minion, ticks: 0 })
}

fn write_report(path: PathBuf, observer: &Observer) -> MinionResult<()> {
    let report = json!({
        "max_seen": observer.max_seen,
        "acked": observer.acked,
        "saw_exit": observer.saw_exit,
    });
    std::fs::write(path, report.to_string())?;
    Ok(())
}

#[test]
fn test_manager_runs_counter_observer_and_logger() {
    let pid = std::process::id();
    let counter = format!("fork_counter_{pid}");
    let observer = format!("fork_observer_{pid}");
    let logger = format!("fork_logger_{pid}");

    let dir = tempfile::tempdir().unwrap();
    let report_path = dir.path().join("observer.json");
    let mut logger_config = LoggerConfig::named(&logger);
    logger_config.log_dir = Some(dir.path().join("logs"));
    logger_config.record_timeout_ms = 5;
    logger_config.liveness_interval_ms = 10;

    let mut manager = Manager::with_defaults(config()).unwrap();
    let observer_name = observer.clone();
    manager
        .add_minion(&counter, move |minion| {
            run(&mut Counter {
                minion,
                observer: observer_name,
                count: 0,
                acked: false,
            })
        })
        .unwrap();
    let counter_name = counter.clone();
    let report = report_path.clone();
    manager
        .add_minion(&observer, move |minion| {
            let mut actor = Observer {
                minion,
                counter: counter_name,
                max_seen: 0,
                acked: false,
                saw_exit: false,
                ticks: 0,
            };
            run(&mut actor)?;
            write_report(report, &actor)
        })
        .unwrap();
    manager.add_logger(logger_config).unwrap();
    manager.attach_reporter(&counter, &logger).unwrap();
    manager.connect(&counter, &observer).unwrap();

    manager.run(Selection::All).unwrap();
    assert!(manager.pid(&counter).is_some());
    assert!(manager.pid(&observer).is_some());

    let codes = manager.wait().unwrap();
    assert_eq!(codes.get(&counter), Some(&0));
    assert_eq!(codes.get(&observer), Some(&0));
    assert_eq!(codes.get(&logger), Some(&0));

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["acked"], json!(true));
    assert_eq!(report["saw_exit"], json!(true));
    assert!(report["max_seen"].as_u64().unwrap() > 0);

    let log = std::fs::read_to_string(dir.path().join("logs").join(format!("{counter}.log")))
        .unwrap();
    assert!(log.contains("count reached 10"));

    for name in [&counter, &observer, &logger] {
        assert!(!SharedBuffer::exists(&state_store_name(name)).unwrap());
    }
    manager.cleanup();
}

#[test]
fn test_manager_launches_selected_subset() {
    let pid = std::process::id();
    let (left, right, spare) = (
        format!("subset_left_{pid}"),
        format!("subset_right_{pid}"),
        format!("subset_spare_{pid}"),
    );

    let mut manager = Manager::with_defaults(config()).unwrap();
    for name in [&left, &right, &spare] {
        manager.add_minion(name, tick).unwrap();
    }
    manager.connect(&left, &right).unwrap();

    manager
        .run(Selection::Names(vec![left.clone(), right.clone()]))
        .unwrap();
    assert!(manager.pid(&left).is_some());
    assert!(manager.pid(&right).is_some());
    assert!(manager.pid(&spare).is_none());

    let codes = manager.wait().unwrap();
    assert_eq!(
        codes.keys().cloned().collect::<Vec<_>>(),
        vec![left.clone(), right.clone()]
    );
    assert!(codes.values().all(|&code| code == 0));

    // The spare was never forked and can still be launched on its own
    assert!(!SharedBuffer::exists(&state_store_name(&spare)).unwrap());
    manager.run(Selection::Names(vec![spare.clone()])).unwrap();
    let codes = manager.wait().unwrap();
    assert_eq!(codes.keys().collect::<Vec<_>>(), vec![&spare]);
    assert_eq!(codes.get(&spare), Some(&0));

    manager.cleanup();
    for name in [&left, &right, &spare] {
        assert!(!SharedBuffer::exists(&state_store_name(name)).unwrap());
    }
}
