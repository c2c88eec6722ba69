//! Topology wiring and process launch.
//!
//! The [`Manager`] owns unstarted minions by name, wires channels between
//! them and forks one OS process per minion. After [`Manager::run`] it no
//! longer mediates anything: children coordinate through their state stores
//! and channels only. The parent may still request a stop by writing the
//! status key, reap children with [`Manager::wait`] and unlink leftovers with
//! [`Manager::cleanup`].

use crate::actor;
use crate::error::{MinionError, MinionResult};
use crate::logger::{LoggerMinion, ReporterLayer, open_log_queue, reporter_subscriber};
use crate::minion::Minion;
use minion_common::config::{ConfigError, LoggerConfig, MinionConfig, TopologyConfig};
use minion_common::consts::{channel_name, log_queue_name, state_store_name};
use minion_common::status::MinionStatus;
use minion_shm::SharedStateStore;
use minion_shm::platform::unlink_segment;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

/// Body of a minion process, given its unstarted [`Minion`].
///
/// Usually wraps an [`Actor`](crate::actor::Actor) and calls
/// [`actor::run`]. `Ok` exits the process with code 0, `Err` with 1.
pub type EntryPoint = Box<dyn FnOnce(Minion) -> MinionResult<()>>;

enum Kind {
    Custom(EntryPoint),
    Logger(LoggerConfig),
}

struct Slot {
    minion: Option<Minion>,
    entry: Option<EntryPoint>,
    logger: Option<LoggerConfig>,
    pid: Option<Pid>,
    reporter_of: Option<String>,
}

/// Which minions [`Manager::run`] launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every minion not launched yet
    All,
    /// Only these names
    Names(Vec<String>),
}

/// Owner of a minion topology.
pub struct Manager {
    defaults: MinionConfig,
    slots: BTreeMap<String, Slot>,
    connections: Vec<(String, String)>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    /// Empty topology using the default minion configuration.
    pub fn new() -> Self {
        Self {
            defaults: MinionConfig::default(),
            slots: BTreeMap::new(),
            connections: Vec::new(),
        }
    }

    /// Empty topology whose minions default to `defaults`.
    pub fn with_defaults(defaults: MinionConfig) -> MinionResult<Self> {
        defaults.validate()?;
        Ok(Self {
            defaults,
            ..Self::new()
        })
    }

    fn insert(&mut self, minion: Minion, kind: Kind) -> MinionResult<()> {
        let name = minion.name().to_string();
        if self.slots.contains_key(&name) {
            return Err(ConfigError::ValidationError(format!("duplicate minion name '{name}'")).into());
        }
        let (entry, logger) = match kind {
            Kind::Custom(entry) => (Some(entry), None),
            Kind::Logger(config) => (None, Some(config)),
        };
        self.slots.insert(
            name,
            Slot {
                minion: Some(minion),
                entry,
                logger,
                pid: None,
                reporter_of: None,
            },
        );
        Ok(())
    }

    /// Register a minion with the default configuration.
    pub fn add_minion<F>(&mut self, name: &str, entry: F) -> MinionResult<()>
    where
        F: FnOnce(Minion) -> MinionResult<()> + 'static,
    {
        self.add_minion_with_config(name, self.defaults.clone(), entry)
    }

    /// Register a minion with its own configuration.
    pub fn add_minion_with_config<F>(
        &mut self,
        name: &str,
        config: MinionConfig,
        entry: F,
    ) -> MinionResult<()>
    where
        F: FnOnce(Minion) -> MinionResult<()> + 'static,
    {
        let minion = Minion::with_config(name, config)?;
        self.insert(minion, Kind::Custom(Box::new(entry)))
    }

    /// Register a [`LoggerMinion`].
    pub fn add_logger(&mut self, config: LoggerConfig) -> MinionResult<()> {
        config.validate()?;
        let minion = Minion::with_config(config.name.clone(), self.defaults.clone())?;
        self.insert(minion, Kind::Logger(config))
    }

    /// Redirect `minion`'s logging to `logger`.
    pub fn attach_reporter(&mut self, minion: &str, logger: &str) -> MinionResult<()> {
        if self.logger_config(logger).is_none() {
            return Err(MinionError::UnknownMinion {
                name: logger.to_string(),
            });
        }
        let slot = self.slot_mut(minion)?;
        slot.reporter_of = Some(logger.to_string());
        Ok(())
    }

    /// Names of all registered minions.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Process id of a launched minion.
    pub fn pid(&self, name: &str) -> Option<Pid> {
        self.slots.get(name).and_then(|s| s.pid)
    }

    fn slot_mut(&mut self, name: &str) -> MinionResult<&mut Slot> {
        self.slots
            .get_mut(name)
            .ok_or_else(|| MinionError::UnknownMinion {
                name: name.to_string(),
            })
    }

    fn unlaunched(&mut self, name: &str) -> MinionResult<&mut Minion> {
        self.slot_mut(name)?
            .minion
            .as_mut()
            .ok_or_else(|| MinionError::UnknownMinion {
                name: name.to_string(),
            })
    }

    /// Wire a channel pair between two registered, unlaunched minions.
    pub fn connect(&mut self, a: &str, b: &str) -> MinionResult<()> {
        if a == b {
            return Err(MinionError::SelfConnection {
                name: a.to_string(),
            });
        }
        self.unlaunched(b)?;
        let mut first = self
            .slot_mut(a)?
            .minion
            .take()
            .ok_or_else(|| MinionError::UnknownMinion {
                name: a.to_string(),
            })?;
        let result = self.unlaunched(b).and_then(|second| first.connect(second));
        if let Some(slot) = self.slots.get_mut(a) {
            slot.minion = Some(first);
        }
        result?;
        let known = self
            .connections
            .iter()
            .any(|(x, y)| (x == a && y == b) || (x == b && y == a));
        if !known {
            self.connections.push((a.to_string(), b.to_string()));
        }
        Ok(())
    }

    /// Apply a topology file to the registered minions.
    ///
    /// Entry points come from code, so every `[[minion]]` must already be
    /// registered; the optional `[logger]` is added here.
    pub fn wire(&mut self, topology: &TopologyConfig) -> MinionResult<()> {
        topology.validate()?;
        self.defaults = topology.defaults.clone();
        if let Some(logger) = &topology.logger {
            if !self.slots.contains_key(&logger.name) {
                self.add_logger(logger.clone())?;
            }
        }
        for entry in &topology.minions {
            let config = topology.config_for(entry);
            self.unlaunched(&entry.name)?.set_config(config)?;
            if let Some(logger) = &entry.reporter_of {
                self.attach_reporter(&entry.name, logger)?;
            }
        }
        for connection in &topology.connections {
            self.connect(&connection.a, &connection.b)?;
        }
        info!(
            "Wired topology {} ({} minions, {} connections)",
            topology.shared.service_name,
            self.slots.len(),
            self.connections.len()
        );
        Ok(())
    }

    fn logger_config(&self, name: &str) -> Option<&LoggerConfig> {
        self.slots.get(name).and_then(|s| s.logger.as_ref())
    }

    fn reporters_of(&self, logger: &str) -> Vec<String> {
        self.slots
            .iter()
            .filter(|(_, s)| s.reporter_of.as_deref() == Some(logger))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Fork one process per selected minion that has not been launched.
    ///
    /// Log queues are created first so reporters never race their logger.
    pub fn run(&mut self, selection: Selection) -> MinionResult<()> {
        let names: Vec<String> = match selection {
            Selection::All => self.slots.keys().cloned().collect(),
            Selection::Names(names) => names,
        };
        for name in &names {
            if !self.slots.contains_key(name) {
                return Err(MinionError::UnknownMinion { name: name.clone() });
            }
        }

        for (name, slot) in &self.slots {
            if let Some(config) = &slot.logger {
                open_log_queue(config, self.defaults.lock)?;
                debug!("Log queue of {} ready", name);
            }
        }

        for name in names {
            self.launch(&name)?;
        }
        Ok(())
    }

    fn launch(&mut self, name: &str) -> MinionResult<()> {
        let reporter = self
            .slots
            .get(name)
            .and_then(|s| s.reporter_of.as_deref())
            .and_then(|logger| self.logger_config(logger))
            .cloned();
        let reporters = self.reporters_of(name);

        let slot = self.slot_mut(name)?;
        let Some(minion) = slot.minion.take() else {
            debug!("{} already launched", name);
            return Ok(());
        };
        let kind = match (slot.logger.clone(), slot.entry.take()) {
            (Some(config), _) => Kind::Logger(config),
            (None, Some(entry)) => Kind::Custom(entry),
            (None, None) => {
                return Err(MinionError::UnknownMinion {
                    name: name.to_string(),
                });
            }
        };

        // SAFETY: the child only runs the minion body and leaves through
        // `_exit`, never returning into the caller's stack.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let code = match run_child(minion, kind, reporter, reporters) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("{} exited with error: {}", name, e);
                        1
                    }
                };
                // SAFETY: `_exit` skips atexit handlers and stdio flushes that
                // belong to the parent.
                unsafe { libc::_exit(code) }
            }
            Ok(ForkResult::Parent { child }) => {
                slot.pid = Some(child);
                info!("Launched {} (pid {})", name, child);
                Ok(())
            }
            Err(source) => Err(MinionError::Spawn {
                name: name.to_string(),
                source,
            }),
        }
    }

    /// Ask a launched minion to shut down by writing its status key.
    pub fn stop(&mut self, name: &str) -> MinionResult<()> {
        if !self.slots.contains_key(name) {
            return Err(MinionError::UnknownMinion {
                name: name.to_string(),
            });
        }
        let mut store = SharedStateStore::open(name, self.defaults.lock)?;
        store.set_status(MinionStatus::ShuttingDown)?;
        store.close();
        info!("Requested shutdown of {}", name);
        Ok(())
    }

    /// [`stop`](Self::stop) every launched minion, logging failures.
    pub fn stop_all(&mut self) {
        let launched: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, s)| s.pid.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        for name in launched {
            if let Err(e) = self.stop(&name) {
                warn!("Could not stop {}: {}", name, e);
            }
        }
    }

    /// Block until `name` exits. Returns its exit code (`128 + signal` when
    /// killed).
    pub fn wait_for(&mut self, name: &str) -> MinionResult<i32> {
        let slot = self.slot_mut(name)?;
        let Some(pid) = slot.pid.take() else {
            return Err(MinionError::NotStarted {
                name: name.to_string(),
            });
        };
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    debug!("{} exited with {}", name, code);
                    return Ok(code);
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    warn!("{} killed by {:?}", name, signal);
                    return Ok(128 + signal as i32);
                }
                Ok(_) => continue,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(source) => {
                    return Err(MinionError::Spawn {
                        name: name.to_string(),
                        source,
                    });
                }
            }
        }
    }

    /// Reap every launched minion.
    pub fn wait(&mut self) -> MinionResult<BTreeMap<String, i32>> {
        let launched: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, s)| s.pid.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        let mut codes = BTreeMap::new();
        for name in launched {
            let code = self.wait_for(&name)?;
            codes.insert(name, code);
        }
        Ok(codes)
    }

    /// Unlink every channel, log queue and state store this topology names.
    ///
    /// Only meant for after [`wait`](Self::wait): segments of live children
    /// are removed too.
    pub fn cleanup(&mut self) {
        let mut names = Vec::new();
        for (a, b) in &self.connections {
            names.push(channel_name(a, b));
            names.push(channel_name(b, a));
        }
        for (name, slot) in &self.slots {
            if slot.logger.is_some() {
                names.push(log_queue_name(name));
            }
            names.push(state_store_name(name));
        }
        for name in names {
            if let Err(e) = unlink_segment(&name) {
                warn!("Cleanup of {} failed: {}", name, e);
            }
        }
    }
}

fn run_child(
    minion: Minion,
    kind: Kind,
    reporter: Option<LoggerConfig>,
    reporters: Vec<String>,
) -> MinionResult<()> {
    let _guard = match &reporter {
        Some(logger) => {
            let layer = ReporterLayer::attach(minion.name(), logger, minion.config().lock)?;
            let level = minion.config().log_level;
            Some(tracing::subscriber::set_default(reporter_subscriber(layer, level)))
        }
        None => None,
    };

    match kind {
        Kind::Custom(entry) => entry(minion),
        Kind::Logger(config) => {
            let mut logger = LoggerMinion::new(minion, config)?;
            for name in &reporters {
                logger.add_reporter(name);
            }
            actor::run(&mut logger)
        }
    }
}
