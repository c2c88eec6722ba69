//! The minion actor.
//!
//! A [`Minion`] is built unstarted in the process that wires the topology and
//! holds only names: its config, the peers it is connected to and the peers
//! it should link on start. [`Minion::start`] runs in the process that will
//! drive it and creates every shared memory handle there, so no handle ever
//! crosses a `fork`.
//!
//! Consumer-facing state and messaging calls never fail loudly on steady-state
//! problems (lock timeouts, dead or unlinked peers, unknown keys): they log
//! and return `None`/`false`. The `try_*` variants return the error instead.

use crate::channel::{self, Channel};
use crate::error::{MinionError, MinionResult};
use crate::scheduler::TimerCommand;
use minion_common::config::MinionConfig;
use minion_common::consts::{STATUS_KEY, array_segment_name, state_store_name};
use minion_common::message::{Message, Packet};
use minion_common::status::MinionStatus;
use minion_shm::{Element, SharedArrayBuffer, SharedBuffer, SharedStateStore, ShmError};
use ndarray::{ArrayBase, ArrayD, Data, Dimension};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, error, info, warn};

/// Result of a peer liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Peer state store exists
    Alive,
    /// Peer state store is gone
    Dead,
    /// Probe failed for another reason
    Unknown,
}

impl Liveness {
    /// Only `Alive` counts as alive.
    pub fn is_alive(self) -> bool {
        self == Self::Alive
    }
}

/// Handles discovered from a linked peer.
struct PeerLink {
    store: SharedStateStore,
    arrays: HashMap<String, SharedArrayBuffer>,
}

/// Actor identity, state store, peer links and channels.
pub struct Minion {
    name: String,
    config: MinionConfig,
    status: MinionStatus,
    started: bool,
    store: Option<SharedStateStore>,
    connected: BTreeSet<String>,
    pending_links: BTreeSet<String>,
    links: HashMap<String, PeerLink>,
    channels: HashMap<String, Channel>,
    orphaned: HashMap<String, VecDeque<Message>>,
    arrays: HashMap<String, SharedArrayBuffer>,
    watched: HashMap<String, Value>,
    timer_commands: Vec<TimerCommand>,
}

impl Minion {
    /// Unstarted minion with the default configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: MinionConfig::default(),
            status: MinionStatus::Initializing,
            started: false,
            store: None,
            connected: BTreeSet::new(),
            pending_links: BTreeSet::new(),
            links: HashMap::new(),
            channels: HashMap::new(),
            orphaned: HashMap::new(),
            arrays: HashMap::new(),
            watched: HashMap::new(),
            timer_commands: Vec::new(),
        }
    }

    /// Unstarted minion with a validated configuration.
    pub fn with_config(name: impl Into<String>, config: MinionConfig) -> MinionResult<Self> {
        config.validate()?;
        let mut minion = Self::new(name);
        minion.config = config;
        Ok(minion)
    }

    /// Minion name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Active configuration.
    pub fn config(&self) -> &MinionConfig {
        &self.config
    }

    /// Replace the configuration. Only before start.
    pub fn set_config(&mut self, config: MinionConfig) -> MinionResult<()> {
        config.validate()?;
        if self.started {
            warn!("Ignoring config change on started minion {}", self.name);
            return Ok(());
        }
        self.config = config;
        Ok(())
    }

    /// Last status observed by this process.
    pub fn status(&self) -> MinionStatus {
        self.status
    }

    /// Whether [`start`](Self::start) succeeded and shutdown has not run.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Peers with a channel to this minion.
    pub fn connected_peers(&self) -> impl Iterator<Item = &str> {
        self.connected.iter().map(String::as_str)
    }

    /// Peers whose state store is currently linked.
    pub fn linked_peers(&self) -> impl Iterator<Item = &str> {
        self.links.keys().map(String::as_str)
    }

    fn not_started(&self) -> MinionError {
        MinionError::NotStarted {
            name: self.name.clone(),
        }
    }

    fn store_mut(&mut self) -> MinionResult<&mut SharedStateStore> {
        match self.store.as_mut() {
            Some(store) => Ok(store),
            None => Err(MinionError::NotStarted {
                name: self.name.clone(),
            }),
        }
    }

    /// Connect two minions with a symmetric pair of channels.
    ///
    /// Both directed queues are created now, by name. Each side records the
    /// other for channel opening and state-store linking on its next start.
    /// Connecting an already connected pair reuses the existing queues.
    pub fn connect(&mut self, peer: &mut Minion) -> MinionResult<()> {
        if self.name == peer.name {
            return Err(MinionError::SelfConnection {
                name: self.name.clone(),
            });
        }

        channel::create_pair(&self.name, &peer.name, &self.config)?;
        self.record_connection(&peer.name);
        peer.record_connection(&self.name);
        info!("Connected {} <-> {}", self.name, peer.name);
        Ok(())
    }

    fn record_connection(&mut self, peer: &str) {
        self.connected.insert(peer.to_string());
        if !self.links.contains_key(peer) {
            self.pending_links.insert(peer.to_string());
        }
        if self.started && !self.channels.contains_key(peer) {
            self.open_channel(peer);
        }
    }

    fn open_channel(&mut self, peer: &str) {
        match Channel::open(&self.name, peer, &self.config) {
            Ok(channel) => {
                self.channels.insert(peer.to_string(), channel);
            }
            Err(e) => error!("{} failed to open channel to {}: {}", self.name, peer, e),
        }
    }

    /// Create the state store in this process, open channels and link peers.
    ///
    /// Peers that are not up yet stay pending and are retried by
    /// [`pump`](Self::pump) and on first access.
    pub fn start(&mut self) -> MinionResult<()> {
        if self.started {
            return Ok(());
        }
        let store = SharedStateStore::create(&self.name, self.config.state_size, self.config.lock)?;
        self.store = Some(store);
        self.started = true;
        self.status = MinionStatus::Initializing;

        let peers: Vec<String> = self.connected.iter().cloned().collect();
        for peer in &peers {
            self.open_channel(peer);
        }
        self.retry_pending_links();

        info!(
            "Minion {} started (pid {}, {} channels)",
            self.name,
            std::process::id(),
            self.channels.len()
        );
        Ok(())
    }

    /// Link a peer: open its state store and check its declared name.
    pub fn link(&mut self, peer: &str) -> MinionResult<()> {
        if !self.started {
            return Err(self.not_started());
        }
        if self.links.contains_key(peer) {
            return Ok(());
        }
        let store = SharedStateStore::open(peer, self.config.lock)?;
        self.links.insert(
            peer.to_string(),
            PeerLink {
                store,
                arrays: HashMap::new(),
            },
        );
        self.pending_links.remove(peer);
        debug!("{} linked to {}", self.name, peer);
        Ok(())
    }

    /// Whether `peer` is linked.
    pub fn is_linked(&self, peer: &str) -> bool {
        self.links.contains_key(peer)
    }

    fn retry_pending_links(&mut self) {
        let pending: Vec<String> = self.pending_links.iter().cloned().collect();
        for peer in pending {
            match self.link(&peer) {
                Ok(()) => {}
                Err(MinionError::Shm(ShmError::NotFound { .. })) => {}
                Err(e) => debug!("{} could not link {} yet: {}", self.name, peer, e),
            }
        }
    }

    fn peer_link(&mut self, peer: &str) -> MinionResult<&mut PeerLink> {
        if !self.links.contains_key(peer) {
            if !self.pending_links.contains(peer) {
                return Err(MinionError::NotLinked {
                    from: self.name.clone(),
                    peer: peer.to_string(),
                });
            }
            self.link(peer)?;
        }
        self.links.get_mut(peer).ok_or_else(|| MinionError::NotLinked {
            from: self.name.clone(),
            peer: peer.to_string(),
        })
    }

    /// Drop channels, link and cached arrays of `peer`.
    ///
    /// Messages already received stay readable through [`get`](Self::get).
    pub fn disconnect(&mut self, peer: &str) {
        if let Some(mut channel) = self.channels.remove(peer) {
            let inbox = channel.take_inbox();
            if !inbox.is_empty() {
                self.orphaned.insert(peer.to_string(), inbox);
            }
            channel.release();
        }
        if let Some(mut link) = self.links.remove(peer) {
            link.store.close();
            for array in link.arrays.values_mut() {
                array.close();
            }
        }
        self.connected.remove(peer);
        self.pending_links.remove(peer);
        info!("{} disconnected from {}", self.name, peer);
    }

    /// Drain every inbound channel into the per-peer inboxes and retry
    /// pending links. Peers announcing shutdown are disconnected.
    pub fn pump(&mut self) {
        let mut gone = Vec::new();
        for (peer, channel) in &mut self.channels {
            if channel.drain().peer_gone {
                gone.push(peer.clone());
            }
        }
        for peer in gone {
            info!("{} saw {} shut down", self.name, peer);
            self.disconnect(&peer);
        }
        if !self.pending_links.is_empty() {
            self.retry_pending_links();
        }
    }

    // ---- messaging ----

    /// Send a tagged message to a connected peer.
    ///
    /// `Ok(false)` when the message was dropped because the peer's queue is
    /// full, disconnected or locked; the drop is logged.
    pub fn send(&mut self, peer: &str, tag: &str, payload: impl Into<Value>) -> MinionResult<bool> {
        let name = &self.name;
        let Some(channel) = self.channels.get_mut(peer) else {
            return Err(MinionError::ChannelNotFound {
                from: name.clone(),
                peer: peer.to_string(),
            });
        };
        match channel.send(&Packet::Message(Message::new(tag, payload))) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("{} dropped message '{}' to {}: {}", name, tag, peer, e);
                Ok(false)
            }
        }
    }

    /// Next message received from `peer`, without blocking.
    pub fn get(&mut self, peer: &str) -> MinionResult<Option<Message>> {
        if let Some(inbox) = self.orphaned.get_mut(peer) {
            let message = inbox.pop_front();
            if inbox.is_empty() {
                self.orphaned.remove(peer);
            }
            return Ok(message);
        }
        let name = &self.name;
        let Some(channel) = self.channels.get_mut(peer) else {
            return Err(MinionError::ChannelNotFound {
                from: name.clone(),
                peer: peer.to_string(),
            });
        };
        if let Some(message) = channel.next_message() {
            return Ok(Some(message));
        }
        let drained = channel.drain();
        let message = channel.next_message();
        if drained.peer_gone {
            self.disconnect(peer);
            if let Some(rest) = self.orphaned.get(peer) {
                debug!("{} messages from {} still queued", rest.len(), peer);
            }
        }
        Ok(message)
    }

    fn broadcast_liveness(&mut self, alive: bool) {
        let packet = Packet::Liveness {
            from: self.name.clone(),
            alive,
        };
        for (peer, channel) in &mut self.channels {
            if let Err(e) = channel.send(&packet) {
                debug!("Liveness to {} not delivered: {}", peer, e);
            }
        }
    }

    // ---- own state ----

    /// Read a key from this minion's store.
    pub fn try_get_state(&mut self, key: &str) -> MinionResult<Option<Value>> {
        Ok(self.store_mut()?.get(key)?)
    }

    /// Read a key from this minion's store, logging failures.
    pub fn get_state(&mut self, key: &str) -> Option<Value> {
        self.try_get_state(key).unwrap_or_else(|e| {
            warn!("{} get_state({}) failed: {}", self.name, key, e);
            None
        })
    }

    /// Read and decode a key from this minion's store, logging failures.
    pub fn get_state_as<T: DeserializeOwned>(&mut self, key: &str) -> Option<T> {
        let value = self.get_state(key)?;
        serde_json::from_value(value)
            .map_err(|e| warn!("{} state {} has unexpected shape: {}", self.name, key, e))
            .ok()
    }

    /// Write a key to this minion's store.
    pub fn try_set_state<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> MinionResult<()> {
        Ok(self.store_mut()?.set(key, value)?)
    }

    /// Write a key to this minion's store, logging failures.
    pub fn set_state<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> bool {
        match self.try_set_state(key, value) {
            Ok(()) => true,
            Err(e) => {
                warn!("{} set_state({}) failed: {}", self.name, key, e);
                false
            }
        }
    }

    /// Remove a key from this minion's store, logging failures.
    pub fn delete_state(&mut self, key: &str) -> bool {
        let result = self.store_mut().and_then(|store| Ok(store.delete(key)?));
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!("{} delete_state({}) failed: {}", self.name, key, e);
                false
            }
        }
    }

    /// Edge detector: `true` the first time `key` is seen and whenever
    /// `value` differs from the previous observation.
    pub fn watch_state<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> bool {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                warn!("{} cannot watch {}: {}", self.name, key, e);
                return false;
            }
        };
        match self.watched.get(key) {
            Some(previous) if *previous == value => false,
            _ => {
                self.watched.insert(key.to_string(), value);
                true
            }
        }
    }

    /// Forget the last observation of `key`.
    pub fn unwatch_state(&mut self, key: &str) {
        self.watched.remove(key);
    }

    /// Re-read the status key and remember it. Keeps the last known status
    /// when the store cannot be read.
    pub fn poll_status(&mut self) -> MinionStatus {
        let observed = self.store_mut().and_then(|store| Ok(store.status()?));
        match observed {
            Ok(Some(status)) => {
                if status != self.status && self.status != MinionStatus::Initializing {
                    info!("{} status {:?} -> {:?}", self.name, self.status, status);
                }
                self.status = status;
            }
            Ok(None) => warn!("{} has no readable status", self.name),
            Err(e) => debug!("{} status poll failed: {}", self.name, e),
        }
        self.status
    }

    /// Write this minion's own status.
    pub fn set_status(&mut self, status: MinionStatus) -> bool {
        match self.store_mut().and_then(|store| Ok(store.set_status(status)?)) {
            Ok(()) => {
                self.status = status;
                true
            }
            Err(e) => {
                warn!("{} could not set status {:?}: {}", self.name, status, e);
                false
            }
        }
    }

    // ---- peer state ----

    /// Read a key from a linked peer's store.
    pub fn try_get_state_from(&mut self, peer: &str, key: &str) -> MinionResult<Option<Value>> {
        Ok(self.peer_link(peer)?.store.get(key)?)
    }

    /// Read a key from a linked peer's store, logging failures.
    pub fn get_state_from(&mut self, peer: &str, key: &str) -> Option<Value> {
        self.try_get_state_from(peer, key).unwrap_or_else(|e| {
            error!("{} get_state_from({}, {}) failed: {}", self.name, peer, key, e);
            None
        })
    }

    /// Read and decode a key from a linked peer's store, logging failures.
    pub fn get_state_from_as<T: DeserializeOwned>(&mut self, peer: &str, key: &str) -> Option<T> {
        let value = self.get_state_from(peer, key)?;
        serde_json::from_value(value)
            .map_err(|e| warn!("{} state {}.{} has unexpected shape: {}", self.name, peer, key, e))
            .ok()
    }

    /// Write a key into a linked peer's store.
    ///
    /// The peer's snapshot is refreshed first so that only `key` changes.
    pub fn try_set_state_to<T: Serialize + ?Sized>(
        &mut self,
        peer: &str,
        key: &str,
        value: &T,
    ) -> MinionResult<()> {
        let link = self.peer_link(peer)?;
        link.store.refresh()?;
        link.store.set(key, value)?;
        Ok(())
    }

    /// Write a key into a linked peer's store, logging failures.
    pub fn set_state_to<T: Serialize + ?Sized>(&mut self, peer: &str, key: &str, value: &T) -> bool {
        match self.try_set_state_to(peer, key, value) {
            Ok(()) => true,
            Err(e) => {
                error!("{} set_state_to({}, {}) failed: {}", self.name, peer, key, e);
                false
            }
        }
    }

    /// Ask a linked peer to shut down.
    pub fn request_shutdown(&mut self, peer: &str) -> bool {
        self.set_state_to(peer, STATUS_KEY, &MinionStatus::ShuttingDown.code())
    }

    /// Park a linked peer in its suspended poll loop.
    pub fn suspend(&mut self, peer: &str) -> bool {
        self.set_state_to(peer, STATUS_KEY, &MinionStatus::Suspended.code())
    }

    /// Wake a suspended peer.
    pub fn resume(&mut self, peer: &str) -> bool {
        self.set_state_to(peer, STATUS_KEY, &MinionStatus::Running.code())
    }

    /// Probe whether `peer`'s state store still exists.
    ///
    /// A confirmed dead peer is disconnected.
    pub fn is_minion_alive(&mut self, peer: &str) -> Liveness {
        match SharedBuffer::exists(&state_store_name(peer)) {
            Ok(true) => Liveness::Alive,
            Ok(false) => {
                if self.connected.contains(peer) || self.links.contains_key(peer) {
                    self.disconnect(peer);
                }
                Liveness::Dead
            }
            Err(e) => {
                warn!("{} liveness probe of {} failed: {}", self.name, peer, e);
                Liveness::Unknown
            }
        }
    }

    // ---- arrays ----

    /// Create an array buffer owned by this minion and register it as
    /// `b*<buffer>` so linked peers can find it.
    pub fn create_array<T: Element>(&mut self, buffer: &str, shape: &[usize]) -> MinionResult<()> {
        if !self.started {
            return Err(self.not_started());
        }
        let segment = array_segment_name(&self.name, buffer);
        let array = SharedArrayBuffer::create_for::<T>(&segment, shape, self.config.lock)?;
        self.store_mut()?.register_buffer(buffer, &segment)?;
        self.arrays.insert(buffer.to_string(), array);
        debug!("{} created array {} {:?}", self.name, segment, shape);
        Ok(())
    }

    fn own_array(&mut self, buffer: &str) -> MinionResult<&mut SharedArrayBuffer> {
        let segment = array_segment_name(&self.name, buffer);
        self.arrays
            .get_mut(buffer)
            .ok_or(MinionError::Shm(ShmError::NotFound { name: segment }))
    }

    /// Overwrite one of this minion's arrays.
    pub fn write_array<T, S, D>(&mut self, buffer: &str, array: &ArrayBase<S, D>) -> MinionResult<()>
    where
        T: Element,
        S: Data<Elem = T>,
        D: Dimension,
    {
        Ok(self.own_array(buffer)?.write(array)?)
    }

    /// Copy one of this minion's arrays out.
    pub fn read_array<T: Element>(&mut self, buffer: &str) -> MinionResult<ArrayD<T>> {
        Ok(self.own_array(buffer)?.read::<T>()?)
    }

    /// Remove one of this minion's arrays.
    pub fn destroy_array(&mut self, buffer: &str) -> MinionResult<()> {
        if let Some(mut array) = self.arrays.remove(buffer) {
            array.terminate()?;
        }
        self.store_mut()?.unregister_buffer(buffer)?;
        Ok(())
    }

    /// Copy an array published by a linked peer.
    pub fn try_read_array_from<T: Element>(
        &mut self,
        peer: &str,
        buffer: &str,
    ) -> MinionResult<ArrayD<T>> {
        let lock = self.config.lock;
        let link = self.peer_link(peer)?;
        if !link.arrays.contains_key(buffer) {
            let segment = link.store.buffer_segment(buffer)?.ok_or_else(|| {
                ShmError::NotFound {
                    name: array_segment_name(peer, buffer),
                }
            })?;
            let array = SharedArrayBuffer::open(&segment, lock)?;
            link.arrays.insert(buffer.to_string(), array);
        }
        match link.arrays.get(buffer) {
            Some(array) => Ok(array.read::<T>()?),
            None => Err(MinionError::Shm(ShmError::NotFound {
                name: array_segment_name(peer, buffer),
            })),
        }
    }

    /// Copy an array published by a linked peer, logging failures.
    pub fn read_array_from<T: Element>(&mut self, peer: &str, buffer: &str) -> Option<ArrayD<T>> {
        self.try_read_array_from(peer, buffer)
            .map_err(|e| error!("{} read_array_from({}, {}) failed: {}", self.name, peer, buffer, e))
            .ok()
    }

    // ---- timers ----

    /// Request a timer start, applied by the run loop before the next tick.
    pub fn start_timing(&mut self, timer: &str) {
        self.timer_commands
            .push(TimerCommand::Start(timer.to_string()));
    }

    /// Request a timer stop, applied by the run loop before the next tick.
    pub fn stop_timing(&mut self, timer: &str) {
        self.timer_commands
            .push(TimerCommand::Stop(timer.to_string()));
    }

    /// Pending timer requests, oldest first.
    pub fn take_timer_commands(&mut self) -> Vec<TimerCommand> {
        std::mem::take(&mut self.timer_commands)
    }

    // ---- shutdown ----

    /// Announce shutdown to every peer, release channels and arrays and
    /// unlink the state store. Calling it again is a no-op.
    pub fn shutdown(&mut self) -> MinionResult<()> {
        if !self.started {
            return Ok(());
        }
        info!("Minion {} shutting down", self.name);
        self.status = MinionStatus::ShuttingDown;
        self.broadcast_liveness(false);

        for (_, mut channel) in self.channels.drain() {
            channel.release();
        }
        for (_, mut array) in self.arrays.drain() {
            if let Err(e) = array.terminate() {
                warn!("{} failed to release array {}: {}", self.name, array.name(), e);
            }
        }
        for (_, mut link) in self.links.drain() {
            link.store.close();
        }

        if let Some(mut store) = self.store.take() {
            if let Err(e) = store.set_status(MinionStatus::Terminated) {
                debug!("{} final status not written: {}", self.name, e);
            }
            store.terminate()?;
        }
        self.started = false;
        self.status = MinionStatus::Terminated;
        info!("Minion {} terminated", self.name);
        Ok(())
    }
}
