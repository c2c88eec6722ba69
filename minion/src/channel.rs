//! Point-to-point channels between two connected minions.
//!
//! A connection is a pair of directed [`ShmQueue`]s, `<a>_to_<b>_channel`
//! and `<b>_to_<a>_channel`. Each side writes to its outbound queue and
//! consumes its inbound one; the consumer owns (and finally unlinks) the
//! queue it reads.

use minion_common::config::MinionConfig;
use minion_common::consts::channel_name;
use minion_common::message::{Message, Packet};
use minion_shm::{ShmError, ShmQueue, ShmResult};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Create both directed queues between `a` and `b`, reusing existing ones.
///
/// The handles are dropped right away; the segments stay for the processes
/// that open them later.
pub fn create_pair(a: &str, b: &str, config: &MinionConfig) -> ShmResult<()> {
    for name in [channel_name(a, b), channel_name(b, a)] {
        ShmQueue::open_or_create(
            &name,
            config.channel_capacity,
            config.channel_slot_size,
            config.lock,
        )?;
    }
    Ok(())
}

/// What one inbound drain produced besides user messages.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Drained {
    /// Messages moved into the inbox
    pub messages: usize,
    /// Peer announced it is going away
    pub peer_gone: bool,
}

/// This side of a connection.
pub struct Channel {
    peer: String,
    outbound: ShmQueue,
    inbound: ShmQueue,
    inbox: VecDeque<Message>,
}

impl Channel {
    /// Open both queues between `local` and `peer`.
    pub fn open(local: &str, peer: &str, config: &MinionConfig) -> ShmResult<Self> {
        let outbound = ShmQueue::open(&channel_name(local, peer), config.lock)?;
        let inbound = ShmQueue::open(&channel_name(peer, local), config.lock)?;
        Ok(Self {
            peer: peer.to_string(),
            outbound,
            inbound,
            inbox: VecDeque::new(),
        })
    }

    /// Peer name.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Enqueue a packet for the peer.
    pub fn send(&mut self, packet: &Packet) -> ShmResult<()> {
        self.outbound.push_json(packet)
    }

    /// Move every pending packet from the inbound queue into the inbox.
    pub fn drain(&mut self) -> Drained {
        let mut drained = Drained::default();
        loop {
            match self.inbound.pop_json::<Packet>() {
                Ok(Some(Packet::Message(message))) => {
                    self.inbox.push_back(message);
                    drained.messages += 1;
                }
                Ok(Some(Packet::Liveness { from, alive })) => {
                    debug!("Liveness from {}: alive={}", from, alive);
                    if !alive {
                        drained.peer_gone = true;
                    }
                }
                Ok(None) => break,
                Err(ShmError::Json { source }) => {
                    warn!("Dropping undecodable packet from {}: {}", self.peer, source);
                }
                Err(e) => {
                    warn!("Draining channel from {} failed: {}", self.peer, e);
                    break;
                }
            }
        }
        drained
    }

    /// Oldest undelivered message.
    pub fn next_message(&mut self) -> Option<Message> {
        self.inbox.pop_front()
    }

    /// Hand over the inbox, leaving it empty.
    pub fn take_inbox(&mut self) -> VecDeque<Message> {
        std::mem::take(&mut self.inbox)
    }

    /// Release the connection: stop consuming and unlink the inbound queue.
    pub fn release(&mut self) {
        self.outbound.close();
        if let Err(e) = self.inbound.terminate() {
            warn!("Failed to release channel from {}: {}", self.peer, e);
        }
    }
}
