//! Swarm connection management.
//!
//! A single manager task owns every peer connection. Connection workers and
//! the resolver talk to it over one events channel, so all connect,
//! disconnect and want bookkeeping happens in one place without locks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use cid::Cid;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::timeout,
};
use tracing::{info, warn};

use crate::{
    connection::{PeerConnection, PeerEvent},
    peers::{PeerAddr, PeerId},
    resolver::ResolveError,
    store::BlockStore,
};

pub type ConnId = u64;

const EVENT_CHANNEL_DEPTH: usize = 256;

/// Events flowing into the swarm manager, from connection workers, the
/// inbound listener and the resolver
pub enum SwarmEvent {
    Peer {
        conn: ConnId,
        event: PeerEvent,
    },
    Inbound {
        stream: TcpStream,
        remote: String,
    },
    /// Drop every connection, then redial the configured peer list.
    /// Replies with the number of peers that accepted.
    Reconnect {
        reply: oneshot::Sender<usize>,
    },
    Want {
        cid: Cid,
        reply: oneshot::Sender<Result<Vec<u8>, ResolveError>>,
    },
    Cancel {
        cid: Cid,
    },
}

/// A connection worker's route back to the manager
pub struct PeerMessageSender {
    conn: ConnId,
    sender: mpsc::Sender<SwarmEvent>,
}

impl PeerMessageSender {
    pub fn new(conn: ConnId, sender: mpsc::Sender<SwarmEvent>) -> Self {
        Self { conn, sender }
    }

    pub async fn write(&self, event: PeerEvent) -> Result<()> {
        self.sender.send(SwarmEvent::Peer { conn: self.conn, event }).await?;
        Ok(())
    }
}

struct PendingWant {
    replies: Vec<oneshot::Sender<Result<Vec<u8>, ResolveError>>>,
    asked: HashSet<ConnId>,
    refused: HashSet<ConnId>,
}

pub struct SwarmManager {
    local_id: PeerId,
    addresses: Vec<PeerAddr>,
    disconnect_timeout: Duration,
    store: BlockStore,
    next_id: ConnId,
    peers: BTreeMap<ConnId, PeerConnection>,
    events: mpsc::Receiver<SwarmEvent>,
    events_sender: mpsc::Sender<SwarmEvent>,
    pending: HashMap<Cid, PendingWant>,
}

impl SwarmManager {
    pub fn new(
        local_id: PeerId,
        addresses: Vec<PeerAddr>,
        disconnect_timeout: Duration,
        store: BlockStore,
    ) -> (Self, mpsc::Sender<SwarmEvent>) {
        let (events_sender, events) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let manager = Self {
            local_id,
            addresses,
            disconnect_timeout,
            store,
            next_id: 0,
            peers: BTreeMap::new(),
            events,
            events_sender: events_sender.clone(),
            pending: HashMap::new(),
        };
        (manager, events_sender)
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                SwarmEvent::Peer { conn, event } => self.handle_peer_event(conn, event),
                SwarmEvent::Inbound { stream, remote } => {
                    info!("inbound connection from {remote}");
                    self.add_connection(stream, remote, None);
                }
                SwarmEvent::Reconnect { reply } => {
                    let connected = self.handle_reconnect().await;
                    let _ = reply.send(connected);
                }
                SwarmEvent::Want { cid, reply } => self.handle_want(cid, reply),
                SwarmEvent::Cancel { cid } => {
                    self.pending.remove(&cid);
                }
            }
        }
    }

    fn add_connection(&mut self, stream: TcpStream, address: String, expected: Option<PeerId>) {
        let conn = self.next_id;
        self.next_id += 1;
        let sender = PeerMessageSender::new(conn, self.events_sender.clone());
        let connection = PeerConnection::spawn(
            stream,
            address,
            expected,
            self.local_id.clone(),
            self.store.clone(),
            sender,
        );
        self.peers.insert(conn, connection);
    }

    fn handle_peer_event(&mut self, conn: ConnId, event: PeerEvent) {
        match event {
            PeerEvent::BlockReceived { cid, data } => {
                if let Some(want) = self.pending.remove(&cid) {
                    for reply in want.replies {
                        let _ = reply.send(Ok(data.clone()));
                    }
                }
            }
            PeerEvent::DontHave { cid } => {
                if let Some(want) = self.pending.get_mut(&cid) {
                    want.refused.insert(conn);
                }
                self.fail_if_exhausted(&cid);
            }
            PeerEvent::Disconnected => {
                if let Some(peer) = self.peers.remove(&conn) {
                    info!("peer {} disconnected", peer.address);
                }
                let cids: Vec<Cid> = self.pending.keys().copied().collect();
                for cid in cids {
                    if let Some(want) = self.pending.get_mut(&cid) {
                        want.asked.remove(&conn);
                        want.refused.remove(&conn);
                    }
                    self.fail_if_exhausted(&cid);
                }
            }
        }
    }

    /// Fail a want once every peer it was sent to has refused or gone away
    fn fail_if_exhausted(&mut self, cid: &Cid) {
        let exhausted = match self.pending.get(cid) {
            Some(want) => want.asked.is_subset(&want.refused),
            None => false,
        };
        if exhausted {
            if let Some(want) = self.pending.remove(cid) {
                for reply in want.replies {
                    let _ = reply.send(Err(ResolveError::BlockUnavailable(*cid)));
                }
            }
        }
    }

    fn handle_want(&mut self, cid: Cid, reply: oneshot::Sender<Result<Vec<u8>, ResolveError>>) {
        if let Some(data) = self.store.get(&cid) {
            let _ = reply.send(Ok(data));
            return;
        }
        if self.peers.is_empty() {
            let _ = reply.send(Err(ResolveError::BlockUnavailable(cid)));
            return;
        }
        if let Some(want) = self.pending.get_mut(&cid) {
            want.replies.push(reply);
            return;
        }

        let mut asked = HashSet::new();
        for (conn, peer) in &self.peers {
            match peer.want(cid) {
                Ok(()) => {
                    asked.insert(*conn);
                }
                Err(err) => warn!(peer = %peer.address, "want not sent: {err:#}"),
            }
        }
        if asked.is_empty() {
            let _ = reply.send(Err(ResolveError::BlockUnavailable(cid)));
            return;
        }
        self.pending.insert(
            cid,
            PendingWant {
                replies: vec![reply],
                asked,
                refused: HashSet::new(),
            },
        );
    }

    /// Tear the swarm down and dial the configured peers afresh
    async fn handle_reconnect(&mut self) -> usize {
        let peers = std::mem::take(&mut self.peers);
        for (_, peer) in peers {
            let ack = peer.shutdown();
            if timeout(self.disconnect_timeout, ack).await.is_err() {
                warn!(peer = %peer.address, "no close acknowledgement in time, abandoned");
            }
        }

        // wants in flight died with their connections
        for (cid, want) in self.pending.drain() {
            for reply in want.replies {
                let _ = reply.send(Err(ResolveError::BlockUnavailable(cid)));
            }
        }

        let mut connected = 0;
        for addr in self.addresses.clone() {
            match TcpStream::connect(addr.endpoint()).await {
                Ok(stream) => {
                    self.add_connection(stream, addr.endpoint(), addr.peer_id.clone());
                    connected += 1;
                }
                Err(err) => warn!("dial of {addr} failed: {err}"),
            }
        }
        connected
    }
}
