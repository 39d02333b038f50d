//! Content resolution over the swarm.
//!
//! A `Resolver` owns a listening socket, a block store and a swarm manager
//! task. Resolution walks the DAG from the requested root, fetching each
//! missing block from whichever connected peer can serve it. Every fetch is
//! preceded by a full disconnect and redial of the configured peer list,
//! which shakes out half-dead connections before they can stall the walk.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use cid::Cid;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    time::timeout,
};
use tracing::{info, warn};

use crate::{
    dag::{DagNode, NODE_CODEC, RAW_CODEC},
    network::{SwarmEvent, SwarmManager},
    peers::{PeerAddr, PeerId},
    store::BlockStore,
};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid content address: {0}")]
    InvalidCid(#[from] cid::Error),

    #[error("no connected peer could provide block {0}")]
    BlockUnavailable(Cid),

    #[error("timed out waiting for block {0}")]
    Timeout(Cid),

    #[error("malformed node {0}: {1}")]
    BadNode(Cid, String),

    #[error("swarm manager has shut down")]
    SwarmGone,
}

pub struct Resolver {
    local_id: PeerId,
    store: BlockStore,
    swarm: mpsc::Sender<SwarmEvent>,
    block_timeout: Duration,
    listen_addr: SocketAddr,
}

impl Resolver {
    /// Generate an identity, bind the listener and start the swarm manager
    pub async fn start(
        listen_address: &str,
        peers: Vec<PeerAddr>,
        disconnect_timeout: Duration,
        block_timeout: Duration,
    ) -> Result<Self> {
        let key = SigningKey::generate(&mut OsRng);
        let local_id = PeerId::from_public_key(&key.verifying_key());

        let listener = TcpListener::bind(listen_address).await?;
        let listen_addr = listener.local_addr()?;

        let store = BlockStore::new();
        let (manager, swarm) =
            SwarmManager::new(local_id.clone(), peers, disconnect_timeout, store.clone());
        tokio::spawn(manager.run());

        let inbound = swarm.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let event = SwarmEvent::Inbound {
                            stream,
                            remote: remote.to_string(),
                        };
                        if inbound.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!("accept failed: {err}"),
                }
            }
        });

        Ok(Self {
            local_id,
            store,
            swarm,
            block_timeout,
            listen_addr,
        })
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    /// Drop every swarm connection and redial the configured peer list,
    /// returning how many peers accepted
    pub async fn reconnect(&self) -> Result<usize, ResolveError> {
        let (tx, rx) = oneshot::channel();
        self.swarm
            .send(SwarmEvent::Reconnect { reply: tx })
            .await
            .map_err(|_| ResolveError::SwarmGone)?;
        rx.await.map_err(|_| ResolveError::SwarmGone)
    }

    /// Resolve a textual content address to the full content it names
    pub async fn resolve(&self, text: &str) -> Result<Vec<u8>, ResolveError> {
        let root = Cid::try_from(text)?;

        let connected = self.reconnect().await?;
        info!("fetching {root} with {connected} fresh peer connections");

        self.assemble(root).await
    }

    /// Depth-first walk of the DAG below `root`, concatenating leaf blocks
    /// in link order
    async fn assemble(&self, root: Cid) -> Result<Vec<u8>, ResolveError> {
        let mut output = Vec::new();
        let mut stack = vec![root];

        while let Some(cid) = stack.pop() {
            let data = self.fetch_block(cid).await?;
            match cid.codec() {
                RAW_CODEC => output.extend_from_slice(&data),
                NODE_CODEC => {
                    let node: DagNode = minicbor::decode(&data)
                        .map_err(|e| ResolveError::BadNode(cid, e.to_string()))?;
                    for link in node.links.iter().rev() {
                        let child = Cid::try_from(&link[..])
                            .map_err(|e| ResolveError::BadNode(cid, e.to_string()))?;
                        stack.push(child);
                    }
                }
                other => {
                    return Err(ResolveError::BadNode(cid, format!("unknown codec {other:#x}")))
                }
            }
        }

        Ok(output)
    }

    async fn fetch_block(&self, cid: Cid) -> Result<Vec<u8>, ResolveError> {
        if let Some(data) = self.store.get(&cid) {
            return Ok(data);
        }

        let (tx, rx) = oneshot::channel();
        self.swarm
            .send(SwarmEvent::Want { cid, reply: tx })
            .await
            .map_err(|_| ResolveError::SwarmGone)?;

        if self.block_timeout.is_zero() {
            return rx.await.map_err(|_| ResolveError::SwarmGone)?;
        }
        match timeout(self.block_timeout, rx).await {
            Ok(reply) => reply.map_err(|_| ResolveError::SwarmGone)?,
            Err(_) => {
                let _ = self.swarm.send(SwarmEvent::Cancel { cid }).await;
                Err(ResolveError::Timeout(cid))
            }
        }
    }
}
