use anyhow::{bail, Result};
use cid::Cid;
use minicbor::bytes::ByteVec;
use tokio::{
    net::{tcp::OwnedWriteHalf, TcpStream},
    select,
    sync::{mpsc, oneshot},
};
use tracing::warn;

use crate::{
    dag::verify_block,
    network::PeerMessageSender,
    peers::PeerId,
    store::BlockStore,
    wire::{read_frame, write_frame, Frame, WireError},
};

/// Handle to one live peer connection.
///
/// The socket is owned by a worker task; commands flow in over a channel
/// and peer activity flows out as events to the swarm manager.
pub struct PeerConnection {
    pub address: String,
    commands: mpsc::UnboundedSender<PeerCommand>,
}

enum PeerCommand {
    Want(Cid),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug)]
pub enum PeerEvent {
    BlockReceived { cid: Cid, data: Vec<u8> },
    DontHave { cid: Cid },
    Disconnected,
}

impl PeerConnection {
    pub fn spawn(
        stream: TcpStream,
        address: String,
        expected: Option<PeerId>,
        local_id: PeerId,
        store: BlockStore,
        sender: PeerMessageSender,
    ) -> Self {
        let worker = PeerConnectionWorker {
            address: address.clone(),
            expected,
            local_id,
            store,
            sender,
        };
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            worker.run(stream, commands_rx).await;
        });
        Self {
            address,
            commands: commands_tx,
        }
    }

    pub fn want(&self, cid: Cid) -> Result<()> {
        self.commands.send(PeerCommand::Want(cid))?;
        Ok(())
    }

    /// Ask the worker to close the connection; the returned receiver fires
    /// once the worker has acknowledged
    pub fn shutdown(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(PeerCommand::Shutdown(tx));
        rx
    }
}

struct PeerConnectionWorker {
    address: String,
    expected: Option<PeerId>,
    local_id: PeerId,
    store: BlockStore,
    sender: PeerMessageSender,
}

impl PeerConnectionWorker {
    async fn run(self, stream: TcpStream, commands: mpsc::UnboundedReceiver<PeerCommand>) {
        if let Err(err) = self.do_run(stream, commands).await {
            warn!(peer = %self.address, "{err:#}");
        }
        let _ = self.sender.write(PeerEvent::Disconnected).await;
    }

    async fn do_run(
        &self,
        stream: TcpStream,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        write_frame(
            &mut writer,
            &Frame::Hello {
                peer_id: self.local_id.to_string(),
            },
        )
        .await?;
        let Frame::Hello { peer_id } = read_frame(&mut reader).await? else {
            bail!("peer did not open with a handshake");
        };
        if let Some(expected) = &self.expected {
            if expected.as_str() != peer_id {
                bail!("peer identity mismatch: expected {expected}, got {peer_id}");
            }
        }

        // read_frame is not cancel safe: a command arriving mid-frame must
        // not abandon bytes already consumed. Reads get their own task and
        // whole frames cross back over a channel, which is.
        let (frames_tx, mut frames) = mpsc::channel::<Result<Frame, WireError>>(16);
        let read_task = tokio::spawn(async move {
            loop {
                let frame = read_frame(&mut reader).await;
                let failed = frame.is_err();
                if frames_tx.send(frame).await.is_err() || failed {
                    return;
                }
            }
        });

        let result = self.exchange(&mut commands, &mut frames, &mut writer).await;
        read_task.abort();
        result
    }

    async fn exchange(
        &self,
        commands: &mut mpsc::UnboundedReceiver<PeerCommand>,
        frames: &mut mpsc::Receiver<Result<Frame, WireError>>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<()> {
        loop {
            select! {
                cmd = commands.recv() => {
                    match cmd {
                        None => bail!("swarm manager has shut down"),
                        Some(PeerCommand::Want(cid)) => {
                            let frame = Frame::Want { cid: ByteVec::from(cid.to_bytes()) };
                            write_frame(writer, &frame).await?;
                        }
                        Some(PeerCommand::Shutdown(ack)) => {
                            let _ = ack.send(());
                            return Ok(());
                        }
                    }
                }
                frame = frames.recv() => {
                    match frame {
                        None => bail!("peer closed the connection"),
                        Some(frame) => self.handle_frame(frame?, writer).await?,
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, frame: Frame, writer: &mut OwnedWriteHalf) -> Result<()> {
        match frame {
            Frame::Want { cid } => {
                let cid = parse_cid(&cid)?;
                let response = match self.store.get(&cid) {
                    Some(data) => Frame::Block {
                        cid: ByteVec::from(cid.to_bytes()),
                        data: ByteVec::from(data),
                    },
                    None => Frame::DontHave {
                        cid: ByteVec::from(cid.to_bytes()),
                    },
                };
                write_frame(writer, &response).await?;
            }
            Frame::Block { cid, data } => {
                let cid = parse_cid(&cid)?;
                let data: Vec<u8> = data.into();
                if !verify_block(&cid, &data) {
                    // Leave the want pending rather than accept bad bytes
                    warn!(peer = %self.address, "block does not match address {cid}, dropped");
                    return Ok(());
                }
                self.store.put(cid, data.clone());
                self.sender.write(PeerEvent::BlockReceived { cid, data }).await?;
            }
            Frame::DontHave { cid } => {
                let cid = parse_cid(&cid)?;
                self.sender.write(PeerEvent::DontHave { cid }).await?;
            }
            Frame::Hello { .. } => {
                warn!(peer = %self.address, "unexpected repeated handshake, ignored");
            }
        }
        Ok(())
    }
}

fn parse_cid(bytes: &[u8]) -> Result<Cid> {
    Ok(Cid::try_from(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::time::{sleep, Duration};

    use crate::dag::{block_cid, RAW_CODEC};
    use crate::network::{PeerMessageSender, SwarmEvent};

    async fn frame_bytes(frame: &Frame) -> Vec<u8> {
        let mut buf = Vec::new();
        write_frame(&mut buf, frame).await.unwrap();
        buf
    }

    // A want issued while a block frame is still arriving must not disturb
    // the partially read frame
    #[tokio::test]
    async fn wants_sent_mid_frame_leave_the_stream_intact() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let first = vec![0xa5u8; 4096];
        let second = vec![0x5au8; 64];
        let first_cid = block_cid(RAW_CODEC, &first);
        let second_cid = block_cid(RAW_CODEC, &second);

        let served_first = first.clone();
        let served_second = second.clone();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            let Frame::Hello { .. } = read_frame(&mut socket).await.unwrap() else {
                panic!("expected a handshake");
            };
            let hello = Frame::Hello {
                peer_id: "scripted-peer".to_string(),
            };
            write_frame(&mut socket, &hello).await.unwrap();

            let Frame::Want { .. } = read_frame(&mut socket).await.unwrap() else {
                panic!("expected a want");
            };

            // serve the first block in two halves around a pause, so the
            // second want lands while the frame is in flight
            let block = frame_bytes(&Frame::Block {
                cid: ByteVec::from(first_cid.to_bytes()),
                data: ByteVec::from(served_first),
            })
            .await;
            let (head, tail) = block.split_at(block.len() / 2);
            socket.write_all(head).await.unwrap();
            socket.flush().await.unwrap();
            sleep(Duration::from_millis(200)).await;
            socket.write_all(tail).await.unwrap();
            socket.flush().await.unwrap();

            let Frame::Want { .. } = read_frame(&mut socket).await.unwrap() else {
                panic!("expected a second want");
            };
            let block = frame_bytes(&Frame::Block {
                cid: ByteVec::from(second_cid.to_bytes()),
                data: ByteVec::from(served_second),
            })
            .await;
            socket.write_all(&block).await.unwrap();
            socket.flush().await.unwrap();
            sleep(Duration::from_secs(1)).await;
        });

        let key = SigningKey::generate(&mut OsRng);
        let local_id = PeerId::from_public_key(&key.verifying_key());
        let store = BlockStore::new();
        let (events_tx, mut events) = mpsc::channel(16);
        let sender = PeerMessageSender::new(1, events_tx);

        let stream = TcpStream::connect(addr).await.unwrap();
        let conn = PeerConnection::spawn(
            stream,
            addr.to_string(),
            None,
            local_id,
            store.clone(),
            sender,
        );

        conn.want(first_cid).unwrap();
        sleep(Duration::from_millis(100)).await;
        // lands while the first block frame is half delivered
        conn.want(second_cid).unwrap();

        let mut received = HashSet::new();
        for _ in 0..2 {
            match events.recv().await {
                Some(SwarmEvent::Peer {
                    event: PeerEvent::BlockReceived { cid, .. },
                    ..
                }) => {
                    received.insert(cid);
                }
                Some(SwarmEvent::Peer { event, .. }) => panic!("unexpected peer event: {event:?}"),
                _ => panic!("event channel closed"),
            }
        }
        assert!(received.contains(&first_cid));
        assert!(received.contains(&second_cid));
        assert!(store.contains(&first_cid) && store.contains(&second_cid));
    }
}
