// src/core/cluster/link.rs

//! One established peer link: hello handshake, journal replay, then live
//! traffic through one reader and one writer task coordinated over bounded
//! channels.

use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tokio_rustls::TlsStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::core::VigilError;
use crate::core::checker::scheduler::SchedulerCommand;
use crate::core::cluster::protocol::{HelloParams, Message, MessageCodec, ReplayParams, methods};
use crate::core::cluster::{dispatch_incoming, touch_endpoint};
use crate::core::now_ts;
use crate::core::objects::key::{ObjectKey, ObjectKind};
use crate::core::replay::journal;
use crate::core::state::EngineState;

const HELLO_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-link outbound queue. A peer that cannot drain this is considered dead
/// and its link is dropped; the journal replays the backlog on reconnect.
const OUTBOUND_QUEUE_CAPACITY: usize = 4096;

static LINK_IDS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    Inbound,
    Outbound,
}

/// The shared handle to a live link, kept in `EngineState::links`.
#[derive(Clone)]
pub struct PeerHandle {
    pub name: String,
    pub direction: LinkDirection,
    pub established: f64,
    pub id: u64,
    outbound: mpsc::Sender<Message>,
    live: Arc<AtomicBool>,
    close_tx: watch::Sender<bool>,
}

impl PeerHandle {
    /// Builds a handle plus the receiving ends its link tasks consume.
    pub fn new(
        name: String,
        direction: LinkDirection,
    ) -> (Self, mpsc::Receiver<Message>, watch::Receiver<bool>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (close_tx, close_rx) = watch::channel(false);
        let handle = PeerHandle {
            name,
            direction,
            established: now_ts(),
            id: LINK_IDS.fetch_add(1, Ordering::Relaxed),
            outbound: outbound_tx,
            live: Arc::new(AtomicBool::new(false)),
            close_tx,
        };
        (handle, outbound_rx, close_rx)
    }

    /// Whether replay finished and live traffic may flow.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Marks the replay phase finished.
    pub fn mark_live(&self) {
        self.live.store(true, Ordering::Release);
    }

    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    /// A fresh receiver for the close signal.
    pub fn subscribe_close(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    /// Queues a live message. Fails when the peer cannot keep up, which the
    /// caller answers by dropping the link.
    pub fn try_send(&self, message: Message) -> Result<(), VigilError> {
        self.outbound
            .try_send(message)
            .map_err(|_| VigilError::TransientIo(format!("outbound queue to '{}' stalled", self.name)))
    }
}

/// Registers a handle, applying the duplicate-link tie-break: for the same
/// direction a new connection replaces the old one; across directions the
/// connection whose client has the lexicographically lower CN survives.
fn register_link(engine: &EngineState, handle: PeerHandle) -> bool {
    use dashmap::mapref::entry::Entry;
    match engine.links.entry(handle.name.clone()) {
        Entry::Vacant(slot) => {
            slot.insert(handle);
            true
        }
        Entry::Occupied(mut slot) => {
            let existing = slot.get();
            let replace = if existing.direction == handle.direction {
                true
            } else {
                // Lower CN is the client, so the canonical direction is
                // outbound exactly when our name sorts first.
                let canonical = if engine.local_name < handle.name {
                    LinkDirection::Outbound
                } else {
                    LinkDirection::Inbound
                };
                handle.direction == canonical
            };
            if replace {
                debug!(
                    "Replacing existing link to '{}' (tie-break or reconnect).",
                    handle.name
                );
                slot.get().close();
                slot.insert(handle);
            }
            replace
        }
    }
}

/// Drives one connection end to end: handshake, registration, replay, live
/// traffic. Returns when the link closes for any reason.
pub async fn establish(
    engine: Arc<EngineState>,
    stream: TlsStream<TcpStream>,
    peer_name: String,
    direction: LinkDirection,
) -> Result<(), VigilError> {
    let endpoint_key = ObjectKey::new(ObjectKind::Endpoint, peer_name.clone());
    if !engine.runtime.contains(&endpoint_key) {
        return Err(VigilError::Auth(format!(
            "peer CN '{peer_name}' does not match any configured endpoint"
        )));
    }

    let codec = MessageCodec::new(engine.config.cluster.max_message_size);
    let mut framed = Framed::new(stream, codec);

    // Exchange hellos before anything else.
    let known: Vec<String> = engine.links.iter().map(|link| link.name.clone()).collect();
    let hello = Message::new(
        methods::HELLO,
        json!(HelloParams {
            identity: engine.local_name.clone(),
            known_endpoints: known,
            log_position: engine.journal_position.get(),
        }),
    );
    framed.send(hello).await?;

    let first = tokio::time::timeout(HELLO_TIMEOUT, framed.next())
        .await
        .map_err(|_| VigilError::ProtocolViolation("timed out waiting for hello".into()))?
        .ok_or_else(|| VigilError::ProtocolViolation("link closed before hello".into()))??;
    if first.method != methods::HELLO {
        return Err(VigilError::ProtocolViolation(format!(
            "expected hello, got '{}'",
            first.method
        )));
    }
    let peer_hello: HelloParams = serde_json::from_value(first.params)
        .map_err(|e| VigilError::ProtocolViolation(format!("malformed hello: {e}")))?;
    if peer_hello.identity != peer_name {
        return Err(VigilError::Auth(format!(
            "peer claims identity '{}' but its certificate CN is '{peer_name}'",
            peer_hello.identity
        )));
    }
    engine
        .bookmarks
        .advance_remote(&peer_name, peer_hello.log_position);
    touch_endpoint(&engine, &peer_name);

    let (handle, outbound_rx, close_rx) = PeerHandle::new(peer_name.clone(), direction);
    let link_id = handle.id;
    if !register_link(&engine, handle.clone()) {
        debug!("Dropping redundant connection to '{peer_name}' (tie-break).");
        return Ok(());
    }
    info!("Peer link to '{peer_name}' established ({direction:?}).");
    engine.notify_scheduler(SchedulerCommand::AuthorityChanged);

    let (sink, stream) = framed.split();
    let writer = tokio::spawn(writer_task(
        engine.clone(),
        sink,
        peer_name.clone(),
        outbound_rx,
        handle.clone(),
    ));

    // Reader loop on this task.
    let result = reader_loop(&engine, &peer_name, stream, close_rx).await;

    handle.close();
    let _ = writer.await;
    engine
        .links
        .remove_if(&peer_name, |_, existing| existing.id == link_id);
    engine.notify_scheduler(SchedulerCommand::AuthorityChanged);
    info!("Peer link to '{peer_name}' closed.");
    result
}

async fn reader_loop(
    engine: &Arc<EngineState>,
    peer_name: &str,
    mut stream: futures::stream::SplitStream<Framed<TlsStream<TcpStream>, MessageCodec>>,
    mut close_rx: watch::Receiver<bool>,
) -> Result<(), VigilError> {
    loop {
        tokio::select! {
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    return Ok(());
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(message)) => {
                        if let Err(e) = dispatch_incoming(engine, peer_name, message).await {
                            warn!("Dropping link to '{peer_name}': {e}");
                            return Err(e);
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Read error on link to '{peer_name}': {e}");
                        return Err(e);
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}

/// Sends the replay stream, the completion sentinel, then live traffic.
async fn writer_task(
    engine: Arc<EngineState>,
    mut sink: futures::stream::SplitSink<Framed<TlsStream<TcpStream>, MessageCodec>, Message>,
    peer_name: String,
    mut outbound_rx: mpsc::Receiver<Message>,
    handle: PeerHandle,
) {
    let mut close_rx = handle.subscribe_close();
    if let Err(e) = replay_journal(&engine, &mut sink, &peer_name, &close_rx).await {
        warn!("Replay to '{peer_name}' failed: {e}");
        handle.close();
        return;
    }
    handle.mark_live();

    loop {
        tokio::select! {
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    break;
                }
            }
            maybe_message = outbound_rx.recv() => {
                let Some(message) = maybe_message else { break };
                let ts = message.ts;
                if let Err(e) = sink.send(message).await {
                    warn!("Write error on link to '{peer_name}': {e}");
                    handle.close();
                    return;
                }
                engine.bookmarks.advance_local(&peer_name, ts);
            }
        }
    }
    let _ = sink.close().await;
}

/// Streams every journal entry the peer has not acknowledged, in timestamp
/// order, wrapped in `log::Replay`, then the `log::ReplayComplete` sentinel.
/// Entries journaled while replay runs are picked up by re-reading until the
/// journal is drained.
async fn replay_journal(
    engine: &Arc<EngineState>,
    sink: &mut futures::stream::SplitSink<Framed<TlsStream<TcpStream>, MessageCodec>, Message>,
    peer_name: &str,
    close_rx: &watch::Receiver<bool>,
) -> Result<(), VigilError> {
    let dir = engine.config.log_dir();
    let mut from = engine.bookmarks.get(peer_name).remote;
    let mut replayed = 0usize;
    loop {
        if *close_rx.borrow() {
            return Ok(());
        }
        let read_dir = dir.clone();
        let batch = tokio::task::spawn_blocking(move || journal::read_entries_since(&read_dir, from))
            .await
            .map_err(|e| VigilError::Internal(e.to_string()))??;
        if batch.is_empty() {
            break;
        }
        for original in batch {
            let ts = original.ts;
            let wrapper = Message {
                jsonrpc: original.jsonrpc.clone(),
                method: methods::LOG_REPLAY.to_string(),
                params: serde_json::to_value(ReplayParams {
                    message: Box::new(original),
                })?,
                ts,
            };
            sink.send(wrapper).await?;
            engine.bookmarks.advance_local(peer_name, ts);
            from = from.max(ts);
            replayed += 1;
        }
    }
    sink.send(Message::new(methods::LOG_REPLAY_COMPLETE, json!({})))
        .await?;
    info!("Replayed {replayed} journal entries to '{peer_name}'.");
    Ok(())
}
