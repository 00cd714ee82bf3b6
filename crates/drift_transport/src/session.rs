//! The reliable session: sequencing, acknowledgement, retransmission, and
//! carrier replacement.
//!
//! Every write is framed with the session's current sequence number and
//! kept in the retransmission buffer until the peer acknowledges it. When
//! a replacement carrier is attached, the send sequence rewinds to the
//! highest acknowledged byte and the whole buffer is replayed with its
//! original sequence numbers; the peer discards the overlap it has already
//! delivered. A single retransmission timer bounds how long unacknowledged
//! bytes may linger before the session declares itself dead.
//!
//! Lock layout: the carrier slot, then the write half, then the sequence
//! state, which is a leaf and is never held across an await.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use drift_proto::framing::{read_header, Header, SessionId, HEADER_LEN, MAX_PAYLOAD};

use crate::carrier::Carrier;

const DEFAULT_RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a sent byte may stay unacknowledged before the session
    /// closes itself.
    pub retransmit_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retransmit_timeout: DEFAULT_RETRANSMIT_TIMEOUT,
        }
    }
}

/// Wraparound-aware sequence comparison: is `a` before `b`?
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

struct SeqState {
    next_send_seq: u32,
    next_expected_recv: u32,
    highest_acked: u32,
    /// Exactly the bytes with sequence numbers in
    /// `[highest_acked, next_send_seq)`.
    retransmit_buf: BytesMut,
}

struct Shared {
    id: SessionId,
    config: SessionConfig,
    seq: Mutex<SeqState>,
    carrier: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<Box<dyn Carrier>>>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

struct InboundReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

/// A reliable, resumable byte-stream identified by a [`SessionId`].
pub struct Session {
    shared: Arc<Shared>,
    inbound: tokio::sync::Mutex<InboundReader>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.shared.id).finish()
    }
}

impl Session {
    /// Create a session with a freshly generated random id.
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        Self::adopt(SessionId::generate(), config)
    }

    /// Create a session adopting an id announced by a peer (server side).
    pub fn adopt(id: SessionId, config: SessionConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                id,
                config,
                seq: Mutex::new(SeqState {
                    next_send_seq: 0,
                    next_expected_recv: 0,
                    highest_acked: 0,
                    retransmit_buf: BytesMut::new(),
                }),
                carrier: tokio::sync::Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
                inbound_tx: Mutex::new(Some(tx)),
                timer: Mutex::new(None),
            }),
            inbound: tokio::sync::Mutex::new(InboundReader {
                rx,
                current: Vec::new(),
                pos: 0,
            }),
        }
    }

    /// The stable session id, usable as a transport-agnostic address.
    pub fn session_id(&self) -> SessionId {
        self.shared.id
    }

    /// Bytes sent but not yet acknowledged by the peer.
    pub fn unacked_bytes(&self) -> usize {
        self.shared.seq.lock().unwrap().retransmit_buf.len()
    }

    /// Install `carrier` as the current pipe, replacing (and closing) any
    /// previous one.
    ///
    /// An initiator first sends the raw 8-byte session id so the far side
    /// can route the carrier. Any buffered-but-unacknowledged bytes are
    /// then replayed on the new carrier with their original sequence
    /// numbers.
    pub async fn attach(&self, carrier: Box<dyn Carrier>, initiator: bool) -> io::Result<()> {
        let shared = &self.shared;
        let mut slot = shared.carrier.lock().await;

        if let Some(old_reader) = slot.take() {
            old_reader.abort();
        }

        let (read_half, write_half) = tokio::io::split(carrier);
        {
            let mut writer = shared.writer.lock().await;
            if let Some(mut old) = writer.take() {
                let _ = old.shutdown().await;
            }
            *writer = Some(write_half);
            if initiator {
                let id = *shared.id.as_bytes();
                let w = writer.as_mut().unwrap();
                w.write_all(&id).await?;
                w.flush().await?;
            }
        }

        *slot = Some(tokio::spawn(run_reader(read_half, shared.clone())));
        drop(slot);

        shared.retransmit_buffered().await;
        Ok(())
    }

    /// Append bytes to the outbound stream.
    ///
    /// Succeeds even with no carrier attached; the bytes stay in the
    /// retransmission buffer until acknowledged. At most [`MAX_PAYLOAD`]
    /// bytes are consumed per call; a short return count tells the caller
    /// to loop.
    pub async fn write(&self, payload: &[u8]) -> io::Result<usize> {
        let n = payload.len().min(MAX_PAYLOAD);
        let chunk = &payload[..n];

        let (frame, target) = {
            let mut seq = self.shared.seq.lock().unwrap();
            let header = Header {
                seq: seq.next_send_seq,
                ack: seq.next_expected_recv,
                length: n as u16,
                session_id: self.shared.id,
            };
            seq.retransmit_buf.extend_from_slice(chunk);
            seq.next_send_seq = seq.next_send_seq.wrapping_add(n as u32);

            let mut frame = Vec::with_capacity(HEADER_LEN + n);
            frame.extend_from_slice(&header.encode());
            frame.extend_from_slice(chunk);
            (frame, seq.next_send_seq)
        };

        {
            let mut writer = self.shared.writer.lock().await;
            match writer.as_mut() {
                Some(w) => {
                    if let Err(e) = write_all_flush(w, &frame).await {
                        debug!(session = %self.shared.id, "carrier write failed, bytes stay buffered: {e}");
                    }
                }
                None => trace!(session = %self.shared.id, "no carrier attached, buffering {n} bytes"),
            }
        }

        arm_timer(&self.shared, target);
        Ok(n)
    }

    /// Read the next in-order bytes of the peer's stream.
    ///
    /// Blocks until bytes are available; returns `Ok(0)` once the session
    /// has ended and the buffered prefix is drained.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inbound = self.inbound.lock().await;
        loop {
            if inbound.pos < inbound.current.len() {
                let n = (inbound.current.len() - inbound.pos).min(buf.len());
                buf[..n].copy_from_slice(&inbound.current[inbound.pos..inbound.pos + n]);
                inbound.pos += n;
                return Ok(n);
            }
            match inbound.rx.recv().await {
                Some(chunk) => {
                    inbound.current = chunk;
                    inbound.pos = 0;
                }
                None => return Ok(0),
            }
        }
    }

    /// Close the session and its current carrier. Idempotent.
    pub async fn close(&self) {
        self.shared.shutdown().await;
    }

    #[cfg(test)]
    fn preset_sequences(&self, send: u32, recv: u32) {
        let mut seq = self.shared.seq.lock().unwrap();
        seq.next_send_seq = send;
        seq.highest_acked = send;
        seq.next_expected_recv = recv;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_all_flush(
    w: &mut WriteHalf<Box<dyn Carrier>>,
    bytes: &[u8],
) -> io::Result<()> {
    w.write_all(bytes).await?;
    w.flush().await
}

/// Per-carrier reader: strips headers and hands in-order payloads to the
/// session. Exits when the carrier dies; the session itself stays usable
/// for the next attach.
async fn run_reader(mut read_half: ReadHalf<Box<dyn Carrier>>, shared: Arc<Shared>) {
    loop {
        let header = match read_header(&mut read_half).await {
            Ok(h) => h,
            Err(e) => {
                trace!(session = %shared.id, "carrier read ended: {e}");
                return;
            }
        };
        let mut payload = vec![0u8; header.length as usize];
        if let Err(e) = read_half.read_exact(&mut payload).await {
            trace!(session = %shared.id, "carrier died mid-frame: {e}");
            return;
        }
        process_frame(&shared, header, payload);
    }
}

/// Arm (or re-arm) the single retransmission timer for `target`, the send
/// sequence after the latest write.
fn arm_timer(shared: &Arc<Shared>, target: u32) {
    let task_shared = shared.clone();
    let timeout = shared.config.retransmit_timeout;
    let handle = tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let expired = {
            let seq = task_shared.seq.lock().unwrap();
            seq_lt(seq.highest_acked, target)
        };
        if expired {
            warn!(session = %task_shared.id, "no acknowledgement within {timeout:?}, closing session");
            task_shared.shutdown().await;
        }
    });
    if let Some(old) = shared.timer.lock().unwrap().replace(handle) {
        old.abort();
    }
}

/// Apply one received frame: deliver in-order payload, discard anything
/// else, and trim the retransmission buffer on ack advance.
fn process_frame(shared: &Arc<Shared>, header: Header, payload: Vec<u8>) {
    if header.session_id != shared.id {
        warn!(
            session = %shared.id,
            got = %header.session_id,
            "dropping frame with mismatched session id"
        );
        return;
    }

    let mut delivered = false;
    {
        let mut seq = shared.seq.lock().unwrap();

        if header.length > 0 {
            if header.seq == seq.next_expected_recv {
                seq.next_expected_recv = seq.next_expected_recv.wrapping_add(header.length as u32);
                if let Some(tx) = &*shared.inbound_tx.lock().unwrap() {
                    let _ = tx.send(payload);
                }
                delivered = true;
            } else {
                // In-order carrier, so this is either a replay from a
                // reconnection overlap or an injected frame. Drop it
                // whole, ack nothing.
                trace!(
                    session = %shared.id,
                    seq = header.seq,
                    expected = seq.next_expected_recv,
                    "discarding out-of-order frame"
                );
            }
        }

        // An ack may ride on any frame, in-order or not.
        if seq_lt(seq.highest_acked, header.ack) && !seq_lt(seq.next_send_seq, header.ack) {
            let advance = header.ack.wrapping_sub(seq.highest_acked) as usize;
            let trim = advance.min(seq.retransmit_buf.len());
            let _ = seq.retransmit_buf.split_to(trim);
            seq.highest_acked = header.ack;
        }
    }

    if delivered {
        // Acks are sent off the reader path so a slow carrier write never
        // stalls frame processing.
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.send_ack().await {
                debug!(session = %shared.id, "ack write failed: {e}");
            }
        });
    }
}

impl Shared {
    /// Send a pure acknowledgement: a zero-length frame carrying the
    /// current receive high-water mark.
    async fn send_ack(&self) -> io::Result<()> {
        let header = {
            let seq = self.seq.lock().unwrap();
            Header {
                seq: seq.next_send_seq,
                ack: seq.next_expected_recv,
                length: 0,
                session_id: self.id,
            }
        };
        let mut writer = self.writer.lock().await;
        if let Some(w) = writer.as_mut() {
            write_all_flush(w, &header.encode()).await?;
        }
        Ok(())
    }

    /// Replay every unacknowledged byte on the current carrier as one
    /// batch, rewinding `next_send_seq` so the bytes keep their original
    /// sequence numbers.
    async fn retransmit_buffered(&self) {
        let batch = {
            let mut seq = self.seq.lock().unwrap();
            if seq.retransmit_buf.is_empty() {
                return;
            }
            seq.next_send_seq = seq.highest_acked;

            let buf = seq.retransmit_buf.clone();
            let mut batch = Vec::with_capacity(buf.len() + HEADER_LEN);
            let mut offset = 0;
            while offset < buf.len() {
                let n = (buf.len() - offset).min(MAX_PAYLOAD);
                let header = Header {
                    seq: seq.next_send_seq,
                    ack: seq.next_expected_recv,
                    length: n as u16,
                    session_id: self.id,
                };
                batch.extend_from_slice(&header.encode());
                batch.extend_from_slice(&buf[offset..offset + n]);
                seq.next_send_seq = seq.next_send_seq.wrapping_add(n as u32);
                offset += n;
            }
            batch
        };

        let mut writer = self.writer.lock().await;
        if let Some(w) = writer.as_mut() {
            if let Err(e) = write_all_flush(w, &batch).await {
                debug!(session = %self.id, "retransmission write failed, bytes stay buffered: {e}");
            } else {
                debug!(session = %self.id, "replayed unacked bytes on new carrier");
            }
        }
    }

    /// Tear everything down. Safe to call repeatedly and from the timer
    /// task itself (the timer abort comes last).
    async fn shutdown(&self) {
        self.inbound_tx.lock().unwrap().take();
        {
            let mut seq = self.seq.lock().unwrap();
            seq.retransmit_buf.clear();
        }
        if let Some(reader) = self.carrier.lock().await.take() {
            reader.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.abort();
        }
    }
}
