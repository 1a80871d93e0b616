//! Frame chunking, reassembly and binary framing.
//!
//! Encoded frames larger than the client's unchunked limit are split into
//! fixed-size chunks. Every chunk repeats the frame's content digest so a
//! receiver can verify the reassembled frame even when the envelope
//! arrives late or not at all.
//!
//! ## Wire format
//!
//! All integers are little-endian. The first byte is a message tag.
//!
//! **Envelope** (tag 1, 60 bytes; tag 3 is the same header followed by
//! the whole frame payload):
//! ```text
//! tag:            u8       (1)
//! frame_id:       u64      (8)
//! timestamp_us:   u64      (8)
//! total_size:     u32      (4)
//! total_chunks:   u32      (4)
//! content_hash:   [u8; 32] (32)
//! quality:        u8       (1)
//! encoding:       u8       (1)
//! codec:          u8       (1)
//! ```
//!
//! **Chunk** (tag 2, 57 byte header + payload):
//! ```text
//! tag:            u8       (1)
//! frame_id:       u64      (8)
//! chunk_index:    u32      (4)
//! total_chunks:   u32      (4)
//! total_size:     u32      (4)
//! content_hash:   [u8; 32] (32)
//! payload_len:    u32      (4)
//! payload:        [u8]     (payload_len)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::CodecFamily;
use crate::config::StreamingConfig;
use crate::connection::EncodingMethod;
use crate::error::StreamError;

// ── Identity & digest ────────────────────────────────────────────

/// Per-connection frame identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u64);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// BLAKE3 digest of a complete encoded frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({self})")
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough for logs.
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

// ── FrameEnvelope ────────────────────────────────────────────────

/// Encoding metadata carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    /// Effective quality the frame was encoded at (0 if unknown).
    pub quality: u8,
    pub encoding: EncodingMethod,
    pub codec: CodecFamily,
}

impl Default for FrameMeta {
    fn default() -> Self {
        Self {
            quality: 0,
            encoding: EncodingMethod::RawBinary,
            codec: CodecFamily::Jpeg,
        }
    }
}

/// Frame-level metadata, sent once per frame regardless of chunking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEnvelope {
    pub frame_id: FrameId,
    /// Wall-clock production time, microseconds since the UNIX epoch.
    pub timestamp_us: u64,
    pub total_size: u32,
    /// 1 for frames sent unchunked.
    pub total_chunks: u32,
    pub content_hash: ContentHash,
    pub meta: FrameMeta,
}

impl FrameEnvelope {
    pub const SIZE: usize = 60;

    pub fn new(data: &[u8], frame_id: FrameId, total_chunks: u32, meta: FrameMeta) -> Self {
        Self {
            frame_id,
            timestamp_us: now_us(),
            total_size: data.len() as u32,
            total_chunks,
            content_hash: ContentHash::of(data),
            meta,
        }
    }

    fn put(&self, tag: u8, buf: &mut BytesMut) {
        buf.put_u8(tag);
        buf.put_u64_le(self.frame_id.0);
        buf.put_u64_le(self.timestamp_us);
        buf.put_u32_le(self.total_size);
        buf.put_u32_le(self.total_chunks);
        buf.put_slice(&self.content_hash.0);
        buf.put_u8(self.meta.quality);
        buf.put_u8(self.meta.encoding.wire_id());
        buf.put_u8(codec_wire_id(self.meta.codec));
    }

    /// Read the fields after the tag byte.
    fn get(buf: &mut Bytes) -> Result<Self, StreamError> {
        ensure_len(buf, Self::SIZE - 1, "envelope")?;
        let frame_id = FrameId(buf.get_u64_le());
        let timestamp_us = buf.get_u64_le();
        let total_size = buf.get_u32_le();
        let total_chunks = buf.get_u32_le();
        let content_hash = get_hash(buf);
        let quality = buf.get_u8();
        let encoding = EncodingMethod::from_wire_id(buf.get_u8())?;
        let codec = codec_from_wire_id(buf.get_u8())?;
        Ok(Self {
            frame_id,
            timestamp_us,
            total_size,
            total_chunks,
            content_hash,
            meta: FrameMeta {
                quality,
                encoding,
                codec,
            },
        })
    }
}

// ── Chunk ────────────────────────────────────────────────────────

/// Bounded fragment of one encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub frame_id: FrameId,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub total_size: u32,
    pub content_hash: ContentHash,
    pub payload: Bytes,
}

impl Chunk {
    pub const HEADER_SIZE: usize = 57;
}

// ── FrameChunker (sender) ────────────────────────────────────────

/// Sender side: splits encoded frames into ordered chunks.
pub struct FrameChunker;

impl FrameChunker {
    /// Split `data` into `ceil(len / chunk_size)` chunks.
    pub fn chunk(
        data: Bytes,
        frame_id: FrameId,
        chunk_size: usize,
    ) -> Result<(FrameEnvelope, Vec<Chunk>), StreamError> {
        Self::chunk_with(data, frame_id, chunk_size, FrameMeta::default())
    }

    pub fn chunk_with(
        data: Bytes,
        frame_id: FrameId,
        chunk_size: usize,
        meta: FrameMeta,
    ) -> Result<(FrameEnvelope, Vec<Chunk>), StreamError> {
        if chunk_size == 0 {
            return Err(StreamError::InvalidSettings("chunk size must be > 0".into()));
        }
        if data.len() > u32::MAX as usize {
            return Err(StreamError::InvalidSettings(format!(
                "frame of {} bytes exceeds wire limit",
                data.len()
            )));
        }
        let total_chunks = data.len().div_ceil(chunk_size) as u32;
        let envelope = FrameEnvelope::new(&data, frame_id, total_chunks, meta);

        let chunks = (0..total_chunks as usize)
            .map(|i| {
                let start = i * chunk_size;
                let end = (start + chunk_size).min(data.len());
                Chunk {
                    frame_id,
                    chunk_index: i as u32,
                    total_chunks,
                    total_size: envelope.total_size,
                    content_hash: envelope.content_hash,
                    payload: data.slice(start..end),
                }
            })
            .collect();
        Ok((envelope, chunks))
    }
}

// ── Reassembler (receiver) ───────────────────────────────────────

struct ReassemblyBuffer {
    expected: u32,
    total_size: u32,
    content_hash: ContentHash,
    meta: Option<FrameMeta>,
    received: HashMap<u32, Bytes>,
    bytes: usize,
    first_seen: Instant,
}

/// Counters kept by a [`Reassembler`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub completed: u64,
    pub mismatched: u64,
    pub expired: u64,
    pub rejected_chunks: u64,
}

/// A complete frame whose digest matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFrame {
    pub frame_id: FrameId,
    /// From the envelope, if it arrived before the last chunk.
    pub meta: Option<FrameMeta>,
    pub payload: Bytes,
}

impl AssembledFrame {
    /// Undo the frame's encoding method.
    pub fn decoded(&self) -> Result<Vec<u8>, StreamError> {
        match self.meta {
            Some(meta) => meta.encoding.decode(&self.payload),
            None => Err(StreamError::Wire(format!(
                "frame {} has no envelope, encoding unknown",
                self.frame_id
            ))),
        }
    }
}

/// Receiver side: collects chunks per frame and yields verified frames.
///
/// Header fields are untrusted. Nothing is allocated from them, and a
/// frame's buffered bytes never exceed its announced size, which is
/// itself capped at `max_frame_bytes`.
pub struct Reassembler {
    buffers: HashMap<FrameId, ReassemblyBuffer>,
    max_frame_bytes: usize,
    stats: ReassemblyStats,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::with_max_frame_bytes(Self::DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Reassembler {
    pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            max_frame_bytes,
            stats: ReassemblyStats::default(),
        }
    }

    /// Record the envelope of a chunked frame so its metadata travels
    /// with the reassembled payload.
    pub fn announce(&mut self, envelope: &FrameEnvelope) -> Result<(), StreamError> {
        self.announce_at(envelope, Instant::now())
    }

    pub fn announce_at(&mut self, envelope: &FrameEnvelope, now: Instant) -> Result<(), StreamError> {
        let header = Header {
            frame_id: envelope.frame_id,
            chunk_index: 0,
            total_chunks: envelope.total_chunks,
            total_size: envelope.total_size,
            content_hash: envelope.content_hash,
        };
        let buffer = self.buffer_for(&header, now)?;
        buffer.meta = Some(envelope.meta);
        Ok(())
    }

    /// Accept one chunk. Returns the frame once all chunks arrived and
    /// the digest matches.
    ///
    /// Malformed or inconsistent chunks are rejected with
    /// [`StreamError::Wire`]; a complete frame whose digest does not
    /// match is dropped with [`StreamError::ReassemblyMismatch`].
    pub fn receive(&mut self, chunk: Chunk) -> Result<Option<AssembledFrame>, StreamError> {
        self.receive_at(chunk, Instant::now())
    }

    /// [`receive`](Self::receive) with an explicit clock (for testing).
    pub fn receive_at(&mut self, chunk: Chunk, now: Instant) -> Result<Option<AssembledFrame>, StreamError> {
        let header = Header {
            frame_id: chunk.frame_id,
            chunk_index: chunk.chunk_index,
            total_chunks: chunk.total_chunks,
            total_size: chunk.total_size,
            content_hash: chunk.content_hash,
        };
        let buffer = self.buffer_for(&header, now)?;

        if buffer.received.contains_key(&chunk.chunk_index) {
            debug!(frame_id = %chunk.frame_id, index = chunk.chunk_index, "duplicate chunk ignored");
            return Ok(None);
        }
        if buffer.bytes + chunk.payload.len() > buffer.total_size as usize {
            let announced = buffer.total_size;
            return Err(self.reject(&header, format!("payload overruns announced size {announced}")));
        }
        buffer.bytes += chunk.payload.len();
        buffer.received.insert(chunk.chunk_index, chunk.payload);
        if buffer.received.len() < buffer.expected as usize {
            return Ok(None);
        }

        let Some(mut buffer) = self.buffers.remove(&chunk.frame_id) else {
            return Ok(None);
        };
        let mut frame = BytesMut::new();
        for i in 0..buffer.expected {
            if let Some(part) = buffer.received.remove(&i) {
                frame.extend_from_slice(&part);
            }
        }
        let frame = frame.freeze();

        let actual = ContentHash::of(&frame);
        if frame.len() != buffer.total_size as usize || actual != buffer.content_hash {
            warn!(
                frame_id = %chunk.frame_id,
                expected = %buffer.content_hash,
                actual = %actual,
                size = frame.len(),
                "reassembled frame failed verification, dropping"
            );
            self.stats.mismatched += 1;
            return Err(StreamError::ReassemblyMismatch {
                frame_id: chunk.frame_id.0,
            });
        }

        self.stats.completed += 1;
        Ok(Some(AssembledFrame {
            frame_id: chunk.frame_id,
            meta: buffer.meta,
            payload: frame,
        }))
    }

    /// Evict every buffer older than `max_age`. Returns how many went.
    pub fn cleanup_expired(&mut self, max_age: Duration) -> usize {
        self.cleanup_expired_at(Instant::now(), max_age)
    }

    pub fn cleanup_expired_at(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.buffers.len();
        self.buffers.retain(|frame_id, buf| {
            let keep = now.saturating_duration_since(buf.first_seen) <= max_age;
            if !keep {
                warn!(
                    frame_id = %frame_id,
                    received = buf.received.len(),
                    expected = buf.expected,
                    "abandoning incomplete frame"
                );
            }
            keep
        });
        let evicted = before - self.buffers.len();
        self.stats.expired += evicted as u64;
        evicted
    }

    /// Number of incomplete frames currently buffered.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Validate `header` and find or open its frame's buffer.
    fn buffer_for(&mut self, header: &Header, now: Instant) -> Result<&mut ReassemblyBuffer, StreamError> {
        if let Err(reason) = header.check(self.max_frame_bytes) {
            return Err(self.reject(header, reason));
        }
        let consistent = self.buffers.get(&header.frame_id).is_none_or(|buf| {
            buf.expected == header.total_chunks
                && buf.total_size == header.total_size
                && buf.content_hash == header.content_hash
        });
        if !consistent {
            return Err(self.reject(header, "disagrees with earlier chunks of its frame".into()));
        }
        Ok(self.buffers.entry(header.frame_id).or_insert_with(|| ReassemblyBuffer {
            expected: header.total_chunks,
            total_size: header.total_size,
            content_hash: header.content_hash,
            meta: None,
            received: HashMap::new(),
            bytes: 0,
            first_seen: now,
        }))
    }

    fn reject(&mut self, header: &Header, reason: String) -> StreamError {
        warn!(
            frame_id = %header.frame_id,
            index = header.chunk_index,
            total = header.total_chunks,
            size = header.total_size,
            "chunk rejected: {reason}"
        );
        self.stats.rejected_chunks += 1;
        StreamError::Wire(format!("frame {}: {reason}", header.frame_id))
    }
}

/// The frame-level fields shared by envelopes and chunks.
struct Header {
    frame_id: FrameId,
    chunk_index: u32,
    total_chunks: u32,
    total_size: u32,
    content_hash: ContentHash,
}

impl Header {
    fn check(&self, max_frame_bytes: usize) -> Result<(), String> {
        if self.total_chunks == 0 {
            return Err("zero chunks announced".into());
        }
        if self.total_chunks > self.total_size {
            return Err(format!(
                "{} chunks cannot carry {} bytes",
                self.total_chunks, self.total_size
            ));
        }
        if self.chunk_index >= self.total_chunks {
            return Err(format!("chunk index {} out of range", self.chunk_index));
        }
        if self.total_size as usize > max_frame_bytes {
            return Err(format!(
                "frame of {} bytes exceeds limit {max_frame_bytes}",
                self.total_size
            ));
        }
        Ok(())
    }
}

/// Run `cleanup_expired` every `interval` until the reassembler is dropped.
pub fn spawn_janitor(
    reassembler: &Arc<Mutex<Reassembler>>,
    interval: Duration,
    max_age: Duration,
) -> JoinHandle<()> {
    let weak: Weak<Mutex<Reassembler>> = Arc::downgrade(reassembler);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(reassembler) = weak.upgrade() else {
                break;
            };
            let evicted = reassembler.lock().await.cleanup_expired(max_age);
            if evicted > 0 {
                debug!(evicted, "reassembly janitor pass");
            }
        }
    })
}

// ── FrameReceiver ────────────────────────────────────────────────

/// Client-side endpoint for the binary push stream.
///
/// Decodes each binary message, reassembles chunked frames and keeps a
/// janitor running that drops partial frames older than
/// `reassembly_max_age_ms`, every `cleanup_interval_ms`. Must be created
/// inside a Tokio runtime.
pub struct FrameReceiver {
    reassembler: Arc<Mutex<Reassembler>>,
    janitor: JoinHandle<()>,
}

impl FrameReceiver {
    pub fn new(config: &StreamingConfig) -> Self {
        let reassembler = Arc::new(Mutex::new(Reassembler::with_max_frame_bytes(
            config.max_frame_bytes,
        )));
        let janitor = spawn_janitor(&reassembler, config.cleanup_interval(), config.reassembly_max_age());
        Self { reassembler, janitor }
    }

    /// Feed one binary message. Yields a frame when one is complete.
    pub async fn receive(&self, data: Bytes) -> Result<Option<AssembledFrame>, StreamError> {
        match WireMessage::decode(data)? {
            WireMessage::Frame(envelope, payload) => {
                if ContentHash::of(&payload) != envelope.content_hash {
                    return Err(StreamError::ReassemblyMismatch {
                        frame_id: envelope.frame_id.0,
                    });
                }
                Ok(Some(AssembledFrame {
                    frame_id: envelope.frame_id,
                    meta: Some(envelope.meta),
                    payload,
                }))
            }
            WireMessage::Envelope(envelope) => {
                self.reassembler.lock().await.announce(&envelope)?;
                Ok(None)
            }
            WireMessage::Chunk(chunk) => self.reassembler.lock().await.receive(chunk),
        }
    }

    /// Incomplete frames currently buffered.
    pub async fn pending(&self) -> usize {
        self.reassembler.lock().await.pending()
    }

    pub async fn stats(&self) -> ReassemblyStats {
        self.reassembler.lock().await.stats()
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.janitor.abort();
    }
}

// ── Wire framing ─────────────────────────────────────────────────

pub const TAG_ENVELOPE: u8 = 1;
pub const TAG_CHUNK: u8 = 2;
pub const TAG_FRAME: u8 = 3;

/// One binary message on the push transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Envelope(FrameEnvelope),
    Chunk(Chunk),
    /// Unchunked frame with its envelope inline.
    Frame(FrameEnvelope, Bytes),
}

impl WireMessage {
    pub fn encode(&self) -> Bytes {
        match self {
            WireMessage::Envelope(env) => {
                let mut buf = BytesMut::with_capacity(FrameEnvelope::SIZE);
                env.put(TAG_ENVELOPE, &mut buf);
                buf.freeze()
            }
            WireMessage::Chunk(chunk) => {
                let mut buf = BytesMut::with_capacity(Chunk::HEADER_SIZE + chunk.payload.len());
                buf.put_u8(TAG_CHUNK);
                buf.put_u64_le(chunk.frame_id.0);
                buf.put_u32_le(chunk.chunk_index);
                buf.put_u32_le(chunk.total_chunks);
                buf.put_u32_le(chunk.total_size);
                buf.put_slice(&chunk.content_hash.0);
                buf.put_u32_le(chunk.payload.len() as u32);
                buf.put_slice(&chunk.payload);
                buf.freeze()
            }
            WireMessage::Frame(env, payload) => {
                let mut buf = BytesMut::with_capacity(FrameEnvelope::SIZE + payload.len());
                env.put(TAG_FRAME, &mut buf);
                buf.put_slice(payload);
                buf.freeze()
            }
        }
    }

    pub fn decode(mut data: Bytes) -> Result<Self, StreamError> {
        ensure_len(&data, 1, "message")?;
        match data.get_u8() {
            TAG_ENVELOPE => Ok(WireMessage::Envelope(FrameEnvelope::get(&mut data)?)),
            TAG_FRAME => {
                let env = FrameEnvelope::get(&mut data)?;
                if data.len() != env.total_size as usize {
                    return Err(StreamError::Wire(format!(
                        "frame payload {} != announced {}",
                        data.len(),
                        env.total_size
                    )));
                }
                Ok(WireMessage::Frame(env, data))
            }
            TAG_CHUNK => {
                ensure_len(&data, Chunk::HEADER_SIZE - 1, "chunk header")?;
                let frame_id = FrameId(data.get_u64_le());
                let chunk_index = data.get_u32_le();
                let total_chunks = data.get_u32_le();
                let total_size = data.get_u32_le();
                let content_hash = get_hash(&mut data);
                let len = data.get_u32_le() as usize;
                if data.len() != len {
                    return Err(StreamError::Wire(format!(
                        "chunk payload {} != announced {len}",
                        data.len()
                    )));
                }
                Ok(WireMessage::Chunk(Chunk {
                    frame_id,
                    chunk_index,
                    total_chunks,
                    total_size,
                    content_hash,
                    payload: data,
                }))
            }
            other => Err(StreamError::Wire(format!("unknown tag {other}"))),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn ensure_len(buf: &Bytes, need: usize, what: &str) -> Result<(), StreamError> {
    if buf.len() < need {
        return Err(StreamError::Wire(format!(
            "{what} too short: {} < {need}",
            buf.len()
        )));
    }
    Ok(())
}

fn get_hash(buf: &mut Bytes) -> ContentHash {
    let mut hash = [0u8; 32];
    buf.copy_to_slice(&mut hash);
    ContentHash(hash)
}

fn codec_wire_id(codec: CodecFamily) -> u8 {
    CodecFamily::PRIORITY
        .iter()
        .position(|f| *f == codec)
        .map(|i| i as u8)
        .unwrap_or(u8::MAX)
}

fn codec_from_wire_id(id: u8) -> Result<CodecFamily, StreamError> {
    CodecFamily::PRIORITY
        .get(id as usize)
        .copied()
        .ok_or_else(|| StreamError::Wire(format!("unknown codec id {id}")))
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

// ── Tests ────────────────────────────────────────────────────────
