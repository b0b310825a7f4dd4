//! Framing and fragmentation for the radio link.
//!
//! The radio modem is a transparent byte pipe, so frame boundaries are
//! recovered from sync markers and a length byte. Messages larger than one
//! frame are split into ordered fragments and reassembled on the far side.
//!
//! ## Frame Format
//!
//! ```text
//! +------+-----+-----+---------+------+-------+---------+--------+------+
//! | SYNC | LEN | SRC | MSG_SEQ | FRAG | COUNT | PAYLOAD | CRC16  | SYNC |
//! +------+-----+-----+---------+------+-------+---------+--------+------+
//!   0xAA   1B    1B    2B (BE)   1B     1B      LEN B    2B (BE)  0x55
//! ```
//!
//! The CRC-16-CCITT covers LEN through the end of PAYLOAD. A message is at
//! most 255 fragments; a lost fragment makes the whole message expire after
//! the reassembly timeout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::RadioError;

const SYNC_START: u8 = 0xAA;
const SYNC_END: u8 = 0x55;

/// start(1) + len(1) + src(1) + seq(2) + frag(1) + count(1) + crc(2) + end(1)
pub const FRAME_OVERHEAD: usize = 10;

/// Bytes between the start marker and the payload.
const HEADER_LEN: usize = 6;

pub const MAX_FRAGMENTS: usize = 255;

/// Smallest frame worth sending; anything below leaves almost no room for payload.
pub const MIN_FRAME_SIZE: usize = FRAME_OVERHEAD + 8;

/// Largest frame the one-byte length field allows.
pub const MAX_FRAME_SIZE: usize = 255 + FRAME_OVERHEAD;

/// Upper bound on messages reassembled at once; the oldest is evicted beyond it.
const MAX_PARTIALS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub src_node: u8,
    pub msg_seq: u16,
    pub frag_idx: u8,
    pub frag_count: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload.len() + FRAME_OVERHEAD);
        buf.push(SYNC_START);
        buf.push(self.payload.len() as u8);
        buf.push(self.src_node);
        buf.extend_from_slice(&self.msg_seq.to_be_bytes());
        buf.push(self.frag_idx);
        buf.push(self.frag_count);
        buf.extend_from_slice(&self.payload);
        let crc = crc16_ccitt(&buf[1..]);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf.push(SYNC_END);
        buf
    }
}

/// Largest payload carried by one frame of `frame_size` bytes.
pub fn payload_capacity(frame_size: usize) -> Result<usize, RadioError> {
    if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&frame_size) {
        return Err(RadioError::InvalidFrameSize(frame_size));
    }
    Ok(frame_size - FRAME_OVERHEAD)
}

/// Splits `payload` into encoded frames no larger than `frame_size`, in send order.
pub fn fragment(
    src_node: u8,
    msg_seq: u16,
    payload: &[u8],
    frame_size: usize,
) -> Result<Vec<Vec<u8>>, RadioError> {
    let capacity = payload_capacity(frame_size)?;
    let count = payload.len().div_ceil(capacity).max(1);
    if count > MAX_FRAGMENTS {
        return Err(RadioError::PayloadTooLarge {
            size: payload.len(),
            max_fragments: MAX_FRAGMENTS,
        });
    }

    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&[]]
    } else {
        payload.chunks(capacity).collect()
    };

    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(idx, chunk)| {
            Frame {
                src_node,
                msg_seq,
                frag_idx: idx as u8,
                frag_count: count as u8,
                payload: chunk.to_vec(),
            }
            .encode()
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    WaitStart,
    Body,
}

/// Byte-at-a-time frame decoder that resynchronises on the next start marker.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecoderState,
    buf: Vec<u8>,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        FrameDecoder {
            state: DecoderState::WaitStart,
            buf: Vec::with_capacity(max_payload + FRAME_OVERHEAD),
            max_payload,
        }
    }

    pub fn reset(&mut self) {
        self.state = DecoderState::WaitStart;
        self.buf.clear();
    }

    pub fn is_receiving(&self) -> bool {
        self.state == DecoderState::Body
    }

    /// Feeds one byte. Returns a frame once complete; a corrupt frame is
    /// reported and the decoder goes back to hunting for a start marker.
    pub fn feed(&mut self, byte: u8) -> Result<Option<Frame>, RadioError> {
        match self.state {
            DecoderState::WaitStart => {
                if byte == SYNC_START {
                    self.buf.clear();
                    self.state = DecoderState::Body;
                }
                Ok(None)
            }
            DecoderState::Body => {
                self.buf.push(byte);
                let len = self.buf[0] as usize;
                if len > self.max_payload {
                    self.reset();
                    return Err(RadioError::CorruptFrame("length exceeds frame size"));
                }

                // header + payload + crc(2) + end(1) minus the start marker
                let total = HEADER_LEN + len + 3;
                if self.buf.len() < total {
                    return Ok(None);
                }

                let result = self.finish(len);
                self.reset();
                result.map(Some)
            }
        }
    }

    fn finish(&self, len: usize) -> Result<Frame, RadioError> {
        let body_end = HEADER_LEN + len;
        if self.buf[body_end + 2] != SYNC_END {
            return Err(RadioError::CorruptFrame("missing end marker"));
        }
        let expected = u16::from_be_bytes([self.buf[body_end], self.buf[body_end + 1]]);
        if crc16_ccitt(&self.buf[..body_end]) != expected {
            return Err(RadioError::CorruptFrame("checksum mismatch"));
        }

        let frame = Frame {
            src_node: self.buf[1],
            msg_seq: u16::from_be_bytes([self.buf[2], self.buf[3]]),
            frag_idx: self.buf[4],
            frag_count: self.buf[5],
            payload: self.buf[HEADER_LEN..body_end].to_vec(),
        };
        if frame.frag_count == 0 || frame.frag_idx >= frame.frag_count {
            return Err(RadioError::CorruptFrame("fragment index out of range"));
        }
        Ok(frame)
    }
}

#[derive(Debug)]
struct Partial {
    fragments: Vec<Option<Vec<u8>>>,
    received: usize,
    first_seen: Instant,
}

impl Partial {
    fn new(count: u8, now: Instant) -> Self {
        Partial {
            fragments: vec![None; count as usize],
            received: 0,
            first_seen: now,
        }
    }
}

/// Collects fragments, in any order, back into whole messages.
#[derive(Debug)]
pub struct Reassembler {
    partials: HashMap<(u8, u16), Partial>,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Reassembler {
            partials: HashMap::new(),
            timeout,
        }
    }

    pub fn pending(&self) -> usize {
        self.partials.len()
    }

    /// Adds a fragment; returns the full message when its last missing piece arrives.
    pub fn push(&mut self, frame: Frame, now: Instant) -> Option<Vec<u8>> {
        if frame.frag_count == 1 {
            return Some(frame.payload);
        }

        let key = (frame.src_node, frame.msg_seq);
        let restart = self
            .partials
            .get(&key)
            .is_some_and(|partial| partial.fragments.len() != frame.frag_count as usize);
        if restart {
            // Sequence number wrapped onto a stale, differently-sized message.
            self.partials.remove(&key);
        }
        if !self.partials.contains_key(&key) && self.partials.len() >= MAX_PARTIALS {
            self.evict_oldest();
        }

        let partial = self
            .partials
            .entry(key)
            .or_insert_with(|| Partial::new(frame.frag_count, now));
        let slot = &mut partial.fragments[frame.frag_idx as usize];
        if slot.is_none() {
            *slot = Some(frame.payload);
            partial.received += 1;
        }
        if partial.received < partial.fragments.len() {
            return None;
        }

        let partial = self.partials.remove(&key)?;
        Some(partial.fragments.into_iter().flatten().flatten().collect())
    }

    /// Drops messages whose fragments stopped arriving.
    pub fn expire(&mut self, now: Instant) -> Vec<RadioError> {
        let timeout = self.timeout;
        let expired: Vec<(u8, u16)> = self
            .partials
            .iter()
            .filter(|(_, partial)| now.duration_since(partial.first_seen) >= timeout)
            .map(|(key, _)| *key)
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.partials.remove(&key).map(|partial| (key, partial)))
            .map(|((_, msg_seq), partial)| RadioError::ReassemblyTimeout {
                msg_seq,
                received: partial.received,
                expected: partial.fragments.len(),
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.partials.clear();
    }

    fn evict_oldest(&mut self) {
        if let Some(key) = self
            .partials
            .iter()
            .min_by_key(|(_, partial)| partial.first_seen)
            .map(|(key, _)| *key)
        {
            self.partials.remove(&key);
        }
    }
}

/// CRC-16-CCITT (polynomial 0x1021, initial value 0xFFFF).
fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
