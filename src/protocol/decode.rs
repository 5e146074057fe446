//! Incremental frame decoder
//!
//! Feed raw serial chunks in with `push`, pull complete frames out with
//! `next_frame`. The decoder resynchronizes after corruption: a failed
//! checksum discards a single byte (the length field cannot be trusted),
//! while a frame that checksums cleanly but carries an unknown kind or a
//! wrong payload size is skipped whole.

use super::frame::{checksum, MAX_FRAME_SIZE, MIN_FRAME_SIZE, MAX_WIRE_PAYLOAD};
use super::ring_buffer::ByteRing;
use super::{
    Frame, TelemetryFrame, ACK_PAYLOAD_LEN, KIND_ACK, KIND_HALT, KIND_REQUEST_STATUS,
    KIND_SET_SERVO, KIND_SET_VELOCITY, KIND_TELEMETRY, SERVO_PAYLOAD_LEN, SYNC_1, SYNC_2,
    VELOCITY_PAYLOAD_LEN,
};

/// Reassembly buffer capacity
const RING_CAPACITY: usize = 1024;

/// Bounds for the wire length field (kind + corr + payload + checksum)
const MIN_WIRE_LEN: usize = 5;
const MAX_WIRE_LEN: usize = MIN_WIRE_LEN + MAX_WIRE_PAYLOAD;

/// Streaming decoder for chassis frames
pub struct Decoder {
    ring: ByteRing<RING_CAPACITY>,
    corrupt_frames: u64,
    dropped_bytes: u64,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            ring: ByteRing::new(),
            corrupt_frames: 0,
            dropped_bytes: 0,
        }
    }

    /// Buffer a chunk read from the link
    pub fn push(&mut self, chunk: &[u8]) {
        let accepted = self.ring.push_slice(chunk);
        let overflow = chunk.len() - accepted;
        if overflow > 0 {
            self.dropped_bytes += overflow as u64;
            log::warn!("Decoder buffer overflow, dropped {} bytes", overflow);
        }
    }

    /// Frames that failed validation since construction
    pub fn corrupt_frames(&self) -> u64 {
        self.corrupt_frames
    }

    /// Bytes discarded without being part of a valid frame
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    /// Extract the next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let Some(at) = self.ring.find_sync(SYNC_1, SYNC_2) else {
                // No sync anywhere; keep the last byte in case it is the
                // first half of a split sync pair.
                let n = self.ring.len().saturating_sub(1);
                self.ring.advance(n);
                self.dropped_bytes += n as u64;
                return None;
            };
            if at > 0 {
                self.ring.advance(at);
                self.dropped_bytes += at as u64;
            }
            if self.ring.len() < MIN_FRAME_SIZE {
                return None;
            }

            let wire_len = self.ring.get(2).unwrap_or(0) as usize;
            if !(MIN_WIRE_LEN..=MAX_WIRE_LEN).contains(&wire_len) {
                self.reject_byte("length field out of range");
                continue;
            }
            let total = 3 + wire_len;
            if self.ring.len() < total {
                return None;
            }

            // Verify integrity before trusting anything else in the frame
            let mut scratch = [0u8; MAX_FRAME_SIZE];
            let span = wire_len - 2;
            self.ring.copy_to(3, &mut scratch[..span]);
            let stored = u16::from_be_bytes([
                self.ring.get(total - 2).unwrap_or(0),
                self.ring.get(total - 1).unwrap_or(0),
            ]);
            let calculated = checksum(&scratch[..span]);
            if stored != calculated {
                log::warn!(
                    "Frame checksum mismatch: stored {:#06x}, calculated {:#06x}",
                    stored,
                    calculated
                );
                self.reject_byte("checksum mismatch");
                continue;
            }

            let kind = scratch[0];
            let corr = u16::from_le_bytes([scratch[1], scratch[2]]);
            let payload = &scratch[3..span];
            // Length was integrity-checked, so a frame that parses wrong can
            // be skipped in one piece.
            match parse_body(kind, corr, payload) {
                Some(frame) => {
                    self.ring.advance(total);
                    return Some(frame);
                }
                None => {
                    log::warn!(
                        "Discarding well-formed frame with unusable body: kind {:#04x}, {} payload bytes",
                        kind,
                        payload.len()
                    );
                    self.corrupt_frames += 1;
                    self.ring.advance(total);
                }
            }
        }
    }

    fn reject_byte(&mut self, reason: &str) {
        log::debug!("Resynchronizing after {}", reason);
        self.corrupt_frames += 1;
        self.ring.advance(1);
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_body(kind: u8, corr: u16, payload: &[u8]) -> Option<Frame> {
    match kind {
        KIND_SET_VELOCITY if payload.len() == VELOCITY_PAYLOAD_LEN => Some(Frame::SetVelocity {
            corr,
            linear: super::from_milli(i16::from_le_bytes([payload[0], payload[1]])),
            angular: super::from_milli(i16::from_le_bytes([payload[2], payload[3]])),
        }),
        KIND_SET_SERVO if payload.len() == SERVO_PAYLOAD_LEN => Some(Frame::SetServo {
            corr,
            channel: payload[0],
            angle_deg: payload[1],
        }),
        KIND_REQUEST_STATUS if payload.is_empty() => Some(Frame::RequestStatus { corr }),
        KIND_HALT if payload.is_empty() => Some(Frame::Halt { corr }),
        KIND_ACK if payload.len() == ACK_PAYLOAD_LEN => Some(Frame::Ack {
            corr,
            status: payload[0],
        }),
        KIND_TELEMETRY => TelemetryFrame::from_payload(payload)
            .map(|data| Frame::Telemetry { corr, data }),
        _ => None,
    }
}
