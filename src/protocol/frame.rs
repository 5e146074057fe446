//! Frame encoding
//!
//! Wire layout, all frames both directions:
//!
//! ```text
//! [0xA5] [0x5A] [LEN] [KIND] [CORR_LO] [CORR_HI] [PAYLOAD...] [CK_H] [CK_L]
//! ```
//!
//! `LEN` counts everything after itself (kind + correlation id + payload +
//! checksum). Multi-byte payload fields are little-endian. The checksum is
//! a big-endian 16-bit word sum over kind through payload, with a trailing
//! odd byte folded in by XOR, stored big-endian.

use super::{
    Command, CorrId, TelemetryFrame, KIND_ACK, KIND_HALT, KIND_REQUEST_STATUS, KIND_SET_SERVO,
    KIND_SET_VELOCITY, KIND_TELEMETRY, SYNC_1, SYNC_2, TELEMETRY_PAYLOAD_LEN,
};

/// Largest frame that can appear on the wire
pub const MAX_FRAME_SIZE: usize = 24;
/// Smallest complete frame (empty payload)
pub const MIN_FRAME_SIZE: usize = 8;
/// Largest payload a frame can carry
pub const MAX_WIRE_PAYLOAD: usize = MAX_FRAME_SIZE - MIN_FRAME_SIZE;

/// Offset of the first payload byte within a frame
const PAYLOAD_OFFSET: usize = 6;

/// 16-bit checksum over a byte span
///
/// Big-endian word sum with wraparound; an odd trailing byte is XORed in.
pub fn checksum(data: &[u8]) -> u16 {
    let mut chunks = data.chunks_exact(2);
    let mut sum: u16 = 0;
    for pair in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let Some(&tail) = chunks.remainder().first() {
        sum ^= u16::from(tail);
    }
    sum
}

/// Reusable outbound frame buffer
///
/// One `set_*` call per transmission; `as_bytes` yields the finished
/// frame. The sync prefix is baked in at construction.
pub struct TxFrame {
    buf: [u8; MAX_FRAME_SIZE],
    len: usize,
}

impl TxFrame {
    pub const fn new() -> Self {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        buf[0] = SYNC_1;
        buf[1] = SYNC_2;
        Self { buf, len: 0 }
    }

    /// The encoded frame
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn begin(&mut self, kind: u8, corr: CorrId, payload_len: usize) {
        debug_assert!(payload_len <= MAX_WIRE_PAYLOAD);
        self.buf[2] = (1 + 2 + payload_len + 2) as u8;
        self.buf[3] = kind;
        self.buf[4..6].copy_from_slice(&corr.to_le_bytes());
    }

    fn finalize(&mut self, payload_len: usize) {
        let ck_pos = PAYLOAD_OFFSET + payload_len;
        let ck = checksum(&self.buf[3..ck_pos]);
        self.buf[ck_pos] = (ck >> 8) as u8;
        self.buf[ck_pos + 1] = (ck & 0xFF) as u8;
        self.len = ck_pos + 2;
    }

    /// Encode a velocity command (wire milli-units)
    pub fn set_velocity(&mut self, corr: CorrId, linear_mil: i16, angular_mil: i16) {
        self.begin(KIND_SET_VELOCITY, corr, 4);
        self.buf[6..8].copy_from_slice(&linear_mil.to_le_bytes());
        self.buf[8..10].copy_from_slice(&angular_mil.to_le_bytes());
        self.finalize(4);
    }

    /// Encode a servo positioning command
    pub fn set_servo(&mut self, corr: CorrId, channel: u8, angle_deg: u8) {
        self.begin(KIND_SET_SERVO, corr, 2);
        self.buf[6] = channel;
        self.buf[7] = angle_deg;
        self.finalize(2);
    }

    /// Encode a telemetry poll
    pub fn set_request_status(&mut self, corr: CorrId) {
        self.begin(KIND_REQUEST_STATUS, corr, 0);
        self.finalize(0);
    }

    /// Encode an emergency stop
    pub fn set_halt(&mut self, corr: CorrId) {
        self.begin(KIND_HALT, corr, 0);
        self.finalize(0);
    }

    /// Encode an acknowledgement (chassis side; used by test harnesses)
    #[allow(dead_code)]
    pub fn set_ack(&mut self, corr: CorrId, status: u8) {
        self.begin(KIND_ACK, corr, 1);
        self.buf[6] = status;
        self.finalize(1);
    }

    /// Encode a telemetry frame (chassis side; used by test harnesses)
    #[allow(dead_code)]
    pub fn set_telemetry(&mut self, corr: CorrId, data: &TelemetryFrame) {
        self.begin(KIND_TELEMETRY, corr, TELEMETRY_PAYLOAD_LEN);
        self.buf[6..6 + TELEMETRY_PAYLOAD_LEN].copy_from_slice(&data.to_payload());
        self.finalize(TELEMETRY_PAYLOAD_LEN);
    }

    /// Encode any validated command
    pub fn encode_command(&mut self, cmd: &Command) {
        match cmd {
            Command::SetVelocity {
                corr,
                linear_mil,
                angular_mil,
            } => self.set_velocity(*corr, *linear_mil, *angular_mil),
            Command::SetServo {
                corr,
                channel,
                angle_deg,
            } => self.set_servo(*corr, *channel, *angle_deg),
            Command::RequestStatus { corr } => self.set_request_status(*corr),
            Command::Halt { corr } => self.set_halt(*corr),
        }
    }
}

impl Default for TxFrame {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_word_sum() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0xAB]), 0x00AB);
        assert_eq!(checksum(&[0x12, 0x34]), 0x1234);
        assert_eq!(checksum(&[0x13, 0x02, 0x01]), 0x1303);
        // wrapping add, not saturating
        assert_eq!(checksum(&[0xFF, 0xFF, 0xFF, 0xFF]), 0xFFFE);
    }

    #[test]
    fn test_halt_frame_bytes() {
        let mut tx = TxFrame::new();
        tx.set_halt(0x0102);
        assert_eq!(
            tx.as_bytes(),
            &[0xA5, 0x5A, 0x05, 0x13, 0x02, 0x01, 0x13, 0x03]
        );
        assert_eq!(tx.as_bytes().len(), MIN_FRAME_SIZE);
    }

    #[test]
    fn test_velocity_frame_bytes() {
        let mut tx = TxFrame::new();
        tx.set_velocity(1, 500, -250);
        assert_eq!(
            tx.as_bytes(),
            &[0xA5, 0x5A, 0x09, 0x10, 0x01, 0x00, 0xF4, 0x01, 0x06, 0xFF, 0x11, 0x04]
        );
    }

    #[test]
    fn test_ack_frame_bytes() {
        let mut tx = TxFrame::new();
        tx.set_ack(7, 0);
        assert_eq!(
            tx.as_bytes(),
            &[0xA5, 0x5A, 0x06, 0x80, 0x07, 0x00, 0x00, 0x80, 0x07]
        );
    }

    #[test]
    fn test_len_byte_counts_tail() {
        let mut tx = TxFrame::new();
        tx.set_servo(0x0202, 3, 90);
        let bytes = tx.as_bytes();
        // LEN covers kind + corr + payload + checksum
        assert_eq!(bytes[2] as usize, bytes.len() - 3);
    }

    #[test]
    fn test_telemetry_frame_size() {
        let mut tx = TxFrame::new();
        tx.set_telemetry(9, &TelemetryFrame::default());
        assert_eq!(tx.as_bytes().len(), 3 + 1 + 2 + TELEMETRY_PAYLOAD_LEN + 2);
        assert!(tx.as_bytes().len() <= MAX_FRAME_SIZE);
    }

    #[test]
    fn test_buffer_reuse() {
        let mut tx = TxFrame::new();
        tx.set_velocity(1, 1000, 1000);
        let long = tx.as_bytes().len();
        tx.set_halt(2);
        assert_eq!(tx.as_bytes().len(), MIN_FRAME_SIZE);
        assert!(long > MIN_FRAME_SIZE);
        // checksum still verifies after reuse
        let b = tx.as_bytes();
        let ck = u16::from_be_bytes([b[b.len() - 2], b[b.len() - 1]]);
        assert_eq!(checksum(&b[3..b.len() - 2]), ck);
    }
}
