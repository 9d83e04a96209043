//! Frame reassembly for the inbound byte stream.
//!
//! Deliveries carry no alignment to frame boundaries. Bytes are buffered
//! until a complete span from a start marker to an end marker is present.
//! The 16-bit length after the status byte is only trusted when the byte it
//! points at is an end marker; otherwise the span closes at the first end
//! marker. The buffer is bounded and bytes before a start marker are dropped.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use crate::protocol::AckError;
use crate::protocol::constants::{
    DEFAULT_MAX_BUFFER_SIZE, FRAME_HEADER_SIZE, MIN_ACK_SPAN, MIN_FRAME_SIZE, PACKET_END,
    PACKET_START,
};

#[derive(Debug, Clone)]
pub struct FrameAccumulator {
    buf: Vec<u8>,
    max_size: usize,
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_SIZE)
    }
}

impl FrameAccumulator {
    pub fn new(max_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_size: max_size.max(MIN_FRAME_SIZE),
        }
    }

    /// Buffered byte count.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append a delivery. Exceeding the bound discards everything buffered.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), AckError> {
        if self.buf.len() + bytes.len() > self.max_size {
            let dropped = self.buf.len() + bytes.len();
            self.buf.clear();
            warn!(dropped, max = self.max_size, "Receive buffer overflow");
            return Err(AckError::MalformedFrame(format!(
                "receive buffer overflow: {} bytes exceeds {}",
                dropped, self.max_size
            )));
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Pop the next complete `start..=end` span, or `None` if more bytes
    /// are needed.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        match self.buf.iter().position(|&b| b == PACKET_START) {
            Some(0) => {}
            Some(start) => {
                debug!(discarded = start, "Skipping bytes before start marker");
                self.buf.drain(..start);
            }
            None => {
                if !self.buf.is_empty() {
                    debug!(discarded = self.buf.len(), "No start marker, dropping bytes");
                    self.buf.clear();
                }
                return None;
            }
        }

        let total = self.length_hint().or_else(|| {
            self.buf
                .iter()
                .skip(MIN_ACK_SPAN - 1)
                .position(|&b| b == PACKET_END)
                .map(|i| i + MIN_ACK_SPAN)
        })?;
        Some(self.buf.drain(..total).collect())
    }

    /// Frame size given by the length field, if that frame is buffered and
    /// closes with an end marker.
    fn length_hint(&self) -> Option<usize> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let total = LittleEndian::read_u16(&self.buf[2..4]) as usize + MIN_FRAME_SIZE;
        (self.buf.get(total - 1) == Some(&PACKET_END)).then_some(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACK: [u8; 8] = [0x01, 0x00, 0x01, 0x00, 0xDE, 0x20, 0xFF, 0x17];

    fn bytes(text: &str) -> Vec<u8> {
        hex::decode(text).unwrap()
    }

    #[test]
    fn test_whole_frame() {
        let mut acc = FrameAccumulator::new(64);
        acc.extend(&ACK).unwrap();
        assert_eq!(acc.next_frame(), Some(ACK.to_vec()));
        assert_eq!(acc.next_frame(), None);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_split_delivery() {
        let mut acc = FrameAccumulator::new(64);
        for byte in &ACK[..7] {
            acc.extend(&[*byte]).unwrap();
            assert_eq!(acc.next_frame(), None);
        }
        acc.extend(&ACK[7..]).unwrap();
        assert_eq!(acc.next_frame(), Some(ACK.to_vec()));
    }

    #[test]
    fn test_spans_without_length_field() {
        let frames = [
            "01000800009E11500E003C0101ACFE17",
            "010000AAFE17",
            "01000088FE17",
            "01000001FE17",
            "010004000000D500FF0126FE17",
        ];
        let mut acc = FrameAccumulator::new(1024);
        for frame in frames {
            acc.extend(&bytes(frame)).unwrap();
        }
        for frame in frames {
            assert_eq!(acc.next_frame(), Some(bytes(frame)));
        }
        assert!(acc.is_empty());
    }

    #[test]
    fn test_length_field_keeps_end_byte_in_data() {
        // Row checksum 0x17 sits where a span would otherwise close.
        let frame = [0x01, 0x00, 0x01, 0x00, 0x17, 0xE8, 0xFF, 0x17];
        let mut acc = FrameAccumulator::new(64);
        acc.extend(&frame).unwrap();
        assert_eq!(acc.next_frame(), Some(frame.to_vec()));
    }

    #[test]
    fn test_trailing_bytes_are_kept() {
        let mut acc = FrameAccumulator::new(64);
        let mut stream = ACK.to_vec();
        stream.extend_from_slice(&ACK[..3]);
        acc.extend(&stream).unwrap();
        assert_eq!(acc.next_frame(), Some(ACK.to_vec()));
        assert_eq!(acc.next_frame(), None);
        assert_eq!(acc.len(), 3);
    }

    #[test]
    fn test_leading_garbage_is_skipped() {
        let mut acc = FrameAccumulator::new(64);
        acc.extend(&[0xAA, 0x55, 0x17]).unwrap();
        acc.extend(&ACK).unwrap();
        assert_eq!(acc.next_frame(), Some(ACK.to_vec()));
    }

    #[test]
    fn test_bytes_without_start_are_dropped() {
        let mut acc = FrameAccumulator::new(64);
        acc.extend(&[0xAA, 0x17, 0x55]).unwrap();
        assert_eq!(acc.next_frame(), None);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_unterminated_span_waits() {
        let mut acc = FrameAccumulator::new(64);
        acc.extend(&[0x01, 0x00, 0xFF, 0x00, 0x12]).unwrap();
        assert_eq!(acc.next_frame(), None);
        assert_eq!(acc.len(), 5);
    }

    #[test]
    fn test_overflow() {
        let mut acc = FrameAccumulator::new(16);
        acc.extend(&[0x01; 10]).unwrap();
        assert!(matches!(
            acc.extend(&[0x01; 10]),
            Err(AckError::MalformedFrame(_))
        ));
        assert!(acc.is_empty());
    }
}
