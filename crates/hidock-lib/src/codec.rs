//! Jensen frame encoding and decoding.
//!
//! Decoding is incremental: callers append USB reads to a buffer and call
//! [`decode`] until it yields a frame. Short or malformed input never panics,
//! it only reports "not yet".

use crate::protocol::{HEADER_SIZE, SYNC};

/// One complete protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command_id: u16,
    pub sequence_id: u32,
    pub body: Vec<u8>,
}

impl Frame {
    /// Total encoded length (header + body).
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }
}

/// Encode a frame: sync marker, then command, sequence and body length (all
/// big-endian), then the body.
pub fn encode(command_id: u16, sequence_id: u32, body: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(HEADER_SIZE + body.len());
    pkt.extend_from_slice(&SYNC);
    pkt.extend_from_slice(&command_id.to_be_bytes());
    pkt.extend_from_slice(&sequence_id.to_be_bytes());
    pkt.extend_from_slice(&(body.len() as u32).to_be_bytes());
    pkt.extend_from_slice(body);
    pkt
}

/// Try to decode one frame from the start of `buf`.
///
/// Returns the frame and the number of bytes it occupied, or `None` when the
/// buffer holds fewer than [`HEADER_SIZE`] bytes, the body is still
/// incomplete, or `buf` does not start with the sync marker (see [`resync`]).
pub fn decode(buf: &[u8]) -> Option<(Frame, usize)> {
    if buf.len() < HEADER_SIZE || buf[..2] != SYNC {
        return None;
    }
    let command_id = u16::from_be_bytes([buf[2], buf[3]]);
    let sequence_id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let body_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    let total = HEADER_SIZE.checked_add(body_len)?;
    if buf.len() < total {
        return None;
    }
    let frame = Frame {
        command_id,
        sequence_id,
        body: buf[HEADER_SIZE..total].to_vec(),
    };
    Some((frame, total))
}

/// Drop leading bytes that cannot start a frame.
///
/// Keeps everything from the first sync marker onward. A trailing lone
/// `0x12` is kept since it may be the first half of a marker split across
/// reads. Returns the number of bytes discarded.
pub fn resync(buf: &mut Vec<u8>) -> usize {
    if buf.len() < 2 {
        if buf.first().is_some_and(|&b| b != SYNC[0]) {
            buf.clear();
            return 1;
        }
        return 0;
    }
    let start = buf
        .windows(2)
        .position(|w| w == SYNC)
        .unwrap_or_else(|| {
            if buf.last() == Some(&SYNC[0]) {
                buf.len() - 1
            } else {
                buf.len()
            }
        });
    buf.drain(..start);
    start
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let pkt = encode(0x0010, 0x0102_0304, &[0xAA, 0xBB]);
        assert_eq!(
            pkt,
            vec![
                0x12, 0x34, // sync
                0x00, 0x10, // command
                0x01, 0x02, 0x03, 0x04, // sequence
                0x00, 0x00, 0x00, 0x02, // body length
                0xAA, 0xBB,
            ]
        );
    }

    #[test]
    fn encode_empty_body_is_header_only() {
        let pkt = encode(1, 0, &[]);
        assert_eq!(pkt.len(), HEADER_SIZE);
        assert_eq!(&pkt[8..12], &[0, 0, 0, 0]);
    }

    #[test]
    fn decode_short_header_is_incomplete() {
        let pkt = encode(1, 7, &[]);
        for n in 0..HEADER_SIZE {
            assert!(decode(&pkt[..n]).is_none(), "{n} bytes decoded");
        }
    }

    #[test]
    fn decode_partial_body_is_incomplete() {
        let pkt = encode(4, 9, &[1, 2, 3, 4, 5]);
        assert!(decode(&pkt[..pkt.len() - 1]).is_none());
        let (frame, used) = decode(&pkt).unwrap();
        assert_eq!(used, pkt.len());
        assert_eq!(frame.body, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn decode_leaves_trailing_bytes() {
        let mut buf = encode(11, 1, &[1, 0, 1, 0]);
        let second = encode(16, 2, &[9; 12]);
        buf.extend_from_slice(&second);
        let (first, used) = decode(&buf).unwrap();
        assert_eq!(first.command_id, 11);
        let (next, _) = decode(&buf[used..]).unwrap();
        assert_eq!(next.command_id, 16);
        assert_eq!(next.sequence_id, 2);
    }

    #[test]
    fn decode_rejects_missing_sync() {
        let mut pkt = encode(1, 1, &[]);
        pkt[0] = 0x00;
        assert!(decode(&pkt).is_none());
    }

    #[test]
    fn decode_huge_length_does_not_panic() {
        let mut pkt = encode(1, 1, &[]);
        pkt[8..12].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(decode(&pkt).is_none());
    }

    #[test]
    fn round_trip_all_body_lengths() {
        for len in 0..=4096usize {
            let body: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let seq = len as u32 * 7919;
            let pkt = encode(0x1234, seq, &body);
            let (frame, used) = decode(&pkt).unwrap();
            assert_eq!(used, pkt.len());
            assert_eq!(frame.command_id, 0x1234);
            assert_eq!(frame.sequence_id, seq);
            assert_eq!(frame.body, body);
            assert_eq!(frame.wire_len(), pkt.len());
        }
    }

    #[test]
    fn resync_skips_garbage_before_marker() {
        let mut buf = vec![0x00, 0xFF, 0x34];
        buf.extend_from_slice(&encode(2, 3, &[7]));
        assert_eq!(resync(&mut buf), 3);
        assert_eq!(decode(&buf).unwrap().0.body, vec![7]);
    }

    #[test]
    fn resync_keeps_split_marker() {
        let mut buf = vec![0x01, 0x02, 0x12];
        assert_eq!(resync(&mut buf), 2);
        assert_eq!(buf, vec![0x12]);
    }

    #[test]
    fn resync_noop_on_aligned_buffer() {
        let mut buf = encode(2, 3, &[]);
        assert_eq!(resync(&mut buf), 0);
        let mut empty = Vec::new();
        assert_eq!(resync(&mut empty), 0);
    }

    #[test]
    fn resync_single_garbage_byte() {
        let mut buf = vec![0x55];
        assert_eq!(resync(&mut buf), 1);
        assert!(buf.is_empty());
        let mut half = vec![0x12];
        assert_eq!(resync(&mut half), 0);
    }
}
