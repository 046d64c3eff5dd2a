//! Command transport: one in-flight command, sequencing, frame assembly.
//!
//! A [`Session`] owns the connection, the sequence counter and the receive
//! buffer. The device context keeps it behind a single mutex, so holding
//! `&mut Session` is the serialization lock.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::codec::{self, Frame};
use crate::connection::ConnectionManager;
use crate::device::{UsbDevice, UsbError};
use crate::protocol::{RECEIVE_CHUNK_SIZE, accepts_response, command_name};
use crate::reliability::{ErrorCategory, ReliabilityMonitor};
use crate::response::Response;

// ── Sequence counter ──

/// Per-frame sequence id. Wraps from `u32::MAX` to 0.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SequenceCounter(u32);

impl SequenceCounter {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn starting_at(value: u32) -> Self {
        Self(value)
    }

    /// Return the current id and advance.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u32 {
        let id = self.0;
        self.0 = self.0.wrapping_add(1);
        id
    }

    pub fn peek(&self) -> u32 {
        self.0
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

// ── Error type ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    NotConnected,
    /// No matching response before the deadline.
    Timeout { command_id: u16, timeout: Duration },
    /// Host I/O failure other than a timeout.
    Pipe(String),
    /// A response arrived but could not be decoded.
    Protocol(String),
}

impl TransportError {
    /// Counter this failure was recorded under, if any.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            TransportError::NotConnected => None,
            TransportError::Timeout { .. } => Some(ErrorCategory::UsbTimeout),
            TransportError::Pipe(_) => Some(ErrorCategory::UsbPipeError),
            TransportError::Protocol(_) => Some(ErrorCategory::ProtocolError),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NotConnected => write!(f, "Device not connected"),
            TransportError::Timeout {
                command_id,
                timeout,
            } => write!(
                f,
                "Timed out after {} ms waiting for {}",
                timeout.as_millis(),
                command_name(*command_id)
            ),
            TransportError::Pipe(e) => write!(f, "Transfer failed: {e}"),
            TransportError::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

// ── Session ──

pub struct Session<D> {
    conn: ConnectionManager<D>,
    seq: SequenceCounter,
    rx: Vec<u8>,
    monitor: Arc<Mutex<ReliabilityMonitor>>,
}

impl<D: UsbDevice> Session<D> {
    pub fn new(monitor: Arc<Mutex<ReliabilityMonitor>>) -> Self {
        Self {
            conn: ConnectionManager::new(),
            seq: SequenceCounter::new(),
            rx: Vec::with_capacity(RECEIVE_CHUNK_SIZE),
            monitor,
        }
    }

    pub fn connection(&self) -> &ConnectionManager<D> {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionManager<D> {
        &mut self.conn
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Sequence id the next frame will carry.
    pub fn next_sequence_id(&self) -> u32 {
        self.seq.peek()
    }

    #[cfg(test)]
    pub(crate) fn set_sequence(&mut self, seq: SequenceCounter) {
        self.seq = seq;
    }

    fn monitor(&self) -> MutexGuard<'_, ReliabilityMonitor> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail(&self, err: TransportError) -> TransportError {
        if let Some(category) = err.category() {
            self.monitor().increment_error_count(category);
        }
        err
    }

    /// Encode and write one frame. Returns the sequence id used.
    pub fn send(
        &mut self,
        command_id: u16,
        body: &[u8],
        timeout: Duration,
    ) -> Result<u32, TransportError> {
        let Some((_, ep_out)) = self.conn.endpoints() else {
            return Err(TransportError::NotConnected);
        };
        let sequence_id = self.seq.next();
        let packet = codec::encode(command_id, sequence_id, body);
        let written = match self.conn.device_mut() {
            Some(device) => device.write_bulk(ep_out, &packet, timeout),
            None => return Err(TransportError::NotConnected),
        };
        match written {
            Ok(n) if n == packet.len() => {}
            Ok(n) => {
                return Err(self.fail(TransportError::Pipe(format!(
                    "bulk OUT: short write ({n} of {} bytes)",
                    packet.len()
                ))));
            }
            Err(UsbError::Timeout) => {
                return Err(self.fail(TransportError::Timeout {
                    command_id,
                    timeout,
                }));
            }
            Err(e) => return Err(self.fail(TransportError::Pipe(e.to_string()))),
        }
        log::debug!(
            "-> {} seq={sequence_id} body={}",
            command_name(command_id),
            body.len()
        );
        self.monitor().record_sent(packet.len());
        Ok(sequence_id)
    }

    /// Read until a frame accepted for `request_id` is assembled.
    ///
    /// Frames for other commands are logged, counted as protocol errors and
    /// dropped. Bytes following the returned frame stay buffered for the
    /// next call.
    pub fn receive(&mut self, request_id: u16, timeout: Duration) -> Result<Frame, TransportError> {
        let Some((ep_in, _)) = self.conn.endpoints() else {
            return Err(TransportError::NotConnected);
        };
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(frame) = self.take_frame() {
                if accepts_response(request_id, frame.command_id) {
                    log::debug!(
                        "<- {} seq={} body={}",
                        command_name(frame.command_id),
                        frame.sequence_id,
                        frame.body.len()
                    );
                    self.monitor().record_response();
                    return Ok(frame);
                }
                log::warn!(
                    "dropping unexpected {} frame (seq {}) while waiting for {}",
                    command_name(frame.command_id),
                    frame.sequence_id,
                    command_name(request_id)
                );
                self.monitor()
                    .increment_error_count(ErrorCategory::ProtocolError);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.fail(TransportError::Timeout {
                    command_id: request_id,
                    timeout,
                }));
            }
            let read = match self.conn.device_mut() {
                Some(device) => device.read_bulk(ep_in, RECEIVE_CHUNK_SIZE, remaining),
                None => return Err(TransportError::NotConnected),
            };
            match read {
                Ok(data) => {
                    if !data.is_empty() {
                        self.monitor().record_received(data.len());
                        self.rx.extend_from_slice(&data);
                    }
                }
                Err(UsbError::Timeout) => {
                    return Err(self.fail(TransportError::Timeout {
                        command_id: request_id,
                        timeout,
                    }));
                }
                Err(e) => return Err(self.fail(TransportError::Pipe(e.to_string()))),
            }
        }
    }

    fn take_frame(&mut self) -> Option<Frame> {
        let skipped = codec::resync(&mut self.rx);
        if skipped > 0 {
            log::debug!("skipped {skipped} bytes before sync marker");
        }
        let (frame, used) = codec::decode(&self.rx)?;
        self.rx.drain(..used);
        Some(frame)
    }

    /// One command/response exchange.
    pub fn send_and_receive(
        &mut self,
        command_id: u16,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Frame, TransportError> {
        self.send(command_id, body, timeout)?;
        self.receive(command_id, timeout)
    }

    /// Exchange and decode into a typed [`Response`].
    pub fn request(
        &mut self,
        command_id: u16,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        let frame = self.send_and_receive(command_id, body, timeout)?;
        Response::decode(command_id, &frame)
            .map_err(|e| self.fail(TransportError::Protocol(e.to_string())))
    }

    /// Recover without disconnecting: forget buffered bytes and the sequence,
    /// clear endpoint halts and drain the IN endpoint.
    pub fn reset_device_state(&mut self) -> usize {
        self.rx.clear();
        self.seq.reset();
        self.conn.clear_and_drain()
    }

    pub fn disconnect(&mut self) {
        self.conn.disconnect();
        self.rx.clear();
        self.seq.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockDevice;
    use crate::protocol::*;

    fn session() -> (Session<MockDevice>, MockDevice) {
        let dev = MockDevice::new();
        let probe = dev.clone();
        let mut s = Session::new(Arc::new(Mutex::new(ReliabilityMonitor::default())));
        s.connection_mut().establish(dev, JENSEN_INTERFACE).unwrap();
        (s, probe)
    }

    fn count(s: &Session<MockDevice>, c: ErrorCategory) -> u64 {
        s.monitor().error_count(c)
    }

    #[test]
    fn sequence_starts_at_zero_and_increments() {
        let mut seq = SequenceCounter::new();
        assert_eq!(seq.next(), 0);
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.peek(), 2);
    }

    #[test]
    fn sequence_wraps_without_gap() {
        let mut seq = SequenceCounter::starting_at(u32::MAX - 2);
        let ids: Vec<u32> = (0..5).map(|_| seq.next()).collect();
        assert_eq!(ids, vec![u32::MAX - 2, u32::MAX - 1, u32::MAX, 0, 1]);
    }

    #[test]
    fn send_and_receive_advances_sequence() {
        let (mut s, dev) = session();
        dev.queue_reply(CMD_GET_SETTINGS, vec![1, 0, 1, 0]);
        dev.queue_reply(CMD_GET_CARD_INFO, vec![0; 12]);
        let a = s.send_and_receive(CMD_GET_SETTINGS, &[], QUICK_TIMEOUT).unwrap();
        let b = s.send_and_receive(CMD_GET_CARD_INFO, &[], QUICK_TIMEOUT).unwrap();
        assert_eq!(a.sequence_id, 0);
        assert_eq!(b.sequence_id, 1);
        let seqs: Vec<u32> = dev.written().iter().map(|f| f.sequence_id).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn sequence_wraps_on_the_wire() {
        let (mut s, dev) = session();
        s.set_sequence(SequenceCounter::starting_at(u32::MAX));
        for _ in 0..2 {
            dev.queue_reply(CMD_GET_SETTINGS, vec![0; 4]);
            s.send_and_receive(CMD_GET_SETTINGS, &[], QUICK_TIMEOUT).unwrap();
        }
        let seqs: Vec<u32> = dev.written().iter().map(|f| f.sequence_id).collect();
        assert_eq!(seqs, vec![u32::MAX, 0]);
    }

    #[test]
    fn reassembles_across_partial_reads() {
        let (mut s, dev) = session();
        dev.state().read_chunk = Some(3);
        dev.queue_reply(CMD_GET_CARD_INFO, vec![7; 12]);
        let frame = s.send_and_receive(CMD_GET_CARD_INFO, &[], QUICK_TIMEOUT).unwrap();
        assert_eq!(frame.body, vec![7; 12]);
        assert!(dev.state().read_calls >= 8);
    }

    #[test]
    fn drops_mismatched_frame_and_counts_protocol_error() {
        let (mut s, dev) = session();
        dev.queue_replies(
            CMD_GET_SETTINGS,
            vec![
                crate::device::mock::Reply {
                    command_id: CMD_GET_FILE_COUNT,
                    body: vec![0, 0, 0, 1],
                },
                crate::device::mock::Reply {
                    command_id: CMD_GET_SETTINGS,
                    body: vec![1, 1, 1, 1],
                },
            ],
        );
        let frame = s.send_and_receive(CMD_GET_SETTINGS, &[], QUICK_TIMEOUT).unwrap();
        assert_eq!(frame.command_id, CMD_GET_SETTINGS);
        assert_eq!(count(&s, ErrorCategory::ProtocolError), 1);
    }

    #[test]
    fn skips_garbage_before_sync() {
        let (mut s, dev) = session();
        dev.push_read(Ok(vec![0xDE, 0xAD]));
        dev.queue_reply(CMD_GET_SETTINGS, vec![0; 4]);
        assert!(s.send_and_receive(CMD_GET_SETTINGS, &[], QUICK_TIMEOUT).is_ok());
    }

    #[test]
    fn timeout_is_counted_and_keeps_connection() {
        let (mut s, _dev) = session();
        let err = s.send_and_receive(CMD_GET_SETTINGS, &[], QUICK_TIMEOUT).unwrap_err();
        assert_eq!(
            err,
            TransportError::Timeout {
                command_id: CMD_GET_SETTINGS,
                timeout: QUICK_TIMEOUT
            }
        );
        assert_eq!(count(&s, ErrorCategory::UsbTimeout), 1);
        assert!(s.is_connected());
    }

    #[test]
    fn read_failure_is_pipe_error() {
        let (mut s, dev) = session();
        dev.push_read(Err(UsbError::Pipe("bulk IN: endpoint stalled".into())));
        let err = s.send_and_receive(CMD_GET_SETTINGS, &[], QUICK_TIMEOUT).unwrap_err();
        assert!(matches!(err, TransportError::Pipe(_)));
        assert_eq!(count(&s, ErrorCategory::UsbPipeError), 1);
    }

    #[test]
    fn write_failure_is_pipe_error() {
        let (mut s, dev) = session();
        dev.state().fail_write = Some(UsbError::NoDevice);
        let err = s.send(CMD_GET_SETTINGS, &[], QUICK_TIMEOUT).unwrap_err();
        assert!(matches!(err, TransportError::Pipe(_)));
        assert_eq!(count(&s, ErrorCategory::UsbPipeError), 1);
    }

    #[test]
    fn not_connected_touches_nothing() {
        let mut s: Session<MockDevice> =
            Session::new(Arc::new(Mutex::new(ReliabilityMonitor::default())));
        assert_eq!(
            s.send_and_receive(CMD_GET_SETTINGS, &[], QUICK_TIMEOUT),
            Err(TransportError::NotConnected)
        );
        assert_eq!(s.next_sequence_id(), 0);
    }

    #[test]
    fn request_decode_failure_counts_protocol_error() {
        let (mut s, dev) = session();
        dev.queue_reply(CMD_GET_CARD_INFO, vec![0; 11]);
        let err = s.request(CMD_GET_CARD_INFO, &[], QUICK_TIMEOUT).unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
        assert_eq!(count(&s, ErrorCategory::ProtocolError), 1);
    }

    #[test]
    fn stats_track_traffic() {
        let (mut s, dev) = session();
        dev.queue_reply(CMD_GET_SETTINGS, vec![0; 4]);
        s.send_and_receive(CMD_GET_SETTINGS, &[], QUICK_TIMEOUT).unwrap();
        let stats = s.monitor().stats().clone();
        assert_eq!(stats.commands_sent, 1);
        assert_eq!(stats.responses_received, 1);
        assert_eq!(stats.bytes_sent, HEADER_SIZE as u64);
        assert_eq!(stats.bytes_received, HEADER_SIZE as u64 + 4);
    }

    #[test]
    fn reset_device_state_clears_buffer_and_sequence() {
        let (mut s, dev) = session();
        dev.queue_stream(CMD_GET_SETTINGS, vec![vec![0; 4], vec![1; 4]]);
        s.send_and_receive(CMD_GET_SETTINGS, &[], QUICK_TIMEOUT).unwrap();
        dev.push_read(Ok(vec![0x55; 8]));
        let drained = s.reset_device_state();
        assert_eq!(drained, 8);
        assert_eq!(s.next_sequence_id(), 0);
        // The buffered second frame is gone.
        let err = s.receive(CMD_GET_SETTINGS, QUICK_TIMEOUT).unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
        assert_eq!(dev.state().clear_halt_calls, vec![EP_IN, EP_OUT]);
    }

    #[test]
    fn disconnect_resets_session() {
        let (mut s, dev) = session();
        dev.queue_reply(CMD_GET_SETTINGS, vec![0; 4]);
        s.send_and_receive(CMD_GET_SETTINGS, &[], QUICK_TIMEOUT).unwrap();
        s.disconnect();
        s.disconnect();
        assert!(!s.is_connected());
        assert_eq!(s.next_sequence_id(), 0);
        assert_eq!(dev.state().close_calls, 1);
    }

    #[test]
    fn error_display() {
        let e = TransportError::Timeout {
            command_id: CMD_FORMAT_CARD,
            timeout: FORMAT_TIMEOUT,
        };
        assert_eq!(e.to_string(), "Timed out after 60000 ms waiting for FORMAT_CARD");
    }
}
