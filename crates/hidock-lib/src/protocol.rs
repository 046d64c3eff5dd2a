//! Protocol constants for the HiDock "Jensen" USB bulk protocol.
//!
//! Every message on the wire is a [`Frame`](crate::codec::Frame): a 12-byte
//! big-endian header followed by the body.
//!
//! ```text
//! [0x12 0x34][command:u16][sequence:u32][body_length:u32][body...]
//! ```
//!
//! There is no checksum; integrity relies on the USB bulk transport.

use std::time::Duration;

// ── USB identifiers ──

/// Actions Semiconductor vendor ID used by all HiDock recorders.
pub const HIDOCK_VID: u16 = 0x10D6;

/// HiDock H1 (first firmware line).
pub const PID_H1: u16 = 0xAF0C;
/// HiDock H1E (first firmware line).
pub const PID_H1E: u16 = 0xAF0D;
/// HiDock P1 (first firmware line).
pub const PID_P1: u16 = 0xAF0E;
/// HiDock H1 (second firmware line).
pub const PID_H1_V2: u16 = 0xB00C;
/// HiDock H1E (second firmware line).
pub const PID_H1E_V2: u16 = 0xB00D;
/// HiDock P1 (second firmware line).
pub const PID_P1_V2: u16 = 0xB00E;

/// Product IDs probed by default, in order.
pub const KNOWN_PRODUCT_IDS: &[u16] = &[
    PID_H1E_V2, PID_H1_V2, PID_P1_V2, PID_H1E, PID_H1, PID_P1,
];

/// Interface claimed for the Jensen channel.
pub const JENSEN_INTERFACE: u8 = 0;

/// Bulk OUT endpoint (host → device).
pub const EP_OUT: u8 = 0x01;

/// Bulk IN endpoint (device → host).
pub const EP_IN: u8 = 0x82;

// ── Framing ──

/// Frame sync marker.
pub const SYNC: [u8; 2] = [0x12, 0x34];

/// Header size: sync (2) + command (2) + sequence (4) + body length (4).
pub const HEADER_SIZE: usize = 12;

/// Bytes requested per IN read. A multiple of every bulk max packet size
/// (64 full-speed, 512 high-speed).
pub const RECEIVE_CHUNK_SIZE: usize = 32 * 1024;

// ── Command IDs ──

pub const CMD_GET_DEVICE_INFO: u16 = 1;
pub const CMD_GET_DEVICE_TIME: u16 = 2;
pub const CMD_SET_DEVICE_TIME: u16 = 3;
/// Streams the file list over several frames.
pub const CMD_GET_FILE_LIST: u16 = 4;
/// Streams one file's contents over several frames.
pub const CMD_TRANSFER_FILE: u16 = 5;
pub const CMD_GET_FILE_COUNT: u16 = 6;
pub const CMD_DELETE_FILE: u16 = 7;
pub const CMD_GET_SETTINGS: u16 = 11;
pub const CMD_SET_SETTINGS: u16 = 12;
pub const CMD_GET_CARD_INFO: u16 = 16;
pub const CMD_FORMAT_CARD: u16 = 17;
pub const CMD_GET_RECORDING_FILE: u16 = 18;
pub const CMD_RESTORE_FACTORY_SETTINGS: u16 = 19;

/// Human-readable command name for log lines.
pub fn command_name(command_id: u16) -> &'static str {
    match command_id {
        CMD_GET_DEVICE_INFO => "GET_DEVICE_INFO",
        CMD_GET_DEVICE_TIME => "GET_DEVICE_TIME",
        CMD_SET_DEVICE_TIME => "SET_DEVICE_TIME",
        CMD_GET_FILE_LIST => "GET_FILE_LIST",
        CMD_TRANSFER_FILE => "TRANSFER_FILE",
        CMD_GET_FILE_COUNT => "GET_FILE_COUNT",
        CMD_DELETE_FILE => "DELETE_FILE",
        CMD_GET_SETTINGS => "GET_SETTINGS",
        CMD_SET_SETTINGS => "SET_SETTINGS",
        CMD_GET_CARD_INFO => "GET_CARD_INFO",
        CMD_FORMAT_CARD => "FORMAT_CARD",
        CMD_GET_RECORDING_FILE => "GET_RECORDING_FILE",
        CMD_RESTORE_FACTORY_SETTINGS => "RESTORE_FACTORY_SETTINGS",
        _ => "UNKNOWN",
    }
}

/// Whether a frame with `response_id` completes a request for `request_id`.
///
/// Besides the echoed command id, the device sometimes answers
/// GET_RECORDING_FILE with a card-info frame. That frame is accepted here so
/// the operation layer can report "no recording" instead of timing out.
pub fn accepts_response(request_id: u16, response_id: u16) -> bool {
    response_id == request_id
        || (request_id == CMD_GET_RECORDING_FILE && response_id == CMD_GET_CARD_INFO)
}

// ── Payloads ──

/// Confirmation payload required by destructive commands (format, factory restore).
pub const CONFIRMATION_PAYLOAD: [u8; 4] = [1, 2, 3, 4];

/// Result code reported when an acknowledgement frame carries no body.
pub const NO_RESULT_CODE: u8 = 0xFF;

/// Length of the GET_SETTINGS / SET_SETTINGS payload.
pub const SETTINGS_LEN: usize = 4;

/// Length of the GET_CARD_INFO payload.
pub const CARD_INFO_LEN: usize = 12;

/// Length of the serial number field in the device-info payload.
pub const SERIAL_LEN: usize = 16;

/// Length of the BCD timestamp used by GET/SET_DEVICE_TIME.
pub const DEVICE_TIME_LEN: usize = 7;

// ── File list records ──

/// Header marker announcing the total file count at the start of a list stream.
pub const FILE_LIST_HEADER: [u8; 2] = [0xFF, 0xFF];

/// Metadata bytes skipped after each record's file length.
pub const FILE_RECORD_SKIP_LEN: usize = 6;

/// Per-file signature length.
pub const FILE_SIGNATURE_LEN: usize = 16;

// ── Delete result codes ──

pub const DELETE_OK: u8 = 0;
pub const DELETE_NOT_FOUND: u8 = 1;
pub const DELETE_FAILED: u8 = 2;

// ── Timeouts ──

/// Background health check (device info).
pub const QUICK_TIMEOUT: Duration = Duration::from_secs(2);

/// Default for `DeviceOptions::command_timeout`, used by every ordinary query.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-chunk timeout while streaming file contents.
pub const TRANSFER_CHUNK_TIMEOUT: Duration = Duration::from_secs(10);

/// Delete and factory restore.
pub const SLOW_TIMEOUT: Duration = Duration::from_secs(10);

/// Card format is destructive and slow.
pub const FORMAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-read timeout while draining stale IN data.
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

/// Upper bound on drain reads in one reset.
pub const MAX_DRAIN_READS: usize = 64;

// ── Reliability ──

pub const MAX_RETRY_ATTEMPTS: u32 = 3;
pub const MAX_ERROR_THRESHOLD: u64 = 5;
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
