//! Typed responses, decoded once at the transport boundary.

use std::fmt;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::codec::Frame;
use crate::protocol::*;

// ── Settings ──

/// The four behaviour flags, in wire order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorSettings {
    pub auto_record: bool,
    pub auto_play: bool,
    pub bluetooth_tone: bool,
    pub notification_sound: bool,
}

impl BehaviorSettings {
    /// Non-zero byte = enabled. `None` if fewer than four bytes.
    pub fn from_bytes(body: &[u8]) -> Option<Self> {
        let b = body.get(..SETTINGS_LEN)?;
        Some(Self {
            auto_record: b[0] != 0,
            auto_play: b[1] != 0,
            bluetooth_tone: b[2] != 0,
            notification_sound: b[3] != 0,
        })
    }

    pub fn to_bytes(&self) -> [u8; SETTINGS_LEN] {
        [
            self.auto_record as u8,
            self.auto_play as u8,
            self.bluetooth_tone as u8,
            self.notification_sound as u8,
        ]
    }

    /// Overlay the fields present in `update`.
    pub fn merged(mut self, update: &SettingsUpdate) -> Self {
        if let Some(v) = update.auto_record {
            self.auto_record = v;
        }
        if let Some(v) = update.auto_play {
            self.auto_play = v;
        }
        if let Some(v) = update.bluetooth_tone {
            self.bluetooth_tone = v;
        }
        if let Some(v) = update.notification_sound {
            self.notification_sound = v;
        }
        self
    }
}

/// A partial settings change. `None` fields keep the device's current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsUpdate {
    pub auto_record: Option<bool>,
    pub auto_play: Option<bool>,
    pub bluetooth_tone: Option<bool>,
    pub notification_sound: Option<bool>,
}

impl SettingsUpdate {
    /// Build from key/value pairs. Keys may be camelCase or snake_case;
    /// unknown keys are ignored.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, bool)>) -> Self {
        let mut update = Self::default();
        for (key, value) in pairs {
            match key {
                "autoRecord" | "auto_record" => update.auto_record = Some(value),
                "autoPlay" | "auto_play" => update.auto_play = Some(value),
                "bluetoothTone" | "bluetooth_tone" => update.bluetooth_tone = Some(value),
                "notificationSound" | "notification_sound" => {
                    update.notification_sound = Some(value)
                }
                other => log::debug!("ignoring unknown setting key {other:?}"),
            }
        }
        update
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ── Storage ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CardInfo {
    pub used: u32,
    pub capacity: u32,
    pub status_raw: u32,
}

impl CardInfo {
    pub fn from_bytes(body: &[u8]) -> Option<Self> {
        let b = body.get(..CARD_INFO_LEN)?;
        let word = |i: usize| u32::from_be_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        Some(Self {
            used: word(0),
            capacity: word(4),
            status_raw: word(8),
        })
    }

    pub fn free(&self) -> u32 {
        self.capacity.saturating_sub(self.used)
    }
}

// ── Device info ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub version_code: u32,
    /// Dotted form of the low three version bytes, e.g. `6.2.5`.
    pub version: String,
    pub serial: String,
}

impl DeviceInfo {
    pub fn from_bytes(body: &[u8]) -> Option<Self> {
        let v = body.get(..4)?;
        let version_code = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
        let version = format!("{}.{}.{}", v[1], v[2], v[3]);
        let end = body.len().min(4 + SERIAL_LEN);
        let serial = body[4..end]
            .iter()
            .take_while(|&&b| b != 0)
            .filter(|b| b.is_ascii_graphic())
            .map(|&b| b as char)
            .collect();
        Some(Self {
            version_code,
            version,
            serial,
        })
    }
}

// ── Device time (BCD) ──

/// Decode seven BCD bytes `YYYYMMDDHHMMSS`. All zero means the clock is unset.
pub fn parse_device_time(body: &[u8]) -> Result<Option<NaiveDateTime>, String> {
    let b = body
        .get(..DEVICE_TIME_LEN)
        .ok_or_else(|| format!("device time: expected {DEVICE_TIME_LEN} bytes, got {}", body.len()))?;
    if b.iter().all(|&x| x == 0) {
        return Ok(None);
    }
    let mut digits = String::with_capacity(DEVICE_TIME_LEN * 2);
    for &byte in b {
        let (hi, lo) = (byte >> 4, byte & 0x0F);
        if hi > 9 || lo > 9 {
            return Err(format!("device time: invalid BCD byte 0x{byte:02X}"));
        }
        digits.push(char::from(b'0' + hi));
        digits.push(char::from(b'0' + lo));
    }
    NaiveDateTime::parse_from_str(&digits, "%Y%m%d%H%M%S")
        .map(Some)
        .map_err(|e| format!("device time: {digits}: {e}"))
}

pub fn encode_device_time(time: &NaiveDateTime) -> [u8; DEVICE_TIME_LEN] {
    let digits = time.format("%Y%m%d%H%M%S").to_string();
    let mut out = [0u8; DEVICE_TIME_LEN];
    for (slot, pair) in out.iter_mut().zip(digits.as_bytes().chunks(2)) {
        let hi = pair[0].wrapping_sub(b'0');
        let lo = pair.get(1).map_or(0, |d| d.wrapping_sub(b'0'));
        *slot = (hi << 4) | lo;
    }
    out
}

// ── Recording file name ──

/// Clean a padded file name: cut at the first NUL and drop ASCII control
/// bytes. Non-ASCII names fall back to `rec_<hex>`. `None` if nothing is left.
pub fn parse_recording_name(body: &[u8]) -> Option<String> {
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    let kept: Vec<u8> = body[..end]
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_control())
        .collect();
    if kept.is_empty() {
        return None;
    }
    if kept.is_ascii() {
        return Some(kept.into_iter().map(char::from).collect());
    }
    let hex: String = kept.iter().map(|b| format!("{b:02x}")).collect();
    log::debug!("recording name is not ASCII, using hex fallback");
    Some(format!("rec_{hex}"))
}

// ── Tagged union ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    DeviceInfo(DeviceInfo),
    DeviceTime(Option<NaiveDateTime>),
    Settings(BehaviorSettings),
    CardInfo(CardInfo),
    /// `None` = no active or last recording.
    RecordingFile(Option<String>),
    FileCount(u32),
    /// Result code of a write-style command; `None` if the body was empty.
    Ack(Option<u8>),
    /// Raw payload of streamed or unknown commands.
    Data(Vec<u8>),
}

/// A frame whose body does not fit the shape its command id promises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub command_id: u16,
    pub reason: String,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "malformed {} response: {}",
            command_name(self.command_id),
            self.reason
        )
    }
}

impl std::error::Error for DecodeError {}

impl Response {
    /// Decode `frame`, received as the answer to `request_id`.
    pub fn decode(request_id: u16, frame: &Frame) -> Result<Response, DecodeError> {
        let body = frame.body.as_slice();
        let short = |need: usize| DecodeError {
            command_id: frame.command_id,
            reason: format!("expected at least {need} bytes, got {}", body.len()),
        };

        if request_id == CMD_GET_RECORDING_FILE && frame.command_id == CMD_GET_CARD_INFO {
            log::debug!(
                "device answered recording-file query with card info (seq {}); treating as no recording",
                frame.sequence_id
            );
            return Ok(Response::RecordingFile(None));
        }

        let response = match frame.command_id {
            CMD_GET_DEVICE_INFO => {
                Response::DeviceInfo(DeviceInfo::from_bytes(body).ok_or_else(|| short(4))?)
            }
            CMD_GET_DEVICE_TIME => {
                Response::DeviceTime(parse_device_time(body).map_err(|reason| DecodeError {
                    command_id: frame.command_id,
                    reason,
                })?)
            }
            CMD_GET_SETTINGS => Response::Settings(
                BehaviorSettings::from_bytes(body).ok_or_else(|| short(SETTINGS_LEN))?,
            ),
            CMD_GET_CARD_INFO => {
                Response::CardInfo(CardInfo::from_bytes(body).ok_or_else(|| short(CARD_INFO_LEN))?)
            }
            CMD_GET_RECORDING_FILE => Response::RecordingFile(parse_recording_name(body)),
            CMD_GET_FILE_COUNT => match body {
                [] => Response::FileCount(0),
                [a, b, c, d, ..] => Response::FileCount(u32::from_be_bytes([*a, *b, *c, *d])),
                _ => return Err(short(4)),
            },
            CMD_SET_DEVICE_TIME
            | CMD_DELETE_FILE
            | CMD_SET_SETTINGS
            | CMD_FORMAT_CARD
            | CMD_RESTORE_FACTORY_SETTINGS => Response::Ack(body.first().copied()),
            _ => Response::Data(body.to_vec()),
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn frame(command_id: u16, body: &[u8]) -> Frame {
        Frame {
            command_id,
            sequence_id: 1,
            body: body.to_vec(),
        }
    }

    #[test]
    fn settings_from_bytes() {
        let s = BehaviorSettings::from_bytes(&[1, 0, 1, 0]).unwrap();
        assert_eq!(
            s,
            BehaviorSettings {
                auto_record: true,
                auto_play: false,
                bluetooth_tone: true,
                notification_sound: false,
            }
        );
        assert!(BehaviorSettings::from_bytes(&[1, 0, 1]).is_none());
    }

    #[test]
    fn settings_nonzero_is_true() {
        let s = BehaviorSettings::from_bytes(&[0xFF, 2, 0, 7, 9]).unwrap();
        assert_eq!(s.to_bytes(), [1, 1, 0, 1]);
    }

    #[test]
    fn settings_serialize_camel_case() {
        let json = serde_json::to_value(BehaviorSettings::default()).unwrap();
        assert_eq!(json["autoRecord"], false);
        assert_eq!(json["notificationSound"], false);
    }

    #[test]
    fn update_from_pairs_ignores_unknown() {
        let u = SettingsUpdate::from_pairs([("autoRecord", true), ("volume", true), ("auto_play", false)]);
        assert_eq!(u.auto_record, Some(true));
        assert_eq!(u.auto_play, Some(false));
        assert_eq!(u.bluetooth_tone, None);
        assert!(SettingsUpdate::from_pairs([("bogus", true)]).is_empty());
    }

    #[test]
    fn merge_overlays_only_supplied() {
        let base = BehaviorSettings {
            auto_play: true,
            ..Default::default()
        };
        let merged = base.merged(&SettingsUpdate {
            auto_record: Some(true),
            ..Default::default()
        });
        assert_eq!(merged.to_bytes(), [1, 1, 0, 0]);
    }

    #[test]
    fn card_info_twelve_bytes() {
        let mut body = Vec::new();
        for v in [100u32, 1000, 0] {
            body.extend_from_slice(&v.to_be_bytes());
        }
        let info = CardInfo::from_bytes(&body).unwrap();
        assert_eq!(
            info,
            CardInfo {
                used: 100,
                capacity: 1000,
                status_raw: 0
            }
        );
        assert_eq!(info.free(), 900);
        assert!(CardInfo::from_bytes(&body[..11]).is_none());
    }

    #[test]
    fn device_info_version_and_serial() {
        let mut body = vec![0x00, 0x06, 0x02, 0x05];
        body.extend_from_slice(b"HD1E123456789\0\0\0");
        let info = DeviceInfo::from_bytes(&body).unwrap();
        assert_eq!(info.version_code, 0x0006_0205);
        assert_eq!(info.version, "6.2.5");
        assert_eq!(info.serial, "HD1E123456789");
    }

    #[test]
    fn device_info_without_serial() {
        let info = DeviceInfo::from_bytes(&[0, 1, 2, 3]).unwrap();
        assert_eq!(info.serial, "");
        assert!(DeviceInfo::from_bytes(&[0, 1]).is_none());
    }

    #[test]
    fn device_time_bcd() {
        let t = parse_device_time(&[0x20, 0x25, 0x05, 0x12, 0x11, 0x41, 0x41])
            .unwrap()
            .unwrap();
        let expected = NaiveDate::from_ymd_opt(2025, 5, 12)
            .unwrap()
            .and_hms_opt(11, 41, 41)
            .unwrap();
        assert_eq!(t, expected);
        assert_eq!(encode_device_time(&expected), [0x20, 0x25, 0x05, 0x12, 0x11, 0x41, 0x41]);
    }

    #[test]
    fn device_time_unset_and_invalid() {
        assert_eq!(parse_device_time(&[0; 7]).unwrap(), None);
        assert!(parse_device_time(&[0x20, 0x25, 0x1A, 0, 0, 0, 0]).is_err());
        assert!(parse_device_time(&[0x20, 0x25]).is_err());
        // Month 13 is valid BCD but not a date.
        assert!(parse_device_time(&[0x20, 0x25, 0x13, 0x01, 0, 0, 0]).is_err());
    }

    #[test]
    fn recording_name_cut_at_nul() {
        assert_eq!(
            parse_recording_name(b"test.wav\x00extra").as_deref(),
            Some("test.wav")
        );
    }

    #[test]
    fn recording_name_only_control_is_none() {
        assert_eq!(parse_recording_name(b"\x00\x00\x00"), None);
        assert_eq!(parse_recording_name(b"\x01\x02\x1f\x7f"), None);
        assert_eq!(parse_recording_name(b""), None);
    }

    #[test]
    fn recording_name_drops_control_bytes() {
        assert_eq!(
            parse_recording_name(b"\x02REC01\r\n.hda").as_deref(),
            Some("REC01.hda")
        );
    }

    #[test]
    fn recording_name_non_ascii_hex_fallback() {
        assert_eq!(
            parse_recording_name(&[b'a', 0xC3, 0xA9]).as_deref(),
            Some("rec_61c3a9")
        );
    }

    #[test]
    fn decode_card_info_quirk_as_no_recording() {
        let resp = Response::decode(CMD_GET_RECORDING_FILE, &frame(CMD_GET_CARD_INFO, &[0; 12]))
            .unwrap();
        assert_eq!(resp, Response::RecordingFile(None));
    }

    #[test]
    fn decode_short_settings_is_error() {
        let err = Response::decode(CMD_GET_SETTINGS, &frame(CMD_GET_SETTINGS, &[1, 0])).unwrap_err();
        assert_eq!(err.command_id, CMD_GET_SETTINGS);
        assert!(err.to_string().contains("expected at least 4 bytes, got 2"));
    }

    #[test]
    fn decode_ack_codes() {
        assert_eq!(
            Response::decode(CMD_FORMAT_CARD, &frame(CMD_FORMAT_CARD, &[0])).unwrap(),
            Response::Ack(Some(0))
        );
        assert_eq!(
            Response::decode(CMD_FORMAT_CARD, &frame(CMD_FORMAT_CARD, &[])).unwrap(),
            Response::Ack(None)
        );
    }

    #[test]
    fn decode_file_count() {
        assert_eq!(
            Response::decode(CMD_GET_FILE_COUNT, &frame(CMD_GET_FILE_COUNT, &[])).unwrap(),
            Response::FileCount(0)
        );
        assert_eq!(
            Response::decode(CMD_GET_FILE_COUNT, &frame(CMD_GET_FILE_COUNT, &[0, 0, 1, 2])).unwrap(),
            Response::FileCount(258)
        );
        assert!(Response::decode(CMD_GET_FILE_COUNT, &frame(CMD_GET_FILE_COUNT, &[1])).is_err());
    }

    #[test]
    fn decode_stream_payload_is_data() {
        assert_eq!(
            Response::decode(CMD_TRANSFER_FILE, &frame(CMD_TRANSFER_FILE, &[9, 8])).unwrap(),
            Response::Data(vec![9, 8])
        );
    }
}
