//! Device operations: the caller-owned context for one HiDock.
//!
//! [`JensenDevice`] owns the transport session behind a single mutex, the
//! shared reliability monitor, the operation mode and the settings cache.
//! Lock order is mode → session → monitor. The mode mutex is held while an
//! idle caller waits for the session, so a streaming operation can never
//! start between an idle check and the transport call that followed it. It
//! is never held across I/O, and the cache mutex only for a field update.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::connection::{self, ConnectionError, ConnectionState};
use crate::device::UsbHost;
use crate::filelist::{FileEntry, FileListParser};
use crate::protocol::*;
use crate::reliability::{
    ConnectionStats, ErrorCategory, HealthCheckStart, ReliabilityMonitor, RetryPolicy,
};
use crate::response::{
    BehaviorSettings, CardInfo, DeviceInfo, Response, SettingsUpdate, encode_device_time,
};
use crate::transport::{Session, TransportError};

// ── Operation mode ──

/// What the device is doing. Anything other than `Idle` refuses new
/// operations with [`OperationError::Busy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    #[default]
    Idle,
    Enumerating,
    Transferring,
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationMode::Idle => write!(f, "idle"),
            OperationMode::Enumerating => write!(f, "listing files"),
            OperationMode::Transferring => write!(f, "transferring a file"),
        }
    }
}

// ── Error type ──

#[derive(Debug)]
pub enum OperationError {
    /// Another streaming operation is running; nothing was sent.
    Busy(OperationMode),
    NotConnected,
    Transport(TransportError),
    /// The device answered with nothing usable.
    Unavailable(String),
    /// The device returned a non-zero result code.
    Rejected { command_id: u16, code: u8 },
    /// The caller stopped a transfer.
    Cancelled,
    /// Writing downloaded data failed.
    Io(std::io::Error),
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationError::Busy(mode) => write!(f, "Device busy ({mode})"),
            OperationError::NotConnected => write!(f, "Device not connected"),
            OperationError::Transport(e) => write!(f, "{e}"),
            OperationError::Unavailable(e) => write!(f, "Not available: {e}"),
            OperationError::Rejected { command_id, code } => {
                write!(f, "{} failed with code {code}", command_name(*command_id))?;
                match (*command_id, *code) {
                    (CMD_DELETE_FILE, DELETE_NOT_FOUND) => write!(f, " (file not found)"),
                    (_, NO_RESULT_CODE) => write!(f, " (no result)"),
                    _ => Ok(()),
                }
            }
            OperationError::Cancelled => write!(f, "Cancelled"),
            OperationError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for OperationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OperationError::Transport(e) => Some(e),
            OperationError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for OperationError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotConnected => OperationError::NotConnected,
            // Already counted as a protocol error by the transport.
            TransportError::Protocol(msg) => OperationError::Unavailable(msg),
            other => OperationError::Transport(other),
        }
    }
}

fn unexpected(command_id: u16, response: &Response) -> OperationError {
    OperationError::Unavailable(format!(
        "unexpected response to {}: {response:?}",
        command_name(command_id)
    ))
}

fn check_ack(command_id: u16, response: Response) -> Result<(), OperationError> {
    match response {
        Response::Ack(Some(0)) => Ok(()),
        Response::Ack(code) => Err(OperationError::Rejected {
            command_id,
            code: code.unwrap_or(NO_RESULT_CODE),
        }),
        other => Err(unexpected(command_id, &other)),
    }
}

// ── Options ──

/// Connection parameters. Built from [`Config`](crate::config::Config) by
/// the front-ends.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceOptions {
    pub vendor_id: u16,
    /// Product ids tried in order by [`JensenDevice::connect`].
    pub product_ids: Vec<u16>,
    pub interface: u8,
    pub command_timeout: Duration,
    pub format_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            vendor_id: HIDOCK_VID,
            product_ids: KNOWN_PRODUCT_IDS.to_vec(),
            interface: JENSEN_INTERFACE,
            command_timeout: DEFAULT_TIMEOUT,
            format_timeout: FORMAT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of one [`JensenDevice::check_health`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheck {
    /// No probe was sent.
    Skipped,
    Healthy,
    Unhealthy,
}

// ── Guards ──

struct ModeGuard<'a> {
    mode: &'a Mutex<OperationMode>,
}

impl Drop for ModeGuard<'_> {
    fn drop(&mut self) {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = OperationMode::Idle;
    }
}

struct HealthCheckGuard<'a> {
    monitor: &'a Mutex<ReliabilityMonitor>,
}

impl Drop for HealthCheckGuard<'_> {
    fn drop(&mut self) {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finish_health_check();
    }
}

// ── Device context ──

pub struct JensenDevice<H: UsbHost> {
    host: H,
    options: DeviceOptions,
    session: Mutex<Session<H::Device>>,
    monitor: Arc<Mutex<ReliabilityMonitor>>,
    mode: Mutex<OperationMode>,
    settings_cache: Mutex<Option<BehaviorSettings>>,
}

impl<H: UsbHost> JensenDevice<H> {
    pub fn new(host: H) -> Self {
        Self::with_options(host, DeviceOptions::default())
    }

    pub fn with_options(host: H, options: DeviceOptions) -> Self {
        let monitor = Arc::new(Mutex::new(ReliabilityMonitor::new(options.retry)));
        Self {
            host,
            session: Mutex::new(Session::new(Arc::clone(&monitor))),
            monitor,
            options,
            mode: Mutex::new(OperationMode::Idle),
            settings_cache: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    fn session(&self) -> MutexGuard<'_, Session<H::Device>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn monitor(&self) -> MutexGuard<'_, ReliabilityMonitor> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache(&self) -> MutexGuard<'_, Option<BehaviorSettings>> {
        self.settings_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mode(&self) -> OperationMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_idle(&self) -> Result<(), OperationError> {
        match self.mode() {
            OperationMode::Idle => Ok(()),
            busy => Err(OperationError::Busy(busy)),
        }
    }

    /// Idle check and session acquisition as one step.
    fn idle_session(&self) -> Result<MutexGuard<'_, Session<H::Device>>, OperationError> {
        let current = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != OperationMode::Idle {
            return Err(OperationError::Busy(*current));
        }
        let session = self.session();
        drop(current);
        Ok(session)
    }

    /// Take the session and switch to `mode` before anyone else can observe
    /// `Idle` again. The mode resets when the guard drops.
    fn enter_mode(
        &self,
        mode: OperationMode,
    ) -> Result<(ModeGuard<'_>, MutexGuard<'_, Session<H::Device>>), OperationError> {
        let mut current = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != OperationMode::Idle {
            return Err(OperationError::Busy(*current));
        }
        let session = self.session();
        *current = mode;
        Ok((ModeGuard { mode: &self.mode }, session))
    }

    /// Idle check, then one typed exchange under the session lock.
    fn request(
        &self,
        command_id: u16,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Response, OperationError> {
        let mut session = self.idle_session()?;
        if !session.is_connected() {
            return Err(OperationError::NotConnected);
        }
        Ok(session.request(command_id, body, timeout)?)
    }

    // ── Connection ──

    /// Find and claim the first device matching a configured product id.
    ///
    /// `Ok(None)` means no device is plugged in. Already connected is a no-op.
    pub fn connect(&self) -> Result<Option<ConnectionState>, ConnectionError> {
        let mut session = self.session();
        if session.is_connected() {
            return Ok(Some(session.connection().state().clone()));
        }
        let started = Instant::now();
        for &product_id in &self.options.product_ids {
            let found = connection::find_device(&self.host, self.options.vendor_id, product_id)?;
            let Some(device) = found else {
                continue;
            };
            session.connection_mut().set_connecting();
            if let Err(e) = session
                .connection_mut()
                .establish(device, self.options.interface)
            {
                if e.counts_as_connection_lost() {
                    self.monitor()
                        .increment_error_count(ErrorCategory::ConnectionLost);
                }
                log::warn!("connection to {product_id:04x} failed: {e}");
                return Err(e);
            }
            self.monitor().record_connected(started.elapsed());
            return Ok(Some(session.connection().state().clone()));
        }
        log::debug!("no HiDock device found");
        Ok(None)
    }

    /// Release the device. Safe to call when not connected.
    pub fn disconnect(&self) {
        self.session().disconnect();
        *self.cache() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_connected()
    }

    /// Snapshot of the connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.session().connection().state().clone()
    }

    /// Clear buffered bytes and endpoint halts without disconnecting.
    pub fn reset_device_state(&self) -> Result<usize, OperationError> {
        Ok(self.idle_session()?.reset_device_state())
    }

    // ── Settings ──

    /// Cached settings, fetched from the device on first use.
    pub fn get_device_settings(&self) -> Result<BehaviorSettings, OperationError> {
        self.ensure_idle()?;
        if let Some(cached) = *self.cache() {
            return Ok(cached);
        }
        self.refresh_device_settings()
    }

    /// Always asks the device.
    pub fn refresh_device_settings(&self) -> Result<BehaviorSettings, OperationError> {
        match self.request(CMD_GET_SETTINGS, &[], self.options.command_timeout)? {
            Response::Settings(settings) => {
                *self.cache() = Some(settings);
                Ok(settings)
            }
            other => Err(unexpected(CMD_GET_SETTINGS, &other)),
        }
    }

    /// Read the current flags, overlay `update`, write all four back.
    pub fn set_device_settings(
        &self,
        update: &SettingsUpdate,
    ) -> Result<BehaviorSettings, OperationError> {
        let current = match self.refresh_device_settings() {
            Ok(s) => s,
            Err(e @ (OperationError::Busy(_) | OperationError::NotConnected)) => return Err(e),
            Err(e) => {
                return Err(OperationError::Unavailable(format!(
                    "could not get current settings: {e}"
                )));
            }
        };
        let merged = current.merged(update);
        let response = self.request(
            CMD_SET_SETTINGS,
            &merged.to_bytes(),
            self.options.command_timeout,
        )?;
        check_ack(CMD_SET_SETTINGS, response)?;
        *self.cache() = Some(merged);
        Ok(merged)
    }

    // ── Storage ──

    pub fn get_card_info(&self) -> Result<CardInfo, OperationError> {
        match self.request(CMD_GET_CARD_INFO, &[], self.options.command_timeout)? {
            Response::CardInfo(info) => Ok(info),
            other => Err(unexpected(CMD_GET_CARD_INFO, &other)),
        }
    }

    /// Erase the card. Success only on the device's own zero result code.
    pub fn format_card(&self) -> Result<(), OperationError> {
        let response = self.request(
            CMD_FORMAT_CARD,
            &CONFIRMATION_PAYLOAD,
            self.options.format_timeout,
        )?;
        check_ack(CMD_FORMAT_CARD, response)?;
        log::info!("storage card formatted");
        Ok(())
    }

    /// Name of the active or last recording, `None` if there is none.
    pub fn get_recording_file(&self) -> Result<Option<String>, OperationError> {
        match self.request(CMD_GET_RECORDING_FILE, &[], self.options.command_timeout)? {
            Response::RecordingFile(name) => Ok(name),
            other => Err(unexpected(CMD_GET_RECORDING_FILE, &other)),
        }
    }

    pub fn get_file_count(&self) -> Result<u32, OperationError> {
        match self.request(CMD_GET_FILE_COUNT, &[], self.options.command_timeout)? {
            Response::FileCount(n) => Ok(n),
            other => Err(unexpected(CMD_GET_FILE_COUNT, &other)),
        }
    }

    /// Enumerate recordings. Holds [`OperationMode::Enumerating`] throughout.
    pub fn list_files(&self) -> Result<Vec<FileEntry>, OperationError> {
        let (_mode, mut session) = self.enter_mode(OperationMode::Enumerating)?;
        if !session.is_connected() {
            return Err(OperationError::NotConnected);
        }

        let count = match session.request(CMD_GET_FILE_COUNT, &[], self.options.command_timeout)? {
            Response::FileCount(n) => n,
            other => return Err(unexpected(CMD_GET_FILE_COUNT, &other)),
        };
        if count == 0 {
            return Ok(Vec::new());
        }

        session.send(CMD_GET_FILE_LIST, &[], self.options.command_timeout)?;
        let mut parser = FileListParser::new();
        loop {
            match session.receive(CMD_GET_FILE_LIST, TRANSFER_CHUNK_TIMEOUT) {
                Ok(frame) if frame.body.is_empty() => break,
                Ok(frame) => {
                    parser.feed(&frame.body);
                    if parser.is_complete(Some(count)) {
                        break;
                    }
                }
                Err(TransportError::Timeout { .. }) if !parser.entries().is_empty() => {
                    log::warn!(
                        "file list stopped after {} of {count} entries",
                        parser.entries().len()
                    );
                    break;
                }
                Err(e) => {
                    session.reset_device_state();
                    return Err(e.into());
                }
            }
        }
        if parser.pending_bytes() > 0 {
            log::debug!("{} trailing file list bytes ignored", parser.pending_bytes());
        }
        Ok(parser.into_entries())
    }

    /// Stream `name` into `sink`. `progress(received, total)` is called after
    /// each chunk; returning `false` cancels and drains the remainder.
    pub fn download_file<W, F>(
        &self,
        name: &str,
        length: u32,
        sink: &mut W,
        mut progress: F,
    ) -> Result<u64, OperationError>
    where
        W: Write + ?Sized,
        F: FnMut(u64, u64) -> bool,
    {
        let (_mode, mut session) = self.enter_mode(OperationMode::Transferring)?;
        if !session.is_connected() {
            return Err(OperationError::NotConnected);
        }

        let total = u64::from(length);
        session.send(CMD_TRANSFER_FILE, name.as_bytes(), self.options.command_timeout)?;
        let mut received = 0u64;
        while received < total {
            let frame = match session.receive(CMD_TRANSFER_FILE, TRANSFER_CHUNK_TIMEOUT) {
                Ok(frame) => frame,
                Err(e) => {
                    session.reset_device_state();
                    return Err(e.into());
                }
            };
            if frame.body.is_empty() {
                return Err(OperationError::Unavailable(format!(
                    "{name}: transfer ended after {received} of {total} bytes"
                )));
            }
            let wanted = (total - received).min(frame.body.len() as u64) as usize;
            if let Err(e) = sink.write_all(&frame.body[..wanted]) {
                session.reset_device_state();
                return Err(OperationError::Io(e));
            }
            received += wanted as u64;
            if !progress(received, total) {
                log::info!("download of {name} cancelled at {received} of {total} bytes");
                session.reset_device_state();
                return Err(OperationError::Cancelled);
            }
        }
        sink.flush().map_err(OperationError::Io)?;
        Ok(received)
    }

    pub fn delete_file(&self, name: &str) -> Result<(), OperationError> {
        let timeout = self.options.command_timeout;
        let response = self.request(CMD_DELETE_FILE, name.as_bytes(), timeout)?;
        check_ack(CMD_DELETE_FILE, response)
    }

    // ── Device ──

    /// Firmware version and serial. Also recorded in the connection state.
    pub fn get_device_info(&self) -> Result<DeviceInfo, OperationError> {
        let mut session = self.idle_session()?;
        if !session.is_connected() {
            return Err(OperationError::NotConnected);
        }
        match session.request(CMD_GET_DEVICE_INFO, &[], self.options.command_timeout)? {
            Response::DeviceInfo(info) => {
                session.connection_mut().set_device_info(info.clone());
                Ok(info)
            }
            other => Err(unexpected(CMD_GET_DEVICE_INFO, &other)),
        }
    }

    /// Device clock, `None` if it was never set.
    pub fn get_device_time(&self) -> Result<Option<NaiveDateTime>, OperationError> {
        match self.request(CMD_GET_DEVICE_TIME, &[], self.options.command_timeout)? {
            Response::DeviceTime(time) => Ok(time),
            other => Err(unexpected(CMD_GET_DEVICE_TIME, &other)),
        }
    }

    pub fn set_device_time(&self, time: &NaiveDateTime) -> Result<(), OperationError> {
        let response = self.request(
            CMD_SET_DEVICE_TIME,
            &encode_device_time(time),
            self.options.command_timeout,
        )?;
        check_ack(CMD_SET_DEVICE_TIME, response)
    }

    pub fn restore_factory_settings(&self) -> Result<(), OperationError> {
        let response = self.request(
            CMD_RESTORE_FACTORY_SETTINGS,
            &CONFIRMATION_PAYLOAD,
            SLOW_TIMEOUT,
        )?;
        check_ack(CMD_RESTORE_FACTORY_SETTINGS, response)?;
        *self.cache() = None;
        Ok(())
    }

    // ── Reliability ──

    /// Probe the device if the check interval has elapsed.
    ///
    /// Returns [`HealthCheck::Skipped`] without I/O when not due, already
    /// running, or while a streaming operation owns the transport.
    pub fn check_health(&self) -> HealthCheck {
        let mode = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
        if *mode != OperationMode::Idle {
            return HealthCheck::Skipped;
        }
        match self.monitor().begin_health_check(Instant::now()) {
            HealthCheckStart::NotDue | HealthCheckStart::InProgress => {
                return HealthCheck::Skipped;
            }
            HealthCheckStart::Due => {}
        }
        let _guard = HealthCheckGuard {
            monitor: &self.monitor,
        };
        let mut session = self.session();
        drop(mode);
        if !session.is_connected() {
            return HealthCheck::Unhealthy;
        }
        match session.send_and_receive(CMD_GET_DEVICE_INFO, &[], QUICK_TIMEOUT) {
            Ok(frame) => match DeviceInfo::from_bytes(&frame.body) {
                Some(info) => {
                    session.connection_mut().set_device_info(info);
                    HealthCheck::Healthy
                }
                None => {
                    log::warn!("health check: device info response was empty");
                    HealthCheck::Unhealthy
                }
            },
            Err(e) => {
                log::warn!("health check failed: {e}");
                self.monitor()
                    .increment_error_count(ErrorCategory::ConnectionLost);
                HealthCheck::Unhealthy
            }
        }
    }

    /// [`check_health`](Self::check_health) folded to a bool; a skipped
    /// check counts as healthy.
    pub fn perform_health_check(&self) -> bool {
        self.check_health() != HealthCheck::Unhealthy
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.monitor().connection_stats()
    }

    pub fn reset_error_counts(&self) {
        self.monitor().reset_error_counts();
    }

    pub fn should_retry_connection(&self) -> bool {
        self.monitor().should_retry_connection()
    }

    /// Count one failed reconnect attempt.
    pub fn record_retry(&self) {
        self.monitor().record_retry();
    }
}
