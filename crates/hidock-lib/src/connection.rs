//! Connection manager: discovery, interface claim and clean release.

use std::fmt;

use serde::Serialize;

use crate::device::{UsbDevice, UsbError, UsbHost};
use crate::models::DeviceModel;
use crate::protocol::{EP_IN, EP_OUT, DRAIN_TIMEOUT, MAX_DRAIN_READS, RECEIVE_CHUNK_SIZE};
use crate::response::DeviceInfo;

// ── Error type ──

#[derive(Debug)]
pub enum ConnectionError {
    /// The host USB stack could not be initialised or enumerated.
    BackendUnavailable(String),
    /// No device matched any configured product ID.
    DeviceNotFound,
    /// Interface or configuration is held by someone else.
    DeviceBusy(String),
    /// Insufficient permissions to configure or claim the device.
    AccessDenied(String),
    InterfaceNotFound(u8),
    EndpointsNotFound(String),
    /// Any other USB failure while connecting.
    Usb(UsbError),
}

impl ConnectionError {
    /// Busy/denied failures feed the `connection_lost` counter.
    pub fn counts_as_connection_lost(&self) -> bool {
        matches!(
            self,
            ConnectionError::DeviceBusy(_) | ConnectionError::AccessDenied(_)
        )
    }

    /// Whether retrying without hardware or driver changes can help.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConnectionError::BackendUnavailable(_)
                | ConnectionError::InterfaceNotFound(_)
                | ConnectionError::EndpointsNotFound(_)
        )
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::BackendUnavailable(e) => write!(f, "USB backend unavailable: {e}"),
            ConnectionError::DeviceNotFound => write!(f, "HiDock device not found"),
            ConnectionError::DeviceBusy(e) => write!(f, "Device busy: {e}"),
            ConnectionError::AccessDenied(e) => write!(f, "Access denied: {e}"),
            ConnectionError::InterfaceNotFound(n) => write!(f, "Interface {n} not found"),
            ConnectionError::EndpointsNotFound(e) => write!(f, "Endpoints not found: {e}"),
            ConnectionError::Usb(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Usb(e) => Some(e),
            _ => None,
        }
    }
}

fn classify(e: UsbError) -> ConnectionError {
    match e {
        UsbError::Busy(msg) => ConnectionError::DeviceBusy(msg),
        UsbError::Access(msg) => ConnectionError::AccessDenied(msg),
        other => ConnectionError::Usb(other),
    }
}

// ── State ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// String descriptors read during discovery. Each may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsbIdentity {
    pub product: Option<String>,
    pub manufacturer: Option<String>,
    pub serial: Option<String>,
}

/// Read string descriptors without letting any failure escape.
pub fn read_identity(device: &impl UsbDevice) -> UsbIdentity {
    fn best_effort(what: &str, r: Result<String, UsbError>) -> Option<String> {
        r.map_err(|e| log::debug!("could not read {what}: {e}")).ok()
    }
    UsbIdentity {
        product: best_effort("product string", device.product_string()),
        manufacturer: best_effort("manufacturer string", device.manufacturer_string()),
        serial: best_effort("serial number", device.serial_number()),
    }
}

/// Everything the manager knows about the current connection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub product_id: Option<u16>,
    pub claimed_interface: Option<u8>,
    pub detached_interface: Option<u8>,
    pub endpoint_in: Option<u8>,
    pub endpoint_out: Option<u8>,
    pub model: Option<DeviceModel>,
    pub identity: UsbIdentity,
    /// From the most recent successful device-info query.
    pub device_info: Option<DeviceInfo>,
}

/// Result of a successful claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectedEndpoints {
    pub interface: u8,
    pub endpoint_in: u8,
    pub endpoint_out: u8,
    /// Interface whose kernel driver was detached and must be reattached.
    pub detached_interface: Option<u8>,
}

// ── Discovery and claim ──

/// Find the device with the given IDs.
///
/// `Ok(None)` is the normal "nothing plugged in" answer. String descriptor
/// failures are logged and ignored.
pub fn find_device<H: UsbHost>(
    host: &H,
    vendor_id: u16,
    product_id: u16,
) -> Result<Option<H::Device>, ConnectionError> {
    let device = host
        .find_device(vendor_id, product_id)
        .map_err(|e| ConnectionError::BackendUnavailable(e.to_string()))?;
    if let Some(ref dev) = device {
        let identity = read_identity(dev);
        log::debug!(
            "found {vendor_id:04x}:{product_id:04x} product={:?} manufacturer={:?}",
            identity.product,
            identity.manufacturer
        );
    }
    Ok(device)
}

/// Detach, configure, claim, and locate the bulk endpoints.
///
/// On failure any detached kernel driver is reattached and a claimed
/// interface released, leaving the device as it was found.
pub fn attempt_connection<D: UsbDevice>(
    device: &mut D,
    interface: u8,
) -> Result<ConnectedEndpoints, ConnectionError> {
    let mut detached_interface = None;
    if !cfg!(windows) {
        match device.detach_kernel_driver(interface) {
            Ok(()) => {
                log::debug!("detached kernel driver from interface {interface}");
                detached_interface = Some(interface);
            }
            // No driver bound, or the platform detaches on claim.
            Err(UsbError::NotFound(_) | UsbError::NotSupported(_)) => {}
            Err(e) => log::warn!("could not detach kernel driver on interface {interface}: {e}"),
        }
    }

    let result = claim(device, interface);
    if result.is_err()
        && let Some(iface) = detached_interface
    {
        reattach_kernel_driver(device, iface);
    }
    result.map(|(endpoint_in, endpoint_out)| ConnectedEndpoints {
        interface,
        endpoint_in,
        endpoint_out,
        detached_interface,
    })
}

fn claim<D: UsbDevice>(device: &mut D, interface: u8) -> Result<(u8, u8), ConnectionError> {
    device.set_active_configuration().map_err(classify)?;

    if !device.has_interface(interface) {
        return Err(ConnectionError::InterfaceNotFound(interface));
    }

    device.claim_interface(interface).map_err(classify)?;

    let missing: Vec<String> = [EP_IN, EP_OUT]
        .into_iter()
        .filter(|&ep| !device.has_endpoint(interface, ep))
        .map(|ep| format!("0x{ep:02X}"))
        .collect();
    if !missing.is_empty() {
        if let Err(e) = device.release_interface(interface) {
            log::warn!("release after endpoint lookup failure: {e}");
        }
        return Err(ConnectionError::EndpointsNotFound(format!(
            "interface {interface}: missing {}",
            missing.join(", ")
        )));
    }
    Ok((EP_IN, EP_OUT))
}

fn reattach_kernel_driver<D: UsbDevice>(device: &mut D, interface: u8) {
    match device.attach_kernel_driver(interface) {
        Ok(()) => log::debug!("reattached kernel driver on interface {interface}"),
        Err(UsbError::NotSupported(e)) => log::debug!("kernel driver reattach unsupported: {e}"),
        Err(e) => log::warn!("could not reattach kernel driver on interface {interface}: {e}"),
    }
}

// ── Manager ──

/// Owns the device handle and connection state. Not thread-safe by itself;
/// the transport session wraps it in the device-wide mutex.
pub struct ConnectionManager<D> {
    device: Option<D>,
    state: ConnectionState,
}

impl<D> Default for ConnectionManager<D> {
    fn default() -> Self {
        Self {
            device: None,
            state: ConnectionState::default(),
        }
    }
}

impl<D: UsbDevice> ConnectionManager<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.status == ConnectionStatus::Connected && self.device.is_some()
    }

    pub fn set_connecting(&mut self) {
        self.state.status = ConnectionStatus::Connecting;
    }

    /// Claim `device` and take ownership of it. On failure the state returns
    /// to `Disconnected` and the device is dropped.
    pub fn establish(&mut self, mut device: D, interface: u8) -> Result<(), ConnectionError> {
        self.state.status = ConnectionStatus::Connecting;
        let identity = read_identity(&device);
        match attempt_connection(&mut device, interface) {
            Ok(eps) => {
                let product_id = device.product_id();
                let model = DeviceModel::from_product_id(product_id);
                log::info!(
                    "connected to {model} (interface {}, IN 0x{:02X}, OUT 0x{:02X})",
                    eps.interface,
                    eps.endpoint_in,
                    eps.endpoint_out
                );
                self.state = ConnectionState {
                    status: ConnectionStatus::Connected,
                    product_id: Some(product_id),
                    claimed_interface: Some(eps.interface),
                    detached_interface: eps.detached_interface,
                    endpoint_in: Some(eps.endpoint_in),
                    endpoint_out: Some(eps.endpoint_out),
                    model: Some(model),
                    identity,
                    device_info: None,
                };
                self.device = Some(device);
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::default();
                Err(e)
            }
        }
    }

    /// Release everything. Safe to call any number of times.
    pub fn disconnect(&mut self) {
        let Some(mut device) = self.device.take() else {
            self.state = ConnectionState::default();
            return;
        };
        if let Some(iface) = self.state.claimed_interface
            && let Err(e) = device.release_interface(iface)
        {
            log::warn!("error releasing interface {iface}: {e}");
        }
        device.close();
        if !cfg!(windows)
            && let Some(iface) = self.state.detached_interface
        {
            reattach_kernel_driver(&mut device, iface);
        }
        log::info!("disconnected");
        self.state = ConnectionState::default();
    }

    /// Both endpoint addresses, if connected.
    pub fn endpoints(&self) -> Option<(u8, u8)> {
        Some((self.state.endpoint_in?, self.state.endpoint_out?))
    }

    pub(crate) fn device_mut(&mut self) -> Option<&mut D> {
        self.device.as_mut()
    }

    pub fn set_device_info(&mut self, info: DeviceInfo) {
        self.state.device_info = Some(info);
    }

    /// Clear halt on both endpoints, then drain stale IN data until a read
    /// times out or fails. Returns the number of bytes discarded.
    pub fn clear_and_drain(&mut self) -> usize {
        let Some((ep_in, ep_out)) = self.endpoints() else {
            return 0;
        };
        let Some(device) = self.device.as_mut() else {
            return 0;
        };
        for ep in [ep_in, ep_out] {
            if let Err(e) = device.clear_halt(ep) {
                log::debug!("clear halt on 0x{ep:02X} failed: {e}");
            }
        }
        let mut drained = 0;
        for _ in 0..MAX_DRAIN_READS {
            match device.read_bulk(ep_in, RECEIVE_CHUNK_SIZE, DRAIN_TIMEOUT) {
                Ok(data) if !data.is_empty() => drained += data.len(),
                _ => break,
            }
        }
        if drained > 0 {
            log::debug!("drained {drained} stale bytes from IN endpoint");
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockDevice, MockHost};
    use crate::protocol::*;

    #[test]
    fn find_device_backend_unavailable() {
        let err = find_device(&MockHost::unavailable(), HIDOCK_VID, PID_H1E_V2).unwrap_err();
        assert!(matches!(err, ConnectionError::BackendUnavailable(_)));
    }

    #[test]
    fn find_device_none_when_absent() {
        assert!(
            find_device(&MockHost::empty(), HIDOCK_VID, PID_H1E_V2)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn find_device_tolerates_unreadable_strings() {
        let dev = MockDevice::new();
        dev.state().product_string = None;
        let host = MockHost::with_device(dev);
        assert!(
            find_device(&host, HIDOCK_VID, PID_H1E_V2)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn read_identity_best_effort() {
        let dev = MockDevice::new();
        let id = read_identity(&dev);
        assert_eq!(id.product.as_deref(), Some("HiDock_H1E"));
        assert!(id.manufacturer.is_none());
        assert_eq!(id.serial.as_deref(), Some("MOCK0001"));
    }

    #[test]
    fn attempt_connection_success() {
        let mut dev = MockDevice::new();
        let eps = attempt_connection(&mut dev, JENSEN_INTERFACE).unwrap();
        assert_eq!(eps.endpoint_in, EP_IN);
        assert_eq!(eps.endpoint_out, EP_OUT);
        assert_eq!(dev.state().claimed, Some(JENSEN_INTERFACE));
        if cfg!(windows) {
            assert_eq!(eps.detached_interface, None);
        } else {
            assert_eq!(eps.detached_interface, Some(JENSEN_INTERFACE));
        }
    }

    #[test]
    fn detach_not_found_is_not_recorded() {
        let mut dev = MockDevice::new();
        dev.state().fail_detach = Some(UsbError::NotFound("no driver".into()));
        let eps = attempt_connection(&mut dev, JENSEN_INTERFACE).unwrap();
        assert_eq!(eps.detached_interface, None);
    }

    #[test]
    fn interface_not_found() {
        let mut dev = MockDevice::new();
        dev.state().interfaces = vec![1];
        let err = attempt_connection(&mut dev, JENSEN_INTERFACE).unwrap_err();
        assert!(matches!(err, ConnectionError::InterfaceNotFound(0)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn endpoints_not_found_releases_interface() {
        let mut dev = MockDevice::new();
        dev.state().endpoints = vec![EP_OUT];
        let err = attempt_connection(&mut dev, JENSEN_INTERFACE).unwrap_err();
        assert!(matches!(err, ConnectionError::EndpointsNotFound(_)));
        assert!(err.to_string().contains("0x82"));
        let s = dev.state();
        assert_eq!(s.release_calls, 1);
        assert_eq!(s.claimed, None);
    }

    #[test]
    fn busy_at_claim_is_device_busy() {
        let mut dev = MockDevice::new();
        dev.state().fail_claim = Some(UsbError::Busy("claimed by another process".into()));
        let err = attempt_connection(&mut dev, JENSEN_INTERFACE).unwrap_err();
        assert!(matches!(err, ConnectionError::DeviceBusy(_)));
        assert!(err.counts_as_connection_lost());
        assert!(err.is_retryable());
    }

    #[test]
    fn access_denied_at_configuration() {
        let mut dev = MockDevice::new();
        dev.state().fail_set_configuration = Some(UsbError::Access("EACCES".into()));
        let err = attempt_connection(&mut dev, JENSEN_INTERFACE).unwrap_err();
        assert!(matches!(err, ConnectionError::AccessDenied(_)));
        assert!(err.counts_as_connection_lost());
    }

    #[test]
    fn generic_usb_error_does_not_count_as_lost() {
        let mut dev = MockDevice::new();
        dev.state().fail_claim = Some(UsbError::Other("EIO".into()));
        let err = attempt_connection(&mut dev, JENSEN_INTERFACE).unwrap_err();
        assert!(matches!(err, ConnectionError::Usb(_)));
        assert!(!err.counts_as_connection_lost());
    }

    #[cfg(not(windows))]
    #[test]
    fn failed_claim_reattaches_detached_driver() {
        let mut dev = MockDevice::new();
        dev.state().fail_claim = Some(UsbError::Busy("busy".into()));
        let _ = attempt_connection(&mut dev, JENSEN_INTERFACE);
        assert_eq!(dev.state().attach_calls, vec![JENSEN_INTERFACE]);
    }

    #[test]
    fn manager_establish_sets_state() {
        let dev = MockDevice::new();
        let mut mgr = ConnectionManager::new();
        mgr.establish(dev, JENSEN_INTERFACE).unwrap();
        assert!(mgr.is_connected());
        let s = mgr.state();
        assert_eq!(s.status, ConnectionStatus::Connected);
        assert_eq!(s.model, Some(DeviceModel::H1E));
        assert_eq!(s.claimed_interface, Some(JENSEN_INTERFACE));
        assert_eq!(mgr.endpoints(), Some((EP_IN, EP_OUT)));
    }

    #[test]
    fn manager_unknown_product_id_connects() {
        let dev = MockDevice::with_product_id(0x4242);
        let mut mgr = ConnectionManager::new();
        mgr.establish(dev, JENSEN_INTERFACE).unwrap();
        assert_eq!(
            mgr.state().model.unwrap().to_string(),
            "HiDock Device (0x4242)"
        );
    }

    #[test]
    fn manager_failed_establish_is_disconnected() {
        let dev = MockDevice::new();
        dev.state().interfaces.clear();
        let mut mgr = ConnectionManager::new();
        assert!(mgr.establish(dev, JENSEN_INTERFACE).is_err());
        assert!(!mgr.is_connected());
        assert_eq!(mgr.state().status, ConnectionStatus::Disconnected);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let dev = MockDevice::new();
        let probe = dev.clone();
        let mut mgr = ConnectionManager::new();
        mgr.establish(dev, JENSEN_INTERFACE).unwrap();
        mgr.disconnect();
        mgr.disconnect();
        let s = probe.state();
        assert_eq!(s.release_calls, 1);
        assert_eq!(s.close_calls, 1);
        drop(s);
        assert!(!mgr.is_connected());
        assert!(mgr.state().claimed_interface.is_none());
        assert!(mgr.state().model.is_none());
    }

    #[test]
    fn disconnect_without_connection_is_noop() {
        let mut mgr: ConnectionManager<MockDevice> = ConnectionManager::new();
        mgr.disconnect();
        assert_eq!(mgr.state().status, ConnectionStatus::Disconnected);
    }

    #[test]
    fn disconnect_tolerates_release_and_attach_errors() {
        let dev = MockDevice::new();
        let probe = dev.clone();
        let mut mgr = ConnectionManager::new();
        mgr.establish(dev, JENSEN_INTERFACE).unwrap();
        {
            let mut s = probe.state();
            s.fail_release = Some(UsbError::NoDevice);
            s.fail_attach = Some(UsbError::NotSupported("not implemented".into()));
        }
        mgr.disconnect();
        assert!(!mgr.is_connected());
        assert_eq!(probe.state().close_calls, 1);
    }

    #[cfg(not(windows))]
    #[test]
    fn disconnect_reattaches_detached_driver() {
        let dev = MockDevice::new();
        let probe = dev.clone();
        let mut mgr = ConnectionManager::new();
        mgr.establish(dev, JENSEN_INTERFACE).unwrap();
        mgr.disconnect();
        assert_eq!(probe.state().attach_calls, vec![JENSEN_INTERFACE]);
    }

    #[test]
    fn clear_and_drain_stops_at_timeout() {
        let dev = MockDevice::new();
        let probe = dev.clone();
        let mut mgr = ConnectionManager::new();
        mgr.establish(dev, JENSEN_INTERFACE).unwrap();
        probe.push_read(Ok(vec![0xAB; 10]));
        probe.push_read(Ok(vec![0xCD; 5]));
        assert_eq!(mgr.clear_and_drain(), 15);
        let s = probe.state();
        assert_eq!(s.clear_halt_calls, vec![EP_IN, EP_OUT]);
        assert!(s.reads.is_empty());
    }

    #[test]
    fn clear_and_drain_tolerates_clear_halt_failure() {
        let dev = MockDevice::new();
        let probe = dev.clone();
        let mut mgr = ConnectionManager::new();
        mgr.establish(dev, JENSEN_INTERFACE).unwrap();
        probe.state().fail_clear_halt = Some(UsbError::Pipe("stall".into()));
        probe.push_read(Ok(vec![1, 2, 3]));
        probe.push_read(Err(UsbError::Pipe("broken".into())));
        probe.push_read(Ok(vec![4]));
        assert_eq!(mgr.clear_and_drain(), 3);
        assert_eq!(probe.state().reads.len(), 1, "draining stops at the first error");
    }

    #[test]
    fn error_display() {
        assert_eq!(
            ConnectionError::DeviceNotFound.to_string(),
            "HiDock device not found"
        );
        assert_eq!(
            ConnectionError::InterfaceNotFound(3).to_string(),
            "Interface 3 not found"
        );
    }
}
