//! USB host boundary: traits, the `nusb` backend and an in-memory mock.
//!
//! The connection manager and transport only ever talk to [`UsbHost`] and
//! [`UsbDevice`]; nothing above this module sees a backend error type.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

// ── Error type ──

/// Classified USB host failures.
///
/// String payloads follow the convention **"context: details"**.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbError {
    /// No data before the timeout elapsed.
    Timeout,
    /// Endpoint stalled or the transfer faulted.
    Pipe(String),
    /// Resource is held by another driver or process.
    Busy(String),
    /// Insufficient permissions.
    Access(String),
    /// Entity (interface, kernel driver, endpoint) does not exist.
    NotFound(String),
    /// Operation is not available on this platform.
    NotSupported(String),
    /// The device went away.
    NoDevice,
    /// Any other host error.
    Other(String),
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbError::Timeout => write!(f, "USB transfer timed out"),
            UsbError::Pipe(e) => write!(f, "USB pipe error: {e}"),
            UsbError::Busy(e) => write!(f, "USB resource busy: {e}"),
            UsbError::Access(e) => write!(f, "USB access denied: {e}"),
            UsbError::NotFound(e) => write!(f, "USB entity not found: {e}"),
            UsbError::NotSupported(e) => write!(f, "USB operation not supported: {e}"),
            UsbError::NoDevice => write!(f, "USB device disconnected"),
            UsbError::Other(e) => write!(f, "USB error: {e}"),
        }
    }
}

impl std::error::Error for UsbError {}

// ── Discovery info ──

/// A matching device seen during enumeration (not opened or claimed).
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDevice {
    /// Bus location, e.g. `usb:1-004 [10d6:b00d]`.
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product: Option<String>,
    pub serial: Option<String>,
}

// ── Traits ──

/// Host USB stack: enumeration only.
pub trait UsbHost {
    type Device: UsbDevice;

    /// Find the first device matching `vendor_id`/`product_id`.
    ///
    /// `Err` means the host stack itself is unusable; a missing device is `Ok(None)`.
    fn find_device(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Option<Self::Device>, UsbError>;

    /// List every device with the given vendor id.
    fn list_devices(&self, vendor_id: u16) -> Result<Vec<DiscoveredDevice>, UsbError>;
}

/// One physical device handle.
///
/// String descriptor accessors are best-effort; callers must not treat
/// their failure as a discovery failure.
pub trait UsbDevice: Send {
    fn product_id(&self) -> u16;
    fn product_string(&self) -> Result<String, UsbError>;
    fn manufacturer_string(&self) -> Result<String, UsbError>;
    fn serial_number(&self) -> Result<String, UsbError>;

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), UsbError>;
    fn attach_kernel_driver(&mut self, interface: u8) -> Result<(), UsbError>;

    /// Select the device's first configuration.
    fn set_active_configuration(&mut self) -> Result<(), UsbError>;
    fn has_interface(&self, interface: u8) -> bool;
    fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError>;
    fn release_interface(&mut self, interface: u8) -> Result<(), UsbError>;
    fn has_endpoint(&self, interface: u8, address: u8) -> bool;

    /// Write `data` to a bulk OUT endpoint. Returns bytes written.
    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration)
    -> Result<usize, UsbError>;
    /// Read up to `max_len` bytes from a bulk IN endpoint.
    fn read_bulk(
        &mut self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, UsbError>;
    fn clear_halt(&mut self, endpoint: u8) -> Result<(), UsbError>;

    /// Drop transfer resources. The handle stays usable for kernel-driver reattach.
    fn close(&mut self);
}

// ── nusb backend ──

mod nusb_impl {
    use super::*;

    use nusb::transfer::{Buffer, Bulk, In, Out, TransferError};
    use nusb::{Endpoint, Interface, MaybeFuture};

    fn map_error(context: &str, e: nusb::Error) -> UsbError {
        let msg = format!("{context}: {e}");
        match e.kind() {
            nusb::ErrorKind::Disconnected => UsbError::NoDevice,
            nusb::ErrorKind::Busy => UsbError::Busy(msg),
            nusb::ErrorKind::PermissionDenied => UsbError::Access(msg),
            nusb::ErrorKind::NotFound => UsbError::NotFound(msg),
            nusb::ErrorKind::Unsupported => UsbError::NotSupported(msg),
            _ => UsbError::Other(msg),
        }
    }

    fn map_transfer_error(context: &str, e: TransferError) -> UsbError {
        match e {
            TransferError::Disconnected => UsbError::NoDevice,
            TransferError::Stall => UsbError::Pipe(format!("{context}: endpoint stalled")),
            other => UsbError::Pipe(format!("{context}: {other}")),
        }
    }

    /// Host backed by the platform USB stack via `nusb`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NusbHost;

    impl UsbHost for NusbHost {
        type Device = NusbDevice;

        fn find_device(
            &self,
            vendor_id: u16,
            product_id: u16,
        ) -> Result<Option<NusbDevice>, UsbError> {
            let mut devices = nusb::list_devices()
                .wait()
                .map_err(|e| map_error("USB enumeration", e))?;
            Ok(devices
                .find(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
                .map(NusbDevice::new))
        }

        fn list_devices(&self, vendor_id: u16) -> Result<Vec<DiscoveredDevice>, UsbError> {
            let devices = nusb::list_devices()
                .wait()
                .map_err(|e| map_error("USB enumeration", e))?;
            Ok(devices
                .filter(|d| d.vendor_id() == vendor_id)
                .map(|d| DiscoveredDevice {
                    path: format!(
                        "usb:{}-{:03} [{:04x}:{:04x}]",
                        d.bus_id(),
                        d.device_address(),
                        d.vendor_id(),
                        d.product_id()
                    ),
                    vendor_id: d.vendor_id(),
                    product_id: d.product_id(),
                    product: d.product_string().map(str::to_string),
                    serial: d.serial_number().map(str::to_string),
                })
                .collect())
        }
    }

    /// A HiDock opened through `nusb`.
    ///
    /// The device is opened lazily so enumeration never fails on permissions.
    pub struct NusbDevice {
        info: nusb::DeviceInfo,
        device: Option<nusb::Device>,
        interface: Option<Interface>,
        ep_in: Option<Endpoint<Bulk, In>>,
        ep_out: Option<Endpoint<Bulk, Out>>,
    }

    impl NusbDevice {
        fn new(info: nusb::DeviceInfo) -> Self {
            NusbDevice {
                info,
                device: None,
                interface: None,
                ep_in: None,
                ep_out: None,
            }
        }

        fn device(&mut self) -> Result<&nusb::Device, UsbError> {
            if self.device.is_none() {
                let device = self
                    .info
                    .open()
                    .wait()
                    .map_err(|e| map_error("USB open", e))?;
                self.device = Some(device);
            }
            self.device
                .as_ref()
                .ok_or_else(|| UsbError::Other("USB open: device unavailable".into()))
        }

        fn endpoint_addresses(&self, interface: u8) -> Vec<u8> {
            let Some(device) = self.device.as_ref() else {
                return Vec::new();
            };
            let Ok(config) = device.active_configuration() else {
                return Vec::new();
            };
            config
                .interfaces()
                .filter(|iface| iface.interface_number() == interface)
                .flat_map(|iface| iface.alt_settings().collect::<Vec<_>>())
                .flat_map(|alt| alt.endpoints().map(|ep| ep.address()).collect::<Vec<_>>())
                .collect()
        }

        fn in_endpoint(&mut self, address: u8) -> Result<&mut Endpoint<Bulk, In>, UsbError> {
            if self.ep_in.is_none() {
                let iface = self
                    .interface
                    .as_ref()
                    .ok_or_else(|| UsbError::Other("bulk IN: interface not claimed".into()))?;
                let ep = iface
                    .endpoint::<Bulk, In>(address)
                    .map_err(|e| map_error("bulk IN endpoint", e))?;
                self.ep_in = Some(ep);
            }
            self.ep_in
                .as_mut()
                .ok_or_else(|| UsbError::Other("bulk IN: endpoint unavailable".into()))
        }

        fn out_endpoint(&mut self, address: u8) -> Result<&mut Endpoint<Bulk, Out>, UsbError> {
            if self.ep_out.is_none() {
                let iface = self
                    .interface
                    .as_ref()
                    .ok_or_else(|| UsbError::Other("bulk OUT: interface not claimed".into()))?;
                let ep = iface
                    .endpoint::<Bulk, Out>(address)
                    .map_err(|e| map_error("bulk OUT endpoint", e))?;
                self.ep_out = Some(ep);
            }
            self.ep_out
                .as_mut()
                .ok_or_else(|| UsbError::Other("bulk OUT: endpoint unavailable".into()))
        }
    }

    impl UsbDevice for NusbDevice {
        fn product_id(&self) -> u16 {
            self.info.product_id()
        }

        fn product_string(&self) -> Result<String, UsbError> {
            self.info
                .product_string()
                .map(str::to_string)
                .ok_or_else(|| UsbError::NotFound("product string".into()))
        }

        fn manufacturer_string(&self) -> Result<String, UsbError> {
            self.info
                .manufacturer_string()
                .map(str::to_string)
                .ok_or_else(|| UsbError::NotFound("manufacturer string".into()))
        }

        fn serial_number(&self) -> Result<String, UsbError> {
            self.info
                .serial_number()
                .map(str::to_string)
                .ok_or_else(|| UsbError::NotFound("serial number".into()))
        }

        #[cfg(target_os = "linux")]
        fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), UsbError> {
            self.device()?
                .detach_kernel_driver(interface)
                .map_err(|e| map_error("detach kernel driver", e))
        }

        #[cfg(not(target_os = "linux"))]
        fn detach_kernel_driver(&mut self, _interface: u8) -> Result<(), UsbError> {
            Err(UsbError::NotSupported("detach kernel driver".into()))
        }

        #[cfg(target_os = "linux")]
        fn attach_kernel_driver(&mut self, interface: u8) -> Result<(), UsbError> {
            self.device()?
                .attach_kernel_driver(interface)
                .map_err(|e| map_error("attach kernel driver", e))
        }

        #[cfg(not(target_os = "linux"))]
        fn attach_kernel_driver(&mut self, _interface: u8) -> Result<(), UsbError> {
            Err(UsbError::NotSupported("attach kernel driver".into()))
        }

        fn set_active_configuration(&mut self) -> Result<(), UsbError> {
            let device = self.device()?;
            let value = device
                .configurations()
                .next()
                .map(|c| c.configuration_value())
                .ok_or_else(|| UsbError::NotFound("set configuration: no configurations".into()))?;
            device
                .set_configuration(value)
                .wait()
                .map_err(|e| map_error("set configuration", e))
        }

        fn has_interface(&self, interface: u8) -> bool {
            self.device.as_ref().is_some_and(|device| {
                device.active_configuration().is_ok_and(|config| {
                    config
                        .interfaces()
                        .any(|iface| iface.interface_number() == interface)
                })
            })
        }

        fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError> {
            let claimed = self
                .device()?
                .claim_interface(interface)
                .wait()
                .map_err(|e| map_error(&format!("claim interface {interface}"), e))?;
            self.interface = Some(claimed);
            Ok(())
        }

        fn release_interface(&mut self, _interface: u8) -> Result<(), UsbError> {
            // Endpoints borrow the interface's claim; drop them first.
            self.ep_in = None;
            self.ep_out = None;
            match self.interface.take() {
                Some(_) => Ok(()),
                None => Err(UsbError::NotFound("release interface: not claimed".into())),
            }
        }

        fn has_endpoint(&self, interface: u8, address: u8) -> bool {
            self.endpoint_addresses(interface).contains(&address)
        }

        fn write_bulk(
            &mut self,
            endpoint: u8,
            data: &[u8],
            timeout: Duration,
        ) -> Result<usize, UsbError> {
            let ep = self.out_endpoint(endpoint)?;
            ep.submit(Buffer::from(data.to_vec()));
            match ep.wait_next_complete(timeout) {
                Some(completion) => {
                    completion
                        .status
                        .map_err(|e| map_transfer_error("bulk OUT", e))?;
                    Ok(completion.actual_len)
                }
                None => {
                    ep.cancel_all();
                    let _ = ep.wait_next_complete(Duration::from_millis(100));
                    Err(UsbError::Timeout)
                }
            }
        }

        fn read_bulk(
            &mut self,
            endpoint: u8,
            max_len: usize,
            timeout: Duration,
        ) -> Result<Vec<u8>, UsbError> {
            let ep = self.in_endpoint(endpoint)?;
            // A timed-out IN transfer stays queued so a late response is not lost.
            if ep.pending() == 0 {
                let packet = ep.max_packet_size().max(1);
                let len = max_len.div_ceil(packet) * packet;
                let buf = ep.allocate(len);
                ep.submit(buf);
            }
            let Some(completion) = ep.wait_next_complete(timeout) else {
                return Err(UsbError::Timeout);
            };
            completion
                .status
                .map_err(|e| map_transfer_error("bulk IN", e))?;
            let mut data = completion.buffer.into_vec();
            data.truncate(completion.actual_len);
            Ok(data)
        }

        fn clear_halt(&mut self, endpoint: u8) -> Result<(), UsbError> {
            if endpoint & 0x80 != 0 {
                let ep = self.in_endpoint(endpoint)?;
                ep.cancel_all();
                ep.clear_halt()
                    .wait()
                    .map_err(|e| map_error("clear halt IN", e))
            } else {
                self.out_endpoint(endpoint)?
                    .clear_halt()
                    .wait()
                    .map_err(|e| map_error("clear halt OUT", e))
            }
        }

        fn close(&mut self) {
            self.ep_in = None;
            self.ep_out = None;
            self.interface = None;
        }
    }
}

pub use nusb_impl::{NusbDevice, NusbHost};

/// Host type for the current platform.
pub type PlatformHost = NusbHost;

// ── Mock device for testing ──

/// In-memory mock host and device for unit and integration tests.
///
/// The device decodes every frame written to it and, if a reply has been
/// queued for that command, appends the encoded reply (echoing the request's
/// sequence id) to its IN queue. Always compiled, hidden from public docs.
#[doc(hidden)]
pub mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    use crate::codec::{self, Frame};
    use crate::protocol::{EP_IN, EP_OUT, JENSEN_INTERFACE, PID_H1E_V2};

    /// One scripted reply frame.
    #[derive(Debug, Clone)]
    pub struct Reply {
        pub command_id: u16,
        pub body: Vec<u8>,
    }

    /// Shared mock state. Tests keep a [`MockDevice`] clone and inspect this.
    #[derive(Debug)]
    pub struct MockState {
        pub product_id: u16,
        pub product_string: Option<String>,
        pub interfaces: Vec<u8>,
        pub endpoints: Vec<u8>,

        /// Scripted replies: request command → queue of reply batches.
        pub replies: HashMap<u16, VecDeque<Vec<Reply>>>,
        /// Raw IN queue; each entry is one `read_bulk` result.
        pub reads: VecDeque<Result<Vec<u8>, UsbError>>,
        /// If set, replies are split into reads of at most this many bytes.
        pub read_chunk: Option<usize>,

        /// Frames decoded from OUT writes.
        pub written: Vec<Frame>,
        pub claimed: Option<u8>,
        pub detach_calls: Vec<u8>,
        pub attach_calls: Vec<u8>,
        pub release_calls: usize,
        pub clear_halt_calls: Vec<u8>,
        pub close_calls: usize,
        pub read_calls: usize,

        pub fail_detach: Option<UsbError>,
        pub fail_set_configuration: Option<UsbError>,
        pub fail_claim: Option<UsbError>,
        pub fail_release: Option<UsbError>,
        pub fail_attach: Option<UsbError>,
        pub fail_write: Option<UsbError>,
        pub fail_clear_halt: Option<UsbError>,
    }

    impl Default for MockState {
        fn default() -> Self {
            MockState {
                product_id: PID_H1E_V2,
                product_string: Some("HiDock_H1E".into()),
                interfaces: vec![JENSEN_INTERFACE],
                endpoints: vec![EP_IN, EP_OUT],
                replies: HashMap::new(),
                reads: VecDeque::new(),
                read_chunk: None,
                written: Vec::new(),
                claimed: None,
                detach_calls: Vec::new(),
                attach_calls: Vec::new(),
                release_calls: 0,
                clear_halt_calls: Vec::new(),
                close_calls: 0,
                read_calls: 0,
                fail_detach: None,
                fail_set_configuration: None,
                fail_claim: None,
                fail_release: None,
                fail_attach: None,
                fail_write: None,
                fail_clear_halt: None,
            }
        }
    }

    impl MockState {
        fn push_bytes(&mut self, bytes: Vec<u8>) {
            match self.read_chunk {
                Some(n) if n > 0 => {
                    for chunk in bytes.chunks(n) {
                        self.reads.push_back(Ok(chunk.to_vec()));
                    }
                }
                _ => self.reads.push_back(Ok(bytes)),
            }
        }
    }

    /// Cloneable handle to a shared [`MockState`].
    #[derive(Debug, Clone, Default)]
    pub struct MockDevice {
        state: Arc<Mutex<MockState>>,
    }

    impl MockDevice {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_product_id(product_id: u16) -> Self {
            let dev = Self::new();
            dev.state().product_id = product_id;
            dev
        }

        pub fn state(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Reply to the next `command_id` request with one frame echoing the command.
        pub fn queue_reply(&self, command_id: u16, body: impl Into<Vec<u8>>) {
            self.queue_replies(
                command_id,
                vec![Reply {
                    command_id,
                    body: body.into(),
                }],
            );
        }

        /// Reply to the next `request_id` request with a frame carrying a different command id.
        pub fn queue_reply_as(&self, request_id: u16, response_id: u16, body: impl Into<Vec<u8>>) {
            self.queue_replies(
                request_id,
                vec![Reply {
                    command_id: response_id,
                    body: body.into(),
                }],
            );
        }

        /// Reply to the next `command_id` request with a stream of frames.
        pub fn queue_stream(&self, command_id: u16, bodies: Vec<Vec<u8>>) {
            let replies = bodies
                .into_iter()
                .map(|body| Reply { command_id, body })
                .collect();
            self.queue_replies(command_id, replies);
        }

        pub fn queue_replies(&self, request_id: u16, replies: Vec<Reply>) {
            self.state()
                .replies
                .entry(request_id)
                .or_default()
                .push_back(replies);
        }

        /// Append raw bytes (or an error) as the next IN read.
        pub fn push_read(&self, read: Result<Vec<u8>, UsbError>) {
            self.state().reads.push_back(read);
        }

        /// Frames written so far.
        pub fn written(&self) -> Vec<Frame> {
            self.state().written.clone()
        }

        /// Command ids written so far.
        pub fn written_commands(&self) -> Vec<u16> {
            self.state().written.iter().map(|f| f.command_id).collect()
        }
    }

    impl UsbDevice for MockDevice {
        fn product_id(&self) -> u16 {
            self.state().product_id
        }

        fn product_string(&self) -> Result<String, UsbError> {
            self.state()
                .product_string
                .clone()
                .ok_or_else(|| UsbError::Access("mock: product string unreadable".into()))
        }

        fn manufacturer_string(&self) -> Result<String, UsbError> {
            Err(UsbError::NotFound("mock: no language id".into()))
        }

        fn serial_number(&self) -> Result<String, UsbError> {
            Ok("MOCK0001".into())
        }

        fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), UsbError> {
            let mut s = self.state();
            if let Some(e) = s.fail_detach.clone() {
                return Err(e);
            }
            s.detach_calls.push(interface);
            Ok(())
        }

        fn attach_kernel_driver(&mut self, interface: u8) -> Result<(), UsbError> {
            let mut s = self.state();
            s.attach_calls.push(interface);
            match s.fail_attach.clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn set_active_configuration(&mut self) -> Result<(), UsbError> {
            match self.state().fail_set_configuration.clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn has_interface(&self, interface: u8) -> bool {
            self.state().interfaces.contains(&interface)
        }

        fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError> {
            let mut s = self.state();
            if let Some(e) = s.fail_claim.clone() {
                return Err(e);
            }
            s.claimed = Some(interface);
            Ok(())
        }

        fn release_interface(&mut self, _interface: u8) -> Result<(), UsbError> {
            let mut s = self.state();
            s.release_calls += 1;
            s.claimed = None;
            match s.fail_release.clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn has_endpoint(&self, _interface: u8, address: u8) -> bool {
            self.state().endpoints.contains(&address)
        }

        fn write_bulk(
            &mut self,
            _endpoint: u8,
            data: &[u8],
            _timeout: Duration,
        ) -> Result<usize, UsbError> {
            let mut s = self.state();
            if let Some(e) = s.fail_write.clone() {
                return Err(e);
            }
            let Some((frame, _)) = codec::decode(data) else {
                return Err(UsbError::Other("mock: undecodable frame written".into()));
            };
            let batch = s
                .replies
                .get_mut(&frame.command_id)
                .and_then(VecDeque::pop_front);
            if let Some(batch) = batch {
                let mut bytes = Vec::new();
                for reply in batch {
                    bytes.extend(codec::encode(
                        reply.command_id,
                        frame.sequence_id,
                        &reply.body,
                    ));
                }
                s.push_bytes(bytes);
            }
            s.written.push(frame);
            Ok(data.len())
        }

        fn read_bulk(
            &mut self,
            _endpoint: u8,
            max_len: usize,
            _timeout: Duration,
        ) -> Result<Vec<u8>, UsbError> {
            let mut s = self.state();
            s.read_calls += 1;
            match s.reads.pop_front() {
                Some(Ok(mut data)) => {
                    if data.len() > max_len {
                        let rest = data.split_off(max_len);
                        s.reads.push_front(Ok(rest));
                    }
                    Ok(data)
                }
                Some(Err(e)) => Err(e),
                None => Err(UsbError::Timeout),
            }
        }

        fn clear_halt(&mut self, endpoint: u8) -> Result<(), UsbError> {
            let mut s = self.state();
            s.clear_halt_calls.push(endpoint);
            match s.fail_clear_halt.clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn close(&mut self) {
            self.state().close_calls += 1;
        }
    }

    /// Mock host returning a single [`MockDevice`].
    #[derive(Debug, Clone, Default)]
    pub struct MockHost {
        pub device: Option<MockDevice>,
        /// Simulate a host stack that failed to initialise.
        pub unavailable: bool,
    }

    impl MockHost {
        pub fn with_device(device: MockDevice) -> Self {
            MockHost {
                device: Some(device),
                unavailable: false,
            }
        }

        pub fn empty() -> Self {
            MockHost::default()
        }

        pub fn unavailable() -> Self {
            MockHost {
                device: None,
                unavailable: true,
            }
        }
    }

    impl UsbHost for MockHost {
        type Device = MockDevice;

        fn find_device(
            &self,
            _vendor_id: u16,
            product_id: u16,
        ) -> Result<Option<MockDevice>, UsbError> {
            if self.unavailable {
                return Err(UsbError::Other("mock: backend not initialised".into()));
            }
            Ok(self
                .device
                .as_ref()
                .filter(|d| d.product_id() == product_id)
                .cloned())
        }

        fn list_devices(&self, vendor_id: u16) -> Result<Vec<DiscoveredDevice>, UsbError> {
            if self.unavailable {
                return Err(UsbError::Other("mock: backend not initialised".into()));
            }
            Ok(self
                .device
                .iter()
                .map(|d| DiscoveredDevice {
                    path: "mock://hidock".into(),
                    vendor_id,
                    product_id: d.product_id(),
                    product: d.product_string().ok(),
                    serial: d.serial_number().ok(),
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use crate::codec;
    use crate::protocol::*;

    #[test]
    fn usb_error_display() {
        assert_eq!(UsbError::Timeout.to_string(), "USB transfer timed out");
        assert_eq!(
            UsbError::Busy("claim interface 0: in use".into()).to_string(),
            "USB resource busy: claim interface 0: in use"
        );
    }

    #[test]
    fn discovered_device_serializes() {
        let dev = DiscoveredDevice {
            path: "usb:1-004 [10d6:b00d]".into(),
            vendor_id: HIDOCK_VID,
            product_id: PID_H1E_V2,
            product: Some("HiDock_H1E".into()),
            serial: None,
        };
        let json = serde_json::to_value(&dev).unwrap();
        assert_eq!(json["product_id"], PID_H1E_V2);
        assert!(json["serial"].is_null());
    }

    #[test]
    fn mock_echoes_sequence_in_reply() {
        let mut dev = MockDevice::new();
        dev.queue_reply(CMD_GET_SETTINGS, vec![1, 0, 1, 0]);
        dev.write_bulk(EP_OUT, &codec::encode(CMD_GET_SETTINGS, 42, &[]), QUICK_TIMEOUT)
            .unwrap();
        let bytes = dev.read_bulk(EP_IN, RECEIVE_CHUNK_SIZE, QUICK_TIMEOUT).unwrap();
        let (frame, _) = codec::decode(&bytes).unwrap();
        assert_eq!(frame.sequence_id, 42);
        assert_eq!(frame.body, vec![1, 0, 1, 0]);
    }

    #[test]
    fn mock_read_without_data_times_out() {
        let mut dev = MockDevice::new();
        assert_eq!(
            dev.read_bulk(EP_IN, 64, QUICK_TIMEOUT),
            Err(UsbError::Timeout)
        );
    }

    #[test]
    fn mock_read_respects_max_len() {
        let mut dev = MockDevice::new();
        dev.push_read(Ok(vec![1, 2, 3, 4, 5]));
        assert_eq!(dev.read_bulk(EP_IN, 2, QUICK_TIMEOUT).unwrap(), vec![1, 2]);
        assert_eq!(dev.read_bulk(EP_IN, 8, QUICK_TIMEOUT).unwrap(), vec![3, 4, 5]);
    }

    #[test]
    fn mock_host_matches_product_id() {
        let host = MockHost::with_device(MockDevice::with_product_id(PID_P1));
        assert!(host.find_device(HIDOCK_VID, PID_P1).unwrap().is_some());
        assert!(host.find_device(HIDOCK_VID, PID_H1).unwrap().is_none());
        assert!(MockHost::unavailable().find_device(HIDOCK_VID, PID_P1).is_err());
    }
}
