//! Scripted in-memory USB device
//!
//! Drives probe, handshake and session scenarios without hardware. A
//! `MockDevice` hands out `MockHandle`s that share one `MockState`, so a
//! test can script inbound bulk traffic and inspect every transfer the
//! driver issued after the fact.

use crate::usb::{AccessoryHandle, Endpoints, UsbDevice};
use common::UsbLocation;
use protocol::StringIndex;
use protocol::aoa::REQUEST_SEND_STRING;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Longest a mock bulk read sleeps before reporting a timeout
const MAX_IDLE: Duration = Duration::from_millis(2);

/// One control transfer as issued by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTransfer {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Script {
    protocol: Result<u16, rusb::Error>,
    failing_string: Option<StringIndex>,
    fail_start: bool,
    endpoints: Option<Endpoints>,
    open_error: Option<rusb::Error>,
    claim_error: Option<rusb::Error>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            protocol: Err(rusb::Error::Pipe),
            failing_string: None,
            fail_start: false,
            endpoints: Some(Endpoints::default()),
            open_error: None,
            claim_error: None,
        }
    }
}

/// Observable state shared by a mock device and its handles
#[derive(Debug, Default)]
pub struct MockState {
    reads: Mutex<VecDeque<rusb::Result<Vec<u8>>>>,
    disconnected: AtomicBool,
    write_error: Mutex<Option<rusb::Error>>,
    controls: Mutex<Vec<ControlTransfer>>,
    bulk_writes: Mutex<Vec<(u8, Vec<u8>)>>,
    claimed: Mutex<Vec<u8>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockState {
    /// Queue a packet for the next bulk read
    pub fn push_read(&self, packet: Vec<u8>) {
        lock(&self.reads).push_back(Ok(packet));
    }

    /// Queue `count` explicit bulk read timeouts
    pub fn push_timeouts(&self, count: usize) {
        let mut reads = lock(&self.reads);
        for _ in 0..count {
            reads.push_back(Err(rusb::Error::Timeout));
        }
    }

    /// Queue a hard bulk read failure
    pub fn push_read_error(&self, error: rusb::Error) {
        lock(&self.reads).push_back(Err(error));
    }

    /// Unplug: every later bulk transfer fails with `NoDevice`
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    /// Make every later bulk write fail with `error`
    pub fn fail_writes(&self, error: rusb::Error) {
        *lock(&self.write_error) = Some(error);
    }

    pub fn control_transfers(&self) -> Vec<ControlTransfer> {
        lock(&self.controls).clone()
    }

    /// Identification strings sent so far, NUL stripped
    pub fn sent_strings(&self) -> Vec<(u16, String)> {
        lock(&self.controls)
            .iter()
            .filter(|c| c.request == REQUEST_SEND_STRING)
            .map(|c| {
                let text = c.data.strip_suffix(&[0]).unwrap_or(&c.data[..]);
                (c.index, String::from_utf8_lossy(text).into_owned())
            })
            .collect()
    }

    pub fn bulk_writes(&self) -> Vec<(u8, Vec<u8>)> {
        lock(&self.bulk_writes).clone()
    }

    pub fn claimed_interfaces(&self) -> Vec<u8> {
        lock(&self.claimed).clone()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Acquire)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }

    /// Handles currently open
    pub fn open_handles(&self) -> usize {
        self.opens() - self.closes()
    }
}

/// Scripted USB device
#[derive(Debug, Clone)]
pub struct MockDevice {
    location: UsbLocation,
    script: Script,
    state: Arc<MockState>,
}

impl MockDevice {
    /// Device at bus 1, address 1 that answers the AOA query with a pipe error
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            location: UsbLocation {
                bus: 1,
                address: 1,
                vendor_id,
                product_id,
            },
            script: Script::default(),
            state: Arc::new(MockState::default()),
        }
    }

    pub fn at(mut self, bus: u8, address: u8) -> Self {
        self.location.bus = bus;
        self.location.address = address;
        self
    }

    /// Answer the AOA protocol query with `version`
    pub fn with_protocol_version(mut self, version: u16) -> Self {
        self.script.protocol = Ok(version);
        self
    }

    /// Fail the AOA protocol query with `error`
    pub fn with_protocol_error(mut self, error: rusb::Error) -> Self {
        self.script.protocol = Err(error);
        self
    }

    /// Fail the `SEND_STRING` transfer for `index`
    pub fn failing_string(mut self, index: StringIndex) -> Self {
        self.script.failing_string = Some(index);
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.script.fail_start = true;
        self
    }

    /// Endpoints reported by the descriptor; `None` makes the lookup fail
    pub fn with_endpoints(mut self, endpoints: Option<Endpoints>) -> Self {
        self.script.endpoints = endpoints;
        self
    }

    pub fn failing_open(mut self, error: rusb::Error) -> Self {
        self.script.open_error = Some(error);
        self
    }

    pub fn failing_claim(mut self, error: rusb::Error) -> Self {
        self.script.claim_error = Some(error);
        self
    }

    pub fn state(&self) -> Arc<MockState> {
        self.state.clone()
    }
}

impl UsbDevice for MockDevice {
    type Handle = MockHandle;

    fn location(&self) -> rusb::Result<UsbLocation> {
        Ok(self.location)
    }

    fn open(&self) -> rusb::Result<MockHandle> {
        if let Some(error) = self.script.open_error {
            return Err(error);
        }
        self.state.opens.fetch_add(1, Ordering::AcqRel);
        Ok(MockHandle {
            script: self.script.clone(),
            state: self.state.clone(),
        })
    }

    fn endpoints(&self) -> rusb::Result<Endpoints> {
        self.script.endpoints.ok_or(rusb::Error::NotFound)
    }
}

/// Handle to a [`MockDevice`]; counts as closed when dropped
#[derive(Debug)]
pub struct MockHandle {
    script: Script,
    state: Arc<MockState>,
}

impl MockHandle {
    fn record(&self, request_type: u8, request: u8, value: u16, index: u16, data: &[u8]) {
        lock(&self.state.controls).push(ControlTransfer {
            request_type,
            request,
            value,
            index,
            data: data.to_vec(),
        });
    }
}

impl AccessoryHandle for MockHandle {
    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        if let Some(error) = self.script.claim_error {
            return Err(error);
        }
        lock(&self.state.claimed).push(interface);
        Ok(())
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        self.record(request_type, request, value, index, &[]);
        let version = self.script.protocol?;
        let reply = version.to_le_bytes();
        let len = reply.len().min(buf.len());
        buf[..len].copy_from_slice(&reply[..len]);
        Ok(len)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        if request == REQUEST_SEND_STRING
            && self.script.failing_string.map(|i| i as u16) == Some(index)
        {
            return Err(rusb::Error::Io);
        }
        if request != REQUEST_SEND_STRING && self.script.fail_start {
            return Err(rusb::Error::Io);
        }
        self.record(request_type, request, value, index, buf);
        Ok(buf.len())
    }

    fn read_bulk(&self, _endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        if self.state.disconnected.load(Ordering::Acquire) {
            return Err(rusb::Error::NoDevice);
        }

        let next = lock(&self.state.reads).pop_front();
        match next {
            Some(Ok(packet)) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
            Some(Err(error)) => Err(error),
            None => {
                std::thread::sleep(timeout.min(MAX_IDLE));
                Err(rusb::Error::Timeout)
            }
        }
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], _timeout: Duration) -> rusb::Result<usize> {
        if self.state.disconnected.load(Ordering::Acquire) {
            return Err(rusb::Error::NoDevice);
        }
        if let Some(error) = *lock(&self.state.write_error) {
            return Err(error);
        }
        lock(&self.state.bulk_writes).push((endpoint, buf.to_vec()));
        Ok(buf.len())
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.state.closes.fetch_add(1, Ordering::AcqRel);
    }
}
