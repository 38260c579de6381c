/* rivi (c) by Nao Pross <np@0hm.ch>
 *
 *
 * rivi is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! USB Test and Measurement Class (USBTMC) transport

pub mod header;
pub mod resource;

use std::marker::PhantomData;
use std::thread::sleep;
use std::time::Duration;

use rusb::UsbContext;
use thiserror::Error;
use tracing::{debug, warn};

use header::{BTag, BulkInHeader, InTransfer, HEADER_SIZE};
pub use resource::VisaResource;

const USBTMC_BINTERFACE_CLASS: u8 = 0xfe;
const USBTMC_BINTERFACE_SUBCLASS: u8 = 3;
const USBTMC_BINTERFACE_PROTOCOL: u8 = 0;
const USB488_BINTERFACE_PROTOCOL: u8 = 1;

/// Largest payload sent in a single DEV_DEP_MSG_OUT transfer
const MAX_TRANSFER_SIZE: usize = 1024 * 1024;
/// Payload size requested by each REQUEST_DEV_DEP_MSG_IN
const READ_TRANSFER_SIZE: usize = 64 * 1024;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/* control values */

/// USBTMC bRequest Values
#[repr(u8)]
#[derive(Clone, Copy, Debug)]
enum Request {
    InitiateAbortBulkOut = 1,
    CheckAbortBulkOutStatus = 2,
    InitiateAbortBulkIn = 3,
    CheckAbortBulkInStatus = 4,
    InitiateClear = 5,
    CheckClearStatus = 6,
    GetCapabilities = 7,
    IndicatorPulse = 64,
}

/// USBTMC Status values
#[repr(u8)]
#[allow(dead_code)]
enum Status {
    Success = 0x01,
    Pending = 0x02,
    Failed = 0x80,
    TransferNotInProgress = 0x81,
    SplitNotInProgress = 0x82,
    SplitInProgress = 0x83,
}

fn check_status(status: u8) -> Result<(), Error> {
    if status == Status::Success as u8 {
        Ok(())
    } else {
        Err(Error::Request(status))
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("error on low level USB: {0}")]
    Rusb(#[from] rusb::Error),
    #[error("device not found")]
    DeviceNotFound,
    #[error("not a usbtmc device")]
    NotUsbtmcDevice,
    #[error("request failed with status {0:#04x}")]
    Request(u8),
    #[error("device does not support the request type")]
    NotSupported,
    #[error("invalid VISA resource string {0:?}")]
    InvalidResource(String),
    #[error("malformed bulk header: {0}")]
    MalformedHeader(&'static str),
    #[error("bTag mismatch: expected {expected}, found {found}")]
    BTagMismatch { expected: u8, found: u8 },
    #[error("decoding error (utf-8)")]
    Decoding(#[from] std::string::FromUtf8Error),
}

/* instruments */

/// USB488 subclass capabilities
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Usb488Capabilities {
    /* version number (in BCD) */
    pub bcd_usb488: u16,
    /// The interface is a 488.2 interface
    pub usb488_2: bool,
    /// The interface accepts REN_CONTROL, GO_TO_LOCAL and LOCAL_LOCKOUT
    pub ren_control: bool,
    /// The interface accepts the TRIGGER message
    pub trigger: bool,
    /// The device understands all mandatory SCPI commands
    pub scpi: bool,
    pub sr1: bool,
    pub rl1: bool,
    pub dt1: bool,
}

/// Capabilities of the USBTMC Devices
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /* version number (in BCD) */
    pub bcd_usbtmc: u16,
    /* interface capabilities */
    /// The device has an indicator for identification purposes
    pub pulse: bool,
    /// The interface is talk-only if it is not capable of processing any Bulk-OUT USBTMC
    /// device dependent message data bytes.
    pub talk_only: bool,
    /// The interface is it is not capable of sending Bulk-IN USBTMC device dependent
    /// message data bytes
    pub listen_only: bool,
    /* device capabilities */
    /// The device supports ending a Bulk-IN transfer from this USBTMC interface when a
    /// byte matches a specified TermChar.
    pub term_char: bool,
    /// Present when the interface implements the USB488 subclass
    pub usb488: Option<Usb488Capabilities>,
}

impl Capabilities {
    /// Decode a GET_CAPABILITIES response
    pub fn decode(buf: &[u8], usb488: bool) -> Result<Capabilities, Error> {
        if buf.is_empty() {
            return Err(Error::MalformedHeader("empty capabilities response"));
        }
        check_status(buf[0])?;

        if buf.len() < 6 || (usb488 && buf.len() < 16) {
            return Err(Error::MalformedHeader("short capabilities response"));
        }

        let usb488 = match usb488 {
            true => Some(Usb488Capabilities {
                bcd_usb488: u16::from_le_bytes([buf[12], buf[13]]),
                usb488_2: (buf[14] & 4) != 0,
                ren_control: (buf[14] & 2) != 0,
                trigger: (buf[14] & 1) != 0,
                scpi: (buf[15] & 8) != 0,
                sr1: (buf[15] & 4) != 0,
                rl1: (buf[15] & 2) != 0,
                dt1: (buf[15] & 1) != 0,
            }),
            false => None,
        };

        Ok(Capabilities {
            bcd_usbtmc: u16::from_le_bytes([buf[2], buf[3]]),
            pulse: (buf[4] & 4) != 0,
            talk_only: (buf[4] & 2) != 0,
            listen_only: (buf[4] & 1) != 0,
            term_char: (buf[5] & 1) != 0,
            usb488,
        })
    }
}

/// Summary of an attached USBTMC instrument
#[derive(Clone, Debug)]
pub struct InstrumentInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub resource: VisaResource,
}

/// Maps the 0 (silent) to 4 (verbose) debug level onto libusb's log levels
fn log_level(level: u8) -> rusb::LogLevel {
    match level {
        0 => rusb::LogLevel::None,
        1 => rusb::LogLevel::Error,
        2 => rusb::LogLevel::Warning,
        3 => rusb::LogLevel::Info,
        _ => rusb::LogLevel::Debug,
    }
}

/// Owner of the libusb session, every `Device` borrows from it
pub struct Context {
    inner: rusb::Context,
}

impl Context {
    pub fn new() -> Result<Context, Error> {
        let inner = rusb::Context::new()?;
        debug!("created usb context");
        Ok(Context { inner })
    }

    /// Set the libusb debug level, from 0 (none) to 4 (debug)
    pub fn set_debug_level(&mut self, level: u8) {
        debug!(level, "setting libusb debug level");
        self.inner.set_log_level(log_level(level));
    }

    /// Opens the instrument addressed by a VISA resource string such as
    /// `USB0::2391::1031::MY44035849::INSTR`
    pub fn new_device(&self, resource: &str) -> Result<Device<'_>, Error> {
        let resource: VisaResource = resource.parse()?;
        Device::open(self, &resource)
    }

    /// Get a list of connected instruments
    pub fn instruments(&self) -> Result<Vec<InstrumentInfo>, Error> {
        let mut instruments = Vec::new();

        for device in self.inner.devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(e) => {
                    debug!(error = %e, "failed to get descriptor");
                    continue;
                }
            };

            let iface = match find_interface(&device, &desc, None) {
                Some(iface) => iface,
                None => continue,
            };

            let (manufacturer, product, serial) = match device.open() {
                Ok(handle) => (
                    handle.read_manufacturer_string_ascii(&desc).ok(),
                    handle.read_product_string_ascii(&desc).ok(),
                    handle.read_serial_number_string_ascii(&desc).ok(),
                ),
                Err(e) => {
                    debug!(error = %e, "failed to get handle");
                    (None, None, None)
                }
            };

            let mut resource =
                VisaResource::new(desc.vendor_id(), desc.product_id(), serial.clone());
            if resource.serial.is_some() {
                resource.interface = Some(iface.iface_num);
            }

            instruments.push(InstrumentInfo {
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                manufacturer,
                product,
                serial,
                resource,
            });
        }

        Ok(instruments)
    }

    /// Releases the libusb session
    pub fn close(self) {
        debug!("closing usb context");
    }
}

/// Location of a USBTMC interface within a device
#[derive(Clone, Copy, Debug)]
struct UsbtmcInterface {
    config_num: u8,
    iface_num: u8,
    setting: u8,
    usb488: bool,
    ep_bulk_in: u8,
    ep_bulk_out: u8,
    ep_interrupt_in: Option<u8>,
}

/// Searches for the USBTMC interface of the device
///
/// It loops through the available usb interfaces and uses the first that
/// matches the USBTMC class and subclass, or the one numbered `wanted`
fn find_interface<C: UsbContext>(
    device: &rusb::Device<C>,
    desc: &rusb::DeviceDescriptor,
    wanted: Option<u8>,
) -> Option<UsbtmcInterface> {
    for cfg_desc in (0..desc.num_configurations())
        .map(|num| device.config_descriptor(num))
        .filter_map(|cfg_desc| cfg_desc.ok())
    {
        for iface_desc in cfg_desc.interfaces().flat_map(|iface| iface.descriptors()) {
            if iface_desc.class_code() != USBTMC_BINTERFACE_CLASS
                || iface_desc.sub_class_code() != USBTMC_BINTERFACE_SUBCLASS
            {
                continue;
            }

            let protocol = iface_desc.protocol_code();
            if protocol != USBTMC_BINTERFACE_PROTOCOL && protocol != USB488_BINTERFACE_PROTOCOL {
                continue;
            }

            if matches!(wanted, Some(num) if num != iface_desc.interface_number()) {
                continue;
            }

            let mut ep_bulk_in = None;
            let mut ep_bulk_out = None;
            let mut ep_interrupt_in = None;

            for ep_desc in iface_desc.endpoint_descriptors() {
                match (ep_desc.transfer_type(), ep_desc.direction()) {
                    (rusb::TransferType::Bulk, rusb::Direction::Out) => {
                        ep_bulk_out = Some(ep_desc.address())
                    }
                    (rusb::TransferType::Bulk, rusb::Direction::In) => {
                        ep_bulk_in = Some(ep_desc.address())
                    }
                    (rusb::TransferType::Interrupt, rusb::Direction::In) => {
                        ep_interrupt_in = Some(ep_desc.address())
                    }
                    // not interested in other cases
                    _ => {}
                }
            }

            if let (Some(ep_bulk_in), Some(ep_bulk_out)) = (ep_bulk_in, ep_bulk_out) {
                return Some(UsbtmcInterface {
                    config_num: cfg_desc.number(),
                    iface_num: iface_desc.interface_number(),
                    setting: iface_desc.setting_number(),
                    usb488: protocol == USB488_BINTERFACE_PROTOCOL,
                    ep_bulk_in,
                    ep_bulk_out,
                    ep_interrupt_in,
                });
            }
        }
    }

    None
}

/// Opens the first device matching the vendor, product and (if given)
/// serial number of the resource
fn find_device(
    context: &rusb::Context,
    resource: &VisaResource,
) -> Result<(rusb::DeviceHandle<rusb::Context>, rusb::DeviceDescriptor), Error> {
    let mut last_error = None;

    for device in context.devices()?.iter() {
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, "failed to get descriptor");
                continue;
            }
        };

        if desc.vendor_id() != resource.vendor_id || desc.product_id() != resource.product_id {
            continue;
        }

        let handle = match device.open() {
            Ok(handle) => handle,
            Err(e) => {
                debug!(error = %e, "failed to get device handle");
                last_error = Some(e);
                continue;
            }
        };

        match &resource.serial {
            None => return Ok((handle, desc)),
            Some(wanted) => match handle.read_serial_number_string_ascii(&desc) {
                Ok(serial) if serial.trim() == wanted => return Ok((handle, desc)),
                Ok(serial) => debug!(%serial, "serial number does not match"),
                Err(e) => {
                    debug!(error = %e, "failed to read serial number");
                    last_error = Some(e);
                }
            },
        }
    }

    Err(last_error.map_or(Error::DeviceNotFound, Error::Rusb))
}

/// Decodes a bulk-in header. When it is unusable `abort` runs with the
/// requested tag so the device drops the rest of the transfer.
fn decode_or_abort<F>(bytes: &[u8], btag: u8, abort: F) -> Result<BulkInHeader, Error>
where
    F: FnOnce(u8) -> Result<(), Error>,
{
    BulkInHeader::decode(bytes, btag).map_err(|e| {
        warn!(error = %e, btag, "bad bulk-in header");
        if let Err(abort) = abort(btag) {
            warn!(error = %abort, "failed to abort bulk in");
        }
        e
    })
}

/// Handle operations needed to take over an interface from the kernel
trait InterfaceSetup {
    fn kernel_driver_active(&self, iface: u8) -> rusb::Result<bool>;
    fn detach_kernel_driver(&mut self, iface: u8) -> rusb::Result<()>;
    fn attach_kernel_driver(&mut self, iface: u8) -> rusb::Result<()>;
    fn active_configuration(&self) -> rusb::Result<u8>;
    fn set_active_configuration(&mut self, config: u8) -> rusb::Result<()>;
    fn claim_interface(&mut self, iface: u8) -> rusb::Result<()>;
}

impl<C: UsbContext> InterfaceSetup for rusb::DeviceHandle<C> {
    fn kernel_driver_active(&self, iface: u8) -> rusb::Result<bool> {
        rusb::DeviceHandle::kernel_driver_active(self, iface)
    }

    fn detach_kernel_driver(&mut self, iface: u8) -> rusb::Result<()> {
        rusb::DeviceHandle::detach_kernel_driver(self, iface)
    }

    fn attach_kernel_driver(&mut self, iface: u8) -> rusb::Result<()> {
        rusb::DeviceHandle::attach_kernel_driver(self, iface)
    }

    fn active_configuration(&self) -> rusb::Result<u8> {
        rusb::DeviceHandle::active_configuration(self)
    }

    fn set_active_configuration(&mut self, config: u8) -> rusb::Result<()> {
        rusb::DeviceHandle::set_active_configuration(self, config)
    }

    fn claim_interface(&mut self, iface: u8) -> rusb::Result<()> {
        rusb::DeviceHandle::claim_interface(self, iface)
    }
}

fn configure_and_claim<H: InterfaceSetup>(
    handle: &mut H,
    config_num: u8,
    iface_num: u8,
) -> rusb::Result<()> {
    // set configuration if not correct
    if handle.active_configuration() != Ok(config_num) {
        handle.set_active_configuration(config_num)?;
        debug!(config = config_num, "set configuration");
    }
    handle.claim_interface(iface_num)
}

/// Detaches the kernel driver if necessary, selects the configuration and
/// claims the interface. Returns whether a kernel driver was detached.
///
/// When a step after the detach fails the kernel driver is attached again.
fn claim<H: InterfaceSetup>(handle: &mut H, config_num: u8, iface_num: u8) -> Result<bool, Error> {
    let has_kernel_driver = match handle.kernel_driver_active(iface_num) {
        Ok(true) => {
            handle.detach_kernel_driver(iface_num)?;
            debug!(interface = iface_num, "detached kernel driver");
            true
        }
        _ => false,
    };

    if let Err(e) = configure_and_claim(handle, config_num, iface_num) {
        if has_kernel_driver {
            if let Err(attach) = handle.attach_kernel_driver(iface_num) {
                warn!(error = %attach, "failed to attach kernel driver");
            }
        }
        return Err(Error::Rusb(e));
    }

    Ok(has_kernel_driver)
}

/// One claimed USBTMC interface of an instrument
pub struct Device<'ctx> {
    handle: rusb::DeviceHandle<rusb::Context>,
    // usbtmc capabilites
    capabilities: Option<Capabilities>,
    // for linux kernel
    has_kernel_driver: bool,
    // addresses in the usb device
    config_num: u8,
    iface_num: u8,
    usb488: bool,
    ep_bulk_in: u8,
    ep_bulk_out: u8,
    ep_interrupt_in: Option<u8>,
    // btag number to keep track of packet parts
    btag: BTag,
    timeout: Duration,
    term_char: Option<u8>,
    released: bool,
    _context: PhantomData<&'ctx Context>,
}

impl<'ctx> Device<'ctx> {
    fn open(context: &'ctx Context, resource: &VisaResource) -> Result<Device<'ctx>, Error> {
        let (mut handle, desc) = find_device(&context.inner, resource)?;
        let device = handle.device();

        let iface = find_interface(&device, &desc, resource.interface)
            .ok_or(Error::NotUsbtmcDevice)?;
        debug!(?iface, "found usbtmc interface");

        let has_kernel_driver = claim(&mut handle, iface.config_num, iface.iface_num)?;

        // from here on Drop releases the interface
        let mut dev = Device {
            handle,
            capabilities: None,
            has_kernel_driver,
            config_num: iface.config_num,
            iface_num: iface.iface_num,
            usb488: iface.usb488,
            ep_bulk_in: iface.ep_bulk_in,
            ep_bulk_out: iface.ep_bulk_out,
            ep_interrupt_in: iface.ep_interrupt_in,
            btag: BTag::new(),
            timeout: DEFAULT_TIMEOUT,
            term_char: None,
            released: false,
            _context: PhantomData,
        };

        if iface.setting != 0 {
            dev.handle
                .set_alternate_setting(iface.iface_num, iface.setting)?;
        }

        dev.clear()?;
        dev.capabilities()?;

        debug!(%resource, "opened usbtmc device");
        Ok(dev)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn term_char(&self) -> Option<u8> {
        self.term_char
    }

    /// Ask the device to end Bulk-IN transfers on `term_char`
    pub fn set_term_char(&mut self, term_char: Option<u8>) -> Result<(), Error> {
        if term_char.is_some() && !self.capabilities()?.term_char {
            return Err(Error::NotSupported);
        }
        self.term_char = term_char;
        Ok(())
    }

    fn control_in(
        &self,
        request: Request,
        value: u16,
        index: u16,
        recipient: rusb::Recipient,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let len = self.handle.read_control(
            rusb::request_type(rusb::Direction::In, rusb::RequestType::Class, recipient),
            request as u8,
            value,
            index,
            buf,
            self.timeout,
        )?;
        Ok(len)
    }

    /// Sends a clear request and waits for it to complete
    pub fn clear(&mut self) -> Result<(), Error> {
        let index = u16::from(self.iface_num);

        let mut buf = [0_u8; 1];
        self.control_in(
            Request::InitiateClear,
            0x0000,
            index,
            rusb::Recipient::Interface,
            &mut buf,
        )?;
        check_status(buf[0])?;

        // wait for completion of clear
        loop {
            let mut buf = [0_u8; 2];
            self.control_in(
                Request::CheckClearStatus,
                0x0000,
                index,
                rusb::Recipient::Interface,
                &mut buf,
            )?;

            if buf[0] != Status::Pending as u8 {
                check_status(buf[0])?;
                break;
            }

            // bmClear: the device still holds data to be drained
            if buf[1] & 0x01 != 0 {
                self.drain_bulk_in();
            }

            sleep(POLL_INTERVAL);
        }

        self.handle.clear_halt(self.ep_bulk_out)?;
        debug!("device cleared");
        Ok(())
    }

    /// Ask the device which features are supported
    pub fn capabilities(&mut self) -> Result<Capabilities, Error> {
        if let Some(capabilities) = &self.capabilities {
            return Ok(capabilities.clone());
        }

        let mut buf = [0_u8; 0x18];
        let len = self.control_in(
            Request::GetCapabilities,
            0x0000,
            self.iface_num.into(),
            rusb::Recipient::Interface,
            &mut buf,
        )?;

        let capabilities = Capabilities::decode(&buf[..len], self.usb488)?;
        debug!(?capabilities, "read capabilities");

        self.capabilities = Some(capabilities.clone());
        Ok(capabilities)
    }

    /// Blink the identification indicator of the device
    pub fn pulse(&mut self) -> Result<(), Error> {
        if !self.capabilities()?.pulse {
            return Err(Error::NotSupported);
        }

        let mut buf = [0_u8; 1];
        self.control_in(
            Request::IndicatorPulse,
            0x0000,
            self.iface_num.into(),
            rusb::Recipient::Interface,
            &mut buf,
        )?;
        check_status(buf[0])
    }

    /// Write a string to the instrument
    pub fn write(&mut self, message: &str) -> Result<usize, Error> {
        self.write_raw(message.as_bytes())
    }

    /// Write binary data to the instrument, returns the number of payload
    /// bytes sent
    ///
    /// An empty slice is sent as a single zero-length message.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<usize, Error> {
        let mut sent_bytes = 0;

        for (chunk, is_last) in header::split_message(data, MAX_TRANSFER_SIZE) {
            let btag = self.btag.next();
            let packet = header::encode_dev_dep_msg_out(btag, chunk, is_last);

            if let Err(e) = self
                .handle
                .write_bulk(self.ep_bulk_out, &packet, self.timeout)
            {
                warn!(error = %e, btag, "failed to send chunk during bulk out");
                if let Err(abort) = self.abort_bulk_out(btag) {
                    warn!(error = %abort, "failed to abort bulk out");
                }
                return Err(Error::Rusb(e));
            }

            sent_bytes += chunk.len();
        }

        Ok(sent_bytes)
    }

    /// Abort a bulk-out operation
    fn abort_bulk_out(&mut self, btag: u8) -> Result<(), Error> {
        let endpoint = u16::from(self.ep_bulk_out);

        let mut buf = [0_u8; 2];
        self.control_in(
            Request::InitiateAbortBulkOut,
            btag.into(),
            endpoint,
            rusb::Recipient::Endpoint,
            &mut buf,
        )?;

        if buf[0] != Status::Success as u8 {
            debug!(status = buf[0], "no bulk-out transfer to abort");
            return Ok(());
        }

        loop {
            let mut buf = [0_u8; 8];
            self.control_in(
                Request::CheckAbortBulkOutStatus,
                0x0000,
                endpoint,
                rusb::Recipient::Endpoint,
                &mut buf,
            )?;

            if buf[0] != Status::Pending as u8 {
                break;
            }
            sleep(POLL_INTERVAL);
        }

        self.handle.clear_halt(self.ep_bulk_out)?;
        Ok(())
    }

    /// Abort a bulk-in operation
    fn abort_bulk_in(&mut self, btag: u8) -> Result<(), Error> {
        let endpoint = u16::from(self.ep_bulk_in);

        let mut buf = [0_u8; 2];
        self.control_in(
            Request::InitiateAbortBulkIn,
            btag.into(),
            endpoint,
            rusb::Recipient::Endpoint,
            &mut buf,
        )?;

        if buf[0] != Status::Success as u8 {
            debug!(status = buf[0], "no bulk-in transfer to abort");
            return Ok(());
        }

        loop {
            self.drain_bulk_in();

            let mut buf = [0_u8; 8];
            self.control_in(
                Request::CheckAbortBulkInStatus,
                0x0000,
                endpoint,
                rusb::Recipient::Endpoint,
                &mut buf,
            )?;

            if buf[0] != Status::Pending as u8 {
                break;
            }
            sleep(POLL_INTERVAL);
        }

        Ok(())
    }

    fn drain_bulk_in(&self) {
        let mut buf = vec![0_u8; HEADER_SIZE + READ_TRANSFER_SIZE];
        if let Err(e) = self
            .handle
            .read_bulk(self.ep_bulk_in, &mut buf, self.timeout)
        {
            debug!(error = %e, "nothing left to drain on bulk in");
        }
    }

    /// Read binary data from the device and decode into an utf-8 string
    pub fn read(&mut self) -> Result<String, Error> {
        let data = self.read_raw()?;
        Ok(String::from_utf8(data)?)
    }

    /// Read binary data from the device until the end of message
    pub fn read_raw(&mut self) -> Result<Vec<u8>, Error> {
        let term_char = match &self.capabilities {
            Some(c) if c.term_char => self.term_char,
            _ => None,
        };

        let mut message = Vec::new();
        let mut buf = vec![0_u8; HEADER_SIZE + READ_TRANSFER_SIZE + 3];

        loop {
            let btag = self.btag.next();
            let request =
                header::encode_request_dev_dep_msg_in(btag, READ_TRANSFER_SIZE as u32, term_char);

            if let Err(e) = self
                .handle
                .write_bulk(self.ep_bulk_out, &request, self.timeout)
            {
                warn!(error = %e, btag, "failed to request bulk in");
                if let Err(abort) = self.abort_bulk_out(btag) {
                    warn!(error = %abort, "failed to abort bulk out");
                }
                return Err(Error::Rusb(e));
            }

            let received = match self.handle.read_bulk(self.ep_bulk_in, &mut buf, self.timeout) {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, btag, "failed to read during bulk in");
                    if let Err(abort) = self.abort_bulk_in(btag) {
                        warn!(error = %abort, "failed to abort bulk in");
                    }
                    return Err(Error::Rusb(e));
                }
            };

            let header = decode_or_abort(&buf[..received], btag, |tag| self.abort_bulk_in(tag))?;

            let mut transfer = InTransfer::new(header, &buf[HEADER_SIZE..received]);
            // the transfer may span more than one bulk read
            while !transfer.is_complete() {
                let n = self.handle.read_bulk(self.ep_bulk_in, &mut buf, self.timeout)?;
                if n == 0 {
                    break;
                }
                transfer.extend(&buf[..n]);
            }

            let done = transfer.ends_message();
            message.extend_from_slice(&transfer.into_payload());
            if done {
                break;
            }
        }

        Ok(message)
    }

    /// Write a message and read back the response
    pub fn query(&mut self, message: &str) -> Result<String, Error> {
        self.write(message)?;
        self.read()
    }

    fn release(&mut self) -> Result<(), Error> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let result = self.handle.release_interface(self.iface_num);

        if self.has_kernel_driver {
            if let Err(e) = self.handle.attach_kernel_driver(self.iface_num) {
                warn!(error = %e, "failed to attach kernel driver");
            }
        }

        debug!(interface = self.iface_num, "released usbtmc interface");
        result.map_err(Error::Rusb)
    }

    /// Closes the device, releasing the interface
    pub fn close(mut self) -> Result<(), Error> {
        self.release()
    }
}

impl Drop for Device<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "failed to release interface");
        }
    }
}

impl std::fmt::Debug for Device<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("capabilities", &self.capabilities)
            .field("has_kernel_driver", &self.has_kernel_driver)
            .field("config_num", &self.config_num)
            .field("iface_num", &self.iface_num)
            .field("ep_bulk_in", &self.ep_bulk_in)
            .field("ep_bulk_out", &self.ep_bulk_out)
            .field("ep_interrupt_in", &self.ep_interrupt_in)
            .field("timeout", &self.timeout)
            .finish()
    }
}
