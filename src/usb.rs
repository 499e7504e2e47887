//! USB access to the IR camera via libusb
//!
//! The camera exposes a UVC video-control interface and a video-streaming
//! interface with a single bulk IN endpoint. This module:
//!
//! 1. opens the device by VID/PID and claims both interfaces, detaching any
//!    kernel driver first
//! 2. runs the UVC probe/commit exchange to start streaming and learn the
//!    negotiated frame size
//! 3. serves bulk packets through [`PacketSource`]
//!
//! Everything is released in reverse order when [`UsbDevice`] is dropped.

use std::ptr;
use std::time::Duration;

use thiserror::Error;

use crate::transport::{PacketSource, TransportError};

/// USB vendor ID of the camera.
pub const VENDOR_ID: u16 = 0x2104;
/// USB product ID of the camera.
pub const PRODUCT_ID: u16 = 0x0313;
/// Video-control interface.
pub const IF_VIDEO_CONTROL: i32 = 1;
/// Video-streaming interface.
pub const IF_VIDEO_STREAM: i32 = 2;
/// Bulk IN endpoint carrying the stream.
pub const EP_BULK_IN: u8 = 0x82;

/// Timeout for class control requests.
const CONTROL_TIMEOUT_MS: u32 = 2000;

/// libusb error codes
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LibusbError {
    /// Input/output error
    #[error("I/O error")]
    IoError = -1,
    /// Invalid parameter
    #[error("Invalid parameter")]
    InvalidParam = -2,
    /// Access denied (insufficient permissions)
    #[error("Access denied")]
    Access = -3,
    /// No such device (it may have been disconnected)
    #[error("No such device")]
    NoDevice = -4,
    /// Entity not found
    #[error("Entity not found")]
    NotFound = -5,
    /// Resource busy
    #[error("Resource busy")]
    Busy = -6,
    /// Operation timed out
    #[error("Operation timed out")]
    Timeout = -7,
    /// Overflow
    #[error("Overflow")]
    Overflow = -8,
    /// Pipe error
    #[error("Pipe error")]
    Pipe = -9,
    /// System call interrupted
    #[error("System call interrupted")]
    Interrupted = -10,
    /// Insufficient memory
    #[error("Insufficient memory")]
    NoMem = -11,
    /// Operation not supported on this platform
    #[error("Operation not supported")]
    NotSupported = -12,
    /// Any other code
    #[error("Other error")]
    Other = -99,
}

impl From<i32> for LibusbError {
    fn from(code: i32) -> Self {
        match code {
            -1 => LibusbError::IoError,
            -2 => LibusbError::InvalidParam,
            -3 => LibusbError::Access,
            -4 => LibusbError::NoDevice,
            -5 => LibusbError::NotFound,
            -6 => LibusbError::Busy,
            -7 => LibusbError::Timeout,
            -8 => LibusbError::Overflow,
            -9 => LibusbError::Pipe,
            -10 => LibusbError::Interrupted,
            -11 => LibusbError::NoMem,
            -12 => LibusbError::NotSupported,
            _ => LibusbError::Other,
        }
    }
}

impl From<LibusbError> for TransportError {
    fn from(err: LibusbError) -> Self {
        match err {
            LibusbError::Timeout => TransportError::Timeout,
            LibusbError::Overflow => TransportError::Overflow,
            other => TransportError::Fatal(other.to_string()),
        }
    }
}

/// Errors from device setup and negotiation
#[derive(Error, Debug)]
pub enum UsbError {
    /// libusb could not be initialised.
    #[error("libusb init failed: {0}")]
    Init(LibusbError),

    /// The camera is not connected or not accessible.
    #[error("cannot open device {vendor_id:04x}:{product_id:04x} (missing or no permission)")]
    DeviceNotFound {
        /// Requested vendor ID.
        vendor_id: u16,
        /// Requested product ID.
        product_id: u16,
    },

    /// Claiming an interface failed.
    #[error("cannot claim interface {interface}: {source}")]
    Claim {
        /// Interface number.
        interface: i32,
        /// Underlying error.
        source: LibusbError,
    },

    /// A UVC class request failed.
    #[error("UVC {request} failed: {source}")]
    Control {
        /// Which step of the exchange.
        request: &'static str,
        /// Underlying error.
        source: LibusbError,
    },
}

/// UVC Video Class constants
pub mod uvc {
    /// Set current value
    pub const UVC_SET_CUR: u8 = 0x01;
    /// Get current value
    pub const UVC_GET_CUR: u8 = 0x81;
    /// Get maximum value
    pub const UVC_GET_MAX: u8 = 0x83;

    /// Probe control selector
    pub const UVC_VS_PROBE_CONTROL: u8 = 0x01;
    /// Commit control selector
    pub const UVC_VS_COMMIT_CONTROL: u8 = 0x02;

    /// Class request to an interface, host to device
    pub const REQUEST_TYPE_OUT: u8 = 0x21;
    /// Class request to an interface, device to host
    pub const REQUEST_TYPE_IN: u8 = 0xA1;
}

/// Size of the UVC 1.1 probe/commit block.
pub const STREAM_CONTROL_LEN: usize = 26;

/// UVC Probe/Commit control block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UvcStreamControl {
    /// Which fields the device must keep fixed
    pub bm_hint: u16,
    /// Format descriptor index
    pub b_format_index: u8,
    /// Frame descriptor index
    pub b_frame_index: u8,
    /// Frame interval in 100 ns units
    pub dw_frame_interval: u32,
    /// Key frame rate
    pub w_key_frame_rate: u16,
    /// P frame rate
    pub w_p_frame_rate: u16,
    /// Compression quality
    pub w_comp_quality: u16,
    /// Compression window size
    pub w_comp_window_size: u16,
    /// Internal latency in ms
    pub w_delay: u16,
    /// Largest frame the device will send
    pub dw_max_video_frame_size: u32,
    /// Largest single payload transfer
    pub dw_max_payload_transfer_size: u32,
}

impl UvcStreamControl {
    /// Probe request sent by this viewer.
    pub fn viewer_probe() -> Self {
        Self {
            bm_hint: 0x0001,
            b_format_index: 1,
            b_frame_index: 1,
            dw_frame_interval: 416_667,
            ..Self::default()
        }
    }

    /// Encode as the little-endian wire block.
    pub fn to_bytes(&self) -> [u8; STREAM_CONTROL_LEN] {
        let mut out = [0u8; STREAM_CONTROL_LEN];
        out[0..2].copy_from_slice(&self.bm_hint.to_le_bytes());
        out[2] = self.b_format_index;
        out[3] = self.b_frame_index;
        out[4..8].copy_from_slice(&self.dw_frame_interval.to_le_bytes());
        out[8..10].copy_from_slice(&self.w_key_frame_rate.to_le_bytes());
        out[10..12].copy_from_slice(&self.w_p_frame_rate.to_le_bytes());
        out[12..14].copy_from_slice(&self.w_comp_quality.to_le_bytes());
        out[14..16].copy_from_slice(&self.w_comp_window_size.to_le_bytes());
        out[16..18].copy_from_slice(&self.w_delay.to_le_bytes());
        out[18..22].copy_from_slice(&self.dw_max_video_frame_size.to_le_bytes());
        out[22..26].copy_from_slice(&self.dw_max_payload_transfer_size.to_le_bytes());
        out
    }

    /// Decode a block; missing trailing bytes read as zero.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut raw = [0u8; STREAM_CONTROL_LEN];
        let n = bytes.len().min(STREAM_CONTROL_LEN);
        raw[..n].copy_from_slice(&bytes[..n]);

        let u16_at = |i: usize| u16::from_le_bytes([raw[i], raw[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);

        Self {
            bm_hint: u16_at(0),
            b_format_index: raw[2],
            b_frame_index: raw[3],
            dw_frame_interval: u32_at(4),
            w_key_frame_rate: u16_at(8),
            w_p_frame_rate: u16_at(10),
            w_comp_quality: u16_at(12),
            w_comp_window_size: u16_at(14),
            w_delay: u16_at(16),
            dw_max_video_frame_size: u32_at(18),
            dw_max_payload_transfer_size: u32_at(22),
        }
    }
}

/// Class control requests on an interface
pub trait ControlChannel {
    /// Issue a UVC class request on `interface`.
    ///
    /// The direction follows the request code's high bit. Returns the number
    /// of bytes transferred.
    ///
    /// # Errors
    ///
    /// Returns the libusb error code of a failed transfer.
    fn uvc_request(
        &mut self,
        request: u8,
        selector: u8,
        interface: i32,
        data: &mut [u8],
    ) -> Result<usize, LibusbError>;
}

/// Run the probe/commit exchange on the streaming interface.
///
/// GET_MAX is informational only. The negotiated block (GET_CUR after the
/// probe) is committed back and returned; its `dw_max_video_frame_size` is
/// the target for frame accumulation. If GET_CUR fails the zeroed block is
/// committed, as the device accepts that too.
///
/// # Errors
///
/// Returns `UsbError::Control` when the probe SET_CUR or the commit fails.
pub fn negotiate<C: ControlChannel + ?Sized>(ctl: &mut C) -> Result<UvcStreamControl, UsbError> {
    let mut block = [0u8; STREAM_CONTROL_LEN];
    if ctl
        .uvc_request(
            uvc::UVC_GET_MAX,
            uvc::UVC_VS_PROBE_CONTROL,
            IF_VIDEO_STREAM,
            &mut block,
        )
        .is_ok()
    {
        let max = UvcStreamControl::from_bytes(&block);
        log::info!(
            "UVC GET_MAX: fmt={} frm={} interval={} maxframe={} maxpayload={}",
            max.b_format_index,
            max.b_frame_index,
            max.dw_frame_interval,
            max.dw_max_video_frame_size,
            max.dw_max_payload_transfer_size
        );
    }

    let mut probe = UvcStreamControl::viewer_probe().to_bytes();
    ctl.uvc_request(
        uvc::UVC_SET_CUR,
        uvc::UVC_VS_PROBE_CONTROL,
        IF_VIDEO_STREAM,
        &mut probe,
    )
    .map_err(|source| UsbError::Control {
        request: "probe SET_CUR",
        source,
    })?;

    let mut current = [0u8; STREAM_CONTROL_LEN];
    let negotiated = match ctl.uvc_request(
        uvc::UVC_GET_CUR,
        uvc::UVC_VS_PROBE_CONTROL,
        IF_VIDEO_STREAM,
        &mut current,
    ) {
        Ok(n) => {
            let negotiated = UvcStreamControl::from_bytes(&current[..n.min(STREAM_CONTROL_LEN)]);
            log::info!(
                "UVC negotiated: fmt={} frm={} interval={} maxframe={} payload={}",
                negotiated.b_format_index,
                negotiated.b_frame_index,
                negotiated.dw_frame_interval,
                negotiated.dw_max_video_frame_size,
                negotiated.dw_max_payload_transfer_size
            );
            negotiated
        }
        Err(e) => {
            log::warn!("UVC probe GET_CUR failed: {}", e);
            UvcStreamControl::default()
        }
    };

    let mut commit = negotiated.to_bytes();
    ctl.uvc_request(
        uvc::UVC_SET_CUR,
        uvc::UVC_VS_COMMIT_CONTROL,
        IF_VIDEO_STREAM,
        &mut commit,
    )
    .map_err(|source| UsbError::Control {
        request: "commit SET_CUR",
        source,
    })?;

    log::info!("UVC stream committed, EP 0x{:02X}", EP_BULK_IN);
    Ok(negotiated)
}

/// Open camera handle with claimed interfaces
///
/// Owns the libusb context. Drop releases claimed interfaces, re-attaches
/// detached kernel drivers, closes the handle and exits the context, in
/// that order.
pub struct UsbDevice {
    ctx: *mut libusb1_sys::libusb_context,
    handle: *mut libusb1_sys::libusb_device_handle,
    claimed: Vec<i32>,
    detached: Vec<i32>,
}

impl UsbDevice {
    /// Open the first device matching `vendor_id`/`product_id`.
    ///
    /// # Errors
    ///
    /// Returns `UsbError::Init` if libusb fails to start and
    /// `UsbError::DeviceNotFound` if no accessible device matches.
    pub fn open(vendor_id: u16, product_id: u16) -> Result<Self, UsbError> {
        let mut ctx: *mut libusb1_sys::libusb_context = ptr::null_mut();
        // SAFETY: `ctx` is a valid out-pointer for the new context.
        let ret = unsafe { libusb1_sys::libusb_init(&mut ctx) };
        if ret < 0 {
            log::error!("libusb_init failed: {}", ret);
            return Err(UsbError::Init(LibusbError::from(ret)));
        }

        // SAFETY: `ctx` was initialised above.
        let handle =
            unsafe { libusb1_sys::libusb_open_device_with_vid_pid(ctx, vendor_id, product_id) };
        if handle.is_null() {
            // SAFETY: nothing else references the context yet.
            unsafe { libusb1_sys::libusb_exit(ctx) };
            return Err(UsbError::DeviceNotFound {
                vendor_id,
                product_id,
            });
        }

        log::info!("Opened device {:04x}:{:04x}", vendor_id, product_id);
        Ok(Self {
            ctx,
            handle,
            claimed: Vec::new(),
            detached: Vec::new(),
        })
    }

    /// Open the IR camera.
    ///
    /// # Errors
    ///
    /// See [`UsbDevice::open`].
    pub fn open_camera() -> Result<Self, UsbError> {
        Self::open(VENDOR_ID, PRODUCT_ID)
    }

    /// Detach kernel driver from an interface if one is attached
    fn detach_kernel_driver(&mut self, interface_number: i32) {
        // SAFETY: `self.handle` is open for the lifetime of `self`.
        let active =
            unsafe { libusb1_sys::libusb_kernel_driver_active(self.handle, interface_number) };
        if active == 1 {
            // SAFETY: as above.
            let ret =
                unsafe { libusb1_sys::libusb_detach_kernel_driver(self.handle, interface_number) };
            if ret < 0 {
                log::warn!(
                    "Detaching kernel driver from interface {} failed: {}",
                    interface_number,
                    LibusbError::from(ret)
                );
            } else {
                log::info!("Kernel driver detached from interface {}", interface_number);
                self.detached.push(interface_number);
            }
        } else if active < 0 && active != LibusbError::NotSupported as i32 {
            log::warn!("libusb_kernel_driver_active returned error: {}", active);
        }
    }

    /// Claim an interface on the device, detaching kernel driver if necessary
    ///
    /// # Errors
    ///
    /// Returns `UsbError::Claim` if libusb refuses the claim.
    pub fn claim_interface(&mut self, interface_number: i32) -> Result<(), UsbError> {
        self.detach_kernel_driver(interface_number);

        // SAFETY: `self.handle` is open for the lifetime of `self`.
        let ret = unsafe { libusb1_sys::libusb_claim_interface(self.handle, interface_number) };
        if ret < 0 {
            return Err(UsbError::Claim {
                interface: interface_number,
                source: LibusbError::from(ret),
            });
        }
        self.claimed.push(interface_number);
        log::info!("Claimed interface {}", interface_number);
        Ok(())
    }

    /// Claim the video-control and video-streaming interfaces.
    ///
    /// # Errors
    ///
    /// Returns `UsbError::Claim` for the first interface that fails.
    pub fn claim_streaming_interfaces(&mut self) -> Result<(), UsbError> {
        self.claim_interface(IF_VIDEO_CONTROL)?;
        self.claim_interface(IF_VIDEO_STREAM)
    }

    /// Perform a bulk IN transfer
    ///
    /// # Returns
    /// Number of bytes transferred
    ///
    /// # Errors
    ///
    /// Returns the libusb error code of a failed transfer.
    pub fn bulk_transfer(
        &self,
        endpoint: u8,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, LibusbError> {
        let mut transferred: libc::c_int = 0;
        let len = libc::c_int::try_from(data.len()).unwrap_or(libc::c_int::MAX);
        // SAFETY: `data` is valid for `len` bytes and outlives the call.
        let ret = unsafe {
            libusb1_sys::libusb_bulk_transfer(
                self.handle,
                endpoint,
                data.as_mut_ptr(),
                len,
                &mut transferred,
                timeout_ms,
            )
        };

        if ret < 0 {
            return Err(LibusbError::from(ret));
        }
        Ok(usize::try_from(transferred).unwrap_or(0))
    }
}

impl ControlChannel for UsbDevice {
    fn uvc_request(
        &mut self,
        request: u8,
        selector: u8,
        interface: i32,
        data: &mut [u8],
    ) -> Result<usize, LibusbError> {
        let request_type = if request & 0x80 != 0 {
            uvc::REQUEST_TYPE_IN
        } else {
            uvc::REQUEST_TYPE_OUT
        };
        let len = u16::try_from(data.len()).unwrap_or(u16::MAX);

        // SAFETY: `data` is valid for `len` bytes and outlives the call.
        let ret = unsafe {
            libusb1_sys::libusb_control_transfer(
                self.handle,
                request_type,
                request,
                u16::from(selector) << 8,
                interface as u16,
                data.as_mut_ptr(),
                len,
                CONTROL_TIMEOUT_MS,
            )
        };

        if ret < 0 {
            return Err(LibusbError::from(ret));
        }
        Ok(ret as usize)
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        // SAFETY: handle and context are valid until this point and are not
        // used afterwards.
        unsafe {
            for &interface in self.claimed.iter().rev() {
                libusb1_sys::libusb_release_interface(self.handle, interface);
            }
            for &interface in self.detached.iter().rev() {
                libusb1_sys::libusb_attach_kernel_driver(self.handle, interface);
            }
            libusb1_sys::libusb_close(self.handle);
            libusb1_sys::libusb_exit(self.ctx);
        }
        log::info!("USB device released");
    }
}

/// Bulk endpoint reader
pub struct BulkTransport {
    device: UsbDevice,
    endpoint: u8,
}

impl BulkTransport {
    /// Read from `endpoint` of an opened device.
    pub fn new(device: UsbDevice, endpoint: u8) -> Self {
        Self { device, endpoint }
    }
}

impl PacketSource for BulkTransport {
    fn read_packet(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        self.device
            .bulk_transfer(self.endpoint, buf, timeout_ms)
            .map_err(TransportError::from)
    }
}

/// Open the camera, claim its interfaces and start streaming.
///
/// Negotiation failure is not fatal: raw reads are still attempted and the
/// negotiated frame size is `None`.
///
/// # Errors
///
/// Returns a [`UsbError`] if the device cannot be opened or claimed.
pub fn open_stream() -> Result<(BulkTransport, Option<u32>), UsbError> {
    let mut device = UsbDevice::open_camera()?;
    device.claim_streaming_interfaces()?;

    let negotiated = match negotiate(&mut device) {
        Ok(control) => Some(control.dw_max_video_frame_size).filter(|&size| size > 0),
        Err(e) => {
            log::warn!("UVC negotiation failed ({}), trying raw reads", e);
            None
        }
    };

    Ok((BulkTransport::new(device, EP_BULK_IN), negotiated))
}
