/* PS/2 backend. */
/*  */
/* The bus has no native register addressing: every RMI access is
 * encoded as a stylized run of legacy Set-Resolution / Set-Sample-Rate
 * commands whose parameter bytes carry the address and data. Each host
 * byte must be acknowledged by the device, and intermediate failures
 * are normal; the handshake restarts from a safe point and retries.
 *
 * Register I/O is only possible while the kernel `serio_raw` driver is
 * bound. Switching between `psmouse` (runtime) and `serio_raw`
 * (bootloader) happens through the serio device's `drvctl` sysfs
 * attribute. */

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::error::RmiError;
use crate::io_channel::{IoChannel, IoFlags};
use crate::transport::{
    RMI_DEVICE_BUS_SELECT_REGISTER, RMI_DEVICE_PAGE_SELECT_REGISTER, RmiTransport, TransportFlags,
};

/* Data-port status bytes */
const DATA_PORT_STATUS_ACKNOWLEDGE: u8 = 0xfa;
const DATA_PORT_STATUS_RESEND: u8 = 0xfe;
const DATA_PORT_STATUS_ERROR: u8 = 0xfc;

/* Host-to-device commands */
const EDP_AUX_DISABLE: u8 = 0xf5;
const EDP_AUX_RESET: u8 = 0xff;
const EDP_AUX_SET_SCALING_1TO1: u8 = 0xe6;
const EDP_AUX_SET_SCALING_2TO1: u8 = 0xe7;
const EDP_AUX_SET_RESOLUTION: u8 = 0xe8;
const EDP_AUX_STATUS_REQUEST: u8 = 0xe9;
const EDP_AUX_SET_SAMPLE_RATE: u8 = 0xf3;
const EDP_AUX_IBM_READ_SECONDARY_ID: u8 = 0xe1;
/* Mode-byte argument opening the RMI register window */
const EDP_AUX_FULL_RMI_BACK_DOOR: u8 = 0x7f;
/* Sample-rate parameter committing a mode byte */
const SET_SAMPLE_RATE_SET_MODE_BYTE2: u8 = 0x14;

/* Status-request arguments (encoded via the resolution sequence) */
pub const STATUS_REQUEST_IDENTIFY_SYNAPTICS: u8 = 0x00;
pub const STATUS_REQUEST_READ_CAPABILITIES: u8 = 0x02;
pub const STATUS_REQUEST_READ_EXTRA_CAPABILITIES2: u8 = 0x0a;

/* Middle byte of the identify response for a touchpad */
const DEVICE_RESPONSE_TOUCH_PAD: u8 = 0x47;

/* IBM secondary ids announcing a Synaptics pointing stick; both are
 * treated identically. */
const STICK_DEVICE_TYPE_JYT_SYNA: u8 = 0x06;
const STICK_DEVICE_TYPE_SYNAPTICS: u8 = 0x07;

/* Self-test banner after RESET */
const SELF_TEST_BANNER: [u8; 2] = [0xaa, 0x00];

const ACK_READ_TIMEOUT: Duration = Duration::from_millis(10);
const ACK_RETRY_DELAY: Duration = Duration::from_millis(1);
const RESEND_BACKOFF: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_millis(10);
const SETTLE_DELAY: Duration = Duration::from_millis(20);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(20);
const BIND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct Ps2Transport {
    io: Option<IoChannel>,
    node: Option<PathBuf>,
    syspath: PathBuf,
    iepmode: bool,
    max_page: u8,
}

impl Ps2Transport {
    /* `syspath` is the serio device directory carrying `drvctl`.
     * No I/O happens until `rescan` locates the raw node. */
    pub fn new(syspath: impl Into<PathBuf>) -> Self {
        Self {
            io: None,
            node: None,
            syspath: syspath.into(),
            iepmode: false,
            max_page: 0x1,
        }
    }

    /* Wrap an existing channel; used by simulators and tests. */
    pub fn with_channel(io: IoChannel) -> Self {
        Self {
            io: Some(io),
            node: None,
            syspath: PathBuf::new(),
            iepmode: false,
            max_page: 0x1,
        }
    }

    fn channel(&self) -> Result<&IoChannel> {
        match self.io.as_ref() {
            Some(io) => Ok(io),
            None => Err(RmiError::Internal("device is not open".to_string()).into()),
        }
    }

    /* Read a single byte from the touchpad. */
    fn read_byte(&self, timeout: Duration) -> Result<u8> {
        let io = self.channel()?;
        let mut buf = [0u8; 1];
        let n = io.read_raw(&mut buf, timeout, IoFlags::NONE)?;
        if n != 1 {
            return Err(RmiError::Io {
                device: io.label().to_string(),
                source: std::io::Error::new(ErrorKind::UnexpectedEof, "end of file"),
            }
            .into());
        }
        Ok(buf[0])
    }

    /* Poll for the acknowledge byte; the device may need time to get
     * around to answering. */
    fn read_ack(&self) -> Result<u8> {
        let io = self.channel()?;
        for attempt in 0..60 {
            let mut buf = [0u8; 1];
            match io.read_raw(&mut buf, ACK_READ_TIMEOUT, IoFlags::USE_BLOCKING_IO) {
                Ok(1) => return Ok(buf[0]),
                Ok(_) => {
                    return Err(RmiError::Io {
                        device: io.label().to_string(),
                        source: std::io::Error::new(ErrorKind::UnexpectedEof, "end of file"),
                    }
                    .into());
                }
                Err(err) if RmiError::is_timed_out(&err) => {
                    warn!("ack read timed out: {attempt}");
                    std::thread::sleep(ACK_RETRY_DELAY);
                }
                Err(err) => return Err(err),
            }
        }
        Err(RmiError::TimedOut("read timed out".to_string()).into())
    }

    /* Write one byte and wait for the acknowledge handshake.
     *
     * RESEND and ERROR re-transmit after a backoff; any other
     * unexpected byte is discarded and the ack re-read without
     * re-transmitting. */
    fn write_byte(&self, cmd: u8, timeout: Duration, flags: TransportFlags) -> Result<()> {
        let io = self.channel()?;
        let mut do_write = true;
        let mut attempts = 0u32;
        loop {
            if do_write {
                io.write(
                    &[cmd],
                    timeout,
                    IoFlags::FLUSH_INPUT | IoFlags::USE_BLOCKING_IO,
                )?;
            }
            do_write = false;

            loop {
                let res = match self.read_ack() {
                    Ok(b) => b,
                    Err(err) => {
                        warn!("read ack failed: {err:#}, retrying");
                        break;
                    }
                };
                match res {
                    DATA_PORT_STATUS_ACKNOWLEDGE => return Ok(()),
                    DATA_PORT_STATUS_RESEND => {
                        debug!("resend");
                        do_write = true;
                        std::thread::sleep(RESEND_BACKOFF);
                        break;
                    }
                    DATA_PORT_STATUS_ERROR => {
                        debug!("error");
                        do_write = true;
                        std::thread::sleep(ERROR_BACKOFF);
                        break;
                    }
                    other => {
                        debug!("other response: {other:#04x}");
                        std::thread::sleep(ERROR_BACKOFF);
                    }
                }
            }

            attempts += 1;
            if attempts > 3 {
                if flags.contains(TransportFlags::ALLOW_FAILURE) {
                    /* firmware sends no ack at all for commands
                     * like RESET */
                    return Ok(());
                }
                return Err(RmiError::NotSupported(
                    "cannot write byte after retries".to_string(),
                )
                .into());
            }
        }
    }

    /* Encode an 8-bit argument as four 2-bit digits, MSB first. */
    fn set_resolution_sequence(&self, arg: u8, send_e6s: bool) -> Result<()> {
        for _ in 0..if send_e6s { 2 } else { 1 } {
            self.write_byte(
                EDP_AUX_SET_SCALING_1TO1,
                Duration::from_millis(50),
                TransportFlags::NONE,
            )?;
        }
        for i in (0..4).rev() {
            let two_bit_arg = (arg >> (i * 2)) & 0x3;
            self.write_byte(
                EDP_AUX_SET_RESOLUTION,
                Duration::from_millis(50),
                TransportFlags::NONE,
            )?;
            self.write_byte(two_bit_arg, Duration::from_millis(50), TransportFlags::NONE)?;
        }
        Ok(())
    }

    /* Issue a status request and fold the three response bytes into a
     * big-endian u32. */
    fn status_request(&self, arg: u8) -> Result<u32> {
        let mut success = false;
        for attempt in 0..3 {
            if let Err(err) = self.set_resolution_sequence(arg, false) {
                debug!("failed set try #{attempt}: {err:#}");
                continue;
            }
            if let Err(err) = self.write_byte(
                EDP_AUX_STATUS_REQUEST,
                Duration::from_millis(10),
                TransportFlags::NONE,
            ) {
                debug!("failed write try #{attempt}: {err:#}");
                continue;
            }
            success = true;
            break;
        }
        if !success {
            return Err(
                RmiError::Internal("status request failed after retries".to_string()).into(),
            );
        }

        let mut value = 0u32;
        for i in 0..3 {
            let b = self
                .read_byte(Duration::from_millis(10))
                .with_context(|| format!("failed to read status byte {i}"))?;
            value = (value << 8) | u32::from(b);
        }
        Ok(value)
    }

    /* Parameterized mode change: resolution sequence, then the
     * sample-rate command and its parameter. */
    fn sample_rate(&self, param: u8, arg: u8, mut send_e6s: bool) -> Result<()> {
        let mut attempts = 0u32;
        loop {
            if attempts > 0 {
                /* always send two E6s when retrying */
                send_e6s = true;
            }
            let res = self
                .set_resolution_sequence(arg, send_e6s)
                .and_then(|_| {
                    self.write_byte(
                        EDP_AUX_SET_SAMPLE_RATE,
                        Duration::from_millis(50),
                        TransportFlags::NONE,
                    )
                })
                .and_then(|_| {
                    self.write_byte(param, Duration::from_millis(50), TransportFlags::NONE)
                });
            match res {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if attempts > 3 {
                        return Err(err);
                    }
                    warn!("failed, will retry: {err:#}");
                }
            }
            attempts += 1;
        }
    }

    /* Probe whether the device is a Synaptics pointing stick. */
    fn detect_synaptics_styk(&self) -> Result<bool> {
        self.write_byte(
            EDP_AUX_IBM_READ_SECONDARY_ID,
            Duration::from_millis(10),
            TransportFlags::NONE,
        )
        .context("failed to write secondary id request")?;
        let id = self
            .read_byte(Duration::from_millis(10))
            .context("failed to receive secondary id")?;
        Ok(id == STICK_DEVICE_TYPE_JYT_SYNA || id == STICK_DEVICE_TYPE_SYNAPTICS)
    }

    /* Write `data` to consecutive 8-bit registers starting at `addr`
     * through the RMI back door. */
    fn write_rmi_register(
        &mut self,
        addr: u8,
        data: &[u8],
        timeout: Duration,
        flags: TransportFlags,
    ) -> Result<()> {
        self.enter_iep_mode(TransportFlags::NONE)?;
        self.write_byte(EDP_AUX_SET_SCALING_2TO1, timeout, flags)
            .context("failed to set scaling 2:1")?;
        self.write_byte(EDP_AUX_SET_SAMPLE_RATE, timeout, flags)
            .context("failed to set sample rate")?;
        self.write_byte(addr, timeout, flags)
            .context("failed to write address")?;
        for (i, b) in data.iter().enumerate() {
            self.write_byte(EDP_AUX_SET_SAMPLE_RATE, timeout, flags)
                .with_context(|| format!("failed to set byte {i}"))?;
            self.write_byte(*b, timeout, flags)
                .with_context(|| format!("failed to write byte {i}"))?;
        }
        std::thread::sleep(SETTLE_DELAY);
        Ok(())
    }

    /* Read one 8-bit register through the RMI back door. */
    fn read_rmi_register(&mut self, addr: u8) -> Result<u8> {
        self.enter_iep_mode(TransportFlags::NONE)?;
        let mut retries = 0u32;
        loop {
            self.command_register_read(addr)
                .context("failed to write command in rmi register read")?;
            match self.read_byte(Duration::from_millis(10)) {
                Ok(value) => {
                    std::thread::sleep(SETTLE_DELAY);
                    return Ok(value);
                }
                Err(err) => {
                    if retries >= 2 {
                        return Err(err).with_context(|| {
                            format!("failed to read byte at {addr:#04x} after {retries} retries")
                        });
                    }
                    debug!("failed to read byte at {addr:#04x}: {err:#}");
                    retries += 1;
                }
            }
        }
    }

    fn command_register_read(&self, addr: u8) -> Result<()> {
        self.write_byte(
            EDP_AUX_SET_SCALING_2TO1,
            Duration::from_millis(50),
            TransportFlags::NONE,
        )?;
        self.write_byte(
            EDP_AUX_SET_SAMPLE_RATE,
            Duration::from_millis(50),
            TransportFlags::NONE,
        )?;
        self.write_byte(addr, Duration::from_millis(50), TransportFlags::NONE)?;
        self.write_byte(
            EDP_AUX_STATUS_REQUEST,
            Duration::from_millis(50),
            TransportFlags::NONE,
        )?;
        Ok(())
    }

    /* One addressing phase, then `req_sz` consecutive data bytes. */
    fn read_rmi_packet_register(&mut self, addr: u8, req_sz: usize) -> Result<Vec<u8>> {
        self.enter_iep_mode(TransportFlags::NONE)?;
        self.command_register_read(addr)
            .context("failed to write command in rmi packet register read")?;
        let mut buf = Vec::with_capacity(req_sz);
        for i in 0..req_sz {
            let b = self
                .read_byte(Duration::from_millis(10))
                .with_context(|| format!("failed to read byte {i}"))?;
            buf.push(b);
        }
        std::thread::sleep(SETTLE_DELAY);
        Ok(buf)
    }

    /* Switch the bound kernel driver through the serio drvctl
     * attribute, then wait for the new driver to appear. */
    pub fn write_drvctl(&mut self, value: &str) -> Result<()> {
        let path = self.syspath.join("drvctl");
        debug!("drvctl <- {value}");
        std::fs::write(&path, format!("{value}\n")).map_err(|source| match source.kind() {
            ErrorKind::NotFound => {
                anyhow::Error::from(RmiError::InvalidFile(format!(
                    "no drvctl at {}",
                    path.display()
                )))
            }
            ErrorKind::PermissionDenied => RmiError::PermissionDenied(format!(
                "cannot write drvctl at {}",
                path.display()
            ))
            .into(),
            _ => RmiError::Io {
                device: path.display().to_string(),
                source,
            }
            .into(),
        })?;

        let deadline = Instant::now() + BIND_TIMEOUT;
        while Instant::now() < deadline {
            if self.current_driver().as_deref() == Some(value) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        warn!("driver did not report {value} within {BIND_TIMEOUT:?}");
        Ok(())
    }

    fn current_driver(&self) -> Option<String> {
        let dev = udev::Device::from_syspath(&self.syspath).ok()?;
        dev.driver().map(|d| d.to_string_lossy().into_owned())
    }

    /* Re-resolve the device node and bound driver after a drvctl
     * switch. Returns true when `serio_raw` owns the port. */
    pub fn rescan(&mut self) -> Result<bool> {
        self.io = None;
        self.node = None;
        let dev = udev::Device::from_syspath(&self.syspath).map_err(|e| {
            RmiError::InvalidFile(format!(
                "no serio device at {}: {e}",
                self.syspath.display()
            ))
        })?;
        let driver = dev
            .driver()
            .map(|d| d.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!("serio driver is {driver:?}");
        let bootloader = driver == "serio_raw";
        if bootloader {
            self.node = Some(self.find_raw_node(&dev)?);
        }
        Ok(bootloader)
    }

    /* serio_raw publishes a misc chardev under the serio device. */
    fn find_raw_node(&self, dev: &udev::Device) -> Result<PathBuf> {
        let mut enumerator = udev::Enumerator::new().map_err(|source| RmiError::Io {
            device: self.syspath.display().to_string(),
            source,
        })?;
        enumerator
            .match_parent(dev)
            .map_err(|source| RmiError::Io {
                device: self.syspath.display().to_string(),
                source,
            })?;
        let children = enumerator.scan_devices().map_err(|source| RmiError::Io {
            device: self.syspath.display().to_string(),
            source,
        })?;
        for child in children {
            if child.sysname().to_string_lossy().starts_with("serio_raw")
                && let Some(node) = child.devnode()
            {
                return Ok(node.to_path_buf());
            }
        }
        Err(RmiError::InvalidFile(format!(
            "no serio_raw node under {}",
            self.syspath.display()
        ))
        .into())
    }

    /* Open the raw node. In bootloader mode the stale input queue is
     * drained and the device reset to a known state. */
    pub fn open(&mut self, bootloader: bool) -> Result<()> {
        if self.io.is_none() {
            let node = self.node.clone().ok_or_else(|| {
                RmiError::InvalidFile(
                    "no raw device node; register I/O needs serio_raw".to_string(),
                )
            })?;
            self.io = Some(
                IoChannel::open(&node)
                    .with_context(|| format!("failed to open {}", node.display()))?,
            );
        }
        if !bootloader {
            return Ok(());
        }

        /* clear out any stale data in the serio_raw queue */
        for _ in 0..0xffffusize {
            if self.read_byte(DRAIN_TIMEOUT).is_err() {
                break;
            }
        }

        /* reset; the self test takes 300-500ms */
        self.write_byte(EDP_AUX_RESET, Duration::from_millis(600), TransportFlags::NONE)
            .context("failed to reset")?;

        /* the 0xaa 0x00 banner announces the touchpad is ready */
        let b0 = self
            .read_byte(Duration::from_millis(500))
            .context("failed to read self-test banner")?;
        let b1 = self
            .read_byte(Duration::from_millis(500))
            .context("failed to read self-test banner")?;
        if [b0, b1] != SELF_TEST_BANNER {
            return Err(RmiError::InvalidData(format!(
                "bad self-test banner: {b0:#04x} {b1:#04x}"
            ))
            .into());
        }

        /* stop finger reporting */
        self.write_byte(EDP_AUX_DISABLE, Duration::from_millis(50), TransportFlags::NONE)
            .context("failed to disable stream mode")?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.io = None;
        Ok(())
    }
}

impl RmiTransport for Ps2Transport {
    fn read(&mut self, addr: u16, req_sz: usize) -> Result<Vec<u8>> {
        self.set_page((addr >> 8) as u8)
            .context("failed to set rmi page")?;

        let mut retries = 0u32;
        loop {
            let mut buf = Vec::with_capacity(req_sz);
            for i in 0..req_sz {
                let reg = ((addr as usize & 0x00ff) + i) as u8;
                let value = self
                    .read_rmi_register(reg)
                    .with_context(|| format!("failed register read {:#06x}", addr as usize + i))?;
                buf.push(value);
            }
            if buf.len() != req_sz {
                debug!("short read: {} of {req_sz}", buf.len());
                if retries >= 2 {
                    return Err(RmiError::InvalidData(format!(
                        "buffer length did not match: {} vs {req_sz}",
                        buf.len()
                    ))
                    .into());
                }
                retries += 1;
                continue;
            }
            debug!("read {:#06x}: {:02x?}", addr, buf);
            return Ok(buf);
        }
    }

    fn read_packet_register(&mut self, addr: u16, req_sz: usize) -> Result<Vec<u8>> {
        self.set_page((addr >> 8) as u8)
            .context("failed to set rmi page")?;
        let buf = self
            .read_rmi_packet_register((addr & 0x00ff) as u8, req_sz)
            .with_context(|| format!("failed packet register read {addr:#06x}"))?;
        debug!("read {:#06x}: {:02x?}", addr, buf);
        Ok(buf)
    }

    fn write(&mut self, addr: u16, data: &[u8], flags: TransportFlags) -> Result<()> {
        self.set_page((addr >> 8) as u8)
            .context("failed to set rmi page")?;
        self.write_rmi_register(
            (addr & 0x00ff) as u8,
            data,
            Duration::from_millis(1000),
            flags,
        )
        .with_context(|| format!("failed to write register {addr:#06x}"))?;
        debug!("write {:#06x}: {:02x?}", addr, data);
        Ok(())
    }

    fn set_page(&mut self, page: u8) -> Result<()> {
        self.write_rmi_register(
            RMI_DEVICE_PAGE_SELECT_REGISTER as u8,
            &[page],
            SETTLE_DELAY,
            TransportFlags::NONE,
        )
        .with_context(|| format!("failed to write page {page}"))
    }

    /* No attention channel on this bus; give the device the time it
     * asked for and report success. */
    fn wait_for_attention(&mut self, _source_mask: u8, timeout: Duration) -> Result<()> {
        std::thread::sleep(timeout);
        Ok(())
    }

    fn enter_iep_mode(&mut self, flags: TransportFlags) -> Result<()> {
        if self.iepmode && !flags.contains(TransportFlags::FORCE) {
            return Ok(());
        }

        /* disable stream mode, then open the register window */
        self.write_byte(EDP_AUX_DISABLE, Duration::from_millis(50), TransportFlags::NONE)
            .context("failed to disable stream mode")?;
        self.sample_rate(SET_SAMPLE_RATE_SET_MODE_BYTE2, EDP_AUX_FULL_RMI_BACK_DOOR, false)
            .context("failed to enter rmi mode")?;
        self.iepmode = true;
        Ok(())
    }

    fn write_bus_select(&mut self, bus: u8) -> Result<()> {
        self.write(RMI_DEVICE_BUS_SELECT_REGISTER, &[bus], TransportFlags::NONE)
            .with_context(|| format!("failed to write bus select {bus}"))
    }

    fn query_build_id(&mut self) -> Result<u32> {
        let ident = self
            .status_request(STATUS_REQUEST_IDENTIFY_SYNAPTICS)
            .context("failed to request identify")?;
        debug!("identify response = {ident:#x}");
        let esd = ((ident & 0xff00) >> 8) as u8;

        let is_styk = self
            .detect_synaptics_styk()
            .context("failed to detect pointing stick")?;
        self.iepmode = false;
        if esd == DEVICE_RESPONSE_TOUCH_PAD || is_styk {
            /* the firmware build id lives in bits 0-23 of the extra
             * capabilities 2 response */
            let build_id = self
                .status_request(STATUS_REQUEST_READ_EXTRA_CAPABILITIES2)
                .context("failed to read extra capabilities 2")?;
            return Ok(build_id);
        }
        Ok(0)
    }

    fn query_product_sub_id(&mut self) -> Result<u8> {
        let caps = self
            .status_request(STATUS_REQUEST_READ_CAPABILITIES)
            .context("failed to read capabilities")?;
        Ok(((caps >> 8) & 0xff) as u8)
    }

    fn iepmode(&self) -> bool {
        self.iepmode
    }

    fn set_iepmode(&mut self, enabled: bool) {
        self.iepmode = enabled;
    }

    fn max_page(&self) -> u8 {
        self.max_page
    }

    fn set_max_page(&mut self, page: u8) {
        self.max_page = page;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_digits_cover_the_argument() {
        /* 0x7f encodes as 01 03 03 03, MSB first */
        let arg = EDP_AUX_FULL_RMI_BACK_DOOR;
        let digits: Vec<u8> = (0..4).rev().map(|i| (arg >> (i * 2)) & 0x3).collect();
        assert_eq!(digits, vec![0x1, 0x3, 0x3, 0x3]);
        let folded = digits.iter().fold(0u8, |acc, d| (acc << 2) | d);
        assert_eq!(folded, arg);
    }

    #[test]
    fn closed_transport_reports_internal_error() {
        let mut ps2 = Ps2Transport::new("/sys/devices/platform/i8042/serio1");
        let err = ps2.read(0x0004, 1).unwrap_err();
        assert!(matches!(
            RmiError::kind_of(&err),
            Some(RmiError::Internal(_))
        ));
    }

    #[test]
    fn max_page_defaults_to_one() {
        let ps2 = Ps2Transport::new("/tmp/serio");
        assert_eq!(ps2.max_page(), 0x1);
    }
}
