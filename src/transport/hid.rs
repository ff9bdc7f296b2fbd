/* HID (hidraw) backend. */
/*  */
/* All exchanges ride in 21-byte reports with little-endian fields: */
/* - 0x09 output: register write */
/* - 0x0a output: read request */
/* - 0x0b input:  read data */
/* - 0x0c input:  attention, byte 1 is the interrupt-source bitmask */
/* - 0x0f feature: mouse/attention mode select */

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::debug;

use crate::error::RmiError;
use crate::io_channel::{IoChannel, IoFlags};
use crate::ioctl::{IoctlGateway, hidiocsfeature};
use crate::transport::{
    RMI_DEVICE_DEFAULT_TIMEOUT, RMI_DEVICE_PAGE_SELECT_REGISTER, RmiTransport, TransportFlags,
};

pub const RMI_WRITE_REPORT_ID: u8 = 0x09;
pub const RMI_READ_ADDR_REPORT_ID: u8 = 0x0a;
pub const RMI_READ_DATA_REPORT_ID: u8 = 0x0b;
pub const RMI_ATTN_REPORT_ID: u8 = 0x0c;
pub const RMI_SET_MODE_REPORT_ID: u8 = 0x0f;

const HID_REPORT_LEN: usize = 21;

/* Input-report layout */
const HID_REPORT_ID: usize = 0;
const HID_READ_INPUT_COUNT: usize = 1;
const HID_READ_INPUT_DATA: usize = 2;
const HID_ATTN_INTERRUPT_SOURCES: usize = 1;

const IOCTL_TIMEOUT: Duration = Duration::from_millis(5000);

/* Reporting personality selected through the 0x0f feature report. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HidMode {
    Mouse = 0,
    AttnReports = 1,
    NoPackedAttnReports = 2,
}

/* Build the 21-byte read request for `req_sz` bytes at `addr`. */
pub fn build_read_request(addr: u16, req_sz: u16) -> [u8; HID_REPORT_LEN] {
    let mut buf = [0u8; HID_REPORT_LEN];
    buf[0] = RMI_READ_ADDR_REPORT_ID;
    /* byte 1 is the legacy single-byte read count, always zero */
    buf[2..4].copy_from_slice(&addr.to_le_bytes());
    buf[4..6].copy_from_slice(&req_sz.to_le_bytes());
    buf
}

/* Build the 21-byte write report; `data` must fit a u8 length. */
pub fn build_write_report(addr: u16, data: &[u8]) -> [u8; HID_REPORT_LEN] {
    let mut buf = [0u8; HID_REPORT_LEN];
    buf[0] = RMI_WRITE_REPORT_ID;
    buf[1] = data.len() as u8;
    buf[2..4].copy_from_slice(&addr.to_le_bytes());
    buf[4..4 + data.len()].copy_from_slice(data);
    buf
}

#[derive(Debug)]
pub struct HidTransport {
    io: IoChannel,
    syspath: Option<PathBuf>,
    iepmode: bool,
    max_page: u8,
}

impl HidTransport {
    /* Open the hidraw node; `syspath` locates the device in sysfs for
     * the driver rebind after detach. */
    pub fn new(devnode: &Path, syspath: &Path) -> Result<Self> {
        let io = IoChannel::open(devnode)
            .with_context(|| format!("failed to open hidraw device {}", devnode.display()))?;
        Ok(Self {
            io,
            syspath: Some(syspath.to_path_buf()),
            iepmode: false,
            max_page: 0xff,
        })
    }

    /* Wrap an existing channel; used by simulators and tests. */
    pub fn with_channel(io: IoChannel) -> Self {
        Self {
            io,
            syspath: None,
            iepmode: false,
            max_page: 0xff,
        }
    }

    pub fn syspath(&self) -> Option<&Path> {
        self.syspath.as_deref()
    }

    /* Select the reporting personality via HIDIOCSFEATURE. */
    pub fn set_mode(&mut self, mode: HidMode) -> Result<()> {
        let mut buf = [RMI_SET_MODE_REPORT_ID, mode as u8];
        debug!("SetMode {:02x?}", buf);
        IoctlGateway::new(&self.io)
            .execute(hidiocsfeature(buf.len()), &mut buf, IOCTL_TIMEOUT)
            .with_context(|| format!("failed to set mode {:?}", mode))?;
        Ok(())
    }

    /* Switch the touchpad into attention-report mode so registers can
     * be queried. */
    pub fn open(&mut self) -> Result<()> {
        self.set_mode(HidMode::AttnReports)
    }

    /* Restore mouse mode. A permission error here means the device
     * already detached for replug and is swallowed. */
    pub fn close(&mut self) -> Result<()> {
        if let Err(err) = self.set_mode(HidMode::Mouse) {
            if !RmiError::is_permission_denied(&err) {
                return Err(err);
            }
            debug!("ignoring: {err:#}");
        }
        Ok(())
    }
}

impl RmiTransport for HidTransport {
    fn read(&mut self, addr: u16, req_sz: usize) -> Result<Vec<u8>> {
        if req_sz > 0xffff {
            return Err(RmiError::Internal("data to read was too long".to_string()).into());
        }
        let req = build_read_request(addr, req_sz as u16);
        self.io
            .write(
                &req,
                RMI_DEVICE_DEFAULT_TIMEOUT,
                IoFlags::SINGLE_SHOT | IoFlags::USE_BLOCKING_IO,
            )
            .with_context(|| format!("failed to request read at {addr:#06x}"))?;

        /* keep reading reports until we have enough data */
        let mut buf: Vec<u8> = Vec::with_capacity(req_sz);
        while buf.len() < req_sz {
            let res = self
                .io
                .read(HID_REPORT_LEN, RMI_DEVICE_DEFAULT_TIMEOUT, IoFlags::SINGLE_SHOT)?;
            if res.is_empty() {
                return Err(RmiError::Internal("response zero sized".to_string()).into());
            }

            /* ignore non-data report events */
            if res[HID_REPORT_ID] != RMI_READ_DATA_REPORT_ID {
                debug!("ignoring report with id {:#04x}", res[HID_REPORT_ID]);
                continue;
            }
            if res.len() < HID_READ_INPUT_DATA {
                return Err(RmiError::Internal(format!(
                    "response too small: {:#04x}",
                    res.len()
                ))
                .into());
            }
            let input_count = res[HID_READ_INPUT_COUNT] as usize;
            if input_count == 0 {
                return Err(RmiError::Internal("input count zero".to_string()).into());
            }
            if input_count + HID_READ_INPUT_DATA > res.len() {
                return Err(RmiError::Internal(format!(
                    "underflow {:#04x} from expected {:#04x}",
                    res.len(),
                    input_count + HID_READ_INPUT_DATA
                ))
                .into());
            }
            buf.extend_from_slice(&res[HID_READ_INPUT_DATA..HID_READ_INPUT_DATA + input_count]);
        }
        buf.truncate(req_sz);
        debug!("read {:#06x}: {:02x?}", addr, buf);
        Ok(buf)
    }

    fn read_packet_register(&mut self, addr: u16, req_sz: usize) -> Result<Vec<u8>> {
        self.read(addr, req_sz)
    }

    fn write(&mut self, addr: u16, data: &[u8], _flags: TransportFlags) -> Result<()> {
        if data.len() > 0xff {
            return Err(RmiError::Internal("data to write was too long".to_string()).into());
        }
        let frame = build_write_report(addr, data);
        self.io
            .write(
                &frame,
                RMI_DEVICE_DEFAULT_TIMEOUT,
                IoFlags::SINGLE_SHOT | IoFlags::USE_BLOCKING_IO,
            )
            .with_context(|| format!("failed to write {} bytes at {addr:#06x}", data.len()))
    }

    fn set_page(&mut self, page: u8) -> Result<()> {
        self.write(RMI_DEVICE_PAGE_SELECT_REGISTER, &[page], TransportFlags::NONE)
            .with_context(|| format!("failed to set rmi page {page:#04x}"))
    }

    fn wait_for_attention(&mut self, source_mask: u8, timeout: Duration) -> Result<()> {
        let start = Instant::now();

        /* wait for an event from the hardware */
        while start.elapsed() < timeout {
            let res = match self.io.read(HID_REPORT_LEN, timeout, IoFlags::SINGLE_SHOT) {
                Ok(res) => res,
                Err(err) if RmiError::is_timed_out(&err) => break,
                Err(err) => return Err(err),
            };
            if res.len() < HID_ATTN_INTERRUPT_SOURCES + 1 {
                debug!("attention: ignoring small read of {}", res.len());
                continue;
            }
            if res[HID_REPORT_ID] != RMI_ATTN_REPORT_ID {
                debug!(
                    "attention: ignoring report with id {:#04x}",
                    res[HID_REPORT_ID]
                );
                continue;
            }

            if source_mask & res[HID_ATTN_INTERRUPT_SOURCES] != 0 {
                return Ok(());
            }
            debug!(
                "source mask did not match: {:#04x}",
                res[HID_ATTN_INTERRUPT_SOURCES]
            );
        }

        Err(RmiError::NotSupported("no attr report, timed out".to_string()).into())
    }

    fn enter_iep_mode(&mut self, flags: TransportFlags) -> Result<()> {
        /* no back door on hid; the register window is always open */
        if self.iepmode && !flags.contains(TransportFlags::FORCE) {
            return Ok(());
        }
        self.iepmode = true;
        Ok(())
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
    use std::fs::File;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixDatagram;

    /* Datagram sockets preserve report boundaries the way hidraw
     * does: one report per read. */
    fn report_pair() -> (HidTransport, UnixDatagram) {
        let (ours, theirs) = UnixDatagram::pair().expect("socketpair");
        ours.set_nonblocking(true).unwrap();
        let file = File::from(OwnedFd::from(ours));
        let io = IoChannel::from_file(file, "hidraw-sim");
        (HidTransport::with_channel(io), theirs)
    }

    fn report(bytes: &[u8]) -> [u8; HID_REPORT_LEN] {
        let mut buf = [0u8; HID_REPORT_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        buf
    }

    #[test]
    fn read_request_frame_layout() {
        let req = build_read_request(0x0104, 4);
        assert_eq!(req.len(), HID_REPORT_LEN);
        assert_eq!(&req[..6], &[0x0a, 0x00, 0x04, 0x01, 0x04, 0x00]);
        assert!(req[6..].iter().all(|b| *b == 0));
    }

    #[test]
    fn write_report_frame_layout() {
        /* page select: one byte at 0x00ff */
        let frame = build_write_report(0x00ff, &[0x01]);
        assert_eq!(&frame[..5], &[0x09, 0x01, 0xff, 0x00, 0x01]);
        assert!(frame[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn read_accumulates_chunked_reports() {
        let (mut hid, peer) = report_pair();
        peer.send(&report(&[0x0b, 0x02, 0xaa, 0xbb])).unwrap();
        peer.send(&report(&[0x0b, 0x02, 0xcc, 0xdd])).unwrap();

        let data = hid.read(0x0104, 4).unwrap();
        assert_eq!(data, vec![0xaa, 0xbb, 0xcc, 0xdd]);

        /* the request that went out on the wire */
        let mut sent = [0u8; 64];
        let n = peer.recv(&mut sent).unwrap();
        assert_eq!(&sent[..n], &build_read_request(0x0104, 4)[..]);
    }

    #[test]
    fn read_skips_foreign_reports() {
        let (mut hid, peer) = report_pair();
        peer.send(&report(&[0x0c, 0x01])).unwrap();
        peer.send(&report(&[0x0b, 0x01, 0x5a])).unwrap();
        assert_eq!(hid.read(0x0010, 1).unwrap(), vec![0x5a]);
    }

    #[test]
    fn read_rejects_zero_input_count() {
        let (mut hid, peer) = report_pair();
        peer.send(&report(&[0x0b, 0x00])).unwrap();
        let err = hid.read(0x0010, 1).unwrap_err();
        assert!(matches!(
            RmiError::kind_of(&err),
            Some(RmiError::Internal(_))
        ));
    }

    #[test]
    fn read_rejects_underflowing_report() {
        let (mut hid, peer) = report_pair();
        /* claims 30 payload bytes in a 21-byte report */
        peer.send(&report(&[0x0b, 0x1e, 0x01])).unwrap();
        let err = hid.read(0x0010, 4).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("underflow"), "{msg}");
    }

    #[test]
    fn oversized_read_is_internal_error() {
        let (mut hid, _peer) = report_pair();
        let err = hid.read(0x0000, 0x10000).unwrap_err();
        assert!(matches!(
            RmiError::kind_of(&err),
            Some(RmiError::Internal(_))
        ));
    }

    #[test]
    fn oversized_write_is_internal_error() {
        let (mut hid, _peer) = report_pair();
        let payload = [0u8; 256];
        let err = hid
            .write(0x0000, &payload, TransportFlags::NONE)
            .unwrap_err();
        assert!(matches!(
            RmiError::kind_of(&err),
            Some(RmiError::Internal(_))
        ));
    }

    #[test]
    fn set_page_emits_page_select_write() {
        let (mut hid, peer) = report_pair();
        hid.set_page(0x02).unwrap();
        let mut sent = [0u8; 64];
        let n = peer.recv(&mut sent).unwrap();
        assert_eq!(&sent[..n], &build_write_report(0x00ff, &[0x02])[..]);
    }

    #[test]
    fn attention_matches_source_mask() {
        let (mut hid, peer) = report_pair();
        /* a mouse report and a mismatched mask arrive first */
        peer.send(&report(&[0x01, 0xff])).unwrap();
        peer.send(&report(&[0x0c, 0x04])).unwrap();
        peer.send(&report(&[0x0c, 0x01, 0xde])).unwrap();
        hid.wait_for_attention(0x01, Duration::from_millis(500))
            .unwrap();
    }

    #[test]
    fn attention_timeout_is_not_supported() {
        let (mut hid, _peer) = report_pair();
        let err = hid
            .wait_for_attention(0x01, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(
            RmiError::kind_of(&err),
            Some(RmiError::NotSupported(_))
        ));
    }

    #[test]
    fn iep_mode_is_latched() {
        let (mut hid, _peer) = report_pair();
        assert!(!hid.iepmode());
        hid.enter_iep_mode(TransportFlags::NONE).unwrap();
        assert!(hid.iepmode());
        hid.enter_iep_mode(TransportFlags::FORCE).unwrap();
        assert!(hid.iepmode());
    }
}
