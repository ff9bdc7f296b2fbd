/* Transport framework: the RmiTransport register contract, the flag
 * words shared by both backends, and the F34-version dispatch into the
 * flash state machines supplied by the function layer. */

pub mod hid;
pub mod ps2;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use bitflags::bitflags;

use crate::device::RmiFunction;
use crate::error::RmiError;

pub use hid::HidTransport;
pub use ps2::Ps2Transport;

/* In-page register selecting the current RMI page. */
pub const RMI_DEVICE_PAGE_SELECT_REGISTER: u16 = 0x00ff;
/* Register selecting which physical bus owns the RMI window. */
pub const RMI_DEVICE_BUS_SELECT_REGISTER: u16 = 0x007f;

pub const RMI_DEVICE_DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

bitflags! {
    /* Per-call modifiers for register operations. */
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransportFlags: u8 {
        const NONE = 0;
        /* Suppress ack-exhausted errors; RESET intentionally never acks. */
        const ALLOW_FAILURE = 1 << 0;
        /* Bypass the "already in IEP mode" short-circuit. */
        const FORCE = 1 << 1;
    }
}

/* Physical bus a device is reached over. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    Hid,
    Ps2,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hid" => Ok(BusKind::Hid),
            "ps2" => Ok(BusKind::Ps2),
            other => Err(format!("unknown bus kind: {other}")),
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusKind::Hid => f.write_str("hid"),
            BusKind::Ps2 => f.write_str("ps2"),
        }
    }
}

/* The register-level contract consumed by the function layer.      */
/*                                                                  */
/* Both backends translate "read/write N bytes at a 16-bit RMI      */
/* address" into their own wire framing; the function layer only    */
/* ever sees this interface, borrowed per call.                     */
pub trait RmiTransport {
    /* Read exactly `req_sz` bytes starting at `addr`. */
    fn read(&mut self, addr: u16, req_sz: usize) -> Result<Vec<u8>>;

    /* Read a packet register: one addressing phase, then `req_sz`
     * consecutive bytes. */
    fn read_packet_register(&mut self, addr: u16, req_sz: usize) -> Result<Vec<u8>>;

    fn write(&mut self, addr: u16, data: &[u8], flags: TransportFlags) -> Result<()>;

    fn set_page(&mut self, page: u8) -> Result<()>;

    /* Block until an interrupt source in `source_mask` raises
     * attention, or the budget expires. */
    fn wait_for_attention(&mut self, source_mask: u8, timeout: Duration) -> Result<()>;

    fn enter_iep_mode(&mut self, flags: TransportFlags) -> Result<()>;

    fn write_bus_select(&mut self, _bus: u8) -> Result<()> {
        Err(RmiError::NotSupported(
            "bus select is not available on this transport".to_string(),
        )
        .into())
    }

    fn query_build_id(&mut self) -> Result<u32> {
        Err(RmiError::NotSupported(
            "build id query is not available on this transport".to_string(),
        )
        .into())
    }

    fn query_product_sub_id(&mut self) -> Result<u8> {
        Err(RmiError::NotSupported(
            "product sub id query is not available on this transport".to_string(),
        )
        .into())
    }

    fn iepmode(&self) -> bool;
    fn set_iepmode(&mut self, enabled: bool);

    fn max_page(&self) -> u8;
    fn set_max_page(&mut self, page: u8);
}

/* Flash state machines live in the function layer; the transport
 * core only routes to the right F34 generation. */
pub trait FlashController {
    fn detach_v5(&mut self, port: &mut dyn RmiTransport) -> Result<()>;
    fn detach_v7(&mut self, port: &mut dyn RmiTransport) -> Result<()>;
    fn query_status_v5(&mut self, port: &mut dyn RmiTransport) -> Result<()>;
    fn query_status_v7(&mut self, port: &mut dyn RmiTransport) -> Result<()>;
}

pub(crate) fn dispatch_detach(
    f34: &RmiFunction,
    flash: &mut dyn FlashController,
    port: &mut dyn RmiTransport,
) -> Result<()> {
    match f34.function_version {
        0x0 | 0x1 => flash.detach_v5(port),
        0x2 => flash.detach_v7(port),
        other => Err(RmiError::NotSupported(format!(
            "f34 function version {other:#04x} unsupported"
        ))
        .into()),
    }
}

pub(crate) fn dispatch_query_status(
    f34: &RmiFunction,
    flash: &mut dyn FlashController,
    port: &mut dyn RmiTransport,
) -> Result<()> {
    match f34.function_version {
        0x0 | 0x1 => flash.query_status_v5(port),
        0x2 => flash.query_status_v7(port),
        other => Err(RmiError::NotSupported(format!(
            "f34 function version {other:#04x} unsupported"
        ))
        .into()),
    }
}

/* The tagged variant the device owns. Register operations delegate
 * to the backend; the bus-specific detach/attach choreography lives
 * on the device and matches on this. */
#[derive(Debug)]
pub enum Transport {
    Hid(HidTransport),
    Ps2(Ps2Transport),
}

impl Transport {
    pub fn bus(&self) -> BusKind {
        match self {
            Transport::Hid(_) => BusKind::Hid,
            Transport::Ps2(_) => BusKind::Ps2,
        }
    }

    pub fn as_dyn(&mut self) -> &mut dyn RmiTransport {
        match self {
            Transport::Hid(t) => t,
            Transport::Ps2(t) => t,
        }
    }

    fn as_dyn_ref(&self) -> &dyn RmiTransport {
        match self {
            Transport::Hid(t) => t,
            Transport::Ps2(t) => t,
        }
    }
}

impl RmiTransport for Transport {
    fn read(&mut self, addr: u16, req_sz: usize) -> Result<Vec<u8>> {
        self.as_dyn().read(addr, req_sz)
    }

    fn read_packet_register(&mut self, addr: u16, req_sz: usize) -> Result<Vec<u8>> {
        self.as_dyn().read_packet_register(addr, req_sz)
    }

    fn write(&mut self, addr: u16, data: &[u8], flags: TransportFlags) -> Result<()> {
        self.as_dyn().write(addr, data, flags)
    }

    fn set_page(&mut self, page: u8) -> Result<()> {
        self.as_dyn().set_page(page)
    }

    fn wait_for_attention(&mut self, source_mask: u8, timeout: Duration) -> Result<()> {
        self.as_dyn().wait_for_attention(source_mask, timeout)
    }

    fn enter_iep_mode(&mut self, flags: TransportFlags) -> Result<()> {
        self.as_dyn().enter_iep_mode(flags)
    }

    fn write_bus_select(&mut self, bus: u8) -> Result<()> {
        self.as_dyn().write_bus_select(bus)
    }

    fn query_build_id(&mut self) -> Result<u32> {
        self.as_dyn().query_build_id()
    }

    fn query_product_sub_id(&mut self) -> Result<u8> {
        self.as_dyn().query_product_sub_id()
    }

    fn iepmode(&self) -> bool {
        self.as_dyn_ref().iepmode()
    }

    fn set_iepmode(&mut self, enabled: bool) {
        self.as_dyn().set_iepmode(enabled)
    }

    fn max_page(&self) -> u8 {
        self.as_dyn_ref().max_page()
    }

    fn set_max_page(&mut self, page: u8) {
        self.as_dyn().set_max_page(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /* Minimal transport stub for exercising the dispatch tables. */
    struct NullPort;

    impl RmiTransport for NullPort {
        fn read(&mut self, _addr: u16, _req_sz: usize) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn read_packet_register(&mut self, _addr: u16, _req_sz: usize) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn write(&mut self, _addr: u16, _data: &[u8], _flags: TransportFlags) -> Result<()> {
            Ok(())
        }
        fn set_page(&mut self, _page: u8) -> Result<()> {
            Ok(())
        }
        fn wait_for_attention(&mut self, _source_mask: u8, _timeout: Duration) -> Result<()> {
            Ok(())
        }
        fn enter_iep_mode(&mut self, _flags: TransportFlags) -> Result<()> {
            Ok(())
        }
        fn iepmode(&self) -> bool {
            false
        }
        fn set_iepmode(&mut self, _enabled: bool) {}
        fn max_page(&self) -> u8 {
            0
        }
        fn set_max_page(&mut self, _page: u8) {}
    }

    #[derive(Default)]
    struct RecordingFlash {
        calls: Vec<&'static str>,
    }

    impl FlashController for RecordingFlash {
        fn detach_v5(&mut self, _port: &mut dyn RmiTransport) -> Result<()> {
            self.calls.push("detach_v5");
            Ok(())
        }
        fn detach_v7(&mut self, _port: &mut dyn RmiTransport) -> Result<()> {
            self.calls.push("detach_v7");
            Ok(())
        }
        fn query_status_v5(&mut self, _port: &mut dyn RmiTransport) -> Result<()> {
            self.calls.push("query_status_v5");
            Ok(())
        }
        fn query_status_v7(&mut self, _port: &mut dyn RmiTransport) -> Result<()> {
            self.calls.push("query_status_v7");
            Ok(())
        }
    }

    fn f34_with_version(function_version: u8) -> RmiFunction {
        RmiFunction {
            number: 0x34,
            function_version,
            ..RmiFunction::default()
        }
    }

    #[test]
    fn detach_routes_by_f34_version() {
        let mut flash = RecordingFlash::default();
        let mut port = NullPort;
        dispatch_detach(&f34_with_version(0), &mut flash, &mut port).unwrap();
        dispatch_detach(&f34_with_version(1), &mut flash, &mut port).unwrap();
        dispatch_detach(&f34_with_version(2), &mut flash, &mut port).unwrap();
        assert_eq!(flash.calls, ["detach_v5", "detach_v5", "detach_v7"]);
    }

    #[test]
    fn unknown_f34_version_is_not_supported() {
        let mut flash = RecordingFlash::default();
        let mut port = NullPort;
        let err = dispatch_detach(&f34_with_version(3), &mut flash, &mut port).unwrap_err();
        assert!(matches!(
            RmiError::kind_of(&err),
            Some(RmiError::NotSupported(_))
        ));
        let err =
            dispatch_query_status(&f34_with_version(9), &mut flash, &mut port).unwrap_err();
        assert!(matches!(
            RmiError::kind_of(&err),
            Some(RmiError::NotSupported(_))
        ));
    }

    #[test]
    fn query_status_routes_by_f34_version() {
        let mut flash = RecordingFlash::default();
        let mut port = NullPort;
        dispatch_query_status(&f34_with_version(1), &mut flash, &mut port).unwrap();
        dispatch_query_status(&f34_with_version(2), &mut flash, &mut port).unwrap();
        assert_eq!(flash.calls, ["query_status_v5", "query_status_v7"]);
    }

    #[test]
    fn bus_kind_parses_known_names() {
        assert_eq!("hid".parse::<BusKind>().unwrap(), BusKind::Hid);
        assert_eq!("ps2".parse::<BusKind>().unwrap(), BusKind::Ps2);
        assert!("serio".parse::<BusKind>().is_err());
    }
}
