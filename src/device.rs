/* Device state and the update choreography that crosses the
 * transport boundary: reset, sleep control, and the detach/attach
 * transitions between runtime and bootloader personalities. */

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use bitflags::bitflags;
use tracing::debug;

use crate::device_database::DeviceEntry;
use crate::error::RmiError;
use crate::progress::{ProgressStep, UPDATE_PROGRESS_STEPS};
use crate::transport::{
    BusKind, FlashController, Ps2Transport, RmiTransport, Transport, TransportFlags,
    dispatch_detach, dispatch_query_status,
};

/* F01 command register: device reset */
const RMI_F01_CMD_DEVICE_RESET: u8 = 0x01;

/* This bit disables whatever sleep mode may be selected by the
 * sleep_mode field and forces the device to run at full power. */
const RMI_F01_CTRL0_NOSLEEP_BIT: u8 = 1 << 2;

/* Sleep mode controls power management on the device and affects
 * all functions of the device. */
const RMI_F01_CTRL0_SLEEP_MODE_MASK: u8 = 0x03;
const RMI_SLEEP_MODE_NORMAL: u8 = 0x00;

/* How long a replug may take after a rebind before the device is
 * declared gone. */
const REMOVE_DELAY_RE_ENUMERATE: Duration = Duration::from_millis(10_000);

/* The reset self-test runs device-internal for 300-500ms. */
const RESET_SETTLE_DELAY: Duration = Duration::from_millis(500);

/* Attach choreography delays around the final reset. */
const ATTACH_IEP_DELAY: Duration = Duration::from_secs(2);
const ATTACH_RESET_DELAY: Duration = Duration::from_secs(5);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags: u8 {
        const NONE = 0;
        /* The PS/2 port is bound to serio_raw, never psmouse. */
        const IS_BOOTLOADER = 1 << 0;
        /* Suspend teardown until the replug event arrives. */
        const WAIT_FOR_REPLUG = 1 << 1;
        /* Built-in device, not removable by the user. */
        const INTERNAL = 1 << 2;
    }
}

/* One entry of the Page Description Table: an RMI function and its
 * register bases. Discovered by the function layer during setup and
 * immutable until the next rebind. */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RmiFunction {
    pub number: u8,
    pub function_version: u8,
    pub query_base: u16,
    pub command_base: u16,
    pub control_base: u16,
    pub data_base: u16,
}

/* A concrete touch device bound to one transport. */
#[derive(Debug)]
pub struct RmiDevice {
    name: String,
    vendor: String,
    vendor_id: u16,
    remove_delay: Duration,
    flags: DeviceFlags,
    functions: Vec<RmiFunction>,
    transport: Transport,
}

impl RmiDevice {
    pub fn new_hid(transport: crate::transport::HidTransport) -> Self {
        Self {
            name: "Touchpad".to_string(),
            vendor: String::new(),
            vendor_id: 0,
            remove_delay: REMOVE_DELAY_RE_ENUMERATE,
            flags: DeviceFlags::NONE,
            functions: Vec::new(),
            transport: Transport::Hid(transport),
        }
    }

    pub fn new_ps2(transport: Ps2Transport) -> Self {
        Self {
            name: "TouchStyk".to_string(),
            vendor: "Synaptics".to_string(),
            vendor_id: 0x06cb,
            remove_delay: REMOVE_DELAY_RE_ENUMERATE,
            flags: DeviceFlags::INTERNAL,
            functions: Vec::new(),
            transport: Transport::Ps2(transport),
        }
    }

    /* Build a device from a matched `.device` entry: the database
     * decides the backend, the display name, and whether the device
     * counts as built-in. */
    pub fn from_entry(entry: &DeviceEntry, transport: Transport) -> Result<Self> {
        if entry.driver != transport.bus() {
            return Err(RmiError::Internal(format!(
                "{} expects the {} transport, got {}",
                entry.name,
                entry.driver,
                transport.bus()
            ))
            .into());
        }
        let mut dev = match transport {
            Transport::Hid(hid) => Self::new_hid(hid),
            Transport::Ps2(ps2) => Self::new_ps2(ps2),
        };
        dev.name = entry.name.clone();
        dev.flags.set(DeviceFlags::INTERNAL, entry.internal);
        Ok(dev)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn remove_delay(&self) -> Duration {
        self.remove_delay
    }

    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }

    pub fn bus(&self) -> BusKind {
        self.transport.bus()
    }

    /* The register-level interface handed to the function layer;
     * borrowed per call, never owned. */
    pub fn transport(&mut self) -> &mut dyn RmiTransport {
        self.transport.as_dyn()
    }

    /* Replace the function table after a PDT scan. */
    pub fn set_functions(&mut self, functions: Vec<RmiFunction>) {
        self.functions = functions;
    }

    /* A reset or rebind invalidates everything discovered so far. */
    pub fn clear_functions(&mut self) {
        self.functions.clear();
    }

    pub fn function(&self, number: u8) -> Result<&RmiFunction> {
        match self.functions.iter().find(|f| f.number == number) {
            Some(f) => Ok(f),
            None => Err(RmiError::Internal(format!("no function {number:#04x}")).into()),
        }
    }

    /* Sync device state with the kernel side: on PS/2 the bound
     * driver decides whether we are in bootloader mode. */
    pub fn probe(&mut self) -> Result<()> {
        self.rescan()
    }

    pub fn rescan(&mut self) -> Result<()> {
        match &mut self.transport {
            Transport::Hid(_) => Ok(()),
            Transport::Ps2(ps2) => {
                let bootloader = ps2.rescan()?;
                self.flags.set(DeviceFlags::IS_BOOTLOADER, bootloader);
                Ok(())
            }
        }
    }

    pub fn open(&mut self) -> Result<()> {
        let bootloader = self.flags.contains(DeviceFlags::IS_BOOTLOADER);
        match &mut self.transport {
            Transport::Hid(hid) => hid.open(),
            Transport::Ps2(ps2) => ps2.open(bootloader),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        match &mut self.transport {
            Transport::Hid(hid) => hid.close(),
            Transport::Ps2(ps2) => ps2.close(),
        }
    }

    /* Issue the F01 device-reset command. The firmware will not ack
     * it, and takes its time coming back. */
    pub fn reset(&mut self) -> Result<()> {
        let f01 = self.function(0x01)?.clone();
        self.transport
            .write(
                f01.command_base,
                &[RMI_F01_CMD_DEVICE_RESET],
                TransportFlags::ALLOW_FAILURE,
            )
            .context("failed to write reset command")?;
        std::thread::sleep(RESET_SETTLE_DELAY);
        Ok(())
    }

    /* Force the device to full power so the flash state machine is
     * not interrupted mid-programming. */
    pub fn disable_sleep(&mut self) -> Result<()> {
        let f01 = self.function(0x34)?.clone();
        let mut f01_control0 = self
            .transport
            .read(f01.control_base, 0x1)
            .context("failed to read f01 control0")?;
        f01_control0[0] |= RMI_F01_CTRL0_NOSLEEP_BIT;
        f01_control0[0] =
            (f01_control0[0] & !RMI_F01_CTRL0_SLEEP_MODE_MASK) | RMI_SLEEP_MODE_NORMAL;
        self.transport
            .write(f01.control_base, &f01_control0, TransportFlags::NONE)
            .context("failed to write f01 control0")?;
        Ok(())
    }

    /* Route a flash status query to the right F34 generation. */
    pub fn query_status(&mut self, flash: &mut dyn FlashController) -> Result<()> {
        let f34 = self.function(0x34)?.clone();
        dispatch_query_status(&f34, flash, self.transport.as_dyn())
    }

    /* Move the device into bootloader mode so firmware can be
     * written. */
    pub fn detach(&mut self, flash: &mut dyn FlashController) -> Result<()> {
        match self.transport.bus() {
            BusKind::Hid => {
                let f34 = self.function(0x34)?.clone();
                dispatch_detach(&f34, flash, self.transport.as_dyn())?;
                self.rebind_driver()
            }
            BusKind::Ps2 => {
                if self.flags.contains(DeviceFlags::IS_BOOTLOADER) {
                    debug!("already in bootloader mode, skipping");
                    return Ok(());
                }

                /* register writes need serio_raw */
                self.ps2_mut()?
                    .write_drvctl("serio_raw")
                    .context("failed to write to drvctl")?;

                /* the fd now points at the serio_raw node */
                self.close()?;
                self.rescan()?;
                self.open()?;

                let f34 = self.function(0x34)?.clone();
                dispatch_detach(&f34, flash, self.transport.as_dyn())?;

                /* the firmware wants iep mode re-armed before it will
                 * answer status queries */
                self.transport.enter_iep_mode(TransportFlags::FORCE)?;
                dispatch_query_status(&f34, flash, self.transport.as_dyn())
                    .context("failed to query status after detach")
            }
        }
    }

    /* Return the device to runtime mode with the new firmware. */
    pub fn attach(&mut self) -> Result<()> {
        if !self.flags.contains(DeviceFlags::IS_BOOTLOADER) {
            debug!("already in runtime mode, skipping");
            return Ok(());
        }
        match self.transport.bus() {
            BusKind::Hid => {
                self.reset()?;
                /* rebind to rescan the PDT with the new firmware */
                self.rebind_driver()
            }
            BusKind::Ps2 => {
                /* the firmware wants a fresh iep entry before the
                 * final reset */
                self.transport.set_iepmode(false);
                std::thread::sleep(ATTACH_IEP_DELAY);
                self.transport.enter_iep_mode(TransportFlags::NONE)?;
                self.reset().context("failed to reset device")?;
                std::thread::sleep(ATTACH_RESET_DELAY);

                /* back to psmouse */
                self.ps2_mut()?
                    .write_drvctl("psmouse")
                    .context("failed to write to drvctl")?;
                self.rescan()
            }
        }
    }

    /* The fixed progress-step weights published to the update
     * shell. */
    pub fn progress_steps(&self) -> &'static [ProgressStep] {
        &UPDATE_PROGRESS_STEPS
    }

    fn ps2_mut(&mut self) -> Result<&mut Ps2Transport> {
        match &mut self.transport {
            Transport::Ps2(ps2) => Ok(ps2),
            Transport::Hid(_) => {
                Err(RmiError::Internal("not a ps2 device".to_string()).into())
            }
        }
    }

    fn rebind_driver(&mut self) -> Result<()> {
        let syspath = match &self.transport {
            Transport::Hid(hid) => hid.syspath().map(Path::to_path_buf),
            Transport::Ps2(_) => None,
        };
        let syspath = syspath.ok_or_else(|| {
            RmiError::InvalidFile("no sysfs path recorded for this device".to_string())
        })?;
        crate::rebind::rebind_driver(&syspath, &mut self.flags)
    }
}
