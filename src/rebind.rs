/* Forcing a replug by unbinding and rebinding the physical parent
 * driver through sysfs. The hidraw node sits under a `hid` parent,
 * whose own parent on `i2c` or `usb` is the device the kernel
 * driver is actually bound to; its syspath leaf is the id the
 * bind/unbind files expect. */

use std::path::Path;

use anyhow::Result;
use tracing::debug;

use crate::device::DeviceFlags;
use crate::error::RmiError;

const SYSFS_BUS_ROOT: &str = "/sys/bus";

pub(crate) struct RebindTarget {
    pub subsystem: String,
    pub driver: String,
    pub physical_id: String,
}

fn locate_target(syspath: &Path) -> Result<RebindTarget> {
    let dev = udev::Device::from_syspath(syspath).map_err(|e| {
        RmiError::InvalidFile(format!("no device at {}: {e}", syspath.display()))
    })?;

    /* get the actual HID node */
    let parent_hid = dev
        .parent_with_subsystem("hid")
        .ok()
        .flatten()
        .ok_or_else(|| {
            RmiError::InvalidFile(format!("no hid parent for {}", syspath.display()))
        })?;

    /* the physical device is on i2c or usb */
    let parent_phys = dev
        .parent_with_subsystem("i2c")
        .ok()
        .flatten()
        .or_else(|| dev.parent_with_subsystem("usb").ok().flatten())
        .ok_or_else(|| {
            RmiError::InvalidFile(format!(
                "no parent device for {}",
                parent_hid.syspath().display()
            ))
        })?;

    let physical_id = parent_phys.sysname().to_string_lossy().into_owned();
    debug!("physical id: {physical_id}");

    let driver = parent_phys
        .driver()
        .map(|d| d.to_string_lossy().into_owned())
        .ok_or_else(|| {
            RmiError::InvalidFile(format!(
                "no driver for {}",
                parent_phys.syspath().display()
            ))
        })?;
    let subsystem = parent_phys
        .subsystem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| {
            RmiError::InvalidFile(format!(
                "no subsystem for {}",
                parent_phys.syspath().display()
            ))
        })?;

    Ok(RebindTarget {
        subsystem,
        driver,
        physical_id,
    })
}

fn writeln_sysfs(path: &Path, value: &str) -> Result<()> {
    std::fs::write(path, format!("{value}\n")).map_err(|source| match source.kind() {
        std::io::ErrorKind::NotFound => anyhow::Error::from(RmiError::InvalidFile(format!(
            "no sysfs attribute at {}",
            path.display()
        ))),
        std::io::ErrorKind::PermissionDenied => RmiError::PermissionDenied(format!(
            "cannot write {}",
            path.display()
        ))
        .into(),
        _ => RmiError::Io {
            device: path.display().to_string(),
            source,
        }
        .into(),
    })
}

/* Unbind then bind again under `bus_root`. The replug flag must be
 * raised before the unbind lands, or the shell tears the device
 * down as removed. */
pub(crate) fn rebind_at(
    bus_root: &Path,
    target: &RebindTarget,
    flags: &mut DeviceFlags,
) -> Result<()> {
    let driver_dir = bus_root
        .join(&target.subsystem)
        .join("drivers")
        .join(&target.driver);
    flags.insert(DeviceFlags::WAIT_FOR_REPLUG);
    writeln_sysfs(&driver_dir.join("unbind"), &target.physical_id)?;
    writeln_sysfs(&driver_dir.join("bind"), &target.physical_id)?;
    Ok(())
}

/* Unbind and rebind the physical parent of the device at `syspath`
 * to force re-enumeration. */
pub fn rebind_driver(syspath: &Path, flags: &mut DeviceFlags) -> Result<()> {
    let target = locate_target(syspath)?;
    rebind_at(Path::new(SYSFS_BUS_ROOT), &target, flags)
}
