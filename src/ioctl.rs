/* Feature-report ioctls on hidraw descriptors. */

use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use anyhow::Result;
use nix::libc;
use tracing::debug;

use crate::error::RmiError;
use crate::io_channel::IoChannel;

/* Compute the `HIDIOCSFEATURE(len)` ioctl request number.        */
/*                                                                */
/* Linux hidraw.h: `_IOC(_IOC_READ|_IOC_WRITE, 'H', 0x06, len)`. */
pub fn hidiocsfeature(len: usize) -> libc::c_ulong {
    let ioc_readwrite: libc::c_ulong = 3;
    let ioc_type: libc::c_ulong = b'H' as libc::c_ulong;
    let ioc_nr: libc::c_ulong = 0x06;
    (ioc_readwrite << 30) | (ioc_type << 8) | ioc_nr | ((len as libc::c_ulong) << 16)
}

/* Compute the `HIDIOCGFEATURE(len)` ioctl request number.        */
/*                                                                */
/* Linux hidraw.h: `_IOC(_IOC_READ|_IOC_WRITE, 'H', 0x07, len)`. */
pub fn hidiocgfeature(len: usize) -> libc::c_ulong {
    let ioc_readwrite: libc::c_ulong = 3;
    let ioc_type: libc::c_ulong = b'H' as libc::c_ulong;
    let ioc_nr: libc::c_ulong = 0x07;
    (ioc_readwrite << 30) | (ioc_type << 8) | ioc_nr | ((len as libc::c_ulong) << 16)
}

/* Executes feature-report ioctls against the channel descriptor. */
pub struct IoctlGateway {
    fd: RawFd,
    label: String,
}

impl IoctlGateway {
    pub fn new(channel: &IoChannel) -> Self {
        Self {
            fd: channel.as_raw_fd(),
            label: channel.label().to_string(),
        }
    }

    /* Run `request` with `buf` as the payload, retrying EINTR until
     * the timeout budget is spent. Returns the kernel's byte count. */
    pub fn execute(
        &self,
        request: libc::c_ulong,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            /* SAFETY: `fd` is a valid open file descriptor for the     */
            /* lifetime of this call. `buf` is a live mutable slice and */
            /* its length is encoded into `request` via the ioctl       */
            /* macro, so the kernel touches exactly `buf.len()` bytes.  */
            let res = unsafe { libc::ioctl(self.fd, request, buf.as_mut_ptr()) };
            if res >= 0 {
                debug!("IOCTL {} bytes: {:02x?}", res, &buf[..]);
                return Ok(res as usize);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) if Instant::now() < deadline => continue,
                Some(libc::EPERM) | Some(libc::EACCES) => {
                    return Err(RmiError::PermissionDenied(format!(
                        "ioctl refused on {}: {err}",
                        self.label
                    ))
                    .into());
                }
                Some(libc::ETIMEDOUT) => {
                    return Err(RmiError::TimedOut(format!(
                        "ioctl timed out on {}",
                        self.label
                    ))
                    .into());
                }
                _ => {
                    return Err(RmiError::Io {
                        device: self.label.clone(),
                        source: err,
                    }
                    .into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_request_numbers_match_hidraw() {
        /* HIDIOCSFEATURE(2) as the kernel header expands it */
        assert_eq!(hidiocsfeature(2), 0xC002_4806);
        assert_eq!(hidiocgfeature(2), 0xC002_4807);
    }
}
