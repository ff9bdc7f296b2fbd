/* Transport core for updating Synaptics RMI4 touch devices on Linux.
 *
 * RMI4 is a 16-bit register space partitioned into functions (F01
 * control, F34 flash, ...). This crate turns "read/write N bytes at an
 * RMI address" into correctly framed exchanges on the two buses that
 * reach real hardware:
 *
 * - HID over hidraw: fixed 21-byte report envelopes.
 * - PS/2: legacy Set-Resolution/Set-Sample-Rate escape sequences with
 *   a per-byte ack handshake, reachable only while `serio_raw` owns
 *   the port.
 *
 * The function layer (PDT scan, F34 v5/v7 flash state machines) and
 * the update shell are consumers: they drive `RmiDevice` and the
 * `RmiTransport` trait, and plug their flash logic in through
 * `FlashController`. */

pub mod device;
pub mod device_database;
pub mod error;
pub mod io_channel;
pub mod ioctl;
pub mod progress;
pub mod rebind;
pub mod transport;

pub use crate::device::{DeviceFlags, RmiDevice, RmiFunction};
pub use crate::device_database::{DeviceDb, DeviceEntry, DeviceMatch, load_device_database};
pub use crate::error::RmiError;
pub use crate::io_channel::{IoChannel, IoFlags};
pub use crate::progress::{ProgressStatus, ProgressStep, UPDATE_PROGRESS_STEPS};
pub use crate::transport::{
    BusKind, FlashController, HidTransport, Ps2Transport, RmiTransport, Transport, TransportFlags,
};
