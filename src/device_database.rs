/* Device database: maps matched hardware to a transport kind. */
/*                                                              */
/* Each supported device ships a `.device` INI file naming the  */
/* bus backend that can update it and the ids it enumerates     */
/* with. Lookup is keyed on `(bustype, vid, pid)`.              */

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use configparser::ini::Ini;
use tracing::{debug, warn};

use crate::transport::BusKind;

/* Bus identifier used in `.device` match patterns and DB keys. */
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BusType {
    Hidraw,
    Serio,
    Other(String),
}

impl BusType {
    pub fn from_str(s: &str) -> Self {
        match s {
            "hidraw" => BusType::Hidraw,
            "serio" => BusType::Serio,
            other => BusType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for BusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusType::Hidraw => f.write_str("hidraw"),
            BusType::Serio => f.write_str("serio"),
            BusType::Other(s) => f.write_str(s),
        }
    }
}

/* A parsed `.device` file entry describing a supported touch device. */
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub name: String,
    pub driver: BusKind,
    pub matches: Vec<DeviceMatch>,
    pub internal: bool,
}

/* A single bus:vid:pid match pattern from the `DeviceMatch=` field. */
#[derive(Debug, Clone)]
pub struct DeviceMatch {
    pub bustype: BusType,
    pub vid: u16,
    pub pid: u16,
}

/* Entries are reference-counted so that devices with multiple match
 * patterns share a single allocation instead of being duplicated. */
pub type DeviceDb = HashMap<(BusType, u16, u16), Arc<DeviceEntry>>;

/* Load every `.device` file under `data_dir` into a lookup table,
 * one key per id pattern a file declares. Files that fail to parse
 * are logged and left out; they never abort the load. */
pub fn load_device_database(data_dir: &Path) -> DeviceDb {
    let mut db = DeviceDb::new();

    let dir = match std::fs::read_dir(data_dir) {
        Ok(dir) => dir,
        Err(err) => {
            warn!("device data directory {:?} is unreadable: {}", data_dir, err);
            return db;
        }
    };

    for path in dir.flatten().map(|e| e.path()) {
        if path.extension().and_then(|e| e.to_str()) != Some("device") {
            continue;
        }
        let entry = match parse_device_file(&path) {
            Ok(entry) => Arc::new(entry),
            Err(err) => {
                warn!("skipping {:?}: {}", path, err);
                continue;
            }
        };
        for m in &entry.matches {
            db.insert((m.bustype.clone(), m.vid, m.pid), Arc::clone(&entry));
        }
        debug!(
            "{} registered with {} id pattern(s)",
            entry.name,
            entry.matches.len()
        );
    }

    debug!("device database holds {} keys", db.len());
    db
}

/* Parse one `.device` INI file. */
fn parse_device_file(path: &Path) -> Result<DeviceEntry, String> {
    let mut ini = Ini::new();
    ini.load(path).map_err(|e| format!("unreadable INI: {e}"))?;

    let get = |key: &str| {
        ini.get("device", key)
            .ok_or_else(|| format!("[Device] section lacks {key}"))
    };

    let name = get("name")?;
    let driver: BusKind = get("driver")?
        .parse()
        .map_err(|e| format!("bad Driver value: {e}"))?;
    let matches = parse_device_matches(&get("devicematch")?)?;
    let internal = ini
        .getboolcoerce("device", "internal")
        .ok()
        .flatten()
        .unwrap_or(false);

    Ok(DeviceEntry {
        name,
        driver,
        matches,
        internal,
    })
}

/* Split a `DeviceMatch=` field such as
 * `"hidraw:06cb:4f3c;serio:06cb:0009"` into its patterns. */
fn parse_device_matches(field: &str) -> Result<Vec<DeviceMatch>, String> {
    let mut out = Vec::new();

    for pattern in field.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let mut pieces = pattern.split(':');
        let (Some(bus), Some(vid), Some(pid), None) =
            (pieces.next(), pieces.next(), pieces.next(), pieces.next())
        else {
            return Err(format!("DeviceMatch needs bus:vid:pid, got '{pattern}'"));
        };
        let vid = u16::from_str_radix(vid, 16)
            .map_err(|e| format!("bad vendor id in '{pattern}': {e}"))?;
        let pid = u16::from_str_radix(pid, 16)
            .map_err(|e| format!("bad product id in '{pattern}': {e}"))?;
        out.push(DeviceMatch {
            bustype: BusType::from_str(bus),
            vid,
            pid,
        });
    }

    if out.is_empty() {
        return Err("no usable DeviceMatch patterns".to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_matches_single() {
        let matches = parse_device_matches("hidraw:06cb:4f3c").unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].bustype, BusType::Hidraw);
        assert_eq!(matches[0].vid, 0x06cb);
        assert_eq!(matches[0].pid, 0x4f3c);
    }

    #[test]
    fn test_parse_device_matches_multiple() {
        let matches = parse_device_matches("hidraw:06cb:4f3c;hidraw:06cb:4f3d").unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].pid, 0x4f3c);
        assert_eq!(matches[1].pid, 0x4f3d);
    }

    #[test]
    fn test_parse_device_matches_mixed_bus() {
        let matches = parse_device_matches("hidraw:06cb:4f3c;serio:06cb:0009").unwrap();
        assert_eq!(matches[0].bustype, BusType::Hidraw);
        assert_eq!(matches[1].bustype, BusType::Serio);
    }

    #[test]
    fn test_parse_device_matches_too_few_fields() {
        assert!(parse_device_matches("hidraw:06cb").is_err());
    }

    #[test]
    fn test_parse_device_matches_too_many_fields() {
        assert!(parse_device_matches("hidraw:06cb:4f3c:00").is_err());
    }

    #[test]
    fn test_parse_device_matches_empty() {
        assert!(parse_device_matches("").is_err());
    }

    #[test]
    fn test_bustype_display() {
        assert_eq!(BusType::Hidraw.to_string(), "hidraw");
        assert_eq!(BusType::Serio.to_string(), "serio");
        assert_eq!(BusType::Other("i2c".to_string()).to_string(), "i2c");
    }

    #[test]
    fn test_load_device_database() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("thinkpad-touchpad.device"),
            "[Device]\n\
             Name=ThinkPad Touchpad\n\
             Driver=hid\n\
             DeviceMatch=hidraw:06cb:4f3c;hidraw:06cb:4f3d\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("touchstyk.device"),
            "[Device]\n\
             Name=TouchStyk\n\
             Driver=ps2\n\
             DeviceMatch=serio:06cb:0009\n\
             Internal=1\n",
        )
        .unwrap();
        /* not a .device file, must be skipped */
        std::fs::write(dir.path().join("README"), "nothing").unwrap();

        let db = load_device_database(dir.path());
        assert_eq!(db.len(), 3);

        let pad = db.get(&(BusType::Hidraw, 0x06cb, 0x4f3d)).unwrap();
        assert_eq!(pad.name, "ThinkPad Touchpad");
        assert_eq!(pad.driver, BusKind::Hid);
        assert!(!pad.internal);

        let styk = db.get(&(BusType::Serio, 0x06cb, 0x0009)).unwrap();
        assert_eq!(styk.driver, BusKind::Ps2);
        assert!(styk.internal);
    }

    #[test]
    fn test_unknown_driver_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("bad.device"),
            "[Device]\nName=Bad\nDriver=spi\nDeviceMatch=hidraw:06cb:0001\n",
        )
        .unwrap();
        let db = load_device_database(dir.path());
        assert!(db.is_empty());
    }

    #[test]
    fn test_missing_driver_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("bad.device"),
            "[Device]\nName=Bad\nDeviceMatch=hidraw:06cb:0001\n",
        )
        .unwrap();
        let db = load_device_database(dir.path());
        assert!(db.is_empty());
    }
}
