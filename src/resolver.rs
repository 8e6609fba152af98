use anyhow::{Context, Result};
use pci_ids::{FromId, Subclass, Vendor};
use std::path::{Path, PathBuf};

use crate::device::Device;

pub const PCI_DEVICES_ROOT: &str = "/sys/bus/pci/devices";

/// Turns a PCI address into a fully described [`Device`].
pub trait MetadataResolver {
    fn resolve(&self, address: &str) -> Result<Device>;
}

/// Reads raw IDs from sysfs and names them through the embedded PCI ID database.
pub struct SysfsResolver {
    root: PathBuf,
}

impl SysfsResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }
}

impl MetadataResolver for SysfsResolver {
    fn resolve(&self, address: &str) -> Result<Device> {
        let path = self.root.join(address);
        let vendor_id = read_hex(&path, "vendor")? as u16;
        let product_id = read_hex(&path, "device")? as u16;
        let class = read_hex(&path, "class")?;
        let class_id = (class >> 16) as u8;
        let subclass_id = (class >> 8) as u8;
        let revision = read_hex(&path, "revision")? as u8;
        let subsystem_vendor_id = read_optional_hex(&path, "subsystem_vendor")? as u16;
        let subsystem_id = read_optional_hex(&path, "subsystem_device")? as u16;
        let driver = read_driver(&path);
        let device = Device {
            address: address.to_string(),
            vendor_id,
            vendor_name: vendor_name(vendor_id).unwrap_or_else(|| format!("Vendor {:04x}", vendor_id)),
            product_id,
            product_name: product_name(vendor_id, product_id).unwrap_or_else(|| format!("Device {:04x}", product_id)),
            class_id,
            subclass_id,
            subclass_name: subclass_name(class_id, subclass_id).unwrap_or_else(|| format!("Class {:02x}{:02x}", class_id, subclass_id)),
            revision,
            subsystem_vendor_id,
            subsystem_vendor_name: vendor_name(subsystem_vendor_id),
            subsystem_id,
            subsystem_name: subsystem_name(vendor_id, product_id, subsystem_vendor_id, subsystem_id),
            driver,
        };
        log::trace!("resolved {} as {} {} [{}]", address, device.vendor_name, device.product_name, device.id_token());
        Ok(device)
    }
}

pub fn vendor_name(vendor_id: u16) -> Option<String> {
    Vendor::from_id(vendor_id).map(|v| v.name().to_string())
}

pub fn product_name(vendor_id: u16, product_id: u16) -> Option<String> {
    pci_ids::Device::from_vid_pid(vendor_id, product_id).map(|d| d.name().to_string())
}

pub fn subclass_name(class_id: u8, subclass_id: u8) -> Option<String> {
    Subclass::from_cid_sid(class_id, subclass_id).map(|s| s.name().to_string())
}

fn subsystem_name(vendor_id: u16, product_id: u16, subvendor: u16, subdevice: u16) -> Option<String> {
    let dev = pci_ids::Device::from_vid_pid(vendor_id, product_id)?;
    dev.subsystems()
        .find(|s| s.subvendor() == subvendor && s.subdevice() == subdevice)
        .map(|s| s.name().to_string())
}

fn read_hex(dev_path: &Path, attr: &str) -> Result<u32> {
    let p = dev_path.join(attr);
    let raw = std::fs::read_to_string(&p).with_context(|| format!("Failed to read {}", p.display()))?;
    let v = raw.trim();
    let v = v.strip_prefix("0x").unwrap_or(v);
    u32::from_str_radix(v, 16).with_context(|| format!("Failed to parse hex value '{}' from {}", raw.trim(), p.display()))
}

/// Like [`read_hex`], but an absent attribute reads as 0. Host bridges and
/// some virtual functions do not expose subsystem IDs.
fn read_optional_hex(dev_path: &Path, attr: &str) -> Result<u32> {
    match read_hex(dev_path, attr) {
        Err(e) if e.downcast_ref::<std::io::Error>().map(|io| io.kind() == std::io::ErrorKind::NotFound).unwrap_or(false) => Ok(0),
        r => r,
    }
}

fn read_driver(dev_path: &Path) -> Option<String> {
    std::fs::read_link(dev_path.join("driver"))
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_attrs(root: &Path, address: &str, attrs: &[(&str, &str)]) -> PathBuf {
        let dir = root.join(address);
        std::fs::create_dir_all(&dir).unwrap();
        for (k, v) in attrs { std::fs::write(dir.join(k), format!("{}\n", v)).unwrap(); }
        dir
    }

    #[test]
    fn resolves_ids_and_names_from_sysfs() {
        let tmp = tempfile::tempdir().unwrap();
        write_attrs(tmp.path(), "0000:00:02.0", &[
            ("vendor", "0x8086"), ("device", "0x3e92"), ("class", "0x030000"), ("revision", "0x02"),
            ("subsystem_vendor", "0x1043"), ("subsystem_device", "0x8694"),
        ]);
        let dev = SysfsResolver::new(tmp.path()).resolve("0000:00:02.0").unwrap();
        assert_eq!(dev.vendor_id, 0x8086);
        assert_eq!(dev.product_id, 0x3e92);
        assert_eq!(dev.class_id, 0x03);
        assert_eq!(dev.subclass_id, 0x00);
        assert_eq!(dev.revision, 0x02);
        assert_eq!(dev.subsystem_vendor_id, 0x1043);
        assert_eq!(dev.subsystem_id, 0x8694);
        assert!(dev.vendor_name.starts_with("Intel"));
        assert_eq!(dev.subclass_name, "VGA compatible controller");
        assert_eq!(dev.driver, None);
    }

    #[cfg(unix)]
    #[test]
    fn driver_is_read_from_symlink_name() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_attrs(tmp.path(), "0000:01:00.0", &[
            ("vendor", "0x10de"), ("device", "0x2204"), ("class", "0x030000"), ("revision", "0xa1"),
        ]);
        let drv = tmp.path().join("drivers").join("vfio-pci");
        std::fs::create_dir_all(&drv).unwrap();
        std::os::unix::fs::symlink(&drv, dir.join("driver")).unwrap();
        let dev = SysfsResolver::new(tmp.path()).resolve("0000:01:00.0").unwrap();
        assert_eq!(dev.driver.as_deref(), Some("vfio-pci"));
        assert_eq!(dev.subsystem_vendor_id, 0);
        assert_eq!(dev.revision, 0xa1);
    }

    #[test]
    fn garbled_subsystem_id_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        write_attrs(tmp.path(), "0000:02:00.0", &[
            ("vendor", "0x8086"), ("device", "0x1533"), ("class", "0x020000"), ("revision", "0x03"),
            ("subsystem_vendor", "0xzz"), ("subsystem_device", "0x0000"),
        ]);
        let err = SysfsResolver::new(tmp.path()).resolve("0000:02:00.0").unwrap_err();
        assert!(format!("{:#}", err).contains("subsystem_vendor"));
    }

    #[test]
    fn missing_device_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = SysfsResolver::new(tmp.path()).resolve("0000:09:00.0").unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
