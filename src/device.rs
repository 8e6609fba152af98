use regex::Regex;
use std::sync::OnceLock;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    pub address: String,
    pub vendor_id: u16,
    pub vendor_name: String,
    pub product_id: u16,
    pub product_name: String,
    pub class_id: u8,
    pub subclass_id: u8,
    pub subclass_name: String,
    pub revision: u8,
    pub subsystem_vendor_id: u16,
    pub subsystem_vendor_name: Option<String>,
    pub subsystem_id: u16,
    pub subsystem_name: Option<String>,
    pub driver: Option<String>,
}

impl Device {
    /// Bridges are structural units; they are never assignable on their own.
    pub fn is_bridge(&self) -> bool { self.subclass_name.contains("bridge") }

    pub fn id_token(&self) -> String { format!("{:04x}:{:04x}", self.vendor_id, self.product_id) }
}

static DOMAIN_RE: OnceLock<Regex> = OnceLock::new();

/// Accepts addresses whose PCI domain is 1-4 hex digits. Intel VMD exposes
/// domains such as `10000`, which the sysfs name lookup cannot handle.
pub fn has_valid_domain(address: &str) -> bool {
    let re = DOMAIN_RE.get_or_init(|| Regex::new(r"^[0-9a-fA-F]{1,4}:").expect("domain regex"));
    re.is_match(address)
}

/// Parses a vendor ID as typed on the command line or in config (`10de`, `0x10DE`).
pub fn parse_vendor_id(s: &str) -> Result<u16, String> {
    let t = s.trim();
    let t = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")).unwrap_or(t);
    if t.is_empty() || t.len() > 4 { return Err(format!("invalid vendor ID '{}': expected up to 4 hex digits", s)); }
    u16::from_str_radix(t, 16).map_err(|_| format!("invalid vendor ID '{}': expected up to 4 hex digits", s))
}

#[cfg(test)]
pub(crate) fn fixture(address: &str, vendor_id: u16, product_id: u16, subclass_name: &str) -> Device {
    Device {
        address: address.to_string(),
        vendor_id,
        vendor_name: format!("Vendor{:04x}", vendor_id),
        product_id,
        product_name: format!("Product{:04x}", product_id),
        class_id: 0x03,
        subclass_id: 0x00,
        subclass_name: subclass_name.to_string(),
        revision: 0,
        subsystem_vendor_id: 0,
        subsystem_vendor_name: None,
        subsystem_id: 0,
        subsystem_name: None,
        driver: None,
    }
}
