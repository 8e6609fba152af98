use std::collections::HashSet;

use crate::device::Device;
use crate::error::Fatal;
use crate::query::{Hit, Projection};

pub const DEFAULT_FORMAT: &str = "pciaddr,subclass_name,subclass_id,name,device_id,optional_revision";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field { PciAddr, SubclassName, SubclassId, Name, DeviceId, Vendor, ProdName, Oem, Revision, OptionalRevision }

/// One `-F` token. `colon` appends a `:` to the rendered value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    pub field: Field,
    pub colon: bool,
}

/// Parses a comma separated field list. Unknown tokens are dropped.
pub fn parse_format(s: &str) -> Vec<FieldSpec> {
    let mut out = vec![];
    for tok in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (name, colon) = match tok.strip_suffix(':') { Some(n) => (n, true), None => (tok, false) };
        let field = match name {
            "pciaddr" => Field::PciAddr,
            "subclass_name" => Field::SubclassName,
            "subclass_id" => Field::SubclassId,
            "name" => Field::Name,
            "device_id" => Field::DeviceId,
            "vendor" => Field::Vendor,
            "prod_name" => Field::ProdName,
            "oem" => Field::Oem,
            "revision" if !colon => Field::Revision,
            "optional_revision" if !colon => Field::OptionalRevision,
            _ => { log::debug!("ignoring unknown format field '{}'", tok); continue; }
        };
        out.push(FieldSpec { field, colon });
    }
    out
}

pub struct Formatter {
    pub fields: Vec<FieldSpec>,
    pub legacy: bool,
    pub kernel: bool,
    pub projection: Projection,
}

impl Formatter {
    fn group_label(&self, group: u32) -> String {
        if self.legacy { format!("IOMMU Group {}:", group) } else { format!("IOMMU Group {:03}:", group) }
    }

    fn field(&self, spec: FieldSpec, dev: &Device) -> Option<String> {
        let v = match spec.field {
            Field::PciAddr => dev.address.clone(),
            Field::SubclassName => dev.subclass_name.clone(),
            Field::SubclassId => format!("[{:02x}{:02x}]", dev.class_id, dev.subclass_id),
            Field::Name => format!("{} {}", dev.vendor_name, dev.product_name),
            Field::DeviceId => format!("[{}]", dev.id_token()),
            Field::Vendor => dev.vendor_name.clone(),
            Field::ProdName => dev.product_name.clone(),
            Field::Oem => dev.subsystem_vendor_name.clone().unwrap_or_else(|| dev.vendor_name.clone()),
            Field::Revision => format!("(rev {:02x})", dev.revision),
            Field::OptionalRevision if dev.revision == 0 => return None,
            Field::OptionalRevision => format!("(rev {:02x})", dev.revision),
        };
        Some(if spec.colon { format!("{}:", v) } else { v })
    }

    pub fn device_line(&self, group: u32, dev: &Device) -> String {
        let mut parts = vec![self.group_label(group)];
        parts.extend(self.fields.iter().filter_map(|f| self.field(*f, dev)));
        parts.join(" ")
    }

    /// `\tSubsystem:` and `\tKernel driver in use:` lines, each omitted when unknown.
    pub fn kernel_lines(&self, dev: &Device) -> Vec<String> {
        let mut out = vec![];
        if dev.subsystem_vendor_id != 0 || dev.subsystem_id != 0 {
            let subvendor = dev.subsystem_vendor_name.as_deref().unwrap_or(&dev.vendor_name);
            let subsystem = dev.subsystem_name.as_deref().unwrap_or(&dev.product_name);
            out.push(format!("\tSubsystem: {} {} [{:04x}:{:04x}]", subvendor, subsystem, dev.subsystem_vendor_id, dev.subsystem_id));
        }
        if let Some(drv) = dev.driver.as_deref().filter(|d| !d.is_empty()) {
            out.push(format!("\tKernel driver in use: {}", drv));
        }
        out
    }

    pub fn render(&self, hit: &Hit) -> String {
        match self.projection {
            Projection::Id => hit.device.id_token(),
            Projection::Address => hit.device.address.clone(),
            Projection::Full => {
                let mut lines = vec![self.device_line(hit.group, hit.device)];
                if self.kernel { lines.extend(self.kernel_lines(hit.device)); }
                lines.join("\n")
            }
        }
    }

    pub fn render_all(&self, hits: &[Hit]) -> Vec<String> { hits.iter().map(|h| self.render(h)).collect() }
}

/// Drops exact duplicates. Sorted output unless `legacy`, which keeps
/// first-occurrence order.
pub fn normalize(lines: Vec<String>, legacy: bool) -> Vec<String> {
    if legacy {
        let mut seen: HashSet<String> = HashSet::new();
        return lines.into_iter().filter(|l| seen.insert(l.clone())).collect();
    }
    let mut lines = lines;
    lines.sort();
    lines.dedup();
    lines
}

/// An empty report either means no IOMMU, or that only bridges matched a token projection.
pub fn check_nonempty(lines: &[String], projection: Projection) -> Result<(), Fatal> {
    if !lines.is_empty() { return Ok(()); }
    match projection {
        Projection::Full => Err(Fatal::IommuDisabled),
        Projection::Id | Projection::Address => Err(Fatal::BridgeOnly),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fixture;
    use crate::query::{Query, QueryOptions};
    use crate::topology::fixtures::topology;
    use proptest::prelude::*;

    fn formatter(legacy: bool) -> Formatter {
        Formatter { fields: parse_format(DEFAULT_FORMAT), legacy, kernel: false, projection: Projection::Full }
    }

    fn gpu() -> Device {
        let mut d = fixture("0000:01:00.0", 0x10de, 0x2204, "VGA compatible controller");
        d.vendor_name = "NVIDIA Corporation".to_string();
        d.product_name = "GA102 [GeForce RTX 3090]".to_string();
        d.revision = 0xa1;
        d
    }

    #[test]
    fn default_line_layout() {
        let line = formatter(false).device_line(14, &gpu());
        assert_eq!(line, "IOMMU Group 014: 0000:01:00.0 VGA compatible controller [0300] NVIDIA Corporation GA102 [GeForce RTX 3090] [10de:2204] (rev a1)");
    }

    #[test]
    fn legacy_group_number_is_unpadded() {
        assert!(formatter(true).device_line(7, &gpu()).starts_with("IOMMU Group 7: "));
        assert!(formatter(false).device_line(7, &gpu()).starts_with("IOMMU Group 007: "));
    }

    #[test]
    fn optional_revision_hides_zero() {
        let mut d = gpu();
        d.revision = 0;
        let f = formatter(false);
        assert!(f.device_line(1, &d).ends_with("[10de:2204]"));
        let always = Formatter { fields: parse_format("pciaddr,revision"), ..formatter(false) };
        assert_eq!(always.device_line(1, &d), "IOMMU Group 001: 0000:01:00.0 (rev 00)");
    }

    #[test]
    fn custom_field_order_with_colons_and_unknown_tokens() {
        let f = Formatter { fields: parse_format("device_id:,bogus,name,subclass_name:"), ..formatter(false) };
        assert_eq!(f.device_line(2, &gpu()), "IOMMU Group 002: [10de:2204]: NVIDIA Corporation GA102 [GeForce RTX 3090] VGA compatible controller:");
        assert!(parse_format("revision:,optional_revision:,,nope").is_empty());
    }

    #[test]
    fn kernel_lines_skip_unknown_values() {
        let f = formatter(false);
        let mut d = gpu();
        assert!(f.kernel_lines(&d).is_empty());
        d.subsystem_vendor_id = 0x1043;
        d.subsystem_id = 0x87b3;
        d.driver = Some("nvidia".to_string());
        assert_eq!(f.kernel_lines(&d), vec![
            "\tSubsystem: NVIDIA Corporation GA102 [GeForce RTX 3090] [1043:87b3]".to_string(),
            "\tKernel driver in use: nvidia".to_string(),
        ]);
        d.subsystem_vendor_name = Some("ASUSTeK Computer Inc.".to_string());
        d.subsystem_name = Some("ROG STRIX".to_string());
        d.driver = Some(String::new());
        assert_eq!(f.kernel_lines(&d), vec!["\tSubsystem: ASUSTeK Computer Inc. ROG STRIX [1043:87b3]".to_string()]);
    }

    #[test]
    fn render_with_kernel_detail_appends_continuation() {
        let mut d = gpu();
        d.driver = Some("vfio-pci".to_string());
        let topo = topology(vec![(3, d)]);
        let opts = QueryOptions::default();
        let hits = Query::new(&topo, &opts).all();
        let f = Formatter { kernel: true, ..formatter(false) };
        let out = f.render_all(&hits);
        assert_eq!(out.len(), 1);
        assert!(out[0].ends_with("(rev a1)\n\tKernel driver in use: vfio-pci"));
    }

    #[test]
    fn two_vga_devices_render_two_lines() {
        let mut other = fixture("0000:0a:00.0", 0x1002, 0x73bf, "VGA compatible controller");
        other.vendor_name = "Advanced Micro Devices, Inc. [AMD/ATI]".to_string();
        other.product_name = "Navi 21".to_string();
        let topo = topology(vec![
            (1, gpu()),
            (1, fixture("0000:01:00.1", 0x10de, 0x1aef, "Audio device")),
            (30, other),
        ]);
        let opts = QueryOptions::default();
        let f = formatter(false);
        let out = normalize(f.render_all(&Query::new(&topo, &opts).by_subclass("VGA")), false);
        assert_eq!(out, vec![
            "IOMMU Group 001: 0000:01:00.0 VGA compatible controller [0300] NVIDIA Corporation GA102 [GeForce RTX 3090] [10de:2204] (rev a1)".to_string(),
            "IOMMU Group 030: 0000:0a:00.0 VGA compatible controller [0300] Advanced Micro Devices, Inc. [AMD/ATI] Navi 21 [1002:73bf]".to_string(),
        ]);
    }

    #[test]
    fn id_projection_skips_bridge() {
        let topo = topology(vec![
            (5, fixture("0000:00:1c.0", 0x8086, 0xa110, "PCI bridge")),
            (5, fixture("0000:03:00.0", 0x8086, 0x1533, "Ethernet controller")),
        ]);
        let opts = QueryOptions { projection: Projection::Id, ..Default::default() };
        let f = Formatter { projection: Projection::Id, ..formatter(false) };
        let out = normalize(f.render_all(&Query::new(&topo, &opts).by_groups(&[5], 0).hits), false);
        assert_eq!(out, vec!["8086:1533".to_string()]);
        let opts = QueryOptions { projection: Projection::Address, ..Default::default() };
        let f = Formatter { projection: Projection::Address, ..formatter(false) };
        let out = f.render_all(&Query::new(&topo, &opts).by_groups(&[5], 0).hits);
        assert_eq!(out, vec!["0000:03:00.0".to_string()]);
    }

    #[test]
    fn legacy_normalize_keeps_emission_order() {
        let lines: Vec<String> = ["IOMMU Group 9: b", "IOMMU Group 10: a", "IOMMU Group 9: b", "IOMMU Group 2: c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(normalize(lines.clone(), true), vec!["IOMMU Group 9: b", "IOMMU Group 10: a", "IOMMU Group 2: c"]);
        assert_eq!(normalize(lines, false), vec!["IOMMU Group 10: a", "IOMMU Group 2: c", "IOMMU Group 9: b"]);
    }

    #[test]
    fn empty_result_conditions() {
        assert_eq!(check_nonempty(&[], Projection::Full), Err(Fatal::IommuDisabled));
        assert_eq!(check_nonempty(&[], Projection::Id), Err(Fatal::BridgeOnly));
        assert_eq!(check_nonempty(&[], Projection::Address), Err(Fatal::BridgeOnly));
        assert_eq!(check_nonempty(&["x".to_string()], Projection::Id), Ok(()));
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(lines in proptest::collection::vec("[a-c ]{0,4}", 0..20), legacy in any::<bool>()) {
            let once = normalize(lines, legacy);
            prop_assert_eq!(normalize(once.clone(), legacy), once);
        }
    }
}
