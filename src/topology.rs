use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::device::{self, Device};
use crate::error::Fatal;
use crate::resolver::MetadataResolver;

pub const IOMMU_GROUPS_ROOT: &str = "/sys/kernel/iommu_groups";

/// Yields raw `<group>/devices/<address>` association paths.
pub trait TopologySource {
    fn enumerate(&self) -> Result<Vec<PathBuf>>;
}

/// Walks `/sys/kernel/iommu_groups/*/devices/*`.
pub struct SysfsTopology {
    root: PathBuf,
}

impl SysfsTopology {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }
}

impl TopologySource for SysfsTopology {
    fn enumerate(&self) -> Result<Vec<PathBuf>> {
        // No groups directory at all means the IOMMU is off; the builder reports that.
        if !self.root.exists() {
            log::debug!("{} does not exist", self.root.display());
            return Ok(vec![]);
        }
        let mut out = vec![];
        for de in WalkDir::new(&self.root).min_depth(3).max_depth(3).follow_links(false).sort_by_file_name() {
            let de = de.with_context(|| format!("Unable to walk {}", self.root.display()))?;
            let in_devices = de.path().parent().and_then(|p| p.file_name()).map(|n| n == "devices").unwrap_or(false);
            if in_devices { out.push(de.into_path()); }
        }
        Ok(out)
    }
}

#[derive(Clone, Debug)]
pub struct Group {
    pub id: u32,
    pub devices: BTreeMap<String, Device>,
}

/// IOMMU groups keyed by group number. Read-only once built.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    groups: BTreeMap<u32, Group>,
}

impl Topology {
    pub fn build(source: &dyn TopologySource, resolver: &dyn MetadataResolver) -> Result<Self> {
        let mut groups: BTreeMap<u32, Group> = BTreeMap::new();
        let mut seen: HashSet<String> = HashSet::new();
        for path in source.enumerate()? {
            let Some((group_id, address)) = split_association(&path) else {
                log::trace!("skipping unparseable IOMMU entry {}", path.display());
                continue;
            };
            if !device::has_valid_domain(&address) {
                log::debug!("skipping {} in group {}: unsupported PCI domain", address, group_id);
                continue;
            }
            if !seen.insert(address.clone()) {
                log::debug!("skipping duplicate entry for {} in group {}", address, group_id);
                continue;
            }
            let dev = resolver.resolve(&address).with_context(|| format!("Failed to read PCI device {}", address))?;
            groups
                .entry(group_id)
                .or_insert_with(|| Group { id: group_id, devices: BTreeMap::new() })
                .devices
                .insert(address, dev);
        }
        if groups.is_empty() { return Err(Fatal::IommuDisabled.into()); }
        log::info!("found {} IOMMU groups with {} devices", groups.len(), seen.len());
        Ok(Self { groups })
    }

    pub fn group(&self, id: u32) -> Option<&Group> { self.groups.get(&id) }

    /// Every device with its owning group, in group then address order.
    pub fn devices(&self) -> impl Iterator<Item = (u32, &Device)> {
        self.groups.values().flat_map(|g| g.devices.values().map(move |d| (g.id, d)))
    }
}

/// Splits `.../<group>/devices/<address>` into its group number and address.
fn split_association(path: &Path) -> Option<(u32, String)> {
    let address = path.file_name()?.to_str()?;
    let devices = path.parent()?;
    if devices.file_name()? != "devices" { return None; }
    let group = devices.parent()?.file_name()?.to_str()?;
    let id = group.parse::<u32>().ok()?;
    Some((id, address.to_string()))
}
