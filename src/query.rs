use regex::Regex;
use std::sync::OnceLock;

use crate::device::Device;
use crate::topology::Topology;

/// Deepest related search: vendor matches, then the groups of those matches.
pub const MAX_RELATED: u8 = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Projection {
    #[default]
    Full,
    Id,
    Address,
}

#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    pub related: u8,
    pub ignore: Vec<u16>,
    pub groups: Vec<u32>,
    pub projection: Projection,
}

#[derive(Clone, Copy, Debug)]
pub struct Hit<'t> {
    pub group: u32,
    pub device: &'t Device,
}

#[derive(Debug, Default)]
pub struct GroupListing<'t> {
    pub hits: Vec<Hit<'t>>,
    pub missing: Vec<u32>,
}

static RELATIVE_EXCEPTIONS: OnceLock<Regex> = OnceLock::new();

/// SATA and USB controllers commonly come from cheap chipsets shared by many
/// unrelated devices, so vendor matching pulls in noise. They only expand
/// to their own group.
fn is_relative_exception(pattern: &str) -> bool {
    let re = RELATIVE_EXCEPTIONS.get_or_init(|| Regex::new(r"^(SATA|USB) controller").expect("exception regex"));
    re.is_match(pattern)
}

pub struct Query<'t> {
    topo: &'t Topology,
    opts: &'t QueryOptions,
}

impl<'t> Query<'t> {
    pub fn new(topo: &'t Topology, opts: &'t QueryOptions) -> Self { Self { topo, opts } }

    fn visible(&self, dev: &Device) -> bool { self.opts.projection == Projection::Full || !dev.is_bridge() }

    fn related_depth(&self) -> u8 { self.opts.related.min(MAX_RELATED) }

    /// Every device on the host.
    pub fn all(&self) -> Vec<Hit<'t>> {
        self.topo.devices().filter(|(_, d)| self.visible(d)).map(|(group, device)| Hit { group, device }).collect()
    }

    /// Devices whose subclass name contains `pattern`, plus their relatives.
    pub fn by_subclass(&self, pattern: &str) -> Vec<Hit<'t>> {
        let exception = is_relative_exception(pattern);
        let depth = self.related_depth();
        let mut out = vec![];
        for (group, device) in self.topo.devices() {
            if !device.subclass_name.contains(pattern) { continue; }
            if !self.opts.groups.is_empty() && !self.opts.groups.contains(&group) { continue; }
            if !self.visible(device) { continue; }
            out.push(Hit { group, device });
            if depth == 0 { continue; }
            if exception {
                out.extend(self.by_groups(&[group], 0).hits);
            } else {
                out.extend(self.find_related(device.vendor_id, depth));
            }
        }
        log::debug!("subclass '{}' produced {} entries", pattern, out.len());
        out
    }

    /// Lists the given groups. `related` gates vendor expansion for each
    /// member; group-only passes call this with 0.
    pub fn by_groups(&self, ids: &[u32], related: u8) -> GroupListing<'t> {
        let mut listing = GroupListing::default();
        for &id in ids {
            let Some(group) = self.topo.group(id) else {
                listing.missing.push(id);
                continue;
            };
            for device in group.devices.values() {
                if !self.visible(device) { continue; }
                listing.hits.push(Hit { group: id, device });
                if related > 0 { listing.hits.extend(self.find_related(device.vendor_id, self.related_depth())); }
            }
        }
        listing
    }

    /// Depth 1: every device sharing `vendor_id`. Depth 2: also every other
    /// member of those devices' groups.
    pub fn find_related(&self, vendor_id: u16, depth: u8) -> Vec<Hit<'t>> {
        let depth = depth.min(MAX_RELATED);
        if depth == 0 || self.opts.ignore.contains(&vendor_id) { return vec![]; }
        let mut out = vec![];
        for (group, device) in self.topo.devices() {
            if device.vendor_id != vendor_id || !self.visible(device) { continue; }
            out.push(Hit { group, device });
            if depth > 1 { out.extend(self.by_groups(&[group], 0).hits); }
        }
        out
    }
}
