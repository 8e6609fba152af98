use anyhow::{Context, Result};
use std::path::Path;
use walkdir::WalkDir;

pub const DEVICES_ROOT: &str = "/sys/devices";

/// Paths of `rom` files under `root` whose path names one of `addresses`.
pub fn find_rom_paths(root: &Path, addresses: &[&str]) -> Result<Vec<String>> {
    let mut out = vec![];
    if addresses.is_empty() { return Ok(out); }
    for de in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let de = de.with_context(|| format!("Unable to walk {}", root.display()))?;
        if de.file_name() != "rom" { continue; }
        let path = de.path().to_string_lossy();
        if addresses.iter().any(|a| path.contains(a)) {
            log::debug!("found rom {}", path);
            out.push(path.into_owned());
        }
    }
    Ok(out)
}
