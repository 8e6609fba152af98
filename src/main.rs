use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum, ColorChoice, ArgAction, CommandFactory};
use clap_complete::Shell;
use serde::Deserialize;
use is_terminal::IsTerminal;
mod config;
mod device;
mod error;
mod format;
mod query;
mod resolver;
mod rom;
mod topology;

use crate::format::{Formatter, DEFAULT_FORMAT};
use crate::query::{Hit, Projection, Query, QueryOptions};
use crate::topology::Topology;

static ENABLE_COLOR: OnceLock<bool> = OnceLock::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogLevel { Error, Warn, Info, Debug, Trace }

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogFormat { Text, Json }

#[derive(Parser, Debug)]
#[command(
    name = "ls-iommu",
    version,
    about = "A tool to print out all devices and their IOMMU groups",
    long_about = "A tool to print out all devices and their IOMMU groups, with filters for the device classes people usually pass through to virtual machines.",
    after_long_help = "Examples:\n  ls-iommu\n  ls-iommu -g -rr\n  ls-iommu -i 14 -i 15 --id\n  ls-iommu -u -r -R 1022\n  ls-iommu -g --rom -i 1\n  ls-iommu -k -F pciaddr,name,device_id",
    color = ColorChoice::Auto
)]
struct Args {
    /// List all GPUs (use -i # to only display results from specified IOMMU group)
    #[arg(short = 'g', long, conflicts_with_all = ["usb", "network", "sata", "nvme", "audio"])]
    gpu: bool,
    /// List all USB controllers (use -i # to only display results from specified IOMMU group)
    #[arg(short = 'u', long, conflicts_with_all = ["network", "sata", "nvme", "audio"])]
    usb: bool,
    /// List all network controllers (use -i # to only display results from specified IOMMU group)
    #[arg(short = 'n', long, conflicts_with_all = ["sata", "nvme", "audio"])]
    network: bool,
    /// List all SATA controllers (use -i # to only display results from specified IOMMU group)
    #[arg(short = 's', long, conflicts_with_all = ["nvme", "audio"])]
    sata: bool,
    /// List all NVMe controllers (use -i # to only display results from specified IOMMU group)
    #[arg(long, conflicts_with = "audio")]
    nvme: bool,
    /// List all audio devices (use -i # to only display results from specified IOMMU group)
    #[arg(short = 'a', long)]
    audio: bool,
    /// List everything in the IOMMU groups given; repeat or comma separate for more groups
    #[arg(short = 'i', long = "group", value_name = "GROUP", value_delimiter = ',')]
    groups: Vec<u32>,
    /// List related devices sharing a vendor ID; -rr also pulls in the IOMMU groups of those devices
    #[arg(short = 'r', long, action = ArgAction::Count)]
    related: u8,
    /// Vendor ID to skip during a --related search (left part of [VendorID:DeviceID])
    #[arg(short = 'R', long, value_name = "VENDOR", value_delimiter = ',', value_parser = device::parse_vendor_id)]
    ignore: Vec<u16>,
    /// List subsystems and kernel drivers using the devices
    #[arg(short = 'k', long)]
    kernel: bool,
    /// Unsorted output with unpadded group numbers, as the old bash script printed it
    #[arg(long)]
    legacy: bool,
    /// Print only VendorID:DeviceID for non bridge devices
    #[arg(long, conflicts_with = "pciaddr")]
    id: bool,
    /// Print only the PCI address for non bridge devices
    #[arg(long)]
    pciaddr: bool,
    /// Print the ROM paths of GPUs
    #[arg(long, requires = "gpu")]
    rom: bool,
    /// Order of fields in a device line. Supported: pciaddr, subclass_name, subclass_id, name, device_id, vendor, prod_name, oem (each optionally with a trailing ':'), revision, optional_revision
    #[arg(short = 'F', long, value_name = "FIELDS")]
    format: Option<String>,
    /// Path to a TOML config file (default ./ls-iommu.toml or $LS_IOMMU_CONFIG)
    #[arg(long)]
    config: Option<String>,
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
    #[arg(short = 'q', long, default_value_t = false)]
    quiet: bool,
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    log_path: Option<String>,
    #[arg(long, short = 'C', default_value_t = false)]
    no_color: bool,
    #[arg(long, value_enum)]
    completions: Option<Shell>,
    #[arg(long, hide = true)]
    iommu_root: Option<PathBuf>,
    #[arg(long, hide = true)]
    pci_root: Option<PathBuf>,
    #[arg(long, hide = true)]
    devices_root: Option<PathBuf>,
}

fn main() {
    let mut args = Args::parse();
    if let Some(sh) = args.completions {
        clap_complete::generate(sh, &mut Args::command(), "ls-iommu", &mut std::io::stdout());
        return;
    }
    let cfg = config::load_config(args.config.as_deref());
    if let Ok(Some(c)) = &cfg { apply_config(&mut args, c.clone()); }
    init_logging(&args);
    if let Err(e) = &cfg { log::warn!("{:#}", e); }
    let color_default = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none() && std::env::var("TERM").unwrap_or_default() != "dumb";
    let _ = ENABLE_COLOR.set(color_default && !args.no_color);
    if let Err(e) = run(&args) {
        eprintln!("{}", paint(&format!("{:#}", e), "1;31"));
        std::process::exit(1);
    }
}

impl From<LogLevel> for log::LevelFilter {
    fn from(l: LogLevel) -> Self {
        match l {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Level forced on the command line; `None` leaves `RUST_LOG` in charge.
fn level_override(args: &Args) -> Option<log::LevelFilter> {
    if args.quiet { return Some(log::LevelFilter::Error); }
    if let Some(l) = args.log_level { return Some(l.into()); }
    match args.verbose {
        0 => None,
        1 => Some(log::LevelFilter::Info),
        2 => Some(log::LevelFilter::Debug),
        _ => Some(log::LevelFilter::Trace),
    }
}

fn open_log_file(path: &str) -> Result<std::fs::File> {
    std::fs::OpenOptions::new().create(true).append(true).open(path).with_context(|| format!("Failed to open log file {}", path))
}

/// Diagnostics go to stderr or the log file; stdout carries only the report.
fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if let Some(f) = level_override(args) { builder.filter_level(f); }
    let json = args.log_format == Some(LogFormat::Json);
    let stamped = args.log_path.is_some();
    builder.format(move |buf, record| {
        if json {
            let obj = serde_json::json!({
                "time": chrono::Local::now().to_rfc3339(),
                "level": record.level().as_str(),
                "module": record.module_path().unwrap_or("ls_iommu"),
                "message": record.args().to_string(),
            });
            return writeln!(buf, "{}", obj);
        }
        let level = record.level().as_str().to_ascii_lowercase();
        if stamped {
            writeln!(buf, "{} ls-iommu: {}: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"), level, record.args())
        } else {
            writeln!(buf, "ls-iommu: {}: {}", level, record.args())
        }
    });
    let mut open_err = None;
    match args.log_path.as_deref().map(open_log_file) {
        Some(Ok(f)) => { builder.target(env_logger::Target::Pipe(Box::new(f))); }
        Some(Err(e)) => { open_err = Some(e); builder.target(env_logger::Target::Stderr); }
        None => { builder.target(env_logger::Target::Stderr); }
    }
    builder.init();
    if let Some(e) = open_err { log::warn!("{:#}; logging to stderr", e); }
}

fn apply_config(args: &mut Args, cfg: config::AppConfig) {
    if args.format.is_none() { args.format = cfg.format; }
    args.legacy |= cfg.legacy.unwrap_or(false);
    args.kernel |= cfg.kernel.unwrap_or(false);
    if args.related == 0 { args.related = cfg.related.unwrap_or(0); }
    if args.ignore.is_empty() {
        for v in cfg.ignore.unwrap_or_default() {
            match device::parse_vendor_id(&v) { Ok(id) => args.ignore.push(id), Err(e) => eprintln!("Ignoring config entry: {}", e) }
        }
    }
    if args.log_level.is_none() { args.log_level = cfg.log_level; }
    if args.log_format.is_none() { args.log_format = cfg.log_format; }
    if args.log_path.is_none() { args.log_path = cfg.log_path; }
    if args.iommu_root.is_none() { args.iommu_root = cfg.iommu_root; }
    if args.pci_root.is_none() { args.pci_root = cfg.pci_root; }
    if args.devices_root.is_none() { args.devices_root = cfg.devices_root; }
}

fn run(args: &Args) -> Result<()> {
    let source = topology::SysfsTopology::new(args.iommu_root.clone().unwrap_or_else(|| PathBuf::from(topology::IOMMU_GROUPS_ROOT)));
    let resolver = resolver::SysfsResolver::new(args.pci_root.clone().unwrap_or_else(|| PathBuf::from(resolver::PCI_DEVICES_ROOT)));
    let topo = Topology::build(&source, &resolver)?;
    let devices_root = args.devices_root.clone().unwrap_or_else(|| PathBuf::from(rom::DEVICES_ROOT));
    let lines = report(args, &topo, &devices_root, &mut std::io::stderr())?;
    let mut out = std::io::stdout().lock();
    for l in &lines { writeln!(out, "{}", l)?; }
    Ok(())
}

fn projection(args: &Args) -> Projection {
    if args.id { Projection::Id } else if args.pciaddr { Projection::Address } else { Projection::Full }
}

/// Subclass names searched for each class flag.
fn selection(args: &Args) -> Option<&'static [&'static str]> {
    if args.gpu { return Some(&["VGA", "3D"]); }
    if args.usb { return Some(&["USB controller"]); }
    if args.network { return Some(&["Ethernet controller", "Network controller"]); }
    if args.sata { return Some(&["SATA controller"]); }
    if args.nvme { return Some(&["Non-Volatile memory controller"]); }
    if args.audio { return Some(&["Audio device"]); }
    None
}

/// Builds the report lines. User-facing notices such as unknown groups are
/// written to `notes` as they come up.
fn report(args: &Args, topo: &Topology, devices_root: &Path, notes: &mut dyn Write) -> Result<Vec<String>> {
    let projection = projection(args);
    let opts = QueryOptions { related: args.related, ignore: args.ignore.clone(), groups: args.groups.clone(), projection };
    let q = Query::new(topo, &opts);
    let fmt = Formatter {
        fields: format::parse_format(args.format.as_deref().unwrap_or(DEFAULT_FORMAT)),
        legacy: args.legacy,
        kernel: args.kernel,
        projection,
    };
    if args.rom {
        let rom_opts = QueryOptions { related: 0, projection: Projection::Full, ..opts.clone() };
        let rq = Query::new(topo, &rom_opts);
        let gpus: Vec<Hit> = ["VGA", "3D"].iter().flat_map(|p| rq.by_subclass(p)).collect();
        let addrs: Vec<&str> = gpus.iter().map(|h| h.device.address.as_str()).collect();
        let roms = format::normalize(rom::find_rom_paths(devices_root, &addrs)?, args.legacy);
        if roms.is_empty() { log::warn!("no ROM files found for {} GPU(s)", addrs.len()); }
        return Ok(roms);
    }
    let lines = if let Some(patterns) = selection(args) {
        let hits: Vec<Hit> = patterns.iter().flat_map(|p| q.by_subclass(p)).collect();
        fmt.render_all(&hits)
    } else if !args.groups.is_empty() {
        let listing = q.by_groups(&args.groups, args.related);
        for id in &listing.missing {
            writeln!(notes, "{}", paint(&format!("IOMMU Group {} does not exist", id), "1;33"))?;
        }
        fmt.render_all(&listing.hits)
    } else {
        fmt.render_all(&q.all())
    };
    let lines = format::normalize(lines, args.legacy);
    format::check_nonempty(&lines, projection)?;
    Ok(lines)
}

fn paint(s: &str, code: &str) -> String {
    if *ENABLE_COLOR.get().unwrap_or(&false) { format!("\x1b[{}m{}\x1b[0m", code, s) } else { s.to_string() }
}
