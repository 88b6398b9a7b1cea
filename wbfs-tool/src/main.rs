use std::fs::File;
use std::io::Cursor;
use std::path::PathBuf;

use binrw::BinRead;
use clap::{Parser, Subcommand, ValueEnum};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use wbfs_core::block_io::HD_SECTOR_SIZE;
use wbfs_core::container::superblock::{Geometry, HD_SECTOR_SIZE_LOG2_DEFAULT};
use wbfs_core::container::Wbfs;
use wbfs_core::options::ScrubGranularity;
use wbfs_core::scrub::{iso_info, scrub_iso};
use wbfs_core::split::{SplitBackend, SPLIT_SIZE_4G};
use wbfs_core::wii::structs::DiscHeader;
use wbfs_core::wii::{PartitionSelector, WII_SECTORS_DOUBLE_LAYER, WII_SECTOR_SIZE};
use wbfs_core::WbfsError;

#[derive(Debug, Parser)]
#[command(name = "wbfs-tool", about = "Pack and unpack Wii disc images in WBFS containers")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Skip geometry/integrity validation when opening an existing container.
    #[arg(long, global = true)]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the discs stored in a container.
    Ls { wbfs_file: PathBuf },
    /// Report total/used/free space in a container.
    Df { wbfs_file: PathBuf },
    /// Add a raw ISO to a container, creating it if it does not exist.
    AddIso {
        iso_file: PathBuf,
        wbfs_file: PathBuf,
        #[arg(long, value_enum, default_value = "all")]
        selector: SelectorArg,
        /// Copy every sector up to the ISO's physical size verbatim instead
        /// of walking partitions to find live sectors.
        #[arg(long)]
        copy_1_1: bool,
        /// Container capacity in GiB, when creating a new container.
        #[arg(long)]
        capacity_gb: Option<u64>,
    },
    /// Add a disc already held in a single-disc WBFS container to another container.
    AddWbfs {
        source_wbfs: PathBuf,
        wbfs_file: PathBuf,
        #[arg(long)]
        capacity_gb: Option<u64>,
    },
    /// Remove a disc by game id.
    Rm { wbfs_file: PathBuf, game_id: String },
    /// Extract a disc to a raw ISO file.
    ExtractIso {
        wbfs_file: PathBuf,
        game_id: String,
        dest_iso: PathBuf,
        /// Write only up to the last live block instead of the full disc size.
        #[arg(long)]
        trim: bool,
    },
    /// Extract a disc into its own fresh single-disc WBFS container.
    ExtractWbfs {
        wbfs_file: PathBuf,
        game_id: String,
        dest_wbfs: PathBuf,
    },
    /// Pack a raw ISO straight into a brand-new container file.
    Convert {
        iso_file: PathBuf,
        dest_wbfs: PathBuf,
        #[arg(long)]
        copy_1_1: bool,
        #[arg(long)]
        capacity_gb: Option<u64>,
    },
    /// Rewrite a raw ISO as a sparse file holding only live sectors.
    Scrub {
        iso_file: PathBuf,
        dest_iso: PathBuf,
        #[arg(long, value_enum, default_value = "block")]
        granularity: GranularityArg,
        #[arg(long)]
        trim: bool,
        #[arg(long)]
        zero_sparse: bool,
        #[arg(long)]
        overwrite: bool,
    },
    /// Print live/physical/trimmed size statistics for a raw ISO.
    IsoInfo {
        iso_file: PathBuf,
        #[arg(long, value_enum, default_value = "block")]
        granularity: GranularityArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SelectorArg {
    All,
    Game,
    Update,
    Other,
    RemoveUpdate,
    OnlyGame,
}

impl From<SelectorArg> for PartitionSelector {
    fn from(s: SelectorArg) -> Self {
        match s {
            SelectorArg::All => PartitionSelector::AllPartitions,
            SelectorArg::Game => PartitionSelector::Game,
            SelectorArg::Update => PartitionSelector::Update,
            SelectorArg::Other => PartitionSelector::Other,
            SelectorArg::RemoveUpdate => PartitionSelector::RemoveUpdate,
            SelectorArg::OnlyGame => PartitionSelector::OnlyGame,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum GranularityArg {
    Sector,
    Block,
}

impl From<GranularityArg> for ScrubGranularity {
    fn from(g: GranularityArg) -> Self {
        match g {
            GranularityArg::Sector => ScrubGranularity::WiiSector,
            GranularityArg::Block => ScrubGranularity::WbfsBlock,
        }
    }
}

/// The block size used for `scrub`/`iso-info`, which run directly against a
/// raw ISO and so never derive one from an existing container's geometry.
const STANDALONE_BLOCK_SIZE: u64 = 2 * 1024 * 1024;

#[derive(Error, Debug)]
enum ToolError {
    #[error(transparent)]
    Wbfs(#[from] WbfsError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Message(String),
}

fn main() -> Result<(), ToolError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Ls { wbfs_file } => cmd_ls(&wbfs_file, cli.force),
        Command::Df { wbfs_file } => cmd_df(&wbfs_file, cli.force),
        Command::AddIso {
            iso_file,
            wbfs_file,
            selector,
            copy_1_1,
            capacity_gb,
        } => cmd_add_iso(&iso_file, &wbfs_file, selector.into(), copy_1_1, capacity_gb, cli.force),
        Command::AddWbfs {
            source_wbfs,
            wbfs_file,
            capacity_gb,
        } => cmd_add_wbfs(&source_wbfs, &wbfs_file, capacity_gb, cli.force),
        Command::Rm { wbfs_file, game_id } => cmd_rm(&wbfs_file, &game_id, cli.force),
        Command::ExtractIso {
            wbfs_file,
            game_id,
            dest_iso,
            trim,
        } => cmd_extract_iso(&wbfs_file, &game_id, &dest_iso, trim, cli.force),
        Command::ExtractWbfs {
            wbfs_file,
            game_id,
            dest_wbfs,
        } => cmd_extract_wbfs(&wbfs_file, &game_id, &dest_wbfs, cli.force),
        Command::Convert {
            iso_file,
            dest_wbfs,
            copy_1_1,
            capacity_gb,
        } => cmd_convert(&iso_file, &dest_wbfs, copy_1_1, capacity_gb),
        Command::Scrub {
            iso_file,
            dest_iso,
            granularity,
            trim,
            zero_sparse,
            overwrite,
        } => cmd_scrub(&iso_file, &dest_iso, granularity.into(), trim, zero_sparse, overwrite),
        Command::IsoInfo { iso_file, granularity } => cmd_iso_info(&iso_file, granularity.into()),
    }
}

fn title_str(bytes: &[u8; 64]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn open_container(path: &PathBuf, force: bool) -> Result<Wbfs<SplitBackend>, ToolError> {
    let backend = SplitBackend::open(path)?;
    Ok(Wbfs::open(backend, force)?)
}

/// Capacity used only to fix a brand-new container's geometry before its
/// real usage is known: a full dual-layer disc's worth of blocks plus slack
/// for slot-table/free-bitmap alignment. Never the container's final size.
fn provisional_capacity_bytes() -> u64 {
    WII_SECTORS_DOUBLE_LAYER * WII_SECTOR_SIZE + 64 * 1024 * 1024
}

/// Creates a fresh single-disc container at `path` holding exactly `source`.
///
/// With an explicit `capacity_gb`, the container is simply formatted at that
/// size up front, as before. Otherwise the container is first formatted at
/// [`provisional_capacity_bytes`] to fix its geometry, [`Wbfs::size_disc`]
/// measures how many blocks the disc actually needs against that geometry,
/// and the backing file is then shrunk to just those blocks plus the one
/// block a single-slot container's header/slot table/free bitmap occupy.
fn create_container_for_source<RS: std::io::Read + std::io::Seek>(
    path: &PathBuf,
    source: RS,
    selector: PartitionSelector,
    copy_1_1: bool,
    capacity_gb: Option<u64>,
) -> Result<(Wbfs<SplitBackend>, RS), ToolError> {
    if let Some(gb) = capacity_gb {
        let capacity_bytes = (gb * 1024 * 1024 * 1024).div_ceil(HD_SECTOR_SIZE) * HD_SECTOR_SIZE;
        let backend = SplitBackend::create(path, SPLIT_SIZE_4G, capacity_bytes)?;
        let wbfs = Wbfs::format(backend)?;
        return Ok((wbfs, source));
    }

    let provisional = provisional_capacity_bytes();
    let backend = SplitBackend::create(path, SPLIT_SIZE_4G, provisional)?;
    let wbfs_sec_sz_s = Geometry::pick_block_size_log2(provisional / HD_SECTOR_SIZE, HD_SECTOR_SIZE_LOG2_DEFAULT);
    let mut wbfs = Wbfs::format_with_geometry(backend, wbfs_sec_sz_s, 1)?;

    let mut source = source;
    let estimate = wbfs.size_disc(&mut source, selector, copy_1_1)?;
    let block = wbfs.wbfs_block_size();
    let used_bytes = estimate.used_blocks * block;
    let sized = used_bytes.div_ceil(block) * block + block;
    wbfs.device_mut().truncate(sized)?;
    Ok((wbfs, source))
}

fn progress_bar(label: &str) -> impl FnMut(u64, u64) -> bool + '_ {
    move |done, total| {
        eprint!("\r{label}: {done}/{total} blocks");
        if done == total {
            eprintln!();
        }
        true
    }
}

fn read_disc_header(iso_file: &PathBuf) -> Result<DiscHeader, ToolError> {
    let mut f = File::open(iso_file)?;
    DiscHeader::read_be(&mut f).map_err(|e| ToolError::Message(format!("invalid disc header: {e}")))
}

fn cmd_ls(wbfs_file: &PathBuf, force: bool) -> Result<(), ToolError> {
    let wbfs = open_container(wbfs_file, force)?;
    for i in 0..wbfs.count_discs() {
        let (slot, used_bytes) = wbfs.get_disc_info(i).expect("index within count_discs range");
        println!(
            "{}  {:>8.2} MiB  {}",
            slot.game_id(),
            used_bytes as f64 / (1024.0 * 1024.0),
            title_str(&slot.header.game_title)
        );
    }
    Ok(())
}

fn cmd_df(wbfs_file: &PathBuf, force: bool) -> Result<(), ToolError> {
    let wbfs = open_container(wbfs_file, force)?;
    let report = wbfs.free_space_report();
    let gib = |b: u64| b as f64 / (1024.0 * 1024.0 * 1024.0);
    println!("total: {:.2} GiB", gib(report.total_bytes));
    println!("used:  {:.2} GiB", gib(report.used_bytes));
    println!("free:  {:.2} GiB", gib(report.free_bytes));
    Ok(())
}

fn cmd_add_iso(
    iso_file: &PathBuf,
    wbfs_file: &PathBuf,
    selector: PartitionSelector,
    copy_1_1: bool,
    capacity_gb: Option<u64>,
    force: bool,
) -> Result<(), ToolError> {
    let header = read_disc_header(iso_file)?;
    let source = File::open(iso_file)?;

    let (mut wbfs, source) = if wbfs_file.exists() {
        (open_container(wbfs_file, force)?, source)
    } else {
        create_container_for_source(wbfs_file, source, selector, copy_1_1, capacity_gb)?
    };

    let mut cb = progress_bar("add");
    wbfs.add_disc(source, header, selector, copy_1_1, Some(&mut cb))?;
    wbfs.close()?;
    Ok(())
}

fn cmd_add_wbfs(source_wbfs: &PathBuf, wbfs_file: &PathBuf, capacity_gb: Option<u64>, force: bool) -> Result<(), ToolError> {
    let mut source = open_container(source_wbfs, force)?;
    if source.count_discs() != 1 {
        return Err(ToolError::Message(format!(
            "{} must hold exactly one disc to be used as an add-wbfs source (has {})",
            source_wbfs.display(),
            source.count_discs()
        )));
    }
    let (slot, _) = source.get_disc_info(0).expect("count_discs confirmed one disc");
    let header = slot.header.clone();
    let game_id = slot.game_id();
    let logical_size = source
        .disc_logical_size(&game_id)
        .ok_or_else(|| ToolError::Wbfs(WbfsError::NotFound(game_id.clone())))?;

    let mut buf = Cursor::new(vec![0u8; logical_size as usize]);
    source.extract_disc(&game_id, &mut buf, false, None)?;
    source.close()?;

    let (mut dest, buf) = if wbfs_file.exists() {
        (open_container(wbfs_file, force)?, buf)
    } else {
        create_container_for_source(wbfs_file, buf, PartitionSelector::AllPartitions, true, capacity_gb)?
    };
    dest.add_disc(buf, header, PartitionSelector::AllPartitions, true, None)?;
    dest.close()?;
    Ok(())
}

fn cmd_rm(wbfs_file: &PathBuf, game_id: &str, force: bool) -> Result<(), ToolError> {
    let mut wbfs = open_container(wbfs_file, force)?;
    wbfs.remove_disc(game_id)?;
    wbfs.close()?;
    Ok(())
}

fn cmd_extract_iso(wbfs_file: &PathBuf, game_id: &str, dest_iso: &PathBuf, trim: bool, force: bool) -> Result<(), ToolError> {
    let mut wbfs = open_container(wbfs_file, force)?;
    let size = if trim {
        wbfs.disc_trim_size(game_id)
    } else {
        wbfs.disc_logical_size(game_id)
    }
    .ok_or_else(|| ToolError::Wbfs(WbfsError::NotFound(game_id.to_string())))?;

    let dest = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(dest_iso)?;
    dest.set_len(size)?;

    let mut cb = progress_bar("extract");
    wbfs.extract_disc(game_id, dest, trim, Some(&mut cb))?;
    Ok(())
}

fn cmd_extract_wbfs(wbfs_file: &PathBuf, game_id: &str, dest_wbfs: &PathBuf, force: bool) -> Result<(), ToolError> {
    let mut source = open_container(wbfs_file, force)?;
    let trim_size = source
        .disc_trim_size(game_id)
        .ok_or_else(|| ToolError::Wbfs(WbfsError::NotFound(game_id.to_string())))?;
    let mut buf = Cursor::new(vec![0u8; trim_size as usize]);
    source.extract_disc(game_id, &mut buf, true, None)?;
    let header = read_disc_header_from_buf(buf.get_ref())?;
    source.close()?;

    let (mut dest, buf) = create_container_for_source(dest_wbfs, buf, PartitionSelector::AllPartitions, true, None)?;
    dest.add_disc(buf, header, PartitionSelector::AllPartitions, true, None)?;
    dest.close()?;
    Ok(())
}

fn read_disc_header_from_buf(buf: &[u8]) -> Result<DiscHeader, ToolError> {
    let mut cursor = Cursor::new(buf);
    DiscHeader::read_be(&mut cursor).map_err(|e| ToolError::Message(format!("invalid disc header: {e}")))
}

fn cmd_convert(iso_file: &PathBuf, dest_wbfs: &PathBuf, copy_1_1: bool, capacity_gb: Option<u64>) -> Result<(), ToolError> {
    let header = read_disc_header(iso_file)?;
    let source = File::open(iso_file)?;

    let (mut dest, source) = create_container_for_source(
        dest_wbfs,
        source,
        PartitionSelector::AllPartitions,
        copy_1_1,
        capacity_gb,
    )?;
    let mut cb = progress_bar("convert");
    dest.add_disc(source, header, PartitionSelector::AllPartitions, copy_1_1, Some(&mut cb))?;
    dest.close()?;
    Ok(())
}

fn cmd_scrub(
    iso_file: &PathBuf,
    dest_iso: &PathBuf,
    granularity: ScrubGranularity,
    trim: bool,
    zero_sparse: bool,
    overwrite: bool,
) -> Result<(), ToolError> {
    let source = File::open(iso_file)?;
    let info = scrub_iso(
        source,
        dest_iso,
        PartitionSelector::AllPartitions,
        granularity,
        STANDALONE_BLOCK_SIZE,
        zero_sparse,
        trim,
        overwrite,
    )?;
    println!(
        "physical: {} bytes, trimmed: {} bytes, scrubbed live: {} bytes",
        info.physical_size, info.trim_size, info.scrub_size
    );
    Ok(())
}

fn cmd_iso_info(iso_file: &PathBuf, granularity: ScrubGranularity) -> Result<(), ToolError> {
    let source = File::open(iso_file)?;
    let info = iso_info(source, PartitionSelector::AllPartitions, granularity, STANDALONE_BLOCK_SIZE)?;
    println!("physical size: {} bytes", info.physical_size);
    println!("trim size:     {} bytes ({} blocks)", info.trim_size, info.trim_blocks);
    println!("live size:     {} bytes ({} blocks)", info.scrub_size, info.scrub_blocks);
    Ok(())
}
