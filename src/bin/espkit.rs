use std::{
    fs,
    num::ParseIntError,
    path::{Path, PathBuf},
};

use clap::{Args, Parser, Subcommand, ValueEnum};
use comfy_table::{modifiers, presets::UTF8_FULL, Attribute, Cell, Color, Table};
use espkit::{
    format::{
        app_image::AppImage,
        fat::FatVolume,
        nvs::{ItemType, Nvs, NvsValue},
        ota::OtaData,
        partition_table::{DataType, Flags, Partition, PartitionTable},
        spiffs::Spiffs,
    },
    logging::initialize_logger,
    Config,
    FlashImage,
};
use log::{debug, info, warn, LevelFilter};
use miette::{bail, miette, IntoDiagnostic, Result, WrapErr};

/// Boot address of the original ESP32, used when no bootloader is found
const DEFAULT_BOOT_OFFSET: u32 = 0x1000;

#[derive(Debug, Parser)]
#[clap(about, propagate_version = true, version)]
struct Cli {
    #[clap(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Display the header, segments and checksums of a firmware image
    ImageInfo(ImageInfoArgs),
    /// Print the partition table of a flash dump
    Partitions(TableArgs),
    /// List the entries of an NVS partition
    Nvs(PartitionArgs),
    /// Write a key to an NVS partition
    NvsSet(NvsSetArgs),
    /// Show or change the OTA boot selection
    Ota(OtaArgs),
    /// List the files of a FAT partition
    FatLs(PartitionArgs),
    /// Extract a file from a FAT partition
    FatGet(FatGetArgs),
    /// List the files of a SPIFFS partition
    SpiffsLs(PartitionArgs),
}

#[derive(Debug, Args)]
struct TableArgs {
    /// Flash dump to read
    image: PathBuf,
    /// Partition table offset, searched for when omitted
    #[arg(long, value_parser = parse_u32)]
    table_offset: Option<u32>,
    /// Offset of the second stage bootloader, used to search for the table.
    /// Detected from the chip's boot address when omitted
    #[arg(long, value_parser = parse_u32)]
    boot_offset: Option<u32>,
}

#[derive(Debug, Args)]
struct PartitionArgs {
    #[clap(flatten)]
    table: TableArgs,
    /// Label of the partition, the first one of a matching type if omitted
    #[arg(short, long)]
    partition: Option<String>,
}

#[derive(Debug, Args)]
struct ImageInfoArgs {
    /// File containing the firmware image
    image: PathBuf,
    /// Offset of the image in the file
    #[arg(long, default_value = "0", value_parser = parse_u32)]
    offset: u32,
    /// Rewrite the checksum and digest if they are wrong
    #[arg(long)]
    fix: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ValueType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    Str,
    Blob,
}

impl From<ValueType> for ItemType {
    fn from(ty: ValueType) -> Self {
        match ty {
            ValueType::U8 => ItemType::U8,
            ValueType::I8 => ItemType::I8,
            ValueType::U16 => ItemType::U16,
            ValueType::I16 => ItemType::I16,
            ValueType::U32 => ItemType::U32,
            ValueType::I32 => ItemType::I32,
            ValueType::U64 => ItemType::U64,
            ValueType::I64 => ItemType::I64,
            ValueType::Str => ItemType::Str,
            ValueType::Blob => ItemType::BlobData,
        }
    }
}

#[derive(Debug, Args)]
struct NvsSetArgs {
    #[clap(flatten)]
    target: PartitionArgs,
    namespace: String,
    key: String,
    #[arg(value_enum)]
    ty: ValueType,
    value: String,
    /// Write the modified dump here instead of in place
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct OtaArgs {
    #[clap(flatten)]
    target: PartitionArgs,
    /// Boot OTA app slot N next
    #[arg(long, conflicts_with = "erase")]
    select: Option<usize>,
    /// Erase the selection so the factory app boots
    #[arg(long)]
    erase: bool,
    /// Write the modified dump here instead of in place
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct FatGetArgs {
    #[clap(flatten)]
    target: PartitionArgs,
    /// Path of the file inside the volume
    path: String,
    /// Destination, defaults to the file name in the working directory
    output: Option<PathBuf>,
}

fn parse_u32(input: &str) -> Result<u32, ParseIntError> {
    match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => input.parse(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    let args = Cli::parse();
    debug!("{:#?}", args);

    let config = Config::load()?;
    debug!("Config: {:#?}", config);

    match args.subcommand {
        Commands::ImageInfo(args) => image_info(args).await,
        Commands::Partitions(args) => partitions(args).await,
        Commands::Nvs(args) => nvs(args).await,
        Commands::NvsSet(args) => nvs_set(args).await,
        Commands::Ota(args) => ota(args).await,
        Commands::FatLs(args) => fat_ls(args).await,
        Commands::FatGet(args) => fat_get(args).await,
        Commands::SpiffsLs(args) => spiffs_ls(args).await,
    }
}

fn load_image(path: &Path) -> Result<FlashImage> {
    let data = fs::read(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to open image {}", path.display()))?;
    if data.len() > u32::MAX as usize {
        bail!("{} is too large to be a flash dump", path.display());
    }

    Ok(FlashImage::from_bytes(data))
}

async fn save_image(image: &FlashImage, path: &Path) -> Result<()> {
    image.flush().await?;
    let data = image.to_vec().await?;
    fs::write(path, data)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to write image {}", path.display()))?;
    info!("Wrote {}", path.display());

    Ok(())
}

async fn read_table(image: &FlashImage, args: &TableArgs) -> Result<PartitionTable> {
    let offset = match args.table_offset {
        Some(offset) => offset,
        None => {
            let boot_offset = match args.boot_offset {
                Some(offset) => offset,
                None => PartitionTable::find_bootloader(image).await.unwrap_or_else(|| {
                    warn!("No bootloader found, assuming it starts at {:#x}", DEFAULT_BOOT_OFFSET);
                    DEFAULT_BOOT_OFFSET
                }),
            };
            PartitionTable::discover_offset(image, boot_offset).await?
        }
    };

    Ok(PartitionTable::parse(image, offset).await?)
}

async fn find_partition(
    image: &FlashImage,
    args: &PartitionArgs,
    ty: DataType,
) -> Result<Partition> {
    let table = read_table(image, &args.table).await?;
    let partition = match &args.partition {
        Some(label) => table
            .find_by_label(label)
            .ok_or_else(|| miette!("No partition labelled '{label}'"))?,
        None => table
            .find_data(ty)
            .ok_or_else(|| miette!("No {ty} partition in the partition table"))?,
    };
    debug!(
        "Using partition '{}' at {:#x}, {:#x} bytes",
        partition.label, partition.offset, partition.size
    );

    Ok(partition.clone())
}

fn new_table(headers: &[(&str, Color)]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(
            headers
                .iter()
                .map(|(name, color)| Cell::new(name).fg(*color).add_attribute(Attribute::Bold)),
        );

    table
}

fn valid_cell(valid: bool) -> Cell {
    match valid {
        true => Cell::new("valid").fg(Color::Green),
        false => Cell::new("INVALID").fg(Color::Red),
    }
}

async fn image_info(args: ImageInfoArgs) -> Result<()> {
    let image = load_image(&args.image)?;
    let app = AppImage::parse(&image, args.offset).await?;
    let header = &app.header;

    let chip = match header.chip() {
        Some(chip) => chip.to_string(),
        None => format!("unknown ({:#x})", { header.chip_id }),
    };
    println!("Chip:           {chip}");
    println!("Entry point:    {:#010x}", { header.entry });
    println!(
        "Flash mode:     {}",
        header.flash_mode().map_or_else(|| "unknown".to_string(), |mode| mode.to_string())
    );
    println!(
        "Flash size:     {}",
        header.flash_size().map_or_else(|| "unknown".to_string(), |size| size.to_string())
    );
    println!("Image length:   {:#x}", app.total_len());

    let mut segments = new_table(&[
        ("Segment", Color::Green),
        ("Load address", Color::Cyan),
        ("File offset", Color::Magenta),
        ("Length", Color::Red),
    ]);
    for (index, segment) in app.segments.iter().enumerate() {
        segments.add_row(vec![
            Cell::new(index),
            Cell::new(format!("{:#010x}", segment.load_address)),
            Cell::new(format!("{:#x}", segment.offset)),
            Cell::new(format!("{:#x}", segment.length)),
        ]);
    }
    println!("{segments}");

    let mut checks = new_table(&[
        ("Check", Color::Green),
        ("Stored", Color::Cyan),
        ("Computed", Color::Magenta),
        ("Status", Color::Yellow),
    ]);
    checks.add_row(vec![
        Cell::new("checksum"),
        Cell::new(format!("{:#04x}", app.stored_checksum)),
        Cell::new(format!("{:#04x}", app.computed_checksum)),
        valid_cell(app.checksum_valid()),
    ]);
    if let Some(digest) = &app.digest {
        checks.add_row(vec![
            Cell::new("sha256"),
            Cell::new(hex(&digest.stored)),
            Cell::new(hex(&digest.computed)),
            valid_cell(digest.is_valid()),
        ]);
    }
    println!("{checks}");

    if let Some(desc) = app.app_descriptor(&image).await? {
        println!("Project:        {} {}", desc.project_name, desc.version);
        println!("Built:          {} {}", desc.date, desc.time);
        println!("ESP-IDF:        {}", desc.idf_version);
    }

    if args.fix && !app.is_valid() {
        app.fix_checksums(&image).await?;
        save_image(&image, &args.image).await?;
    }

    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn partitions(args: TableArgs) -> Result<()> {
    let image = load_image(&args.image)?;
    let table = read_table(&image, &args).await?;

    let mut out = new_table(&[
        ("Name", Color::Green),
        ("Type", Color::Cyan),
        ("SubType", Color::Magenta),
        ("Offset", Color::Red),
        ("Size", Color::Yellow),
        ("Encrypted", Color::DarkCyan),
    ]);
    for p in &table.partitions {
        out.add_row(vec![
            Cell::new(&p.label).fg(Color::Green),
            Cell::new(p.ty.to_string()).fg(Color::Cyan),
            Cell::new(p.subtype.to_string()).fg(Color::Magenta),
            Cell::new(format!("{:#x}", p.offset)).fg(Color::Red),
            Cell::new(format!("{:#x} ({}KiB)", p.size, p.size / 1024)).fg(Color::Yellow),
            Cell::new(p.flags.contains(Flags::ENCRYPTED))
                .fg(Color::DarkCyan),
        ]);
    }

    println!("Partition table at {:#x}", table.offset);
    println!("{out}");
    if let Some(false) = table.md5_valid {
        warn!("The MD5 checksum of the partition table does not match");
    }

    Ok(())
}

async fn nvs(args: PartitionArgs) -> Result<()> {
    let image = load_image(&args.table.image)?;
    let partition = find_partition(&image, &args, DataType::Nvs).await?;
    let scan = Nvs::new(&image, partition.offset, partition.size)?
        .scan()
        .await?;

    let mut out = new_table(&[
        ("Namespace", Color::Green),
        ("Key", Color::Cyan),
        ("Type", Color::Magenta),
        ("Value", Color::Yellow),
        ("CRC", Color::Red),
    ]);
    for item in scan.items.iter().filter(|item| item.namespace != 0) {
        let namespace = scan
            .namespace_name(item.namespace)
            .unwrap_or_else(|| format!("#{}", item.namespace));
        let crc_ok = item.header_crc_valid && item.payload_crc_valid.unwrap_or(true);
        out.add_row(vec![
            Cell::new(namespace),
            Cell::new(&item.key),
            Cell::new(item.item_type.to_string()),
            Cell::new(item.value.to_string()),
            valid_cell(crc_ok),
        ]);
    }
    println!("{out}");

    for error in &scan.errors {
        warn!("{error}");
    }

    Ok(())
}

async fn nvs_set(args: NvsSetArgs) -> Result<()> {
    let image = load_image(&args.target.table.image)?;
    let partition = find_partition(&image, &args.target, DataType::Nvs).await?;

    let value = NvsValue::parse(args.ty.into(), &args.value)
        .ok_or_else(|| miette!("'{}' is not a valid {:?} value", args.value, args.ty))?;
    Nvs::new(&image, partition.offset, partition.size)?
        .set(&args.namespace, &args.key, &value)
        .await?;
    info!("Set {}::{} = {}", args.namespace, args.key, value);

    let output = args.output.unwrap_or(args.target.table.image);
    save_image(&image, &output).await
}

async fn ota(args: OtaArgs) -> Result<()> {
    let image = load_image(&args.target.table.image)?;
    let table = read_table(&image, &args.target.table).await?;
    let partition = match &args.target.partition {
        Some(label) => table.find_by_label(label),
        None => table.find_data(DataType::Ota),
    }
    .ok_or_else(|| miette!("No OTA data partition in the partition table"))?;
    let apps = table.ota_apps();

    let mut data = OtaData::parse(&image, partition.offset).await?;
    let modified = match (args.select, args.erase) {
        (Some(slot), _) => {
            data.select(&image, slot, apps.len())?;
            true
        }
        (None, true) => {
            data.erase(&image)?;
            true
        }
        (None, false) => false,
    };

    let active = data.active();
    let mut out = new_table(&[
        ("Slot", Color::Green),
        ("Sequence", Color::Cyan),
        ("State", Color::Magenta),
        ("CRC", Color::Red),
        ("Active", Color::Yellow),
    ]);
    for (slot, entry) in data.entries.iter().enumerate() {
        out.add_row(vec![
            Cell::new(slot),
            Cell::new(format!("{:#x}", entry.sequence)),
            Cell::new(match entry.state() {
                Some(state) => state.to_string(),
                None => format!("{:#x}", entry.raw_state),
            }),
            valid_cell(entry.crc_valid()),
            Cell::new(if active == Some(slot) { "*" } else { "" }),
        ]);
    }
    println!("{out}");

    match data.boot_app_index(apps.len()).and_then(|index| apps.get(index)) {
        Some(app) => println!("Boots '{}' at {:#x}", app.label, app.offset),
        None => println!("Boots the factory app"),
    }

    if modified {
        let output = args.output.unwrap_or(args.target.table.image);
        save_image(&image, &output).await?;
    }

    Ok(())
}

async fn fat_ls(args: PartitionArgs) -> Result<()> {
    let image = load_image(&args.table.image)?;
    let partition = find_partition(&image, &args, DataType::Fat).await?;
    let volume = FatVolume::open(&image, partition.offset, partition.size).await?;

    println!(
        "{} volume '{}', {} byte clusters{}",
        volume.fat_type(),
        volume.bpb().volume_label.trim_end(),
        volume.bpb().cluster_size(),
        if volume.wear_levelling().is_some() { ", wear levelled" } else { "" },
    );

    let mut out = new_table(&[
        ("Path", Color::Green),
        ("Size", Color::Cyan),
        ("Modified", Color::Magenta),
    ]);
    for entry in volume.walk().await? {
        let size = match entry.is_dir() {
            true => "<dir>".to_string(),
            false => entry.size.to_string(),
        };
        let modified = entry
            .modified
            .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        out.add_row(vec![Cell::new(&entry.path), Cell::new(size), Cell::new(modified)]);
    }
    println!("{out}");

    Ok(())
}

async fn fat_get(args: FatGetArgs) -> Result<()> {
    let image = load_image(&args.target.table.image)?;
    let partition = find_partition(&image, &args.target, DataType::Fat).await?;
    let volume = FatVolume::open(&image, partition.offset, partition.size).await?;

    let data = volume.read_file(&args.path).await?;
    let output = match args.output {
        Some(output) => output,
        None => {
            let name = args.path.rsplit('/').next().unwrap_or(&args.path);
            if name.is_empty() {
                bail!("'{}' does not name a file", args.path);
            }
            PathBuf::from(name)
        }
    };

    fs::write(&output, &data)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to write {}", output.display()))?;
    info!("Extracted {} bytes to {}", data.len(), output.display());

    Ok(())
}

async fn spiffs_ls(args: PartitionArgs) -> Result<()> {
    let image = load_image(&args.table.image)?;
    let partition = find_partition(&image, &args, DataType::Spiffs).await?;
    let spiffs = Spiffs::open(&image, partition.offset, partition.size).await?;

    if !spiffs.magic_found() {
        warn!("No SPIFFS magic found, the layout was guessed");
    }

    let mut out = new_table(&[
        ("Object", Color::Green),
        ("Name", Color::Cyan),
        ("Size", Color::Magenta),
    ]);
    for file in spiffs.files().await? {
        out.add_row(vec![
            Cell::new(format!("{:#06x}", file.obj_id)),
            Cell::new(&file.name),
            Cell::new(file.size.map_or_else(|| "?".to_string(), |size| size.to_string())),
        ]);
    }
    println!("{out}");

    let stats = spiffs.stats().await?;
    println!(
        "{} pages used, {} free, {} deleted",
        stats.used_pages, stats.free_pages, stats.deleted_pages
    );

    Ok(())
}
