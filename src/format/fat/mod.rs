//! FAT12/16/32 volumes, optionally behind the ESP-IDF wear levelling layer
//!
//! All structures are addressed by their offset in the logical volume. When
//! the volume is wear levelled every access is split at sector boundaries
//! and each piece is translated before it touches the flash image.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use log::{debug, trace, warn};
use strum::Display;

pub use self::{
    dir::{Attributes, DirEntry},
    wear_levelling::{WL_SECTOR_SIZE, WearLevelling, WlState},
};
use self::dir::{
    DELETED,
    END_OF_DIR,
    ENTRY_LEN,
    LfnAccumulator,
    LfnEntry,
    RawEntry,
    encode_lfn,
    exact_short_name,
    numbered_short_name,
};
use super::{le_u16, le_u32};
use crate::{
    error::{Error, FormatError},
    image::FlashImage,
};

pub mod dir;
pub mod wear_levelling;

/// Chains may exceed the cluster count by this much before they are
/// considered corrupt
const CHAIN_SLACK: u32 = 16;
const INVALID_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// FAT variant, decided by the number of data clusters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FatType {
    #[strum(serialize = "FAT12")]
    Fat12,
    #[strum(serialize = "FAT16")]
    Fat16,
    #[strum(serialize = "FAT32")]
    Fat32,
}

impl FatType {
    pub fn from_cluster_count(clusters: u32) -> Self {
        match clusters {
            0..4085 => FatType::Fat12,
            4085..65525 => FatType::Fat16,
            _ => FatType::Fat32,
        }
    }

    /// Value written to terminate a chain
    pub fn end_of_chain(&self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }

    fn bad_cluster(&self) -> u32 {
        self.end_of_chain() - 8
    }

    fn is_end_of_chain(&self, value: u32) -> bool {
        value > self.bad_cluster()
    }
}

/// The geometry fields of the boot sector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiosParameterBlock {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub fat_count: u32,
    pub root_entries: u32,
    pub total_sectors: u32,
    /// Sectors per FAT
    pub fat_size: u32,
    /// First cluster of the root directory (FAT32 only)
    pub root_cluster: u32,
    pub volume_label: String,
}

impl BiosParameterBlock {
    /// Decode a boot sector, `None` if it does not look like one
    pub fn decode(sector: &[u8]) -> Option<Self> {
        if sector.len() < 512 || sector[510..512] != [0x55, 0xAA] {
            return None;
        }

        let bytes_per_sector = le_u16(sector, 11) as u32;
        let sectors_per_cluster = sector[13] as u32;
        let reserved_sectors = le_u16(sector, 14) as u32;
        let fat_count = sector[16] as u32;
        let root_entries = le_u16(sector, 17) as u32;
        let total_sectors = match le_u16(sector, 19) {
            0 => le_u32(sector, 32),
            n => n as u32,
        };
        let fat_size16 = le_u16(sector, 22) as u32;
        let (fat_size, root_cluster, label_at) = match fat_size16 {
            0 => (le_u32(sector, 36), le_u32(sector, 44), 71),
            n => (n, 0, 43),
        };

        let sane = matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096)
            && sectors_per_cluster.is_power_of_two()
            && reserved_sectors >= 1
            && (1..=4).contains(&fat_count)
            && total_sectors > 0
            && fat_size > 0;
        if !sane {
            return None;
        }

        let volume_label = String::from_utf8_lossy(&sector[label_at..label_at + 11])
            .trim_end()
            .to_string();

        Some(BiosParameterBlock {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            fat_count,
            root_entries,
            total_sectors,
            fat_size,
            root_cluster,
            volume_label,
        })
    }

    fn root_dir_sectors(&self) -> u32 {
        (self.root_entries * ENTRY_LEN as u32).div_ceil(self.bytes_per_sector)
    }

    fn first_data_sector(&self) -> u64 {
        self.reserved_sectors as u64
            + self.fat_count as u64 * self.fat_size as u64
            + self.root_dir_sectors() as u64
    }

    /// Check that the reserved area, the FATs and the root directory fit
    /// inside the volume
    fn validate(&self, offset: u32) -> Result<(), FormatError> {
        if self.first_data_sector() >= self.total_sectors as u64 {
            return Err(FormatError::Implausible {
                what: "FAT size",
                offset,
                value: self.fat_size,
            });
        }
        Ok(())
    }

    pub fn cluster_size(&self) -> u32 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    /// Number of data clusters
    pub fn cluster_count(&self) -> u32 {
        let data_sectors = (self.total_sectors as u64).saturating_sub(self.first_data_sector());
        (data_sectors / self.sectors_per_cluster as u64) as u32
    }
}

/// Entries of a directory, possibly cut short by a corrupt entry
#[derive(Debug, Clone, Default)]
pub struct DirListing {
    pub entries: Vec<DirEntry>,
    /// The problem that ended the scan early
    pub error: Option<FormatError>,
}

/// A directory entry together with its contents
#[derive(Debug, Clone)]
pub struct FatNode {
    pub entry: DirEntry,
    pub children: Vec<FatNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirLocation {
    /// The fixed root directory region of FAT12/16
    FixedRoot,
    /// A directory stored in a cluster chain
    Chain(u32),
}

/// A mounted FAT volume
#[derive(Debug)]
pub struct FatVolume<'a> {
    image: &'a FlashImage,
    /// Offset of the partition in the flash image
    base: u32,
    /// Length of the logical volume
    len: u64,
    wl: Option<WearLevelling>,
    bpb: BiosParameterBlock,
    fat_type: FatType,
}

impl<'a> FatVolume<'a> {
    /// Mount the FAT volume in the partition at `base`
    ///
    /// A plain FAT boot sector at the start of the partition is used as is,
    /// otherwise the wear levelling footer is consulted.
    pub async fn open(image: &'a FlashImage, base: u32, len: u32) -> Result<Self, Error> {
        let first = image.read(base, 512.min(len as usize)).await?;

        let (wl, bpb) = if let Some(bpb) = BiosParameterBlock::decode(&first) {
            (None, bpb)
        } else {
            let wl = WearLevelling::detect(image, base, len)
                .await?
                .ok_or_else(|| FormatError::NotFound(format!("FAT volume at {base:#x}")))?;
            let sector = image
                .read(base + wl.translate(0) as u32, 512)
                .await?;
            let bpb = BiosParameterBlock::decode(&sector).ok_or(FormatError::BadMagic {
                offset: base + wl.translate(510) as u32,
                expected: 0xAA55,
                found: le_u16(&sector, 510) as u32,
            })?;
            (Some(wl), bpb)
        };

        bpb.validate(base)?;

        let volume_len = wl.map_or(len as u64, |wl| wl.volume_len());
        let needed = bpb.total_sectors as u64 * bpb.bytes_per_sector as u64;
        if needed > volume_len {
            return Err(FormatError::OutOfBounds {
                what: "FAT volume",
                offset: base,
                length: needed.min(u32::MAX as u64) as u32,
                limit: volume_len as u32,
            }
            .into());
        }

        let fat_type = FatType::from_cluster_count(bpb.cluster_count());
        debug!(
            "{} volume at {:#x}: {} clusters of {} bytes{}",
            fat_type,
            base,
            bpb.cluster_count(),
            bpb.cluster_size(),
            if wl.is_some() { ", wear levelled" } else { "" }
        );

        Ok(FatVolume {
            image,
            base,
            len: volume_len,
            wl,
            bpb,
            fat_type,
        })
    }

    pub fn fat_type(&self) -> FatType {
        self.fat_type
    }

    pub fn bpb(&self) -> &BiosParameterBlock {
        &self.bpb
    }

    pub fn wear_levelling(&self) -> Option<&WearLevelling> {
        self.wl.as_ref()
    }

    fn physical(&self, offset: u64) -> u32 {
        let translated = self.wl.map_or(offset, |wl| wl.translate(offset));
        self.base + translated as u32
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<(), FormatError> {
        if offset + len as u64 > self.len {
            return Err(FormatError::OutOfBounds {
                what: "volume access",
                offset: offset as u32,
                length: len as u32,
                limit: self.len as u32,
            });
        }
        Ok(())
    }

    /// Pieces of `offset..offset + len` that do not cross a wear levelling
    /// sector
    fn pieces(&self, offset: u64, len: usize) -> Vec<(u64, usize)> {
        let step = WL_SECTOR_SIZE as u64;
        let mut pieces = vec![];
        let mut pos = offset;
        let end = offset + len as u64;

        while pos < end {
            let next = if self.wl.is_some() {
                ((pos / step + 1) * step).min(end)
            } else {
                end
            };
            pieces.push((pos, (next - pos) as usize));
            pos = next;
        }
        pieces
    }

    async fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        self.check_bounds(offset, len)?;

        let mut out = Vec::with_capacity(len);
        for (pos, n) in self.pieces(offset, len) {
            out.extend(self.image.read(self.physical(pos), n).await?);
        }
        Ok(out)
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        self.check_bounds(offset, data.len())?;

        let mut consumed = 0;
        for (pos, n) in self.pieces(offset, data.len()) {
            self.image
                .write(self.physical(pos), &data[consumed..consumed + n])?;
            consumed += n;
        }
        Ok(())
    }

    fn fat_offset(&self, copy: u32) -> u64 {
        (self.bpb.reserved_sectors as u64 + copy as u64 * self.bpb.fat_size as u64)
            * self.bpb.bytes_per_sector as u64
    }

    fn entry_position(&self, cluster: u32) -> (u64, usize) {
        match self.fat_type {
            FatType::Fat12 => ((cluster + cluster / 2) as u64, 2),
            FatType::Fat16 => (cluster as u64 * 2, 2),
            FatType::Fat32 => (cluster as u64 * 4, 4),
        }
    }

    /// Value of the FAT entry for `cluster` in the first FAT
    pub async fn fat_entry(&self, cluster: u32) -> Result<u32, Error> {
        let (offset, len) = self.entry_position(cluster);
        let bytes = self.read_bytes(self.fat_offset(0) + offset, len).await?;

        Ok(match self.fat_type {
            FatType::Fat12 => {
                let raw = le_u16(&bytes, 0);
                if cluster & 1 == 1 {
                    (raw >> 4) as u32
                } else {
                    (raw & 0x0FFF) as u32
                }
            }
            FatType::Fat16 => le_u16(&bytes, 0) as u32,
            FatType::Fat32 => le_u32(&bytes, 0) & 0x0FFF_FFFF,
        })
    }

    /// Set the FAT entry for `cluster` in every FAT copy
    async fn set_fat_entry(&self, cluster: u32, value: u32) -> Result<(), Error> {
        let (offset, len) = self.entry_position(cluster);

        for copy in 0..self.bpb.fat_count {
            let at = self.fat_offset(copy) + offset;
            let bytes = match self.fat_type {
                FatType::Fat12 => {
                    let raw = le_u16(&self.read_bytes(at, len).await?, 0);
                    let raw = if cluster & 1 == 1 {
                        (raw & 0x000F) | ((value as u16) << 4)
                    } else {
                        (raw & 0xF000) | (value as u16 & 0x0FFF)
                    };
                    raw.to_le_bytes().to_vec()
                }
                FatType::Fat16 => (value as u16).to_le_bytes().to_vec(),
                FatType::Fat32 => {
                    let raw = le_u32(&self.read_bytes(at, len).await?, 0);
                    ((raw & 0xF000_0000) | (value & 0x0FFF_FFFF)).to_le_bytes().to_vec()
                }
            };
            self.write_bytes(at, &bytes)?;
        }

        Ok(())
    }

    fn is_data_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster < self.bpb.cluster_count() + 2
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        let sector = self.bpb.first_data_sector()
            + (cluster as u64 - 2) * self.bpb.sectors_per_cluster as u64;
        sector * self.bpb.bytes_per_sector as u64
    }

    /// Follow the cluster chain starting at `start`
    pub async fn chain(&self, start: u32) -> Result<Vec<u32>, Error> {
        let limit = (self.bpb.cluster_count() + CHAIN_SLACK) as usize;
        let mut chain = vec![];
        let mut cluster = start;

        loop {
            if !self.is_data_cluster(cluster) {
                return Err(FormatError::Implausible {
                    what: "cluster number",
                    offset: self.physical(self.fat_offset(0) + self.entry_position(cluster).0),
                    value: cluster,
                }
                .into());
            }
            if chain.len() >= limit {
                return Err(FormatError::Implausible {
                    what: "cluster chain length",
                    offset: start,
                    value: chain.len() as u32,
                }
                .into());
            }
            chain.push(cluster);

            let next = self.fat_entry(cluster).await?;
            if self.fat_type.is_end_of_chain(next) {
                break;
            }
            cluster = next;
        }

        Ok(chain)
    }

    /// Offsets and contents of every slot of a directory
    async fn dir_slots(&self, location: DirLocation) -> Result<Vec<(u64, [u8; ENTRY_LEN])>, Error> {
        let regions: Vec<(u64, usize)> = match location {
            DirLocation::FixedRoot => {
                let offset = self.fat_offset(self.bpb.fat_count);
                vec![(offset, self.bpb.root_entries as usize * ENTRY_LEN)]
            }
            DirLocation::Chain(start) => {
                let size = self.bpb.cluster_size() as usize;
                self.chain(start)
                    .await?
                    .into_iter()
                    .map(|c| (self.cluster_offset(c), size))
                    .collect()
            }
        };

        let mut slots = vec![];
        for (offset, len) in regions {
            let data = self.read_bytes(offset, len).await?;
            for (i, chunk) in data.chunks_exact(ENTRY_LEN).enumerate() {
                let mut raw = [0u8; ENTRY_LEN];
                raw.copy_from_slice(chunk);
                slots.push((offset + (i * ENTRY_LEN) as u64, raw));
            }
        }

        Ok(slots)
    }

    fn root(&self) -> DirLocation {
        match self.fat_type {
            FatType::Fat32 => DirLocation::Chain(self.bpb.root_cluster),
            _ => DirLocation::FixedRoot,
        }
    }

    fn check_entry(&self, entry: &RawEntry, offset: u64) -> Result<(), FormatError> {
        let implausible = |what, value| FormatError::Implausible {
            what,
            offset: self.physical(offset),
            value,
        };

        if entry.name[0] < 0x20 && entry.name[0] != 0x05 {
            return Err(implausible("directory entry name", entry.name[0] as u32));
        }
        let needs_cluster = entry.attributes.contains(Attributes::DIRECTORY) || entry.size > 0;
        if (needs_cluster || entry.cluster != 0) && !self.is_data_cluster(entry.cluster) {
            return Err(implausible("directory entry cluster", entry.cluster));
        }

        Ok(())
    }

    async fn list(&self, location: DirLocation, parent: &str) -> Result<DirListing, Error> {
        let mut listing = DirListing::default();
        let mut lfn = LfnAccumulator::default();

        for (offset, raw) in self.dir_slots(location).await? {
            match raw[0] {
                END_OF_DIR => break,
                DELETED => {
                    lfn.reset();
                    continue;
                }
                _ => {}
            }

            let entry = RawEntry::decode(&raw);
            if entry.is_long_name() {
                lfn.push(LfnEntry::decode(&raw), offset);
                continue;
            }
            if entry.attributes.contains(Attributes::VOLUME_ID) {
                lfn.reset();
                continue;
            }

            let short_name = entry.short_name();
            if short_name == "." || short_name == ".." {
                lfn.reset();
                continue;
            }

            if let Err(err) = self.check_entry(&entry, offset) {
                warn!("Directory scan of {} stopped: {}", parent, err);
                listing.error = Some(err);
                break;
            }

            let (name, lfn_offsets) = lfn
                .take(&entry.name)
                .unwrap_or_else(|| (short_name.clone(), vec![]));

            listing.entries.push(DirEntry {
                path: join_path(parent, &name),
                name,
                short_name,
                attributes: entry.attributes,
                cluster: entry.cluster,
                size: entry.size,
                created: entry.created,
                modified: entry.modified,
                offset,
                lfn_offsets,
            });
        }

        Ok(listing)
    }

    /// Split a path into its components, ignoring empty ones
    fn components(path: &str) -> Vec<&str> {
        path.split('/').filter(|c| !c.is_empty()).collect()
    }

    /// Resolve `path` to its directory entry
    pub async fn find(&self, path: &str) -> Result<DirEntry, Error> {
        let components = Self::components(path);
        let mut location = self.root();
        let mut parent = String::from("/");
        let mut found = None;

        for (i, component) in components.iter().enumerate() {
            let listing = self.list(location, &parent).await?;
            let entry = listing
                .entries
                .into_iter()
                .find(|e| e.matches(component))
                .ok_or_else(|| FormatError::NotFound(format!("file or directory '{path}'")))?;

            if i + 1 < components.len() {
                if !entry.is_dir() {
                    return Err(FormatError::NotFound(format!("directory '{}'", entry.path)).into());
                }
                location = DirLocation::Chain(entry.cluster);
                parent = entry.path.clone();
            }
            found = Some(entry);
        }

        found.ok_or_else(|| FormatError::NotFound(format!("entry for '{path}'")).into())
    }

    async fn resolve_dir(&self, path: &str) -> Result<(DirLocation, String), Error> {
        if Self::components(path).is_empty() {
            return Ok((self.root(), "/".into()));
        }

        let entry = self.find(path).await?;
        if !entry.is_dir() {
            return Err(FormatError::NotFound(format!("directory '{path}'")).into());
        }
        Ok((DirLocation::Chain(entry.cluster), entry.path))
    }

    /// Entries of the directory at `path` (`/` for the root)
    pub async fn list_dir(&self, path: &str) -> Result<DirListing, Error> {
        let (location, path) = self.resolve_dir(path).await?;
        self.list(location, &path).await
    }

    /// Every entry of the volume, parents before their children
    pub async fn walk(&self) -> Result<Vec<DirEntry>, Error> {
        let mut out = vec![];
        let mut pending = vec![(self.root(), String::from("/"))];
        let mut visited = 0usize;

        while let Some((location, path)) = pending.pop() {
            visited += 1;
            if visited > self.bpb.cluster_count() as usize + 1 {
                return Err(FormatError::Implausible {
                    what: "directory count",
                    offset: self.base,
                    value: visited as u32,
                }
                .into());
            }

            let listing = self.list(location, &path).await?;
            for entry in listing.entries.iter().rev() {
                if entry.is_dir() {
                    pending.push((DirLocation::Chain(entry.cluster), entry.path.clone()));
                }
            }
            out.extend(listing.entries);
        }

        Ok(out)
    }

    /// The whole directory tree
    pub async fn tree(&self) -> Result<Vec<FatNode>, Error> {
        let mut by_parent: HashMap<String, Vec<DirEntry>> = HashMap::new();
        for entry in self.walk().await? {
            by_parent
                .entry(parent_path(&entry.path).to_string())
                .or_default()
                .push(entry);
        }

        fn build(parent: &str, by_parent: &mut HashMap<String, Vec<DirEntry>>) -> Vec<FatNode> {
            let entries = by_parent.remove(parent).unwrap_or_default();
            entries
                .into_iter()
                .map(|entry| {
                    let children = if entry.is_dir() {
                        build(&entry.path, by_parent)
                    } else {
                        vec![]
                    };
                    FatNode { entry, children }
                })
                .collect()
        }

        Ok(build("/", &mut by_parent))
    }

    /// Contents of the file at `path`
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, Error> {
        let entry = self.find(path).await?;
        if entry.is_dir() {
            return Err(FormatError::Unsupported(format!("'{path}' is a directory")).into());
        }
        if entry.size == 0 {
            return Ok(vec![]);
        }

        let cluster_size = self.bpb.cluster_size() as usize;
        let chain = self.chain(entry.cluster).await?;
        if chain.len() * cluster_size < entry.size as usize {
            return Err(FormatError::Implausible {
                what: "cluster chain length",
                offset: self.physical(entry.offset),
                value: chain.len() as u32,
            }
            .into());
        }

        let mut data = Vec::with_capacity(entry.size as usize);
        for cluster in chain {
            let remaining = entry.size as usize - data.len();
            if remaining == 0 {
                break;
            }
            let n = remaining.min(cluster_size);
            data.extend(self.read_bytes(self.cluster_offset(cluster), n).await?);
        }

        Ok(data)
    }

    /// Delete a file or an empty directory
    pub async fn delete(&self, path: &str) -> Result<(), Error> {
        let entry = self.find(path).await?;

        if entry.is_dir() {
            let listing = self.list(DirLocation::Chain(entry.cluster), &entry.path).await?;
            if !listing.entries.is_empty() {
                return Err(FormatError::Unsupported(format!("directory '{path}' is not empty")).into());
            }
        }

        if entry.cluster != 0 {
            let zeros = vec![0u8; self.bpb.cluster_size() as usize];
            for cluster in self.chain(entry.cluster).await? {
                self.write_bytes(self.cluster_offset(cluster), &zeros)?;
                self.set_fat_entry(cluster, 0).await?;
            }
        }

        for offset in entry.lfn_offsets.iter().chain([&entry.offset]) {
            self.write_bytes(*offset, &[DELETED])?;
        }

        debug!("Deleted {}", entry.path);
        Ok(())
    }

    /// Free clusters in ascending order, skipping `exclude`
    async fn allocate(&self, count: usize, exclude: &[u32]) -> Result<Vec<u32>, Error> {
        let mut free = Vec::with_capacity(count);
        if count == 0 {
            return Ok(free);
        }

        for cluster in 2..self.bpb.cluster_count() + 2 {
            if exclude.contains(&cluster) {
                continue;
            }
            if self.fat_entry(cluster).await? == 0 {
                free.push(cluster);
                if free.len() == count {
                    return Ok(free);
                }
            }
        }

        Err(FormatError::NoSpace(format!(
            "{count} free cluster(s) needed, {} available",
            free.len()
        ))
        .into())
    }

    /// Link `clusters` into a chain in every FAT
    async fn write_chain(&self, clusters: &[u32]) -> Result<(), Error> {
        for (i, &cluster) in clusters.iter().enumerate() {
            let next = clusters
                .get(i + 1)
                .copied()
                .unwrap_or(self.fat_type.end_of_chain());
            self.set_fat_entry(cluster, next).await?;
        }
        Ok(())
    }

    /// Find `count` consecutive free slots, growing a cluster directory by
    /// one cluster if needed
    ///
    /// Returns the slot offsets and the cluster added to the directory.
    async fn free_slots(&self, location: DirLocation, count: usize) -> Result<(Vec<u64>, Option<u32>), Error> {
        let slots = self.dir_slots(location).await?;
        let mut offsets: Vec<u64> = slots.iter().map(|(o, _)| *o).collect();
        let end = slots
            .iter()
            .position(|(_, raw)| raw[0] == END_OF_DIR)
            .unwrap_or(slots.len());
        let mut free: Vec<bool> = slots
            .iter()
            .enumerate()
            .map(|(i, (_, raw))| i >= end || raw[0] == DELETED)
            .collect();

        if let Some(start) = find_run(&free, count) {
            return Ok((offsets[start..start + count].to_vec(), None));
        }

        let DirLocation::Chain(first) = location else {
            return Err(FormatError::NoSpace("root directory is full".into()).into());
        };

        let chain = self.chain(first).await?;
        let cluster = self.allocate(1, &[]).await?[0];
        let cluster_offset = self.cluster_offset(cluster);
        let per_cluster = self.bpb.cluster_size() as usize / ENTRY_LEN;
        offsets.extend((0..per_cluster).map(|i| cluster_offset + (i * ENTRY_LEN) as u64));
        free.extend(std::iter::repeat_n(true, per_cluster));

        let start = find_run(&free, count)
            .ok_or_else(|| FormatError::NoSpace("name does not fit in a directory cluster".into()))?;

        self.write_bytes(cluster_offset, &vec![0u8; self.bpb.cluster_size() as usize])?;
        if let Some(&last) = chain.last() {
            self.set_fat_entry(last, cluster).await?;
        }
        self.set_fat_entry(cluster, self.fat_type.end_of_chain()).await?;
        trace!("Directory at cluster {} grown by cluster {}", first, cluster);

        Ok((offsets[start..start + count].to_vec(), Some(cluster)))
    }

    /// Write a new directory entry (and its long name entries) for `name`
    async fn insert_entry(
        &self,
        location: DirLocation,
        parent: &str,
        name: &str,
        attributes: Attributes,
        cluster: u32,
        size: u32,
        timestamp: NaiveDateTime,
    ) -> Result<DirEntry, Error> {
        let existing = self.list(location, parent).await?.entries;

        let (short, nt_flags, lfn) = match exact_short_name(name) {
            Some((short, flags)) => (short, flags, vec![]),
            None => {
                let short = (1..=999_999)
                    .map(|n| numbered_short_name(name, n))
                    .find(|candidate| {
                        let display = short_display(candidate);
                        !existing.iter().any(|e| e.short_name.eq_ignore_ascii_case(&display))
                    })
                    .ok_or_else(|| FormatError::NoSpace(format!("no short name left for '{name}'")))?;
                (short, 0, encode_lfn(name, &short))
            }
        };

        let (slots, _) = self.free_slots(location, lfn.len() + 1).await?;

        let raw = RawEntry {
            name: short,
            attributes,
            nt_flags,
            cluster,
            size,
            created: Some(timestamp),
            modified: Some(timestamp),
        };
        for (offset, bytes) in slots.iter().zip(lfn.iter().chain([&raw.encode()])) {
            self.write_bytes(*offset, bytes)?;
        }

        let offset = slots[slots.len() - 1];
        Ok(DirEntry {
            name: name.to_string(),
            short_name: raw.short_name(),
            path: join_path(parent, name),
            attributes,
            cluster,
            size,
            created: Some(timestamp),
            modified: Some(timestamp),
            offset,
            lfn_offsets: slots[..slots.len() - 1].to_vec(),
        })
    }

    async fn prepare_insert(&self, dir: &str, name: &str) -> Result<(DirLocation, String), Error> {
        if name.is_empty() || name == "." || name == ".." || name.contains(INVALID_NAME_CHARS) {
            return Err(FormatError::InvalidName(name.to_string()).into());
        }
        if name.encode_utf16().count() > 255 {
            return Err(FormatError::InvalidName(name.to_string()).into());
        }

        let (location, parent) = self.resolve_dir(dir).await?;
        let existing = self.list(location, &parent).await?;
        if existing.entries.iter().any(|e| e.matches(name)) {
            return Err(FormatError::AlreadyExists(join_path(&parent, name)).into());
        }

        Ok((location, parent))
    }

    /// Create the file `name` in directory `dir`
    ///
    /// Uses the current local time when no `timestamp` is given.
    pub async fn add_file(
        &self,
        dir: &str,
        name: &str,
        data: &[u8],
        timestamp: Option<NaiveDateTime>,
    ) -> Result<DirEntry, Error> {
        let timestamp = timestamp.unwrap_or_else(|| chrono::Local::now().naive_local());
        let (location, parent) = self.prepare_insert(dir, name).await?;

        let cluster_size = self.bpb.cluster_size() as usize;
        let needed = data.len().div_ceil(cluster_size);
        // Reserve the data clusters first so a directory extension can't
        // take them
        let clusters = self.allocate(needed, &[]).await?;
        self.write_chain(&clusters).await?;

        for (cluster, chunk) in clusters.iter().zip(data.chunks(cluster_size)) {
            let mut buf = chunk.to_vec();
            buf.resize(cluster_size, 0);
            self.write_bytes(self.cluster_offset(*cluster), &buf)?;
        }

        let first = clusters.first().copied().unwrap_or(0);
        let entry = self
            .insert_entry(
                location,
                &parent,
                name,
                Attributes::ARCHIVE,
                first,
                data.len() as u32,
                timestamp,
            )
            .await?;

        debug!("Added {} ({} bytes, {} clusters)", entry.path, data.len(), needed);
        Ok(entry)
    }

    /// Create an empty directory `name` in directory `dir`
    pub async fn create_dir(
        &self,
        dir: &str,
        name: &str,
        timestamp: Option<NaiveDateTime>,
    ) -> Result<DirEntry, Error> {
        let timestamp = timestamp.unwrap_or_else(|| chrono::Local::now().naive_local());
        let (location, parent) = self.prepare_insert(dir, name).await?;

        let cluster = self.allocate(1, &[]).await?[0];
        self.write_chain(&[cluster]).await?;

        let parent_cluster = match location {
            DirLocation::Chain(c) if c != self.bpb.root_cluster => c,
            _ => 0,
        };
        let mut contents = vec![0u8; self.bpb.cluster_size() as usize];
        for (i, (dots, target)) in [(*b".          ", cluster), (*b"..         ", parent_cluster)]
            .into_iter()
            .enumerate()
        {
            let raw = RawEntry {
                name: dots,
                attributes: Attributes::DIRECTORY,
                nt_flags: 0,
                cluster: target,
                size: 0,
                created: Some(timestamp),
                modified: Some(timestamp),
            };
            contents[i * ENTRY_LEN..][..ENTRY_LEN].copy_from_slice(&raw.encode());
        }
        self.write_bytes(self.cluster_offset(cluster), &contents)?;

        self.insert_entry(location, &parent, name, Attributes::DIRECTORY, cluster, 0, timestamp)
            .await
    }
}

fn find_run(free: &[bool], count: usize) -> Option<usize> {
    let mut run = 0;
    for (i, &is_free) in free.iter().enumerate() {
        run = if is_free { run + 1 } else { 0 };
        if run == count {
            return Some(i + 1 - count);
        }
    }
    None
}

fn short_display(name: &[u8; 11]) -> String {
    RawEntry {
        name: *name,
        attributes: Attributes::empty(),
        nt_flags: 0,
        cluster: 0,
        size: 0,
        created: None,
        modified: None,
    }
    .short_name()
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}
