//! Read-only SPIFFS support
//!
//! Files are reconstructed from the page headers alone: the object index
//! header page (span 0 of an index object) supplies name and size, and data
//! pages are placed by their span index.

use std::collections::BTreeMap;

use log::{debug, warn};

use super::{decode_str, le_u16, le_u32};
use crate::{
    error::{Error, FormatError},
    image::{ERASED, FlashImage},
};

const MAGIC_SEED: u32 = 0x2014_0529;
const PAGE_HEADER_LEN: usize = 5;
const OBJ_ID_FREE: u16 = 0xFFFF;
const OBJ_ID_DELETED: u16 = 0x0000;
const OBJ_ID_INDEX: u16 = 0x8000;

const PAGE_SIZES: [u32; 3] = [256, 512, 1024];
const BLOCK_SIZES: [u32; 3] = [4096, 8192, 65536];

bitflags::bitflags! {
    /// Page header flags, a flag is set when its bit is cleared on flash
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        const USED = 1 << 0;
        const FINAL = 1 << 1;
        const INDEX = 1 << 2;
        const IXDELE = 1 << 6;
        const DELET = 1 << 7;
    }
}

impl PageFlags {
    fn from_raw(raw: u8) -> Self {
        PageFlags::from_bits_truncate(!raw)
    }

    /// A finalized page that has not been deleted
    fn is_live(&self) -> bool {
        self.contains(PageFlags::USED | PageFlags::FINAL) && !self.contains(PageFlags::DELET)
    }
}

/// Filesystem geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiffsConfig {
    pub page_size: u32,
    pub block_size: u32,
    pub obj_name_len: usize,
    pub meta_len: usize,
}

impl Default for SpiffsConfig {
    fn default() -> Self {
        SpiffsConfig {
            page_size: 256,
            block_size: 4096,
            obj_name_len: 32,
            meta_len: 4,
        }
    }
}

impl SpiffsConfig {
    pub fn pages_per_block(&self) -> u32 {
        self.block_size / self.page_size
    }

    /// Pages at the start of each block holding the object lookup table
    pub fn lookup_pages(&self) -> u32 {
        (self.pages_per_block() * 2).div_ceil(self.page_size).max(1)
    }

    pub fn data_per_page(&self) -> usize {
        self.page_size as usize - PAGE_HEADER_LEN
    }

    /// Offset of the magic word within block `block`
    fn magic_offset(&self) -> usize {
        (self.lookup_pages() * self.page_size) as usize - 4
    }

    fn magic(&self, block_count: u32, block: u32) -> u16 {
        (MAGIC_SEED ^ self.page_size ^ (block_count - block)) as u16
    }
}

/// A file found in the filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiffsFile {
    pub obj_id: u16,
    pub name: String,
    /// Size from the index header, `None` when it was never finalized
    pub size: Option<u32>,
    pub object_type: u8,
    /// Offset of the index header page in the flash image
    pub header_address: u32,
    spans: BTreeMap<u16, u32>,
}

impl SpiffsFile {
    /// Data page addresses keyed by span index
    pub fn data_pages(&self) -> &BTreeMap<u16, u32> {
        &self.spans
    }
}

/// Page usage according to the lookup tables
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpiffsStats {
    pub used_pages: u32,
    pub free_pages: u32,
    pub deleted_pages: u32,
}

/// A SPIFFS partition
#[derive(Debug)]
pub struct Spiffs<'a> {
    image: &'a FlashImage,
    base: u32,
    len: u32,
    config: SpiffsConfig,
    magic_found: bool,
}

impl<'a> Spiffs<'a> {
    /// Open the filesystem in the partition at `base`, detecting its
    /// geometry
    pub async fn open(image: &'a FlashImage, base: u32, len: u32) -> Result<Self, Error> {
        let data = image.read(base, len as usize).await?;

        if let Some(config) = detect_magic(&data) {
            debug!(
                "SPIFFS magic found at {:#x}: {} byte pages, {} byte blocks",
                base, config.page_size, config.block_size
            );
            return Ok(Spiffs {
                image,
                base,
                len,
                config,
                magic_found: true,
            });
        }

        let config = detect_heuristic(&data)
            .ok_or_else(|| FormatError::NotFound(format!("SPIFFS filesystem at {base:#x}")))?;
        warn!(
            "No SPIFFS magic at {:#x}, guessed {} byte pages and {} byte blocks",
            base, config.page_size, config.block_size
        );

        Ok(Spiffs {
            image,
            base,
            len,
            config,
            magic_found: false,
        })
    }

    /// Open with known geometry
    pub fn with_config(image: &'a FlashImage, base: u32, len: u32, config: SpiffsConfig) -> Self {
        Spiffs {
            image,
            base,
            len,
            config,
            magic_found: false,
        }
    }

    pub fn config(&self) -> &SpiffsConfig {
        &self.config
    }

    /// Whether the geometry came from the magic word
    pub fn magic_found(&self) -> bool {
        self.magic_found
    }

    fn block_count(&self) -> u32 {
        self.len / self.config.block_size
    }

    /// Offsets (relative to the partition) of every page outside the lookup
    /// area, with the lookup table entry describing it
    fn content_pages<'d>(&self, data: &'d [u8]) -> impl Iterator<Item = (usize, u16)> + 'd {
        let config = self.config;
        (0..self.block_count()).flat_map(move |block| {
            let block_start = (block * config.block_size) as usize;
            (config.lookup_pages()..config.pages_per_block()).map(move |page| {
                let lookup = block_start + 2 * (page - config.lookup_pages()) as usize;
                let offset = block_start + (page * config.page_size) as usize;
                (offset, le_u16(data, lookup))
            })
        })
    }

    pub async fn stats(&self) -> Result<SpiffsStats, Error> {
        let data = self.image.read(self.base, self.len as usize).await?;
        let mut stats = SpiffsStats::default();

        for (_, entry) in self.content_pages(&data) {
            match entry {
                OBJ_ID_FREE => stats.free_pages += 1,
                OBJ_ID_DELETED => stats.deleted_pages += 1,
                _ => stats.used_pages += 1,
            }
        }

        Ok(stats)
    }

    /// Every file with an index header page
    pub async fn files(&self) -> Result<Vec<SpiffsFile>, Error> {
        let data = self.image.read(self.base, self.len as usize).await?;
        let name_at = 13;
        let name_end = name_at + self.config.obj_name_len;

        let mut files: BTreeMap<u16, SpiffsFile> = BTreeMap::new();
        let mut spans: BTreeMap<u16, BTreeMap<u16, u32>> = BTreeMap::new();

        for (offset, _) in self.content_pages(&data) {
            let page = &data[offset..offset + self.config.page_size as usize];
            let obj_id = le_u16(page, 0);
            let span = le_u16(page, 2);
            let flags = PageFlags::from_raw(page[4]);

            if obj_id == OBJ_ID_FREE || obj_id == OBJ_ID_DELETED || !flags.is_live() {
                continue;
            }

            let address = self.base + offset as u32;
            if obj_id & OBJ_ID_INDEX != 0 {
                if span != 0 || page.len() < name_end {
                    continue;
                }
                let id = obj_id & !OBJ_ID_INDEX;
                let size = le_u32(page, 8);
                files.entry(id).or_insert_with(|| SpiffsFile {
                    obj_id: id,
                    name: decode_str(&page[name_at..name_end]),
                    size: (size != u32::MAX).then_some(size),
                    object_type: page[12],
                    header_address: address,
                    spans: BTreeMap::new(),
                });
            } else {
                spans.entry(obj_id).or_default().entry(span).or_insert(address);
            }
        }

        for (id, file) in files.iter_mut() {
            file.spans = spans.remove(id).unwrap_or_default();
        }
        if !spans.is_empty() {
            debug!("{} SPIFFS object(s) without an index header", spans.len());
        }

        Ok(files.into_values().collect())
    }

    /// Contents of the file called `name`, erased bytes standing in for
    /// missing pages
    pub async fn read_file(&self, name: &str) -> Result<Vec<u8>, Error> {
        let file = self
            .files()
            .await?
            .into_iter()
            .find(|f| f.name == name)
            .ok_or_else(|| FormatError::NotFound(format!("SPIFFS file '{name}'")))?;

        let per_page = self.config.data_per_page();
        let capacity = (self.len / self.config.page_size) as usize * per_page;
        let len = match file.size {
            Some(size) if size as usize > capacity => {
                return Err(FormatError::Implausible {
                    what: "SPIFFS file size",
                    offset: file.header_address,
                    value: size,
                }
                .into());
            }
            Some(size) => size as usize,
            None => file
                .spans
                .keys()
                .next_back()
                .map_or(0, |last| (*last as usize + 1) * per_page),
        };

        let mut out = vec![ERASED; len];
        for (&span, &address) in &file.spans {
            let start = span as usize * per_page;
            if start >= len {
                continue;
            }
            let n = per_page.min(len - start);
            let bytes = self.image.read(address + PAGE_HEADER_LEN as u32, n).await?;
            out[start..start + n].copy_from_slice(&bytes);
        }

        let page_count = len.div_ceil(per_page);
        let present = file
            .spans
            .keys()
            .filter(|&&span| (span as usize) < page_count)
            .count();
        let missing = page_count - present;
        if missing > 0 {
            warn!("SPIFFS file '{}' is missing {} data page(s)", name, missing);
        }

        Ok(out)
    }
}

fn candidates(len: usize) -> impl Iterator<Item = SpiffsConfig> {
    BLOCK_SIZES.into_iter().flat_map(move |block_size| {
        PAGE_SIZES
            .into_iter()
            .filter(move |_| block_size as usize <= len && len % block_size as usize == 0)
            .map(move |page_size| SpiffsConfig {
                page_size,
                block_size,
                ..SpiffsConfig::default()
            })
    })
}

fn detect_magic(data: &[u8]) -> Option<SpiffsConfig> {
    candidates(data.len()).find(|config| {
        let block_count = (data.len() / config.block_size as usize) as u32;
        le_u16(data, config.magic_offset()) == config.magic(block_count, 0)
    })
}

fn detect_heuristic(data: &[u8]) -> Option<SpiffsConfig> {
    candidates(data.len())
        .map(|config| (well_formed_pages(data, &config), config))
        .filter(|(count, _)| *count > 0)
        // Ties go to the first candidate
        .fold(None, |best: Option<(usize, SpiffsConfig)>, (count, config)| match best {
            Some((best_count, _)) if best_count >= count => best,
            _ => Some((count, config)),
        })
        .map(|(_, config)| config)
}

/// Pages whose header agrees with the lookup table under `config`
fn well_formed_pages(data: &[u8], config: &SpiffsConfig) -> usize {
    let block_count = data.len() as u32 / config.block_size;
    let total_pages = block_count * config.pages_per_block();
    let mut count = 0;

    for block in 0..block_count {
        let block_start = (block * config.block_size) as usize;
        for page in config.lookup_pages()..config.pages_per_block() {
            let lookup = le_u16(data, block_start + 2 * (page - config.lookup_pages()) as usize);
            if lookup == OBJ_ID_FREE || lookup == OBJ_ID_DELETED {
                continue;
            }

            let offset = block_start + (page * config.page_size) as usize;
            let obj_id = le_u16(data, offset);
            let span = le_u16(data, offset + 2) as u32;
            let flags = PageFlags::from_raw(data[offset + 4]);

            if obj_id == lookup && flags.contains(PageFlags::USED) && span < total_pages {
                count += 1;
            }
        }
    }

    count
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const PAGE: usize = 256;
    const BLOCK: usize = 4096;

    struct Builder {
        data: Vec<u8>,
    }

    impl Builder {
        fn new(blocks: usize, magic: bool) -> Self {
            let mut data = vec![0xFF; blocks * BLOCK];
            if magic {
                let config = SpiffsConfig::default();
                for block in 0..blocks {
                    let at = block * BLOCK + config.magic_offset();
                    data[at..at + 2]
                        .copy_from_slice(&config.magic(blocks as u32, block as u32).to_le_bytes());
                }
            }
            Builder { data }
        }

        fn page(&mut self, block: usize, page: usize, obj_id: u16, span: u16, flags: u8, body: &[u8]) {
            let lookup = block * BLOCK + 2 * (page - 1);
            self.data[lookup..lookup + 2].copy_from_slice(&obj_id.to_le_bytes());

            let at = block * BLOCK + page * PAGE;
            self.data[at..at + 2].copy_from_slice(&obj_id.to_le_bytes());
            self.data[at + 2..at + 4].copy_from_slice(&span.to_le_bytes());
            self.data[at + 4] = flags;
            self.data[at + 5..at + 5 + body.len()].copy_from_slice(body);
        }

        fn index(&mut self, block: usize, page: usize, obj_id: u16, name: &str, size: u32) {
            let mut body = vec![0xFF; 3];
            body.extend(size.to_le_bytes());
            body.push(1);
            let mut raw_name = [0u8; 32];
            raw_name[..name.len()].copy_from_slice(name.as_bytes());
            body.extend(raw_name);
            self.page(block, page, obj_id | OBJ_ID_INDEX, 0, 0xF8, &body);
        }

        fn mark_deleted(&mut self, block: usize, page: usize) {
            let lookup = block * BLOCK + 2 * (page - 1);
            self.data[lookup..lookup + 2].copy_from_slice(&0u16.to_le_bytes());
            self.data[block * BLOCK + page * PAGE + 4] &= 0x7F;
        }
    }

    fn sample(magic: bool) -> (Vec<u8>, Vec<u8>) {
        let content: Vec<u8> = (0..300u32).map(|i| (i * 7) as u8).collect();
        let mut fs = Builder::new(4, magic);

        fs.index(0, 1, 1, "/hello.txt", content.len() as u32);
        fs.page(0, 2, 1, 1, 0xFC, &content[251..]);
        fs.page(0, 3, 1, 0, 0xFC, &content[..251]);
        fs.page(1, 1, 1, 0, 0xFC, &[0xAA; 251]);
        fs.mark_deleted(1, 1);
        fs.index(2, 5, 2, "/empty", 0);

        (fs.data, content)
    }

    #[tokio::test]
    async fn files_are_reassembled_by_span() {
        let (data, content) = sample(true);
        let mut flash = vec![0xFF; 0x1000];
        flash.extend(data);
        let image = FlashImage::from_bytes(flash);

        let spiffs = Spiffs::open(&image, 0x1000, 4 * BLOCK as u32).await.unwrap();
        assert!(spiffs.magic_found());
        assert_eq!(spiffs.config(), &SpiffsConfig::default());

        let files = spiffs.files().await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "/hello.txt");
        assert_eq!(files[0].size, Some(300));
        assert_eq!(files[0].data_pages().len(), 2);
        assert_eq!(files[0].header_address, 0x1000 + PAGE as u32);

        assert_eq!(spiffs.read_file("/hello.txt").await.unwrap(), content);
        assert!(spiffs.read_file("/empty").await.unwrap().is_empty());

        let stats = spiffs.stats().await.unwrap();
        assert_eq!(stats.used_pages, 4);
        assert_eq!(stats.deleted_pages, 1);
        assert_eq!(stats.free_pages, 4 * 15 - 5);
    }

    #[tokio::test]
    async fn size_larger_than_partition_is_rejected() {
        let mut fs = Builder::new(4, true);
        fs.index(0, 1, 1, "/huge", 0x1000_0000);
        fs.page(0, 2, 1, 0, 0xFC, &[0x11; 251]);
        let image = FlashImage::from_bytes(fs.data);

        let spiffs = Spiffs::open(&image, 0, 4 * BLOCK as u32).await.unwrap();
        assert!(matches!(
            spiffs.read_file("/huge").await,
            Err(Error::Format(FormatError::Implausible {
                what: "SPIFFS file size",
                offset: 0x100,
                value: 0x1000_0000,
            }))
        ));
    }

    #[tokio::test]
    async fn geometry_is_guessed_without_magic() {
        let (data, content) = sample(false);
        let image = FlashImage::from_bytes(data);

        let spiffs = Spiffs::open(&image, 0, 4 * BLOCK as u32).await.unwrap();
        assert!(!spiffs.magic_found());
        assert_eq!(spiffs.config().page_size, 256);
        assert_eq!(spiffs.read_file("/hello.txt").await.unwrap(), content);
    }

    #[tokio::test]
    async fn missing_pages_read_as_erased() {
        let mut fs = Builder::new(1, true);
        fs.index(0, 1, 3, "/gap.bin", 600);
        fs.page(0, 2, 3, 0, 0xFC, &[0x11; 251]);
        fs.page(0, 3, 3, 2, 0xFC, &[0x33; 251]);
        let image = FlashImage::from_bytes(fs.data);

        let spiffs = Spiffs::open(&image, 0, BLOCK as u32).await.unwrap();
        let data = spiffs.read_file("/gap.bin").await.unwrap();

        assert_eq!(data.len(), 600);
        assert!(data[..251].iter().all(|&b| b == 0x11));
        assert!(data[251..502].iter().all(|&b| b == ERASED));
        assert!(data[502..].iter().all(|&b| b == 0x33));
    }

    #[tokio::test]
    async fn blank_partition_is_not_spiffs() {
        let image = FlashImage::from_bytes(vec![0xFF; 2 * BLOCK]);
        assert!(matches!(
            Spiffs::open(&image, 0, 2 * BLOCK as u32).await,
            Err(Error::Format(FormatError::NotFound(_)))
        ));
    }
}
