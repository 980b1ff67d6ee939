//! Non-volatile storage (NVS) key/value partitions
//!
//! A partition is a sequence of 4 KiB pages. Each page has a 32 byte header,
//! a 2 bit per slot state bitmap and 126 entry slots. Fixed-size values live
//! in a single entry, strings and blobs take the entries following their
//! header entry as well.

use log::{debug, warn};

pub use self::{
    item::{Item, ItemType, MAX_KEY_LEN, NvsValue},
    page::{EntryState, NvsPage, PageState},
};
use self::{
    item::{CHUNK_ANY, RawItem, encode_key, payload_data},
    page::{
        ENTRY_COUNT,
        ENTRY_SIZE,
        PAGE_SIZE,
        bitmap_position,
        encode_header,
        with_entry_state,
    },
};
use crate::{
    error::{Error, FormatError},
    image::FlashImage,
};

pub mod item;
pub mod page;

/// Namespace index of namespace definitions
const NAMESPACE_INDEX: u8 = 0;
const MAX_NAMESPACE_INDEX: u8 = 254;
/// Largest payload of a single variable length entry
const MAX_PAYLOAD: usize = (ENTRY_COUNT - 1) * ENTRY_SIZE;

/// Result of scanning a partition
#[derive(Debug, Clone, Default)]
pub struct NvsScan {
    /// Pages in sequence order
    pub pages: Vec<NvsPage>,
    pub items: Vec<Item>,
    /// Entries that could not be decoded
    pub errors: Vec<FormatError>,
}

impl NvsScan {
    /// Defined namespaces as `(name, index)`
    pub fn namespaces(&self) -> Vec<(String, u8)> {
        self.items
            .iter()
            .filter(|item| item.namespace == NAMESPACE_INDEX)
            .filter_map(|item| match item.value {
                NvsValue::U8(index) => Some((item.key.clone(), index)),
                _ => None,
            })
            .collect()
    }

    pub fn namespace_index(&self, name: &str) -> Option<u8> {
        self.namespaces()
            .into_iter()
            .find_map(|(ns, index)| (ns == name).then_some(index))
    }

    /// Name of the namespace with `index`
    pub fn namespace_name(&self, index: u8) -> Option<String> {
        self.namespaces()
            .into_iter()
            .find_map(|(ns, i)| (i == index).then_some(ns))
    }

    fn find(&self, namespace: u8, key: &str) -> impl Iterator<Item = &Item> + '_ {
        let key = key.to_string();
        self.items
            .iter()
            .filter(move |item| item.namespace == namespace && item.key == key)
    }
}

/// An NVS partition
#[derive(Debug)]
pub struct Nvs<'a> {
    image: &'a FlashImage,
    base: u32,
    page_count: u32,
}

impl<'a> Nvs<'a> {
    pub fn new(image: &'a FlashImage, base: u32, len: u32) -> Result<Self, Error> {
        if len == 0 || len as usize % PAGE_SIZE != 0 {
            return Err(FormatError::Implausible {
                what: "NVS partition length",
                offset: base,
                value: len,
            }
            .into());
        }

        Ok(Nvs {
            image,
            base,
            page_count: len / PAGE_SIZE as u32,
        })
    }

    /// Every page, in partition order
    pub async fn pages(&self) -> Result<Vec<NvsPage>, Error> {
        let mut pages = Vec::with_capacity(self.page_count as usize);
        for index in 0..self.page_count {
            let address = self.base + index * PAGE_SIZE as u32;
            let bytes = self.image.read(address, PAGE_SIZE).await?;
            pages.push(NvsPage::decode(index, address, &bytes));
        }
        Ok(pages)
    }

    /// Decode every written item of every page holding entries
    pub async fn scan(&self) -> Result<NvsScan, Error> {
        let mut pages = self.pages().await?;
        pages.sort_by_key(|page| (!page.state.holds_entries(), page.sequence));

        let mut scan = NvsScan::default();
        for page in &pages {
            if !page.state.holds_entries() {
                continue;
            }
            if !page.header_crc_valid() {
                warn!("NVS page {} has a bad header CRC", page.index);
            }

            let bytes = self.image.read(page.address, PAGE_SIZE).await?;
            self.scan_page(page, &bytes, &mut scan);
        }

        scan.pages = pages;
        Ok(scan)
    }

    fn scan_page(&self, page: &NvsPage, bytes: &[u8], scan: &mut NvsScan) {
        let mut slot = 0;

        while slot < ENTRY_COUNT {
            if page.entries[slot] != EntryState::Written {
                slot += 1;
                continue;
            }

            let address = page.entry_address(slot);
            let offset = (address - page.address) as usize;
            let raw = RawItem::decode(&bytes[offset..offset + ENTRY_SIZE]);

            let Some(item_type) = ItemType::from_repr(raw.item_type) else {
                scan.errors.push(FormatError::Implausible {
                    what: "NVS item type",
                    offset: address,
                    value: raw.item_type as u32,
                });
                slot += 1;
                continue;
            };

            let span = raw.span as usize;
            if span == 0 || slot + span > ENTRY_COUNT {
                scan.errors.push(FormatError::Implausible {
                    what: "NVS item span",
                    offset: address,
                    value: raw.span as u32,
                });
                slot += 1;
                continue;
            }

            let payload = &bytes[offset + ENTRY_SIZE..offset + span * ENTRY_SIZE];
            let (value, payload_crc_valid) = Item::decode_value(&raw, item_type, payload);
            let header_crc_valid = raw.compute_crc() == raw.crc;
            if !header_crc_valid {
                warn!("NVS item '{}' at {:#x} has a bad header CRC", raw.key(), address);
            }

            scan.items.push(Item {
                page: page.index,
                slot,
                address,
                namespace: raw.namespace,
                item_type,
                span: raw.span,
                chunk_index: raw.chunk_index,
                key: raw.key(),
                value,
                header_crc_valid,
                payload_crc_valid,
            });
            slot += span;
        }
    }

    /// Defined namespaces as `(name, index)`
    pub async fn namespaces(&self) -> Result<Vec<(String, u8)>, Error> {
        Ok(self.scan().await?.namespaces())
    }

    fn resolve(scan: &NvsScan, namespace: &str) -> Result<u8, Error> {
        scan.namespace_index(namespace)
            .ok_or_else(|| FormatError::NotFound(format!("NVS namespace '{namespace}'")).into())
    }

    /// The item stored under `key` in `namespace`
    ///
    /// For chunked blobs this is the index item, see [Nvs::get_value] for the
    /// assembled contents.
    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<Item>, Error> {
        let scan = self.scan().await?;
        let index = Self::resolve(&scan, namespace)?;

        let item = scan
            .find(index, key)
            .find(|item| item.item_type != ItemType::BlobData)
            .cloned();

        Ok(item)
    }

    /// The value stored under `key`, with chunked blobs reassembled
    pub async fn get_value(&self, namespace: &str, key: &str) -> Result<Option<NvsValue>, Error> {
        let scan = self.scan().await?;
        let index = Self::resolve(&scan, namespace)?;

        let Some(item) = scan
            .find(index, key)
            .find(|item| item.item_type != ItemType::BlobData)
        else {
            return Ok(None);
        };

        let NvsValue::BlobIndex {
            size,
            chunk_count,
            chunk_start,
        } = item.value
        else {
            return Ok(Some(item.value.clone()));
        };

        let mut data = vec![];
        for chunk in chunk_start..chunk_start.saturating_add(chunk_count) {
            let part = scan
                .find(index, key)
                .find(|item| item.item_type == ItemType::BlobData && item.chunk_index == chunk)
                .ok_or_else(|| FormatError::NotFound(format!("chunk {chunk} of blob '{key}'")))?;
            if let NvsValue::Blob(bytes) = &part.value {
                data.extend_from_slice(bytes);
            }
        }

        if data.len() != size as usize {
            return Err(FormatError::Implausible {
                what: "blob size",
                offset: item.address,
                value: data.len() as u32,
            }
            .into());
        }

        Ok(Some(NvsValue::Blob(data)))
    }

    async fn write_entries(&self, page: &NvsPage, slot: usize, entries: &[[u8; ENTRY_SIZE]]) -> Result<(), Error> {
        let flat: Vec<u8> = entries.concat();
        self.image.write(page.entry_address(slot), &flat)?;
        self.set_states(page, slot, entries.len(), EntryState::Written)
            .await
    }

    async fn set_states(&self, page: &NvsPage, slot: usize, count: usize, state: EntryState) -> Result<(), Error> {
        for s in slot..slot + count {
            let (byte, _) = bitmap_position(s);
            let address = page.address + byte as u32;
            let current = self.image.read_u8(address).await?;
            self.image
                .write(address, &[with_entry_state(current, s, state)])?;
        }
        Ok(())
    }

    /// A page with `span` free consecutive slots, initialising a blank page
    /// when no active page has room
    async fn page_with_room(&self, span: usize) -> Result<(NvsPage, usize), Error> {
        let pages = self.pages().await?;

        let mut active: Vec<&NvsPage> = pages
            .iter()
            .filter(|page| page.state == PageState::Active)
            .collect();
        active.sort_by_key(|page| page.sequence);
        if let Some((page, slot)) = active
            .iter()
            .find_map(|page| page.find_free(span).map(|slot| (*page, slot)))
        {
            return Ok((page.clone(), slot));
        }

        let sequence = pages
            .iter()
            .filter(|page| page.state != PageState::Uninit)
            .map(|page| page.sequence)
            .max()
            .map_or(0, |max| max + 1);
        let blank = pages
            .iter()
            .find(|page| page.state == PageState::Uninit)
            .ok_or_else(|| FormatError::NoSpace(format!("{span} free NVS entries")))?;

        debug!("Initialising NVS page {} with sequence {}", blank.index, sequence);
        self.image.write(blank.address, &encode_header(sequence))?;
        let bytes = self.image.read(blank.address, PAGE_SIZE).await?;
        let page = NvsPage::decode(blank.index, blank.address, &bytes);

        Ok((page, 0))
    }

    async fn insert(&self, entries: &[[u8; ENTRY_SIZE]]) -> Result<(NvsPage, usize), Error> {
        let (page, slot) = self.page_with_room(entries.len()).await?;
        self.write_entries(&page, slot, entries).await?;
        Ok((page, slot))
    }

    /// Erase `span` slots starting at `slot` and mark them reusable
    async fn erase_entries(&self, page: &NvsPage, slot: usize, span: usize) -> Result<(), Error> {
        self.image
            .write(page.entry_address(slot), &vec![0xFF; span * ENTRY_SIZE])?;
        self.set_states(page, slot, span, EntryState::Empty).await
    }

    /// Define `name`, returning its index; an existing namespace is reused
    pub async fn add_namespace(&self, name: &str) -> Result<u8, Error> {
        let key = encode_key(name).ok_or_else(|| FormatError::InvalidName(name.to_string()))?;
        let scan = self.scan().await?;
        if let Some(index) = scan.namespace_index(name) {
            return Ok(index);
        }

        let used: Vec<u8> = scan.namespaces().into_iter().map(|(_, i)| i).collect();
        let index = (1..=MAX_NAMESPACE_INDEX)
            .find(|i| !used.contains(i))
            .ok_or_else(|| FormatError::NoSpace("no unused namespace index".into()))?;

        let entry = RawItem {
            namespace: NAMESPACE_INDEX,
            item_type: ItemType::U8 as u8,
            span: 1,
            chunk_index: CHUNK_ANY,
            crc: 0,
            key,
            data: [index, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF],
        };
        self.insert(&[entry.sealed()]).await?;

        debug!("Added NVS namespace '{}' with index {}", name, index);
        Ok(index)
    }

    /// Store `value` under `key`, replacing any existing value
    pub async fn set(&self, namespace: &str, key: &str, value: &NvsValue) -> Result<(), Error> {
        let raw_key = encode_key(key).ok_or_else(|| FormatError::InvalidName(key.to_string()))?;
        let scan = self.scan().await?;
        let index = Self::resolve(&scan, namespace)?;

        let header = |item_type: ItemType, span: usize, chunk_index: u8, data: [u8; 8]| RawItem {
            namespace: index,
            item_type: item_type as u8,
            span: span as u8,
            chunk_index,
            crc: 0,
            key: raw_key,
            data,
        };
        let with_payload = |entry: RawItem, payload: &[u8]| {
            let mut entries = vec![entry.sealed()];
            for chunk in payload.chunks(ENTRY_SIZE) {
                let mut entry = [0xFF; ENTRY_SIZE];
                entry[..chunk.len()].copy_from_slice(chunk);
                entries.push(entry);
            }
            entries
        };

        let groups = match value {
            NvsValue::Str(text) => {
                let mut payload = text.as_bytes().to_vec();
                payload.push(0);
                if payload.len() > MAX_PAYLOAD {
                    return Err(FormatError::NoSpace(format!("string of {} bytes", payload.len())).into());
                }
                let span = 1 + payload.len().div_ceil(ENTRY_SIZE);
                let entry = header(ItemType::Str, span, CHUNK_ANY, payload_data(&payload));
                vec![with_payload(entry, &payload)]
            }
            NvsValue::Blob(data) => {
                let chunks: Vec<&[u8]> = if data.is_empty() {
                    vec![data.as_slice()]
                } else {
                    data.chunks(MAX_PAYLOAD).collect()
                };
                if chunks.len() > u8::MAX as usize {
                    return Err(FormatError::NoSpace(format!("blob of {} bytes", data.len())).into());
                }

                let mut groups: Vec<Vec<[u8; ENTRY_SIZE]>> = chunks
                    .iter()
                    .enumerate()
                    .map(|(i, chunk)| {
                        let span = 1 + chunk.len().div_ceil(ENTRY_SIZE);
                        with_payload(header(ItemType::BlobData, span, i as u8, payload_data(chunk)), chunk)
                    })
                    .collect();

                let index_value = NvsValue::BlobIndex {
                    size: data.len() as u32,
                    chunk_count: chunks.len() as u8,
                    chunk_start: 0,
                };
                if let Some(inline) = index_value.inline_data() {
                    groups.push(vec![header(ItemType::BlobIdx, 1, CHUNK_ANY, inline).sealed()]);
                }
                groups
            }
            fixed => {
                let inline = fixed
                    .inline_data()
                    .ok_or_else(|| FormatError::Unsupported(format!("writing a {} value", fixed.item_type())))?;
                vec![vec![header(fixed.item_type(), 1, CHUNK_ANY, inline).sealed()]]
            }
        };

        // The previous value stays until the new one is fully written
        let mut written = Vec::with_capacity(groups.len());
        for group in &groups {
            match self.insert(group).await {
                Ok(at) => written.push((at, group.len())),
                Err(err) => {
                    for ((page, slot), span) in &written {
                        self.erase_entries(page, *slot, *span).await?;
                    }
                    return Err(err);
                }
            }
        }
        self.delete_items(&scan, index, key).await?;

        debug!("Set NVS {}::{} = {}", namespace, key, value);
        Ok(())
    }

    async fn delete_items(&self, scan: &NvsScan, namespace: u8, key: &str) -> Result<usize, Error> {
        let items: Vec<&Item> = scan.find(namespace, key).collect();

        for item in &items {
            let page = scan
                .pages
                .iter()
                .find(|page| page.index == item.page)
                .ok_or_else(|| FormatError::NotFound(format!("NVS page {}", item.page)))?;

            self.erase_entries(page, item.slot, item.span as usize)
                .await?;
        }

        Ok(items.len())
    }

    /// Remove `key` from `namespace`
    ///
    /// Every entry stored under the key goes, so deleting a blob removes its
    /// index together with all of its data chunks.
    pub async fn delete(&self, namespace: &str, key: &str) -> Result<(), Error> {
        let scan = self.scan().await?;
        let index = Self::resolve(&scan, namespace)?;

        match self.delete_items(&scan, index, key).await? {
            0 => Err(FormatError::NotFound(format!("NVS key '{namespace}::{key}'")).into()),
            n => {
                debug!("Deleted {} NVS item(s) for {}::{}", n, namespace, key);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn blank(pages: usize) -> FlashImage {
        let mut flash = vec![0xFF; 0x9000];
        flash.extend(vec![0xFF; pages * PAGE_SIZE]);
        FlashImage::from_bytes(flash)
    }

    #[tokio::test]
    async fn value_round_trips_through_new_namespace() {
        let image = blank(3);
        let nvs = Nvs::new(&image, 0x9000, 3 * PAGE_SIZE as u32).unwrap();

        let index = nvs.add_namespace("storage").await.unwrap();
        assert_eq!(index, 1);
        nvs.set("storage", "answer", &NvsValue::U32(42)).await.unwrap();

        let item = nvs.get("storage", "answer").await.unwrap().unwrap();
        assert_eq!(item.value, NvsValue::U32(42));
        assert!(item.header_crc_valid);
        assert_eq!(item.payload_crc_valid, None);

        let pages = nvs.pages().await.unwrap();
        assert_eq!(pages[0].state, PageState::Active);
        assert!(pages[0].header_crc_valid());
        assert_eq!(&pages[0].entries[..3], &[
            EntryState::Written,
            EntryState::Written,
            EntryState::Empty
        ]);
    }

    #[tokio::test]
    async fn namespaces_get_lowest_free_index() {
        let image = blank(2);
        let nvs = Nvs::new(&image, 0x9000, 2 * PAGE_SIZE as u32).unwrap();

        assert_eq!(nvs.add_namespace("wifi").await.unwrap(), 1);
        assert_eq!(nvs.add_namespace("phy").await.unwrap(), 2);
        assert_eq!(nvs.add_namespace("wifi").await.unwrap(), 1);
        assert_eq!(nvs.namespaces().await.unwrap(), vec![
            ("wifi".to_string(), 1),
            ("phy".to_string(), 2)
        ]);

        assert!(matches!(
            nvs.set("missing", "key", &NvsValue::U8(1)).await,
            Err(Error::Format(FormatError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn strings_replace_and_delete() {
        let image = blank(2);
        let nvs = Nvs::new(&image, 0x9000, 2 * PAGE_SIZE as u32).unwrap();
        nvs.add_namespace("wifi").await.unwrap();

        nvs.set("wifi", "ssid", &NvsValue::Str("first network name".into()))
            .await
            .unwrap();
        nvs.set("wifi", "ssid", &NvsValue::Str("home".into()))
            .await
            .unwrap();

        let item = nvs.get("wifi", "ssid").await.unwrap().unwrap();
        assert_eq!(item.value, NvsValue::Str("home".into()));
        assert_eq!(item.payload_crc_valid, Some(true));
        assert_eq!(item.span, 2);
        let scan = nvs.scan().await.unwrap();
        assert_eq!(scan.items.len(), 2);

        nvs.delete("wifi", "ssid").await.unwrap();
        assert_eq!(nvs.get("wifi", "ssid").await.unwrap(), None);
        assert!(matches!(
            nvs.delete("wifi", "ssid").await,
            Err(Error::Format(FormatError::NotFound(_)))
        ));

        // Deleted slots are reusable
        let page = &nvs.pages().await.unwrap()[0];
        assert_eq!(page.entries[1], EntryState::Empty);
        assert_eq!(image.read(page.entry_address(1), 4).await.unwrap(), vec![0xFF; 4]);
    }

    #[tokio::test]
    async fn blobs_are_chunked_and_deleted_together() {
        let image = blank(3);
        let nvs = Nvs::new(&image, 0x9000, 3 * PAGE_SIZE as u32).unwrap();
        nvs.add_namespace("cal").await.unwrap();

        let blob: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        nvs.set("cal", "table", &NvsValue::Blob(blob.clone()))
            .await
            .unwrap();

        let index = nvs.get("cal", "table").await.unwrap().unwrap();
        assert_eq!(index.item_type, ItemType::BlobIdx);
        assert_eq!(index.value, NvsValue::BlobIndex {
            size: 5000,
            chunk_count: 2,
            chunk_start: 0
        });
        assert_eq!(
            nvs.get_value("cal", "table").await.unwrap(),
            Some(NvsValue::Blob(blob))
        );

        nvs.delete("cal", "table").await.unwrap();
        let scan = nvs.scan().await.unwrap();
        assert!(scan.items.iter().all(|item| item.key != "table"));
    }

    #[tokio::test]
    async fn full_partition_reports_no_space() {
        let image = blank(1);
        let nvs = Nvs::new(&image, 0x9000, PAGE_SIZE as u32).unwrap();
        nvs.add_namespace("big").await.unwrap();

        let result = nvs
            .set("big", "blob", &NvsValue::Blob(vec![0; MAX_PAYLOAD]))
            .await;
        assert!(matches!(result, Err(Error::Format(FormatError::NoSpace(_)))));
    }

    #[tokio::test]
    async fn failed_blob_replace_is_rolled_back() {
        let image = blank(2);
        let nvs = Nvs::new(&image, 0x9000, 2 * PAGE_SIZE as u32).unwrap();
        nvs.add_namespace("ns").await.unwrap();
        nvs.set("ns", "n", &NvsValue::U8(1)).await.unwrap();

        // The first chunk fills the second page, the second chunk needs 126
        // entries while only 124 are left on the first page
        let result = nvs
            .set("ns", "n", &NvsValue::Blob(vec![0x55; MAX_PAYLOAD + 3990]))
            .await;
        assert!(matches!(result, Err(Error::Format(FormatError::NoSpace(_)))));
        assert_eq!(
            nvs.get_value("ns", "n").await.unwrap(),
            Some(NvsValue::U8(1))
        );

        let pages = nvs.pages().await.unwrap();
        assert_eq!(pages[1].state, PageState::Active);
        assert!(pages[1].entries.iter().all(|state| *state == EntryState::Empty));
        let scan = nvs.scan().await.unwrap();
        assert_eq!(scan.items.len(), 2);
    }

    #[tokio::test]
    async fn replace_that_does_not_fit_keeps_old_value() {
        let image = blank(1);
        let nvs = Nvs::new(&image, 0x9000, PAGE_SIZE as u32).unwrap();
        nvs.add_namespace("ns").await.unwrap();
        nvs.set("ns", "k", &NvsValue::U32(7)).await.unwrap();

        let result = nvs
            .set("ns", "k", &NvsValue::Blob(vec![0xAA; MAX_PAYLOAD]))
            .await;
        assert!(matches!(result, Err(Error::Format(FormatError::NoSpace(_)))));
        assert_eq!(
            nvs.get_value("ns", "k").await.unwrap(),
            Some(NvsValue::U32(7))
        );
    }
}
