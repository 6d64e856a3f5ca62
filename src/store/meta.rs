//! The store's `meta` file: name, current generation, map catalogue, and
//! the caller's opaque preamble (typically a binlog coordinate). Written
//! through a temp-file-then-rename, matching the spec's "this rename is
//! the linearisation point of the snapshot" for §4.C5.

use bytemuck::{Pod, Zeroable};

use crate::error::{QpsError, Result};
use crate::store::map::MapKind;
use crate::{Generation, META_SIG};

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct MetaHeader {
    sig: [u8; 16],
    generation: u32,
    name_len: u16,
    preamble_len: u16,
    map_count: u32,
    _reserved: [u8; 8],
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct CatalogEntry {
    map_index: u16,
    kind: u8,
    _pad: u8,
    generation: u32,
}

/// One entry in the store's record of which maps exist.
#[derive(Debug, Clone, Copy)]
pub struct MapCatalogEntry {
    pub map_index: u16,
    pub kind: MapKind,
    pub generation: Generation,
}

#[derive(Debug, Clone)]
pub struct Meta {
    pub name: String,
    pub generation: Generation,
    pub preamble: Vec<u8>,
    pub catalog: Vec<MapCatalogEntry>,
}

impl Meta {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            generation: Generation::ZERO,
            preamble: Vec::new(),
            catalog: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let name_len = u16::try_from(self.name.len())
            .map_err(|_| QpsError::Other("store name too long"))?;
        let preamble_len = u16::try_from(self.preamble.len())
            .map_err(|_| QpsError::Other("preamble too long"))?;
        let map_count = u32::try_from(self.catalog.len())
            .map_err(|_| QpsError::Other("too many maps for catalog"))?;

        let header = MetaHeader {
            sig: *META_SIG,
            generation: self.generation.0.to_le(),
            name_len: name_len.to_le(),
            preamble_len: preamble_len.to_le(),
            map_count: map_count.to_le(),
            _reserved: [0; 8],
        };

        let mut buf = Vec::with_capacity(
            std::mem::size_of::<MetaHeader>()
                + self.name.len()
                + self.preamble.len()
                + self.catalog.len() * std::mem::size_of::<CatalogEntry>()
                + 8,
        );
        buf.extend_from_slice(bytemuck::bytes_of(&header));
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(&self.preamble);
        for entry in &self.catalog {
            let raw = CatalogEntry {
                map_index: entry.map_index.to_le(),
                kind: entry.kind as u8,
                _pad: 0,
                generation: entry.generation.0.to_le(),
            };
            buf.extend_from_slice(bytemuck::bytes_of(&raw));
        }
        let hash = xxhash_rust::xxh3::xxh3_64(&buf);
        buf.extend_from_slice(&hash.to_le_bytes());
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header_size = std::mem::size_of::<MetaHeader>();
        if bytes.len() < header_size + 8 {
            return Err(QpsError::Corruption("meta file too short"));
        }
        let (header_bytes, rest) = bytes.split_at(header_size);
        let header: &MetaHeader = bytemuck::from_bytes(header_bytes);
        if header.sig != *META_SIG {
            return Err(QpsError::BadSignature {
                expected: String::from_utf8_lossy(META_SIG).into_owned(),
                found: String::from_utf8_lossy(&header.sig).into_owned(),
            });
        }

        let (data, hash_bytes) = bytes.split_at(bytes.len() - 8);
        let expected_hash = u64::from_le_bytes(hash_bytes.try_into().unwrap());
        if xxhash_rust::xxh3::xxh3_64(data) != expected_hash {
            return Err(QpsError::Corruption("meta file checksum mismatch"));
        }

        let name_len = u16::from_le(header.name_len) as usize;
        let preamble_len = u16::from_le(header.preamble_len) as usize;
        let map_count = u32::from_le(header.map_count) as usize;

        let mut pos = 0usize;
        let name_bytes = rest
            .get(pos..pos + name_len)
            .ok_or(QpsError::Corruption("meta name truncated"))?;
        let name = String::from_utf8(name_bytes.to_vec())
            .map_err(|_| QpsError::Corruption("meta name is not valid UTF-8"))?;
        pos += name_len;

        let preamble = rest
            .get(pos..pos + preamble_len)
            .ok_or(QpsError::Corruption("meta preamble truncated"))?
            .to_vec();
        pos += preamble_len;

        let entry_size = std::mem::size_of::<CatalogEntry>();
        let mut catalog = Vec::with_capacity(map_count);
        for _ in 0..map_count {
            let entry_bytes = rest
                .get(pos..pos + entry_size)
                .ok_or(QpsError::Corruption("meta catalog truncated"))?;
            let raw: &CatalogEntry = bytemuck::from_bytes(entry_bytes);
            catalog.push(MapCatalogEntry {
                map_index: u16::from_le(raw.map_index),
                kind: match raw.kind {
                    0 => MapKind::Page,
                    1 => MapKind::Memory,
                    _ => return Err(QpsError::Corruption("meta catalog has unknown map kind")),
                },
                generation: Generation(u32::from_le(raw.generation)),
            });
            pos += entry_size;
        }

        Ok(Self {
            name,
            generation: Generation(u32::from_le(header.generation)),
            preamble,
            catalog,
        })
    }
}
