//! A single mmap-backed map file: either a *page map* (raw page storage) or
//! a *memory map* (hosts the small-object allocator). Both kinds share the
//! same page-0 header layout; [`MapHeader::kind`] distinguishes them.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use memmap2::{MmapMut, MmapOptions};

use crate::error::{QpsError, Result};
use crate::{Generation, MAP_PAGES, MAP_SIZE, MEM_MAP_SIG, PAGE_MAP_SIG, PAGE_SIZE};

/// Pages `[0, HEADER_PAGES)` of every map are reserved for the header and
/// the page-occupancy bitmap needed to rebuild the paged free-list on open
/// without scanning the whole map (§4.C1 "rebuild the paged free-list ...
/// from the page-0 header"). `MAP_PAGES` bits of occupancy need
/// `MAP_PAGES / 8` bytes; two pages comfortably hold the fixed header plus
/// that bitmap (`2 * PAGE_SIZE - HEADER_FIXED_SIZE >= MAP_PAGES / 8`).
pub const HEADER_PAGES: u16 = 2;

const HEADER_FIXED_SIZE: usize = std::mem::size_of::<MapHeader>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MapKind {
    Page = 0,
    Memory = 1,
}

impl MapKind {
    pub fn signature(self) -> &'static [u8; 16] {
        match self {
            MapKind::Page => PAGE_MAP_SIG,
            MapKind::Memory => MEM_MAP_SIG,
        }
    }

    pub fn file_prefix(self) -> &'static str {
        match self {
            MapKind::Page => "pg",
            MapKind::Memory => "mem",
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(MapKind::Page),
            1 => Ok(MapKind::Memory),
            _ => Err(QpsError::Corruption("unknown map kind byte")),
        }
    }
}

/// The stable part of a map's page-0 header. Only the first 512 bytes of
/// page 0 are guaranteed intact after a crash; everything past that
/// (including the occupancy bitmap) is a rebuildable hint.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct MapHeader {
    pub sig: [u8; 16],
    map_index: u16,
    kind: u8,
    _pad0: u8,
    generation: u32,
    /// High-water mark: pages `[0, allocated_pages)` have been handed out at
    /// least once by the paged allocator at some point in this map's
    /// history (they may since have been freed; see `paged` module docs for
    /// the free-list persistence simplification).
    allocated_pages: u32,
    /// Memory maps only: bytes of small-object heap not yet claimed.
    mem_free_bytes: u32,
    /// Memory maps only: bytes of the memory map actually touched on disk.
    mem_disk_usage: u32,
    _reserved: [u8; 8],
}

const _: () = assert!(HEADER_FIXED_SIZE <= 64);

impl MapHeader {
    pub fn map_index(&self) -> u16 {
        u16::from_le(self.map_index)
    }

    pub fn kind(&self) -> Result<MapKind> {
        MapKind::from_u8(self.kind)
    }

    pub fn generation(&self) -> Generation {
        Generation(u32::from_le(self.generation))
    }

    pub fn set_generation(&mut self, gen: Generation) {
        self.generation = gen.0.to_le();
    }

    pub fn allocated_pages(&self) -> u32 {
        u32::from_le(self.allocated_pages)
    }

    pub fn set_allocated_pages(&mut self, pages: u32) {
        self.allocated_pages = pages.to_le();
    }

    pub fn mem_free_bytes(&self) -> u32 {
        u32::from_le(self.mem_free_bytes)
    }

    pub fn set_mem_free_bytes(&mut self, v: u32) {
        self.mem_free_bytes = v.to_le();
    }

    pub fn mem_disk_usage(&self) -> u32 {
        u32::from_le(self.mem_disk_usage)
    }

    pub fn set_mem_disk_usage(&mut self, v: u32) {
        self.mem_disk_usage = v.to_le();
    }
}

/// An open, memory-mapped map file.
pub struct Map {
    pub index: u16,
    pub kind: MapKind,
    pub path: PathBuf,
    mmap: MmapMut,
}

fn occupancy_bitmap_range() -> std::ops::Range<usize> {
    HEADER_FIXED_SIZE..(HEADER_PAGES as usize * PAGE_SIZE)
}

impl Map {
    /// Create a brand new, zero-filled map file on disk and map it.
    pub fn create(path: &Path, index: u16, kind: MapKind, generation: Generation) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(QpsError::Open)?;
        file.set_len(MAP_SIZE as u64).map_err(|e| QpsError::ResizeFailed {
            size: 0,
            requested: MAP_SIZE,
            source: e,
        })?;
        let mut mmap = unsafe {
            MmapOptions::new()
                .len(MAP_SIZE)
                .map_mut(&file)
                .map_err(|e| QpsError::MapFailed {
                    requested: MAP_SIZE,
                    source: e,
                })?
        };
        {
            let header = header_mut(&mut mmap);
            header.sig = *kind.signature();
            header.map_index = index.to_le();
            header.kind = kind as u8;
            header.set_generation(generation);
            header.set_allocated_pages(HEADER_PAGES as u32);
            header.set_mem_free_bytes(0);
            header.set_mem_disk_usage(0);
        }
        mmap.flush().map_err(QpsError::Sync)?;
        Ok(Self {
            index,
            kind,
            path: path.to_path_buf(),
            mmap,
        })
    }

    /// Open and validate an existing map file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(QpsError::Open)?;
        let len = file.metadata().map_err(QpsError::Open)?.len();
        if len != MAP_SIZE as u64 {
            return Err(QpsError::Corruption("map file has unexpected length"));
        }
        let mmap = unsafe {
            MmapOptions::new()
                .len(MAP_SIZE)
                .map_mut(&file)
                .map_err(|e| QpsError::MapFailed {
                    requested: MAP_SIZE,
                    source: e,
                })?
        };
        let kind = {
            let header = header_ref(&mmap);
            if header.sig == *PAGE_MAP_SIG {
                MapKind::Page
            } else if header.sig == *MEM_MAP_SIG {
                MapKind::Memory
            } else {
                return Err(QpsError::BadSignature {
                    expected: "QPS_page/v01.00 or QPS_tlsf/v01.00".into(),
                    found: String::from_utf8_lossy(&header.sig).into_owned(),
                });
            }
        };
        let index = header_ref(&mmap).map_index();
        Ok(Self {
            index,
            kind,
            path: path.to_path_buf(),
            mmap,
        })
    }

    pub fn header(&self) -> &MapHeader {
        header_ref(&self.mmap)
    }

    pub fn header_mut(&mut self) -> &mut MapHeader {
        header_mut(&mut self.mmap)
    }

    /// The full backing byte slice for this map, `MAP_SIZE` bytes long.
    pub fn bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }

    pub fn page(&self, page_index: u16) -> &[u8] {
        let start = page_index as usize * PAGE_SIZE;
        &self.mmap[start..start + PAGE_SIZE]
    }

    pub fn page_mut(&mut self, page_index: u16) -> &mut [u8] {
        let start = page_index as usize * PAGE_SIZE;
        &mut self.mmap[start..start + PAGE_SIZE]
    }

    /// Pages `[HEADER_PAGES, MAP_PAGES)`, the usable range for the paged
    /// allocator.
    pub fn usable_pages() -> std::ops::Range<u32> {
        HEADER_PAGES as u32..MAP_PAGES as u32
    }

    /// The occupancy bitmap, one bit per page, `1` meaning "has been
    /// allocated at least once since the map's `allocated_pages` high-water
    /// mark passed it". See [`crate::paged`] for how this interacts with
    /// the free-list rebuild.
    pub fn occupancy_bitmap(&self) -> &[u8] {
        &self.mmap[occupancy_bitmap_range()]
    }

    pub fn occupancy_bitmap_mut(&mut self) -> &mut [u8] {
        let range = occupancy_bitmap_range();
        &mut self.mmap[range]
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush().map_err(QpsError::Sync)
    }

    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        self.mmap.flush_range(offset, len).map_err(QpsError::Sync)
    }

    pub fn file_name(kind: MapKind, index: u16, generation: Generation) -> String {
        format!("{}.{}.{}", kind.file_prefix(), index, generation.0)
    }
}

fn header_ref(mmap: &MmapMut) -> &MapHeader {
    bytemuck::from_bytes(&mmap[..HEADER_FIXED_SIZE])
}

fn header_mut(mmap: &mut MmapMut) -> &mut MapHeader {
    bytemuck::from_bytes_mut(&mut mmap[..HEADER_FIXED_SIZE])
}
