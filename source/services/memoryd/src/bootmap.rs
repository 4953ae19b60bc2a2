// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot memory-map configuration.
//!
//! The initialization glue hands the manager a TOML document describing the
//! physical memory regions and their type tags. It is consumed exactly once,
//! to seed the frame table and prime the buddy allocator.
//!
//! ```toml
//! [[region]]
//! base = 0x8000_0000
//! pages = 256
//! kind = "conventional"
//!
//! [[region]]
//! base = 0x8010_0000
//! pages = 16
//! kind = "reserved"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::phys::{FrameTable, RegionKind};
use crate::types::{PhysAddr, PAGE_SIZE};

/// Upper bound on the pages one pool may cover.
pub const MAX_POOL_PAGES: usize = 32768;

/// Errors produced while loading a memory map.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the config file failed.
    #[error("failed to read memory map {path}: {source}")]
    Read {
        /// Offending path.
        path: PathBuf,
        /// Underlying io error.
        #[source]
        source: std::io::Error,
    },
    /// Parsing the TOML document failed.
    #[error("failed to parse memory map {path}: {source}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },
    /// The document parsed but describes an unusable map.
    #[error("invalid memory map: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum RawKind {
    Conventional,
    Reserved,
    Boot,
}

#[derive(Debug, Deserialize)]
struct RawRegion {
    base: u64,
    pages: u32,
    kind: RawKind,
}

#[derive(Debug, Deserialize)]
struct RawMap {
    #[serde(default)]
    region: Vec<RawRegion>,
}

/// One validated physical region.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    /// Page-aligned base address.
    pub base: PhysAddr,
    /// Region length in pages.
    pub pages: usize,
    /// Type tag controlling whether the pages are buddied.
    pub kind: RegionKind,
}

/// The validated boot memory map.
#[derive(Debug)]
pub struct MemoryMap {
    regions: Vec<Region>,
}

impl MemoryMap {
    /// Parses and validates a TOML document.
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let raw: RawMap = toml::from_str(text)
            .map_err(|source| ConfigError::Parse { path: origin.to_path_buf(), source })?;
        Self::from_regions(raw.region)
    }

    /// Loads and validates a memory map file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml(&text, path)
    }

    fn from_regions(raw: Vec<RawRegion>) -> Result<Self, ConfigError> {
        if raw.is_empty() {
            return Err(ConfigError::Invalid("no regions"));
        }
        let mut regions: Vec<Region> = Vec::with_capacity(raw.len());
        for region in raw {
            if region.pages == 0 {
                return Err(ConfigError::Invalid("zero-length region"));
            }
            let base = PhysAddr::new(region.base);
            if !base.is_page_aligned() {
                return Err(ConfigError::Invalid("unaligned region base"));
            }
            if base.checked_add_pages(region.pages as usize).is_none() {
                return Err(ConfigError::Invalid("region wraps the address space"));
            }
            let kind = match region.kind {
                RawKind::Conventional => RegionKind::Conventional,
                RawKind::Reserved => RegionKind::Reserved,
                RawKind::Boot => RegionKind::Boot,
            };
            regions.push(Region { base, pages: region.pages as usize, kind });
        }
        regions.sort_by_key(|region| region.base);
        for pair in regions.windows(2) {
            let end = pair[0]
                .base
                .checked_add_pages(pair[0].pages)
                .ok_or(ConfigError::Invalid("region wraps the address space"))?;
            if end > pair[1].base {
                return Err(ConfigError::Invalid("overlapping regions"));
            }
        }
        if !regions.iter().any(|region| region.kind == RegionKind::Conventional) {
            return Err(ConfigError::Invalid("no conventional region"));
        }
        let map = Self { regions };
        if map.span_pages() > MAX_POOL_PAGES {
            return Err(ConfigError::Invalid("region span too large"));
        }
        Ok(map)
    }

    /// The validated regions, base-ordered.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Pages between the lowest base and the highest end.
    pub fn span_pages(&self) -> usize {
        let first = self.regions[0].base;
        let last = &self.regions[self.regions.len() - 1];
        let end = last.base.raw() + (last.pages * PAGE_SIZE) as u64;
        ((end - first.raw()) / PAGE_SIZE as u64) as usize
    }

    /// Seeds a frame table covering the whole span. Gaps between configured
    /// regions come up Reserved and never enter the buddy bins.
    pub fn seed_table(&self) -> FrameTable {
        let base = self.regions[0].base;
        let mut table = FrameTable::new(base, self.span_pages());
        table.set_region(0, table.len(), RegionKind::Reserved);
        for region in &self.regions {
            let index = ((region.base.raw() - base.raw()) / PAGE_SIZE as u64) as usize;
            table.set_region(index, region.pages, region.kind);
        }
        log::info!(
            target: "bootmap",
            "seeded {} pages from {} regions at {:?}",
            table.len(),
            self.regions.len(),
            base
        );
        table
    }
}
