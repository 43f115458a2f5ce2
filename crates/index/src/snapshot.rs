//! Index Snapshot Serialization
//!
//! ## Snapshot Format (Version 1)
//!
//! ```text
//! [Magic: "SCIX"]
//! [Version: u32 LE]
//! [Header Length: u32 LE]
//! [Header: MessagePack IndexSnapshotHeader]
//! [Rows: row_count * dimension * f32 LE]
//! [Graph: HnswGraph::write_to]
//! [CRC32 of everything above: u32 LE]
//! ```
//!
//! Written atomically via temp + fsync + rename. A snapshot round-trips
//! exactly: the loaded engine answers every query identically.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use semcache_core::{DistanceMetric, SemcacheError, SemcacheResult};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::{IndexConfig, VectorIndexEngine};
use crate::heap::RowHeap;
use crate::hnsw::{HnswGraph, HnswParams};

/// Magic bytes opening every index snapshot
pub const INDEX_SNAPSHOT_MAGIC: &[u8; 4] = b"SCIX";

/// Snapshot format version
pub const INDEX_SNAPSHOT_VERSION: u32 = 1;

/// Snapshot header (MessagePack serialized)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexSnapshotHeader {
    dimension: usize,
    metric: u8,
    m: usize,
    ef_construction: usize,
    ef_search: usize,
    row_count: u64,
}

/// Write `bytes` to `path` atomically (temp + fsync + rename)
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

impl VectorIndexEngine {
    /// Serialize the full structure into a byte buffer
    pub fn to_snapshot_bytes(&self) -> SemcacheResult<Vec<u8>> {
        let header = IndexSnapshotHeader {
            dimension: self.config.dimension,
            metric: self.config.metric.to_byte(),
            m: self.graph.params().m,
            ef_construction: self.graph.params().ef_construction,
            ef_search: self.graph.params().ef_search,
            row_count: self.heap.len() as u64,
        };
        let header_bytes = rmp_serde::to_vec(&header)
            .map_err(|e| SemcacheError::Serialization(e.to_string()))?;

        let mut buf = Vec::with_capacity(
            16 + header_bytes.len() + self.heap.raw_data().len() * 4 + self.graph.len() * 64,
        );
        buf.extend_from_slice(INDEX_SNAPSHOT_MAGIC);
        buf.write_u32::<LittleEndian>(INDEX_SNAPSHOT_VERSION)?;
        buf.write_u32::<LittleEndian>(header_bytes.len() as u32)?;
        buf.extend_from_slice(&header_bytes);
        for &value in self.heap.raw_data() {
            buf.write_f32::<LittleEndian>(value)?;
        }
        self.graph.write_to(&mut buf)?;

        let crc = crc32fast::hash(&buf);
        buf.write_u32::<LittleEndian>(crc)?;
        Ok(buf)
    }

    /// Rebuild an engine from `to_snapshot_bytes` output
    ///
    /// # Errors
    ///
    /// `FormatMismatch` on bad magic, unsupported version, checksum failure,
    /// truncated data, or a stored dimension different from `dimension`.
    pub fn from_snapshot_bytes(bytes: &[u8], dimension: usize) -> SemcacheResult<Self> {
        if bytes.len() < 16 {
            return Err(SemcacheError::format("snapshot too small"));
        }
        if &bytes[0..4] != INDEX_SNAPSHOT_MAGIC {
            return Err(SemcacheError::format("bad snapshot magic"));
        }

        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let mut trailer = trailer;
        let stored_crc = trailer.read_u32::<LittleEndian>()?;
        if crc32fast::hash(body) != stored_crc {
            return Err(SemcacheError::format("snapshot checksum mismatch"));
        }

        let truncated = |_| SemcacheError::format("unexpected end of snapshot");
        let mut cursor = &body[4..];
        let version = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        if version != INDEX_SNAPSHOT_VERSION {
            return Err(SemcacheError::format(format!(
                "unsupported snapshot version {}",
                version
            )));
        }

        let header_len = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        if cursor.len() < header_len {
            return Err(SemcacheError::format("unexpected end of snapshot"));
        }
        let (header_bytes, rest) = cursor.split_at(header_len);
        cursor = rest;
        let header: IndexSnapshotHeader = rmp_serde::from_slice(header_bytes)
            .map_err(|e| SemcacheError::format(format!("bad snapshot header: {}", e)))?;

        if header.dimension != dimension {
            return Err(SemcacheError::format(format!(
                "stored dimension {}, requested {}",
                header.dimension, dimension
            )));
        }
        if header.dimension == 0 {
            return Err(SemcacheError::format("stored dimension is 0"));
        }
        let metric = DistanceMetric::from_byte(header.metric).ok_or_else(|| {
            SemcacheError::format(format!("unknown metric tag {}", header.metric))
        })?;

        let float_count = (header.row_count as usize)
            .checked_mul(header.dimension)
            .filter(|n| n.saturating_mul(4) <= cursor.len())
            .ok_or_else(|| SemcacheError::format("row data truncated"))?;
        let mut data = Vec::with_capacity(float_count);
        for _ in 0..float_count {
            data.push(cursor.read_f32::<LittleEndian>().map_err(truncated)?);
        }

        let params = HnswParams::new(header.m, header.ef_construction, header.ef_search);
        let graph = HnswGraph::read_from(&mut cursor, metric, params.clone())?;
        if graph.len() as u64 != header.row_count {
            return Err(SemcacheError::format(format!(
                "graph has {} nodes, header says {} rows",
                graph.len(),
                header.row_count
            )));
        }
        if !cursor.is_empty() {
            return Err(SemcacheError::format("trailing bytes after graph"));
        }

        let config = IndexConfig {
            dimension: header.dimension,
            metric,
            params,
            capacity_hint: 0,
        };
        let heap = RowHeap::from_raw(header.dimension, data);
        Ok(VectorIndexEngine::from_parts(config, heap, graph))
    }

    /// Write the full structure to `path`
    ///
    /// I/O errors surface to the caller.
    pub fn persist(&self, path: &Path) -> SemcacheResult<()> {
        let bytes = self.to_snapshot_bytes()?;
        write_atomic(path, &bytes)?;
        info!(
            path = %path.display(),
            rows = self.size(),
            bytes = bytes.len(),
            "index snapshot persisted"
        );
        Ok(())
    }

    /// Load an engine persisted by `persist`
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be read; `FormatMismatch` if it is not a
    /// compatible snapshot or its dimension differs from `dimension`.
    pub fn load(path: &Path, dimension: usize) -> SemcacheResult<Self> {
        let bytes = std::fs::read(path)?;
        let engine = Self::from_snapshot_bytes(&bytes, dimension)?;
        info!(path = %path.display(), rows = engine.size(), "index snapshot loaded");
        Ok(engine)
    }
}
