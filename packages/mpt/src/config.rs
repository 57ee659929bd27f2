//! Defines the on-disk database configurations.

use std::path::PathBuf;

use triedb_async::CHUNK_CAPACITY;

/// Configuration of a read-write on-disk database.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct OnDiskDbConfig {
    /// Device directories the pool spreads its chunks over.
    pub dbname_paths: Vec<PathBuf>,
    /// Discard existing contents instead of opening them.
    #[serde(default)]
    pub truncate: bool,
    /// Round-robin chunks across devices.
    #[serde(default)]
    pub interleave_chunks_evenly: bool,
    /// Per-chunk capacity in bytes.
    #[serde(default = "default_chunk_capacity")]
    pub chunk_capacity: u64,
    /// Number of sequential chunks in the pool.
    #[serde(default = "default_chunk_count")]
    pub chunk_count: u32,
    /// Target slow-to-fast storage size ratio for compaction.
    #[serde(default = "default_slow_fast_ratio")]
    pub slow_fast_ratio: f32,
    /// Run per-upsert compaction.
    #[serde(default = "default_true")]
    pub compaction: bool,
    /// Pooled read buffers.
    #[serde(default = "default_rd_buf_count")]
    pub rd_buf_count: usize,
    /// Pooled write buffers.
    #[serde(default = "default_wr_buf_count")]
    pub wr_buf_count: usize,
    /// CPU to pin kernel-side submission polling to, when supported.
    #[serde(default)]
    pub sq_thread_cpu: Option<u32>,
}

impl OnDiskDbConfig {
    /// A default configuration over the given device directories.
    #[must_use]
    pub fn new(dbname_paths: Vec<PathBuf>) -> Self {
        Self {
            dbname_paths,
            truncate: false,
            interleave_chunks_evenly: false,
            chunk_capacity: default_chunk_capacity(),
            chunk_count: default_chunk_count(),
            slow_fast_ratio: default_slow_fast_ratio(),
            compaction: default_true(),
            rd_buf_count: default_rd_buf_count(),
            wr_buf_count: default_wr_buf_count(),
            sq_thread_cpu: None,
        }
    }
}

/// Configuration of a read-only on-disk database instance.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct ReadOnlyOnDiskDbConfig {
    /// Device directories of the pool to observe.
    pub dbname_paths: Vec<PathBuf>,
    /// Per-chunk capacity in bytes; must match the writer's.
    #[serde(default = "default_chunk_capacity")]
    pub chunk_capacity: u64,
    /// Number of sequential chunks; must match the writer's.
    #[serde(default = "default_chunk_count")]
    pub chunk_count: u32,
    /// Pooled read buffers.
    #[serde(default = "default_rd_buf_count")]
    pub rd_buf_count: usize,
}

impl ReadOnlyOnDiskDbConfig {
    /// A default read-only configuration over the given directories.
    #[must_use]
    pub fn new(dbname_paths: Vec<PathBuf>) -> Self {
        Self {
            dbname_paths,
            chunk_capacity: default_chunk_capacity(),
            chunk_count: default_chunk_count(),
            rd_buf_count: default_rd_buf_count(),
        }
    }
}

const fn default_chunk_capacity() -> u64 {
    CHUNK_CAPACITY
}

const fn default_chunk_count() -> u32 {
    32
}

const fn default_slow_fast_ratio() -> f32 {
    3.0
}

/// Returns true, used as a default value for boolean fields.
const fn default_true() -> bool {
    true
}

const fn default_rd_buf_count() -> usize {
    64
}

const fn default_wr_buf_count() -> usize {
    8
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn on_disk_config_defaults_from_json() {
        let config: OnDiskDbConfig =
            serde_json::from_str(r#"{ "dbname_paths": ["/tmp/triedb"] }"#).unwrap();
        assert_eq!(config.dbname_paths, vec![PathBuf::from("/tmp/triedb")]);
        assert!(!config.truncate);
        assert!(config.compaction);
        assert_eq!(config.chunk_capacity, CHUNK_CAPACITY);
        assert_eq!(config.chunk_count, 32);
        assert!((config.slow_fast_ratio - 3.0).abs() < f32::EPSILON);
        assert_eq!(config.sq_thread_cpu, None);
    }

    #[test]
    fn read_only_config_roundtrips() {
        let config = ReadOnlyOnDiskDbConfig::new(vec![PathBuf::from("/dev/pool0")]);
        let json = serde_json::to_string(&config).unwrap();
        let back: ReadOnlyOnDiskDbConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dbname_paths, config.dbname_paths);
        assert_eq!(back.rd_buf_count, config.rd_buf_count);
    }
}
