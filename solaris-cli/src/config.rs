//! Process configuration ("Configuration options recognized by
//! the engine"), as a `clap::Parser` struct so every field is individually
//! overridable on the command line, and `serde`-derived so the same shape
//! loads from a TOML file.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use solaris_engine::EngineConfig;
use solaris_storage::ChunkSizing;

const PAGE: u64 = 4096;

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "solaris")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Config {
    /// Directory chunk files and the in-memory metadata store's snapshot
    /// (if any) live under.
    #[arg(long, default_value = "./solaris-data")]
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Load the rest of the fields below from a TOML file, command-line
    /// flags taking precedence over anything the file sets.
    #[arg(long)]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// Max records returned in a single query (`MaxRecordsLimit`).
    #[arg(long, default_value_t = 1000)]
    #[serde(default = "default_max_records_limit")]
    pub max_records_limit: usize,

    /// Max payload bytes appended to one chunk before rolling over
    /// (`MaxBunchSize`).
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    #[serde(default = "default_max_bunch_size")]
    pub max_bunch_size: usize,

    /// Capacity of the per-log lock cache (`MaxLocks`).
    #[arg(long, default_value_t = 1024)]
    #[serde(default = "default_max_locks")]
    pub max_locks: usize,

    /// Initial chunk file size in bytes (`Chunk.NewSize`,
    /// default `16·4 KiB`).
    #[arg(long, default_value_t = 16 * PAGE)]
    #[serde(default = "default_new_size")]
    pub chunk_new_size: u64,

    /// Hard per-chunk size ceiling (`Chunk.MaxChunkSize`,
    /// default `512·1024·4 KiB`).
    #[arg(long, default_value_t = 512 * 1024 * PAGE)]
    #[serde(default = "default_max_chunk_size")]
    pub chunk_max_chunk_size: u64,

    /// Largest single geometric grow step (`Chunk.MaxGrowIncreaseSize`, default `256·4 KiB`).
    #[arg(long, default_value_t = 256 * PAGE)]
    #[serde(default = "default_max_grow_increase_size")]
    pub chunk_max_grow_increase_size: u64,

    /// FD budget: max chunk files held open at once (`Provider.max_open_chunks`).
    #[arg(long, default_value_t = 256)]
    #[serde(default = "default_max_open_chunks")]
    pub provider_max_open_chunks: usize,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./solaris-data")
}
fn default_max_records_limit() -> usize {
    1000
}
fn default_max_bunch_size() -> usize {
    4 * 1024 * 1024
}
fn default_max_locks() -> usize {
    1024
}
fn default_new_size() -> u64 {
    16 * PAGE
}
fn default_max_chunk_size() -> u64 {
    512 * 1024 * PAGE
}
fn default_max_grow_increase_size() -> u64 {
    256 * PAGE
}
fn default_max_open_chunks() -> usize {
    256
}

impl Config {
    /// Parses CLI arguments, then if `--config-file` names a TOML file,
    /// layers its values underneath: any flag the user actually passed on
    /// the command line wins, everything else takes the file's value.
    pub fn load() -> eyre::Result<Self> {
        let cli = Config::parse();
        match &cli.config_file {
            Some(path) => cli.merge_with_file(path),
            None => Ok(cli),
        }
    }

    fn merge_with_file(self, path: &Path) -> eyre::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let from_file: Config = toml::from_str(&text)?;
        let defaults = Config::parse_from(["solaris"]);

        Ok(Config {
            data_dir: if self.data_dir != defaults.data_dir { self.data_dir } else { from_file.data_dir },
            config_file: self.config_file,
            max_records_limit: if self.max_records_limit != defaults.max_records_limit {
                self.max_records_limit
            } else {
                from_file.max_records_limit
            },
            max_bunch_size: if self.max_bunch_size != defaults.max_bunch_size {
                self.max_bunch_size
            } else {
                from_file.max_bunch_size
            },
            max_locks: if self.max_locks != defaults.max_locks { self.max_locks } else { from_file.max_locks },
            chunk_new_size: if self.chunk_new_size != defaults.chunk_new_size {
                self.chunk_new_size
            } else {
                from_file.chunk_new_size
            },
            chunk_max_chunk_size: if self.chunk_max_chunk_size != defaults.chunk_max_chunk_size {
                self.chunk_max_chunk_size
            } else {
                from_file.chunk_max_chunk_size
            },
            chunk_max_grow_increase_size: if self.chunk_max_grow_increase_size != defaults.chunk_max_grow_increase_size {
                self.chunk_max_grow_increase_size
            } else {
                from_file.chunk_max_grow_increase_size
            },
            provider_max_open_chunks: if self.provider_max_open_chunks != defaults.provider_max_open_chunks {
                self.provider_max_open_chunks
            } else {
                from_file.provider_max_open_chunks
            },
        })
    }

    pub fn chunk_sizing(&self) -> ChunkSizing {
        ChunkSizing {
            new_size: self.chunk_new_size as usize,
            max_chunk_size: self.chunk_max_chunk_size as usize,
            max_grow_increase_size: self.chunk_max_grow_increase_size as usize,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_records_limit: self.max_records_limit,
            max_bunch_size: self.max_bunch_size,
            max_locks: self.max_locks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let config = Config::parse_from(["solaris"]);
        assert_eq!(config.chunk_new_size, 16 * 4096);
        assert_eq!(config.chunk_max_grow_increase_size, 256 * 4096);
        assert_eq!(config.chunk_max_chunk_size, 512 * 1024 * 4096);
        assert_eq!(config.max_records_limit, 1000);
    }

    #[test]
    fn explicit_flag_overrides_file_value() {
        let dir = temp_testdir::TempDir::default();
        let file_path = dir.to_path_buf().join("solaris.toml");
        std::fs::write(&file_path, "max_locks = 7\n").unwrap();

        let cli = Config::parse_from(["solaris", "--max-locks", "42", "--config-file", file_path.to_str().unwrap()]);
        let merged = cli.merge_with_file(&file_path).unwrap();
        assert_eq!(merged.max_locks, 42);
    }

    #[test]
    fn file_value_fills_in_when_flag_not_passed() {
        let dir = temp_testdir::TempDir::default();
        let file_path = dir.to_path_buf().join("solaris.toml");
        std::fs::write(&file_path, "max_locks = 7\n").unwrap();

        let cli = Config::parse_from(["solaris", "--config-file", file_path.to_str().unwrap()]);
        let merged = cli.merge_with_file(&file_path).unwrap();
        assert_eq!(merged.max_locks, 7);
    }
}
