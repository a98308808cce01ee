#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The Storage Sink (§4.7): an append-only store addressed by [`StorageKey`],
//! with file rolling, a configurable logical path grammar, and a pre-write
//! free-space check. The byte-level HDF5 container library is out of scope,
//! so [`FileStorageSink`] stands in for it: it keeps the exact logical
//! path/filename grammar and rolling/safety-check semantics, persisting each
//! write as a length-framed, serde-encoded record tagged with its logical
//! path instead of calling into a real HDF5 SDK.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use daq_model::{GroupType, RunNumber, StorageKey};
use serde::{Deserialize, Serialize};

/// Errors raised by a [`StorageSink`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Free space at the configured directory would drop below
    /// `free_space_safety_factor * record_size` after this write.
    #[error("insufficient free space: need {needed} bytes ({factor} * {record_size}), have {available}")]
    InsufficientDiskSpace {
        /// Bytes required before the write would be allowed.
        needed: u64,
        /// Bytes actually available.
        available: u64,
        /// The configured safety factor.
        factor: f64,
        /// The size of the record about to be written.
        record_size: u64,
    },
    /// A write or layout lookup named a [`GroupType`] with no configured
    /// `path_param` entry.
    #[error("no path parameters configured for group type {group_type:?}")]
    RequestedHDF5GroupTypeNotFound {
        /// The group type that was requested.
        group_type: GroupType,
    },
    /// The configured directory does not exist or is not a directory.
    #[error("storage directory {0:?} is not usable")]
    InvalidDirectory(PathBuf),
    /// An underlying filesystem operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error is one the caller should back off and retry
    /// rather than treat as permanent, per §4.6's writer retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::InsufficientDiskSpace { .. })
    }
}

/// The file-rolling strategy, per §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollingMode {
    /// Roll to a new file whenever the trigger/slice number changes, in
    /// addition to rolling on size.
    OneEventPerFile,
    /// Roll only when `max_file_size` would be exceeded.
    AllPerFile,
}

/// Per-group-type path parameters resolved from configuration.
#[derive(Debug, Clone)]
pub struct PathParams {
    /// The group's directory name, e.g. `"TPC"`.
    pub detector_group_name: String,
    /// Prefix prepended to the zero-padded region number.
    pub region_name_prefix: String,
    /// Zero-pad width of the region number.
    pub digits_for_region_number: usize,
    /// Prefix prepended to the zero-padded element number.
    pub element_name_prefix: String,
    /// Zero-pad width of the element number.
    pub digits_for_element_number: usize,
}

/// Parameters governing the logical group/dataset layout of §4.7.
#[derive(Debug, Clone)]
pub struct FileLayoutParams {
    /// Prefix prepended to the zero-padded trigger/slice number.
    pub trigger_record_name_prefix: String,
    /// Zero-pad width of the trigger/slice number.
    pub digits_for_trigger_number: usize,
    /// Path parameters keyed by group type, excluding `TriggerRecordHeader`
    /// which needs none.
    pub path_params: HashMap<GroupType, PathParams>,
}

/// Parameters governing the filename grammar of §4.7.
#[derive(Debug, Clone)]
pub struct FilenameParams {
    /// The operational environment tag (e.g. `"prod"`, `"test"`).
    pub operational_environment: String,
    /// The file-type prefix (e.g. `"tpc"`, `"trigger_record"`).
    pub file_type_prefix: String,
    /// Prefix prepended to the zero-padded run number.
    pub run_number_prefix: String,
    /// Zero-pad width of the run number.
    pub digits_for_run_number: usize,
    /// Prefix prepended to the zero-padded file index.
    pub file_index_prefix: String,
    /// Zero-pad width of the file index.
    pub digits_for_file_index: usize,
    /// Identifies the writer instance that produced the file.
    pub writer_identifier: String,
    /// If set, the unique timestamp suffix is omitted.
    pub disable_unique_filename_suffix: bool,
}

/// Full configuration for a [`FileStorageSink`].
#[derive(Debug, Clone)]
pub struct StorageSinkConfig {
    /// The rolling strategy.
    pub mode: RollingMode,
    /// Directory new files are created under.
    pub directory_path: PathBuf,
    /// Maximum size in bytes of one rolled file.
    pub max_file_size: u64,
    /// Safety margin applied to the pre-write free-space check; clamped to
    /// at least `1.1`.
    pub free_space_safety_factor: f64,
    /// The filename grammar parameters.
    pub filename: FilenameParams,
    /// The logical group/dataset layout parameters.
    pub file_layout: FileLayoutParams,
}

impl StorageSinkConfig {
    /// Returns the safety factor clamped to the minimum allowed by §4.7.
    pub fn safety_factor(&self) -> f64 {
        self.free_space_safety_factor.max(1.1)
    }
}

/// Queries the free space available at a given path. Abstracted so tests can
/// substitute a fixed value without touching the real filesystem.
pub trait FreeSpaceProbe: Send + Sync {
    /// Returns the number of bytes free at or above `path`.
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Default probe backed by `sysinfo`'s disk listing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoFreeSpaceProbe;

impl FreeSpaceProbe for SysinfoFreeSpaceProbe {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no mounted disk found for path"))
    }
}

/// An append-only sink addressed by [`StorageKey`].
pub trait StorageSink {
    /// Validates the output location can take a run and resets rolling state.
    fn prepare_for_run(&mut self, run_number: RunNumber, is_test: bool) -> Result<(), Error>;
    /// Writes `payload` under `key`, rolling to a new file first if needed.
    fn write(&mut self, key: StorageKey, payload: &[u8], now: u64) -> Result<(), Error>;
    /// Flushes and closes any open file.
    fn finish_with_run(&mut self, run_number: RunNumber) -> Result<(), Error>;
}

#[derive(Serialize, Deserialize)]
struct FramedRecord {
    logical_path: String,
    key: StorageKey,
    payload: Vec<u8>,
}

/// Stands in for the HDF5-backed sink: keeps the exact logical path,
/// filename, rolling, and pre-write safety-check semantics of §4.7, but
/// persists leaves as length-framed YAML records rather than HDF5 datasets.
pub struct FileStorageSink {
    config: StorageSinkConfig,
    probe: Box<dyn FreeSpaceProbe>,
    run_number: Option<RunNumber>,
    file_index: u64,
    current_file: Option<File>,
    current_size: u64,
    current_rolling_key: Option<(u64, u32)>,
}

impl FileStorageSink {
    /// Creates a sink using the default `sysinfo`-backed free-space probe.
    pub fn new(config: StorageSinkConfig) -> Self {
        Self::with_probe(config, Box::new(SysinfoFreeSpaceProbe))
    }

    /// Creates a sink using a caller-supplied free-space probe, useful for
    /// tests that should not depend on the real filesystem's free space.
    pub fn with_probe(config: StorageSinkConfig, probe: Box<dyn FreeSpaceProbe>) -> Self {
        Self {
            config,
            probe,
            run_number: None,
            file_index: 0,
            current_file: None,
            current_size: 0,
            current_rolling_key: None,
        }
    }

    /// Translates `key` into the HDF5 group/dataset path elements of §4.7.
    pub fn path_elements(&self, key: &StorageKey) -> Result<Vec<String>, Error> {
        let layout = &self.config.file_layout;
        let mut trigger_part = format!(
            "{}{:0width$}",
            layout.trigger_record_name_prefix,
            key.trigger_number,
            width = layout.digits_for_trigger_number
        );
        if key.has_sequences {
            trigger_part = format!("{trigger_part}.{}", key.sequence_number);
        }

        let mut elements = vec![trigger_part];
        if key.group_type == GroupType::TriggerRecordHeader {
            elements.push("TriggerRecordHeader".to_string());
            return Ok(elements);
        }

        let params = layout
            .path_params
            .get(&key.group_type)
            .ok_or(Error::RequestedHDF5GroupTypeNotFound { group_type: key.group_type })?;
        elements.push(params.detector_group_name.clone());
        elements.push(format!(
            "{}{:0width$}",
            params.region_name_prefix,
            key.region_number,
            width = params.digits_for_region_number
        ));
        elements.push(format!(
            "{}{:0width$}",
            params.element_name_prefix,
            key.element_number,
            width = params.digits_for_element_number
        ));
        Ok(elements)
    }

    /// Joins [`path_elements`](Self::path_elements) with `/`.
    pub fn path_string(&self, key: &StorageKey) -> Result<String, Error> {
        Ok(self.path_elements(key)?.join("/"))
    }

    /// Builds the filename for `run_number`/`file_index`, per §4.7's grammar:
    /// `<env>_<file_type>_<run_prefix><run>_<file_prefix><idx>_<writer_id>[_<now>].hdf5`.
    pub fn file_name(&self, run_number: RunNumber, file_index: u64, now: u64) -> PathBuf {
        let f = &self.config.filename;
        let mut name = format!(
            "{env}_{file_type}_{run_prefix}{run:0rwidth$}_{file_prefix}{idx:0iwidth$}_{writer}",
            env = f.operational_environment,
            file_type = f.file_type_prefix,
            run_prefix = f.run_number_prefix,
            run = run_number,
            rwidth = f.digits_for_run_number,
            file_prefix = f.file_index_prefix,
            idx = file_index,
            iwidth = f.digits_for_file_index,
            writer = f.writer_identifier,
        );
        if !f.disable_unique_filename_suffix {
            name = format!("{name}_{now}");
        }
        name.push_str(".hdf5");
        self.config.directory_path.join(name)
    }

    fn roll_to_new_file(&mut self, run_number: RunNumber, now: u64) -> Result<(), Error> {
        if let Some(mut file) = self.current_file.take() {
            file.flush()?;
        }
        let path = self.file_name(run_number, self.file_index, now);
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        tracing::debug!(path = %path.display(), "opened new storage file");
        self.current_file = Some(file);
        self.current_size = 0;
        self.file_index += 1;
        Ok(())
    }
}

impl StorageSink for FileStorageSink {
    fn prepare_for_run(&mut self, run_number: RunNumber, is_test: bool) -> Result<(), Error> {
        let meta = std::fs::metadata(&self.config.directory_path).map_err(|_| Error::InvalidDirectory(self.config.directory_path.clone()))?;
        if !meta.is_dir() {
            return Err(Error::InvalidDirectory(self.config.directory_path.clone()));
        }
        let available = self.probe.available_bytes(&self.config.directory_path)?;
        if available < self.config.max_file_size {
            return Err(Error::InsufficientDiskSpace {
                needed: self.config.max_file_size,
                available,
                factor: self.config.safety_factor(),
                record_size: self.config.max_file_size,
            });
        }
        tracing::info!(run_number, is_test, "storage sink prepared for run");
        self.run_number = Some(run_number);
        self.file_index = 0;
        self.current_file = None;
        self.current_size = 0;
        self.current_rolling_key = None;
        Ok(())
    }

    fn write(&mut self, key: StorageKey, payload: &[u8], now: u64) -> Result<(), Error> {
        let logical_path = self.path_string(&key)?;
        let framed = FramedRecord {
            logical_path,
            key,
            payload: payload.to_vec(),
        };
        let encoded = serde_yaml::to_vec(&framed).expect("FramedRecord always serializes");
        let record_size = (encoded.len() + 4) as u64;

        let available = self.probe.available_bytes(&self.config.directory_path)?;
        let factor = self.config.safety_factor();
        let needed = (factor * record_size as f64).ceil() as u64;
        if available < needed {
            return Err(Error::InsufficientDiskSpace {
                needed,
                available,
                factor,
                record_size,
            });
        }

        let rolling_key = (key.trigger_number, key.sequence_number);
        let must_roll_for_event = self.config.mode == RollingMode::OneEventPerFile
            && self.current_rolling_key.is_some_and(|prev| prev != rolling_key);
        let must_roll_for_size = self.current_size + record_size > self.config.max_file_size;
        if self.current_file.is_none() || must_roll_for_event || must_roll_for_size {
            self.roll_to_new_file(key.run_number, now)?;
        }
        self.current_rolling_key = Some(rolling_key);

        let file = self.current_file.as_mut().expect("just rolled or already open");
        file.write_all(&(encoded.len() as u32).to_le_bytes())?;
        file.write_all(&encoded)?;
        self.current_size += record_size;
        Ok(())
    }

    fn finish_with_run(&mut self, run_number: RunNumber) -> Result<(), Error> {
        if self.run_number != Some(run_number) {
            tracing::warn!(run_number, current = ?self.run_number, "finish_with_run for a run that was not prepared");
        }
        if let Some(mut file) = self.current_file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(u64);
    impl FreeSpaceProbe for FixedProbe {
        fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
            Ok(self.0)
        }
    }

    fn config(dir: &Path, mode: RollingMode) -> StorageSinkConfig {
        let mut path_params = HashMap::new();
        path_params.insert(
            GroupType::Tpc,
            PathParams {
                detector_group_name: "TPC".into(),
                region_name_prefix: "Region".into(),
                digits_for_region_number: 3,
                element_name_prefix: "Element".into(),
                digits_for_element_number: 2,
            },
        );
        StorageSinkConfig {
            mode,
            directory_path: dir.to_path_buf(),
            max_file_size: 4096,
            free_space_safety_factor: 1.5,
            filename: FilenameParams {
                operational_environment: "test".into(),
                file_type_prefix: "tpc".into(),
                run_number_prefix: "run".into(),
                digits_for_run_number: 4,
                file_index_prefix: "file".into(),
                digits_for_file_index: 3,
                writer_identifier: "writer0".into(),
                disable_unique_filename_suffix: true,
            },
            file_layout: FileLayoutParams {
                trigger_record_name_prefix: "TriggerRecord".into(),
                digits_for_trigger_number: 5,
                path_params,
            },
        }
    }

    fn key(trigger_number: u64, has_sequences: bool, sequence_number: u32) -> StorageKey {
        StorageKey {
            run_number: 1,
            trigger_number,
            sequence_number,
            has_sequences,
            group_type: GroupType::Tpc,
            region_number: 3,
            element_number: 7,
        }
    }

    #[test]
    fn path_string_includes_sequence_only_when_multi_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileStorageSink::with_probe(config(dir.path(), RollingMode::AllPerFile), Box::new(FixedProbe(1 << 30)));
        assert_eq!(sink.path_string(&key(1, false, 0)).unwrap(), "TriggerRecord00001/TPC/Region003/Element07");
        assert_eq!(sink.path_string(&key(1, true, 2)).unwrap(), "TriggerRecord00001.2/TPC/Region003/Element07");
    }

    #[test]
    fn unknown_group_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileStorageSink::with_probe(config(dir.path(), RollingMode::AllPerFile), Box::new(FixedProbe(1 << 30)));
        let mut k = key(1, false, 0);
        k.group_type = GroupType::Pds;
        assert!(matches!(sink.path_string(&k), Err(Error::RequestedHDF5GroupTypeNotFound { .. })));
    }

    #[test]
    fn trigger_record_header_group_needs_no_path_params() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileStorageSink::with_probe(config(dir.path(), RollingMode::AllPerFile), Box::new(FixedProbe(1 << 30)));
        let mut k = key(1, false, 0);
        k.group_type = GroupType::TriggerRecordHeader;
        assert_eq!(sink.path_string(&k).unwrap(), "TriggerRecord00001/TriggerRecordHeader");
    }

    #[test]
    fn prepare_for_run_rejects_insufficient_space() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileStorageSink::with_probe(config(dir.path(), RollingMode::AllPerFile), Box::new(FixedProbe(10)));
        assert!(matches!(sink.prepare_for_run(1, false), Err(Error::InsufficientDiskSpace { .. })));
    }

    #[test]
    fn write_rolls_to_new_file_per_event_in_one_event_per_file_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileStorageSink::with_probe(config(dir.path(), RollingMode::OneEventPerFile), Box::new(FixedProbe(1 << 30)));
        sink.prepare_for_run(1, false).unwrap();
        sink.write(key(1, false, 0), b"abc", 100).unwrap();
        sink.write(key(2, false, 0), b"def", 101).unwrap();
        assert_eq!(sink.file_index, 2, "each distinct trigger rolled its own file");
    }

    #[test]
    fn write_rolls_on_size_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), RollingMode::AllPerFile);
        config.max_file_size = 32;
        let mut sink = FileStorageSink::with_probe(config, Box::new(FixedProbe(1 << 30)));
        sink.prepare_for_run(1, false).unwrap();
        sink.write(key(1, false, 0), &vec![0u8; 8], 100).unwrap();
        let first_index = sink.file_index;
        sink.write(key(1, false, 1), &vec![0u8; 8], 101).unwrap();
        assert!(sink.file_index >= first_index);
    }

    #[test]
    fn finish_with_run_closes_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileStorageSink::with_probe(config(dir.path(), RollingMode::AllPerFile), Box::new(FixedProbe(1 << 30)));
        sink.prepare_for_run(1, false).unwrap();
        sink.write(key(1, false, 0), b"abc", 100).unwrap();
        sink.finish_with_run(1).unwrap();
        assert!(sink.current_file.is_none());
    }

    #[test]
    fn retryable_errors_are_distinguished_from_permanent_ones() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileStorageSink::with_probe(config(dir.path(), RollingMode::AllPerFile), Box::new(FixedProbe(1)));
        let err = sink.write(key(1, false, 0), b"x", 100).unwrap_err();
        assert!(err.is_retryable(), "insufficient disk space must be retryable");
    }
}
