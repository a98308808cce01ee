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

//! Configuration objects for the dataflow core.
//!
//! One `serde`-deserializable, `validator`-validated struct per component is
//! read out of a single top-level YAML document. A structural violation
//! (e.g. `busy_threshold < free_threshold`) is a fatal configuration error:
//! it fails `conf()` and the component never enters RUNNING.

use std::{fs::File, io::BufReader, path::Path};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Errors for the config module.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The config file could not be read or parsed.
    #[error("invalid configuration file `{file}` - {message}")]
    InvalidConfig {
        /// The path to the config file.
        file: String,
        /// The error message.
        message: String,
    },

    /// The configuration failed structural validation.
    #[error("configuration of '{component}' failed validation - {message}")]
    Invalid {
        /// The component whose configuration failed.
        component: String,
        /// The validation failure message.
        message: String,
    },
}

fn validate_busy_free(conf: &DfoConf) -> Result<(), ValidationError> {
    if conf.busy_threshold < conf.free_threshold {
        let mut err = ValidationError::new("busy_threshold_below_free_threshold");
        err.message = Some("busy_threshold must be >= free_threshold".into());
        return Err(err);
    }
    Ok(())
}

fn validate_safety_factor(conf: &StorageSinkConf) -> Result<(), ValidationError> {
    if conf.free_space_safety_factor < 1.1 {
        let mut err = ValidationError::new("free_space_safety_factor_too_low");
        err.message = Some("free_space_safety_factor must be >= 1.1".into());
        return Err(err);
    }
    Ok(())
}

/// Configuration of the DFO Broker (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DfoBrokerConf {
    /// The set of DFO ids this broker multiplexes; exactly one is active at a
    /// time via `enable_dfo`.
    #[validate(length(min = 1))]
    pub dfo_ids: Vec<String>,
    /// The connection name the active DFO's decision is forwarded to.
    pub decision_destination: String,
    /// Period of the heartbeat timer, in milliseconds.
    #[validate(range(min = 1))]
    pub send_heartbeat_interval_ms: u64,
    /// Deadline for a single heartbeat send, in milliseconds.
    #[validate(range(min = 1))]
    pub send_heartbeat_timeout_ms: u64,
    /// Deadline for forwarding a decision to the TRB, in milliseconds.
    #[validate(range(min = 1))]
    pub td_timeout_ms: u64,
    /// Deadline to drain outstanding decisions on stop, in milliseconds.
    #[validate(range(min = 0))]
    pub stop_timeout_ms: u64,
}

/// Configuration of the DFO (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_busy_free"))]
pub struct DfoConf {
    /// The id this DFO instance advertises itself as to its broker.
    pub dfo_id: String,
    /// Connection names of the builders this DFO dispatches to; every one
    /// shares `busy_threshold`/`free_threshold`.
    #[validate(length(min = 1))]
    pub builder_connections: Vec<String>,
    /// Deadline for a single send/receive, in milliseconds.
    #[validate(range(min = 1))]
    pub general_queue_timeout_ms: u64,
    /// Deadline to drain outstanding assignments on stop, in milliseconds.
    #[validate(range(min = 0))]
    pub stop_timeout_ms: u64,
    /// Outstanding-count at which a builder flips busy.
    #[validate(range(min = 1))]
    pub busy_threshold: usize,
    /// Outstanding-count below which a builder flips free.
    #[validate(range(min = 0))]
    pub free_threshold: usize,
    /// Number of retries when dispatching a decision to a builder.
    #[validate(range(min = 0))]
    pub td_send_retries: u32,
}

/// Configuration of the Trigger Record Builder (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TrbConf {
    /// Milliseconds after which a pending trigger is emitted incomplete;
    /// `0` disables the timeout.
    #[validate(range(min = 0))]
    pub trigger_record_timeout_ms: u64,
    /// Deadline for a single send/receive, in milliseconds.
    #[validate(range(min = 1))]
    pub queues_timeout_ms: u64,
    /// Width of a sequence slice, in detector ticks; `0` disables splitting.
    #[validate(range(min = 0))]
    pub max_time_window: u64,
    /// The numeric id of this TRB instance.
    pub source_id: u32,
    /// The connection name producers must use to reply with fragments.
    pub reply_connection: String,
}

/// Configuration of the Data Writer (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DataWriterConf {
    /// The connection completion tokens are sent back to the DFO Broker on.
    pub trigger_decision_connection: String,
    /// Only every Nth record is written; `1` writes everything.
    #[validate(range(min = 1))]
    pub data_storage_prescale: u64,
    /// Initial retry backoff, in microseconds.
    #[validate(range(min = 1))]
    pub min_write_retry_time_us: u64,
    /// Maximum retry backoff, in microseconds.
    #[validate(range(min = 1))]
    pub max_write_retry_time_us: u64,
    /// Multiplier applied to the backoff after each failed attempt.
    #[validate(range(min = 1.0))]
    pub write_retry_time_increase_factor: f64,
}

/// Configuration of the TP Bundle Handler (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TpBundleHandlerConf {
    /// Width of one time slice, in detector ticks.
    #[validate(range(min = 1))]
    pub tp_accumulation_interval: u64,
    /// Quiescence period before an accumulator is emitted, in seconds.
    #[validate(range(min = 1))]
    pub tp_accumulation_inactivity_time_before_write_sec: u64,
    /// Whether a tardy TPSet raises a warning.
    pub warn_user_when_tardy_tps_are_discarded: bool,
    /// The numeric id of this handler instance.
    pub source_id: u32,
}

/// The file-rolling mode of the storage sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    /// Roll to a new file for every trigger/slice number.
    OneEventPerFile,
    /// Pack multiple triggers/slices into each file up to `max_file_size`.
    AllPerFile,
}

/// One entry of the logical path grammar, resolved per [`daq_model::GroupType`].
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PathParams {
    /// The detector group type this entry applies to (`"TPC"`, `"PDS"`,
    /// `"Trigger"`, `"TPC_TP"`).
    pub detector_group_type: String,
    /// The group name used in the path.
    pub detector_group_name: String,
    /// Prefix for the region number component of the path.
    pub region_name_prefix: String,
    /// Zero-padded width of the region number.
    #[validate(range(min = 1))]
    pub digits_for_region_number: usize,
    /// Prefix for the element number component of the path.
    pub element_name_prefix: String,
    /// Zero-padded width of the element number.
    #[validate(range(min = 1))]
    pub digits_for_element_number: usize,
}

/// Filename grammar parameters (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FilenameParameters {
    /// Prefix shared by every file of this sink.
    pub overall_prefix: String,
    /// Prefix for the run number component of the filename.
    pub run_number_prefix: String,
    /// Zero-padded width of the run number.
    #[validate(range(min = 1))]
    pub digits_for_run_number: usize,
    /// Prefix for the file index component of the filename.
    pub file_index_prefix: String,
    /// Zero-padded width of the file index.
    #[validate(range(min = 1))]
    pub digits_for_file_index: usize,
}

/// File layout parameters (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FileLayoutParameters {
    /// Prefix for the trigger/slice number in the logical path.
    pub trigger_record_name_prefix: String,
    /// Zero-padded width of the trigger/slice number.
    #[validate(range(min = 1))]
    pub digits_for_trigger_number: usize,
    /// Per-group-type path parameters.
    #[validate]
    pub path_param_list: Vec<PathParams>,
}

/// Configuration of the Storage Sink (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_safety_factor"))]
pub struct StorageSinkConf {
    /// The file-rolling mode.
    pub mode: StorageMode,
    /// The directory new files are created under.
    pub directory_path: String,
    /// Maximum size, in bytes, a single file may reach before rolling.
    #[validate(range(min = 1))]
    pub max_file_size: u64,
    /// Skip appending a uniqueness (timestamp) suffix to filenames.
    pub disable_unique_filename_suffix: bool,
    /// Multiple of the next record's size that must remain free on disk
    /// before a write is attempted; clamped to `>= 1.1`.
    pub free_space_safety_factor: f64,
    /// The operational environment tag embedded in filenames (e.g. `"prod"`).
    pub operational_env: String,
    /// The id of this writer, embedded in filenames.
    pub writer_id: String,
    /// The filename grammar.
    #[validate]
    pub filename_parameters: FilenameParameters,
    /// The logical layout grammar.
    #[validate]
    pub file_layout_parameters: FileLayoutParameters,
}

/// The top-level configuration document for the dataflow core.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DataflowCoreConf {
    /// DFO Broker configuration.
    #[validate]
    pub dfo_broker: DfoBrokerConf,
    /// DFO configuration.
    #[validate]
    pub dfo: DfoConf,
    /// Trigger Record Builder configuration.
    #[validate]
    pub trb: TrbConf,
    /// Data Writer configuration.
    #[validate]
    pub data_writer: DataWriterConf,
    /// TP Bundle Handler configuration.
    #[validate]
    pub tp_bundle_handler: TpBundleHandlerConf,
    /// Storage Sink configuration.
    #[validate]
    pub storage_sink: StorageSinkConf,
}

impl DataflowCoreConf {
    /// Loads and validates the dataflow core configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(config_file_path: P) -> Result<Self, Error> {
        let config_file_name = config_file_path.as_ref().display().to_string();

        tracing::debug!(file = %config_file_name, "loading dataflow core configuration");

        let config_file = File::open(config_file_path).map_err(|err| Error::InvalidConfig {
            file: config_file_name.clone(),
            message: err.to_string(),
        })?;
        let reader = BufReader::new(config_file);
        let conf: DataflowCoreConf = serde_yaml::from_reader(reader).map_err(|err| Error::InvalidConfig {
            file: config_file_name.clone(),
            message: err.to_string(),
        })?;

        conf.validate().map_err(|err| Error::Invalid {
            component: "dataflow_core".into(),
            message: err.to_string(),
        })?;

        Ok(conf)
    }
}
