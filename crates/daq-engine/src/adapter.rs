//! Translates `daq-config`'s YAML-shaped structs into the constructor
//! arguments the pure-logic and storage-sink crates actually expect.
//!
//! `daq-config`'s `StorageSinkConf` names its filename grammar fields after
//! the operator-facing YAML document (`overall_prefix`, `run_number_prefix`,
//! ...), while `daq-storage-sink::FilenameParams` names them after the §4.7
//! grammar it implements (`file_type_prefix`, `writer_identifier`, ...). The
//! two shapes carry the same information under different names, plus two
//! fields (`operational_env`, `writer_id`) that live at the top level of
//! `StorageSinkConf` rather than nested under `filename_parameters`.

use std::{collections::HashMap, path::PathBuf};

use daq_model::GroupType;

use crate::Error;

fn group_type_of(detector_group_type: &str) -> Result<GroupType, Error> {
    match detector_group_type {
        "TPC" => Ok(GroupType::Tpc),
        "PDS" => Ok(GroupType::Pds),
        "Trigger" => Ok(GroupType::Trigger),
        "TPC_TP" => Ok(GroupType::TpcTp),
        "TriggerRecordHeader" => Ok(GroupType::TriggerRecordHeader),
        other => Err(Error::UnknownGroupType { detector_group_type: other.to_string() }),
    }
}

/// Builds a [`daq_storage_sink::StorageSinkConfig`] from a validated
/// [`daq_config::StorageSinkConf`].
pub fn storage_sink_config(conf: &daq_config::StorageSinkConf) -> Result<daq_storage_sink::StorageSinkConfig, Error> {
    let mode = match conf.mode {
        daq_config::StorageMode::OneEventPerFile => daq_storage_sink::RollingMode::OneEventPerFile,
        daq_config::StorageMode::AllPerFile => daq_storage_sink::RollingMode::AllPerFile,
    };

    let mut path_params = HashMap::new();
    for entry in &conf.file_layout_parameters.path_param_list {
        let group_type = group_type_of(&entry.detector_group_type)?;
        path_params.insert(
            group_type,
            daq_storage_sink::PathParams {
                detector_group_name: entry.detector_group_name.clone(),
                region_name_prefix: entry.region_name_prefix.clone(),
                digits_for_region_number: entry.digits_for_region_number,
                element_name_prefix: entry.element_name_prefix.clone(),
                digits_for_element_number: entry.digits_for_element_number,
            },
        );
    }

    Ok(daq_storage_sink::StorageSinkConfig {
        mode,
        directory_path: PathBuf::from(&conf.directory_path),
        max_file_size: conf.max_file_size,
        free_space_safety_factor: conf.free_space_safety_factor,
        filename: daq_storage_sink::FilenameParams {
            operational_environment: conf.operational_env.clone(),
            file_type_prefix: conf.filename_parameters.overall_prefix.clone(),
            run_number_prefix: conf.filename_parameters.run_number_prefix.clone(),
            digits_for_run_number: conf.filename_parameters.digits_for_run_number,
            file_index_prefix: conf.filename_parameters.file_index_prefix.clone(),
            digits_for_file_index: conf.filename_parameters.digits_for_file_index,
            writer_identifier: conf.writer_id.clone(),
            disable_unique_filename_suffix: conf.disable_unique_filename_suffix,
        },
        file_layout: daq_storage_sink::FileLayoutParams {
            trigger_record_name_prefix: conf.file_layout_parameters.trigger_record_name_prefix.clone(),
            digits_for_trigger_number: conf.file_layout_parameters.digits_for_trigger_number,
            path_params,
        },
    })
}
