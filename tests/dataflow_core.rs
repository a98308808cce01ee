//! End-to-end exercise of the dataflow core through `DataflowCoreEngine`'s
//! public API: a trigger decision submitted at the boundary is sliced into a
//! data request, the request's reply is folded into a completed trigger
//! record, and a subscribed monitor receives a copy of it.

use std::time::Duration;

use daq_config::{
    DataWriterConf, DfoBrokerConf, DfoConf, FileLayoutParameters, FilenameParameters, PathParams, StorageMode, StorageSinkConf, TpBundleHandlerConf, TrbConf,
};
use daq_engine::DataflowCoreEngine;
use daq_model::{ComponentRequest, Fragment, FragmentType, SourceId, Subsystem, TrMonRequest, TriggerDecision};
use daq_task::labels::ProcessLabels;

fn conf(dir: &std::path::Path) -> daq_config::DataflowCoreConf {
    daq_config::DataflowCoreConf {
        dfo_broker: DfoBrokerConf {
            dfo_ids: vec!["dfo0".into()],
            decision_destination: "trb0".into(),
            send_heartbeat_interval_ms: 50,
            send_heartbeat_timeout_ms: 50,
            td_timeout_ms: 20,
            stop_timeout_ms: 20,
        },
        dfo: DfoConf {
            dfo_id: "dfo0".into(),
            builder_connections: vec!["trb0".into()],
            general_queue_timeout_ms: 20,
            stop_timeout_ms: 20,
            busy_threshold: 4,
            free_threshold: 2,
            td_send_retries: 1,
        },
        trb: TrbConf {
            trigger_record_timeout_ms: 0,
            queues_timeout_ms: 20,
            max_time_window: 0,
            source_id: 1,
            reply_connection: "trb0.reply".into(),
        },
        data_writer: DataWriterConf {
            trigger_decision_connection: "writer0".into(),
            data_storage_prescale: 1,
            min_write_retry_time_us: 100,
            max_write_retry_time_us: 1000,
            write_retry_time_increase_factor: 2.0,
        },
        tp_bundle_handler: TpBundleHandlerConf {
            tp_accumulation_interval: 1000,
            tp_accumulation_inactivity_time_before_write_sec: 1,
            warn_user_when_tardy_tps_are_discarded: true,
            source_id: 2,
        },
        storage_sink: StorageSinkConf {
            mode: StorageMode::AllPerFile,
            directory_path: dir.display().to_string(),
            max_file_size: 1_000_000,
            disable_unique_filename_suffix: true,
            free_space_safety_factor: 1.1,
            operational_env: "test".into(),
            writer_id: "writer0".into(),
            filename_parameters: FilenameParameters {
                overall_prefix: "daq".into(),
                run_number_prefix: "run".into(),
                digits_for_run_number: 6,
                file_index_prefix: "idx".into(),
                digits_for_file_index: 4,
            },
            file_layout_parameters: FileLayoutParameters {
                trigger_record_name_prefix: "TriggerRecord".into(),
                digits_for_trigger_number: 6,
                path_param_list: vec![PathParams {
                    detector_group_type: "TPC".into(),
                    detector_group_name: "TPC".into(),
                    region_name_prefix: "APA".into(),
                    digits_for_region_number: 2,
                    element_name_prefix: "Link".into(),
                    digits_for_element_number: 2,
                }],
            },
        },
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn trigger_decision_becomes_a_trigger_record_and_reaches_the_monitor() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("dataflow_core.yaml");
    std::fs::write(&config_path, serde_yaml::to_string(&conf(dir.path())).unwrap()).unwrap();

    let mut engine = DataflowCoreEngine::new();
    engine.init(ProcessLabels::new("test")).unwrap();
    engine.conf(&config_path).unwrap();
    let endpoints = engine.start(1, true).unwrap();

    endpoints
        .mon_request_tx
        .send_timeout(
            TrMonRequest {
                trigger_type: 1,
                data_destination: "mon0".into(),
            },
            Duration::from_millis(200),
        )
        .await
        .unwrap();

    let source_id = SourceId::new(Subsystem::DetectorReadout, 7);
    let decision = TriggerDecision {
        trigger_number: 1,
        run_number: 1,
        trigger_timestamp: 5,
        trigger_type: 1,
        readout_type: "test".into(),
        components: vec![ComponentRequest {
            source_id,
            window_begin: 0,
            window_end: 10,
        }],
    };
    endpoints.trigger_decision_tx.send_timeout(decision, Duration::from_millis(200)).await.unwrap();

    let request = endpoints.data_request_rx.recv_timeout(Duration::from_secs(2)).await.expect("data request timed out");
    assert_eq!(request.trigger_number, 1);
    assert_eq!(request.component.source_id, source_id);

    let fragment = Fragment {
        trigger_number: request.trigger_number,
        sequence_number: request.sequence_number,
        run_number: request.run_number,
        element_id: request.component.source_id,
        window_begin: request.component.window_begin,
        window_end: request.component.window_end,
        payload: vec![1, 2, 3],
        fragment_type: FragmentType::Payload,
        error_bits: 0,
    };
    endpoints.fragment_input_tx.send_timeout(fragment, Duration::from_millis(200)).await.unwrap();

    let (destination, record) = endpoints.trigger_record_mon_rx.recv_timeout(Duration::from_secs(2)).await.expect("monitoring copy timed out");
    assert_eq!(destination, "mon0");
    assert_eq!(record.header.trigger_number, 1);
    assert_eq!(record.fragments.len(), 1);

    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn start_then_stop_with_no_traffic_shuts_down_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("dataflow_core.yaml");
    std::fs::write(&config_path, serde_yaml::to_string(&conf(dir.path())).unwrap()).unwrap();

    let mut engine = DataflowCoreEngine::new();
    engine.init(ProcessLabels::new("test")).unwrap();
    engine.conf(&config_path).unwrap();
    let endpoints = engine.start(1, true).unwrap();
    drop(endpoints);
    engine.stop().await.unwrap();

    engine.scrap().unwrap();
    engine.conf(&config_path).unwrap();
    let endpoints = engine.start(2, true).unwrap();
    drop(endpoints);
    engine.stop().await.unwrap();
}
