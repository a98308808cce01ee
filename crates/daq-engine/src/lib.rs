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

//! Wires every dataflow core component into a running system (§2, §5, §6).
//!
//! `daq-engine` is the only crate in this workspace that performs channel I/O:
//! `daq-builder-state`, `daq-dfo`, `daq-dfo-broker`, `daq-tp-bundle`,
//! `daq-trb`, and `daq-data-writer` are pure logic, driven here by one
//! `tokio::task` per component racing its inbound connections (and, where
//! relevant, a timer) against a shared stop signal. `daq-storage-sink` is the
//! exception: it owns real file I/O directly, and is only ever touched from
//! inside the Data Writer's task.
//!
//! The top-level [`DataflowCoreEngine`] exposes the command plane
//! (`init`/`conf`/`start`/`stop`/`scrap`) that a DUNE `appfwk`-style run
//! control would drive, following the teacher's `Engine`/`Command` split in
//! `engine::controllers`.

mod adapter;
mod error;
mod tasks;
mod wiring;

use daq_config::DataflowCoreConf;
use daq_dfo::Dfo;
use daq_dfo_broker::DfoBroker;
use daq_model::RunNumber;
use daq_storage_sink::FileStorageSink;
use daq_task::{
    labels::{ProcessLabels, TaskLabels},
    TaskManager,
};
use tokio::sync::watch;

pub use error::Error;
pub use wiring::ExternalEndpoints;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Initialized,
    Configured,
    Running,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Created => "created",
            State::Initialized => "initialized",
            State::Configured => "configured",
            State::Running => "running",
        }
    }
}

fn wrong_state(command: &'static str, expected: &'static str, actual: State) -> Error {
    Error::WrongState {
        command,
        expected,
        actual: actual.name(),
    }
}

/// Owns the dataflow core's configuration, task registration, and
/// coordinated shutdown, mirroring the command lifecycle of §6 (`init`,
/// `conf`, `start`, `stop`, `scrap`).
pub struct DataflowCoreEngine {
    state: State,
    process_labels: ProcessLabels,
    conf: Option<DataflowCoreConf>,
    active_dfo_id: Option<String>,
    task_manager: TaskManager,
    stop_tx: Option<watch::Sender<bool>>,
}

impl Default for DataflowCoreEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DataflowCoreEngine {
    /// Creates an engine in the `created` state; call [`DataflowCoreEngine::init`]
    /// before anything else.
    pub fn new() -> Self {
        Self {
            state: State::Created,
            process_labels: ProcessLabels::default(),
            conf: None,
            active_dfo_id: None,
            task_manager: TaskManager::new(),
            stop_tx: None,
        }
    }

    /// `init`: records the process identity this engine instance runs under.
    pub fn init(&mut self, process_labels: ProcessLabels) -> Result<(), Error> {
        if self.state != State::Created {
            return Err(wrong_state("init", "created", self.state));
        }
        self.process_labels = process_labels;
        self.task_manager.set_process_labels(self.process_labels.clone());
        self.state = State::Initialized;
        Ok(())
    }

    /// `conf`: loads and validates the dataflow core configuration document.
    /// Fails outright (per §7's "fatal configuration" policy) on a structural
    /// problem; the engine stays `initialized` and may be re-`conf`'d.
    pub fn conf(&mut self, config_file_path: impl AsRef<std::path::Path>) -> Result<(), Error> {
        if self.state != State::Initialized {
            return Err(wrong_state("conf", "initialized", self.state));
        }
        let conf = DataflowCoreConf::load(config_file_path)?;
        // Fails fast on an unrecognized detector_group_type rather than
        // surfacing it later as a runtime storage error.
        adapter::storage_sink_config(&conf.storage_sink)?;
        self.active_dfo_id.get_or_insert_with(|| conf.dfo.dfo_id.clone());
        self.conf = Some(conf);
        self.state = State::Configured;
        Ok(())
    }

    /// Selects which of the broker's known DFO ids is active. Only valid
    /// before [`DataflowCoreEngine::start`]: once a run is going, the broker
    /// has already been moved into its own task and can no longer be reached
    /// directly (a consequence of the single-DFO-per-broker wiring this
    /// engine uses, documented in `DESIGN.md`).
    pub fn enable_dfo(&mut self, dfo_id: impl Into<String>) -> Result<(), Error> {
        if self.state != State::Configured {
            return Err(wrong_state("enable_dfo", "configured", self.state));
        }
        self.active_dfo_id = Some(dfo_id.into());
        Ok(())
    }

    /// `start`: builds every component from the loaded configuration, wires
    /// their connections, prepares the storage sink for `run_number`, and
    /// spawns one task per component. Returns the external boundary
    /// endpoints an operator-facing producer/trigger-source/monitoring layer
    /// talks to.
    pub fn start(&mut self, run_number: RunNumber, is_test: bool) -> Result<ExternalEndpoints, Error> {
        if self.state != State::Configured {
            return Err(wrong_state("start", "configured", self.state));
        }
        let conf = self.conf.clone().expect("configured state implies conf is set");
        let dfo_id = self.active_dfo_id.clone().unwrap_or_else(|| conf.dfo.dfo_id.clone());

        let sink_config = adapter::storage_sink_config(&conf.storage_sink)?;
        let mut sink = FileStorageSink::new(sink_config);
        sink.prepare_for_run(run_number, is_test)?;

        let wiring::Wiring {
            internal,
            trigger_decision_in,
            trigger_inhibit_out,
            data_request_out,
            fragment_input,
            tpset_input,
            mon_request,
            trigger_record_mon,
        } = wiring::Wiring::new();

        let heartbeat_source = internal.heartbeat.1.connection_name().to_string();

        let mut broker = DfoBroker::new(conf.dfo_broker.dfo_ids.clone(), run_number, conf.dfo_broker.decision_destination.clone());
        broker.enable_dfo(&dfo_id);
        let dfo = Dfo::new(
            dfo_id.clone(),
            run_number,
            conf.dfo.builder_connections.iter().map(|name| (name.clone(), conf.dfo.busy_threshold, conf.dfo.free_threshold)),
        )?;
        let trb = daq_trb::Trb::new(
            daq_model::SourceId::new(daq_model::Subsystem::TRBuilder, conf.trb.source_id),
            run_number,
            conf.trb.max_time_window,
            conf.trb.trigger_record_timeout_ms,
            conf.trb.reply_connection.clone(),
        );
        let tp_bundle = daq_tp_bundle::TpBundleHandler::new(
            conf.tp_bundle_handler.tp_accumulation_interval,
            run_number,
            conf.tp_bundle_handler.tp_accumulation_inactivity_time_before_write_sec,
            daq_model::SourceId::new(daq_model::Subsystem::TRBuilder, conf.tp_bundle_handler.source_id),
        );
        let writer = daq_data_writer::DataWriter::new(
            run_number,
            conf.data_writer.data_storage_prescale,
            false,
            conf.data_writer.trigger_decision_connection.clone(),
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);

        let broker_task = tasks::run_dfo_broker(
            broker,
            trigger_decision_in.1,
            internal.dfo_decision_in.0,
            internal.dfo_decision_out.1,
            internal.token.1,
            internal.trb_decision.0,
            internal.heartbeat.0,
            conf.dfo_broker.clone(),
            stop_rx.clone(),
        );
        self.spawn(broker_task, "dfo_broker");

        let dfo_task = tasks::run_dfo(
            dfo,
            dfo_id,
            heartbeat_source,
            internal.dfo_decision_in.1,
            internal.heartbeat.1,
            internal.dfo_decision_out.0,
            trigger_inhibit_out.0,
            conf.dfo.clone(),
            stop_rx.clone(),
        );
        self.spawn(dfo_task, "dfo");

        let trb_task = tasks::run_trb(
            trb,
            internal.trb_decision.1,
            fragment_input.1,
            mon_request.1,
            data_request_out.0,
            internal.trigger_record.0,
            trigger_record_mon.0,
            conf.trb.clone(),
            stop_rx.clone(),
        );
        self.spawn(trb_task, "trb");

        let tp_bundle_task = tasks::run_tp_bundle(tp_bundle, tpset_input.1, internal.timeslice.0, conf.tp_bundle_handler.clone(), stop_rx.clone());
        self.spawn(tp_bundle_task, "tp_bundle_handler");

        let data_writer_task = tasks::run_data_writer(
            writer,
            Box::new(sink),
            run_number,
            internal.trigger_record.1,
            internal.timeslice.1,
            internal.token.0,
            conf.data_writer.clone(),
            stop_rx,
        );
        self.spawn(data_writer_task, "data_writer");

        self.state = State::Running;

        Ok(ExternalEndpoints {
            trigger_decision_tx: trigger_decision_in.0,
            trigger_inhibit_rx: trigger_inhibit_out.1,
            data_request_rx: data_request_out.1,
            fragment_input_tx: fragment_input.0,
            tpset_input_tx: tpset_input.0,
            mon_request_tx: mon_request.0,
            trigger_record_mon_rx: trigger_record_mon.1,
        })
    }

    fn spawn(&mut self, task: impl std::future::Future<Output = ()> + Send + 'static, name: &'static str) {
        let process_labels = self.process_labels.clone();
        let task_labels = TaskLabels::new("component", name, &self.process_labels.process_id);
        let cleaner_labels = task_labels.clone();
        let handle = tokio::spawn(async move {
            task.await;
            daq_task::TaskManager::no_task_cleaner(process_labels, cleaner_labels)
        });
        self.task_manager.register(handle, &task_labels);
    }

    /// `stop`: signals every task to drain and exit, then waits for them all
    /// to join. Returns to the `configured` state so `start` can be called
    /// again for a new run.
    pub async fn stop(&mut self) -> Result<(), Error> {
        if self.state != State::Running {
            return Err(wrong_state("stop", "running", self.state));
        }
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        self.task_manager.join().await;
        self.state = State::Configured;
        Ok(())
    }

    /// `scrap`: discards the loaded configuration. The engine returns to the
    /// `initialized` state and must be `conf`'d again before the next `start`.
    pub fn scrap(&mut self) -> Result<(), Error> {
        if self.state != State::Configured {
            return Err(wrong_state("scrap", "configured", self.state));
        }
        self.conf = None;
        self.active_dfo_id = None;
        self.state = State::Initialized;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use daq_config::{
        DataWriterConf, DfoBrokerConf, DfoConf, FileLayoutParameters, FilenameParameters, StorageMode, StorageSinkConf, TpBundleHandlerConf, TrbConf,
    };

    use super::*;

    fn sample_conf(dir: &std::path::Path) -> DataflowCoreConf {
        DataflowCoreConf {
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
                    path_param_list: vec![],
                },
            },
        }
    }

    fn conf_file(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("dataflow_core.yaml");
        let yaml = serde_yaml::to_string(&sample_conf(dir)).unwrap();
        std::fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn init_rejects_wrong_state() {
        let mut engine = DataflowCoreEngine::new();
        engine.init(ProcessLabels::new("test")).unwrap();
        assert!(matches!(engine.init(ProcessLabels::new("test")), Err(Error::WrongState { .. })));
    }

    #[test]
    fn conf_rejects_before_init() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = DataflowCoreEngine::new();
        assert!(matches!(engine.conf(conf_file(dir.path())), Err(Error::WrongState { .. })));
    }

    #[test]
    fn enable_dfo_rejects_before_conf() {
        let mut engine = DataflowCoreEngine::new();
        engine.init(ProcessLabels::new("test")).unwrap();
        assert!(matches!(engine.enable_dfo("dfo0"), Err(Error::WrongState { .. })));
    }

    #[test]
    fn scrap_rejects_before_conf() {
        let mut engine = DataflowCoreEngine::new();
        engine.init(ProcessLabels::new("test")).unwrap();
        assert!(matches!(engine.scrap(), Err(Error::WrongState { .. })));
    }

    #[tokio::test]
    async fn stop_rejects_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = DataflowCoreEngine::new();
        engine.init(ProcessLabels::new("test")).unwrap();
        engine.conf(conf_file(dir.path())).unwrap();
        assert!(matches!(engine.stop().await, Err(Error::WrongState { .. })));
    }

    #[test]
    fn conf_rejects_unknown_group_type() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = sample_conf(dir.path());
        conf.storage_sink.file_layout_parameters.path_param_list.push(daq_config::PathParams {
            detector_group_type: "Nonsense".into(),
            detector_group_name: "X".into(),
            region_name_prefix: "R".into(),
            digits_for_region_number: 2,
            element_name_prefix: "E".into(),
            digits_for_element_number: 2,
        });
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, serde_yaml::to_string(&conf).unwrap()).unwrap();

        let mut engine = DataflowCoreEngine::new();
        engine.init(ProcessLabels::new("test")).unwrap();
        assert!(matches!(engine.conf(path), Err(Error::UnknownGroupType { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_wires_every_task_and_stop_joins_them() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = DataflowCoreEngine::new();
        engine.init(ProcessLabels::new("test")).unwrap();
        engine.conf(conf_file(dir.path())).unwrap();

        let endpoints = engine.start(1, true).unwrap();
        drop(endpoints);

        engine.stop().await.unwrap();
    }
}
