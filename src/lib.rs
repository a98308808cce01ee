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

//! The DUNE dataflow core: a trigger-dispatch, trigger-record-assembly, and
//! time-sliced TP streaming/persistence backend.
//!
//! A trigger source submits [`daq_model::TriggerDecision`]s to the DFO Broker,
//! which multiplexes between redundant DFO instances and forwards the active
//! one's dispatch decision to the Trigger Record Builder. The TRB fans each
//! decision out into [`daq_model::DataRequest`]s, collects the resulting
//! [`daq_model::Fragment`]s, and emits a completed (or timed-out)
//! [`daq_model::TriggerRecord`] to the Data Writer. In parallel, the TP Bundle
//! Handler accumulates [`daq_model::TPSet`]s into time-local
//! [`daq_model::TimeSlice`]s and hands them to the same Data Writer. The Data
//! Writer turns both into storage writes and, once every sequence of a
//! trigger has durably landed, a completion token that feeds back to the
//! broker.
//!
//! [`daq_engine::DataflowCoreEngine`] is the entry point: it loads
//! configuration, wires every component's connections, and drives one task
//! per component until `stop` is called.

pub use daq_builder_state;
pub use daq_channel;
pub use daq_config;
pub use daq_data_writer;
pub use daq_dfo;
pub use daq_dfo_broker;
pub use daq_engine;
pub use daq_model;
pub use daq_storage_sink;
pub use daq_task;
pub use daq_tp_bundle;
pub use daq_trb;
