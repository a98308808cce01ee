//! The engine's own error type, aggregating every component crate's error
//! via `#[from]`, following the teacher's `engine::Error` shape.

/// Errors raised while wiring, configuring, or driving the dataflow core.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A command was issued before the engine reached the state it requires.
    #[error("command '{command}' requires state {expected}, engine is {actual}")]
    WrongState {
        /// The command that was rejected.
        command: &'static str,
        /// The state the command requires.
        expected: &'static str,
        /// The engine's actual state.
        actual: &'static str,
    },

    /// `StorageSinkConf::file_layout_parameters` named a `detector_group_type`
    /// the [`daq_model::GroupType`] enum has no variant for.
    #[error("unknown detector group type '{detector_group_type}' in storage sink configuration")]
    UnknownGroupType {
        /// The unrecognized string from the config document.
        detector_group_type: String,
    },

    /// Propagated from configuration loading/validation.
    #[error(transparent)]
    Config(#[from] daq_config::Error),

    /// Propagated from a channel send/receive.
    #[error(transparent)]
    Channel(#[from] daq_channel::Error),

    /// Propagated from the DFO Broker.
    #[error(transparent)]
    DfoBroker(#[from] daq_dfo_broker::Error),

    /// Propagated from the DFO.
    #[error(transparent)]
    Dfo(#[from] daq_dfo::Error),

    /// Propagated from the Trigger Record Builder.
    #[error(transparent)]
    Trb(#[from] daq_trb::Error),

    /// Propagated from the Data Writer.
    #[error(transparent)]
    DataWriter(#[from] daq_data_writer::Error),

    /// Propagated from the Storage Sink.
    #[error(transparent)]
    StorageSink(#[from] daq_storage_sink::Error),
}
