//! Channel construction for every named connection of §6.
//!
//! Two simplifications are made at this (engine) layer, both documented in
//! `DESIGN.md`: exactly one DFO instance is wired per broker (sidestepping
//! `daq_channel::Receiver<T>` not being `Clone`, which a true multi-DFO
//! pub/sub heartbeat fan-out would need), and the per-producer `data_request`
//! connection and the TRB's per-destination monitoring copies are each
//! carried on a single multiplexed channel rather than one channel per peer,
//! since the producer/monitor registry is not part of this codebase's
//! configuration surface.

use daq_model::{DataRequest, DataflowHeartbeat, DfoDecision, Fragment, TPSet, TimeSlice, TrMonRequest, TriggerDecision, TriggerDecisionToken, TriggerInhibit, TriggerRecord};

const CHANNEL_CAPACITY: usize = 256;

/// Channels connecting the engine's own component tasks to one another.
pub struct InternalConnections {
    /// Broker → DFO: raw trigger decisions, relayed unchanged.
    pub dfo_decision_in: (daq_channel::Sender<TriggerDecision>, daq_channel::Receiver<TriggerDecision>),
    /// DFO → Broker: the DFO's own dispatch decision plus piggybacked acks.
    pub dfo_decision_out: (daq_channel::Sender<DfoDecision>, daq_channel::Receiver<DfoDecision>),
    /// Broker → DFO: periodic outstanding/completed snapshot.
    pub heartbeat: (daq_channel::Sender<DataflowHeartbeat>, daq_channel::Receiver<DataflowHeartbeat>),
    /// Broker → TRB: the active DFO's forwarded decision.
    pub trb_decision: (daq_channel::Sender<TriggerDecision>, daq_channel::Receiver<TriggerDecision>),
    /// DataWriter → Broker: completion credit.
    pub token: (daq_channel::Sender<TriggerDecisionToken>, daq_channel::Receiver<TriggerDecisionToken>),
    /// TRB → DataWriter: assembled trigger records.
    pub trigger_record: (daq_channel::Sender<TriggerRecord>, daq_channel::Receiver<TriggerRecord>),
    /// TPBundleHandler → DataWriter: aged time slices.
    pub timeslice: (daq_channel::Sender<TimeSlice>, daq_channel::Receiver<TimeSlice>),
}

impl InternalConnections {
    fn new() -> Self {
        Self {
            dfo_decision_in: daq_channel::bounded("dfo.decision_in", CHANNEL_CAPACITY),
            dfo_decision_out: daq_channel::bounded("broker.dfo_decision", CHANNEL_CAPACITY),
            heartbeat: daq_channel::bounded("dfo.heartbeat", CHANNEL_CAPACITY),
            trb_decision: daq_channel::bounded("trb.decision", CHANNEL_CAPACITY),
            token: daq_channel::bounded("broker.token", CHANNEL_CAPACITY),
            trigger_record: daq_channel::bounded("data_writer.trigger_record", CHANNEL_CAPACITY),
            timeslice: daq_channel::bounded("data_writer.timeslice", CHANNEL_CAPACITY),
        }
    }
}

/// The boundary connections an external trigger source, producer fleet, TP
/// source, and monitoring UI use to talk to this engine.
pub struct ExternalEndpoints {
    /// Send a [`TriggerDecision`] here to submit it to the dataflow core.
    pub trigger_decision_tx: daq_channel::Sender<TriggerDecision>,
    /// Busy/free throttle signal for the trigger source.
    pub trigger_inhibit_rx: daq_channel::Receiver<TriggerInhibit>,
    /// Every [`DataRequest`] the TRB emits, multiplexed onto one channel; a
    /// producer filters by `component.source_id`.
    pub data_request_rx: daq_channel::Receiver<DataRequest>,
    /// Producers reply with fragments here.
    pub fragment_input_tx: daq_channel::Sender<Fragment>,
    /// TP sources feed TPSets here.
    pub tpset_input_tx: daq_channel::Sender<TPSet>,
    /// Monitoring UIs register a live-copy request here.
    pub mon_request_tx: daq_channel::Sender<TrMonRequest>,
    /// Monitoring copies of completed trigger records, tagged with the
    /// `data_destination` the requester asked for.
    pub trigger_record_mon_rx: daq_channel::Receiver<(String, TriggerRecord)>,
}

pub(crate) struct Wiring {
    pub internal: InternalConnections,
    pub trigger_decision_in: (daq_channel::Sender<TriggerDecision>, daq_channel::Receiver<TriggerDecision>),
    pub trigger_inhibit_out: (daq_channel::Sender<TriggerInhibit>, daq_channel::Receiver<TriggerInhibit>),
    pub data_request_out: (daq_channel::Sender<DataRequest>, daq_channel::Receiver<DataRequest>),
    pub fragment_input: (daq_channel::Sender<Fragment>, daq_channel::Receiver<Fragment>),
    pub tpset_input: (daq_channel::Sender<TPSet>, daq_channel::Receiver<TPSet>),
    pub mon_request: (daq_channel::Sender<TrMonRequest>, daq_channel::Receiver<TrMonRequest>),
    pub trigger_record_mon: (daq_channel::Sender<(String, TriggerRecord)>, daq_channel::Receiver<(String, TriggerRecord)>),
}

impl Wiring {
    pub(crate) fn new() -> Self {
        Self {
            internal: InternalConnections::new(),
            trigger_decision_in: daq_channel::bounded("trigger_decision", CHANNEL_CAPACITY),
            trigger_inhibit_out: daq_channel::bounded("trigger_inhibit", CHANNEL_CAPACITY),
            data_request_out: daq_channel::bounded("data_request", CHANNEL_CAPACITY),
            fragment_input: daq_channel::bounded("fragment_input", CHANNEL_CAPACITY),
            tpset_input: daq_channel::bounded("tpset_input", CHANNEL_CAPACITY),
            mon_request: daq_channel::bounded("mon_request", CHANNEL_CAPACITY),
            trigger_record_mon: daq_channel::bounded("trigger_record_mon", CHANNEL_CAPACITY),
        }
    }
}
