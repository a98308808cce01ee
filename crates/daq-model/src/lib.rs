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

//! Data model shared by every component of the dataflow core: trigger
//! decisions, fragments, trigger records, trigger primitives, and the keys
//! used to address them in a storage sink.

use serde::{Deserialize, Serialize};

/// Monotonic per-run integer chosen by the run controller.
pub type RunNumber = u64;

/// Monotonic-within-a-run integer assigned by the trigger source.
pub type TriggerNumber = u64;

/// Index of a sub-slice within one trigger, in `[0, max_sequence_number]`.
pub type SequenceNumber = u32;

/// 64-bit detector-clock tick.
pub type Timestamp = u64;

/// Dense, run-local index of a TP time slice.
pub type SliceNumber = u64;

/// Bit set in [`TriggerRecordHeader::error_bits`] when the record is missing
/// one or more requested fragments.
pub const ERROR_BIT_INCOMPLETE: u32 = 0x1;

/// The subsystem half of a [`SourceId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    /// A readout producer.
    DetectorReadout,
    /// The trigger subsystem.
    Trigger,
    /// A trigger record builder instance.
    TRBuilder,
}

/// Address of a producer or consumer: a subsystem plus a numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceId {
    /// The subsystem this id belongs to.
    pub subsystem: Subsystem,
    /// The numeric id within the subsystem.
    pub id: u32,
}

impl SourceId {
    /// Creates a new source id.
    pub fn new(subsystem: Subsystem, id: u32) -> Self {
        Self { subsystem, id }
    }
}

/// One component's requested readout window within a [`TriggerDecision`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRequest {
    /// The producer this request targets.
    pub source_id: SourceId,
    /// Inclusive start of the requested window.
    pub window_begin: Timestamp,
    /// Exclusive end of the requested window.
    pub window_end: Timestamp,
}

impl ComponentRequest {
    /// Returns the width of the requested window.
    pub fn span(&self) -> u64 {
        self.window_end.saturating_sub(self.window_begin)
    }

    /// Clamps this request to `[begin, end)`, returning `None` if the result
    /// would not intersect the original window.
    pub fn clamped(&self, begin: Timestamp, end: Timestamp) -> Option<ComponentRequest> {
        let new_begin = self.window_begin.max(begin);
        let new_end = self.window_end.min(end);
        if new_begin >= new_end {
            return None;
        }
        Some(ComponentRequest {
            source_id: self.source_id,
            window_begin: new_begin,
            window_end: new_end,
        })
    }
}

/// The authoritative request to build one trigger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDecision {
    /// The trigger number, monotonic within the run.
    pub trigger_number: TriggerNumber,
    /// The run this decision belongs to.
    pub run_number: RunNumber,
    /// Detector-clock time of the trigger.
    pub trigger_timestamp: Timestamp,
    /// Bitmask of trigger types that fired.
    pub trigger_type: u64,
    /// Opaque readout type tag forwarded unchanged to requests and records.
    pub readout_type: String,
    /// The set of components to be read out.
    pub components: Vec<ComponentRequest>,
}

impl TriggerDecision {
    /// Returns the overall `[begin, end)` span covering every component.
    pub fn overall_span(&self) -> Option<(Timestamp, Timestamp)> {
        let begin = self.components.iter().map(|c| c.window_begin).min()?;
        let end = self.components.iter().map(|c| c.window_end).max()?;
        Some((begin, end))
    }
}

/// A [`TriggerDecision`] bound to exactly one builder connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedTriggerDecision {
    /// The decision being assigned.
    pub decision: TriggerDecision,
    /// The connection name of the builder this decision was assigned to.
    pub connection_name: String,
    /// Monotonic tick at which the assignment was made, used for latency
    /// accounting; not wall-clock time.
    pub assigned_time: Timestamp,
}

/// A request for one component's data, emitted per sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    /// The trigger this request belongs to.
    pub trigger_number: TriggerNumber,
    /// The sequence within the trigger.
    pub sequence_number: SequenceNumber,
    /// The run this request belongs to.
    pub run_number: RunNumber,
    /// Detector-clock time of the trigger.
    pub trigger_timestamp: Timestamp,
    /// Opaque readout type tag.
    pub readout_type: String,
    /// The (already sliced) component being requested.
    pub component: ComponentRequest,
    /// The reply address the producer must send its [`Fragment`] to.
    pub data_destination: String,
}

/// The kind of payload carried by a [`Fragment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentType {
    /// Ordinary readout payload.
    Payload,
    /// A placeholder fragment with no data (e.g. synthesized on timeout).
    Empty,
}

/// A producer's reply to one [`DataRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// The trigger this fragment belongs to.
    pub trigger_number: TriggerNumber,
    /// The sequence this fragment belongs to.
    pub sequence_number: SequenceNumber,
    /// The run this fragment belongs to.
    pub run_number: RunNumber,
    /// The producer that generated this fragment.
    pub element_id: SourceId,
    /// Inclusive start of the fragment's window.
    pub window_begin: Timestamp,
    /// Exclusive end of the fragment's window.
    pub window_end: Timestamp,
    /// Opaque readout payload.
    pub payload: Vec<u8>,
    /// The kind of payload carried.
    pub fragment_type: FragmentType,
    /// Producer-reported error bits.
    pub error_bits: u32,
}

/// The `(trigger_number, sequence_number, run_number)` triple that uniquely
/// identifies a [`TriggerRecord`] within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerId {
    /// The trigger number.
    pub trigger_number: TriggerNumber,
    /// The sequence number.
    pub sequence_number: SequenceNumber,
    /// The run number.
    pub run_number: RunNumber,
}

impl TriggerId {
    /// Creates a new trigger id.
    pub fn new(trigger_number: TriggerNumber, sequence_number: SequenceNumber, run_number: RunNumber) -> Self {
        Self {
            trigger_number,
            sequence_number,
            run_number,
        }
    }
}

/// Header fields of a [`TriggerRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRecordHeader {
    /// The trigger number.
    pub trigger_number: TriggerNumber,
    /// The sequence number.
    pub sequence_number: SequenceNumber,
    /// The highest sequence number for this trigger.
    pub max_sequence_number: SequenceNumber,
    /// The run number.
    pub run_number: RunNumber,
    /// Detector-clock time of the trigger.
    pub trigger_timestamp: Timestamp,
    /// Bitmask of trigger types that fired.
    pub trigger_type: u64,
    /// The TRB instance that assembled this record.
    pub element_id: SourceId,
    /// Error bits, see [`ERROR_BIT_INCOMPLETE`].
    pub error_bits: u32,
}

/// The assembled output of the trigger record builder: a header, the
/// fragments collected so far, and the set of requests that were expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRecord {
    /// The record's header.
    pub header: TriggerRecordHeader,
    /// Fragments collected for this record, in arrival order.
    pub fragments: Vec<Fragment>,
    /// The component requests this record expects fragments for.
    pub requested: Vec<ComponentRequest>,
}

impl TriggerRecord {
    /// A record is complete once every requested component has a fragment.
    pub fn is_complete(&self) -> bool {
        self.fragments.len() == self.requested.len()
    }

    /// Marks this record incomplete and accounts for the missing fragments.
    pub fn finalize_incomplete(&mut self) -> usize {
        let lost = self.requested.len() - self.fragments.len();
        self.header.error_bits |= ERROR_BIT_INCOMPLETE;
        lost
    }

    /// The trigger id of this record.
    pub fn trigger_id(&self) -> TriggerId {
        TriggerId::new(self.header.trigger_number, self.header.sequence_number, self.header.run_number)
    }
}

/// Completion credit sent from a writer back toward the DFO once a trigger
/// has been durably written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDecisionToken {
    /// The trigger number being acknowledged.
    pub trigger_number: TriggerNumber,
    /// The run number.
    pub run_number: RunNumber,
}

/// A dataflow decision forwarded from a DFO to the broker, piggybacking
/// completions the DFO has already acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DfoDecision {
    /// The DFO instance that produced this decision.
    pub dfo_id: String,
    /// The decision itself.
    pub decision: TriggerDecision,
    /// Trigger numbers the DFO has already acknowledged as completed.
    pub acknowledged_completions: Vec<TriggerNumber>,
}

/// Periodic broker-to-DFO snapshot of outstanding and completed triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataflowHeartbeat {
    /// The active run.
    pub run_number: RunNumber,
    /// The connection a DFO should use to send decisions back.
    pub decision_destination: String,
    /// Trigger numbers currently in flight.
    pub outstanding: Vec<TriggerNumber>,
    /// Trigger numbers completed since the previous heartbeat.
    pub recently_completed: Vec<TriggerNumber>,
}

/// A busy/free throttle signal sent from the DFO to the trigger source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInhibit {
    /// Whether the dataflow is currently busy.
    pub busy: bool,
    /// The active run.
    pub run_number: RunNumber,
}

/// Whether a [`TPSet`] carries real trigger primitives or is a liveness
/// heartbeat with an empty payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpSetKind {
    /// Carries trigger primitives.
    Payload,
    /// Carries no trigger primitives; used only to advance liveness.
    Heartbeat,
}

/// A single trigger primitive: a candidate hit reported by a readout source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPrimitive {
    /// The detector channel this primitive was observed on.
    pub channel: u32,
    /// Detector-clock start time of the primitive.
    pub time_start: Timestamp,
    /// Integrated ADC value of the primitive.
    pub adc_integral: u32,
}

impl TriggerPrimitive {
    /// Serializes this primitive to its fixed-width wire representation, used
    /// when concatenating TP arrays into a [`Fragment`] payload.
    pub fn to_bytes(self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&self.channel.to_le_bytes());
        buf[4..12].copy_from_slice(&self.time_start.to_le_bytes());
        buf[12..16].copy_from_slice(&self.adc_integral.to_le_bytes());
        buf
    }
}

/// A batch of trigger primitives covering `[start_time, end_time)` from one
/// source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TPSet {
    /// The source that produced this set.
    pub origin: SourceId,
    /// Monotonic-per-origin sequence number.
    pub seqno: u64,
    /// Inclusive start of the set's window.
    pub start_time: Timestamp,
    /// Exclusive end of the set's window.
    pub end_time: Timestamp,
    /// Whether this set carries primitives or is a liveness heartbeat.
    pub kind: TpSetKind,
    /// The trigger primitives, in arrival order.
    pub tps: Vec<TriggerPrimitive>,
}

/// A fixed-duration bucket of trigger primitives ready for durable writing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlice {
    /// The dense, run-local index of this slice.
    pub slice_number: SliceNumber,
    /// The run this slice belongs to.
    pub run_number: RunNumber,
    /// The TP bundle handler instance that produced this slice.
    pub element_id: SourceId,
    /// One fragment per contributing source, sorted by source id.
    pub fragments: Vec<Fragment>,
}

/// A live monitoring request for a copy of trigger records of a given type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrMonRequest {
    /// The trigger type bitmask this request matches against.
    pub trigger_type: u64,
    /// Where to send the monitoring copy.
    pub data_destination: String,
}

/// The detector-group classification used to resolve a [`StorageKey`]'s path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    /// The trigger record header group (no region/element nesting).
    TriggerRecordHeader,
    /// TPC detector readout.
    Tpc,
    /// Photon detection system readout.
    Pds,
    /// Trigger-subsystem data.
    Trigger,
    /// TPC trigger-primitive streams.
    TpcTp,
}

/// Addresses a single leaf object (a trigger record's header or one
/// fragment's data) in the storage sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageKey {
    /// The run number.
    pub run_number: RunNumber,
    /// The trigger (or slice) number.
    pub trigger_number: TriggerNumber,
    /// The sequence number, if any (`0` for single-sequence triggers).
    pub sequence_number: SequenceNumber,
    /// Whether this trigger has more than one sequence; controls whether the
    /// sequence number is appended to the path.
    pub has_sequences: bool,
    /// The detector-group classification.
    pub group_type: GroupType,
    /// The region within the group.
    pub region_number: u32,
    /// The element within the region.
    pub element_number: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_request_clamps_to_overlap() {
        let c = ComponentRequest {
            source_id: SourceId::new(Subsystem::DetectorReadout, 1),
            window_begin: 0,
            window_end: 250,
        };
        assert_eq!(c.clamped(100, 200).unwrap().window_begin, 100);
        assert_eq!(c.clamped(100, 200).unwrap().window_end, 200);
        assert!(c.clamped(300, 400).is_none());
    }

    #[test]
    fn trigger_record_completion() {
        let source_id = SourceId::new(Subsystem::DetectorReadout, 0);
        let mut tr = TriggerRecord {
            header: TriggerRecordHeader {
                trigger_number: 1,
                sequence_number: 0,
                max_sequence_number: 0,
                run_number: 1,
                trigger_timestamp: 0,
                trigger_type: 1,
                element_id: SourceId::new(Subsystem::TRBuilder, 0),
                error_bits: 0,
            },
            fragments: vec![],
            requested: vec![ComponentRequest {
                source_id,
                window_begin: 0,
                window_end: 10,
            }],
        };
        assert!(!tr.is_complete());
        let lost = tr.finalize_incomplete();
        assert_eq!(lost, 1);
        assert_eq!(tr.header.error_bits & ERROR_BIT_INCOMPLETE, ERROR_BIT_INCOMPLETE);
    }

    #[test]
    fn trigger_record_round_trips_through_yaml() {
        let tr = TriggerRecord {
            header: TriggerRecordHeader {
                trigger_number: 42,
                sequence_number: 0,
                max_sequence_number: 0,
                run_number: 7,
                trigger_timestamp: 1000,
                trigger_type: 3,
                element_id: SourceId::new(Subsystem::TRBuilder, 0),
                error_bits: 0,
            },
            fragments: vec![Fragment {
                trigger_number: 42,
                sequence_number: 0,
                run_number: 7,
                element_id: SourceId::new(Subsystem::DetectorReadout, 2),
                window_begin: 0,
                window_end: 10,
                payload: vec![1, 2, 3],
                fragment_type: FragmentType::Payload,
                error_bits: 0,
            }],
            requested: vec![],
        };

        let encoded = serde_yaml::to_string(&tr).unwrap();
        let decoded: TriggerRecord = serde_yaml::from_str(&encoded).unwrap();
        assert_eq!(tr, decoded);
    }
}
