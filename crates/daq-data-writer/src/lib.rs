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

//! The Data Writer (§4.6): turns [`TriggerRecord`]s and [`TimeSlice`]s into
//! `(StorageKey, payload)` write plans, applies the storage prescale, tracks
//! per-trigger sequence completion, and decides when a [`TriggerDecisionToken`]
//! should be emitted to close the credit loop with the DFO.
//!
//! Performs no storage I/O itself: `daq-engine` executes the write plan
//! against a `daq_storage_sink::StorageSink` with bounded exponential retry,
//! then reports success back via [`DataWriter::record_write_success`]. This
//! mirrors the split already used for `daq-dfo` and `daq-trb`.

use std::collections::HashMap;

use daq_model::{GroupType, RunNumber, SourceId, Subsystem, TimeSlice, TriggerDecisionToken, TriggerNumber, TriggerRecord};

/// Errors raised while planning a write.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A record or slice arrived for a run other than the one configured.
    #[error("trigger {trigger_number}: run {seen_run} does not match current run {current_run}")]
    WrongRun {
        /// The trigger or slice number of the rejected item.
        trigger_number: TriggerNumber,
        /// The run carried by the item.
        seen_run: RunNumber,
        /// The run this writer is configured for.
        current_run: RunNumber,
    },
    /// A header or fragment could not be encoded into a storage payload.
    #[error(transparent)]
    Encode(#[from] serde_yaml::Error),
}

/// One leaf write: the address and the encoded bytes to persist there.
pub type WriteItem = (daq_model::StorageKey, Vec<u8>);

/// What the caller should do with a [`TriggerRecord`] or [`TimeSlice`].
#[derive(Debug)]
pub enum WritePlan {
    /// The prescale, or storage being disabled, means this item is dropped
    /// without being written.
    Skip,
    /// Write every item, in order, then report success via
    /// [`DataWriter::record_write_success`].
    Write(Vec<WriteItem>),
}

struct SequenceProgress {
    seen: u32,
    max_sequence_number: u32,
}

/// Plans writes for trigger records and time slices, and tracks sequence
/// completion to decide token emission.
pub struct DataWriter {
    run_number: RunNumber,
    data_storage_prescale: u64,
    disable_data_storage: bool,
    trigger_decision_connection: String,
    records_received_tot: u64,
    sequence_progress: HashMap<TriggerNumber, SequenceProgress>,
}

impl DataWriter {
    /// Creates a writer for `run_number`. `data_storage_prescale` of `0` or
    /// `1` writes every record; `disable_data_storage` drops every record
    /// without writing (a dry run).
    pub fn new(run_number: RunNumber, data_storage_prescale: u64, disable_data_storage: bool, trigger_decision_connection: impl Into<String>) -> Self {
        Self {
            run_number,
            data_storage_prescale,
            disable_data_storage,
            trigger_decision_connection: trigger_decision_connection.into(),
            records_received_tot: 0,
            sequence_progress: HashMap::new(),
        }
    }

    /// The token sent at start to announce this writer's presence to the DFO,
    /// per §4.6.
    pub fn startup_token(&self) -> TriggerDecisionToken {
        TriggerDecisionToken {
            trigger_number: 0,
            run_number: 0,
        }
    }

    /// Number of trigger records seen so far, used by the prescale.
    pub fn records_received_tot(&self) -> u64 {
        self.records_received_tot
    }

    /// Decides what to do with `tr`: drop it (wrong run, prescaled out, or
    /// storage disabled) or write its header and fragments.
    pub fn plan_write(&mut self, tr: &TriggerRecord) -> Result<WritePlan, Error> {
        self.records_received_tot += 1;
        if tr.header.run_number != self.run_number {
            return Err(Error::WrongRun {
                trigger_number: tr.header.trigger_number,
                seen_run: tr.header.run_number,
                current_run: self.run_number,
            });
        }
        if self.disable_data_storage {
            return Ok(WritePlan::Skip);
        }
        if self.data_storage_prescale > 1 && self.records_received_tot % self.data_storage_prescale != 1 {
            return Ok(WritePlan::Skip);
        }

        let mut items = Vec::with_capacity(1 + tr.fragments.len());
        items.push((
            daq_model::StorageKey {
                run_number: tr.header.run_number,
                trigger_number: tr.header.trigger_number,
                sequence_number: tr.header.sequence_number,
                has_sequences: tr.header.max_sequence_number > 0,
                group_type: GroupType::TriggerRecordHeader,
                region_number: 0,
                element_number: 0,
            },
            serde_yaml::to_vec(&tr.header)?,
        ));
        for fragment in &tr.fragments {
            items.push((
                daq_model::StorageKey {
                    run_number: tr.header.run_number,
                    trigger_number: tr.header.trigger_number,
                    sequence_number: tr.header.sequence_number,
                    has_sequences: tr.header.max_sequence_number > 0,
                    group_type: group_type_of(fragment.element_id),
                    region_number: fragment.element_id.id,
                    element_number: 0,
                },
                serde_yaml::to_vec(fragment)?,
            ));
        }
        Ok(WritePlan::Write(items))
    }

    /// Decides what to do with `ts`: drop it (wrong run) or write one item
    /// per contributing fragment. Time slices carry no completion token.
    pub fn plan_write_timeslice(&self, ts: &TimeSlice) -> Result<WritePlan, Error> {
        if ts.run_number != self.run_number {
            return Err(Error::WrongRun {
                trigger_number: ts.slice_number,
                seen_run: ts.run_number,
                current_run: self.run_number,
            });
        }
        if self.disable_data_storage {
            return Ok(WritePlan::Skip);
        }
        let items = ts
            .fragments
            .iter()
            .map(|fragment| {
                Ok((
                    daq_model::StorageKey {
                        run_number: ts.run_number,
                        trigger_number: ts.slice_number,
                        sequence_number: 0,
                        has_sequences: false,
                        group_type: GroupType::TpcTp,
                        region_number: ts.element_id.id,
                        element_number: fragment.element_id.id,
                    },
                    serde_yaml::to_vec(fragment)?,
                ))
            })
            .collect::<Result<Vec<_>, serde_yaml::Error>>()?;
        Ok(WritePlan::Write(items))
    }

    /// Records that every item of `tr`'s write plan was durably written.
    /// Returns a [`TriggerDecisionToken`] once every sequence of the trigger
    /// has been seen; the per-trigger counter is dropped at that point, so a
    /// stray extra sequence arriving afterward cannot resurrect it.
    pub fn record_write_success(&mut self, tr: &TriggerRecord) -> Option<TriggerDecisionToken> {
        let progress = self.sequence_progress.entry(tr.header.trigger_number).or_insert(SequenceProgress {
            seen: 0,
            max_sequence_number: tr.header.max_sequence_number,
        });
        progress.seen += 1;
        if progress.seen >= progress.max_sequence_number + 1 {
            self.sequence_progress.remove(&tr.header.trigger_number);
            Some(TriggerDecisionToken {
                trigger_number: tr.header.trigger_number,
                run_number: tr.header.run_number,
            })
        } else {
            None
        }
    }

    /// The connection a completion token should be sent on.
    pub fn trigger_decision_connection(&self) -> &str {
        &self.trigger_decision_connection
    }
}

fn group_type_of(source_id: SourceId) -> GroupType {
    match source_id.subsystem {
        Subsystem::DetectorReadout => GroupType::Tpc,
        Subsystem::Trigger => GroupType::Trigger,
        Subsystem::TRBuilder => GroupType::Tpc,
    }
}

#[cfg(test)]
mod tests {
    use daq_model::{ComponentRequest, Fragment, FragmentType, TriggerRecordHeader};

    use super::*;

    fn header(trigger_number: u64, sequence_number: u32, max_sequence_number: u32) -> TriggerRecordHeader {
        TriggerRecordHeader {
            trigger_number,
            sequence_number,
            max_sequence_number,
            run_number: 1,
            trigger_timestamp: 0,
            trigger_type: 1,
            element_id: SourceId::new(Subsystem::TRBuilder, 0),
            error_bits: 0,
        }
    }

    fn record(trigger_number: u64, sequence_number: u32, max_sequence_number: u32) -> TriggerRecord {
        TriggerRecord {
            header: header(trigger_number, sequence_number, max_sequence_number),
            fragments: vec![Fragment {
                trigger_number,
                sequence_number,
                run_number: 1,
                element_id: SourceId::new(Subsystem::DetectorReadout, 0),
                window_begin: 0,
                window_end: 10,
                payload: vec![1, 2, 3],
                fragment_type: FragmentType::Payload,
                error_bits: 0,
            }],
            requested: vec![ComponentRequest {
                source_id: SourceId::new(Subsystem::DetectorReadout, 0),
                window_begin: 0,
                window_end: 10,
            }],
        }
    }

    #[test]
    fn single_sequence_trigger_emits_token_on_first_success() {
        let mut w = DataWriter::new(1, 0, false, "decisions");
        let tr = record(1, 0, 0);
        assert!(matches!(w.plan_write(&tr).unwrap(), WritePlan::Write(items) if items.len() == 2));
        let token = w.record_write_success(&tr).unwrap();
        assert_eq!(token.trigger_number, 1);
    }

    #[test]
    fn multi_sequence_trigger_waits_for_every_sequence() {
        let mut w = DataWriter::new(1, 0, false, "decisions");
        assert!(w.record_write_success(&record(5, 0, 2)).is_none());
        assert!(w.record_write_success(&record(5, 1, 2)).is_none());
        let token = w.record_write_success(&record(5, 2, 2)).unwrap();
        assert_eq!(token.trigger_number, 5);
    }

    #[test]
    fn wrong_run_is_rejected() {
        let mut w = DataWriter::new(1, 0, false, "decisions");
        let mut tr = record(1, 0, 0);
        tr.header.run_number = 2;
        assert!(matches!(w.plan_write(&tr), Err(Error::WrongRun { .. })));
    }

    #[test]
    fn disabled_storage_skips_every_write() {
        let mut w = DataWriter::new(1, 0, true, "decisions");
        assert!(matches!(w.plan_write(&record(1, 0, 0)).unwrap(), WritePlan::Skip));
    }

    #[test]
    fn prescale_keeps_only_every_nth_record() {
        let mut w = DataWriter::new(1, 3, false, "decisions");
        assert!(matches!(w.plan_write(&record(1, 0, 0)).unwrap(), WritePlan::Write(_)), "first record always written");
        assert!(matches!(w.plan_write(&record(2, 0, 0)).unwrap(), WritePlan::Skip));
        assert!(matches!(w.plan_write(&record(3, 0, 0)).unwrap(), WritePlan::Skip));
        assert!(matches!(w.plan_write(&record(4, 0, 0)).unwrap(), WritePlan::Write(_)));
    }

    #[test]
    fn stray_duplicate_sequence_after_completion_starts_a_fresh_counter() {
        let mut w = DataWriter::new(1, 0, false, "decisions");
        assert!(w.record_write_success(&record(1, 0, 1)).is_none());
        assert!(w.record_write_success(&record(1, 1, 1)).is_some());
        assert!(
            w.record_write_success(&record(1, 1, 1)).is_none(),
            "the removed entry's counter restarts from zero, so one stray sequence cannot complete it alone"
        );
    }
}
