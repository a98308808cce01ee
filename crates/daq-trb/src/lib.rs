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

//! The Trigger Record Builder (§4.5): splits each incoming [`TriggerDecision`]
//! into one or more time-windowed sequences, emits a [`DataRequest`] per
//! sliced component, collects the resulting [`Fragment`]s, and assembles the
//! finished [`TriggerRecord`]s.
//!
//! Performs no I/O of its own: `daq-engine` feeds it decisions and fragments
//! and drives the actual request/record channel sends, matching the split
//! already used for `daq-dfo` and `daq-tp-bundle`.

use std::collections::BTreeMap;

use daq_model::{
    ComponentRequest, DataRequest, Fragment, RunNumber, SequenceNumber, SourceId, Timestamp, TrMonRequest,
    TriggerDecision, TriggerId, TriggerNumber, TriggerRecord, TriggerRecordHeader,
};

/// Errors raised while building trigger records.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A decision arrived for a run other than the one this instance was
    /// configured for.
    #[error("trigger {trigger_number}: decision run {decision_run} does not match current run {current_run}")]
    UnexpectedTriggerDecision {
        /// The trigger number of the rejected decision.
        trigger_number: TriggerNumber,
        /// The run carried by the decision.
        decision_run: RunNumber,
        /// The run this instance is configured for.
        current_run: RunNumber,
    },
    /// A decision carried no components, so no span could be computed.
    #[error("trigger {trigger_number}: decision has no components")]
    EmptyTriggerDecision {
        /// The trigger number of the rejected decision.
        trigger_number: TriggerNumber,
    },
    /// A fragment arrived for a trigger id this instance has no record of, or
    /// from a source that was not part of that record's requested components.
    #[error("fragment from {source:?} does not match any requested component of trigger {trigger_number}/{sequence_number}/{run_number}")]
    UnexpectedFragment {
        /// The trigger number carried by the fragment.
        trigger_number: TriggerNumber,
        /// The sequence number carried by the fragment.
        sequence_number: SequenceNumber,
        /// The run number carried by the fragment.
        run_number: RunNumber,
        /// The source that sent the fragment.
        source: SourceId,
    },

    /// A decision produced a sequence that was already tracked; the
    /// duplicate is discarded and the original is left untouched.
    #[error("trigger {trigger_number}/{sequence_number}/{run_number}: duplicated trigger decision ignored")]
    DuplicatedTriggerDecision {
        /// The trigger number of the duplicated sequence.
        trigger_number: TriggerNumber,
        /// The sequence number of the duplicated sequence.
        sequence_number: SequenceNumber,
        /// The run number of the duplicated sequence.
        run_number: RunNumber,
    },

    /// A record sat open longer than the configured trigger timeout without
    /// completing and was evicted.
    #[error("trigger {trigger_number}/{sequence_number}/{run_number}: timed out waiting for fragments")]
    TimedOutTriggerDecision {
        /// The trigger number of the timed-out record.
        trigger_number: TriggerNumber,
        /// The sequence number of the timed-out record.
        sequence_number: SequenceNumber,
        /// The run number of the timed-out record.
        run_number: RunNumber,
    },

    /// A completed record's send to the data writer failed permanently and
    /// was abandoned rather than retried forever.
    #[error("trigger {trigger_number}/{sequence_number}/{run_number}: abandoned after send to data writer failed")]
    AbandonedTriggerDecision {
        /// The trigger number of the abandoned record.
        trigger_number: TriggerNumber,
        /// The sequence number of the abandoned record.
        sequence_number: SequenceNumber,
        /// The run number of the abandoned record.
        run_number: RunNumber,
    },
}

struct Entry {
    record: TriggerRecord,
    created_at: Timestamp,
}

/// Splits trigger decisions into sequences, collects fragments, assembles
/// trigger records.
pub struct Trb {
    element_id: SourceId,
    run_number: RunNumber,
    max_time_window: u64,
    trigger_timeout: u64,
    data_destination: String,
    records: BTreeMap<TriggerId, Entry>,
    mon_requests: Vec<TrMonRequest>,
    abandoned: u64,
}

impl Trb {
    /// Creates a new builder for `run_number`. `max_time_window` of `0` means
    /// every decision becomes exactly one sequence; `trigger_timeout` of `0`
    /// disables timeout-based eviction.
    pub fn new(element_id: SourceId, run_number: RunNumber, max_time_window: u64, trigger_timeout: u64, data_destination: impl Into<String>) -> Self {
        Self {
            element_id,
            run_number,
            max_time_window,
            trigger_timeout,
            data_destination: data_destination.into(),
            records: BTreeMap::new(),
            mon_requests: Vec::new(),
            abandoned: 0,
        }
    }

    /// Registers a standing subscription for monitoring copies of completed
    /// trigger records whose `trigger_type` bitmask intersects `req`'s.
    pub fn register_mon_request(&mut self, req: TrMonRequest) {
        self.mon_requests.push(req);
    }

    /// Number of trigger records currently being assembled.
    pub fn pending_len(&self) -> usize {
        self.records.len()
    }

    /// Number of trigger records abandoned because sending the finished
    /// record downstream failed permanently; see [`Trb::mark_abandoned`].
    pub fn abandoned_count(&self) -> u64 {
        self.abandoned
    }

    /// Splits `decision` into sequences and returns the [`DataRequest`]s to
    /// dispatch for each sliced component. A sequence whose `TriggerId` is
    /// already tracked is skipped (and logged) rather than aborting the rest
    /// of the decision.
    pub fn ingest_decision(&mut self, decision: TriggerDecision, now: Timestamp) -> Result<Vec<DataRequest>, Error> {
        if decision.run_number != self.run_number {
            return Err(Error::UnexpectedTriggerDecision {
                trigger_number: decision.trigger_number,
                decision_run: decision.run_number,
                current_run: self.run_number,
            });
        }
        let (begin, end) = decision.overall_span().ok_or(Error::EmptyTriggerDecision {
            trigger_number: decision.trigger_number,
        })?;
        let width = end - begin;
        let max_sequence_number = if self.max_time_window > 0 && width > 0 {
            ((width - 1) / self.max_time_window) as SequenceNumber
        } else {
            0
        };

        let mut requests = Vec::new();
        for sequence_number in 0..=max_sequence_number {
            let trigger_id = TriggerId::new(decision.trigger_number, sequence_number, decision.run_number);
            if self.records.contains_key(&trigger_id) {
                let err = Error::DuplicatedTriggerDecision {
                    trigger_number: decision.trigger_number,
                    sequence_number,
                    run_number: decision.run_number,
                };
                tracing::warn!(%err);
                continue;
            }

            let (slice_begin, slice_end) = if self.max_time_window > 0 {
                let slice_begin = begin + u64::from(sequence_number) * self.max_time_window;
                (slice_begin, (slice_begin + self.max_time_window).min(end))
            } else {
                (begin, end)
            };

            let sliced: Vec<ComponentRequest> = decision
                .components
                .iter()
                .filter_map(|c| c.clamped(slice_begin, slice_end))
                .collect();

            for component in &sliced {
                requests.push(DataRequest {
                    trigger_number: decision.trigger_number,
                    sequence_number,
                    run_number: decision.run_number,
                    trigger_timestamp: decision.trigger_timestamp,
                    readout_type: decision.readout_type.clone(),
                    component: component.clone(),
                    data_destination: self.data_destination.clone(),
                });
            }

            let record = TriggerRecord {
                header: TriggerRecordHeader {
                    trigger_number: decision.trigger_number,
                    sequence_number,
                    max_sequence_number,
                    run_number: decision.run_number,
                    trigger_timestamp: decision.trigger_timestamp,
                    trigger_type: decision.trigger_type,
                    element_id: self.element_id,
                    error_bits: 0,
                },
                fragments: Vec::new(),
                requested: sliced,
            };
            self.records.insert(trigger_id, Entry { record, created_at: now });
        }

        Ok(requests)
    }

    /// Folds `fragment` into the trigger record it belongs to. Fails if no
    /// such record is tracked, or if the fragment's source is not among that
    /// record's requested components.
    pub fn ingest_fragment(&mut self, fragment: Fragment) -> Result<bool, Error> {
        let trigger_id = TriggerId::new(fragment.trigger_number, fragment.sequence_number, fragment.run_number);
        let unexpected = || Error::UnexpectedFragment {
            trigger_number: fragment.trigger_number,
            sequence_number: fragment.sequence_number,
            run_number: fragment.run_number,
            source: fragment.element_id,
        };
        let entry = self.records.get_mut(&trigger_id).ok_or_else(unexpected)?;
        if !entry.record.requested.iter().any(|c| c.source_id == fragment.element_id) {
            return Err(unexpected());
        }
        entry.record.fragments.push(fragment);
        Ok(entry.record.is_complete())
    }

    /// Trigger ids whose records have collected every requested fragment.
    pub fn completed_ids(&self) -> Vec<TriggerId> {
        self.records
            .iter()
            .filter(|(_, entry)| entry.record.is_complete())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Trigger ids whose records have been open longer than the configured
    /// timeout. Returns nothing if timeouts are disabled.
    pub fn check_stale(&self, now: Timestamp) -> Vec<TriggerId> {
        if self.trigger_timeout == 0 {
            return Vec::new();
        }
        self.records
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.created_at) > self.trigger_timeout)
            .map(|(id, _)| {
                let err = Error::TimedOutTriggerDecision {
                    trigger_number: id.trigger_number,
                    sequence_number: id.sequence_number,
                    run_number: id.run_number,
                };
                tracing::warn!(%err);
                *id
            })
            .collect()
    }

    /// Removes and returns the record for `trigger_id`, marking it incomplete
    /// first if it has not collected every requested fragment. Returns the
    /// record together with the monitoring destinations subscribed to its
    /// `trigger_type`.
    pub fn extract(&mut self, trigger_id: TriggerId) -> Option<(TriggerRecord, Vec<String>)> {
        let entry = self.records.remove(&trigger_id)?;
        let mut record = entry.record;
        if !record.is_complete() {
            record.finalize_incomplete();
        }
        let mon_destinations = self
            .mon_requests
            .iter()
            .filter(|req| req.trigger_type & record.header.trigger_type != 0)
            .map(|req| req.data_destination.clone())
            .collect();
        Some((record, mon_destinations))
    }

    /// Every trigger id still open, for draining on shutdown.
    pub fn drain_ids(&self) -> Vec<TriggerId> {
        self.records.keys().copied().collect()
    }

    /// Records that a completed record's downstream send failed permanently
    /// and was abandoned rather than retried forever.
    pub fn mark_abandoned(&mut self, trigger_number: TriggerNumber, sequence_number: SequenceNumber, run_number: RunNumber) {
        let err = Error::AbandonedTriggerDecision {
            trigger_number,
            sequence_number,
            run_number,
        };
        tracing::error!(%err);
        self.abandoned += 1;
    }
}
