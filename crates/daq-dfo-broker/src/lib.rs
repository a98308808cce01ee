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

//! The DFO Broker (§4.2): lets several redundant DFO instances share a
//! single decision stream to the downstream builder and a single periodic
//! dataflow heartbeat, without any of them needing to know about the others.

use std::collections::{BTreeSet, HashMap};

use daq_model::{DataflowHeartbeat, DfoDecision, RunNumber, TriggerDecision, TriggerDecisionToken};

/// Errors that can occur driving a [`DfoBroker`].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An inbound message carried a run number other than the active one.
    #[error("expected run {expected}, got run {got} from '{source}'")]
    RunMismatch {
        /// Where the mismatched message came from.
        source: String,
        /// The run number this broker was configured with.
        expected: RunNumber,
        /// The run number the message carried.
        got: RunNumber,
    },

    /// A `DFODecision` named a `dfo_id` this broker has no record of.
    #[error("DFODecision from unknown DFO '{dfo_id}'")]
    UnknownDfo {
        /// The unrecognized DFO id.
        dfo_id: String,
    },
}

#[derive(Debug, Default)]
struct DfoInfo {
    is_active: bool,
    recent_completions: BTreeSet<daq_model::TriggerNumber>,
}

/// Multiplexes N redundant DFO instances behind one downstream decision
/// stream and one periodic heartbeat.
///
/// Like [`daq_dfo::Dfo`](../daq_dfo/struct.Dfo.html), this type performs no
/// I/O itself; `daq-engine` drives it with inbound tokens/decisions and
/// carries out the bounded-timeout sends its return values call for.
#[derive(Debug)]
pub struct DfoBroker {
    run_number: RunNumber,
    decision_destination: String,
    dfo_info: HashMap<String, DfoInfo>,
    outstanding_decisions: BTreeSet<daq_model::TriggerNumber>,
}

impl DfoBroker {
    /// Creates a new broker for `run_number`, tracking exactly the DFO ids in
    /// `dfo_ids`. `decision_destination` is the connection name DFOs must use
    /// to send their `DFODecision`s, advertised verbatim in every heartbeat.
    pub fn new(dfo_ids: impl IntoIterator<Item = String>, run_number: RunNumber, decision_destination: impl Into<String>) -> Self {
        Self {
            run_number,
            decision_destination: decision_destination.into(),
            dfo_info: dfo_ids.into_iter().map(|id| (id, DfoInfo::default())).collect(),
            outstanding_decisions: BTreeSet::new(),
        }
    }

    /// The run this broker is multiplexing decisions for.
    pub fn run_number(&self) -> RunNumber {
        self.run_number
    }

    /// Number of trigger decisions currently in flight across every DFO.
    pub fn outstanding_len(&self) -> usize {
        self.outstanding_decisions.len()
    }

    /// Whether `dfo_id` is known to this broker.
    pub fn knows_dfo(&self, dfo_id: &str) -> bool {
        self.dfo_info.contains_key(dfo_id)
    }

    /// Whether `dfo_id` is currently the active DFO.
    pub fn is_dfo_active(&self, dfo_id: &str) -> bool {
        self.dfo_info.get(dfo_id).map(|info| info.is_active).unwrap_or(false)
    }

    /// Marks exactly `dfo_id` active; every other tracked DFO becomes
    /// inactive. A `dfo_id` this broker has no record of is a silent no-op,
    /// matching the original `enable_dfo` command (a misconfigured operator
    /// command should not crash the broker).
    pub fn enable_dfo(&mut self, dfo_id: &str) {
        for (id, info) in self.dfo_info.iter_mut() {
            info.is_active = id == dfo_id;
        }
        tracing::info!(dfo_id, "active DFO changed");
    }

    /// Folds a completion token from a writer into every tracked DFO's
    /// recent-completions set and clears the trigger from the outstanding
    /// set. Returns an error (and does nothing else) on a run mismatch.
    pub fn ingest_token(&mut self, token: TriggerDecisionToken) -> Result<(), Error> {
        if token.run_number != self.run_number {
            return Err(Error::RunMismatch {
                source: "token".into(),
                expected: self.run_number,
                got: token.run_number,
            });
        }
        self.outstanding_decisions.remove(&token.trigger_number);
        for info in self.dfo_info.values_mut() {
            info.recent_completions.insert(token.trigger_number);
        }
        Ok(())
    }

    /// Folds a `DFODecision` from a DFO into the broker's bookkeeping,
    /// clearing its acknowledged completions from that DFO's recent set and,
    /// if the DFO is currently active, returning the `TriggerDecision` to be
    /// forwarded to the downstream builder connection.
    pub fn ingest_dfo_decision(&mut self, decision: DfoDecision) -> Result<Option<TriggerDecision>, Error> {
        if decision.decision.run_number != self.run_number {
            return Err(Error::RunMismatch {
                source: decision.dfo_id,
                expected: self.run_number,
                got: decision.decision.run_number,
            });
        }
        let info = self
            .dfo_info
            .get_mut(&decision.dfo_id)
            .ok_or_else(|| Error::UnknownDfo { dfo_id: decision.dfo_id.clone() })?;

        for ack in &decision.acknowledged_completions {
            info.recent_completions.remove(ack);
        }

        if info.is_active {
            self.outstanding_decisions.insert(decision.decision.trigger_number);
            Ok(Some(decision.decision))
        } else {
            Ok(None)
        }
    }

    /// Builds the next heartbeat snapshot: the full outstanding set and the
    /// union of every DFO's recent completions, both in ascending order.
    pub fn build_heartbeat(&self) -> DataflowHeartbeat {
        let mut recently_completed: BTreeSet<daq_model::TriggerNumber> = BTreeSet::new();
        for info in self.dfo_info.values() {
            recently_completed.extend(info.recent_completions.iter().copied());
        }
        DataflowHeartbeat {
            run_number: self.run_number,
            decision_destination: self.decision_destination.clone(),
            outstanding: self.outstanding_decisions.iter().copied().collect(),
            recently_completed: recently_completed.into_iter().collect(),
        }
    }

    /// Resets every tracked DFO to inactive with an empty completions set,
    /// keeping the same set of known ids. Called on stop.
    pub fn reset_for_stop(&mut self) {
        for info in self.dfo_info.values_mut() {
            *info = DfoInfo::default();
        }
    }

    /// Clears every tracked DFO entirely. Called on scrap.
    pub fn scrap(&mut self) {
        self.dfo_info.clear();
        self.outstanding_decisions.clear();
    }
}

#[cfg(test)]
mod tests {
    use daq_model::{ComponentRequest, SourceId, Subsystem};

    use super::*;

    fn decision(trigger_number: u64, run_number: RunNumber) -> TriggerDecision {
        TriggerDecision {
            trigger_number,
            run_number,
            trigger_timestamp: 0,
            trigger_type: 1,
            readout_type: "default".into(),
            components: vec![ComponentRequest {
                source_id: SourceId::new(Subsystem::DetectorReadout, 0),
                window_begin: 0,
                window_end: 10,
            }],
        }
    }

    fn broker() -> DfoBroker {
        let mut b = DfoBroker::new(["dfo0".to_string(), "dfo1".to_string()], 1, "dfod.in".into());
        b.enable_dfo("dfo0");
        b
    }

    #[test]
    fn only_named_dfo_is_active() {
        let b = broker();
        assert!(b.is_dfo_active("dfo0"));
        assert!(!b.is_dfo_active("dfo1"));
    }

    #[test]
    fn decision_from_active_dfo_is_forwarded_and_tracked_outstanding() {
        let mut b = broker();
        let forwarded = b
            .ingest_dfo_decision(DfoDecision {
                dfo_id: "dfo0".into(),
                decision: decision(1, 1),
                acknowledged_completions: vec![],
            })
            .unwrap();
        assert!(forwarded.is_some());
        assert_eq!(b.outstanding_len(), 1);
    }

    #[test]
    fn decision_from_inactive_dfo_is_not_forwarded() {
        let mut b = broker();
        let forwarded = b
            .ingest_dfo_decision(DfoDecision {
                dfo_id: "dfo1".into(),
                decision: decision(1, 1),
                acknowledged_completions: vec![],
            })
            .unwrap();
        assert!(forwarded.is_none());
        assert_eq!(b.outstanding_len(), 0);
    }

    #[test]
    fn unknown_dfo_is_an_error() {
        let mut b = broker();
        let err = b
            .ingest_dfo_decision(DfoDecision {
                dfo_id: "dfo9".into(),
                decision: decision(1, 1),
                acknowledged_completions: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDfo { .. }));
    }

    #[test]
    fn token_clears_outstanding_and_marks_every_dfo_completed() {
        let mut b = broker();
        b.ingest_dfo_decision(DfoDecision {
            dfo_id: "dfo0".into(),
            decision: decision(1, 1),
            acknowledged_completions: vec![],
        })
        .unwrap();

        b.ingest_token(TriggerDecisionToken { trigger_number: 1, run_number: 1 }).unwrap();
        assert_eq!(b.outstanding_len(), 0);

        let hb = b.build_heartbeat();
        assert_eq!(hb.recently_completed, vec![1]);
    }

    #[test]
    fn acknowledged_completions_are_cleared_per_dfo() {
        let mut b = broker();
        b.ingest_token(TriggerDecisionToken { trigger_number: 5, run_number: 1 }).unwrap();
        assert_eq!(b.build_heartbeat().recently_completed, vec![5]);

        b.ingest_dfo_decision(DfoDecision {
            dfo_id: "dfo0".into(),
            decision: decision(2, 1),
            acknowledged_completions: vec![5],
        })
        .unwrap();

        // dfo0's copy of the completion is gone, but dfo1's remains.
        assert_eq!(b.build_heartbeat().recently_completed, vec![5]);
    }

    #[test]
    fn run_mismatch_is_rejected() {
        let mut b = broker();
        let err = b.ingest_token(TriggerDecisionToken { trigger_number: 1, run_number: 99 }).unwrap_err();
        assert!(matches!(err, Error::RunMismatch { .. }));
    }

    #[test]
    fn reset_for_stop_clears_state_but_keeps_known_dfos() {
        let mut b = broker();
        b.ingest_token(TriggerDecisionToken { trigger_number: 1, run_number: 1 }).unwrap();
        b.reset_for_stop();
        assert!(!b.is_dfo_active("dfo0"));
        assert!(b.knows_dfo("dfo0"));
        assert!(b.build_heartbeat().recently_completed.is_empty());
    }
}
