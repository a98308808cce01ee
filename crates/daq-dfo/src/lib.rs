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

//! The Data Flow Orchestrator (§4.3): assigns incoming trigger decisions to
//! builders in round-robin order, aggregates per-builder busy state into a
//! single edge-triggered inhibit signal, and folds heartbeat completions
//! back into each builder's bookkeeping.

use std::collections::HashMap;

use daq_builder_state::BuilderState;
use daq_model::{DataflowHeartbeat, RunNumber, Timestamp, TriggerDecision, TriggerNumber};

/// Errors that can occur driving a [`Dfo`].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A decision or heartbeat carried a run number other than the active one.
    #[error("expected run {expected}, got run {got} from '{source}'")]
    UnexpectedRun {
        /// The source of the mismatched message (a builder name or "decision").
        source: String,
        /// The run number this DFO was configured with.
        expected: RunNumber,
        /// The run number the message carried.
        got: RunNumber,
    },

    /// Every builder was in error at the moment of dispatch; the caller
    /// retries forever (while running) rather than dropping the decision.
    #[error("unable to assign trigger {trigger_number}: every builder is in error")]
    UnableToAssign {
        /// The trigger that could not be assigned.
        trigger_number: TriggerNumber,
    },

    /// A decision was still outstanding at a builder when the run stopped;
    /// flushed without ever completing.
    #[error("trigger {trigger_number}/run {run_number}: incomplete trigger decision flushed on stop")]
    IncompleteTriggerDecision {
        /// The trigger number of the flushed assignment.
        trigger_number: TriggerNumber,
        /// The run number of the flushed assignment.
        run_number: RunNumber,
    },

    /// Assignment fell back to the least-loaded busy builder because every
    /// not-in-error builder was busy.
    #[error("trigger assigned to busy builder '{builder}'")]
    AssignedToBusyApp {
        /// The connection name of the busy builder the decision fell back to.
        builder: String,
    },

    /// Propagated from the targeted builder's own bookkeeping.
    #[error(transparent)]
    BuilderState(#[from] daq_builder_state::Error),
}

/// Outcome of [`Dfo::find_slot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// The builder at this index can take the decision, possibly pushing it
    /// into (or keeping it in) the busy state.
    Assigned(usize),
    /// Every builder is in error; no candidate exists.
    NoBuilderAvailable,
}

/// Assigns trigger decisions to builders and tracks their busy/free and
/// error state.
///
/// `Dfo` contains no I/O: callers drive it by feeding it decisions and
/// heartbeats and carrying out the dispatch/retry send loop around
/// [`find_slot`]/[`confirm_assignment`], matching the connection-oriented
/// send/receive boundary the rest of the dataflow core uses (§5).
///
/// [`find_slot`]: Dfo::find_slot
/// [`confirm_assignment`]: Dfo::confirm_assignment
#[derive(Debug)]
pub struct Dfo {
    dfo_id: String,
    run_number: RunNumber,
    builders: Vec<(String, BuilderState)>,
    cursor: usize,
    last_busy_signal: Option<bool>,
    received_by_type: HashMap<u8, u64>,
    completed_by_type: HashMap<u8, u64>,
}

impl Dfo {
    /// Creates a new `Dfo` for `run_number`, pre-populated with one
    /// `BuilderState` per `(connection_name, busy_threshold, free_threshold)`
    /// triple.
    pub fn new(
        dfo_id: impl Into<String>,
        run_number: RunNumber,
        builder_specs: impl IntoIterator<Item = (String, usize, usize)>,
    ) -> Result<Self, Error> {
        let mut builders = Vec::new();
        for (name, busy, free) in builder_specs {
            let state = BuilderState::new(name.clone(), busy, free)?;
            builders.push((name, state));
        }
        Ok(Self {
            dfo_id: dfo_id.into(),
            run_number,
            builders,
            cursor: 0,
            last_busy_signal: None,
            received_by_type: HashMap::new(),
            completed_by_type: HashMap::new(),
        })
    }

    /// The run this orchestrator is assigning decisions for.
    pub fn run_number(&self) -> RunNumber {
        self.run_number
    }

    /// Number of builders currently tracked, including ones in error.
    pub fn builder_count(&self) -> usize {
        self.builders.len()
    }

    /// Scans for a builder to receive the next decision.
    ///
    /// Advances the internal cursor by one position (wrapping), then scans
    /// up to `builders.len()` candidates starting there. The first
    /// not-in-error, not-busy builder found is returned immediately and the
    /// cursor is left on it. If every candidate is busy, the least-loaded
    /// not-in-error builder is returned instead (overflow assignment). If
    /// every builder is in error, returns [`Slot::NoBuilderAvailable`].
    pub fn find_slot(&mut self) -> Slot {
        let n = self.builders.len();
        if n == 0 {
            return Slot::NoBuilderAvailable;
        }

        self.cursor = (self.cursor + 1) % n;

        let mut least_loaded: Option<(usize, usize)> = None;
        for offset in 0..n {
            let idx = (self.cursor + offset) % n;
            let (_, state) = &self.builders[idx];
            if state.is_in_error() {
                continue;
            }
            if !state.is_busy() {
                self.cursor = idx;
                return Slot::Assigned(idx);
            }
            if least_loaded.map(|(_, len)| state.outstanding_len() < len).unwrap_or(true) {
                least_loaded = Some((idx, state.outstanding_len()));
            }
        }

        match least_loaded {
            Some((idx, _)) => {
                let err = Error::AssignedToBusyApp {
                    builder: self.builders[idx].0.clone(),
                };
                tracing::warn!(%err);
                Slot::Assigned(idx)
            }
            None => Slot::NoBuilderAvailable,
        }
    }

    /// The connection name of the builder at `idx`, for dispatch.
    pub fn builder_name(&self, idx: usize) -> &str {
        &self.builders[idx].0
    }

    /// Validates `decision.run_number` and records its trigger-type bits as
    /// received, ahead of dispatch.
    pub fn accept_decision(&mut self, decision: &TriggerDecision) -> Result<(), Error> {
        if decision.run_number != self.run_number {
            return Err(Error::UnexpectedRun {
                source: "decision".into(),
                expected: self.run_number,
                got: decision.run_number,
            });
        }
        record_type_bits(&mut self.received_by_type, decision.trigger_type);
        Ok(())
    }

    /// Drains the builder's to-be-acknowledged completions for piggybacking
    /// onto the outgoing `DFODecision` for the builder at `idx`.
    pub fn take_acknowledged_completions(&mut self, idx: usize) -> Vec<TriggerNumber> {
        self.builders[idx].1.extract_ack_list()
    }

    /// Called once the dispatch send for the builder at `idx` has succeeded:
    /// records the assignment in that builder's outstanding list.
    pub fn confirm_assignment(&mut self, idx: usize, decision: TriggerDecision, now: Timestamp) -> Result<(), Error> {
        let (_, state) = &mut self.builders[idx];
        let atd = state.make_assignment(decision, now);
        state.add_assignment(atd)?;
        Ok(())
    }

    /// Called once the dispatch send for the builder at `idx` has
    /// permanently failed (retries exhausted): marks the builder in error so
    /// future [`find_slot`] calls skip it.
    ///
    /// [`find_slot`]: Dfo::find_slot
    pub fn mark_builder_failed(&mut self, idx: usize) {
        self.builders[idx].1.mark_in_error();
    }

    /// Folds a heartbeat from `source` into that builder's bookkeeping,
    /// hot-plugging a new [`BuilderState`] at `default_thresholds` if
    /// `source` is not yet known. Returns the trigger numbers successfully
    /// completed.
    ///
    /// The heartbeat payload carries no sender identity of its own (§3); the
    /// caller supplies `source` from whichever connection the heartbeat
    /// arrived on, matching how the rest of the dataflow core attributes
    /// inbound messages to a peer (see `DESIGN.md`).
    pub fn ingest_heartbeat(
        &mut self,
        source: impl Into<String>,
        heartbeat: DataflowHeartbeat,
        default_thresholds: (usize, usize),
        now: Timestamp,
    ) -> Result<Vec<TriggerNumber>, Error> {
        let source = source.into();
        if heartbeat.run_number != self.run_number {
            return Err(Error::UnexpectedRun {
                source,
                expected: self.run_number,
                got: heartbeat.run_number,
            });
        }

        let idx = match self.builders.iter().position(|(name, _)| name == &source) {
            Some(idx) => idx,
            None => {
                let (busy, free) = default_thresholds;
                let state = BuilderState::new(source.clone(), busy, free)?;
                tracing::info!(builder = %source, "hot-plugged builder from heartbeat");
                self.builders.push((source.clone(), state));
                self.builders.len() - 1
            }
        };

        let mut completed = Vec::new();
        for trigger_number in &heartbeat.recently_completed {
            let (_, state) = &mut self.builders[idx];
            let mut trigger_type = None;
            match state.complete(*trigger_number, now, |atd| trigger_type = Some(atd.decision.trigger_type)) {
                Ok(_) => {
                    if let Some(tt) = trigger_type {
                        record_type_bits(&mut self.completed_by_type, tt);
                    }
                    completed.push(*trigger_number);
                }
                Err(daq_builder_state::Error::AssignmentNotFound { .. }) => {
                    tracing::warn!(trigger_number, builder = %source, "heartbeat reported completion of unknown trigger");
                }
                Err(other) => return Err(other.into()),
            }
        }

        self.builders[idx].1.update_ack_list(heartbeat.recently_completed.iter().copied());
        Ok(completed)
    }

    /// Whether every builder (there must be at least one) is currently busy.
    pub fn all_busy(&self) -> bool {
        !self.builders.is_empty() && self.builders.iter().all(|(_, state)| state.is_busy())
    }

    /// Re-evaluates the aggregate busy signal and returns `Some(busy)` only
    /// when it has flipped since the last call (edge-triggered), so the
    /// caller emits a `TriggerInhibit` only on transitions.
    pub fn busy_signal_edge(&mut self) -> Option<bool> {
        let busy = self.all_busy();
        if self.last_busy_signal == Some(busy) {
            return None;
        }
        self.last_busy_signal = Some(busy);
        Some(busy)
    }

    /// Flushes every builder's outstanding list, returning one
    /// [`Error::IncompleteTriggerDecision`] per assignment that was still in
    /// flight. Called on stop.
    pub fn flush_all(&mut self) -> Vec<Error> {
        self.last_busy_signal = None;
        self.builders
            .iter_mut()
            .flat_map(|(_, state)| state.flush())
            .map(|atd| Error::IncompleteTriggerDecision {
                trigger_number: atd.decision.trigger_number,
                run_number: atd.decision.run_number,
            })
            .collect()
    }

    /// A snapshot of received/completed counts per trigger-type bit, for
    /// monitoring.
    pub fn type_counters(&self) -> (&HashMap<u8, u64>, &HashMap<u8, u64>) {
        (&self.received_by_type, &self.completed_by_type)
    }
}

fn record_type_bits(counters: &mut HashMap<u8, u64>, mask: u64) {
    for bit in 0..64u8 {
        if mask & (1u64 << bit) != 0 {
            *counters.entry(bit).or_insert(0) += 1;
        }
    }
}
