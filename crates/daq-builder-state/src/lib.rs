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

//! Per-builder bookkeeping used by the DFO (§4.1): the outstanding
//! assignment list, busy/free hysteresis, the completion-acknowledgement
//! set, and a bounded latency ring buffer.

use std::collections::{HashSet, VecDeque};

use daq_model::{AssignedTriggerDecision, Timestamp, TriggerDecision, TriggerNumber};

/// Number of entries kept in the latency ring buffer before the oldest is
/// dropped.
const LATENCY_BUFFER_CAPACITY: usize = 1000;

/// Errors that can occur operating on a [`BuilderState`].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The builder has no slots available because it is in error.
    #[error("no slots available on builder '{connection_name}' (in error)")]
    NoSlotsAvailable {
        /// The builder's connection name.
        connection_name: String,
    },

    /// A trigger number that should be outstanding could not be found.
    #[error("assignment for trigger {trigger_number} not found on builder '{connection_name}'")]
    AssignmentNotFound {
        /// The builder's connection name.
        connection_name: String,
        /// The trigger number that was not found.
        trigger_number: TriggerNumber,
    },

    /// `busy_threshold` was configured below `free_threshold`.
    #[error("builder '{connection_name}' configured with busy_threshold ({busy}) < free_threshold ({free})")]
    InvalidThresholds {
        /// The builder's connection name.
        connection_name: String,
        /// The configured busy threshold.
        busy: usize,
        /// The configured free threshold.
        free: usize,
    },
}

/// One (completion_time, service_time) sample in the latency ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    /// When the assignment completed.
    pub completion_time: Timestamp,
    /// How long the assignment was outstanding.
    pub service_time: Timestamp,
}

/// Per-builder bookkeeping: outstanding assignments, busy/free hysteresis,
/// completion acknowledgements, and latency stats.
#[derive(Debug)]
pub struct BuilderState {
    connection_name: String,
    busy_threshold: usize,
    free_threshold: usize,
    outstanding: Vec<AssignedTriggerDecision>,
    is_in_error: bool,
    is_busy: bool,
    to_be_acknowledged: HashSet<TriggerNumber>,
    latency: VecDeque<LatencySample>,
}

impl BuilderState {
    /// Creates a new `BuilderState` for a builder at `connection_name`.
    ///
    /// Fails with [`Error::InvalidThresholds`] if `busy_threshold <
    /// free_threshold`; this mirrors the fatal configuration check of §7,
    /// kept here as a defense-in-depth check for builders hot-plugged from
    /// an unvalidated heartbeat (§4.3).
    pub fn new(connection_name: impl Into<String>, busy_threshold: usize, free_threshold: usize) -> Result<Self, Error> {
        let connection_name = connection_name.into();
        if busy_threshold < free_threshold {
            return Err(Error::InvalidThresholds {
                connection_name,
                busy: busy_threshold,
                free: free_threshold,
            });
        }
        Ok(Self {
            connection_name,
            busy_threshold,
            free_threshold,
            outstanding: Vec::new(),
            is_in_error: false,
            is_busy: false,
            to_be_acknowledged: HashSet::new(),
            latency: VecDeque::with_capacity(LATENCY_BUFFER_CAPACITY),
        })
    }

    /// The connection name of the builder this state tracks.
    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    /// Number of trigger decisions currently outstanding at this builder.
    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// Whether this builder is currently reporting busy.
    pub fn is_busy(&self) -> bool {
        self.is_busy
    }

    /// Whether this builder is in error (permanently unavailable).
    pub fn is_in_error(&self) -> bool {
        self.is_in_error
    }

    /// Marks this builder in error; subsequent [`add_assignment`] calls fail.
    ///
    /// [`add_assignment`]: BuilderState::add_assignment
    pub fn mark_in_error(&mut self) {
        self.is_in_error = true;
        tracing::warn!(builder = %self.connection_name, "builder marked in error");
    }

    /// Constructs an [`AssignedTriggerDecision`] bound to this builder. Does
    /// not enqueue it; call [`add_assignment`] to do that.
    ///
    /// [`add_assignment`]: BuilderState::add_assignment
    pub fn make_assignment(&self, decision: TriggerDecision, now: Timestamp) -> AssignedTriggerDecision {
        AssignedTriggerDecision {
            decision,
            connection_name: self.connection_name.clone(),
            assigned_time: now,
        }
    }

    /// Appends an assignment to the outstanding list, flipping `is_busy` if
    /// the outstanding count reaches `busy_threshold`.
    pub fn add_assignment(&mut self, atd: AssignedTriggerDecision) -> Result<(), Error> {
        if self.is_in_error {
            return Err(Error::NoSlotsAvailable {
                connection_name: self.connection_name.clone(),
            });
        }
        self.outstanding.push(atd);
        if self.outstanding.len() >= self.busy_threshold {
            if !self.is_busy {
                tracing::debug!(builder = %self.connection_name, outstanding_len = self.outstanding.len(), "builder became busy");
            }
            self.is_busy = true;
        }
        Ok(())
    }

    /// Removes and returns the assignment for `trigger_number`, if any,
    /// clearing `is_busy` once the outstanding count drops below
    /// `free_threshold`.
    pub fn extract(&mut self, trigger_number: TriggerNumber) -> Option<AssignedTriggerDecision> {
        let idx = self
            .outstanding
            .iter()
            .position(|atd| atd.decision.trigger_number == trigger_number)?;
        let atd = self.outstanding.remove(idx);
        self.reevaluate_busy();
        Some(atd)
    }

    /// Returns the assignment for `trigger_number`, if any, without removing
    /// it.
    pub fn get(&self, trigger_number: TriggerNumber) -> Option<&AssignedTriggerDecision> {
        self.outstanding
            .iter()
            .find(|atd| atd.decision.trigger_number == trigger_number)
    }

    /// Extracts the assignment for `trigger_number`, records its service time
    /// in the latency ring buffer, and runs `meta_fn` over the extracted
    /// assignment for metadata collection.
    pub fn complete(
        &mut self,
        trigger_number: TriggerNumber,
        now: Timestamp,
        meta_fn: impl FnOnce(&AssignedTriggerDecision),
    ) -> Result<AssignedTriggerDecision, Error> {
        let atd = self.extract(trigger_number).ok_or_else(|| Error::AssignmentNotFound {
            connection_name: self.connection_name.clone(),
            trigger_number,
        })?;

        meta_fn(&atd);

        let service_time = now.saturating_sub(atd.assigned_time);
        if self.latency.len() >= LATENCY_BUFFER_CAPACITY {
            let _ = self.latency.pop_front();
        }
        self.latency.push_back(LatencySample {
            completion_time: now,
            service_time,
        });

        Ok(atd)
    }

    /// Empties the outstanding list, returning its contents, and clears the
    /// busy/error flags. Called on stop.
    pub fn flush(&mut self) -> Vec<AssignedTriggerDecision> {
        self.is_busy = false;
        self.is_in_error = false;
        std::mem::take(&mut self.outstanding)
    }

    /// Merges newly reported completions into the to-be-acknowledged set.
    pub fn update_ack_list(&mut self, trigger_numbers: impl IntoIterator<Item = TriggerNumber>) {
        self.to_be_acknowledged.extend(trigger_numbers);
    }

    /// Drains the to-be-acknowledged set for piggybacking on the next
    /// `DFODecision`.
    pub fn extract_ack_list(&mut self) -> Vec<TriggerNumber> {
        self.to_be_acknowledged.drain().collect()
    }

    /// The most recent latency samples, oldest first.
    pub fn latency_samples(&self) -> impl Iterator<Item = &LatencySample> {
        self.latency.iter()
    }

    fn reevaluate_busy(&mut self) {
        if self.outstanding.len() < self.free_threshold {
            if self.is_busy {
                tracing::debug!(builder = %self.connection_name, outstanding_len = self.outstanding.len(), "builder became free");
            }
            self.is_busy = false;
        }
    }
}
