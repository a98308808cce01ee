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

//! The TP Bundle Handler (§4.4): slices an unbounded stream of
//! [`TPSet`]s into fixed-width, run-local [`TimeSlice`]s once each slice has
//! stopped receiving updates for a configured cooling-off period.

use std::collections::BTreeMap;

use daq_model::{Fragment, FragmentType, RunNumber, SliceNumber, SourceId, Timestamp, TPSet, TimeSlice};

/// Outcome of [`TpBundleHandler::add_tpset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The set was folded into one or more accumulators.
    Accepted,
    /// The set did not overlap any accumulator it was offered to, so no
    /// trigger primitives from it were kept.
    NoOverlap,
    /// The set arrived well behind slices already emitted; it was still
    /// folded into a (freshly recreated) accumulator, but the resulting
    /// slice will likely arrive too late to be useful downstream.
    Tardy,
}

struct TimeSliceAccumulator {
    begin_time: Timestamp,
    end_time: Timestamp,
    slice_number: SliceNumber,
    run_number: RunNumber,
    last_update: Timestamp,
    by_source: BTreeMap<SourceId, BTreeMap<Timestamp, TPSet>>,
}

impl TimeSliceAccumulator {
    fn new(begin_time: Timestamp, end_time: Timestamp, slice_number: SliceNumber, run_number: RunNumber, now: Timestamp) -> Self {
        Self {
            begin_time,
            end_time,
            slice_number,
            run_number,
            last_update: now,
            by_source: BTreeMap::new(),
        }
    }

    /// Returns `true` if `tpset` overlapped this accumulator's window and
    /// was folded in.
    fn add_tpset(&mut self, tpset: TPSet, now: Timestamp) -> bool {
        if tpset.end_time <= self.begin_time || tpset.start_time >= self.end_time {
            return false;
        }
        self.by_source.entry(tpset.origin).or_default().insert(tpset.start_time, tpset);
        self.last_update = now;
        true
    }

    fn into_time_slice(self, element_id: SourceId) -> TimeSlice {
        let mut fragments = Vec::with_capacity(self.by_source.len());
        for (source_id, bundle) in self.by_source {
            let mut payload = Vec::new();
            let mut first_time = None;
            let mut last_time = None;
            for (_, tpset) in bundle {
                if first_time.is_none() {
                    first_time = Some(tpset.start_time);
                }
                last_time = Some(tpset.end_time);
                for tp in tpset.tps {
                    payload.extend_from_slice(&tp.to_bytes());
                }
            }
            fragments.push(Fragment {
                trigger_number: 0,
                sequence_number: 0,
                run_number: self.run_number,
                element_id: source_id,
                window_begin: first_time.unwrap_or(self.begin_time),
                window_end: last_time.unwrap_or(self.end_time),
                payload,
                fragment_type: FragmentType::Payload,
                error_bits: 0,
            });
        }
        TimeSlice {
            slice_number: self.slice_number,
            run_number: self.run_number,
            element_id,
            fragments,
        }
    }
}

/// Slices a TP stream into fixed-width time slices.
///
/// Performs no I/O: `daq-engine` feeds it `TPSet`s and periodically calls
/// [`get_properly_aged_timeslices`] to pull out slices ready to write.
///
/// [`get_properly_aged_timeslices`]: TpBundleHandler::get_properly_aged_timeslices
pub struct TpBundleHandler {
    slice_interval: u64,
    run_number: RunNumber,
    cooling_off_time: u64,
    element_id: SourceId,
    slice_index_offset: Option<u64>,
    emitted_watermark: Option<u64>,
    accumulators: BTreeMap<u64, TimeSliceAccumulator>,
}

impl TpBundleHandler {
    /// Creates a new handler slicing time into windows of `slice_interval`
    /// detector ticks, emitting a slice once it has seen no update for
    /// `cooling_off_time` ticks.
    pub fn new(slice_interval: u64, run_number: RunNumber, cooling_off_time: u64, element_id: SourceId) -> Self {
        Self {
            slice_interval,
            run_number,
            cooling_off_time,
            element_id,
            slice_index_offset: None,
            emitted_watermark: None,
            accumulators: BTreeMap::new(),
        }
    }

    /// Number of accumulators currently open.
    pub fn open_slice_count(&self) -> usize {
        self.accumulators.len()
    }

    /// Folds `tpset` into every accumulator whose window it overlaps,
    /// creating new accumulators as needed for the slices it spans.
    pub fn add_tpset(&mut self, tpset: TPSet, now: Timestamp) -> AddOutcome {
        let tsidx_begin = tpset.start_time / self.slice_interval;
        let tsidx_end = tpset.end_time / self.slice_interval;
        let offset = *self.slice_index_offset.get_or_insert(tsidx_begin.saturating_sub(1));

        let tardy = self
            .emitted_watermark
            .map(|watermark| tsidx_begin < watermark)
            .unwrap_or(false);
        if tardy {
            tracing::warn!(
                source = ?tpset.origin,
                start_time = tpset.start_time,
                tsidx = tsidx_begin,
                "tardy TPSet received well behind already-emitted slices"
            );
        }

        let mut accepted = false;
        for tsidx in (tsidx_begin + 1)..=tsidx_end {
            let accum = self.accumulator_for(tsidx, offset, now);
            accepted |= accum.add_tpset(tpset.clone(), now);
        }
        let accum = self.accumulator_for(tsidx_begin, offset, now);
        accepted |= accum.add_tpset(tpset, now);

        if tardy {
            AddOutcome::Tardy
        } else if accepted {
            AddOutcome::Accepted
        } else {
            AddOutcome::NoOverlap
        }
    }

    fn accumulator_for(&mut self, tsidx: u64, offset: u64, now: Timestamp) -> &mut TimeSliceAccumulator {
        self.accumulators.entry(tsidx).or_insert_with(|| {
            TimeSliceAccumulator::new(
                tsidx * self.slice_interval,
                (tsidx + 1) * self.slice_interval,
                tsidx.saturating_sub(offset),
                self.run_number,
                now,
            )
        })
    }

    /// Removes and returns every accumulator that has not been updated for
    /// at least `cooling_off_time`, converting each into a [`TimeSlice`].
    pub fn get_properly_aged_timeslices(&mut self, now: Timestamp) -> Vec<TimeSlice> {
        let aged: Vec<u64> = self
            .accumulators
            .iter()
            .filter(|(_, accum)| now.saturating_sub(accum.last_update) >= self.cooling_off_time)
            .map(|(tsidx, _)| *tsidx)
            .collect();

        let mut slices = Vec::with_capacity(aged.len());
        for tsidx in aged {
            if let Some(accum) = self.accumulators.remove(&tsidx) {
                self.emitted_watermark = Some(self.emitted_watermark.map_or(tsidx, |w| w.max(tsidx)));
                slices.push(accum.into_time_slice(self.element_id));
            }
        }
        slices
    }

    /// Drains every open accumulator regardless of age. Called on shutdown.
    pub fn get_all_remaining_timeslices(&mut self) -> Vec<TimeSlice> {
        let element_id = self.element_id;
        std::mem::take(&mut self.accumulators)
            .into_values()
            .map(|accum| accum.into_time_slice(element_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use daq_model::{Subsystem, TpSetKind, TriggerPrimitive};

    use super::*;

    fn tpset(origin_id: u32, start: Timestamp, end: Timestamp, seqno: u64) -> TPSet {
        TPSet {
            origin: SourceId::new(Subsystem::DetectorReadout, origin_id),
            seqno,
            start_time: start,
            end_time: end,
            kind: TpSetKind::Payload,
            tps: vec![TriggerPrimitive {
                channel: 1,
                time_start: start,
                adc_integral: 100,
            }],
        }
    }

    fn handler() -> TpBundleHandler {
        TpBundleHandler::new(100, 1, 50, SourceId::new(Subsystem::DetectorReadout, 0))
    }

    #[test]
    fn add_tpset_creates_one_accumulator_for_a_contained_set() {
        let mut h = handler();
        assert_eq!(h.add_tpset(tpset(0, 110, 150, 1), 0), AddOutcome::Accepted);
        assert_eq!(h.open_slice_count(), 1);
    }

    #[test]
    fn add_tpset_spans_two_accumulators_when_crossing_a_boundary() {
        let mut h = handler();
        assert_eq!(h.add_tpset(tpset(0, 190, 210, 1), 0), AddOutcome::Accepted);
        assert_eq!(h.open_slice_count(), 2);
    }

    #[test]
    fn aged_slices_are_emitted_once_past_cooling_off() {
        let mut h = handler();
        h.add_tpset(tpset(0, 110, 150, 1), 0);
        assert!(h.get_properly_aged_timeslices(10).is_empty(), "not yet cooled off");
        let slices = h.get_properly_aged_timeslices(51);
        assert_eq!(slices.len(), 1);
        assert_eq!(h.open_slice_count(), 0);
    }

    #[test]
    fn time_slice_concatenates_per_source_fragments() {
        let mut h = handler();
        h.add_tpset(tpset(0, 110, 120, 1), 0);
        h.add_tpset(tpset(0, 120, 130, 2), 0);
        h.add_tpset(tpset(1, 110, 120, 1), 0);
        let slices = h.get_properly_aged_timeslices(51);
        assert_eq!(slices.len(), 1);
        let slice = &slices[0];
        assert_eq!(slice.fragments.len(), 2, "one fragment per contributing source");
        assert_eq!(slice.fragments[0].payload.len(), 32, "two TPSets of one TP each, 16 bytes per TP");
        assert_eq!(slice.fragments[1].payload.len(), 16);
    }

    #[test]
    fn remaining_timeslices_are_drained_on_shutdown() {
        let mut h = handler();
        h.add_tpset(tpset(0, 110, 120, 1), 0);
        h.add_tpset(tpset(0, 310, 320, 1), 0);
        let slices = h.get_all_remaining_timeslices();
        assert_eq!(slices.len(), 2);
        assert_eq!(h.open_slice_count(), 0);
    }

    #[test]
    fn tardy_tpset_is_flagged_but_still_applied() {
        let mut h = handler();
        h.add_tpset(tpset(0, 310, 320, 1), 0);
        h.get_properly_aged_timeslices(400);
        assert_eq!(h.add_tpset(tpset(0, 10, 20, 2), 400), AddOutcome::Tardy);
        assert_eq!(h.open_slice_count(), 1, "still recreates an accumulator for the stray slice");
    }
}
