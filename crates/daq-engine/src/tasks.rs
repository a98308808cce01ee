//! Per-component async task loops.
//!
//! Every loop races its channel inputs (and, where relevant, a timer) against
//! a shared stop signal inside one `tokio::select!`, the same timer-vs-channel
//! idiom the teacher's `signal` crate uses to race `Interval::tick()` against
//! `flume::Receiver::recv_async()`. On stop each loop drains whatever
//! draining its component exposes before returning, polling in a fixed
//! number of slices across the component's configured `stop_timeout_ms`
//! rather than blocking on it outright.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use daq_config::{DataWriterConf, DfoBrokerConf, DfoConf, TpBundleHandlerConf, TrbConf};
use daq_dfo::{Dfo, Slot};
use daq_dfo_broker::DfoBroker;
use daq_model::{
    DataRequest, DataflowHeartbeat, DfoDecision, Fragment, RunNumber, StorageKey, TPSet, TimeSlice, TrMonRequest, TriggerDecision, TriggerDecisionToken, TriggerId,
    TriggerInhibit, TriggerRecord,
};
use daq_storage_sink::StorageSink;
use daq_tp_bundle::TpBundleHandler;
use daq_trb::Trb;
use tokio::sync::watch;

const DRAIN_SLICES: u64 = 20;

fn wall_clock_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_micros() as u64).unwrap_or(0)
}

async fn poll_drain(stop_timeout_ms: u64, remaining: impl Fn() -> usize) {
    let slice = Duration::from_millis((stop_timeout_ms / DRAIN_SLICES).max(1));
    for _ in 0..DRAIN_SLICES {
        if remaining() == 0 {
            return;
        }
        tokio::time::sleep(slice).await;
    }
    let left = remaining();
    if left > 0 {
        tracing::warn!(remaining = left, "stop timeout elapsed with work still outstanding");
    }
}

fn is_timeout(err: &daq_channel::Error) -> bool {
    matches!(err, daq_channel::Error::RecvTimeout { .. })
}

/// DFO Broker: relays raw decisions to the DFO, folds back its `DFODecision`s
/// and writer tokens, and ticks out the periodic heartbeat.
pub(crate) async fn run_dfo_broker(
    mut broker: DfoBroker,
    external_td_rx: daq_channel::Receiver<TriggerDecision>,
    dfo_td_tx: daq_channel::Sender<TriggerDecision>,
    dfo_decision_rx: daq_channel::Receiver<DfoDecision>,
    token_rx: daq_channel::Receiver<TriggerDecisionToken>,
    trb_td_tx: daq_channel::Sender<TriggerDecision>,
    heartbeat_tx: daq_channel::Sender<DataflowHeartbeat>,
    conf: DfoBrokerConf,
    mut stop: watch::Receiver<bool>,
) {
    let recv_timeout = Duration::from_millis(conf.td_timeout_ms);
    let mut heartbeat_timer = tokio::time::interval(Duration::from_millis(conf.send_heartbeat_interval_ms));
    let heartbeat_timeout = Duration::from_millis(conf.send_heartbeat_timeout_ms);

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = heartbeat_timer.tick() => {
                let heartbeat = broker.build_heartbeat();
                if let Err(err) = heartbeat_tx.send_timeout(heartbeat, heartbeat_timeout).await {
                    tracing::warn!(%err, "failed to send dataflow heartbeat");
                }
            }
            recvd = external_td_rx.recv_timeout(recv_timeout) => {
                match recvd {
                    Ok(decision) => {
                        if let Err(err) = dfo_td_tx.send_timeout(decision, recv_timeout).await {
                            tracing::warn!(%err, "failed to relay trigger decision to dfo");
                        }
                    }
                    Err(err) if is_timeout(&err) => {}
                    Err(err) => {
                        tracing::error!(%err, "trigger decision input closed, stopping broker");
                        break;
                    }
                }
            }
            recvd = dfo_decision_rx.recv_timeout(recv_timeout) => {
                match recvd {
                    Ok(decision) => match broker.ingest_dfo_decision(decision) {
                        Ok(Some(forward)) => {
                            if let Err(err) = trb_td_tx.send_timeout(forward, recv_timeout).await {
                                tracing::warn!(%err, "failed to forward trigger decision to builder");
                            }
                        }
                        Ok(None) => {}
                        Err(err) => tracing::warn!(%err, "dfo decision rejected"),
                    },
                    Err(err) if is_timeout(&err) => {}
                    Err(err) => {
                        tracing::error!(%err, "dfo decision input closed, stopping broker");
                        break;
                    }
                }
            }
            recvd = token_rx.recv_timeout(recv_timeout) => {
                match recvd {
                    Ok(token) => {
                        if let Err(err) = broker.ingest_token(token) {
                            tracing::warn!(%err, "token rejected");
                        }
                    }
                    Err(err) if is_timeout(&err) => {}
                    Err(err) => {
                        tracing::error!(%err, "token input closed, stopping broker");
                        break;
                    }
                }
            }
        }
    }

    poll_drain(conf.stop_timeout_ms, || broker.outstanding_len()).await;
    broker.reset_for_stop();
}

async fn signal_busy_edge(dfo: &mut Dfo, tx: &daq_channel::Sender<TriggerInhibit>, timeout: Duration) {
    if let Some(busy) = dfo.busy_signal_edge() {
        let inhibit = TriggerInhibit { busy, run_number: dfo.run_number() };
        if let Err(err) = tx.send_timeout(inhibit, timeout).await {
            tracing::warn!(%err, "failed to send trigger inhibit");
        }
    }
}

const UNABLE_TO_ASSIGN_RETRY_DELAY: Duration = Duration::from_micros(500);

#[allow(clippy::too_many_arguments)]
async fn dispatch_decision(
    dfo: &mut Dfo,
    dfo_id: &str,
    decision: TriggerDecision,
    decision_out_tx: &daq_channel::Sender<DfoDecision>,
    trigger_inhibit_tx: &daq_channel::Sender<TriggerInhibit>,
    td_send_retries: u32,
    timeout: Duration,
    stop: &watch::Receiver<bool>,
) {
    loop {
        match dfo.find_slot() {
            Slot::NoBuilderAvailable => {
                let err = daq_dfo::Error::UnableToAssign {
                    trigger_number: decision.trigger_number,
                };
                tracing::error!(%err);
                signal_busy_edge(dfo, trigger_inhibit_tx, timeout).await;
                if *stop.borrow() {
                    return;
                }
                tokio::time::sleep(UNABLE_TO_ASSIGN_RETRY_DELAY).await;
                continue;
            }
            Slot::Assigned(idx) => {
                let acknowledged_completions = dfo.take_acknowledged_completions(idx);
                let message = DfoDecision {
                    dfo_id: dfo_id.to_string(),
                    decision: decision.clone(),
                    acknowledged_completions,
                };

                let mut attempt = 0;
                let mut sent = false;
                while attempt <= td_send_retries {
                    match decision_out_tx.send_timeout(message.clone(), timeout).await {
                        Ok(()) => {
                            sent = true;
                            break;
                        }
                        Err(err) => {
                            tracing::warn!(%err, attempt, "retrying dfo decision send");
                            attempt += 1;
                        }
                    }
                }

                if sent {
                    if let Err(err) = dfo.confirm_assignment(idx, decision, wall_clock_now()) {
                        tracing::warn!(%err, "failed to confirm dfo assignment");
                    }
                    return;
                }

                dfo.mark_builder_failed(idx);
            }
        }
    }
}

/// DFO: assigns decisions to builders, folds heartbeats back in, and signals
/// the trigger source when every builder is saturated.
pub(crate) async fn run_dfo(
    mut dfo: Dfo,
    dfo_id: String,
    heartbeat_source: String,
    decision_rx: daq_channel::Receiver<TriggerDecision>,
    heartbeat_rx: daq_channel::Receiver<DataflowHeartbeat>,
    decision_out_tx: daq_channel::Sender<DfoDecision>,
    trigger_inhibit_tx: daq_channel::Sender<TriggerInhibit>,
    conf: DfoConf,
    mut stop: watch::Receiver<bool>,
) {
    let timeout = Duration::from_millis(conf.general_queue_timeout_ms);
    let thresholds = (conf.busy_threshold, conf.free_threshold);

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            recvd = heartbeat_rx.recv_timeout(timeout) => {
                match recvd {
                    Ok(heartbeat) => {
                        match dfo.ingest_heartbeat(heartbeat_source.clone(), heartbeat, thresholds, wall_clock_now()) {
                            Ok(completed) if !completed.is_empty() => tracing::debug!(count = completed.len(), "builder completions folded in"),
                            Ok(_) => {}
                            Err(err) => tracing::warn!(%err, "heartbeat rejected"),
                        }
                        signal_busy_edge(&mut dfo, &trigger_inhibit_tx, timeout).await;
                    }
                    Err(err) if is_timeout(&err) => {}
                    Err(err) => {
                        tracing::error!(%err, "heartbeat input closed, stopping dfo");
                        break;
                    }
                }
            }
            recvd = decision_rx.recv_timeout(timeout) => {
                match recvd {
                    Ok(decision) => {
                        match dfo.accept_decision(&decision) {
                            Ok(()) => {
                                dispatch_decision(&mut dfo, &dfo_id, decision, &decision_out_tx, &trigger_inhibit_tx, conf.td_send_retries, timeout, &stop).await
                            }
                            Err(err) => tracing::warn!(%err, "trigger decision rejected"),
                        }
                        signal_busy_edge(&mut dfo, &trigger_inhibit_tx, timeout).await;
                    }
                    Err(err) if is_timeout(&err) => {}
                    Err(err) => {
                        tracing::error!(%err, "trigger decision input closed, stopping dfo");
                        break;
                    }
                }
            }
        }
    }

    poll_drain(conf.stop_timeout_ms, || if dfo.all_busy() { 1 } else { 0 }).await;
    for err in dfo.flush_all() {
        tracing::warn!(%err);
    }
}

async fn emit_trigger_record(
    trb: &mut Trb,
    trigger_id: TriggerId,
    trigger_record_tx: &daq_channel::Sender<TriggerRecord>,
    trigger_record_mon_tx: &daq_channel::Sender<(String, TriggerRecord)>,
    timeout: Duration,
) {
    let Some((record, mon_destinations)) = trb.extract(trigger_id) else {
        return;
    };

    for destination in mon_destinations {
        if let Err(err) = trigger_record_mon_tx.send_timeout((destination, record.clone()), timeout).await {
            tracing::warn!(%err, "failed to send monitoring copy of trigger record");
        }
    }

    let trigger_number = record.header.trigger_number;
    if let Err(err) = trigger_record_tx.send_timeout(record, timeout).await {
        tracing::error!(%err, trigger_number, "send to data writer failed");
        trb.mark_abandoned(trigger_id.trigger_number, trigger_id.sequence_number, trigger_id.run_number);
    }
}

/// Trigger Record Builder: slices decisions into requests, folds fragments
/// back into records, and emits each record once complete or stale.
pub(crate) async fn run_trb(
    mut trb: Trb,
    decision_rx: daq_channel::Receiver<TriggerDecision>,
    fragment_rx: daq_channel::Receiver<Fragment>,
    mon_request_rx: daq_channel::Receiver<TrMonRequest>,
    data_request_tx: daq_channel::Sender<DataRequest>,
    trigger_record_tx: daq_channel::Sender<TriggerRecord>,
    trigger_record_mon_tx: daq_channel::Sender<(String, TriggerRecord)>,
    conf: TrbConf,
    mut stop: watch::Receiver<bool>,
) {
    let timeout = Duration::from_millis(conf.queues_timeout_ms);
    let mut staleness_timer = tokio::time::interval(Duration::from_millis(50));

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = staleness_timer.tick() => {
                for trigger_id in trb.check_stale(wall_clock_now()) {
                    emit_trigger_record(&mut trb, trigger_id, &trigger_record_tx, &trigger_record_mon_tx, timeout).await;
                }
            }
            recvd = mon_request_rx.recv_timeout(timeout) => {
                match recvd {
                    Ok(req) => trb.register_mon_request(req),
                    Err(err) if is_timeout(&err) => {}
                    Err(err) => {
                        tracing::error!(%err, "monitoring request input closed, stopping trb");
                        break;
                    }
                }
            }
            recvd = decision_rx.recv_timeout(timeout) => {
                match recvd {
                    Ok(decision) => match trb.ingest_decision(decision, wall_clock_now()) {
                        Ok(requests) => {
                            for request in requests {
                                if let Err(err) = data_request_tx.send_timeout(request, timeout).await {
                                    tracing::warn!(%err, "failed to dispatch data request");
                                }
                            }
                        }
                        Err(err) => tracing::warn!(%err, "trigger decision rejected"),
                    },
                    Err(err) if is_timeout(&err) => {}
                    Err(err) => {
                        tracing::error!(%err, "trigger decision input closed, stopping trb");
                        break;
                    }
                }
            }
            recvd = fragment_rx.recv_timeout(timeout) => {
                match recvd {
                    Ok(fragment) => {
                        let trigger_id = TriggerId::new(fragment.trigger_number, fragment.sequence_number, fragment.run_number);
                        match trb.ingest_fragment(fragment) {
                            Ok(true) => emit_trigger_record(&mut trb, trigger_id, &trigger_record_tx, &trigger_record_mon_tx, timeout).await,
                            Ok(false) => {}
                            Err(err) => tracing::warn!(%err, "fragment rejected"),
                        }
                    }
                    Err(err) if is_timeout(&err) => {}
                    Err(err) => {
                        tracing::error!(%err, "fragment input closed, stopping trb");
                        break;
                    }
                }
            }
        }
    }

    poll_drain(conf.stop_timeout_ms, || trb.pending_len()).await;
    for trigger_id in trb.drain_ids() {
        emit_trigger_record(&mut trb, trigger_id, &trigger_record_tx, &trigger_record_mon_tx, timeout).await;
    }
}

const BOUNDARY_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// TP Bundle Handler: folds TPSets into time-local accumulators and emits
/// each one once it has cooled off.
pub(crate) async fn run_tp_bundle(
    mut handler: TpBundleHandler,
    tpset_rx: daq_channel::Receiver<TPSet>,
    timeslice_tx: daq_channel::Sender<TimeSlice>,
    conf: TpBundleHandlerConf,
    mut stop: watch::Receiver<bool>,
) {
    let mut age_timer = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = age_timer.tick() => {
                for slice in handler.get_properly_aged_timeslices(wall_clock_now()) {
                    if let Err(err) = timeslice_tx.send_timeout(slice, BOUNDARY_SEND_TIMEOUT).await {
                        tracing::warn!(%err, "failed to send time slice");
                    }
                }
            }
            recvd = tpset_rx.recv_timeout(BOUNDARY_SEND_TIMEOUT) => {
                match recvd {
                    Ok(tpset) => {
                        let outcome = handler.add_tpset(tpset, wall_clock_now());
                        if matches!(outcome, daq_tp_bundle::AddOutcome::Tardy) && conf.warn_user_when_tardy_tps_are_discarded {
                            tracing::warn!("tardy TPSet folded into a recreated accumulator");
                        }
                    }
                    Err(err) if is_timeout(&err) => {}
                    Err(err) => {
                        tracing::error!(%err, "tpset input closed, stopping tp bundle handler");
                        break;
                    }
                }
            }
        }
    }

    poll_drain(conf.tp_accumulation_inactivity_time_before_write_sec.saturating_mul(1000), || handler.open_slice_count()).await;
    for slice in handler.get_all_remaining_timeslices() {
        if let Err(err) = timeslice_tx.send_timeout(slice, BOUNDARY_SEND_TIMEOUT).await {
            tracing::warn!(%err, "failed to flush time slice on stop");
        }
    }
}

/// Writes `payload` under `key`, backing off exponentially between retries of
/// a retryable storage error and giving up outright on any other error or on
/// a stop request mid-backoff.
async fn write_with_retry(sink: &mut dyn StorageSink, key: StorageKey, payload: &[u8], conf: &DataWriterConf, stop: &watch::Receiver<bool>) -> bool {
    // A fresh clone per call: `watch::Receiver::changed()` only fires once
    // per observed value, and the caller's own receiver must keep tracking
    // the stop flag independently across calls.
    let mut stop = stop.clone();
    let mut backoff_us = conf.min_write_retry_time_us;
    loop {
        match sink.write(key, payload, wall_clock_now()) {
            Ok(()) => return true,
            Err(err) if err.is_retryable() => {
                tracing::warn!(%err, backoff_us, "retrying storage write");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_micros(backoff_us)) => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            return false;
                        }
                    }
                }
                backoff_us = ((backoff_us as f64) * conf.write_retry_time_increase_factor) as u64;
                backoff_us = backoff_us.min(conf.max_write_retry_time_us);
            }
            Err(err) => {
                tracing::error!(%err, "unrecoverable storage write failure, abandoning item");
                return false;
            }
        }
    }
}

/// Data Writer: turns trigger records and time slices into write plans,
/// executes them against the storage sink with bounded retry, and emits the
/// completion token once every sequence of a trigger has landed.
pub(crate) async fn run_data_writer(
    mut writer: daq_data_writer::DataWriter,
    mut sink: Box<dyn StorageSink + Send>,
    run_number: RunNumber,
    trigger_record_rx: daq_channel::Receiver<TriggerRecord>,
    timeslice_rx: daq_channel::Receiver<TimeSlice>,
    token_tx: daq_channel::Sender<TriggerDecisionToken>,
    conf: DataWriterConf,
    mut stop: watch::Receiver<bool>,
) {
    if let Err(err) = token_tx.send_timeout(writer.startup_token(), BOUNDARY_SEND_TIMEOUT).await {
        tracing::warn!(%err, "failed to send startup token");
    }

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            recvd = trigger_record_rx.recv_timeout(BOUNDARY_SEND_TIMEOUT) => {
                match recvd {
                    Ok(tr) => {
                        match writer.plan_write(&tr) {
                            Ok(daq_data_writer::WritePlan::Skip) => {}
                            Ok(daq_data_writer::WritePlan::Write(items)) => {
                                let mut all_written = true;
                                for (key, payload) in items {
                                    if !write_with_retry(sink.as_mut(), key, &payload, &conf, &stop).await {
                                        all_written = false;
                                        break;
                                    }
                                }
                                if all_written {
                                    if let Some(token) = writer.record_write_success(&tr) {
                                        if let Err(err) = token_tx.send_timeout(token, BOUNDARY_SEND_TIMEOUT).await {
                                            tracing::warn!(%err, "failed to send trigger decision token");
                                        }
                                    }
                                } else {
                                    tracing::error!(trigger_number = tr.header.trigger_number, "abandoning trigger record after unrecoverable write failure");
                                }
                            }
                            Err(err) => tracing::warn!(%err, "failed to plan trigger record write"),
                        }
                    }
                    Err(err) if is_timeout(&err) => {}
                    Err(err) => {
                        tracing::error!(%err, "trigger record input closed, stopping data writer");
                        break;
                    }
                }
            }
            recvd = timeslice_rx.recv_timeout(BOUNDARY_SEND_TIMEOUT) => {
                match recvd {
                    Ok(ts) => match writer.plan_write_timeslice(&ts) {
                        Ok(daq_data_writer::WritePlan::Skip) => {}
                        Ok(daq_data_writer::WritePlan::Write(items)) => {
                            for (key, payload) in items {
                                if !write_with_retry(sink.as_mut(), key, &payload, &conf, &stop).await {
                                    tracing::error!(slice_number = ts.slice_number, "abandoning time slice after unrecoverable write failure");
                                    break;
                                }
                            }
                        }
                        Err(err) => tracing::warn!(%err, "failed to plan time slice write"),
                    },
                    Err(err) if is_timeout(&err) => {}
                    Err(err) => {
                        tracing::error!(%err, "time slice input closed, stopping data writer");
                        break;
                    }
                }
            }
        }
    }

    if let Err(err) = sink.finish_with_run(run_number) {
        tracing::error!(%err, "failed to finish storage sink run");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use daq_model::GroupType;

    use super::*;

    fn conf(min_us: u64, max_us: u64, factor: f64) -> DataWriterConf {
        DataWriterConf {
            trigger_decision_connection: "writer0".into(),
            data_storage_prescale: 1,
            min_write_retry_time_us: min_us,
            max_write_retry_time_us: max_us,
            write_retry_time_increase_factor: factor,
        }
    }

    fn key() -> StorageKey {
        StorageKey {
            run_number: 1,
            trigger_number: 1,
            sequence_number: 0,
            has_sequences: false,
            group_type: GroupType::Tpc,
            region_number: 0,
            element_number: 0,
        }
    }

    struct ScriptedSink {
        failures_left: usize,
        retryable: bool,
        writes: usize,
    }

    impl StorageSink for ScriptedSink {
        fn prepare_for_run(&mut self, _run_number: RunNumber, _is_test: bool) -> Result<(), daq_storage_sink::Error> {
            Ok(())
        }

        fn write(&mut self, _key: StorageKey, _payload: &[u8], _now: u64) -> Result<(), daq_storage_sink::Error> {
            self.writes += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(if self.retryable {
                    daq_storage_sink::Error::InsufficientDiskSpace {
                        needed: 10,
                        available: 1,
                        factor: 1.1,
                        record_size: 10,
                    }
                } else {
                    daq_storage_sink::Error::InvalidDirectory("/nope".into())
                });
            }
            Ok(())
        }

        fn finish_with_run(&mut self, _run_number: RunNumber) -> Result<(), daq_storage_sink::Error> {
            Ok(())
        }
    }

    #[test]
    fn is_timeout_matches_only_recv_timeout() {
        assert!(is_timeout(&daq_channel::Error::RecvTimeout {
            connection: "x".into(),
            timeout_ms: 1
        }));
        assert!(!is_timeout(&daq_channel::Error::Closed { connection: "x".into() }));
    }

    #[tokio::test]
    async fn poll_drain_returns_as_soon_as_remaining_hits_zero() {
        let calls = AtomicUsize::new(0);
        let start = std::time::Instant::now();
        poll_drain(1000, || {
            calls.fetch_add(1, Ordering::SeqCst);
            0
        })
        .await;
        assert!(start.elapsed() < Duration::from_millis(200), "should not wait out the full timeout");
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn poll_drain_warns_but_returns_after_timeout_elapses() {
        poll_drain(40, || 3).await;
    }

    #[tokio::test]
    async fn write_with_retry_succeeds_immediately_with_no_failures() {
        let mut sink = ScriptedSink {
            failures_left: 0,
            retryable: true,
            writes: 0,
        };
        let (_tx, rx) = watch::channel(false);
        let ok = write_with_retry(&mut sink, key(), b"payload", &conf(100, 1000, 2.0), &rx).await;
        assert!(ok);
        assert_eq!(sink.writes, 1);
    }

    #[tokio::test]
    async fn write_with_retry_retries_retryable_errors_until_success() {
        let mut sink = ScriptedSink {
            failures_left: 2,
            retryable: true,
            writes: 0,
        };
        let (_tx, rx) = watch::channel(false);
        let ok = write_with_retry(&mut sink, key(), b"payload", &conf(1, 10, 2.0), &rx).await;
        assert!(ok);
        assert_eq!(sink.writes, 3);
    }

    #[tokio::test]
    async fn write_with_retry_gives_up_on_non_retryable_error() {
        let mut sink = ScriptedSink {
            failures_left: 1,
            retryable: false,
            writes: 0,
        };
        let (_tx, rx) = watch::channel(false);
        let ok = write_with_retry(&mut sink, key(), b"payload", &conf(100, 1000, 2.0), &rx).await;
        assert!(!ok);
        assert_eq!(sink.writes, 1, "must not retry a non-retryable error");
    }

    #[tokio::test]
    async fn write_with_retry_abandons_promptly_on_stop_signal() {
        let mut sink = ScriptedSink {
            failures_left: 100,
            retryable: true,
            writes: 0,
        };
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let start = std::time::Instant::now();
        let ok = write_with_retry(&mut sink, key(), b"payload", &conf(10_000, 100_000, 2.0), &rx).await;
        assert!(!ok);
        assert!(start.elapsed() < Duration::from_millis(500), "stop must cut the backoff short");
    }

    #[tokio::test]
    async fn write_with_retry_leaves_callers_receiver_able_to_observe_later_stop() {
        // `write_with_retry` clones `stop` internally rather than consuming
        // change-tracking state on the caller's own receiver; a run that
        // retries and succeeds must not prevent the caller from later
        // observing a real stop signal on the same receiver it passed in.
        let mut sink = ScriptedSink {
            failures_left: 1,
            retryable: true,
            writes: 0,
        };
        let (tx, mut rx) = watch::channel(false);
        let ok = write_with_retry(&mut sink, key(), b"payload", &conf(1, 10, 2.0), &rx).await;
        assert!(ok);

        tx.send(true).unwrap();
        assert!(rx.changed().await.is_ok(), "caller's receiver must still see the stop transition");
    }
}
