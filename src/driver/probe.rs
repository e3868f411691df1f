//! Concurrent read-throughput probes.
//!
//! A fixed pool of OS threads hammers the history store with random ranged
//! reads until a shared wall-clock deadline. Workers accumulate locally and
//! merge into the shared aggregate exactly once, at join time, so the hot
//! loop never contends on a lock.

use super::random_time_range;
use crate::api::{MonitorApi, ValueType, ensure_call};
use crate::error::ApiError;
use crate::history::HistoryStore;
use crate::results::ErrorLog;
use chrono::{Local, NaiveDateTime};
use rand::seq::SliceRandom;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Instant;

/// Which population a probe draws its random target from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTarget {
    /// One random enabled item per probe.
    Item,
    /// One random enabled host per probe, querying a random supported
    /// value type across all of its items.
    Host,
}

impl ProbeTarget {
    pub fn from_config(history_group: &str) -> Self {
        if history_group == "host" {
            ProbeTarget::Host
        } else {
            ProbeTarget::Item
        }
    }
}

/// Everything a probe worker needs, shared read-only across the pool.
pub struct ProbeContext<'a> {
    pub api: &'a dyn MonitorApi,
    pub store: &'a dyn HistoryStore,
    pub error_log: &'a ErrorLog,
    pub max_retry: u32,
    /// Hosts carrying pre-filled history data, in population order.
    pub data_hostnames: &'a [String],
    pub data_begin: NaiveDateTime,
    pub data_end: NaiveDateTime,
    pub target: ProbeTarget,
    /// Width of each ranged read, seconds.
    pub history_duration: i64,
}

/// One successful probe iteration, for the per-iteration log.
#[derive(Debug, Clone)]
pub struct ProbeLogEntry {
    pub time: NaiveDateTime,
    pub thread: usize,
    pub processed_items: u64,
    pub processed_time: f64,
}

#[derive(Debug, Default)]
pub struct ProbeOutcome {
    pub total_items: u64,
    pub total_time: f64,
    pub log: Vec<ProbeLogEntry>,
}

impl ProbeOutcome {
    fn merge(&mut self, other: ProbeOutcome) {
        self.total_items += other.total_items;
        self.total_time += other.total_time;
        self.log.extend(other.log);
    }
}

/// Run `num_threads` probe workers until `deadline`.
///
/// The deadline is checked at the top of each iteration; in-flight requests
/// are never interrupted. Iterations that exhaust their retries are
/// swallowed: sporadic read errors must not halt throughput measurement.
/// The merged per-iteration log is sorted by timestamp so the persisted log
/// is globally time-ordered despite unordered concurrent writers.
pub fn run(ctx: &ProbeContext<'_>, num_threads: usize, deadline: Instant) -> ProbeOutcome {
    let merged = Mutex::new(ProbeOutcome::default());

    thread::scope(|scope| {
        for thread_id in 0..num_threads {
            let merged = &merged;
            scope.spawn(move || {
                let local = worker_loop(ctx, thread_id, deadline);
                merged
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .merge(local);
            });
        }
    });

    let mut outcome = merged.into_inner().unwrap_or_else(PoisonError::into_inner);
    outcome.log.sort_by_key(|entry| entry.time);
    outcome
}

fn worker_loop(ctx: &ProbeContext<'_>, thread_id: usize, deadline: Instant) -> ProbeOutcome {
    let mut local = ProbeOutcome::default();

    while Instant::now() < deadline {
        match ensure_call(ctx.max_retry, ctx.error_log, || probe_once(ctx)) {
            Ok((items, elapsed)) => {
                local.total_items += items;
                local.total_time += elapsed;
                local.log.push(ProbeLogEntry {
                    time: Local::now().naive_local(),
                    thread: thread_id,
                    processed_items: items,
                    processed_time: elapsed,
                });
            }
            Err(_) => {
                // Already in the error sink via ensure_call; counts as zero
                // items for this iteration.
            }
        }
    }

    local
}

/// One ranged read over a random window. Empty results are fine here: a
/// window with no data still measures server-side read cost.
fn probe_once(ctx: &ProbeContext<'_>) -> Result<(u64, f64), ApiError> {
    let mut rng = rand::thread_rng();
    let (begin, end) = random_time_range(ctx.data_begin, ctx.data_end, ctx.history_duration);

    let started = Instant::now();
    let histories = match ctx.target {
        ProbeTarget::Item => {
            let item = random_enabled_item(ctx.api, ctx.data_hostnames)?;
            ctx.store.get_histories(&item, begin, end)?
        }
        ProbeTarget::Host => {
            let hostname = ctx
                .data_hostnames
                .choose(&mut rng)
                .ok_or_else(|| ApiError::Rejected("no data hosts configured".to_string()))?;
            let host_id = ctx
                .api
                .get_host_id(hostname)?
                .ok_or_else(|| ApiError::Rejected(format!("host {hostname:?} not found")))?;
            let value_type = *ValueType::SUPPORTED
                .choose(&mut rng)
                .expect("supported value types are non-empty");
            ctx.api
                .get_history_by_host(host_id, value_type, begin, end)?
        }
    };
    let elapsed = started.elapsed().as_secs_f64();

    Ok((histories.len() as u64, elapsed))
}

/// Pick one random item from one random data host.
pub(super) fn random_enabled_item(
    api: &dyn MonitorApi,
    data_hostnames: &[String],
) -> Result<crate::api::ItemRef, ApiError> {
    let mut rng = rand::thread_rng();
    let hostname = data_hostnames
        .choose(&mut rng)
        .ok_or_else(|| ApiError::Rejected("no data hosts configured".to_string()))?;
    let items = api.get_items(hostname)?;
    items
        .choose(&mut rng)
        .cloned()
        .ok_or_else(|| ApiError::Rejected(format!("host {hostname:?} has no items")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::tests::FakeApi;
    use crate::history::open_backend;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn context<'a>(
        api: &'a dyn MonitorApi,
        store: &'a dyn HistoryStore,
        error_log: &'a ErrorLog,
        hostnames: &'a [String],
    ) -> ProbeContext<'a> {
        let begin = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        ProbeContext {
            api,
            store,
            error_log,
            max_retry: 1,
            data_hostnames: hostnames,
            data_begin: begin,
            data_end: begin + chrono::Duration::hours(1),
            target: ProbeTarget::Item,
            history_duration: 60,
        }
    }

    #[test]
    fn workers_aggregate_and_sort_the_log() {
        let api: Arc<dyn MonitorApi> = Arc::new(FakeApi::with_hosts(4, 3));
        let config = crate::config::BenchConfig::default();
        let store = open_backend(&config, api.clone()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let error_log = ErrorLog::new(dir.path().join("errors.csv"));
        let hostnames: Vec<String> = (0..4).map(|i| format!("TestHost{i}")).collect();

        let ctx = context(api.as_ref(), store.as_ref(), &error_log, &hostnames);
        let deadline = Instant::now() + Duration::from_millis(50);
        let outcome = run(&ctx, 4, deadline);

        // The fake returns two records per ranged read.
        assert!(outcome.total_items > 0);
        assert_eq!(outcome.total_items % 2, 0);
        assert_eq!(
            outcome.total_items as usize / 2,
            outcome.log.len(),
            "one log entry per successful iteration"
        );
        assert!(outcome.log.windows(2).all(|w| w[0].time <= w[1].time));
        assert_eq!(error_log.row_count(), 0);
    }

    #[test]
    fn expired_deadline_runs_zero_iterations() {
        let api: Arc<dyn MonitorApi> = Arc::new(FakeApi::with_hosts(4, 3));
        let config = crate::config::BenchConfig::default();
        let store = open_backend(&config, api.clone()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let error_log = ErrorLog::new(dir.path().join("errors.csv"));
        let hostnames: Vec<String> = (0..4).map(|i| format!("TestHost{i}")).collect();

        let ctx = context(api.as_ref(), store.as_ref(), &error_log, &hostnames);
        let outcome = run(&ctx, 4, Instant::now());

        assert_eq!(outcome.total_items, 0);
        assert!(outcome.log.is_empty());
    }

    #[test]
    fn failing_probes_are_swallowed_but_audited() {
        let api: Arc<dyn MonitorApi> = Arc::new(FakeApi::failing());
        let config = crate::config::BenchConfig::default();
        let store = open_backend(&config, api.clone()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let error_log = ErrorLog::new(dir.path().join("errors.csv"));
        let hostnames: Vec<String> = (0..4).map(|i| format!("TestHost{i}")).collect();

        let ctx = context(api.as_ref(), store.as_ref(), &error_log, &hostnames);
        let deadline = Instant::now() + Duration::from_millis(20);
        let outcome = run(&ctx, 2, deadline);

        // Every iteration failed, none aborted the pool.
        assert_eq!(outcome.total_items, 0);
        assert!(outcome.log.is_empty());
        assert!(error_log.row_count() > 0);
    }
}
