//! Optional metrics instrumentation.
//!
//! When the `observe` feature is enabled, claim cycles, task runs and pool
//! usage emit counters and gauges via the [`metrics`] crate. A downstream
//! application must install a metrics recorder to collect the data.
//!
//! Without the feature every function in this module is a no-op.

/// Record one claim cycle.
///
/// - `drover.claim.cycles_total` – counter
/// - `drover.claim.tasks_claimed_total` – counter
/// - `drover.claim.conflicts_total` – counter
/// - `drover.claim.duration_seconds` – histogram
#[inline]
pub fn record_claim_cycle(duration: std::time::Duration, claimed: usize, conflicts: usize) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("drover.claim.cycles_total").increment(1);
        metrics::counter!("drover.claim.tasks_claimed_total").increment(claimed as u64);
        metrics::counter!("drover.claim.conflicts_total").increment(conflicts as u64);
        metrics::histogram!("drover.claim.duration_seconds").record(duration.as_secs_f64());
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (duration, claimed, conflicts);
    }
}

/// Record a claim cycle aborted by a store error.
///
/// - `drover.claim.errors_total` – counter
#[inline]
pub fn record_claim_error() {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("drover.claim.errors_total").increment(1);
    }
}

/// Record a finished task run.
///
/// - `drover.task.runs_total` – counter with `task_type` and `outcome` labels
/// - `drover.task.run_duration_seconds` – histogram with `task_type` label
#[inline]
pub fn record_task_run(task_type: &str, outcome: &'static str, duration: std::time::Duration) {
    #[cfg(feature = "observe")]
    {
        let task_type = task_type.to_string();
        metrics::counter!(
            "drover.task.runs_total",
            "task_type" => task_type.clone(),
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!("drover.task.run_duration_seconds", "task_type" => task_type)
            .record(duration.as_secs_f64());
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (task_type, outcome, duration);
    }
}

/// Set the pool's used capacity gauge.
///
/// - `drover.pool.used_capacity` – gauge, in cost units
#[inline]
pub fn set_pool_used_capacity(used: u32) {
    #[cfg(feature = "observe")]
    {
        metrics::gauge!("drover.pool.used_capacity").set(used as f64);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = used;
    }
}
