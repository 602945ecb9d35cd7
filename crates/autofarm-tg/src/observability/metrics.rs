use super::GLOBAL_LABELS;
use metrics::{Counter, Histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

/// Histogram buckets to measure the distribution of request durations in seconds
const DEFAULT_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Buckets for the durations of the whole posting cycle, which include
/// inter-post delays
const CYCLE_DURATION_BUCKETS: &[f64] = &[
    1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0,
];

const HTTP_REQUEST_DURATION: &str = "autofarm_http_request_duration_seconds";
const POSTING_CYCLE_DURATION: &str = "autofarm_posting_cycle_duration_seconds";
const POSTS: &str = "autofarm_posts_total";
const SCHEDULER_RUNS: &str = "autofarm_scheduler_runs_total";
const PAYMENTS: &str = "autofarm_payments_total";
const TG_UPDATES: &str = "autofarm_tg_updates_total";

pub fn init_metrics() {
    let mut builder = PrometheusBuilder::new().with_http_listener(([0, 0, 0, 0], 2000));

    for (metric, buckets) in [
        (HTTP_REQUEST_DURATION, DEFAULT_DURATION_BUCKETS),
        (POSTING_CYCLE_DURATION, CYCLE_DURATION_BUCKETS),
    ] {
        builder = builder
            .set_buckets_for_metric(Matcher::Full(metric.to_owned()), buckets)
            .unwrap_or_else(|err| panic!("BUG: empty buckets for `{metric}`: {err:?}"));
    }

    for (key, value) in GLOBAL_LABELS {
        builder = builder.add_global_label(*key, *value);
    }

    builder
        .install()
        .expect("BUG: failed to initialize the metrics listener");

    describe();
}

fn describe() {
    metrics::describe_histogram!(
        HTTP_REQUEST_DURATION,
        "Duration of a single real http request including retries"
    );
    metrics::describe_histogram!(
        POSTING_CYCLE_DURATION,
        "Duration of a full posting cycle over all due ad slots"
    );
    metrics::describe_counter!(POSTS, "Number of attempts to post an ad to a destination");
    metrics::describe_counter!(SCHEDULER_RUNS, "Number of runs of the scheduler jobs");
    metrics::describe_counter!(PAYMENTS, "Number of payment state transitions");
    metrics::describe_counter!(TG_UPDATES, "Number of updates received from Telegram");
}

pub(crate) fn http_request_duration_seconds(
    method: String,
    host: String,
    status: String,
) -> Histogram {
    metrics::register_histogram!(
        HTTP_REQUEST_DURATION,
        "method" => method,
        "host" => host,
        "status" => status
    )
}

pub(crate) fn posting_cycle_duration_seconds() -> Histogram {
    metrics::register_histogram!(POSTING_CYCLE_DURATION)
}

/// `result` is one of the [`crate::workers::PostOutcome`] kinds
pub(crate) fn posts_total(result: &'static str) -> Counter {
    metrics::register_counter!(POSTS, "result" => result)
}

/// `result` is one of `ok`, `error` or `panic`
pub(crate) fn scheduler_runs_total(job: &'static str, result: &'static str) -> Counter {
    metrics::register_counter!(SCHEDULER_RUNS, "job" => job, "result" => result)
}

pub(crate) fn payments_total(status: &'static str) -> Counter {
    metrics::register_counter!(PAYMENTS, "status" => status)
}

pub(crate) fn tg_updates_total(kind: &'static str) -> Counter {
    metrics::register_counter!(TG_UPDATES, "kind" => kind)
}
