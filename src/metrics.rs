use std::sync::LazyLock;

use prometheus::{Histogram, IntCounter, IntGauge, Registry};

/* ============================= REGISTRY ============================= */

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/* ============================= GAUGES & COUNTERS ============================= */

pub static IS_LEADER: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("controller_is_leader", "1 while this instance holds leadership")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

pub static SWITCHES_CONNECTED: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("switches_connected", "Currently connected datapaths")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

pub static POD_EVENTS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("pod_events_total", "Normalized pod events received")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static POLICY_REFRESHES: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("policy_refreshes_total", "Successful policy repository refreshes")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static POLICY_REFRESH_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("policy_refresh_errors_total", "Failed policy repository refreshes")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static RECONCILE_PASSES: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("reconcile_passes_total", "Completed reconcile passes")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static RECONCILE_ABANDONED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "reconcile_passes_abandoned_total",
        "Reconcile passes abandoned on leadership loss or shutdown",
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "reconcile_duration_seconds",
        "Duration of each reconcile pass in seconds",
    ))
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

pub static DESIRED_RULES: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("desired_rules", "Desired rules computed by the last reconcile pass")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

pub static RULES_INSTALLED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("rules_installed_total", "Rule install operations issued")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static RULE_WRITE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("rule_write_errors_total", "Rule writes that failed on a datapath session")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

/// Force-init every metric so each appears on /metrics before first use.
pub fn force_all() {
    LazyLock::force(&IS_LEADER);
    LazyLock::force(&SWITCHES_CONNECTED);
    LazyLock::force(&POD_EVENTS);
    LazyLock::force(&POLICY_REFRESHES);
    LazyLock::force(&POLICY_REFRESH_ERRORS);
    LazyLock::force(&RECONCILE_PASSES);
    LazyLock::force(&RECONCILE_ABANDONED);
    LazyLock::force(&RECONCILE_DURATION);
    LazyLock::force(&DESIRED_RULES);
    LazyLock::force(&RULES_INSTALLED);
    LazyLock::force(&RULE_WRITE_ERRORS);
}
