//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Federation Metrics
    pub static ref ACTIVITYPUB_ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("folio_activitypub_activities_received_total", "Total number of ActivityPub activities received"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref ACTIVITYPUB_ACTIVITIES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("folio_activitypub_activities_sent_total", "Total number of ActivityPub activities sent"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref FEDERATION_DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("folio_federation_deliveries_total", "Total number of outbound inbox deliveries"),
        &["status"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("folio_federation_requests_total", "Total number of federation requests"),
        &["direction", "status"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "folio_federation_request_duration_seconds",
            "Federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["direction"]
    ).expect("metric can be created");
    pub static ref SIGNATURE_VERIFICATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("folio_signature_verifications_total", "Total number of inbound signature checks"),
        &["result"]
    ).expect("metric can be created");

    // Storage Metrics
    pub static ref STORAGE_COMMITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("folio_storage_commits_total", "Total number of federation data commits"),
        &["result"]
    ).expect("metric can be created");
    pub static ref FOLLOWERS_TOTAL: IntGaugeVec = IntGaugeVec::new(
        Opts::new("folio_followers_total", "Number of followers per local user"),
        &["username"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("folio_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

static INIT: std::sync::Once = std::sync::Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once; registration happens on the first call.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(ACTIVITYPUB_ACTIVITIES_RECEIVED.clone()))
            .expect("ACTIVITYPUB_ACTIVITIES_RECEIVED can be registered");
        REGISTRY
            .register(Box::new(ACTIVITYPUB_ACTIVITIES_SENT.clone()))
            .expect("ACTIVITYPUB_ACTIVITIES_SENT can be registered");
        REGISTRY
            .register(Box::new(FEDERATION_DELIVERIES_TOTAL.clone()))
            .expect("FEDERATION_DELIVERIES_TOTAL can be registered");
        REGISTRY
            .register(Box::new(FEDERATION_REQUESTS_TOTAL.clone()))
            .expect("FEDERATION_REQUESTS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()))
            .expect("FEDERATION_REQUEST_DURATION_SECONDS can be registered");
        REGISTRY
            .register(Box::new(SIGNATURE_VERIFICATIONS_TOTAL.clone()))
            .expect("SIGNATURE_VERIFICATIONS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(STORAGE_COMMITS_TOTAL.clone()))
            .expect("STORAGE_COMMITS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(FOLLOWERS_TOTAL.clone()))
            .expect("FOLLOWERS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(ERRORS_TOTAL.clone()))
            .expect("ERRORS_TOTAL can be registered");

        tracing::info!("Metrics registry initialized");
    });
}
