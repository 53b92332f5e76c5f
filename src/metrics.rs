//! prometheus counters the pipeline pushes into; scraped through the
//! admin API

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounterVec, IntGaugeVec,
    TextEncoder,
};

use crate::receiver::snapshot::{SyncMapResult, VerifyResult};

lazy_static! {
    /// milliseconds spent in the last cooking pass
    pub static ref COOK_TIME_MS: IntGaugeVec = register_int_gauge_vec!(
        "xdpdns_cooker_cook_time_ms",
        "Duration of the last cooking pass in milliseconds",
        &[]
    )
    .unwrap();

    /// map mutations performed by cooking passes
    pub static ref COOK_SYNC_TOTAL: IntCounterVec = register_int_counter_vec!(
        "xdpdns_cooker_sync_total",
        "Records created and removed in the kernel maps by the cooker",
        &["mode", "op"]
    )
    .unwrap();

    /// verifier per-class counters of the last pass
    pub static ref VERIFY_RESULT: IntGaugeVec = register_int_gauge_vec!(
        "xdpdns_verify_result",
        "Verifier delta classes of the last pass",
        &["class"]
    )
    .unwrap();

    /// NOTIFY requests by outcome
    pub static ref NOTIFY_TOTAL: IntCounterVec = register_int_counter_vec!(
        "xdpdns_notify_total",
        "NOTIFY requests by outcome",
        &["outcome"]
    )
    .unwrap();

    /// per zone transfer times
    pub static ref ZONE_TRANSFER_MS: IntGaugeVec = register_int_gauge_vec!(
        "xdpdns_receiver_zone_transfer_ms",
        "Duration of the last transfer per zone in milliseconds",
        &["zone"]
    )
    .unwrap();
}

pub fn observe_cook_time(ms: i64) {
    COOK_TIME_MS.with_label_values(&[]).set(ms);
}

pub fn observe_cook_sync(bulk: bool, result: &SyncMapResult) {
    let mode = if bulk { "axfr" } else { "ixfr" };
    COOK_SYNC_TOTAL
        .with_label_values(&[mode, "create"])
        .inc_by(result.created as u64);
    COOK_SYNC_TOTAL
        .with_label_values(&[mode, "remove"])
        .inc_by(result.removed as u64);
}

pub fn observe_verify(result: &VerifyResult) {
    let classes = [
        ("total", result.total),
        ("verified", result.verified),
        ("missed", result.missed),
        ("differ-on-ttl", result.differ_on_ttl),
        ("differ-on-ip", result.differ_on_ip),
        ("unexpected", result.unexpected),
    ];
    for (class, value) in classes {
        VERIFY_RESULT
            .with_label_values(&[class])
            .set(value as i64);
    }
}

pub fn observe_notify(accepted: bool) {
    let outcome = if accepted { "accepted" } else { "refused" };
    NOTIFY_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn observe_zone_transfer(zone: &str, ms: i64) {
    ZONE_TRANSFER_MS.with_label_values(&[zone]).set(ms);
}

/// Render the default registry in text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();

    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        observe_cook_sync(
            false,
            &SyncMapResult {
                created: 3,
                removed: 1,
            },
        );
        observe_notify(true);
        observe_notify(false);
        observe_cook_time(42);

        let rendered = gather();
        assert!(rendered.contains("xdpdns_cooker_sync_total"));
        assert!(rendered.contains("xdpdns_notify_total"));
    }
}
