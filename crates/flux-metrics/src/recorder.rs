use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// 描述所有指标
pub fn describe_metrics() {
    // 采集
    describe_counter!(
        "flux_monitor_samples_accepted_total",
        "Total number of samples accepted by the ingestion pipeline"
    );
    describe_counter!(
        "flux_monitor_samples_rejected_total",
        "Total number of samples rejected by validation"
    );
    describe_counter!(
        "flux_monitor_samples_flushed_total",
        "Total number of samples written to the store"
    );
    describe_counter!(
        "flux_monitor_flushes_failed_total",
        "Total number of failed buffer flushes"
    );
    describe_gauge!(
        "flux_monitor_ingest_buffered",
        "Number of samples waiting in the ingestion buffer"
    );

    // 查询与存储
    describe_counter!("flux_monitor_queries_total", "Total number of queries executed");
    describe_histogram!(
        "flux_monitor_query_duration_seconds",
        "Query duration in seconds"
    );
    describe_counter!(
        "flux_monitor_rollups_written_total",
        "Total number of hourly rollups written by downsampling"
    );
    describe_counter!(
        "flux_monitor_retention_deleted_total",
        "Total number of samples and rollups removed by retention"
    );

    // 规则评估
    describe_counter!(
        "flux_monitor_rule_evaluations_total",
        "Total number of rule evaluations"
    );
    describe_counter!(
        "flux_monitor_rule_evaluation_failures_total",
        "Total number of failed rule evaluations"
    );
    describe_histogram!(
        "flux_monitor_evaluation_duration_seconds",
        "Duration of a full evaluation cycle in seconds"
    );
    describe_counter!(
        "flux_monitor_anomaly_trainings_total",
        "Total number of anomaly model trainings"
    );

    // 告警
    describe_gauge!("flux_monitor_alerts_firing", "Number of firing alerts");
    describe_counter!("flux_monitor_alerts_created_total", "Total number of alerts created");
    describe_counter!("flux_monitor_alerts_resolved_total", "Total number of alerts resolved");
    describe_counter!(
        "flux_monitor_alerts_suppressed_total",
        "Total number of alerts whose notification was suppressed by correlation"
    );

    // 通知
    describe_counter!(
        "flux_monitor_notifications_sent_total",
        "Total number of notifications sent"
    );
    describe_counter!(
        "flux_monitor_notifications_failed_total",
        "Total number of failed notification attempts"
    );
    describe_counter!(
        "flux_monitor_notifications_rate_limited_total",
        "Total number of notifications suppressed by rate limiting"
    );
    describe_counter!(
        "flux_monitor_delivery_failures_total",
        "Total number of notifications that exhausted their retries"
    );

    // HTTP API
    describe_counter!(
        "flux_monitor_http_requests_total",
        "Total number of HTTP requests"
    );
}

pub fn record_samples_accepted(count: usize) {
    counter!("flux_monitor_samples_accepted_total", count as u64);
}

pub fn record_samples_rejected(count: usize) {
    counter!("flux_monitor_samples_rejected_total", count as u64);
}

pub fn record_samples_flushed(count: usize) {
    counter!("flux_monitor_samples_flushed_total", count as u64);
}

pub fn record_flush_failed() {
    counter!("flux_monitor_flushes_failed_total", 1);
}

pub fn set_ingest_buffered(count: usize) {
    gauge!("flux_monitor_ingest_buffered", count as f64);
}

pub fn record_query(duration_secs: f64) {
    counter!("flux_monitor_queries_total", 1);
    histogram!("flux_monitor_query_duration_seconds", duration_secs);
}

pub fn record_rollups_written(count: usize) {
    counter!("flux_monitor_rollups_written_total", count as u64);
}

pub fn record_retention_deleted(count: usize) {
    counter!("flux_monitor_retention_deleted_total", count as u64);
}

pub fn record_rule_evaluation() {
    counter!("flux_monitor_rule_evaluations_total", 1);
}

/// 记录规则评估失败，`reason` 取值 error / timeout / panic
pub fn record_rule_evaluation_failure(reason: &'static str) {
    counter!("flux_monitor_rule_evaluation_failures_total", 1, "reason" => reason);
}

pub fn record_evaluation_duration(duration_secs: f64) {
    histogram!("flux_monitor_evaluation_duration_seconds", duration_secs);
}

pub fn record_anomaly_training() {
    counter!("flux_monitor_anomaly_trainings_total", 1);
}

pub fn set_alerts_firing(count: usize) {
    gauge!("flux_monitor_alerts_firing", count as f64);
}

pub fn record_alert_created() {
    counter!("flux_monitor_alerts_created_total", 1);
}

pub fn record_alert_resolved() {
    counter!("flux_monitor_alerts_resolved_total", 1);
}

pub fn record_alert_suppressed() {
    counter!("flux_monitor_alerts_suppressed_total", 1);
}

pub fn record_notification_sent(channel_type: &str) {
    counter!("flux_monitor_notifications_sent_total", 1, "channel" => channel_type.to_string());
}

pub fn record_notification_failed(channel_type: &str) {
    counter!("flux_monitor_notifications_failed_total", 1, "channel" => channel_type.to_string());
}

pub fn record_notification_rate_limited(channel_type: &str) {
    counter!("flux_monitor_notifications_rate_limited_total", 1, "channel" => channel_type.to_string());
}

pub fn record_delivery_failure() {
    counter!("flux_monitor_delivery_failures_total", 1);
}

pub fn record_http_request() {
    counter!("flux_monitor_http_requests_total", 1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        describe_metrics();
        record_samples_accepted(2);
        record_rule_evaluation_failure("timeout");
        record_notification_rate_limited("slack");
        set_alerts_firing(3);
    }
}
