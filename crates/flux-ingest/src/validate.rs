use flux_core::{FluxError, Result};
use flux_types::{is_valid_label_name, is_valid_metric_name, MetricSample};

/// 默认最大标签数
pub const DEFAULT_MAX_LABELS: usize = 32;

/// 样本校验器
///
/// 标签是无模式的，任何合法名称的标签都接受。
#[derive(Debug, Clone)]
pub struct Validator {
    max_labels: usize,
}

impl Validator {
    pub fn new(max_labels: usize) -> Self {
        Self { max_labels }
    }

    pub fn max_labels(&self) -> usize {
        self.max_labels
    }

    pub fn validate(&self, sample: &MetricSample) -> Result<()> {
        if !is_valid_metric_name(&sample.metric) {
            return Err(FluxError::invalid_field(
                "name",
                format!(
                    "metric name '{}' must match [a-zA-Z_:][a-zA-Z0-9_:]*",
                    sample.metric
                ),
            ));
        }

        if !sample.value.is_finite() {
            return Err(FluxError::invalid_field(
                "value",
                format!("value for '{}' must be a finite number", sample.metric),
            ));
        }

        if sample.labels.len() > self.max_labels {
            return Err(FluxError::invalid_field(
                "labels",
                format!(
                    "'{}' has {} labels, at most {} allowed",
                    sample.metric,
                    sample.labels.len(),
                    self.max_labels
                ),
            ));
        }

        if let Some(bad) = sample.labels.keys().find(|k| !is_valid_label_name(k)) {
            return Err(FluxError::invalid_field(
                "labels",
                format!("label name '{}' must match [a-zA-Z_][a-zA-Z0-9_]*", bad),
            ));
        }

        Ok(())
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LABELS)
    }
}
