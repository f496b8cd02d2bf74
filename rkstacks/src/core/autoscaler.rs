//! Translation of autoscaler custom metrics into the native HPA
//! metric shape. Some metric types carry extra configuration that has
//! no place in the metric spec; it is emitted as annotations which the
//! metrics adapter picks up, opaque to this controller.

use common::{
    AutoscalerMetricType, AutoscalerMetrics, CrossVersionObjectReference, ExternalMetricSource,
    LabelSelector, MetricSourceType, MetricSpec, ObjectMetricSource, PodsMetricSource,
    ResourceMetricSource,
};
use std::collections::HashMap;

use crate::core::ReconcileError;

const REQUESTS_PER_SECOND_NAME: &str = "requests-per-second";
const METRIC_CONFIG_JSON_PATH_PREFIX: &str = "metric-config.pods";
const AMAZON_SQS_METRIC_NAME: &str = "sqs-queue-length";

/// Convert the custom metrics of an autoscaler spec to native metric
/// specs plus any adapter annotations.
pub fn convert_custom_metrics(
    stackset_name: &str,
    stack_name: &str,
    metrics: &[AutoscalerMetrics],
) -> Result<(Vec<MetricSpec>, HashMap<String, String>), ReconcileError> {
    let mut specs = Vec::with_capacity(metrics.len());
    let mut annotations = HashMap::new();

    for metric in metrics {
        let spec = match metric.metric_type {
            AutoscalerMetricType::Cpu => cpu_metric(metric)?,
            AutoscalerMetricType::AmazonSQS => sqs_metric(metric)?,
            AutoscalerMetricType::PodJSON => pod_json_metric(metric, &mut annotations)?,
            AutoscalerMetricType::Ingress => ingress_metric(metric, stackset_name, stack_name)?,
        };
        specs.push(spec);
    }

    Ok((specs, annotations))
}

fn cpu_metric(metric: &AutoscalerMetrics) -> Result<MetricSpec, ReconcileError> {
    let utilization = metric.average_utilization.ok_or_else(|| {
        ReconcileError::CustomMetricTranslation("CPU metric requires averageUtilization".to_string())
    })?;
    Ok(MetricSpec {
        metric_type: MetricSourceType::Resource,
        resource: Some(ResourceMetricSource {
            name: "cpu".to_string(),
            target_average_utilization: Some(utilization),
        }),
        pods: None,
        object: None,
        external: None,
    })
}

fn sqs_metric(metric: &AutoscalerMetrics) -> Result<MetricSpec, ReconcileError> {
    let queue = metric.queue.as_ref().ok_or_else(|| {
        ReconcileError::CustomMetricTranslation("AmazonSQS metric requires queue".to_string())
    })?;
    let average = metric.average.clone().ok_or_else(|| {
        ReconcileError::CustomMetricTranslation("AmazonSQS metric requires average".to_string())
    })?;

    let mut match_labels = HashMap::new();
    match_labels.insert("queue-name".to_string(), queue.name.clone());
    match_labels.insert("region".to_string(), queue.region.clone());

    Ok(MetricSpec {
        metric_type: MetricSourceType::External,
        resource: None,
        pods: None,
        object: None,
        external: Some(ExternalMetricSource {
            metric_name: AMAZON_SQS_METRIC_NAME.to_string(),
            metric_selector: Some(LabelSelector { match_labels }),
            target_average_value: Some(average),
        }),
    })
}

fn pod_json_metric(
    metric: &AutoscalerMetrics,
    annotations: &mut HashMap<String, String>,
) -> Result<MetricSpec, ReconcileError> {
    let endpoint = metric.endpoint.as_ref().ok_or_else(|| {
        ReconcileError::CustomMetricTranslation("PodJSON metric requires endpoint".to_string())
    })?;
    let average = metric.average.clone().ok_or_else(|| {
        ReconcileError::CustomMetricTranslation("PodJSON metric requires average".to_string())
    })?;

    // The adapter reads where and how to scrape from annotations.
    let prefix = format!("{}.{}.json-path", METRIC_CONFIG_JSON_PATH_PREFIX, endpoint.name);
    annotations.insert(format!("{prefix}/json-key"), endpoint.key.clone());
    annotations.insert(format!("{prefix}/path"), endpoint.path.clone());
    annotations.insert(format!("{prefix}/port"), endpoint.port.to_string());

    Ok(MetricSpec {
        metric_type: MetricSourceType::Pods,
        resource: None,
        pods: Some(PodsMetricSource {
            metric_name: endpoint.name.clone(),
            target_average_value: average,
        }),
        object: None,
        external: None,
    })
}

fn ingress_metric(
    metric: &AutoscalerMetrics,
    stackset_name: &str,
    stack_name: &str,
) -> Result<MetricSpec, ReconcileError> {
    let average = metric.average.clone().ok_or_else(|| {
        ReconcileError::CustomMetricTranslation("Ingress metric requires average".to_string())
    })?;

    Ok(MetricSpec {
        metric_type: MetricSourceType::Object,
        resource: None,
        pods: None,
        object: Some(ObjectMetricSource {
            target: CrossVersionObjectReference {
                api_version: "extensions/v1beta1".to_string(),
                kind: "Ingress".to_string(),
                name: stackset_name.to_string(),
            },
            metric_name: format!("{REQUESTS_PER_SECOND_NAME},{stack_name}"),
            average_value: Some(average),
        }),
        external: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{MetricsEndpoint, MetricsQueue};

    fn metric(metric_type: AutoscalerMetricType) -> AutoscalerMetrics {
        AutoscalerMetrics {
            metric_type,
            average: None,
            average_utilization: None,
            endpoint: None,
            queue: None,
        }
    }

    #[test]
    fn cpu_metric_requires_utilization() {
        let err = convert_custom_metrics("foo", "foo-v1", &[metric(AutoscalerMetricType::Cpu)]);
        assert!(err.is_err());

        let mut m = metric(AutoscalerMetricType::Cpu);
        m.average_utilization = Some(80);
        let (specs, annotations) = convert_custom_metrics("foo", "foo-v1", &[m]).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].metric_type, MetricSourceType::Resource);
        assert!(annotations.is_empty());
    }

    #[test]
    fn sqs_metric_builds_external_source() {
        let mut m = metric(AutoscalerMetricType::AmazonSQS);
        m.queue = Some(MetricsQueue {
            name: "events".to_string(),
            region: "eu-central-1".to_string(),
        });
        m.average = Some("30".to_string());

        let (specs, _) = convert_custom_metrics("foo", "foo-v1", &[m]).unwrap();
        let external = specs[0].external.as_ref().unwrap();
        assert_eq!(external.metric_name, AMAZON_SQS_METRIC_NAME);
        let selector = external.metric_selector.as_ref().unwrap();
        assert_eq!(selector.match_labels.get("queue-name").unwrap(), "events");
    }

    #[test]
    fn pod_json_metric_emits_adapter_annotations() {
        let mut m = metric(AutoscalerMetricType::PodJSON);
        m.endpoint = Some(MetricsEndpoint {
            port: 9090,
            path: "/metrics".to_string(),
            key: "$.queue.depth".to_string(),
            name: "queue-depth".to_string(),
        });
        m.average = Some("10".to_string());

        let (specs, annotations) = convert_custom_metrics("foo", "foo-v1", &[m]).unwrap();
        assert_eq!(specs[0].metric_type, MetricSourceType::Pods);
        assert_eq!(
            annotations
                .get("metric-config.pods.queue-depth.json-path/port")
                .unwrap(),
            "9090"
        );
    }

    #[test]
    fn ingress_metric_targets_shared_ingress() {
        let mut m = metric(AutoscalerMetricType::Ingress);
        m.average = Some("1500".to_string());

        let (specs, _) = convert_custom_metrics("foo", "foo-v1", &[m]).unwrap();
        let object = specs[0].object.as_ref().unwrap();
        assert_eq!(object.target.name, "foo");
        assert_eq!(object.metric_name, "requests-per-second,foo-v1");
    }
}
