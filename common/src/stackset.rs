//! StackSet and Stack custom resources.
//!
//! A StackSet declares a long-lived application and a template for
//! producing immutable versioned Stacks. Each Stack owns a deployment,
//! a service, an optional autoscaler and may take part in a weighted
//! traffic split at the shared ingress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{IntOrString, MetricSpec, ObjectMeta, PodTemplateSpec, ServicePort};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StackSet {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: StackSetSpec,
    #[serde(default)]
    pub status: StackSetStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StackSetSpec {
    #[serde(default)]
    pub ingress: Option<StackSetIngressSpec>,
    #[serde(rename = "stackLifecycle", default)]
    pub stack_lifecycle: StackLifecycle,
    #[serde(rename = "stackTemplate")]
    pub stack_template: StackTemplate,
}

/// Retention policy for historical stacks. Unset fields fall back to
/// the controller defaults; unset is not the same as zero.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct StackLifecycle {
    #[serde(rename = "scaledownTTLSeconds", default)]
    pub scaledown_ttl_seconds: Option<i64>,
    #[serde(default)]
    pub limit: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StackSetIngressSpec {
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(rename = "backendPort")]
    pub backend_port: IntOrString,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StackTemplate {
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    pub spec: StackSpecTemplate,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StackSpecTemplate {
    /// Drives the name of the next stack; empty means the default.
    #[serde(default)]
    pub version: String,
    #[serde(flatten)]
    pub stack_spec: StackSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StackSpec {
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(rename = "horizontalPodAutoscaler", default)]
    pub horizontal_pod_autoscaler: Option<HorizontalPodAutoscalerTemplate>,
    #[serde(default)]
    pub service: Option<StackServiceSpec>,
    #[serde(rename = "podTemplate", default)]
    pub pod_template: PodTemplateSpec,
    #[serde(default)]
    pub autoscaler: Option<Autoscaler>,
}

/// Raw HPA passthrough: metrics are already in the native shape.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HorizontalPodAutoscalerTemplate {
    #[serde(rename = "minReplicas", default)]
    pub min_replicas: Option<i32>,
    #[serde(rename = "maxReplicas")]
    pub max_replicas: i32,
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct StackServiceSpec {
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

/// Higher-level autoscaler spec with custom metric types that the
/// controller translates into the native HPA shape.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Autoscaler {
    #[serde(rename = "minReplicas", default)]
    pub min_replicas: Option<i32>,
    #[serde(rename = "maxReplicas")]
    pub max_replicas: i32,
    #[serde(default)]
    pub metrics: Vec<AutoscalerMetrics>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum AutoscalerMetricType {
    #[serde(rename = "CPU")]
    Cpu,
    AmazonSQS,
    PodJSON,
    Ingress,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AutoscalerMetrics {
    #[serde(rename = "type")]
    pub metric_type: AutoscalerMetricType,
    #[serde(default)]
    pub average: Option<String>,
    #[serde(rename = "averageUtilization", default)]
    pub average_utilization: Option<i32>,
    #[serde(default)]
    pub endpoint: Option<MetricsEndpoint>,
    #[serde(default)]
    pub queue: Option<MetricsQueue>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MetricsEndpoint {
    pub port: i32,
    pub path: String,
    pub key: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MetricsQueue {
    pub name: String,
    pub region: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct StackSetStatus {
    #[serde(default)]
    pub stacks: i32,
    #[serde(rename = "readyStacks", default)]
    pub ready_stacks: i32,
    #[serde(rename = "stacksWithTraffic", default)]
    pub stacks_with_traffic: i32,
    #[serde(rename = "observedStackVersion", default)]
    pub observed_stack_version: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Stack {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: StackSpec,
    #[serde(default)]
    pub status: StackStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct StackStatus {
    #[serde(rename = "actualTrafficWeight", default)]
    pub actual_traffic_weight: f64,
    #[serde(rename = "desiredTrafficWeight", default)]
    pub desired_traffic_weight: f64,
    #[serde(default)]
    pub replicas: i32,
    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,
    #[serde(rename = "updatedReplicas", default)]
    pub updated_replicas: i32,
    #[serde(rename = "desiredReplicas", default)]
    pub desired_replicas: i32,
    #[serde(default)]
    pub prescaling: PrescalingStatus,
    #[serde(rename = "noTrafficSince", default)]
    pub no_traffic_since: Option<DateTime<Utc>>,
}

/// Populated only while prescaling is active.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PrescalingStatus {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub replicas: i32,
    #[serde(rename = "desiredTrafficWeight", default)]
    pub desired_traffic_weight: f64,
    #[serde(rename = "lastTrafficIncrease", default)]
    pub last_traffic_increase: Option<DateTime<Utc>>,
}
