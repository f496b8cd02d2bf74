use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

pub mod stackset;
pub use stackset::*;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TypeMeta {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(rename = "kind")]
    pub kind: String,
}

/// Kinds of resources tracked in the registry.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    StackSet,
    Stack,
    Deployment,
    Service,
    HorizontalPodAutoscaler,
    Ingress,
}

impl ResourceKind {
    /// Registry key prefix for this kind.
    pub fn registry_prefix(&self) -> &'static str {
        match self {
            ResourceKind::StackSet => "/registry/stacksets/",
            ResourceKind::Stack => "/registry/stacks/",
            ResourceKind::Deployment => "/registry/deployments/",
            ResourceKind::Service => "/registry/services/",
            ResourceKind::HorizontalPodAutoscaler => "/registry/horizontalpodautoscalers/",
            ResourceKind::Ingress => "/registry/ingresses/",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::StackSet => "StackSet",
            ResourceKind::Stack => "Stack",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Service => "Service",
            ResourceKind::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
            ResourceKind::Ingress => "Ingress",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub uid: Uuid,
    #[serde(default)]
    pub generation: Option<i64>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(rename = "ownerReferences", default)]
    pub owner_references: Option<Vec<OwnerReference>>,
    #[serde(rename = "creationTimestamp", default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "deletionTimestamp", default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OwnerReference {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: ResourceKind,
    pub name: String,
    pub uid: Uuid,
    #[serde(default)]
    pub controller: bool,
    #[serde(rename = "blockOwnerDeletion", default)]
    pub block_owner_deletion: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct LabelSelector {
    #[serde(rename = "matchLabels", default)]
    pub match_labels: HashMap<String, String>,
}

/// A value that is either a port number or a named port.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum IntOrString {
    Int(i32),
    String(String),
}

impl fmt::Display for IntOrString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntOrString::Int(i) => write!(f, "{i}"),
            IntOrString::String(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContainerPort {
    #[serde(rename = "containerPort")]
    pub container_port: i32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

pub fn default_protocol() -> String {
    "TCP".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Deployment {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: DeploymentSpec,
    #[serde(default)]
    pub status: DeploymentStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DeploymentSpec {
    /// Unset means "keep whatever the deployment currently runs".
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub selector: LabelSelector,
    pub template: PodTemplateSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct DeploymentStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,
    #[serde(rename = "updatedReplicas", default)]
    pub updated_replicas: i32,
    #[serde(rename = "availableReplicas", default)]
    pub available_replicas: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServicePort {
    #[serde(default)]
    pub name: Option<String>,
    pub port: i32,
    #[serde(rename = "targetPort", default)]
    pub target_port: Option<IntOrString>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServiceSpec {
    #[serde(rename = "type", default = "default_service_type")]
    pub service_type: String,
    #[serde(default)]
    pub selector: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(rename = "clusterIP", default)]
    pub cluster_ip: Option<String>,
}

pub fn default_service_type() -> String {
    "ClusterIP".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Service {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ServiceSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CrossVersionObjectReference {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum MetricSourceType {
    Resource,
    Pods,
    Object,
    External,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResourceMetricSource {
    pub name: String,
    #[serde(rename = "targetAverageUtilization", default)]
    pub target_average_utilization: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodsMetricSource {
    #[serde(rename = "metricName")]
    pub metric_name: String,
    #[serde(rename = "targetAverageValue")]
    pub target_average_value: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ObjectMetricSource {
    pub target: CrossVersionObjectReference,
    #[serde(rename = "metricName")]
    pub metric_name: String,
    #[serde(rename = "averageValue", default)]
    pub average_value: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExternalMetricSource {
    #[serde(rename = "metricName")]
    pub metric_name: String,
    #[serde(rename = "metricSelector", default)]
    pub metric_selector: Option<LabelSelector>,
    #[serde(rename = "targetAverageValue", default)]
    pub target_average_value: Option<String>,
}

/// One autoscaling metric in the orchestrator-native shape.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MetricSpec {
    #[serde(rename = "type")]
    pub metric_type: MetricSourceType,
    #[serde(default)]
    pub resource: Option<ResourceMetricSource>,
    #[serde(default)]
    pub pods: Option<PodsMetricSource>,
    #[serde(default)]
    pub object: Option<ObjectMetricSource>,
    #[serde(default)]
    pub external: Option<ExternalMetricSource>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HorizontalPodAutoscaler {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: HorizontalPodAutoscalerSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HorizontalPodAutoscalerSpec {
    #[serde(rename = "scaleTargetRef")]
    pub scale_target_ref: CrossVersionObjectReference,
    #[serde(rename = "minReplicas", default)]
    pub min_replicas: Option<i32>,
    #[serde(rename = "maxReplicas")]
    pub max_replicas: i32,
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Ingress {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: IngressSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct IngressSpec {
    #[serde(default)]
    pub rules: Vec<IngressRule>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct IngressRule {
    pub host: String,
    pub http: HttpIngressRuleValue,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct HttpIngressRuleValue {
    #[serde(default)]
    pub paths: Vec<HttpIngressPath>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HttpIngressPath {
    #[serde(default)]
    pub path: String,
    pub backend: IngressBackend,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct IngressBackend {
    #[serde(rename = "serviceName")]
    pub service_name: String,
    #[serde(rename = "servicePort")]
    pub service_port: IntOrString,
}
