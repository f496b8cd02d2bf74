//! Pure generators producing the desired downstream objects from the
//! working set. Ownership points at the stack for per-stack resources
//! and at the stackset for the shared ingress; every generated object
//! carries the stack-generation annotation for the writer's diff.

use chrono::{DateTime, Utc};
use common::{
    ContainerSpec, CrossVersionObjectReference, Deployment, DeploymentSpec, HorizontalPodAutoscaler,
    HorizontalPodAutoscalerSpec, HttpIngressPath, HttpIngressRuleValue, Ingress, IngressBackend,
    IngressRule, IngressSpec, IntOrString, LabelSelector, ObjectMeta, OwnerReference, PrescalingStatus,
    ResourceKind, Service, ServicePort, ServiceSpec, StackSetStatus, StackStatus,
};
use std::collections::BTreeMap;

use crate::core::autoscaler::convert_custom_metrics;
use crate::core::types::{
    SELECTOR_LABEL_KEYS, StackContainer, StackSetContainer, limit_labels, merge_labels,
    template_inject_labels,
};
use crate::core::{
    API_VERSION, BACKEND_WEIGHTS_ANNOTATION_KEY, ReconcileError, STACK_GENERATION_ANNOTATION_KEY,
    STACK_TRAFFIC_WEIGHTS_ANNOTATION_KEY, STACKSET_HERITAGE_LABEL_KEY,
};

const API_VERSION_APPS_V1: &str = "apps/v1";
const API_VERSION_AUTOSCALING: &str = "autoscaling/v2beta1";
const API_VERSION_EXTENSIONS: &str = "extensions/v1beta1";

impl StackContainer {
    /// Identity metadata shared by every per-stack resource.
    fn resource_meta(&self) -> ObjectMeta {
        let mut annotations = std::collections::HashMap::new();
        annotations.insert(
            STACK_GENERATION_ANNOTATION_KEY.to_string(),
            self.stack.metadata.generation.unwrap_or(0).to_string(),
        );

        ObjectMeta {
            name: self.name().to_string(),
            namespace: self.namespace().to_string(),
            annotations,
            labels: self.stack.metadata.labels.clone(),
            owner_references: Some(vec![OwnerReference {
                api_version: API_VERSION.to_string(),
                kind: ResourceKind::Stack,
                name: self.name().to_string(),
                uid: self.stack.metadata.uid,
                controller: true,
                block_owner_deletion: None,
            }]),
            ..Default::default()
        }
    }

    /// The replica count to write on the deployment, or `None` to
    /// leave whatever is there.
    ///
    /// Autoscaler-managed replica counts are never overwritten while
    /// the stack is live, but control is reclaimed the moment the
    /// stack must be zeroed.
    fn updated_deployment_replicas(&self, now: DateTime<Utc>) -> Option<i32> {
        let desired = self.desired_replicas();

        if desired != 0 && !self.scaled_down(now) {
            if self.deployment_replicas == 0 {
                // Scaled up from zero, rescale regardless of autoscaling.
                Some(desired)
            } else if !self.is_autoscaled() && desired != self.deployment_replicas {
                Some(desired)
            } else {
                None
            }
        } else if self.deployment_replicas != 0 {
            Some(0)
        } else {
            None
        }
    }

    pub fn generate_deployment(&self, now: DateTime<Utc>) -> Deployment {
        let stack = &self.stack;
        Deployment {
            api_version: API_VERSION_APPS_V1.to_string(),
            kind: "Deployment".to_string(),
            metadata: self.resource_meta(),
            spec: DeploymentSpec {
                replicas: self.updated_deployment_replicas(now),
                selector: LabelSelector {
                    match_labels: limit_labels(&stack.metadata.labels, &SELECTOR_LABEL_KEYS),
                },
                template: template_inject_labels(
                    stack.spec.pod_template.clone(),
                    &stack.metadata.labels,
                ),
            },
            status: Default::default(),
        }
    }

    pub fn generate_service(&self) -> Result<Service, ReconcileError> {
        let backend_port = self.ingress_spec.as_ref().map(|spec| &spec.backend_port);
        let ports = self.service_ports(backend_port)?;

        Ok(Service {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            metadata: self.resource_meta(),
            spec: ServiceSpec {
                service_type: "ClusterIP".to_string(),
                selector: limit_labels(&self.stack.metadata.labels, &SELECTOR_LABEL_KEYS),
                ports,
                cluster_ip: None,
            },
        })
    }

    /// Service ports from the stack spec, or synthesized from the pod
    /// template's container ports when the spec has none. When the
    /// parent ingress names a backend port, at least one port must
    /// match it by number or name.
    fn service_ports(
        &self,
        backend_port: Option<&IntOrString>,
    ) -> Result<Vec<ServicePort>, ReconcileError> {
        let spec_ports = self
            .stack
            .spec
            .service
            .as_ref()
            .map(|s| s.ports.clone())
            .unwrap_or_default();
        let ports = if spec_ports.is_empty() {
            service_ports_from_containers(&self.stack.spec.pod_template.spec.containers)
        } else {
            spec_ports
        };

        if let Some(backend_port) = backend_port {
            let matched = ports.iter().any(|port| match backend_port {
                IntOrString::Int(n) => port.port == *n,
                IntOrString::String(name) => port.name.as_deref() == Some(name),
            });
            if !matched {
                return Err(ReconcileError::PortMismatch(backend_port.clone()));
            }
        }

        Ok(ports)
    }

    /// The autoscaler for this stack, if the spec wants one. Built from
    /// the higher-level `autoscaler` block when present, otherwise a
    /// raw passthrough of `horizontalPodAutoscaler`.
    pub fn generate_hpa(&self) -> Result<Option<HorizontalPodAutoscaler>, ReconcileError> {
        let autoscaler = self.stack.spec.autoscaler.as_ref();
        let hpa_template = self.stack.spec.horizontal_pod_autoscaler.as_ref();

        if autoscaler.is_none() && hpa_template.is_none() {
            return Ok(None);
        }

        let mut metadata = self.resource_meta();
        let mut spec = HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: API_VERSION_APPS_V1.to_string(),
                kind: "Deployment".to_string(),
                name: self.name().to_string(),
            },
            min_replicas: None,
            max_replicas: 0,
            metrics: Vec::new(),
        };

        if let Some(autoscaler) = autoscaler {
            spec.min_replicas = autoscaler.min_replicas;
            spec.max_replicas = autoscaler.max_replicas;
            let (metrics, annotations) =
                convert_custom_metrics(&self.stackset_name, self.name(), &autoscaler.metrics)?;
            spec.metrics = metrics;
            for (k, v) in annotations {
                metadata.annotations.insert(k, v);
            }
        } else if let Some(template) = hpa_template {
            spec.min_replicas = template.min_replicas;
            spec.max_replicas = template.max_replicas;
            spec.metrics = template.metrics.clone();
        }

        // While prescaling, keep at least the prescaled replica count.
        if self.prescaling_active
            && spec
                .min_replicas
                .map(|min| min < self.prescaling_replicas)
                .unwrap_or(true)
        {
            spec.min_replicas = Some(self.prescaling_replicas);
        }

        Ok(Some(HorizontalPodAutoscaler {
            api_version: API_VERSION_AUTOSCALING.to_string(),
            kind: "HorizontalPodAutoscaler".to_string(),
            metadata,
            spec,
        }))
    }

    /// The per-stack ingress: one rule per host, each host prefixed
    /// with the stack name, backed by the per-stack service.
    pub fn generate_ingress(&self) -> Option<Ingress> {
        let ingress_spec = self.ingress_spec.as_ref()?;

        let mut metadata = self.resource_meta();
        for (k, v) in &ingress_spec.annotations {
            metadata.annotations.insert(k.clone(), v.clone());
        }

        let path = HttpIngressPath {
            path: ingress_spec.path.clone(),
            backend: IngressBackend {
                service_name: self.name().to_string(),
                service_port: ingress_spec.backend_port.clone(),
            },
        };

        let rules = ingress_spec
            .hosts
            .iter()
            .map(|host| IngressRule {
                host: format!("{}.{}", self.name(), host),
                http: HttpIngressRuleValue {
                    paths: vec![path.clone()],
                },
            })
            .collect();

        Some(Ingress {
            api_version: API_VERSION_EXTENSIONS.to_string(),
            kind: "Ingress".to_string(),
            metadata,
            spec: IngressSpec { rules },
        })
    }

    pub fn generate_stack_status(&self) -> StackStatus {
        let prescaling = if self.prescaling_active {
            PrescalingStatus {
                active: true,
                replicas: self.prescaling_replicas,
                desired_traffic_weight: self.prescaling_desired_traffic_weight,
                last_traffic_increase: self.prescaling_last_traffic_increase,
            }
        } else {
            PrescalingStatus::default()
        };

        StackStatus {
            actual_traffic_weight: self.actual_traffic_weight,
            desired_traffic_weight: self.desired_traffic_weight,
            replicas: self.created_replicas,
            ready_replicas: self.ready_replicas,
            updated_replicas: self.updated_replicas,
            desired_replicas: self.desired_replicas(),
            prescaling,
            no_traffic_since: self.no_traffic_since,
        }
    }
}

/// Synthesize service ports from the pod template's container ports.
/// Names default to `port-<containerIdx>-<portIdx>`, the protocol to
/// TCP, and the target port to the container port.
fn service_ports_from_containers(containers: &[ContainerSpec]) -> Vec<ServicePort> {
    let mut ports = Vec::new();
    for (i, container) in containers.iter().enumerate() {
        for (j, port) in container.ports.iter().enumerate() {
            let name = match &port.name {
                Some(name) if !name.is_empty() => name.clone(),
                _ => format!("port-{i}-{j}"),
            };
            let protocol = if port.protocol.is_empty() {
                "TCP".to_string()
            } else {
                port.protocol.clone()
            };
            ports.push(ServicePort {
                name: Some(name),
                port: port.container_port,
                target_port: Some(IntOrString::Int(port.container_port)),
                protocol,
            });
        }
    }
    ports
}

impl StackSetContainer {
    /// The shared ingress carrying the weighted traffic split: one path
    /// per stack with positive actual weight, sorted by backend service
    /// name for stable output, plus the serialized weight maps.
    pub fn generate_ingress(&self) -> Result<Option<Ingress>, ReconcileError> {
        let stackset = &self.stackset;
        let Some(ingress_spec) = &stackset.spec.ingress else {
            return Ok(None);
        };

        let mut heritage_label = std::collections::HashMap::new();
        heritage_label.insert(
            STACKSET_HERITAGE_LABEL_KEY.to_string(),
            stackset.metadata.name.clone(),
        );
        let labels = merge_labels(&[&heritage_label, &stackset.metadata.labels]);

        // BTreeMaps keep the serialized annotations byte-stable across
        // reconciliations.
        let mut actual_weights = BTreeMap::new();
        let mut desired_weights = BTreeMap::new();
        let mut paths = Vec::new();

        for sc in &self.stack_containers {
            if sc.actual_traffic_weight > 0.0 {
                actual_weights.insert(sc.name().to_string(), sc.actual_traffic_weight);
                paths.push(HttpIngressPath {
                    path: ingress_spec.path.clone(),
                    backend: IngressBackend {
                        service_name: sc.name().to_string(),
                        service_port: ingress_spec.backend_port.clone(),
                    },
                });
            }
            if sc.desired_traffic_weight > 0.0 {
                desired_weights.insert(sc.name().to_string(), sc.desired_traffic_weight);
            }
        }

        if paths.is_empty() {
            return Err(ReconcileError::NoPaths);
        }
        paths.sort_by(|a, b| a.backend.service_name.cmp(&b.backend.service_name));

        let mut annotations = ingress_spec.annotations.clone();
        annotations.insert(
            BACKEND_WEIGHTS_ANNOTATION_KEY.to_string(),
            serde_json::to_string(&actual_weights).unwrap_or_default(),
        );
        annotations.insert(
            STACK_TRAFFIC_WEIGHTS_ANNOTATION_KEY.to_string(),
            serde_json::to_string(&desired_weights).unwrap_or_default(),
        );

        let rules = ingress_spec
            .hosts
            .iter()
            .map(|host| IngressRule {
                host: host.clone(),
                http: HttpIngressRuleValue {
                    paths: paths.clone(),
                },
            })
            .collect();

        Ok(Some(Ingress {
            api_version: API_VERSION_EXTENSIONS.to_string(),
            kind: "Ingress".to_string(),
            metadata: ObjectMeta {
                name: stackset.metadata.name.clone(),
                namespace: stackset.metadata.namespace.clone(),
                labels,
                annotations,
                owner_references: Some(vec![OwnerReference {
                    api_version: stackset.api_version.clone(),
                    kind: ResourceKind::StackSet,
                    name: stackset.metadata.name.clone(),
                    uid: stackset.metadata.uid,
                    controller: true,
                    block_owner_deletion: None,
                }]),
                ..Default::default()
            },
            spec: IngressSpec { rules },
        }))
    }

    /// Roll per-stack observations up into the stackset status.
    /// Pending-removal stacks are not counted.
    pub fn generate_stackset_status(&self) -> StackSetStatus {
        let mut status = StackSetStatus {
            stacks: 0,
            ready_stacks: 0,
            stacks_with_traffic: 0,
            observed_stack_version: self.stackset.status.observed_stack_version.clone(),
        };

        for sc in &self.stack_containers {
            if sc.pending_removal {
                continue;
            }
            status.stacks += 1;
            if sc.has_traffic() {
                status.stacks_with_traffic += 1;
            }
            if sc.is_ready() {
                status.ready_stacks += 1;
            }
        }
        status
    }
}
