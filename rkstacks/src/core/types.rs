use chrono::{DateTime, Duration, Utc};
use common::{
    Deployment, HorizontalPodAutoscaler, Ingress, PodTemplateSpec, Service, Stack, StackSet,
    StackSetIngressSpec,
};
use std::collections::HashMap;

use crate::core::{
    BACKEND_WEIGHTS_ANNOTATION_KEY, DEFAULT_SCALEDOWN_TTL_SECONDS, STACK_TRAFFIC_WEIGHTS_ANNOTATION_KEY,
    STACK_VERSION_LABEL_KEY, STACKSET_HERITAGE_LABEL_KEY,
};

/// Label keys allowed into deployment and service selectors.
pub const SELECTOR_LABEL_KEYS: [&str; 2] = [STACKSET_HERITAGE_LABEL_KEY, STACK_VERSION_LABEL_KEY];

/// The working set of one reconciliation: a stackset plus one
/// [`StackContainer`] per owned stack, enriched with observed
/// downstream state. Built fresh per tick and destroyed at its end.
#[derive(Debug, Clone)]
pub struct StackSetContainer {
    pub stackset: StackSet,
    pub stack_containers: Vec<StackContainer>,
    /// Observed shared ingress, if one exists.
    pub ingress: Option<Ingress>,
}

/// A stack plus its observed downstream facts.
#[derive(Debug, Clone)]
pub struct StackContainer {
    pub stack: Stack,

    /// Set by the lifecycle decider; an instruction to the external
    /// deleter, never acted on inside the core.
    pub pending_removal: bool,

    // Observed downstream resources, as read from the cache.
    pub deployment: Option<Deployment>,
    pub service: Option<Service>,
    pub hpa: Option<HorizontalPodAutoscaler>,
    pub ingress: Option<Ingress>,

    // From the parent stackset.
    pub stackset_name: String,
    pub ingress_spec: Option<StackSetIngressSpec>,
    pub scaledown_ttl: Duration,

    // From the stack spec, defaults applied.
    pub stack_replicas: i32,

    // From the observed deployment.
    pub deployment_replicas: i32,
    pub created_replicas: i32,
    pub ready_replicas: i32,
    pub updated_replicas: i32,

    // Traffic bookkeeping, restored from the stack status and the
    // shared-ingress annotations.
    pub actual_traffic_weight: f64,
    pub desired_traffic_weight: f64,
    pub no_traffic_since: Option<DateTime<Utc>>,
    pub prescaling_active: bool,
    pub prescaling_replicas: i32,
    pub prescaling_desired_traffic_weight: f64,
    pub prescaling_last_traffic_increase: Option<DateTime<Utc>>,
}

impl StackContainer {
    pub fn new(
        stack: Stack,
        stackset_name: String,
        ingress_spec: Option<StackSetIngressSpec>,
        scaledown_ttl: Duration,
    ) -> Self {
        let stack_replicas = stack.spec.replicas.unwrap_or(1);
        let status = stack.status.clone();
        Self {
            stack,
            pending_removal: false,
            deployment: None,
            service: None,
            hpa: None,
            ingress: None,
            stackset_name,
            ingress_spec,
            scaledown_ttl,
            stack_replicas,
            deployment_replicas: 0,
            created_replicas: 0,
            ready_replicas: 0,
            updated_replicas: 0,
            actual_traffic_weight: 0.0,
            desired_traffic_weight: 0.0,
            no_traffic_since: status.no_traffic_since,
            prescaling_active: status.prescaling.active,
            prescaling_replicas: status.prescaling.replicas,
            prescaling_desired_traffic_weight: status.prescaling.desired_traffic_weight,
            prescaling_last_traffic_increase: status.prescaling.last_traffic_increase,
        }
    }

    pub fn name(&self) -> &str {
        &self.stack.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.stack.metadata.namespace
    }

    /// A stack has traffic if it either serves requests or is about to.
    pub fn has_traffic(&self) -> bool {
        self.actual_traffic_weight > 0.0 || self.desired_traffic_weight > 0.0
    }

    pub fn is_autoscaled(&self) -> bool {
        self.stack.spec.autoscaler.is_some() || self.stack.spec.horizontal_pod_autoscaler.is_some()
    }

    /// Idle long enough to run zero replicas and become a GC candidate.
    pub fn scaled_down(&self, now: DateTime<Utc>) -> bool {
        if self.has_traffic() {
            return false;
        }
        match self.no_traffic_since {
            Some(since) => now.signed_duration_since(since) >= self.scaledown_ttl,
            None => false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.deployment_replicas >= 1
            && self.deployment_replicas == self.ready_replicas
            && self.deployment_replicas == self.updated_replicas
    }

    /// The replica count this stack should run right now.
    pub fn desired_replicas(&self) -> i32 {
        if self.prescaling_active {
            self.prescaling_replicas
        } else {
            self.stack_replicas
        }
    }

    /// Pull the replica counters out of the observed deployment.
    fn update_from_resources(&mut self) {
        if let Some(deployment) = &self.deployment {
            self.deployment_replicas = deployment.spec.replicas.unwrap_or(0);
            self.created_replicas = deployment.status.replicas;
            self.ready_replicas = deployment.status.ready_replicas;
            self.updated_replicas = deployment.status.updated_replicas;
        }
    }
}

impl StackSetContainer {
    /// Wrap a stackset and its owned stacks into a working set. The
    /// inputs are cloned by the caller; the container owns its graph.
    pub fn new(stackset: StackSet, stacks: Vec<Stack>) -> Self {
        let ingress_spec = stackset.spec.ingress.clone();
        let scaledown_ttl = Duration::seconds(
            stackset
                .spec
                .stack_lifecycle
                .scaledown_ttl_seconds
                .unwrap_or(DEFAULT_SCALEDOWN_TTL_SECONDS),
        );
        let name = stackset.metadata.name.clone();
        let stack_containers = stacks
            .into_iter()
            .map(|stack| {
                StackContainer::new(stack, name.clone(), ingress_spec.clone(), scaledown_ttl)
            })
            .collect();
        Self {
            stackset,
            stack_containers,
            ingress: None,
        }
    }

    pub fn stack_by_name(&self, name: &str) -> Option<&StackContainer> {
        self.stack_containers.iter().find(|sc| sc.name() == name)
    }

    /// Refresh every container's derived facts from the observed
    /// resources: replica counters from the deployments, traffic
    /// weights from the shared-ingress annotations.
    pub fn update_from_resources(&mut self) {
        let actual = self.ingress_weights(BACKEND_WEIGHTS_ANNOTATION_KEY);
        let desired = self.ingress_weights(STACK_TRAFFIC_WEIGHTS_ANNOTATION_KEY);

        for sc in &mut self.stack_containers {
            sc.update_from_resources();
            sc.actual_traffic_weight = actual.get(sc.stack.metadata.name.as_str()).copied().unwrap_or(0.0);
            sc.desired_traffic_weight = desired.get(sc.stack.metadata.name.as_str()).copied().unwrap_or(0.0);
        }
    }

    /// Parse a weight map off the shared ingress. Missing annotation,
    /// missing stack, or unparseable JSON all mean zero weight.
    fn ingress_weights(&self, annotation: &str) -> HashMap<String, f64> {
        self.ingress
            .as_ref()
            .and_then(|ing| ing.metadata.annotations.get(annotation))
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

/// Merge label sets left to right; later sets win on key conflicts.
pub fn merge_labels(sets: &[&HashMap<String, String>]) -> HashMap<String, String> {
    let mut merged = HashMap::new();
    for set in sets {
        for (k, v) in set.iter() {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Keep only the labels with a key in `valid_keys`.
pub fn limit_labels(
    labels: &HashMap<String, String>,
    valid_keys: &[&str],
) -> HashMap<String, String> {
    labels
        .iter()
        .filter(|(k, _)| valid_keys.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Inject labels into a pod template without overwriting ones that are
/// already set explicitly.
pub fn template_inject_labels(
    mut template: PodTemplateSpec,
    labels: &HashMap<String, String>,
) -> PodTemplateSpec {
    for (k, v) in labels.iter() {
        template
            .metadata
            .labels
            .entry(k.clone())
            .or_insert_with(|| v.clone());
    }
    template
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_labels_filters_to_valid_keys() {
        let mut labels = HashMap::new();
        labels.insert("stackset".to_string(), "foo".to_string());
        labels.insert("stack-version".to_string(), "v1".to_string());
        labels.insert("team".to_string(), "platform".to_string());

        let limited = limit_labels(&labels, &SELECTOR_LABEL_KEYS);
        assert_eq!(limited.len(), 2);
        assert!(!limited.contains_key("team"));
    }

    #[test]
    fn template_inject_labels_keeps_explicit_values() {
        let mut template = PodTemplateSpec::default();
        template
            .metadata
            .labels
            .insert("app".to_string(), "explicit".to_string());

        let mut labels = HashMap::new();
        labels.insert("app".to_string(), "injected".to_string());
        labels.insert("stackset".to_string(), "foo".to_string());

        let injected = template_inject_labels(template, &labels);
        assert_eq!(injected.metadata.labels.get("app").unwrap(), "explicit");
        assert_eq!(injected.metadata.labels.get("stackset").unwrap(), "foo");
    }
}
