//! Stack lifecycle decisions: when to materialize a new stack version
//! and which historical stacks to hand to the deleter.

use chrono::{DateTime, Utc};
use common::{ObjectMeta, OwnerReference, ResourceKind, Stack, StackServiceSpec, StackSet, StackSpec};

use crate::core::types::{StackContainer, StackSetContainer, merge_labels};
use crate::core::{
    API_VERSION, DEFAULT_STACK_LIFECYCLE_LIMIT, DEFAULT_VERSION, STACK_VERSION_LABEL_KEY,
    STACKSET_HERITAGE_LABEL_KEY,
};

fn current_stack_version(stackset: &StackSet) -> String {
    let version = &stackset.spec.stack_template.spec.version;
    if version.is_empty() {
        DEFAULT_VERSION.to_string()
    } else {
        version.clone()
    }
}

fn generate_stack_name(stackset: &StackSet, version: &str) -> String {
    format!("{}-{}", stackset.metadata.name, version)
}

/// Default the protocol on any port that doesn't specify one.
fn sanitize_service_ports(mut service: StackServiceSpec) -> StackServiceSpec {
    for port in &mut service.ports {
        if port.protocol.is_empty() {
            port.protocol = "TCP".to_string();
        }
    }
    service
}

impl StackSetContainer {
    /// The optional stack that should be created this reconciliation,
    /// plus its version.
    ///
    /// A stack is only emitted when no stack by the derived name exists
    /// *and* `observedStackVersion` differs from the current template
    /// version. The second check keeps a stack the user deleted from
    /// being recreated: once observed, that version is consumed. The
    /// caller bumps `observedStackVersion` only after the new stack has
    /// been persisted.
    pub fn new_stack(&self) -> Option<(StackContainer, String)> {
        let stackset = &self.stackset;
        let observed = &stackset.status.observed_stack_version;
        let version = current_stack_version(stackset);
        let name = generate_stack_name(stackset, &version);

        if self.stack_by_name(&name).is_some() || *observed == version {
            return None;
        }

        let template = &stackset.spec.stack_template;
        let service = template
            .spec
            .stack_spec
            .service
            .clone()
            .map(sanitize_service_ports);

        let mut version_label = std::collections::HashMap::new();
        version_label.insert(STACK_VERSION_LABEL_KEY.to_string(), version.clone());
        let mut heritage_label = std::collections::HashMap::new();
        heritage_label.insert(
            STACKSET_HERITAGE_LABEL_KEY.to_string(),
            stackset.metadata.name.clone(),
        );

        let stack = Stack {
            api_version: API_VERSION.to_string(),
            kind: "Stack".to_string(),
            metadata: ObjectMeta {
                name,
                namespace: stackset.metadata.namespace.clone(),
                owner_references: Some(vec![OwnerReference {
                    api_version: stackset.api_version.clone(),
                    kind: ResourceKind::StackSet,
                    name: stackset.metadata.name.clone(),
                    uid: stackset.metadata.uid,
                    controller: true,
                    block_owner_deletion: None,
                }]),
                labels: merge_labels(&[&heritage_label, &stackset.metadata.labels, &version_label]),
                annotations: template.annotations.clone(),
                ..Default::default()
            },
            spec: StackSpec {
                replicas: template.spec.stack_spec.replicas,
                horizontal_pod_autoscaler: template.spec.stack_spec.horizontal_pod_autoscaler.clone(),
                service,
                pod_template: template.spec.stack_spec.pod_template.clone(),
                autoscaler: template.spec.stack_spec.autoscaler.clone(),
            },
            status: Default::default(),
        };

        let scaledown_ttl = chrono::Duration::seconds(
            stackset
                .spec
                .stack_lifecycle
                .scaledown_ttl_seconds
                .unwrap_or(crate::core::DEFAULT_SCALEDOWN_TTL_SECONDS),
        );
        let container = StackContainer::new(
            stack,
            stackset.metadata.name.clone(),
            stackset.spec.ingress.clone(),
            scaledown_ttl,
        );

        Some((container, version))
    }

    /// Flag stacks that should be deleted.
    ///
    /// Candidates are stacks with no ingress exposure or scaled down
    /// because of inactivity. Nothing is marked until the candidate
    /// count exceeds the retention limit; then only the oldest excess
    /// candidates, by creation timestamp, are flagged. Stacks still
    /// serving or eligible for traffic are never touched regardless of
    /// age.
    pub fn mark_expired_stacks(&mut self, now: DateTime<Utc>) {
        let limit = self
            .stackset
            .spec
            .stack_lifecycle
            .limit
            .map(|l| l as usize)
            .unwrap_or(DEFAULT_STACK_LIFECYCLE_LIMIT);

        let mut candidates: Vec<usize> = self
            .stack_containers
            .iter()
            .enumerate()
            .filter(|(_, sc)| sc.ingress_spec.is_none() || sc.scaled_down(now))
            .map(|(i, _)| i)
            .collect();

        if candidates.len() <= limit {
            return;
        }

        candidates.sort_by_key(|&i| self.stack_containers[i].stack.metadata.creation_timestamp);

        let excess = candidates.len() - limit;
        for &i in candidates.iter().take(excess) {
            self.stack_containers[i].pending_removal = true;
        }
    }
}
