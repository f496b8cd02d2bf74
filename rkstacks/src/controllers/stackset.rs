use crate::api::store::RegistryStore;
use crate::controllers::Controller;
use crate::controllers::manager::{ResourceWatchResponse, WatchEvent};
use crate::core::{
    STACK_GENERATION_ANNOTATION_KEY, STACKSET_HERITAGE_LABEL_KEY, StackContainer,
    StackSetContainer,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use common::{Deployment, ObjectMeta, ResourceKind, Stack, StackSet};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Reconciles StackSets: materializes new stack versions, shifts
/// traffic, plans replicas, writes the downstream resources, and rolls
/// statuses up. One reconciliation is a pure computation over a
/// freshly assembled working set followed by a write pass.
pub struct StackSetController {
    store: Arc<RegistryStore>,
}

/// Just enough of any registry object to route its events.
#[derive(Deserialize)]
struct PartialObject {
    metadata: ObjectMeta,
}

fn stack_generation(metadata: &ObjectMeta) -> Option<&String> {
    metadata.annotations.get(STACK_GENERATION_ANNOTATION_KEY)
}

/// Name of the stackset an object belongs to, via its owner references
/// or the heritage label.
fn owning_stackset(metadata: &ObjectMeta) -> Option<String> {
    if let Some(owners) = &metadata.owner_references {
        for owner in owners {
            if owner.kind == ResourceKind::StackSet {
                return Some(owner.name.clone());
            }
        }
    }
    metadata.labels.get(STACKSET_HERITAGE_LABEL_KEY).cloned()
}

impl StackSetController {
    pub fn new(store: Arc<RegistryStore>) -> Self {
        Self { store }
    }

    /// Reconcile a single stackset by name.
    pub async fn reconcile_by_name(&self, name: &str) -> Result<()> {
        let Some(stackset) = self.store.get_stackset(name).await? else {
            log::info!("StackSet {name} not found, skipping reconciliation");
            return Ok(());
        };
        if stackset.metadata.deletion_timestamp.is_some() {
            // Owned stacks follow through owner references; nothing to do.
            log::info!("StackSet {name} is being deleted");
            return Ok(());
        }

        log::info!("Reconciling stackset: {name}");
        let mut ssc = self.assemble(stackset).await?;
        let now = Utc::now();

        // Lifecycle: materialize the next version, if any. The observed
        // version is only bumped after the stack has been persisted.
        if let Some((mut sc, version)) = ssc.new_stack() {
            log::info!("Creating stack {} for stackset {}", sc.name(), name);
            sc.stack.metadata.uid = uuid::Uuid::new_v4();
            sc.stack.metadata.creation_timestamp = Some(now);
            self.store.insert_stack(&sc.stack).await?;
            self.bump_observed_stack_version(name, &version).await?;
            ssc.stackset.status.observed_stack_version = version;
            ssc.stack_containers.push(sc);
        }

        ssc.mark_expired_stacks(now);

        if let Err(e) = ssc.manage_traffic(now) {
            // Traffic routing is held; everything else still reconciles.
            log::warn!("traffic for stackset {name} held: {e}");
        }

        for sc in &ssc.stack_containers {
            if sc.pending_removal {
                continue;
            }
            self.reconcile_stack_resources(sc, now)
                .await
                .with_context(|| format!("reconciling resources of stack {}", sc.name()))?;
        }

        self.reconcile_shared_ingress(&ssc).await?;

        for sc in &ssc.stack_containers {
            if sc.pending_removal {
                self.delete_stack(sc).await?;
            } else {
                self.update_stack_status(sc).await?;
            }
        }

        self.update_stackset_status(&ssc).await?;
        Ok(())
    }

    /// Build the working set: the stackset, its owned stacks, and all
    /// observed downstream resources. Everything is cloned out of the
    /// store; the cache's copy is never aliased.
    async fn assemble(&self, stackset: StackSet) -> Result<StackSetContainer> {
        let stackset_name = stackset.metadata.name.clone();
        let stackset_uid = stackset.metadata.uid;

        let stacks: Vec<Stack> = self
            .store
            .list_stacks()
            .await?
            .into_iter()
            .filter(|stack| {
                stack.metadata.namespace == stackset.metadata.namespace
                    && stack.metadata.owner_references.as_ref().is_some_and(|owners| {
                        owners.iter().any(|owner| {
                            owner.kind == ResourceKind::StackSet && owner.uid == stackset_uid
                        })
                    })
            })
            .collect();

        let mut ssc = StackSetContainer::new(stackset, stacks);
        for sc in &mut ssc.stack_containers {
            let name = sc.stack.metadata.name.clone();
            sc.deployment = self.store.get_deployment(&name).await?;
            sc.service = self.store.get_service(&name).await?;
            sc.hpa = self.store.get_hpa(&name).await?;
            sc.ingress = self.store.get_ingress(&name).await?;
        }
        ssc.ingress = self.store.get_ingress(&stackset_name).await?;
        ssc.update_from_resources();
        Ok(ssc)
    }

    async fn reconcile_stack_resources(
        &self,
        sc: &StackContainer,
        now: chrono::DateTime<Utc>,
    ) -> Result<()> {
        self.reconcile_stack_deployment(sc, sc.generate_deployment(now))
            .await?;

        match sc.generate_service() {
            Ok(service) => {
                let changed = match &sc.service {
                    None => true,
                    Some(existing) => {
                        stack_generation(&existing.metadata) != stack_generation(&service.metadata)
                    }
                };
                if changed {
                    self.store.insert_service(&service).await?;
                }
            }
            Err(e) => {
                log::warn!("skipping service for stack {}: {e}", sc.name());
            }
        }

        match sc.generate_hpa() {
            Ok(Some(hpa)) => {
                let changed = match &sc.hpa {
                    None => true,
                    Some(existing) => {
                        stack_generation(&existing.metadata) != stack_generation(&hpa.metadata)
                            || existing.spec.min_replicas != hpa.spec.min_replicas
                    }
                };
                if changed {
                    self.store.insert_hpa(&hpa).await?;
                }
            }
            Ok(None) => {
                // The stack spec no longer wants an autoscaler.
                if sc.hpa.is_some() {
                    self.store
                        .delete(ResourceKind::HorizontalPodAutoscaler, sc.name())
                        .await?;
                }
            }
            Err(e) => {
                log::warn!("skipping autoscaler for stack {}: {e}", sc.name());
            }
        }

        match sc.generate_ingress() {
            Some(ingress) => {
                let changed = match &sc.ingress {
                    None => true,
                    Some(existing) => {
                        stack_generation(&existing.metadata) != stack_generation(&ingress.metadata)
                    }
                };
                if changed {
                    self.store.insert_ingress(&ingress).await?;
                }
            }
            None => {
                if sc.ingress.is_some() {
                    self.store.delete(ResourceKind::Ingress, sc.name()).await?;
                }
            }
        }

        Ok(())
    }

    /// Create or update the stack's deployment.
    ///
    /// An existing deployment is rewritten when the stack generation
    /// changed or a replica count is being set. Unset replicas keep the
    /// current value (the autoscaler may own it), and an existing
    /// selector is preserved since selectors are immutable.
    async fn reconcile_stack_deployment(
        &self,
        sc: &StackContainer,
        mut desired: Deployment,
    ) -> Result<()> {
        match &sc.deployment {
            None => {
                self.store.insert_deployment(&desired).await?;
            }
            Some(existing) => {
                let generation_changed =
                    stack_generation(&existing.metadata) != stack_generation(&desired.metadata);
                let replicas_changed = matches!(
                    desired.spec.replicas,
                    Some(replicas) if existing.spec.replicas != Some(replicas)
                );
                if !generation_changed && !replicas_changed {
                    return Ok(());
                }
                if desired.spec.replicas.is_none() {
                    desired.spec.replicas = existing.spec.replicas;
                }
                if !existing.spec.selector.match_labels.is_empty() {
                    desired.spec.selector = existing.spec.selector.clone();
                }
                self.store.insert_deployment(&desired).await?;
            }
        }
        Ok(())
    }

    async fn reconcile_shared_ingress(&self, ssc: &StackSetContainer) -> Result<()> {
        match ssc.generate_ingress() {
            Ok(Some(ingress)) => {
                let changed = match &ssc.ingress {
                    None => true,
                    Some(existing) => {
                        existing.spec != ingress.spec
                            || existing.metadata.annotations != ingress.metadata.annotations
                            || existing.metadata.labels != ingress.metadata.labels
                    }
                };
                if changed {
                    self.store.insert_ingress(&ingress).await?;
                }
            }
            Ok(None) => {
                // The stackset dropped its ingress; remove the shared one.
                if ssc.ingress.is_some() {
                    self.store
                        .delete(ResourceKind::Ingress, &ssc.stackset.metadata.name)
                        .await?;
                }
            }
            Err(e) => {
                log::warn!(
                    "skipping shared ingress for stackset {}: {e}",
                    ssc.stackset.metadata.name
                );
            }
        }
        Ok(())
    }

    /// Delete a pending-removal stack and everything it owns.
    async fn delete_stack(&self, sc: &StackContainer) -> Result<()> {
        let name = sc.name();
        log::info!("Deleting expired stack {name}");
        self.store.delete(ResourceKind::Deployment, name).await?;
        self.store.delete(ResourceKind::Service, name).await?;
        self.store
            .delete(ResourceKind::HorizontalPodAutoscaler, name)
            .await?;
        self.store.delete(ResourceKind::Ingress, name).await?;
        self.store.delete(ResourceKind::Stack, name).await?;
        Ok(())
    }

    async fn update_stack_status(&self, sc: &StackContainer) -> Result<()> {
        let status = sc.generate_stack_status();
        if sc.stack.status == status {
            return Ok(());
        }

        let name = sc.name().to_string();
        let mut attempts = 0;
        loop {
            let Some((yaml, revision)) = self
                .store
                .get_yaml_with_revision(ResourceKind::Stack, &name)
                .await?
            else {
                return Ok(());
            };
            let mut stack: Stack = serde_yaml::from_str(&yaml)?;
            stack.status = status.clone();
            let new_yaml = serde_yaml::to_string(&stack)?;
            if self
                .store
                .compare_and_set_yaml(ResourceKind::Stack, &name, revision, &new_yaml)
                .await?
            {
                return Ok(());
            }

            attempts += 1;
            if attempts >= 5 {
                log::warn!("stack {name} status update failed due to concurrent updates");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn update_stackset_status(&self, ssc: &StackSetContainer) -> Result<()> {
        let status = ssc.generate_stackset_status();
        if ssc.stackset.status == status {
            return Ok(());
        }
        let name = ssc.stackset.metadata.name.clone();
        self.patch_stackset(&name, |stackset| {
            let observed = stackset.status.observed_stack_version.clone();
            stackset.status = status.clone();
            // The observed version is bumped by the creation path only.
            stackset.status.observed_stack_version = observed;
        })
        .await
    }

    async fn bump_observed_stack_version(&self, name: &str, version: &str) -> Result<()> {
        self.patch_stackset(name, |stackset| {
            stackset.status.observed_stack_version = version.to_string();
        })
        .await
    }

    /// Read-modify-write a stackset with CAS, retrying on conflicts.
    async fn patch_stackset<F>(&self, name: &str, mutate: F) -> Result<()>
    where
        F: Fn(&mut StackSet),
    {
        let mut attempts = 0;
        loop {
            let Some((yaml, revision)) = self
                .store
                .get_yaml_with_revision(ResourceKind::StackSet, name)
                .await?
            else {
                return Ok(());
            };
            let mut stackset: StackSet = serde_yaml::from_str(&yaml)?;
            mutate(&mut stackset);
            let new_yaml = serde_yaml::to_string(&stackset)?;
            if self
                .store
                .compare_and_set_yaml(ResourceKind::StackSet, name, revision, &new_yaml)
                .await?
            {
                return Ok(());
            }

            attempts += 1;
            if attempts >= 5 {
                anyhow::bail!("stackset {name} update failed due to concurrent updates");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[async_trait]
impl Controller for StackSetController {
    fn name(&self) -> &'static str {
        "stackset"
    }

    fn watch_resources(&self) -> Vec<ResourceKind> {
        vec![
            ResourceKind::StackSet,
            ResourceKind::Stack,
            ResourceKind::Deployment,
            ResourceKind::Service,
            ResourceKind::HorizontalPodAutoscaler,
            ResourceKind::Ingress,
        ]
    }

    async fn handle_watch_response(&mut self, response: &ResourceWatchResponse) -> Result<()> {
        match response.kind {
            ResourceKind::StackSet => {
                let should_reconcile = match &response.event {
                    WatchEvent::Add { .. } => true,
                    WatchEvent::Update { old_yaml, new_yaml } => {
                        let old: StackSet = serde_yaml::from_str(old_yaml)?;
                        let new: StackSet = serde_yaml::from_str(new_yaml)?;
                        old.metadata.generation != new.metadata.generation || old.spec != new.spec
                    }
                    WatchEvent::Delete { .. } => false,
                };
                if should_reconcile {
                    self.reconcile_by_name(&response.key).await?;
                }
            }
            _ => {
                // Downstream change: reconcile the owning stackset(s).
                let mut stacksets: HashSet<String> = HashSet::new();
                let mut collect = |yaml: &str| {
                    if let Ok(obj) = serde_yaml::from_str::<PartialObject>(yaml)
                        && let Some(owner) = owning_stackset(&obj.metadata)
                    {
                        stacksets.insert(owner);
                    }
                };
                match &response.event {
                    WatchEvent::Add { yaml } => collect(yaml),
                    WatchEvent::Update { old_yaml, new_yaml } => {
                        if old_yaml == new_yaml {
                            return Ok(());
                        }
                        collect(new_yaml);
                        collect(old_yaml);
                    }
                    WatchEvent::Delete { yaml } => collect(yaml),
                }

                for name in stacksets {
                    self.reconcile_by_name(&name).await?;
                }
            }
        }
        Ok(())
    }
}
