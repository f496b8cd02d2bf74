use anyhow::Result;
use common::{Deployment, HorizontalPodAutoscaler, Ingress, ResourceKind, Service, Stack, StackSet};
use etcd_client::{
    Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp, WatchOptions, WatchStream,
    Watcher,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::RwLock;

/// RegistryStore provides an etcd-like API over the cluster registry.
/// Keys are stored under `/registry/<kind>/<name>`, values are YAML
/// serialized definitions.
#[derive(Clone)]
pub struct RegistryStore {
    client: Arc<RwLock<Client>>,
}

impl RegistryStore {
    /// Connect to the given etcd/Xline endpoints.
    pub async fn new(endpoints: &[&str]) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self {
            client: Arc::new(RwLock::new(client)),
        })
    }

    fn key(kind: ResourceKind, name: &str) -> String {
        format!("{}{}", kind.registry_prefix(), name)
    }

    pub async fn get_yaml(&self, kind: ResourceKind, name: &str) -> Result<Option<String>> {
        let mut client = self.client.write().await;
        let resp = client.get(Self::key(kind, name), None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| String::from_utf8_lossy(kv.value()).to_string()))
    }

    /// Get a resource's YAML together with its mod revision, for use
    /// with [`RegistryStore::compare_and_set_yaml`].
    pub async fn get_yaml_with_revision(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<(String, i64)>> {
        let mut client = self.client.write().await;
        let resp = client.get(Self::key(kind, name), None).await?;
        Ok(resp.kvs().first().map(|kv| {
            (
                String::from_utf8_lossy(kv.value()).to_string(),
                kv.mod_revision(),
            )
        }))
    }

    pub async fn insert_yaml(&self, kind: ResourceKind, name: &str, yaml: &str) -> Result<()> {
        let mut client = self.client.write().await;
        client
            .put(Self::key(kind, name), yaml, Some(PutOptions::new()))
            .await?;
        Ok(())
    }

    pub async fn delete(&self, kind: ResourceKind, name: &str) -> Result<()> {
        let mut client = self.client.write().await;
        client.delete(Self::key(kind, name), None).await?;
        Ok(())
    }

    /// Write only if the key is still at `mod_revision`; returns false
    /// when someone else got there first.
    pub async fn compare_and_set_yaml(
        &self,
        kind: ResourceKind,
        name: &str,
        mod_revision: i64,
        yaml: &str,
    ) -> Result<bool> {
        let key = Self::key(kind, name);
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                key.clone(),
                CompareOp::Equal,
                mod_revision,
            )])
            .and_then(vec![TxnOp::put(key, yaml, None)]);
        let mut client = self.client.write().await;
        let resp = client.txn(txn).await?;
        Ok(resp.succeeded())
    }

    /// List all resources of a kind, skipping values that fail to
    /// parse.
    pub async fn list<T: DeserializeOwned>(&self, kind: ResourceKind) -> Result<Vec<T>> {
        let mut client = self.client.write().await;
        let resp = client
            .get(
                kind.registry_prefix(),
                Some(GetOptions::new().with_prefix()),
            )
            .await?;
        Ok(resp
            .kvs()
            .iter()
            .filter_map(|kv| {
                let yaml = String::from_utf8_lossy(kv.value());
                match serde_yaml::from_str::<T>(&yaml) {
                    Ok(obj) => Some(obj),
                    Err(e) => {
                        log::error!("failed to parse {kind} at key {:?}: {e}", kv.key());
                        None
                    }
                }
            })
            .collect())
    }

    /// Take a snapshot of all resources of a kind and return them with
    /// the current revision.
    pub async fn snapshot_with_rev(&self, kind: ResourceKind) -> Result<(Vec<(String, String)>, i64)> {
        let prefix = kind.registry_prefix();
        let mut client = self.client.write().await;
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let rev = resp.header().map(|h| h.revision()).unwrap_or(0);
        let items = resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).replace(prefix, ""),
                    String::from_utf8_lossy(kv.value()).to_string(),
                )
            })
            .collect();
        Ok((items, rev))
    }

    /// Watch all resources of a kind starting from a given revision.
    pub async fn watch(
        &self,
        kind: ResourceKind,
        start_rev: i64,
    ) -> Result<(Watcher, WatchStream)> {
        let opts = WatchOptions::new()
            .with_prefix()
            .with_prev_key()
            .with_start_revision(start_rev);
        let mut client = self.client.write().await;
        let (watcher, stream) = client.watch(kind.registry_prefix(), Some(opts)).await?;
        Ok((watcher, stream))
    }

    fn parse_opt<T: DeserializeOwned>(yaml: Option<String>) -> Result<Option<T>> {
        match yaml {
            Some(yaml) => Ok(Some(serde_yaml::from_str(&yaml)?)),
            None => Ok(None),
        }
    }

    async fn insert_object<T: Serialize>(
        &self,
        kind: ResourceKind,
        name: &str,
        object: &T,
    ) -> Result<()> {
        let yaml = serde_yaml::to_string(object)?;
        self.insert_yaml(kind, name, &yaml).await
    }

    pub async fn get_stackset(&self, name: &str) -> Result<Option<StackSet>> {
        Self::parse_opt(self.get_yaml(ResourceKind::StackSet, name).await?)
    }

    pub async fn list_stacks(&self) -> Result<Vec<Stack>> {
        self.list(ResourceKind::Stack).await
    }

    pub async fn get_deployment(&self, name: &str) -> Result<Option<Deployment>> {
        Self::parse_opt(self.get_yaml(ResourceKind::Deployment, name).await?)
    }

    pub async fn get_service(&self, name: &str) -> Result<Option<Service>> {
        Self::parse_opt(self.get_yaml(ResourceKind::Service, name).await?)
    }

    pub async fn get_hpa(&self, name: &str) -> Result<Option<HorizontalPodAutoscaler>> {
        Self::parse_opt(
            self.get_yaml(ResourceKind::HorizontalPodAutoscaler, name)
                .await?,
        )
    }

    pub async fn get_ingress(&self, name: &str) -> Result<Option<Ingress>> {
        Self::parse_opt(self.get_yaml(ResourceKind::Ingress, name).await?)
    }

    pub async fn insert_stackset(&self, stackset: &StackSet) -> Result<()> {
        self.insert_object(ResourceKind::StackSet, &stackset.metadata.name, stackset)
            .await
    }

    pub async fn insert_stack(&self, stack: &Stack) -> Result<()> {
        self.insert_object(ResourceKind::Stack, &stack.metadata.name, stack)
            .await
    }

    pub async fn insert_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.insert_object(ResourceKind::Deployment, &deployment.metadata.name, deployment)
            .await
    }

    pub async fn insert_service(&self, service: &Service) -> Result<()> {
        self.insert_object(ResourceKind::Service, &service.metadata.name, service)
            .await
    }

    pub async fn insert_hpa(&self, hpa: &HorizontalPodAutoscaler) -> Result<()> {
        self.insert_object(
            ResourceKind::HorizontalPodAutoscaler,
            &hpa.metadata.name,
            hpa,
        )
        .await
    }

    pub async fn insert_ingress(&self, ingress: &Ingress) -> Result<()> {
        self.insert_object(ResourceKind::Ingress, &ingress.metadata.name, ingress)
            .await
    }
}
