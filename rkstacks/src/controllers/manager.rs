use crate::api::store::RegistryStore;
use anyhow::Result;
use async_trait::async_trait;
use common::ResourceKind;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::sleep;

pub static CONTROLLER_MANAGER: Lazy<Arc<ControllerManager>> =
    Lazy::new(|| Arc::new(ControllerManager::new()));

/// A watch event. Contains the resource yaml.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Add { yaml: String },
    Update { old_yaml: String, new_yaml: String },
    Delete { yaml: String },
}

/// A watch response. Contains the resource kind, key, and event.
#[derive(Debug, Clone)]
pub struct ResourceWatchResponse {
    pub kind: ResourceKind,
    pub key: String,
    pub event: WatchEvent,
}

/// Contract for controllers managed by [`ControllerManager`].
///
/// A controller declares which resource kinds it watches and handles
/// the resulting events. Register it with
/// [`ControllerManager::register`] before calling
/// [`ControllerManager::start_watch`].
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// The controller's name, used for identification and logging.
    fn name(&self) -> &'static str;

    /// Called once during registration; registration fails if this
    /// errors.
    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// The resource kinds this controller wants events for.
    fn watch_resources(&self) -> Vec<ResourceKind> {
        vec![]
    }

    /// Handle one resource change event. Runs in a separate task;
    /// failures are retried with exponential backoff (up to 5 times)
    /// before being logged and dropped.
    #[allow(unused)]
    async fn handle_watch_response(&mut self, response: &ResourceWatchResponse) -> Result<()> {
        Ok(())
    }
}

/// Manages controller lifecycles and event distribution.
///
/// One work queue per controller; events are dispatched to every
/// controller whose `watch_resources` contains the event's kind, with
/// per-controller worker concurrency bounded by a semaphore. Informers
/// snapshot the registry, replay it as `Add` events, then watch from
/// the snapshot revision with automatic reconnect and backoff.
pub struct ControllerManager {
    controllers: RwLock<HashMap<String, Arc<RwLock<dyn Controller>>>>,
    // a work queue per controller.
    queues: RwLock<HashMap<String, mpsc::Sender<ResourceWatchResponse>>>,
    // use for stopping the manager.
    stop_tx: watch::Sender<bool>,
}

impl ControllerManager {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            controllers: RwLock::new(HashMap::new()),
            queues: RwLock::new(HashMap::new()),
            stop_tx,
        }
    }

    /// Register a controller and start its event processing loop.
    ///
    /// `workers` bounds how many events the controller processes
    /// concurrently; excess events wait in the queue.
    pub async fn register(
        self: Arc<Self>,
        controller: Arc<RwLock<dyn Controller>>,
        workers: usize,
    ) -> Result<()> {
        controller.write().await.init().await?;
        let name = controller.read().await.name().to_string();
        let (tx, mut rx) = mpsc::channel::<ResourceWatchResponse>(1000);

        self.controllers
            .write()
            .await
            .insert(name.clone(), controller.clone());
        self.queues.write().await.insert(name.clone(), tx.clone());

        let semaphore = Arc::new(tokio::sync::Semaphore::new(workers));
        let mut stop_sub = self.stop_tx.subscribe();

        // dispatcher loop: receive events from the queue and spawn
        // bounded handler tasks for them.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_sub.changed() => {
                        break;
                    }

                    opt = rx.recv() => {
                        match opt {
                            Some(resp) => {
                                let permit = semaphore.clone().acquire_owned().await.unwrap();
                                let controller = controller.clone();
                                let name = name.clone();

                                tokio::spawn(async move {
                                    if let Err(e) = retry_with_backoff(|| async {
                                        controller.write().await.handle_watch_response(&resp).await?;
                                        Ok(())
                                    }).await {
                                        log::error!(
                                            "controller {} handle watch response {} failed: {:?}",
                                            name, resp.key, e
                                        );
                                    }
                                    drop(permit);
                                });
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Start one informer per tracked resource kind and broadcast
    /// events to the controllers that asked for them.
    pub async fn start_watch(self: Arc<Self>, store: Arc<RegistryStore>) -> Result<()> {
        for kind in [
            ResourceKind::StackSet,
            ResourceKind::Stack,
            ResourceKind::Deployment,
            ResourceKind::Service,
            ResourceKind::HorizontalPodAutoscaler,
            ResourceKind::Ingress,
        ] {
            self.clone().spawn_informer(store.clone(), kind);
        }
        Ok(())
    }

    /// Informer loop for one resource kind: snapshot, replay as `Add`
    /// events, then watch from the snapshot revision. Reconnects with
    /// exponential backoff on any failure.
    fn spawn_informer(self: Arc<Self>, store: Arc<RegistryStore>, kind: ResourceKind) {
        tokio::spawn(async move {
            let mut backoff_ms = 100u64;
            loop {
                match store.snapshot_with_rev(kind).await {
                    Ok((items, rev)) => {
                        for (name, yaml) in items.into_iter() {
                            self.broadcast(ResourceWatchResponse {
                                kind,
                                key: name,
                                event: WatchEvent::Add { yaml },
                            })
                            .await;
                        }

                        // watch from rev+1 to avoid re-emitting snapshot
                        // items as watch events.
                        match store.watch(kind, rev + 1).await {
                            Ok((_watcher, mut stream)) => {
                                backoff_ms = 100;
                                loop {
                                    match stream.message().await {
                                        Ok(Some(resp)) => {
                                            for ev in resp.events() {
                                                let Some((key, event)) = decode_event(kind, ev)
                                                else {
                                                    continue;
                                                };
                                                self.broadcast(ResourceWatchResponse {
                                                    kind,
                                                    key,
                                                    event,
                                                })
                                                .await;
                                            }
                                        }
                                        Ok(None) => {
                                            log::info!(
                                                "{kind} watch stream closed, will reconnect"
                                            );
                                            break;
                                        }
                                        Err(e) => {
                                            log::error!(
                                                "{kind} watch error: {e:?}, will reconnect"
                                            );
                                            break;
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                log::error!("failed to start {kind} watch: {e:?}");
                            }
                        }
                    }
                    Err(e) => {
                        log::error!("failed to snapshot {kind}: {e:?}");
                    }
                }

                sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(30_000);
            }
        });
    }

    async fn broadcast(&self, resp: ResourceWatchResponse) {
        for sender in self.senders_by_kind(resp.kind).await {
            let _ = sender.send(resp.clone()).await;
        }
    }

    /// Queue senders of every controller watching the given kind.
    async fn senders_by_kind(&self, kind: ResourceKind) -> Vec<mpsc::Sender<ResourceWatchResponse>> {
        let mut ret = Vec::new();
        for (name, ctrl) in self.controllers.read().await.iter() {
            if ctrl.read().await.watch_resources().contains(&kind)
                && let Some(tx) = self.queues.read().await.get(name)
            {
                ret.push(tx.clone());
            }
        }
        ret
    }

    /// Gracefully stop all controller dispatcher loops. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl Default for ControllerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ControllerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Map one etcd event to a watch event plus the resource key. Delete
/// events without a prev_kv cannot be attributed and are dropped.
fn decode_event(kind: ResourceKind, ev: &etcd_client::Event) -> Option<(String, WatchEvent)> {
    let kv = ev.kv()?;
    let key = String::from_utf8_lossy(kv.key()).replace(kind.registry_prefix(), "");
    let event = match ev.event_type() {
        etcd_client::EventType::Put => {
            if let Some(prev_kv) = ev.prev_kv() {
                WatchEvent::Update {
                    old_yaml: String::from_utf8_lossy(prev_kv.value()).to_string(),
                    new_yaml: String::from_utf8_lossy(kv.value()).to_string(),
                }
            } else {
                WatchEvent::Add {
                    yaml: String::from_utf8_lossy(kv.value()).to_string(),
                }
            }
        }
        etcd_client::EventType::Delete => {
            let Some(prev_kv) = ev.prev_kv() else {
                log::warn!("{kind} watch delete event missing prev_kv for key {key}");
                return None;
            };
            WatchEvent::Delete {
                yaml: String::from_utf8_lossy(prev_kv.value()).to_string(),
            }
        }
    };
    Some((key, event))
}

async fn retry_with_backoff<F, Fut>(mut f: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut attempts = 0u32;
    loop {
        match f().await {
            Ok(_) => return Ok(()),
            Err(e) => {
                attempts += 1;
                if attempts >= 5 {
                    return Err(e);
                }
                let backoff = 2u64.pow(attempts.min(6)) * 100;
                sleep(Duration::from_millis(backoff)).await;
                continue;
            }
        }
    }
}
