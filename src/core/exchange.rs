//! Registry mirror.
//!
//! The `Exchange` keeps the in-process routing table converged with the
//! service registry. It performs one recursive read at startup, then applies
//! the watch stream event by event: upserts re-read or synthesise service
//! records, deletes unmount them. All mutations flow through the single
//! watch task, so per-service ordering mirrors the registry's own revision
//! order.

use std::{collections::HashMap, sync::Arc, time::Duration};

use eyre::Result;

use crate::{
    core::{
        keys::{self, ParsedKey},
        mux::{AddOutcome, MOUNT_PREFIX, Mux},
        publisher::LivenessPublisher,
        service::{self, ServiceRecord},
    },
    metrics,
    ports::registry::{
        Registry, RegistryError, RegistryEvent, RegistryNode, RegistryResult, SetOptions,
    },
};

/// Watches for service changes in the registry and keeps a [`Mux`] in sync.
pub struct Exchange {
    /// Registry root directory holding service state.
    namespace: String,
    /// Deployment environment this gateway serves.
    environment: String,
    registry: Arc<dyn Registry>,
    mux: Arc<Mux>,
    publisher: Option<Arc<LivenessPublisher>>,
    /// Currently registered instances, keyed by instance id.
    services: HashMap<String, ServiceRecord>,
    /// Last-seen raw routes document per service name. Lets host-only
    /// events avoid a registry re-read.
    service_routes: HashMap<String, String>,
    /// Next registry index to resume watching from.
    wait_index: u64,
}

impl Exchange {
    pub fn new(
        namespace: impl Into<String>,
        environment: impl Into<String>,
        registry: Arc<dyn Registry>,
        mux: Arc<Mux>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            environment: environment.into(),
            registry,
            mux,
            publisher: None,
            services: HashMap::new(),
            service_routes: HashMap::new(),
            wait_index: 0,
        }
    }

    /// Attach a liveness publisher to be refreshed after every applied
    /// event.
    pub fn with_publisher(mut self, publisher: Arc<LivenessPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Fetch the full service tree and initialise the routing table.
    /// Watching resumes from the index observed here.
    pub async fn init(&mut self) -> RegistryResult<()> {
        let root = format!("/{}", self.namespace);
        let response = match self.registry.get(&root, true).await {
            Ok(response) => response,
            Err(RegistryError::KeyNotFound(key)) => {
                tracing::warn!(%key, "registry namespace does not exist yet, starting empty");
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        for service_node in &response.node.nodes {
            let service = service_node.tail_segment().to_string();
            for environment_node in &service_node.nodes {
                if environment_node.tail_segment() == self.environment {
                    self.mount_environment(&service, environment_node);
                }
            }
        }

        // Watch changes *after* the state just read.
        self.wait_index = response.index + 1;
        tracing::info!(
            namespace = %self.namespace,
            environment = %self.environment,
            services = self.services.len(),
            handlers = self.mux.handler_count(),
            "initial registry sync complete"
        );
        Ok(())
    }

    /// Long-lived watch loop. Registry errors reopen the watch; event
    /// handling errors are logged and the loop continues. Terminates only
    /// with the process.
    pub async fn watch(mut self) {
        let root = format!("/{}", self.namespace);
        loop {
            let mut watcher = match self.registry.watch(&root, self.wait_index).await {
                Ok(watcher) => watcher,
                Err(error) => {
                    tracing::error!(%error, "could not open registry watch, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            loop {
                let event = match watcher.next().await {
                    Ok(event) => event,
                    Err(error) => {
                        tracing::warn!(%error, "registry watch interrupted, reopening");
                        break;
                    }
                };

                if event.index > 0 {
                    self.wait_index = event.index + 1;
                }

                let action = event.action;
                let key = event
                    .node
                    .as_ref()
                    .or(event.prev_node.as_ref())
                    .map(|node| node.key.clone())
                    .unwrap_or_default();
                tracing::debug!(?action, %key, "registry event");

                // A failure applying one event must not take down the
                // mirror; the next convergent event repairs the state.
                if let Err(error) = self.apply(event).await {
                    tracing::error!(?action, %key, %error, "failed to apply registry event");
                }

                self.refresh_liveness();
            }
        }
    }

    /// Apply one watch event to the routing table.
    pub async fn apply(&mut self, event: RegistryEvent) -> Result<()> {
        metrics::increment_registry_event(event.action);

        if event.action.is_upsert() {
            let Some(node) = event.node else {
                return Ok(());
            };
            match keys::parse(&node.key) {
                ParsedKey::Routes {
                    service,
                    environment,
                } if environment == self.environment => {
                    self.routes_changed(&service).await?;
                }
                ParsedKey::Host {
                    service,
                    environment,
                    instance,
                } if environment == self.environment => {
                    let address = node.value.clone().unwrap_or_default();
                    self.host_upserted(&service, &instance, &address).await?;
                }
                _ => {}
            }
        } else if event.action.is_delete() {
            // Deletes describe what was lost in the previous node.
            let Some(node) = event.prev_node.or(event.node) else {
                return Ok(());
            };
            match keys::parse(&node.key) {
                ParsedKey::Routes {
                    service,
                    environment,
                } if environment == self.environment => {
                    self.routes_removed(&service);
                }
                ParsedKey::Host {
                    environment,
                    instance,
                    ..
                } if environment == self.environment => {
                    self.host_removed(&instance);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// A `routes` document changed: re-read the environment subtree,
    /// unregister the previous generation of this service, and mount the
    /// new one. Unregistering first guarantees patterns dropped from the
    /// document do not linger.
    async fn routes_changed(&mut self, service: &str) -> Result<()> {
        let root = keys::environment_root(&self.namespace, service, &self.environment);
        let response = match self.registry.get(&root, true).await {
            Ok(response) => response,
            Err(RegistryError::KeyNotFound(_)) => {
                self.routes_removed(service);
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };

        self.routes_removed(service);
        self.mount_environment(service, &response.node);
        Ok(())
    }

    /// A host entry appeared or changed. Routes are reconstructed from the
    /// cached document; a full re-read only happens when no document has
    /// been seen for this service yet.
    async fn host_upserted(&mut self, service: &str, instance: &str, address: &str) -> Result<()> {
        let Some(document) = self.service_routes.get(service).cloned() else {
            return self.routes_changed(service).await;
        };

        let routes = match service::parse_routes(&document) {
            Ok(routes) => routes,
            Err(error) => {
                tracing::warn!(service, %error, "cached routes document is invalid, skipping host");
                return Ok(());
            }
        };

        if let Some(previous) = self.services.get(instance) {
            if previous.address != address {
                // The instance moved; the old address must go first.
                let previous = previous.clone();
                self.unregister(&previous);
            }
        }

        self.register(ServiceRecord::new(instance, service, address, routes));
        Ok(())
    }

    /// The `routes` document for a service was deleted: every known
    /// instance of the service is unmounted.
    fn routes_removed(&mut self, service: &str) {
        let stale: Vec<ServiceRecord> = self
            .services
            .values()
            .filter(|record| record.name == service)
            .cloned()
            .collect();
        for record in stale {
            self.unregister(&record);
            self.services.remove(&record.id);
        }
        self.service_routes.remove(service);
    }

    /// A single host entry was deleted.
    fn host_removed(&mut self, instance: &str) {
        if let Some(record) = self.services.remove(instance) {
            self.unregister(&record);
        }
    }

    /// Mount every host of an environment subtree. The subtree node is the
    /// `/<ns>/<service>/<env>` directory holding `routes` and `hosts`.
    fn mount_environment(&mut self, service: &str, environment_node: &RegistryNode) {
        let Some(routes_node) = environment_node.child("routes") else {
            return;
        };
        let Some(document) = routes_node.value.clone() else {
            return;
        };

        let routes = match service::parse_routes(&document) {
            Ok(routes) => routes,
            Err(error) => {
                tracing::warn!(service, %error, "invalid routes document, skipping service");
                return;
            }
        };
        self.service_routes.insert(service.to_string(), document);

        let Some(hosts_node) = environment_node.child("hosts") else {
            return;
        };
        for host in &hosts_node.nodes {
            let Some(address) = host.value.clone() else {
                continue;
            };
            let record =
                ServiceRecord::new(host.tail_segment(), service, address, routes.clone());
            self.register(record);
        }
    }

    /// Add a service record's routes to the mux. Conflicting registrations
    /// are recorded in the registry out of band; the address union itself is
    /// idempotent.
    pub fn register(&mut self, record: ServiceRecord) {
        // The record is tracked before its routes mount, so every mounted
        // address corresponds to a known instance.
        self.services.insert(record.id.clone(), record.clone());
        for (method, pattern) in record.patterns() {
            let mounted = format!("{MOUNT_PREFIX}{pattern}");
            match self.mux.add(method, &mounted, &record.address, &record.id) {
                AddOutcome::AddressAdded { existing } => {
                    self.publish_conflict(&record, &mounted, existing, false);
                }
                AddOutcome::Duplicate { existing } => {
                    self.publish_conflict(&record, &mounted, existing, true);
                }
                AddOutcome::Mounted | AddOutcome::EmptyAddress => {}
            }
        }
        metrics::set_mounted_handlers(self.mux.handler_count());
    }

    /// Remove a service record's routes from the mux.
    pub fn unregister(&mut self, record: &ServiceRecord) {
        for (method, pattern) in record.patterns() {
            self.mux.remove(method, pattern, &record.address, &record.id);
        }
        metrics::set_mounted_handlers(self.mux.handler_count());
    }

    /// Record a pattern conflict (or exact duplicate) under the gateway's
    /// conflicts subtree. Informational only, never blocks registration,
    /// and runs outside the mux lock.
    fn publish_conflict(
        &self,
        record: &ServiceRecord,
        pattern: &str,
        existing: Vec<String>,
        duplicate: bool,
    ) {
        let registry = Arc::clone(&self.registry);
        let (key, value) = if duplicate {
            (
                keys::duplicate_key(&record.name, &self.environment, pattern),
                record.address.clone(),
            )
        } else {
            let document = serde_json::json!({
                "existing_addresses": existing,
                "AttemptedConflict": record.address,
            });
            (
                keys::conflict_key(&record.name, &self.environment, pattern),
                document.to_string(),
            )
        };
        tracing::info!(%key, duplicate, "recording route conflict");
        tokio::spawn(async move {
            let options = SetOptions {
                prev_exist: Some(false),
                ..SetOptions::default()
            };
            if let Err(error) = registry.set(&key, &value, options).await {
                tracing::debug!(%key, %error, "could not record route conflict");
            }
        });
    }

    /// Kick an asynchronous liveness refresh after an applied event.
    fn refresh_liveness(&self) {
        if let Some(publisher) = &self.publisher {
            let publisher = Arc::clone(publisher);
            tokio::spawn(async move {
                if let Err(error) = publisher.publish_once().await {
                    tracing::debug!(%error, "gateway liveness refresh failed");
                }
            });
        }
    }

    /// Index the next watch will resume from.
    pub fn wait_index(&self) -> u64 {
        self.wait_index
    }

    /// Number of currently registered service instances.
    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}
