//! Gateway state shared between the loader and request threads.
//!
//! # Responsibilities
//! - Own the live descriptor and chain tables
//! - Own the routing table swapped by each reload
//! - Hand out config snapshots to request threads
//!
//! # Design Decisions
//! - Readers resolve the routing table with a single atomic load and keep
//!   that snapshot for the whole request; the loader publishes a fresh
//!   table wholesale
//! - The chain table tolerates concurrent reads during the swap

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::apidef::ApiDescriptor;
use crate::chain::ChainObject;
use crate::config::GatewayConfig;
use crate::proxy::{upstream_client, UpstreamClient};
use crate::router::ProxyMux;
use crate::storage::{EnvKvResolver, KvResolver};

/// Live `api_id → descriptor` and `api_id → chain` tables.
#[derive(Default)]
pub struct ApiRegistry {
    descriptors: RwLock<HashMap<String, Arc<ApiDescriptor>>>,
    handles: ArcSwap<DashMap<String, Arc<ChainObject>>>,
}

impl ApiRegistry {
    pub fn descriptor(&self, api_id: &str) -> Option<Arc<ApiDescriptor>> {
        self.descriptors
            .read()
            .ok()
            .and_then(|map| map.get(api_id).cloned())
    }

    pub fn handle(&self, api_id: &str) -> Option<Arc<ChainObject>> {
        self.handles.load().get(api_id).map(|r| r.value().clone())
    }

    /// Snapshot of every loaded descriptor.
    pub fn descriptors(&self) -> Vec<Arc<ApiDescriptor>> {
        self.descriptors
            .read()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.descriptors.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace both tables. Called once per reload, under the write lock,
    /// after the routing table swap.
    pub(crate) fn install(
        &self,
        descriptors: HashMap<String, Arc<ApiDescriptor>>,
        handles: DashMap<String, Arc<ChainObject>>,
    ) {
        match self.descriptors.write() {
            Ok(mut map) => {
                self.handles.store(Arc::new(handles));
                *map = descriptors;
            }
            Err(poisoned) => {
                self.handles.store(Arc::new(handles));
                *poisoned.into_inner() = descriptors;
            }
        }
    }
}

/// Hook invoked for every descriptor dropped or replaced by a reload.
pub trait UnloadHook: Send + Sync {
    fn api_unloaded(&self, api: &ApiDescriptor);
}

/// The gateway: configuration, live tables and the serving mux.
pub struct Gateway {
    config: ArcSwap<GatewayConfig>,
    registry: Arc<ApiRegistry>,
    mux: ArcSwap<ProxyMux>,
    kv: Arc<dyn KvResolver>,
    client: UpstreamClient,
    /// Descriptor set fed by the control plane, consumed by reloads.
    descriptor_source: RwLock<Vec<ApiDescriptor>>,
    unload_hooks: RwLock<Vec<Arc<dyn UnloadHook>>>,
    playground: RwLock<Option<PlaygroundTemplates>>,
}

/// Parsed playground page templates.
#[derive(Debug, Clone)]
pub struct PlaygroundTemplates {
    pub html: String,
    pub js: String,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        Gateway::with_kv_resolver(config, Arc::new(EnvKvResolver))
    }

    /// Construct with an alternative key-value reference resolver.
    pub fn with_kv_resolver(config: GatewayConfig, kv: Arc<dyn KvResolver>) -> Arc<Self> {
        let gw = Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            registry: Arc::new(ApiRegistry::default()),
            mux: ArcSwap::from_pointee(ProxyMux::default()),
            kv,
            client: upstream_client(),
            descriptor_source: RwLock::new(Vec::new()),
            unload_hooks: RwLock::new(Vec::new()),
            playground: RwLock::new(None),
        });
        gw.read_playground_templates();
        gw
    }

    pub fn config(&self) -> Arc<GatewayConfig> {
        self.config.load_full()
    }

    pub fn set_config(&self, config: GatewayConfig) {
        self.config.store(Arc::new(config));
    }

    /// Flip the global org-data freshness flag (RPC stores bound).
    pub(crate) fn set_enforce_org_data_age(&self) {
        let mut config = (*self.config.load_full()).clone();
        if !config.enforce_org_data_age {
            config.enforce_org_data_age = true;
            self.config.store(Arc::new(config));
        }
    }

    pub fn registry(&self) -> &Arc<ApiRegistry> {
        &self.registry
    }

    pub fn kv(&self) -> &Arc<dyn KvResolver> {
        &self.kv
    }

    pub fn client(&self) -> UpstreamClient {
        self.client.clone()
    }

    /// The live routing table.
    pub fn mux(&self) -> Arc<ProxyMux> {
        self.mux.load_full()
    }

    /// Publish a freshly built routing table. A single pointer swap:
    /// in-flight requests finish on the old table.
    pub(crate) fn swap_mux(&self, mux: ProxyMux) {
        self.mux.store(Arc::new(mux));
    }

    /// Currently loaded descriptor for this id, if any.
    pub fn get_api_spec(&self, api_id: &str) -> Option<Arc<ApiDescriptor>> {
        self.registry.descriptor(api_id)
    }

    /// Replace the descriptor set the next reload will consume.
    pub fn set_descriptors(&self, descriptors: Vec<ApiDescriptor>) {
        if let Ok(mut source) = self.descriptor_source.write() {
            *source = descriptors;
        }
    }

    /// Copy of the control-plane descriptor set.
    pub fn descriptor_source(&self) -> Vec<ApiDescriptor> {
        self.descriptor_source
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn add_unload_hook(&self, hook: Arc<dyn UnloadHook>) {
        if let Ok(mut hooks) = self.unload_hooks.write() {
            hooks.push(hook);
        }
    }

    pub(crate) fn notify_unloaded(&self, api: &ApiDescriptor) {
        if let Ok(hooks) = self.unload_hooks.read() {
            for hook in hooks.iter() {
                hook.api_unloaded(api);
            }
        }
    }

    /// Load the playground page templates from the template directory.
    /// Missing templates are logged; affected routes answer 500.
    pub fn read_playground_templates(&self) {
        let template_path = self.config().template_path.clone();
        if template_path.is_empty() {
            return;
        }

        let dir = std::path::Path::new(&template_path).join("playground");
        let html = std::fs::read_to_string(dir.join("index.html"));
        let js = std::fs::read_to_string(dir.join("playground.js"));

        match (html, js) {
            (Ok(html), Ok(js)) => {
                if let Ok(mut slot) = self.playground.write() {
                    *slot = Some(PlaygroundTemplates { html, js });
                }
            }
            (html, js) => {
                let err = html.err().or(js.err());
                tracing::error!(
                    path = %dir.display(),
                    error = ?err,
                    "Could not load the default playground templates"
                );
            }
        }
    }

    pub fn playground_templates(&self) -> Option<PlaygroundTemplates> {
        self.playground.read().ok().and_then(|t| t.clone())
    }
}
