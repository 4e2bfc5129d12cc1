//! Credential, session, health and cache stores.
//!
//! # Responsibilities
//! - Define the store contract every backend satisfies
//! - Provide the ambient store bundle built once per reload
//! - Select per-API auth/org/session/health/cache stores
//!
//! # Design Decisions
//! - Stores are prefix-scoped key/value maps; the pipeline never sees the
//!   backing engine
//! - Cache stores are constructed per API and owned by its chain object,
//!   so unloading an API releases its cache

use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::apidef::{ApiDescriptor, StorageEngine};

/// Contract satisfied by every key store backend.
pub trait KeyStore: Send + Sync + std::fmt::Debug {
    /// Short backend name, used in logs.
    fn backend(&self) -> &'static str;

    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: String);

    fn delete(&self, key: &str) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Prefix-scoped concurrent in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    prefix: String,
    hash_keys: bool,
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new(prefix: &str, hash_keys: bool) -> Self {
        Self {
            prefix: prefix.to_string(),
            hash_keys,
            entries: DashMap::new(),
        }
    }

    /// Storage key: prefix plus (optionally hashed) logical key.
    fn storage_key(&self, key: &str) -> String {
        if self.hash_keys {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            format!("{}{:016x}", self.prefix, hasher.finish())
        } else {
            format!("{}{}", self.prefix, key)
        }
    }
}

impl KeyStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .get(&self.storage_key(key))
            .map(|r| r.value().clone())
    }

    fn set(&self, key: &str, value: String) {
        self.entries.insert(self.storage_key(key), value);
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.remove(&self.storage_key(key)).is_some()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Auth store resolving credentials against an LDAP directory.
///
/// Connection settings come from the descriptor's auth-provider metadata;
/// lookups are performed by the auth middleware, not here.
#[derive(Debug, Default)]
pub struct LdapStore {
    pub server: String,
    pub port: String,
    pub base_dn: String,
    pub attributes: String,
    entries: DashMap<String, String>,
}

impl LdapStore {
    /// Build from auth-provider metadata.
    pub fn from_meta(meta: &HashMap<String, String>) -> Self {
        Self {
            server: meta.get("ldap_server").cloned().unwrap_or_default(),
            port: meta.get("ldap_port").cloned().unwrap_or_default(),
            base_dn: meta.get("base_dn").cloned().unwrap_or_default(),
            attributes: meta.get("attributes").cloned().unwrap_or_default(),
            entries: DashMap::new(),
        }
    }
}

impl KeyStore for LdapStore {
    fn backend(&self) -> &'static str {
        "ldap"
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|r| r.value().clone())
    }

    fn set(&self, key: &str, value: String) {
        self.entries.insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Store proxied through the RPC control plane (edge mode).
#[derive(Debug, Default)]
pub struct RpcStore {
    prefix: String,
    hash_keys: bool,
    entries: DashMap<String, String>,
}

impl RpcStore {
    pub fn new(prefix: &str, hash_keys: bool) -> Self {
        Self {
            prefix: prefix.to_string(),
            hash_keys,
            entries: DashMap::new(),
        }
    }

    fn storage_key(&self, key: &str) -> String {
        if self.hash_keys {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            format!("{}{:016x}", self.prefix, hasher.finish())
        } else {
            format!("{}{}", self.prefix, key)
        }
    }
}

impl KeyStore for RpcStore {
    fn backend(&self) -> &'static str {
        "rpc"
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .get(&self.storage_key(key))
            .map(|r| r.value().clone())
    }

    fn set(&self, key: &str, value: String) {
        self.entries.insert(self.storage_key(key), value);
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.remove(&self.storage_key(key)).is_some()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Ambient store bundle, built once per reload.
#[derive(Debug, Clone)]
pub struct GeneralStores {
    /// Default credential store (`apikey-` prefix).
    pub key_store: Arc<dyn KeyStore>,
    /// Organisation records (`orgkey.` prefix).
    pub org_store: Arc<dyn KeyStore>,
    /// Shared API health counters (`apihealth.` prefix).
    pub health_store: Arc<dyn KeyStore>,
    /// RPC-proxied credential store for edge mode.
    pub rpc_auth_store: Arc<dyn KeyStore>,
    /// RPC-proxied organisation store for edge mode.
    pub rpc_org_store: Arc<dyn KeyStore>,
}

/// Stores bound to a single API by [`bind_stores`].
#[derive(Debug, Clone)]
pub struct BoundStores {
    pub auth: Arc<dyn KeyStore>,
    pub org: Arc<dyn KeyStore>,
    pub session: Arc<dyn KeyStore>,
    pub health: Arc<dyn KeyStore>,
}

/// Select per-API auth, org and session stores.
///
/// Returns the bound stores plus whether org-data freshness enforcement
/// must be switched on globally (RPC auth store selected).
pub fn bind_stores(api: &ApiDescriptor, gs: &GeneralStores) -> (BoundStores, bool) {
    let mut auth = gs.key_store.clone();
    let mut org = gs.org_store.clone();
    let mut enforce_org_data_age = false;

    match api.auth_provider.storage_engine {
        StorageEngine::Ldap => {
            auth = Arc::new(LdapStore::from_meta(&api.auth_provider.meta));
        }
        StorageEngine::Rpc => {
            auth = gs.rpc_auth_store.clone();
            org = gs.rpc_org_store.clone();
            enforce_org_data_age = true;
        }
        StorageEngine::Default => {}
    }

    let session = match api.session_provider.storage_engine {
        StorageEngine::Rpc => gs.rpc_auth_store.clone(),
        _ => gs.key_store.clone(),
    };

    (
        BoundStores {
            auth,
            org,
            session,
            health: gs.health_store.clone(),
        },
        enforce_org_data_age,
    )
}

/// Fresh per-API response cache, keyed `cache-<api_id>`.
pub fn cache_store_for(api_id: &str) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(&format!("cache-{api_id}"), false))
}

/// Error from the key-value reference resolver.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("value is not a key-value reference")]
    NotAReference,
    #[error("key-value reference `{0}` not found")]
    NotFound(String),
}

/// Resolves `env://NAME`-style references in descriptor fields.
///
/// A resolver miss leaves the original value untouched at the call site.
pub trait KvResolver: Send + Sync {
    fn resolve(&self, value: &str) -> Result<String, KvError>;
}

/// Resolver backed by process environment variables.
#[derive(Debug, Default)]
pub struct EnvKvResolver;

impl KvResolver for EnvKvResolver {
    fn resolve(&self, value: &str) -> Result<String, KvError> {
        let name = value.strip_prefix("env://").ok_or(KvError::NotAReference)?;
        std::env::var(name).map_err(|_| KvError::NotFound(name.to_string()))
    }
}

/// Fixed-map resolver for tests and embedded setups.
#[derive(Debug, Default)]
pub struct StaticKvResolver {
    entries: HashMap<String, String>,
}

impl StaticKvResolver {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }
}

impl KvResolver for StaticKvResolver {
    fn resolve(&self, value: &str) -> Result<String, KvError> {
        let name = value.strip_prefix("kv://").ok_or(KvError::NotAReference)?;
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| KvError::NotFound(name.to_string()))
    }
}
