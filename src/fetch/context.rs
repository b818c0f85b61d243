//! Per-cycle fetch state shared by every processor
//!
//! Processors receive `&mut FetchContext` instead of reaching for process-wide
//! state: it carries the settings, the resource manager, the published
//! dependencies, counters, and pending status updates.

use super::location::LocationManager;
use super::resource::{NormalizedResource, ResourceManager};
use crate::config::Settings;
use crate::diag::ErrorLog;
use crate::models::{KubernetesObject, ResourceKey};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Service data published for Ingress and Knative processing
#[derive(Debug, Clone, Default)]
pub struct ServiceInfo {
    /// The gateway's own Service, when it has been recognized
    pub ambassador_service: Option<KubernetesObject>,
    /// Every Service with ports, by key
    pub discovered_services: BTreeMap<ResourceKey, KubernetesObject>,
}

/// Dependencies published while processing a cycle
#[derive(Debug, Clone, Default)]
pub struct DependencyStore {
    pub service: ServiceInfo,
    /// Names of IngressClasses controlled by this gateway
    pub ingress_classes: BTreeSet<String>,
}

/// A status write-back for a Kubernetes object
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusUpdate {
    pub kind: String,
    pub namespace: String,
    pub status: Value,
}

/// Everything a processor can read or write during one fetch cycle
#[derive(Debug)]
pub struct FetchContext {
    pub settings: Arc<Settings>,
    pub manager: ResourceManager,
    pub deps: DependencyStore,
    pub counters: BTreeMap<String, u64>,
    pub k8s_status_updates: BTreeMap<String, StatusUpdate>,
}

impl FetchContext {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            manager: ResourceManager::new(Arc::clone(&settings)),
            settings,
            deps: DependencyStore::default(),
            counters: BTreeMap::new(),
            k8s_status_updates: BTreeMap::new(),
        }
    }

    pub fn emit(&mut self, resource: NormalizedResource) {
        self.manager.emit(resource);
    }

    pub fn errors_mut(&mut self) -> &mut ErrorLog {
        &mut self.manager.errors
    }

    pub fn incr_count(&mut self, key: &str) {
        *self.counters.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn get_count(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    pub fn location(&self) -> String {
        self.manager.location()
    }
}

impl AsMut<LocationManager> for FetchContext {
    fn as_mut(&mut self) -> &mut LocationManager {
        &mut self.manager.locations
    }
}
