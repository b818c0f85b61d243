//! Fetch stage
//!
//! Reads declarative objects, runs them through the Kubernetes processors in
//! dependency order, and records the normalized results with their provenance.
//!
//! Structure:
//! - `location.rs` - provenance stack and its scoped guard
//! - `dependency.rs` - dependency graph, injector and manager
//! - `resource.rs` - normalized resources and the resource manager
//! - `context.rs` - per-cycle state handed to processors
//! - `processor.rs` - processor trait and composition wrappers
//! - `ambassador.rs`, `secret.rs`, `service.rs`, `ingress.rs`, `knative.rs` - processors
//! - `fetcher.rs` - filesystem and snapshot entry points

pub mod ambassador;
pub mod context;
pub mod dependency;
pub mod fetcher;
pub mod ingress;
pub mod knative;
pub mod location;
pub mod processor;
pub mod resource;
pub mod secret;
pub mod service;

pub use context::{DependencyStore, FetchContext, ServiceInfo, StatusUpdate};
pub use dependency::{
    CyclicDependencyError, Dependency, DependencyGraph, DependencyInjector, DependencyManager,
};
pub use fetcher::{FetchError, FetchResult, ResourceFetcher};
pub use location::{Location, LocationGuard, LocationManager};
pub use processor::{
    AggregateProcessor, CountingProcessor, DeduplicatingProcessor, KubernetesProcessor,
};
pub use resource::{NormalizedObject, NormalizedResource, ResourceManager, ResourceRecord};
