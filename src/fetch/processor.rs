//! Kubernetes object processors
//!
//! A processor declares the kinds it handles and turns matching objects into
//! normalized resources. The wrappers here compose processors: fan-out by kind,
//! de-duplication by object key, and counting.

use super::context::FetchContext;
use super::dependency::DependencyManager;
use crate::models::{KubernetesObject, ResourceIdentity, ResourceKey};
use std::collections::{BTreeSet, HashSet};

/// A single-responsibility handler for some set of object kinds
pub trait KubernetesProcessor {
    /// Kinds this processor handles
    fn kinds(&self) -> BTreeSet<ResourceIdentity>;

    /// Declare wanted and provided dependencies
    fn declare(&self, _deps: &mut DependencyManager) {}

    /// Veto processing of an object whose kind matched
    fn admit(&self, _obj: &KubernetesObject, _cx: &FetchContext) -> bool {
        true
    }

    /// Handle one object of a matching kind
    fn process(&mut self, obj: &KubernetesObject, cx: &mut FetchContext);

    /// Called once after every object of the cycle has been processed
    fn finalize(&mut self, _cx: &mut FetchContext) {}

    /// Process `obj` if its kind matches. Returns whether the kind matched.
    fn try_process(&mut self, obj: &KubernetesObject, cx: &mut FetchContext) -> bool {
        if !self.kinds().contains(obj.gvk()) {
            return false;
        }

        if self.admit(obj, cx) {
            self.process(obj, cx);
        } else {
            tracing::debug!("{}: not admitting {} {}", cx.location(), obj.kind(), obj.name());
        }

        true
    }
}

/// Fans each object out to every delegate that handles its kind
pub struct AggregateProcessor {
    delegates: Vec<Box<dyn KubernetesProcessor>>,
}

impl AggregateProcessor {
    pub fn new(delegates: Vec<Box<dyn KubernetesProcessor>>) -> Self {
        Self { delegates }
    }
}

impl KubernetesProcessor for AggregateProcessor {
    fn kinds(&self) -> BTreeSet<ResourceIdentity> {
        self.delegates.iter().flat_map(|d| d.kinds()).collect()
    }

    fn declare(&self, deps: &mut DependencyManager) {
        for delegate in &self.delegates {
            delegate.declare(deps);
        }
    }

    fn process(&mut self, obj: &KubernetesObject, cx: &mut FetchContext) {
        for delegate in &mut self.delegates {
            delegate.try_process(obj, cx);
        }
    }

    fn finalize(&mut self, cx: &mut FetchContext) {
        for delegate in &mut self.delegates {
            delegate.finalize(cx);
        }
    }
}

/// Drops objects whose key has already been seen this cycle
pub struct DeduplicatingProcessor<P> {
    delegate: P,
    cache: HashSet<ResourceKey>,
}

impl<P: KubernetesProcessor> DeduplicatingProcessor<P> {
    pub fn new(delegate: P) -> Self {
        Self {
            delegate,
            cache: HashSet::new(),
        }
    }
}

impl<P: KubernetesProcessor> KubernetesProcessor for DeduplicatingProcessor<P> {
    fn kinds(&self) -> BTreeSet<ResourceIdentity> {
        self.delegate.kinds()
    }

    fn declare(&self, deps: &mut DependencyManager) {
        self.delegate.declare(deps);
    }

    fn process(&mut self, obj: &KubernetesObject, cx: &mut FetchContext) {
        if !self.cache.insert(obj.key()) {
            tracing::debug!("dropping duplicate {}", obj.key());
            return;
        }

        self.delegate.try_process(obj, cx);
    }

    fn finalize(&mut self, cx: &mut FetchContext) {
        self.delegate.finalize(cx);
    }
}

/// Increments a counter for each matching object; emits nothing
pub struct CountingProcessor {
    kinds: BTreeSet<ResourceIdentity>,
    key: String,
}

impl CountingProcessor {
    pub fn new(kinds: impl IntoIterator<Item = ResourceIdentity>, key: impl Into<String>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            key: key.into(),
        }
    }
}

impl KubernetesProcessor for CountingProcessor {
    fn kinds(&self) -> BTreeSet<ResourceIdentity> {
        self.kinds.clone()
    }

    fn process(&mut self, _obj: &KubernetesObject, cx: &mut FetchContext) {
        cx.incr_count(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::Arc;

    struct FinalizingProcessor {
        finalized: Rc<Cell<bool>>,
    }

    impl KubernetesProcessor for FinalizingProcessor {
        fn kinds(&self) -> BTreeSet<ResourceIdentity> {
            BTreeSet::new()
        }

        fn process(&mut self, _obj: &KubernetesObject, _cx: &mut FetchContext) {}

        fn finalize(&mut self, _cx: &mut FetchContext) {
            self.finalized.set(true);
        }
    }

    fn mapping() -> KubernetesObject {
        KubernetesObject::new(
            json!({
                "apiVersion": "getambassador.io/v3alpha1",
                "kind": "Mapping",
                "metadata": {"name": "test", "namespace": "default"},
                "spec": {"prefix": "/test/", "service": "test.default"}
            }),
            "default",
        )
        .unwrap()
    }

    fn knative_ingress() -> KubernetesObject {
        KubernetesObject::new(
            json!({
                "apiVersion": "networking.internal.knative.dev/v1alpha1",
                "kind": "Ingress",
                "metadata": {"name": "helloworld-go", "namespace": "test"}
            }),
            "default",
        )
        .unwrap()
    }

    fn context() -> FetchContext {
        FetchContext::new(Arc::new(Settings::default()))
    }

    #[test]
    fn test_counting() {
        let mut cx = context();
        let mut p = CountingProcessor::new([mapping().gvk().clone()], "test");

        assert!(p.try_process(&mapping(), &mut cx));
        assert!(p.try_process(&mapping(), &mut cx));
        assert!(!p.try_process(&knative_ingress(), &mut cx));
        assert_eq!(cx.get_count("test"), 2);
    }

    #[test]
    fn test_aggregation() {
        let mut cx = context();
        let finalized = Rc::new(Cell::new(false));
        let mut p = AggregateProcessor::new(vec![
            Box::new(CountingProcessor::new([knative_ingress().gvk().clone()], "test_1")),
            Box::new(CountingProcessor::new([mapping().gvk().clone()], "test_2")),
            Box::new(FinalizingProcessor {
                finalized: Rc::clone(&finalized),
            }),
        ]);

        assert_eq!(p.kinds().len(), 2);
        assert!(p.try_process(&knative_ingress(), &mut cx));
        assert!(p.try_process(&mapping(), &mut cx));
        assert_eq!(cx.get_count("test_1"), 1);
        assert_eq!(cx.get_count("test_2"), 1);

        p.finalize(&mut cx);
        assert!(finalized.get());
    }

    #[test]
    fn test_deduplication() {
        let mut cx = context();
        let mut p =
            DeduplicatingProcessor::new(CountingProcessor::new([mapping().gvk().clone()], "test"));

        for _ in 0..3 {
            assert!(p.try_process(&mapping(), &mut cx));
        }
        assert_eq!(cx.get_count("test"), 1);
    }
}
