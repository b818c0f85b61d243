//! Pass-through for the gateway's own CRDs

use super::context::FetchContext;
use super::processor::KubernetesProcessor;
use super::resource::NormalizedResource;
use crate::models::{KubernetesObject, NativeKind, ResourceIdentity};
use std::collections::BTreeSet;

/// API versions the native kinds are accepted under
pub const NATIVE_API_VERSIONS: &[&str] = &["getambassador.io/v2", "getambassador.io/v3alpha1"];

/// Emits native CRD objects unchanged apart from normalization
#[derive(Debug, Default)]
pub struct NativeCrdProcessor;

impl KubernetesProcessor for NativeCrdProcessor {
    fn kinds(&self) -> BTreeSet<ResourceIdentity> {
        NATIVE_API_VERSIONS
            .iter()
            .flat_map(|version| {
                NativeKind::all()
                    .iter()
                    .map(move |kind| ResourceIdentity::new(*version, kind.as_str()))
            })
            .collect()
    }

    fn process(&mut self, obj: &KubernetesObject, cx: &mut FetchContext) {
        cx.emit(NormalizedResource::from_resource(obj));
    }
}
