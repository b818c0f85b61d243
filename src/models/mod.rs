//! Object model
//!
//! Typed identity and views over raw declarative resources.
//!
//! Structure:
//! - `gvk.rs` - `ResourceIdentity` and `ResourceKey`
//! - `object.rs` - `KubernetesObject`, the validated raw-object wrapper
//! - `native_kind.rs` - the gateway's own CRD kinds

pub mod gvk;
pub mod native_kind;
pub mod object;

pub use gvk::{ResourceIdentity, ResourceKey, ResourceScope};
pub use native_kind::NativeKind;
pub use object::{KubernetesObject, ObjectError, ObjectResult};
