//! Provenance tracking
//!
//! Every emitted resource is stamped with the location it came from: a filename
//! and the occurrence count of the object within it. Locations nest; a
//! [`LocationGuard`] pushes one and pops it again when dropped, on every exit path
//! including unwinding.

use std::fmt;
use std::ops::{Deref, DerefMut};

const ANNOTATION_SUFFIX: &str = ":annotation";

/// Current input source marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub filename: Option<String>,
    pub ocount: usize,
}

impl Location {
    pub fn new(filename: Option<String>) -> Self {
        Self { filename, ocount: 1 }
    }

    /// Filename, or `default` for anonymous input
    pub fn filename_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.filename.as_deref().unwrap_or(default)
    }

    /// Mark this location as sourced from an annotation. Idempotent.
    pub fn mark_annotation(&mut self) {
        if let Some(filename) = self.filename.as_mut() {
            if !filename.ends_with(ANNOTATION_SUFFIX) {
                filename.push_str(ANNOTATION_SUFFIX);
            }
        }
    }
}

impl Default for Location {
    fn default() -> Self {
        Self::new(None)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.filename_or("anonymous YAML"), self.ocount)
    }
}

/// Stack of locations
#[derive(Debug, Default)]
pub struct LocationManager {
    previous: Vec<Location>,
    current: Location,
}

impl LocationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &Location {
        &self.current
    }

    pub fn current_mut(&mut self) -> &mut Location {
        &mut self.current
    }

    /// Depth of saved locations
    pub fn depth(&self) -> usize {
        self.previous.len()
    }

    fn push(&mut self, location: Location) {
        let previous = std::mem::replace(&mut self.current, location);
        self.previous.push(previous);
    }

    fn pop(&mut self) {
        match self.previous.pop() {
            Some(previous) => self.current = previous,
            None => tracing::warn!("location stack underflow at {}", self.current),
        }
    }
}

impl AsMut<LocationManager> for LocationManager {
    fn as_mut(&mut self) -> &mut LocationManager {
        self
    }
}

/// Scoped location push; the previous location is restored on drop.
///
/// The guard dereferences to whatever owns the [`LocationManager`], so work done
/// inside the scope goes through the guard.
pub struct LocationGuard<'a, T: AsMut<LocationManager>> {
    owner: &'a mut T,
}

impl<'a, T: AsMut<LocationManager>> LocationGuard<'a, T> {
    /// Push a fresh location for `filename`
    pub fn push(owner: &'a mut T, filename: Option<String>) -> Self {
        owner.as_mut().push(Location::new(filename));
        Self { owner }
    }

    /// Push a location that keeps the current filename with a reset count
    pub fn push_reset(owner: &'a mut T) -> Self {
        let manager = owner.as_mut();
        let filename = manager.current.filename.clone();
        manager.push(Location::new(filename));
        Self { owner }
    }

    pub fn location(&mut self) -> &mut Location {
        &mut self.owner.as_mut().current
    }
}

impl<T: AsMut<LocationManager>> Deref for LocationGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.owner
    }
}

impl<T: AsMut<LocationManager>> DerefMut for LocationGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.owner
    }
}

impl<T: AsMut<LocationManager>> Drop for LocationGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.as_mut().pop();
    }
}
