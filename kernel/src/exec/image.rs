//! Image Store
//!
//! Maps image URIs to runnable programs. This stands in for the binary
//! store a bootstrap layer would normally provide.

use crate::KernelResult;
use super::UnitPort;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by a running program
pub type ProgramFuture = Pin<Box<dyn Future<Output = KernelResult<()>> + Send + 'static>>;

/// Program entry point
pub type Program = Arc<dyn Fn(UnitPort) -> ProgramFuture + Send + Sync>;

/// Registry of loadable images
#[derive(Clone, Default)]
pub struct ImageStore {
    images: HashMap<String, Program>,
}

impl ImageStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a program under `uri`, replacing any previous one
    pub fn register<F, Fut>(&mut self, uri: impl Into<String>, program: F)
    where
        F: Fn(UnitPort) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = KernelResult<()>> + Send + 'static,
    {
        let program: Program = Arc::new(move |port| Box::pin(program(port)));
        self.images.insert(uri.into(), program);
    }

    /// Look up a program
    pub fn get(&self, uri: &str) -> Option<Program> {
        self.images.get(uri).cloned()
    }

    /// Check if an image is registered
    pub fn contains(&self, uri: &str) -> bool {
        self.images.contains_key(uri)
    }

    /// Registered URIs, sorted
    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<_> = self.images.keys().cloned().collect();
        uris.sort();
        uris
    }
}

impl std::fmt::Debug for ImageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageStore")
            .field("images", &self.uris())
            .finish()
    }
}
