use std::collections::HashMap;
use std::sync::Arc;

use super::{KernelProgram, KernelSource};
use crate::error::Result;

/// Program cache owned by one pipeline build.
///
/// Keyed by [`KernelSource::content_hash`]; equal definitions share a single
/// compiled program for as long as the registry (and any phase holding the
/// program) lives.
#[derive(Debug, Default)]
pub struct KernelRegistry {
    programs: HashMap<u64, Vec<Arc<KernelProgram>>>,
    hits: usize,
    misses: usize,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached program for `source`, compiling it on first use.
    pub fn get_or_compile(&mut self, source: &KernelSource) -> Result<Arc<KernelProgram>> {
        let bucket = self.programs.entry(source.content_hash()).or_default();
        if let Some(program) = bucket.iter().find(|p| p.source() == source) {
            self.hits += 1;
            return Ok(program.clone());
        }

        let program = Arc::new(source.compile()?);
        log::debug!("compiled kernel '{}'", source.name());
        bucket.push(program.clone());
        self.misses += 1;
        Ok(program)
    }

    /// Number of distinct compiled programs.
    pub fn len(&self) -> usize {
        self.programs.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }
}
