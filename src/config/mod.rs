//! # LoamDB Configuration Module
//!
//! Centralizes all configuration constants for LoamDB. Constants are grouped
//! by functional area and interdependencies are documented and enforced
//! through compile-time assertions.
//!
//! ## Why Centralization?
//!
//! Several on-disk values depend on each other: the page header size bounds
//! the payload, the compressed-block constants bound each other, and the
//! file header must fit into the smallest legal page. Co-locating the values
//! with `const` assertions prevents the class of mismatch bugs that arises
//! when such numbers are scattered across modules.
//!
//! ## Module Organization
//!
//! - [`constants`]: all numeric configuration values with dependency notes
//! - [`EnvOptions`]: validated runtime options for opening an environment

pub mod constants;
pub use constants::*;

use eyre::{ensure, Result};

/// Runtime options for creating or opening an environment.
///
/// Page size must be a power of two between [`MIN_PAGE_SIZE`] and
/// [`MAX_PAGE_SIZE`]; the cache capacity is a page count.
#[derive(Debug, Clone)]
pub struct EnvOptions {
    pub page_size: usize,
    pub cache_capacity: usize,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl EnvOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn cache_capacity(mut self, pages: usize) -> Self {
        self.cache_capacity = pages;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.page_size.is_power_of_two(),
            "page size {} is not a power of two",
            self.page_size
        );
        ensure!(
            (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size),
            "page size {} outside valid range {}..={}",
            self.page_size,
            MIN_PAGE_SIZE,
            MAX_PAGE_SIZE
        );
        ensure!(
            self.cache_capacity >= CACHE_SHARD_COUNT,
            "cache capacity {} must be at least {} (one page per shard)",
            self.cache_capacity,
            CACHE_SHARD_COUNT
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        assert!(EnvOptions::default().validate().is_ok());
    }

    #[test]
    fn page_size_must_be_power_of_two() {
        let opts = EnvOptions::new().page_size(3000);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn page_size_bounds_enforced() {
        assert!(EnvOptions::new().page_size(512).validate().is_err());
        assert!(EnvOptions::new().page_size(128 * 1024).validate().is_err());
        assert!(EnvOptions::new().page_size(1024).validate().is_ok());
        assert!(EnvOptions::new().page_size(65536).validate().is_ok());
    }

    #[test]
    fn cache_capacity_floor() {
        let opts = EnvOptions::new().cache_capacity(1);
        assert!(opts.validate().is_err());
    }
}
