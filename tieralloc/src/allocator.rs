//! Constructors of the Linux allocator.

use std::sync::Arc;

use tieralloc_core::{ConfigError, Configuration, MemoryManager};

use crate::LinuxPlatform;

/// A memory manager backed by the Linux platform.
pub type TierAllocator = MemoryManager<LinuxPlatform>;

/// Creates an allocator with the given configuration.
///
/// #   Errors
///
/// Returns an error if the configuration is invalid.
pub fn create(configuration: Configuration) -> Result<TierAllocator, ConfigError> {
    let platform = Arc::new(LinuxPlatform::new());

    log::debug!("Creating allocator with {:?}", configuration);

    MemoryManager::new(platform, configuration)
}

/// Creates an allocator with the default configuration.
pub fn create_default() -> Result<TierAllocator, ConfigError> { create(Configuration::default()) }

#[cfg(test)]
mod tests {

use super::*;

#[test]
fn create_rejects_invalid_configuration() {
    let configuration = Configuration::default().with_default_block_size(1000);

    assert_eq!(Some(ConfigError::BlockSize(1000)), create(configuration).err());
}

#[test]
fn create_default_shares_topology() {
    let allocator = create_default().unwrap();

    assert!(std::ptr::eq(crate::topology::detect(), allocator.topology()));
}

} // mod tests
