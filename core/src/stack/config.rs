use serde::{Deserialize, Serialize};

use super::{shared, BlockCache, DedicatedCache, StackEntryPtr, StreamStackEntry};

const MIB: u64 = 1024 * 1024;

/// What the device at the bottom of the stack is capable of. Block sizes in the
/// stack configuration can be given relative to these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareInformation {
    /// The largest read the device handles in one go.
    pub max_transfer: u64,
    /// The alignment reads need in memory.
    pub max_physical_sector_size: u64,
    /// The alignment read sizes need.
    pub max_logical_sector_size: u64,
}

impl Default for HardwareInformation {
    fn default() -> Self {
        Self {
            max_transfer: 64 * 1024,
            max_physical_sector_size: 4096,
            max_logical_sector_size: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockSize {
    /// The largest read the device handles in one go.
    MaxTransfer,
    /// The memory alignment of the device.
    MemoryAlignment,
    /// The size alignment of the device.
    SizeAlignment,
    /// A size in bytes.
    Absolute(u64),
}

impl BlockSize {
    pub fn resolve(&self, hardware: &HardwareInformation) -> u64 {
        match self {
            BlockSize::MaxTransfer => hardware.max_transfer,
            BlockSize::MemoryAlignment => hardware.max_physical_sector_size,
            BlockSize::SizeAlignment => hardware.max_logical_sector_size,
            BlockSize::Absolute(size) => *size,
        }
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        BlockSize::MaxTransfer
    }
}

/// Settings for a [`DedicatedCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedicatedCacheConfig {
    /// The size of every dedicated cache in mebibytes.
    pub cache_size_mib: u32,
    pub block_size: BlockSize,
    /// Only store the last block of a read. This works well for files that are read
    /// from front to back.
    pub write_only_epilog: bool,
}

impl Default for DedicatedCacheConfig {
    fn default() -> Self {
        Self {
            cache_size_mib: 2,
            block_size: BlockSize::MaxTransfer,
            write_only_epilog: true,
        }
    }
}

impl DedicatedCacheConfig {
    pub fn create(&self, hardware: &HardwareInformation) -> DedicatedCache {
        DedicatedCache::new(
            u64::from(self.cache_size_mib) * MIB,
            self.block_size.resolve(hardware),
            hardware.max_physical_sector_size,
            self.write_only_epilog,
        )
    }
}

/// Settings for a [`BlockCache`] that sits in the stack on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockCacheConfig {
    pub cache_size_mib: u32,
    pub block_size: BlockSize,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            cache_size_mib: 8,
            block_size: BlockSize::MaxTransfer,
        }
    }
}

impl BlockCacheConfig {
    pub fn create(&self, hardware: &HardwareInformation) -> BlockCache {
        BlockCache::new(
            u64::from(self.cache_size_mib) * MIB,
            self.block_size.resolve(hardware),
            hardware.max_physical_sector_size,
            false,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StackEntryConfig {
    DedicatedCache(DedicatedCacheConfig),
    BlockCache(BlockCacheConfig),
}

/// The entries of a stack, from the root down. The device is added at the bottom
/// when the stack is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub entries: Vec<StackEntryConfig>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            entries: vec![StackEntryConfig::DedicatedCache(
                DedicatedCacheConfig::default(),
            )],
        }
    }
}

impl StackConfig {
    /// Build the stack on top of `device` and return its root.
    pub fn build(&self, hardware: &HardwareInformation, device: StackEntryPtr) -> StackEntryPtr {
        let mut next = device;
        for entry in self.entries.iter().rev() {
            next = match entry {
                StackEntryConfig::DedicatedCache(config) => {
                    let mut cache = config.create(hardware);
                    cache.set_next(Some(next));
                    shared(cache)
                }
                StackEntryConfig::BlockCache(config) => {
                    let mut cache = config.create(hardware);
                    cache.set_next(Some(next));
                    shared(cache)
                }
            };
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::lock;
    use crate::tests::MockStorage;

    #[test]
    fn block_sizes_resolve_against_hardware() {
        let hardware = HardwareInformation {
            max_transfer: 1 << 20,
            max_physical_sector_size: 4096,
            max_logical_sector_size: 512,
        };
        assert_eq!(BlockSize::MaxTransfer.resolve(&hardware), 1 << 20);
        assert_eq!(BlockSize::MemoryAlignment.resolve(&hardware), 4096);
        assert_eq!(BlockSize::SizeAlignment.resolve(&hardware), 512);
        assert_eq!(BlockSize::Absolute(1234).resolve(&hardware), 1234);
    }

    #[test]
    fn json_config() {
        let json = r#"{
            "entries": [
                { "type": "dedicated_cache", "cache_size_mib": 4, "block_size": "memory_alignment", "write_only_epilog": false },
                { "type": "block_cache", "block_size": { "absolute": 8192 } }
            ]
        }"#;

        let config: StackConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.entries,
            vec![
                StackEntryConfig::DedicatedCache(DedicatedCacheConfig {
                    cache_size_mib: 4,
                    block_size: BlockSize::MemoryAlignment,
                    write_only_epilog: false,
                }),
                StackEntryConfig::BlockCache(BlockCacheConfig {
                    cache_size_mib: 8,
                    block_size: BlockSize::Absolute(8192),
                }),
            ]
        );

        let written = serde_json::to_string(&config).unwrap();
        let read_back: StackConfig = serde_json::from_str(&written).unwrap();
        assert_eq!(read_back, config);
    }

    #[test]
    fn dedicated_cache_config_creates_cache() {
        let config = DedicatedCacheConfig {
            cache_size_mib: 1,
            block_size: BlockSize::SizeAlignment,
            write_only_epilog: true,
        };
        let cache = config.create(&HardwareInformation::default());
        assert_eq!(cache.cache_size(), MIB);
        // Blocks are aligned to the physical sector size.
        assert_eq!(cache.block_size(), 4096);
    }

    #[test]
    fn build_links_entries_in_order() {
        let config = StackConfig {
            entries: vec![
                StackEntryConfig::DedicatedCache(DedicatedCacheConfig::default()),
                StackEntryConfig::BlockCache(BlockCacheConfig::default()),
            ],
        };
        let (storage, _log) = MockStorage::new();
        let root = config.build(&HardwareInformation::default(), shared(storage));

        let root = lock(&root);
        assert_eq!(root.name(), "Dedicated cache");
        assert_eq!(root.link().next_name(), "Block cache");

        let block_cache = root.next().unwrap();
        assert_eq!(lock(&block_cache).link().next_name(), "Mock storage");
    }
}
