//! Partition geometry
//!
//! Provides presets for common partition sizes and validation for custom ones.

/// Partition geometry and naming limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionConfig {
    /// Flash page (sector) size in bytes
    pub page_size: u32,
    /// Number of pages in the partition
    pub page_count: u32,
    /// Pages held back so the substrate always has room to reorganize
    pub reserved_pages: u32,
    /// Maximum namespace / key length in bytes
    pub max_name_len: usize,
}

impl PartitionConfig {
    /// Default 24KB NVS partition: 6 pages of 4KB
    pub fn esp32_default() -> Self {
        Self {
            page_size: 4096,
            page_count: 6,
            reserved_pages: 1,
            max_name_len: 15,
        }
    }

    /// Smallest usable partition: 3 pages of 4KB
    pub fn minimal() -> Self {
        Self {
            page_size: 4096,
            page_count: 3,
            reserved_pages: 1,
            max_name_len: 15,
        }
    }

    /// 64KB partition for devices with a dedicated data region
    pub fn large() -> Self {
        Self {
            page_size: 4096,
            page_count: 16,
            reserved_pages: 1,
            max_name_len: 15,
        }
    }

    /// Total partition size in bytes
    pub fn capacity_bytes(&self) -> u64 {
        self.page_size as u64 * self.page_count as u64
    }

    /// Bytes available for stored contents (capacity minus reserved pages)
    pub fn usable_bytes(&self) -> u64 {
        self.page_size as u64 * self.page_count.saturating_sub(self.reserved_pages) as u64
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.page_size < 512 || !self.page_size.is_power_of_two() {
            return Err("page_size must be a power of two >= 512".into());
        }
        if self.reserved_pages == 0 {
            return Err("reserved_pages must be > 0".into());
        }
        if self.page_count <= self.reserved_pages {
            return Err("page_count must exceed reserved_pages".into());
        }
        if self.max_name_len == 0 || self.max_name_len > u8::MAX as usize {
            return Err("max_name_len must be in [1, 255]".into());
        }
        Ok(())
    }
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self::esp32_default()
    }
}
