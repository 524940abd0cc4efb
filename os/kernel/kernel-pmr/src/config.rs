//! Engine-wide tunables.

/// Number of device ids the import bitmap can represent.
pub const MAX_DEVICES: u8 = 64;

/// Nesting level used when locking a second resource while another resource
/// lock of the same class is already held.
pub const NESTED_RESOURCE_LOCK: u8 = 1;

/// Behaviour switches and timings handed to a [`PmrContext`](crate::PmrContext).
///
/// Devices created for the context copy it, so one context describes one
/// driver configuration.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PmrConfig {
    /// Park whole resources on the device zombie queue instead of freeing
    /// them while the device may still cache their translations.
    pub deferred_free: bool,
    /// Park page remnants released by unlock and sparse changes.
    pub pages_deferred_free: bool,
    /// Track cross-device imports and make them hold back destruction.
    pub device_import_deferred_free: bool,
    /// Honour the page-migration sub-state.
    pub page_migration: bool,
    /// Granularity of kernel mappings, in bytes.
    pub cpu_page_size: u64,
    /// Back-off reported by a cleanup pass that has to try again.
    pub cleanup_retry_timeout_ms: u32,
}

impl PmrConfig {
    pub const DEFAULT: Self = Self {
        deferred_free: true,
        pages_deferred_free: true,
        device_import_deferred_free: true,
        page_migration: true,
        cpu_page_size: 4096,
        cleanup_retry_timeout_ms: 1000,
    };

    /// Everything freed synchronously.
    #[must_use]
    pub const fn immediate_free() -> Self {
        Self {
            deferred_free: false,
            pages_deferred_free: false,
            device_import_deferred_free: false,
            ..Self::DEFAULT
        }
    }
}

impl Default for PmrConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
