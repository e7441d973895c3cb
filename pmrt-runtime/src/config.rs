//! Runtime configuration

use alloc::vec::Vec;
use core::ops::Range;

/// Default stack size for new threads
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;
/// Smallest stack a thread may be created with
pub const MIN_STACK_SIZE: usize = 4 * 1024;
/// Initial size of the interrupt stack pool
pub const DEFAULT_INTERRUPT_STACK_SIZE: usize = 64 * 1024;
/// Stack reserved per interrupt nesting level
pub const DEFAULT_INTERRUPT_FRAME_SIZE: usize = 4 * 1024;
/// Free interrupt stack below which the pool is grown
pub const DEFAULT_INTERRUPT_LOW_WATER: usize = 16 * 1024;

/// Blocks of each small size class kept free for interrupt context
pub const DEFAULT_INTERRUPT_HEAP_RESERVE: usize = 64;
/// Block sizes covered by the interrupt-context reserve
pub const INTERRUPT_RESERVE_SIZES: [usize; 5] = [16, 32, 64, 128, 256];

/// Faults converted into [`CpuException`](crate::exception::CpuException)s
/// by default: divide error, overflow, bound range, invalid opcode, segment
/// not present, general protection, page fault, x87 error, alignment check
/// and SIMD error.
pub const DEFAULT_RERAISE_VECTORS: [u8; 10] = [0x00, 0x04, 0x05, 0x06, 0x0b, 0x0d, 0x0e, 0x10, 0x11, 0x13];

/// Configuration consumed by [`Runtime::new`](crate::Runtime::new)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Stack size used by [`ThreadBuilder`](crate::thread::ThreadBuilder) unless overridden
    pub default_stack_size: usize,
    /// Initial capacity of the interrupt stack pool
    pub interrupt_stack_size: usize,
    /// Stack reserved for each interrupt nesting level
    pub interrupt_frame_size: usize,
    /// Free capacity that triggers growth of the interrupt stack pool
    pub interrupt_low_water: usize,
    /// Blocks of each small locked-heap class provisioned up front for
    /// allocations made by interrupt handlers
    pub interrupt_heap_reserve: usize,
    /// Fault vectors re-raised as typed errors
    pub reraise_vectors: Vec<u8>,
    /// Linear addresses considered library code for fault re-raising
    pub code_range: Range<usize>,
    /// Switch FPU state on first use instead of on every context change
    pub lazy_fpu: bool,
    /// Initial state of the process-wide debug toggle
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_stack_size: DEFAULT_STACK_SIZE,
            interrupt_stack_size: DEFAULT_INTERRUPT_STACK_SIZE,
            interrupt_frame_size: DEFAULT_INTERRUPT_FRAME_SIZE,
            interrupt_low_water: DEFAULT_INTERRUPT_LOW_WATER,
            interrupt_heap_reserve: DEFAULT_INTERRUPT_HEAP_RESERVE,
            reraise_vectors: DEFAULT_RERAISE_VECTORS.to_vec(),
            code_range: 0..usize::MAX,
            lazy_fpu: true,
            debug: cfg!(debug_assertions),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_stack_size(mut self, size: usize) -> Self {
        self.default_stack_size = size;
        self
    }

    pub fn with_interrupt_stack(mut self, size: usize, frame_size: usize, low_water: usize) -> Self {
        self.interrupt_stack_size = size;
        self.interrupt_frame_size = frame_size;
        self.interrupt_low_water = low_water;
        self
    }

    pub fn with_interrupt_heap_reserve(mut self, blocks: usize) -> Self {
        self.interrupt_heap_reserve = blocks;
        self
    }

    pub fn with_reraise_vectors(mut self, vectors: &[u8]) -> Self {
        self.reraise_vectors = vectors.to_vec();
        self
    }

    pub fn with_code_range(mut self, range: Range<usize>) -> Self {
        self.code_range = range;
        self
    }

    pub fn with_lazy_fpu(mut self, lazy: bool) -> Self {
        self.lazy_fpu = lazy;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Checks the values for consistency
    pub fn validate(&self) -> pmrt_api::Result<()> {
        if self.default_stack_size < MIN_STACK_SIZE {
            return Err(pmrt_api::Error::InvalidArgument("default stack size below minimum"));
        }
        if self.interrupt_frame_size == 0 || self.interrupt_stack_size < self.interrupt_frame_size {
            return Err(pmrt_api::Error::InvalidArgument("interrupt stack smaller than one frame"));
        }
        if self.interrupt_low_water >= self.interrupt_stack_size {
            return Err(pmrt_api::Error::InvalidArgument("interrupt low-water mark exceeds stack size"));
        }
        if self.reraise_vectors.iter().any(|&v| v >= 32) {
            return Err(pmrt_api::Error::InvalidArgument("re-raised vector is not an exception"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(RuntimeConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_inconsistent_interrupt_stack() {
        let config = RuntimeConfig::new().with_interrupt_stack(8 * 1024, 4 * 1024, 8 * 1024);
        assert!(config.validate().is_err());
        let config = RuntimeConfig::new().with_reraise_vectors(&[0x0d, 0x21]);
        assert!(config.validate().is_err());
    }
}
