use wasmtime::ResourceLimiter;

/// Host-side bytes charged per table slot when bounding table growth.
const TABLE_SLOT_BYTES: usize = 16;
/// Floor for small memory caps; the interpreter's own function table needs
/// a few hundred slots.
const MIN_TABLE_SLOTS: usize = 4096;

/// Caps a guest's linear memory and tables, tracking current memory size.
pub struct MemoryLimiter {
    max_memory: usize,
    max_table_slots: usize,
    current: usize,
}

impl MemoryLimiter {
    pub fn new(max_memory: usize) -> Self {
        Self {
            max_memory,
            max_table_slots: (max_memory / TABLE_SLOT_BYTES).max(MIN_TABLE_SLOTS),
            current: 0,
        }
    }

    pub const fn current(&self) -> usize {
        self.current
    }

    pub const fn max_table_slots(&self) -> usize {
        self.max_table_slots
    }
}

impl ResourceLimiter for MemoryLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.max_memory {
            return Ok(false);
        }
        self.current = desired;
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= self.max_table_slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_limit_is_enforced() {
        let mut limiter = MemoryLimiter::new(128 * 1024);
        assert!(limiter.memory_growing(0, 64 * 1024, None).expect("grow"));
        assert_eq!(limiter.current(), 64 * 1024);
        assert!(
            !limiter
                .memory_growing(64 * 1024, 192 * 1024, None)
                .expect("grow")
        );
        assert_eq!(limiter.current(), 64 * 1024);
    }

    #[test]
    fn table_slots_scale_with_memory_cap() {
        let mut small = MemoryLimiter::new(64 * 1024);
        assert_eq!(small.max_table_slots(), MIN_TABLE_SLOTS);
        assert!(small.table_growing(0, MIN_TABLE_SLOTS, None).expect("grow"));
        assert!(!small.table_growing(0, MIN_TABLE_SLOTS + 1, None).expect("grow"));

        let mut large = MemoryLimiter::new(64 * 1024 * 1024);
        assert_eq!(large.max_table_slots(), 4 * 1024 * 1024);
        assert!(large.table_growing(10, 1024 * 1024, None).expect("grow"));
        assert!(!large.table_growing(10, usize::MAX, None).expect("grow"));
    }
}
