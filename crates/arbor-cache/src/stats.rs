//! Hit, miss and eviction counters of a cache.

/// Counters kept by [`SizedLruCache`](crate::SizedLruCache).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found their key.
    pub hits: u64,
    /// Lookups that missed.
    pub misses: u64,
    /// Entries dropped to stay within the budget.
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, or 0 before the first lookup.
    pub fn hit_ratio(&self) -> f64 {
        match self.hits + self.misses {
            0 => 0.0,
            lookups => self.hits as f64 / lookups as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        assert_eq!(CacheStats::default().hit_ratio(), 0.0);

        let stats = CacheStats {
            hits: 3,
            misses: 1,
            evictions: 0,
        };
        assert!((stats.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }
}
