use log::debug;
use crate::error::{AllocationExhausted, StorageError};
use crate::job::JobParams;
use crate::storage::{join_path, ObjectStore};

/// Bin layout of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinsConfig {
    pub dir_count: u32,
    pub capacity_per_dir: u32,
}

impl BinsConfig {
    pub fn from_params(params: &JobParams) -> Self {
        Self {
            dir_count: params.max_dirs,
            capacity_per_dir: params.max_files_per_dir,
        }
    }

    /// Full paths of every bin directory under `dest_root`
    pub fn bin_dirs(&self, dest_root: &str) -> Vec<String> {
        (1..=self.dir_count)
            .map(|i| join_path(dest_root, &bin_name(i)))
            .collect()
    }
}

/// Zero-padded directory name of bin `index` (1-based)
pub fn bin_name(index: u32) -> String {
    format!("{:02}", index)
}

/// Where one segment goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectorySlot {
    /// 1-based bin index
    pub bin: u32,
    /// 1-based position inside the bin
    pub position: u32,
}

impl DirectorySlot {
    pub fn dir_name(&self) -> String {
        bin_name(self.bin)
    }

    /// `{dest_root}/{bin}/{file_name}`
    pub fn path(&self, dest_root: &str, file_name: &str) -> String {
        join_path(&join_path(dest_root, &self.dir_name()), file_name)
    }
}

/// In-memory occupancy tracker for one job run
#[derive(Debug, Clone)]
pub struct DirectoryAllocator {
    bins: BinsConfig,
    current: u32,
    count_in_current: u32,
}

impl DirectoryAllocator {
    pub fn new(bins: BinsConfig) -> Self {
        Self {
            bins,
            current: 1,
            count_in_current: 0,
        }
    }

    /// Resume from known per-bin counts (index 0 is bin `01`).
    ///
    /// Allocation continues in the last non-empty bin; earlier bins are never
    /// revisited even if they have room, so placement stays monotonic.
    pub fn with_occupancy(bins: BinsConfig, counts: &[u32]) -> Self {
        let mut allocator = Self::new(bins);
        if let Some(last) = counts.iter().rposition(|&c| c > 0) {
            allocator.current = last as u32 + 1;
            allocator.count_in_current = counts[last];
        }
        allocator
    }

    /// Next free slot, or [`AllocationExhausted`] once every bin is full
    pub fn allocate(&mut self) -> Result<DirectorySlot, AllocationExhausted> {
        loop {
            if self.current > self.bins.dir_count {
                return Err(AllocationExhausted {
                    dir_count: self.bins.dir_count,
                    capacity_per_dir: self.bins.capacity_per_dir,
                });
            }
            if self.count_in_current < self.bins.capacity_per_dir {
                self.count_in_current += 1;
                return Ok(DirectorySlot {
                    bin: self.current,
                    position: self.count_in_current,
                });
            }
            self.current += 1;
            self.count_in_current = 0;
        }
    }

    /// Slots still available
    pub fn remaining(&self) -> u64 {
        if self.current > self.bins.dir_count {
            return 0;
        }
        let later_bins = (self.bins.dir_count - self.current) as u64;
        let in_current = self.bins.capacity_per_dir.saturating_sub(self.count_in_current) as u64;
        in_current + later_bins * self.bins.capacity_per_dir as u64
    }
}

/// Count existing files in each bin by listing the store
pub async fn load_occupancy(
    store: &dyn ObjectStore,
    dest_root: &str,
    bins: BinsConfig,
) -> Result<Vec<u32>, StorageError> {
    let mut counts = Vec::with_capacity(bins.dir_count as usize);
    for dir in bins.bin_dirs(dest_root) {
        let names = store.list(&dir).await?;
        debug!("Bin {} holds {} file(s)", dir, names.len());
        counts.push(names.len() as u32);
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_five_by_five_fills_in_order() {
        let mut allocator = DirectoryAllocator::new(BinsConfig { dir_count: 5, capacity_per_dir: 5 });
        for segment in 1..=25u32 {
            let slot = allocator.allocate().unwrap();
            assert_eq!(slot.bin, (segment - 1) / 5 + 1, "segment {}", segment);
            assert_eq!(slot.position, (segment - 1) % 5 + 1);
        }
        assert_eq!(allocator.remaining(), 0);
        let err = allocator.allocate().unwrap_err();
        assert_eq!(err, AllocationExhausted { dir_count: 5, capacity_per_dir: 5 });
        // stays exhausted
        assert!(allocator.allocate().is_err());
    }

    #[test]
    fn test_zero_capacity_fails_immediately() {
        let mut allocator = DirectoryAllocator::new(BinsConfig { dir_count: 1, capacity_per_dir: 0 });
        assert_eq!(allocator.remaining(), 0);
        assert!(allocator.allocate().is_err());
    }

    #[test]
    fn test_slot_paths() {
        let slot = DirectorySlot { bin: 2, position: 1 };
        assert_eq!(slot.path("/test/WAV", "meeting-006.wav"), "/test/WAV/02/meeting-006.wav");
        assert_eq!(slot.path("/", "a.wav"), "/02/a.wav");
        assert_eq!(
            BinsConfig { dir_count: 3, capacity_per_dir: 1 }.bin_dirs("/out"),
            vec!["/out/01", "/out/02", "/out/03"]
        );
    }

    #[test]
    fn test_resume_from_occupancy() {
        let bins = BinsConfig { dir_count: 3, capacity_per_dir: 2 };
        let mut allocator = DirectoryAllocator::with_occupancy(bins, &[2, 1, 0]);
        assert_eq!(allocator.remaining(), 3);
        assert_eq!(allocator.allocate().unwrap(), DirectorySlot { bin: 2, position: 2 });
        assert_eq!(allocator.allocate().unwrap(), DirectorySlot { bin: 3, position: 1 });

        let allocator = DirectoryAllocator::with_occupancy(bins, &[0, 0, 0]);
        assert_eq!(allocator.remaining(), 6);
    }

    #[tokio::test]
    async fn test_load_occupancy_lists_each_bin() {
        use crate::storage::LocalStore;

        let root = tempfile::tempdir().unwrap();
        for rel in ["out/01/a-001.wav", "out/01/a-002.wav", "out/02/a-003.wav", "out/09/z.wav"] {
            let path = root.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"x").unwrap();
        }
        let store = LocalStore::new(root.path());
        let bins = BinsConfig { dir_count: 3, capacity_per_dir: 2 };

        let counts = load_occupancy(&store, "/out", bins).await.unwrap();
        assert_eq!(counts, vec![2, 1, 0]);
        let mut allocator = DirectoryAllocator::with_occupancy(bins, &counts);
        assert_eq!(allocator.allocate().unwrap(), DirectorySlot { bin: 2, position: 2 });
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_placement_is_monotonic_and_unique(
            dir_count in 1u32..10,
            capacity_per_dir in 0u32..10,
        ) {
            let mut allocator = DirectoryAllocator::new(BinsConfig { dir_count, capacity_per_dir });
            let mut seen = HashSet::new();
            let mut last_bin = 0;
            let mut allocated = 0u64;
            while let Ok(slot) = allocator.allocate() {
                prop_assert!(slot.bin >= last_bin);
                prop_assert!(slot.bin <= dir_count);
                prop_assert!(seen.insert((slot.bin, slot.position)));
                last_bin = slot.bin;
                allocated += 1;
            }
            prop_assert_eq!(allocated, dir_count as u64 * capacity_per_dir as u64);
        }
    }
}
