//! Derives batch/cache sizing from available memory and worker count when
//! the caller does not supply explicit `RestoreSettings` (spec §4.9).

use common::RestoreSettings;
use sysinfo::System;

const FALLBACK_AVAILABLE_BYTES: u64 = 4 * 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;
const KIB: u64 = 1024;
const MAX_BATCH_BYTES: u64 = 256 * MIB;
const MAX_CACHE_KB: u64 = 65_536;
const LOW_MEMORY_THRESHOLD_BYTES: u64 = 512 * MIB;

/// Queries OS-available memory, falling back to 4 GiB if the query fails
/// or reports zero (containers/odd environments sometimes do).
pub fn available_memory_bytes() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    let available = system.available_memory();
    if available == 0 {
        FALLBACK_AVAILABLE_BYTES
    } else {
        available
    }
}

/// `usable = 0.75*A`, `per_worker = usable/max(1,J)`,
/// `batchSize = clamp(min(per_worker/4, 256MiB)/1KiB, 100, 4000)`,
/// `cacheSizeKB = min(65536, per_worker/4/1KiB)`,
/// `maxRowsPerCommit = 5000 if per_worker < 512MiB else 10000`.
pub fn derive_settings(available_bytes: u64, jobs: u32) -> RestoreSettings {
    let usable = (available_bytes as f64 * 0.75) as u64;
    let workers = jobs.max(1) as u64;
    let per_worker = usable / workers;

    let batch_quota = (per_worker / 4).min(MAX_BATCH_BYTES);
    let batch_size = RestoreSettings::clamp_batch_size((batch_quota / KIB) as usize);

    let cache_size_kb = ((per_worker / 4) / KIB).min(MAX_CACHE_KB);

    let max_rows_per_commit = if per_worker < LOW_MEMORY_THRESHOLD_BYTES { 5000 } else { 10000 };

    RestoreSettings {
        batch_size,
        cache_size_kb,
        max_rows_per_commit,
        memory_limit_bytes: Some(per_worker),
    }
}

/// Convenience wrapper over [`available_memory_bytes`] + [`derive_settings`]
/// for callers that didn't supply their own `RestoreSettings`.
pub fn auto_detect_settings(jobs: u32) -> RestoreSettings {
    derive_settings(available_memory_bytes(), jobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_worker_with_four_gib_available() {
        let settings = derive_settings(4 * 1024 * MIB, 1);
        // usable = 3072 MiB, per_worker = 3072 MiB, per_worker/4 = 768 MiB > 256 MiB cap.
        assert_eq!(settings.batch_size, 4000);
        assert_eq!(settings.cache_size_kb, 65_536);
        assert_eq!(settings.max_rows_per_commit, 10_000);
    }

    #[test]
    fn low_memory_per_worker_drops_max_rows_per_commit() {
        // 512 MiB available total, 1 worker -> usable 384 MiB, well under threshold.
        let settings = derive_settings(512 * MIB, 1);
        assert_eq!(settings.max_rows_per_commit, 5000);
    }

    #[test]
    fn batch_size_never_drops_below_spec_floor() {
        let settings = derive_settings(16 * MIB, 8);
        assert!(settings.batch_size >= 100);
    }

    #[test]
    fn more_workers_shrinks_per_worker_share() {
        let one = derive_settings(16 * 1024 * MIB, 1);
        let many = derive_settings(16 * 1024 * MIB, 16);
        assert!(many.memory_limit_bytes.unwrap() < one.memory_limit_bytes.unwrap());
    }
}
