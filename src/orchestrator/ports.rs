//! Port slot allocation.
//!
//! Each live worker session owns one integer slot in `0..max_workers`; host
//! ports are derived by adding the slot to the configured port bases. The
//! allocator is pure bookkeeping — the caller records the chosen slot
//! atomically with session creation (the lifecycle manager holds its
//! provisioning lock across allocate + insert).

use crate::error::ProvisionError;

/// Find the first slot in `0..max_workers` not present in `held`.
///
/// `held` is the set of slots owned by currently live sessions. Returns
/// `CapacityExceeded` when every slot is taken.
pub fn next_free_slot(
    held: impl IntoIterator<Item = usize>,
    max_workers: usize,
) -> Result<usize, ProvisionError> {
    let used: std::collections::HashSet<usize> = held.into_iter().collect();

    (0..max_workers)
        .find(|slot| !used.contains(slot))
        .ok_or(ProvisionError::CapacityExceeded { max: max_workers })
}
