//! Quorum arithmetic shared by vote counting and commit-index advance.

/// The minimum count which is a strict majority of `total` servers.
pub fn majority_of(total: usize) -> usize {
    (total / 2) + 1
}
