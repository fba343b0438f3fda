//! Concurrency cap for background processes.
//!
//! A burst of sends (one per attachment, or one per group while loading
//! contacts) must not exhaust the process table or the descriptor table.
//! The cap is computed once at startup from the soft resource limits.

use nix::sys::resource::{Resource, getrlimit};

/// Cap used when the limits cannot be queried.
pub const DEFAULT_MAX_CONCURRENT: usize = 64;

/// stdin, stdout and stderr of each child.
const FDS_PER_PROCESS: usize = 3;

/// Assumed descriptor count when `/proc/self/fd` is unavailable.
const FALLBACK_OPEN_FDS: usize = 32;

/// The daemon opens more descriptors after it starts; reserve room for them.
const OPEN_FDS_HEADROOM: usize = 3;

/// Maximum number of background processes to run at once.
pub fn max_concurrent_processes() -> usize {
    match query_limits() {
        Ok(cap) => cap,
        Err(e) => {
            tracing::warn!(
                error = %e,
                default = DEFAULT_MAX_CONCURRENT,
                "failed to query resource limits; using default process cap"
            );
            DEFAULT_MAX_CONCURRENT
        }
    }
}

fn query_limits() -> nix::Result<usize> {
    let (nproc_soft, _) = getrlimit(Resource::RLIMIT_NPROC)?;
    let nofile = getrlimit(Resource::RLIMIT_NOFILE).ok().map(|(soft, _)| soft);
    let open_fds = count_open_fds().unwrap_or(FALLBACK_OPEN_FDS) * OPEN_FDS_HEADROOM;
    Ok(compute_cap(
        DEFAULT_MAX_CONCURRENT,
        to_usize(nproc_soft),
        nofile.map(to_usize),
        open_fds,
    ))
}

/// `min(default, nproc, (fd_limit - open_fds) / FDS_PER_PROCESS)`, never
/// below one so the queue can always make progress.
pub fn compute_cap(
    default: usize,
    nproc_limit: usize,
    fd_limit: Option<usize>,
    open_fds: usize,
) -> usize {
    let nprocs = default.min(nproc_limit);
    let mut fd_budget = nprocs
        .saturating_mul(FDS_PER_PROCESS)
        .saturating_add(open_fds);
    if let Some(limit) = fd_limit {
        fd_budget = fd_budget.min(limit);
    }
    (fd_budget.saturating_sub(open_fds) / FDS_PER_PROCESS).max(1)
}

fn count_open_fds() -> Option<usize> {
    std::fs::read_dir("/proc/self/fd")
        .ok()
        .map(|entries| entries.count())
}

fn to_usize(limit: u64) -> usize {
    usize::try_from(limit).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_wins_with_generous_limits() {
        assert_eq!(compute_cap(64, 100_000, Some(1_048_576), 96), 64);
    }

    #[test]
    fn nproc_limit_caps() {
        assert_eq!(compute_cap(64, 10, Some(1_048_576), 96), 10);
    }

    #[test]
    fn descriptor_limit_caps() {
        // (256 - 96) / 3 = 53
        assert_eq!(compute_cap(64, 100_000, Some(256), 96), 53);
    }

    #[test]
    fn exhausted_descriptors_still_allow_one() {
        assert_eq!(compute_cap(64, 100_000, Some(64), 96), 1);
    }

    #[test]
    fn unlimited_values_do_not_overflow() {
        assert_eq!(compute_cap(64, usize::MAX, Some(usize::MAX), 96), 64);
    }

    #[test]
    fn live_query_is_positive() {
        assert!(max_concurrent_processes() >= 1);
    }
}
