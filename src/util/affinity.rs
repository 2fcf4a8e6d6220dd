//! CPU affinity utilities.

use anyhow::{Context, Result};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

/// Pin the calling thread to a single CPU.
///
/// # Arguments
///
/// * `cpu` - The CPU to pin to.
///
/// # Returns
///
/// Ok on success; an error if the CPU is out of range or the affinity call
/// is rejected by the kernel.
pub fn pin_to_cpu(cpu: u32) -> Result<()> {
    let mut set = CpuSet::new();
    set.set(cpu as usize)
        .with_context(|| format!("cpu {cpu} out of range for affinity mask"))?;
    sched_setaffinity(Pid::from_raw(0), &set)
        .with_context(|| format!("failed to pin thread to cpu {cpu}"))?;
    Ok(())
}

/// Get the CPU the calling thread is currently running on.
///
/// # Returns
///
/// The CPU id, or None if the information is not available.
pub fn current_cpu() -> Option<u32> {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu >= 0 {
        Some(cpu as u32)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_and_query() {
        // Pinning can fail in restricted sandboxes; only assert consistency
        // when it succeeds.
        if pin_to_cpu(0).is_ok() {
            assert_eq!(current_cpu(), Some(0));
        }
    }
}
