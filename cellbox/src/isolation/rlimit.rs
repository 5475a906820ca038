//! Resource limit handling for host processes.
//!
//! Only async-signal-safe code lives here: `apply_memory_limit_raw()` is
//! called from the `pre_exec` hook, after `fork()` and before `exec()`.

/// Resource type alias for cross-platform compatibility.
/// On Linux glibc, RLIMIT_* are u32; on macOS they're i32.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type RlimitResource = libc::c_int;

/// Cap the address space of the current process.
///
/// The limit never rises above the inherited hard limit, so an unprivileged
/// process can always apply it.
///
/// # Safety
///
/// Only uses async-signal-safe syscalls (getrlimit, setrlimit).
/// Do NOT add logging, allocation, or locking.
///
/// # Returns
/// * `Ok(())` - Limit applied
/// * `Err(errno)` - Failed to read or set the limit
pub(super) fn apply_memory_limit_raw(max_bytes: u64) -> Result<(), i32> {
    set_rlimit_capped_raw(libc::RLIMIT_AS as RlimitResource, max_bytes)
}

#[allow(clippy::unnecessary_cast)]
fn set_rlimit_capped_raw(resource: RlimitResource, limit: u64) -> Result<(), i32> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
        return Err(errno());
    }

    let wanted = limit as libc::rlim_t;
    let capped = if current.rlim_max == libc::RLIM_INFINITY {
        wanted
    } else {
        wanted.min(current.rlim_max)
    };

    let rlim = libc::rlimit {
        rlim_cur: capped,
        rlim_max: current.rlim_max,
    };
    if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
        return Err(errno());
    }

    Ok(())
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL)
}
