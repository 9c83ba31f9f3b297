//! Thin wrappers over the memory-policy, affinity and getcpu system calls.
//!
//! Every wrapper maps `ENOSYS` to [`NumaError::NotSupported`] and any other
//! failure to [`NumaError::Syscall`] carrying the OS error.

use crate::{bitmask::Bitmask, error::NumaError};
#[cfg(target_os = "linux")]
use std::io;

/// Memory policy modes understood by `set_mempolicy(2)` and `mbind(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MemPolicy {
    Default = 0,
    Preferred = 1,
    Bind = 2,
    Interleave = 3,
    Local = 4,
}

impl MemPolicy {
    /// Decodes a mode returned by `get_mempolicy(2)`, ignoring mode flags.
    pub fn from_raw(mode: i32) -> Option<Self> {
        match mode & !MPOL_MODE_FLAGS {
            0 => Some(Self::Default),
            1 => Some(Self::Preferred),
            2 => Some(Self::Bind),
            3 => Some(Self::Interleave),
            4 => Some(Self::Local),
            _ => None,
        }
    }
}

/// Node ids are physical and never remapped across cpuset changes.
pub const MPOL_F_STATIC_NODES: i32 = 1 << 15;
/// Node ids are relative to the current cpuset.
pub const MPOL_F_RELATIVE_NODES: i32 = 1 << 14;
pub const MPOL_MODE_FLAGS: i32 = MPOL_F_STATIC_NODES | MPOL_F_RELATIVE_NODES;

// get_mempolicy flags
pub const MPOL_F_NODE: u32 = 1 << 0;
pub const MPOL_F_ADDR: u32 = 1 << 1;
pub const MPOL_F_MEMS_ALLOWED: u32 = 1 << 2;

// mbind flags
pub const MPOL_MF_STRICT: u32 = 1 << 0;
pub const MPOL_MF_MOVE: u32 = 1 << 1;
pub const MPOL_MF_MOVE_ALL: u32 = 1 << 2;

#[cfg(target_os = "linux")]
fn check(syscall: &'static str, result: libc::c_long) -> Result<libc::c_long, NumaError> {
    if result < 0 {
        let source = io::Error::last_os_error();
        if source.raw_os_error() == Some(libc::ENOSYS) {
            return Err(NumaError::NotSupported);
        }
        return Err(NumaError::Syscall { syscall, source });
    }
    Ok(result)
}

/// Kernel nodemask arguments count one bit more than they read.
#[cfg(target_os = "linux")]
fn nodemask_arg(mask: Option<&Bitmask>) -> (*const u64, libc::c_ulong) {
    match mask {
        Some(mask) if !mask.is_empty() => {
            (mask.words().as_ptr(), mask.len() as libc::c_ulong + 1)
        }
        _ => (std::ptr::null(), 0),
    }
}

/// Returns the memory policy mode of the calling thread, or of `addr` when
/// [`MPOL_F_ADDR`] is given. The node set is written into `nodemask` if present.
#[cfg(target_os = "linux")]
pub fn get_mempolicy(
    nodemask: Option<&mut Bitmask>,
    addr: usize,
    flags: u32,
) -> Result<i32, NumaError> {
    let mut mode: libc::c_int = 0;
    let (mask, maxnode) = match nodemask {
        Some(mask) if !mask.is_empty() => {
            let maxnode = mask.len() as libc::c_ulong + 1;
            (mask.words_mut().as_mut_ptr(), maxnode)
        }
        _ => (std::ptr::null_mut(), 0),
    };
    // safety: mode and mask are valid for writes; maxnode never exceeds the mask capacity
    let result = unsafe {
        libc::syscall(
            libc::SYS_get_mempolicy,
            &mut mode as *mut libc::c_int,
            mask,
            maxnode,
            addr,
            flags as libc::c_ulong,
        )
    };
    check("get_mempolicy", result)?;
    Ok(mode)
}

#[cfg(not(target_os = "linux"))]
pub fn get_mempolicy(
    _nodemask: Option<&mut Bitmask>,
    _addr: usize,
    _flags: u32,
) -> Result<i32, NumaError> {
    Err(NumaError::NotSupported)
}

/// Sets the memory policy of the calling thread. `mode_flags` may hold
/// [`MPOL_F_STATIC_NODES`] or [`MPOL_F_RELATIVE_NODES`].
#[cfg(target_os = "linux")]
pub fn set_mempolicy(
    mode: MemPolicy,
    mode_flags: i32,
    nodemask: Option<&Bitmask>,
) -> Result<(), NumaError> {
    let (mask, maxnode) = nodemask_arg(nodemask);
    // safety: mask is valid for reads of maxnode - 1 bits or null
    let result = unsafe {
        libc::syscall(
            libc::SYS_set_mempolicy,
            (mode as libc::c_int) | (mode_flags & MPOL_MODE_FLAGS),
            mask,
            maxnode,
        )
    };
    check("set_mempolicy", result).map(|_| ())
}

#[cfg(not(target_os = "linux"))]
pub fn set_mempolicy(
    _mode: MemPolicy,
    _mode_flags: i32,
    _nodemask: Option<&Bitmask>,
) -> Result<(), NumaError> {
    Err(NumaError::NotSupported)
}

/// Sets the memory policy for `[addr, addr + len)`.
#[cfg(target_os = "linux")]
pub fn mbind(
    addr: usize,
    len: usize,
    mode: MemPolicy,
    flags: u32,
    nodemask: Option<&Bitmask>,
) -> Result<(), NumaError> {
    let (mask, maxnode) = nodemask_arg(nodemask);
    // safety: the kernel validates the address range; mask is valid for reads or null
    let result = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr,
            len,
            mode as libc::c_int,
            mask,
            maxnode,
            flags as libc::c_uint,
        )
    };
    check("mbind", result).map(|_| ())
}

#[cfg(not(target_os = "linux"))]
pub fn mbind(
    _addr: usize,
    _len: usize,
    _mode: MemPolicy,
    _flags: u32,
    _nodemask: Option<&Bitmask>,
) -> Result<(), NumaError> {
    Err(NumaError::NotSupported)
}

/// Writes the affinity of `pid` (0 for the calling thread) into `cpumask`.
///
/// Returns the number of bytes the kernel copied, i.e. the size of its own CPU mask.
#[cfg(target_os = "linux")]
pub fn sched_getaffinity(pid: i32, cpumask: &mut Bitmask) -> Result<usize, NumaError> {
    let size = cpumask.len() / 8;
    // safety: the kernel writes at most `size` bytes into the mask words
    let result = unsafe {
        libc::syscall(
            libc::SYS_sched_getaffinity,
            pid as libc::pid_t,
            size,
            cpumask.words_mut().as_mut_ptr(),
        )
    };
    check("sched_getaffinity", result).map(|copied| copied as usize)
}

#[cfg(not(target_os = "linux"))]
pub fn sched_getaffinity(_pid: i32, _cpumask: &mut Bitmask) -> Result<usize, NumaError> {
    Err(NumaError::NotSupported)
}

/// Restricts `pid` (0 for the calling thread) to the CPUs set in `cpumask`.
#[cfg(target_os = "linux")]
pub fn sched_setaffinity(pid: i32, cpumask: &Bitmask) -> Result<(), NumaError> {
    // safety: the kernel reads at most `len / 8` bytes from the mask words
    let result = unsafe {
        libc::syscall(
            libc::SYS_sched_setaffinity,
            pid as libc::pid_t,
            cpumask.len() / 8,
            cpumask.words().as_ptr(),
        )
    };
    check("sched_setaffinity", result).map(|_| ())
}

#[cfg(not(target_os = "linux"))]
pub fn sched_setaffinity(_pid: i32, _cpumask: &Bitmask) -> Result<(), NumaError> {
    Err(NumaError::NotSupported)
}

/// Traps into the kernel to ask which CPU and node the caller runs on.
#[cfg(target_os = "linux")]
pub fn getcpu() -> Result<(u32, u32), NumaError> {
    let mut cpu: libc::c_uint = 0;
    let mut node: libc::c_uint = 0;
    // safety: cpu and node are valid for writes; the cache argument is unused by the kernel
    let result = unsafe {
        libc::syscall(
            libc::SYS_getcpu,
            &mut cpu as *mut libc::c_uint,
            &mut node as *mut libc::c_uint,
            std::ptr::null_mut::<libc::c_void>(),
        )
    };
    check("getcpu", result)?;
    Ok((cpu, node))
}

#[cfg(not(target_os = "linux"))]
pub fn getcpu() -> Result<(u32, u32), NumaError> {
    Err(NumaError::NotSupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_policy_from_raw() {
        assert_eq!(MemPolicy::from_raw(0), Some(MemPolicy::Default));
        assert_eq!(MemPolicy::from_raw(2), Some(MemPolicy::Bind));
        assert_eq!(
            MemPolicy::from_raw(3 | MPOL_F_STATIC_NODES),
            Some(MemPolicy::Interleave)
        );
        assert_eq!(MemPolicy::from_raw(4), Some(MemPolicy::Local));
        assert_eq!(MemPolicy::from_raw(5), None);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_sched_getaffinity_reports_kernel_mask_size() {
        let mut mask = Bitmask::new(8192);
        let copied = sched_getaffinity(0, &mut mask).unwrap();
        assert!(copied > 0);
        assert_eq!(copied % 8, 0);
        assert!(mask.count() > 0, "calling thread must be allowed on some CPU");
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_sched_getaffinity_too_small() {
        // a zero-sized mask is always smaller than the kernel's
        let mut mask = Bitmask::new(0);
        let err = sched_getaffinity(0, &mut mask).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_getcpu_within_affinity() {
        let mut mask = Bitmask::new(8192);
        sched_getaffinity(0, &mut mask).unwrap();
        let (cpu, _node) = getcpu().unwrap();
        assert!(mask.get(cpu as usize), "running on CPU {cpu} outside affinity");
    }

    #[test]
    #[cfg(not(target_os = "linux"))]
    fn test_not_supported_on_non_linux() {
        use assert_matches::assert_matches;

        let mut mask = Bitmask::new(64);
        assert_matches!(
            sched_getaffinity(0, &mut mask),
            Err(NumaError::NotSupported)
        );
        assert_matches!(sched_setaffinity(0, &mask), Err(NumaError::NotSupported));
        assert_matches!(get_mempolicy(None, 0, 0), Err(NumaError::NotSupported));
        assert_matches!(
            set_mempolicy(MemPolicy::Default, 0, None),
            Err(NumaError::NotSupported)
        );
        assert_matches!(getcpu(), Err(NumaError::NotSupported));
    }
}
