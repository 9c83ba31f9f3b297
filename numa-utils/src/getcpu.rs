//! Strategies for answering "which CPU and node is this thread running on".

use {
    crate::{
        config::FastPathMode,
        error::NumaError,
        syscall,
        vdso::{Vdso, GETCPU_SYMBOL},
    },
    log::info,
    std::{
        ffi::{c_long, c_uint, c_void},
        io,
        sync::atomic::{AtomicBool, Ordering},
    },
};
#[cfg(target_arch = "x86_64")]
use raw_cpuid::CpuId;

/// A way of querying the current CPU and node.
pub trait CpuNodeSource: Send + Sync {
    /// Returns `(cpu, node)` of the calling thread.
    fn cpu_and_node(&self) -> Result<(usize, usize), NumaError>;
}

/// The `getcpu(2)` system call. Always available on Linux.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyscallGetcpu;

impl CpuNodeSource for SyscallGetcpu {
    fn cpu_and_node(&self) -> Result<(usize, usize), NumaError> {
        let (cpu, node) = syscall::getcpu()?;
        Ok((cpu as usize, node as usize))
    }
}

type GetcpuFn = unsafe extern "C" fn(*mut c_uint, *mut c_uint, *mut c_void) -> c_long;

/// The vDSO `getcpu` routine, called directly by address.
#[derive(Clone, Copy)]
pub struct VdsoGetcpu {
    function: GetcpuFn,
}

impl std::fmt::Debug for VdsoGetcpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VdsoGetcpu")
            .field("address", &(self.function as usize as *const c_void))
            .finish()
    }
}

impl VdsoGetcpu {
    /// # Safety
    ///
    /// `address` must be the entry point of a function with the vDSO `getcpu`
    /// signature that stays mapped for the rest of the process's lifetime.
    pub unsafe fn from_address(address: usize) -> Self {
        // safety: guaranteed by the caller
        let function = unsafe { std::mem::transmute::<usize, GetcpuFn>(address) };
        Self { function }
    }
}

impl CpuNodeSource for VdsoGetcpu {
    fn cpu_and_node(&self) -> Result<(usize, usize), NumaError> {
        let mut cpu: c_uint = 0;
        let mut node: c_uint = 0;
        // safety: cpu and node are valid for writes; the cache argument may be null
        let result = unsafe { (self.function)(&mut cpu, &mut node, std::ptr::null_mut()) };
        if result < 0 {
            return Err(NumaError::Syscall {
                syscall: GETCPU_SYMBOL,
                source: io::Error::from_raw_os_error(result.unsigned_abs() as i32),
            });
        }
        Ok((cpu as usize, node as usize))
    }
}

/// Whether the CPU implements `RDTSCP`, which the vDSO `getcpu` relies on.
#[cfg(target_arch = "x86_64")]
pub fn cpu_has_rdtscp() -> bool {
    CpuId::new()
        .get_extended_processor_and_feature_identifiers()
        .is_some_and(|features| features.has_rdtscp())
}

#[cfg(not(target_arch = "x86_64"))]
pub fn cpu_has_rdtscp() -> bool {
    false
}

/// Chooses between the vDSO routine and the system call.
///
/// The fast-path switch is read with relaxed ordering on every call. Flipping it
/// while other threads query is harmless, since both strategies report the same
/// answer; it exists for tests and benchmarks.
pub struct CpuNodeSelector {
    accelerated: Option<Box<dyn CpuNodeSource>>,
    fallback: Box<dyn CpuNodeSource>,
    fast_path: AtomicBool,
}

impl CpuNodeSelector {
    pub fn new(vdso: &Vdso, mode: FastPathMode) -> Self {
        let accelerated = vdso.resolve(GETCPU_SYMBOL).map(|address| {
            // safety: the address was resolved from this process's own vDSO,
            // which stays mapped until exit
            Box::new(unsafe { VdsoGetcpu::from_address(address) }) as Box<dyn CpuNodeSource>
        });
        let fast_path = mode == FastPathMode::Auto && cpu_has_rdtscp();
        match (fast_path, accelerated.is_some()) {
            (true, true) => info!("current cpu/node is read through {GETCPU_SYMBOL}"),
            (true, false) => {
                info!("{GETCPU_SYMBOL} is unavailable, current cpu/node uses getcpu(2)")
            }
            (false, _) => info!("fast path disabled, current cpu/node uses getcpu(2)"),
        }
        Self::with_sources(accelerated, Box::new(SyscallGetcpu), fast_path)
    }

    pub(crate) fn with_sources(
        accelerated: Option<Box<dyn CpuNodeSource>>,
        fallback: Box<dyn CpuNodeSource>,
        fast_path: bool,
    ) -> Self {
        Self {
            accelerated,
            fallback,
            fast_path: AtomicBool::new(fast_path),
        }
    }

    pub fn set_fast_path(&self, enabled: bool) {
        self.fast_path.store(enabled, Ordering::Relaxed);
    }

    pub fn fast_path(&self) -> bool {
        self.fast_path.load(Ordering::Relaxed)
    }

    /// Whether the vDSO routine was resolved.
    pub fn has_accelerated(&self) -> bool {
        self.accelerated.is_some()
    }

    pub fn cpu_and_node(&self) -> Result<(usize, usize), NumaError> {
        match &self.accelerated {
            Some(accelerated) if self.fast_path() => accelerated.cpu_and_node(),
            _ => self.fallback.cpu_and_node(),
        }
    }
}

impl std::fmt::Debug for CpuNodeSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuNodeSelector")
            .field("accelerated", &self.has_accelerated())
            .field("fast_path", &self.fast_path())
            .finish()
    }
}
