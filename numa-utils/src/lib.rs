#![cfg_attr(
    not(feature = "agave-unstable-api"),
    deprecated(
        since = "3.1.0",
        note = "This crate has been marked for formal inclusion in the Agave Unstable API. From \
                v4.0.0 onward, the `agave-unstable-api` crate feature must be specified to \
                acknowledge use of an interface that may break without warning."
    )
)]
// Activate some of the Rust 2024 lints to make the future migration easier.
#![warn(if_let_rescope)]
#![warn(keyword_idents_2024)]
#![warn(missing_unsafe_on_extern)]
#![warn(rust_2024_guarded_string_incompatible_syntax)]
#![warn(rust_2024_incompatible_pat)]
#![warn(tail_expr_drop_order)]
#![warn(unsafe_attr_outside_unsafe)]
#![warn(unsafe_op_in_unsafe_fn)]

//! NUMA topology, placement and memory-policy utilities for Linux.
//!
//! [`Numa::new`] discovers the node/CPU topology once at startup and resolves the
//! kernel's vDSO so that [`Numa::current_cpu_and_node`] can avoid a system call on
//! every query. The returned value is immutable and meant to be shared.
//!
//! # Platform Support
//!
//! Linux only. On other platforms discovery degrades to a single node and every
//! system call returns [`NumaError::NotSupported`].
//!
//! # Examples
//!
//! ```no_run
//! use agave_numa_utils::*;
//!
//! # fn main() -> Result<(), NumaError> {
//! let numa = Numa::new(&NumaConfig::default())?;
//!
//! // Keep this thread and its allocations on the node it is running on
//! let (_cpu, node) = numa.current_cpu_and_node()?;
//! let mut nodes = Bitmask::new(numa.node_possible_count());
//! nodes.set(node, true);
//! numa.bind(&nodes)?;
//!
//! // Undo the CPU restriction
//! numa.run_on_node(ALL_NODES)?;
//! # Ok(())
//! # }
//! ```

mod bitmask;
mod config;
mod error;
mod getcpu;
mod numa;
pub mod syscall;
mod topology;
pub mod vdso;

pub use {
    bitmask::Bitmask,
    config::{FastPathMode, NumaConfig},
    error::NumaError,
    getcpu::{cpu_has_rdtscp, CpuNodeSelector, CpuNodeSource, SyscallGetcpu, VdsoGetcpu},
    numa::{Numa, ALL_NODES},
    syscall::{
        MemPolicy, MPOL_F_ADDR, MPOL_F_MEMS_ALLOWED, MPOL_F_NODE, MPOL_F_RELATIVE_NODES,
        MPOL_F_STATIC_NODES, MPOL_MF_MOVE, MPOL_MF_MOVE_ALL, MPOL_MF_STRICT,
    },
    topology::{numa_available, Topology},
};
