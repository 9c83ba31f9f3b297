//! Error types for NUMA operations.

use {std::io, thiserror::Error};

/// Errors that can occur during NUMA topology, policy and affinity operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum NumaError {
    /// The platform lacks NUMA support, or the kernel reported `ENOSYS`
    #[error("NUMA operations are not supported on this platform")]
    NotSupported,

    /// Node id outside of the range the platform can address
    #[error("Node {node} is out of range (max possible node is {max})")]
    NodeOutOfRange { node: isize, max: usize },

    /// CPU id outside of the range the platform can address
    #[error("CPU {cpu} is out of range (max possible CPU is {max})")]
    CpuOutOfRange { cpu: usize, max: usize },

    /// Node id is addressable but was not discovered
    #[error("Node {0} not found")]
    NodeNotFound(usize),

    /// CPU id is addressable but is not attached to any discovered node
    #[error("CPU {0} not found")]
    CpuNotFound(usize),

    /// A system call failed with the given OS error
    #[error("{syscall} failed: {source}")]
    Syscall {
        syscall: &'static str,
        #[source]
        source: io::Error,
    },

    /// I/O error while reading pseudo-filesystem or auxiliary vector data
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse pseudo-filesystem text
    #[error("Failed to parse {0}")]
    ParseError(String),
}

impl NumaError {
    /// Raw OS error code of a failed system call, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            NumaError::Syscall { source, .. } | NumaError::Io(source) => source.raw_os_error(),
            _ => None,
        }
    }
}
