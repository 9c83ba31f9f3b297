//! The NUMA façade: topology queries, placement and memory policy.

use {
    crate::{
        bitmask::Bitmask,
        config::NumaConfig,
        error::NumaError,
        getcpu::CpuNodeSelector,
        syscall::{self, MemPolicy, MPOL_F_MEMS_ALLOWED},
        topology::Topology,
        vdso::Vdso,
    },
    log::debug,
};

/// Node id accepted by [`Numa::run_on_node`] to mean every node.
pub const ALL_NODES: isize = -1;

/// Process-wide NUMA state, discovered once and immutable afterwards.
///
/// Build it at startup with [`Numa::new`] and share it by reference or `Arc`.
#[derive(Debug)]
pub struct Numa {
    topology: Topology,
    vdso: Vdso,
    selector: CpuNodeSelector,
}

impl Numa {
    /// Discovers the topology and resolves the vDSO of the running process.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::Io`] if the auxiliary vector cannot be read. Every other
    /// discovery failure degrades to a conservative default instead.
    pub fn new(config: &NumaConfig) -> Result<Self, NumaError> {
        let topology = Topology::discover(config);
        let vdso = Vdso::from_auxv(config)?;
        debug!("vDSO image valid: {}", vdso.is_valid());
        let selector = CpuNodeSelector::new(&vdso, config.fast_path);
        Ok(Self::from_parts(topology, vdso, selector))
    }

    pub(crate) fn from_parts(topology: Topology, vdso: Vdso, selector: CpuNodeSelector) -> Self {
        Self {
            topology,
            vdso,
            selector,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn is_available(&self) -> bool {
        self.topology.is_available()
    }

    pub fn node_count(&self) -> usize {
        self.topology.node_count()
    }

    pub fn node_possible_count(&self) -> usize {
        self.topology.node_possible_count()
    }

    pub fn max_node_id(&self) -> usize {
        self.topology.max_node_id()
    }

    pub fn max_possible_node_id(&self) -> usize {
        self.topology.max_possible_node_id()
    }

    pub fn cpu_count(&self) -> usize {
        self.topology.cpu_count()
    }

    pub fn cpu_possible_count(&self) -> usize {
        self.topology.cpu_possible_count()
    }

    pub fn node_mask(&self) -> Bitmask {
        self.topology.node_mask()
    }

    pub fn node_to_cpu_mask(&self, node: usize) -> Result<Bitmask, NumaError> {
        self.topology.node_to_cpu_mask(node)
    }

    pub fn cpu_to_node(&self, cpu: usize) -> Result<usize, NumaError> {
        self.topology.cpu_to_node(cpu)
    }

    pub fn node_mem_size(&self, node: usize) -> Result<(u64, u64), NumaError> {
        self.topology.node_mem_size(node)
    }

    /// The CPU and node the calling thread is running on.
    ///
    /// Safe to call concurrently from any number of threads.
    pub fn current_cpu_and_node(&self) -> Result<(usize, usize), NumaError> {
        self.selector.cpu_and_node()
    }

    /// Forces the current CPU/node query onto the vDSO routine or the system call.
    /// Meant for tests and benchmarks.
    pub fn set_fast_path(&self, enabled: bool) {
        self.selector.set_fast_path(enabled);
    }

    pub fn fast_path(&self) -> bool {
        self.selector.fast_path()
    }

    /// Runtime address of the vDSO export `name`, or `None` if it is absent.
    pub fn resolve_symbol(&self, name: &str) -> Option<usize> {
        self.vdso.resolve(name)
    }

    /// Restricts the calling thread to the CPUs of `node`, or to every possible
    /// CPU when `node` is [`ALL_NODES`].
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::NodeOutOfRange`] for ids below [`ALL_NODES`] or above
    /// the max possible node id, and [`NumaError::NodeNotFound`] for undiscovered
    /// nodes. Neither issues a system call.
    pub fn run_on_node(&self, node: isize) -> Result<(), NumaError> {
        let cpus = match node {
            ALL_NODES => {
                let mut cpus = Bitmask::new(self.cpu_possible_count());
                cpus.fill();
                cpus
            }
            node if node < ALL_NODES => {
                return Err(NumaError::NodeOutOfRange {
                    node,
                    max: self.max_possible_node_id(),
                })
            }
            node => self.topology.node_cpus_ref(node as usize)?.clone(),
        };
        syscall::sched_setaffinity(0, &cpus)
    }

    /// Rejects a node set naming any node above the max possible node id.
    fn check_node_range(&self, nodes: &Bitmask) -> Result<(), NumaError> {
        let max = self.max_possible_node_id();
        match nodes.iter_ones().find(|&node| node > max) {
            Some(node) => Err(NumaError::NodeOutOfRange {
                node: node as isize,
                max,
            }),
            None => Ok(()),
        }
    }

    /// Union of the CPU sets of the nodes in `nodes` that have memory.
    pub(crate) fn cpus_of_nodes(&self, nodes: &Bitmask) -> Result<Bitmask, NumaError> {
        self.check_node_range(nodes)?;
        let mem_nodes = self.topology.node_mask();
        let mut cpus = Bitmask::new(self.cpu_possible_count());
        for node in nodes.iter_ones().filter(|&node| mem_nodes.get(node)) {
            cpus.union_with(self.topology.node_cpus_ref(node)?);
        }
        Ok(cpus)
    }

    /// Restricts the calling thread to the CPUs of every node in `nodes`.
    /// Nodes without memory are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::NodeOutOfRange`] without a system call if `nodes`
    /// names a node above the max possible node id.
    pub fn run_on_node_mask(&self, nodes: &Bitmask) -> Result<(), NumaError> {
        let cpus = self.cpus_of_nodes(nodes)?;
        syscall::sched_setaffinity(0, &cpus)
    }

    /// Runs the calling thread on `nodes` and allocates its memory only from them.
    pub fn bind(&self, nodes: &Bitmask) -> Result<(), NumaError> {
        self.run_on_node_mask(nodes)?;
        syscall::set_mempolicy(MemPolicy::Bind, 0, Some(nodes))
    }

    /// The CPUs the calling thread may run on, sized to the possible CPU count.
    pub fn running_cpu_mask(&self) -> Result<Bitmask, NumaError> {
        let mut cpus = Bitmask::new(self.cpu_possible_count());
        syscall::sched_getaffinity(0, &mut cpus)?;
        Ok(cpus)
    }

    /// The nodes owning any CPU the calling thread may run on.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::CpuNotFound`] if an allowed CPU belongs to no known node.
    pub fn running_nodes_mask(&self) -> Result<Bitmask, NumaError> {
        let mut nodes = Bitmask::new(self.node_possible_count());
        for cpu in self.running_cpu_mask()?.iter_ones() {
            nodes.set(self.cpu_to_node(cpu)?, true);
        }
        Ok(nodes)
    }

    /// The nodes the calling thread may allocate memory from.
    pub fn mem_allowed_node_mask(&self) -> Result<Bitmask, NumaError> {
        let mut nodes = Bitmask::new(self.node_possible_count());
        syscall::get_mempolicy(Some(&mut nodes), 0, MPOL_F_MEMS_ALLOWED)?;
        Ok(nodes)
    }

    /// Memory policy of the calling thread and the nodes it applies to.
    pub fn mem_policy(&self) -> Result<(MemPolicy, Bitmask), NumaError> {
        let mut nodes = Bitmask::new(self.node_possible_count());
        let mode = syscall::get_mempolicy(Some(&mut nodes), 0, 0)?;
        let policy = MemPolicy::from_raw(mode)
            .ok_or_else(|| NumaError::ParseError(format!("memory policy mode {mode}")))?;
        Ok((policy, nodes))
    }

    /// Sets the memory policy of the calling thread. `nodes` is ignored by the
    /// kernel for [`MemPolicy::Default`] and [`MemPolicy::Local`].
    pub fn set_mem_policy(
        &self,
        policy: MemPolicy,
        nodes: Option<&Bitmask>,
    ) -> Result<(), NumaError> {
        if let Some(nodes) = nodes {
            self.check_node_range(nodes)?;
        }
        syscall::set_mempolicy(policy, 0, nodes)
    }

    /// Sets the memory policy of `[addr, addr + len)`. `addr` must be page aligned.
    pub fn mbind(
        &self,
        addr: usize,
        len: usize,
        policy: MemPolicy,
        flags: u32,
        nodes: Option<&Bitmask>,
    ) -> Result<(), NumaError> {
        if let Some(nodes) = nodes {
            self.check_node_range(nodes)?;
        }
        syscall::mbind(addr, len, policy, flags, nodes)
    }
}
