//! One-time discovery of the node/CPU topology.
//!
//! Every discovery step degrades to a conservative default instead of failing, so
//! [`Topology::discover`] always produces a usable snapshot. On machines without
//! NUMA support the snapshot is a single node owning every configured CPU.

use {
    crate::{
        bitmask::Bitmask,
        config::NumaConfig,
        error::NumaError,
        syscall::{get_mempolicy, sched_getaffinity},
    },
    log::{debug, info, warn},
    std::{
        collections::{BTreeMap, HashMap},
        fs, io,
        path::{Path, PathBuf},
    },
};

/// Upper bound for the nodemask doubling probe, in bits.
const MAX_NODEMASK_PROBE_BITS: usize = 4096 * 8;
const INITIAL_NODEMASK_PROBE_BITS: usize = 16;
const INITIAL_CPUMASK_PROBE_BITS: usize = 4096;
/// Possible CPU count assumed when the affinity probe fails for a reason other than size.
const DEFAULT_POSSIBLE_CPUS: usize = 128;

/// Immutable snapshot of the machine's NUMA topology.
#[derive(Debug, Clone)]
pub struct Topology {
    available: bool,
    node_possible: usize,
    node_configured: usize,
    cpu_possible: usize,
    cpu_configured: usize,
    /// Nodes with memory
    mem_nodes: Bitmask,
    node_cpus: BTreeMap<usize, Bitmask>,
    cpu_node: HashMap<usize, usize>,
    node_dir: PathBuf,
}

impl Topology {
    /// Discovers the topology of the running machine.
    pub fn discover(config: &NumaConfig) -> Self {
        Self::discover_with(config, numa_available())
    }

    pub(crate) fn discover_with(config: &NumaConfig, available: bool) -> Self {
        let cpu_configured = configured_cpu_count(config);
        let cpu_possible = possible_cpu_count().unwrap_or(cpu_configured);
        debug!("cpus: {cpu_configured} configured, {cpu_possible} possible");

        if !available {
            info!("NUMA is not available, assuming a single node");
            return Self::single_node(config, cpu_configured, cpu_possible);
        }

        let node_possible = possible_node_count(&config.self_status());
        let node_dir = config.node_dir();
        let node_ids = match indexed_entries(&node_dir, "node") {
            Ok(ids) => ids,
            Err(err) => {
                info!(
                    "cannot enumerate {}: {err}, assuming a single node",
                    node_dir.display()
                );
                return Self::single_node(config, cpu_configured, cpu_possible);
            }
        };

        let mut mem_nodes = Bitmask::new(node_possible);
        let mut node_configured = 0;
        let mut node_cpus = BTreeMap::new();
        let mut cpu_node = HashMap::new();
        for node in node_ids {
            if node >= node_possible {
                warn!("node {node} exceeds the possible node count {node_possible}, skipping");
                continue;
            }
            node_configured = node_configured.max(node + 1);

            if read_node_mem_size(&node_dir, node).is_ok() {
                mem_nodes.set(node, true);
            }

            let cpumap_path = node_dir.join(format!("node{node}/cpumap"));
            let cpus = match fs::read_to_string(&cpumap_path)
                .map_err(NumaError::from)
                .and_then(|content| parse_cpumap(&content, cpu_possible))
            {
                Ok(cpus) => cpus,
                Err(err) => {
                    warn!("ignoring node {node}: {}: {err}", cpumap_path.display());
                    continue;
                }
            };
            for cpu in cpus.iter_ones() {
                cpu_node.insert(cpu, node);
            }
            node_cpus.insert(node, cpus);
        }
        let node_configured = node_configured.max(1);
        debug!(
            "nodes: {} with memory, {node_configured} configured, {node_possible} possible",
            mem_nodes.count()
        );

        Self {
            available,
            node_possible,
            node_configured,
            cpu_possible,
            cpu_configured,
            mem_nodes,
            node_cpus,
            cpu_node,
            node_dir,
        }
    }

    /// A topology with one node owning CPUs `0..cpu_configured`.
    fn single_node(config: &NumaConfig, cpu_configured: usize, cpu_possible: usize) -> Self {
        let cpu_possible = cpu_possible.max(cpu_configured);
        let mut mem_nodes = Bitmask::new(1);
        mem_nodes.set(0, true);
        let mut cpus = Bitmask::new(cpu_possible);
        for cpu in 0..cpu_configured {
            cpus.set(cpu, true);
        }
        Self {
            available: false,
            node_possible: 1,
            node_configured: 1,
            cpu_possible,
            cpu_configured,
            mem_nodes,
            node_cpus: BTreeMap::from([(0, cpus)]),
            cpu_node: (0..cpu_configured).map(|cpu| (cpu, 0)).collect(),
            node_dir: config.node_dir(),
        }
    }

    /// Whether the kernel supports the NUMA memory-policy calls.
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Number of nodes that have memory attached.
    pub fn node_count(&self) -> usize {
        self.mem_nodes.count()
    }

    /// Highest node count the platform can address.
    pub fn node_possible_count(&self) -> usize {
        self.node_possible
    }

    /// Highest configured node id.
    pub fn max_node_id(&self) -> usize {
        self.node_configured - 1
    }

    pub fn max_possible_node_id(&self) -> usize {
        self.node_possible.saturating_sub(1)
    }

    /// Number of configured (present) CPUs.
    pub fn cpu_count(&self) -> usize {
        self.cpu_configured
    }

    /// Size of the kernel's CPU mask in bits.
    pub fn cpu_possible_count(&self) -> usize {
        self.cpu_possible
    }

    /// The set of nodes with memory.
    pub fn node_mask(&self) -> Bitmask {
        self.mem_nodes.clone()
    }

    /// Iterates over every node with a known CPU set.
    pub fn nodes(&self) -> impl Iterator<Item = (usize, &Bitmask)> {
        self.node_cpus.iter().map(|(&node, cpus)| (node, cpus))
    }

    /// CPU set of `node`.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::NodeOutOfRange`] if `node` exceeds the possible node id.
    /// Returns [`NumaError::NodeNotFound`] if `node` was not discovered.
    pub fn node_to_cpu_mask(&self, node: usize) -> Result<Bitmask, NumaError> {
        self.node_cpus_ref(node).cloned()
    }

    pub(crate) fn node_cpus_ref(&self, node: usize) -> Result<&Bitmask, NumaError> {
        if node > self.max_possible_node_id() {
            return Err(NumaError::NodeOutOfRange {
                node: node as isize,
                max: self.max_possible_node_id(),
            });
        }
        self.node_cpus
            .get(&node)
            .ok_or(NumaError::NodeNotFound(node))
    }

    /// Node owning `cpu`.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::CpuOutOfRange`] if `cpu` exceeds the possible CPU count.
    /// Returns [`NumaError::CpuNotFound`] if no discovered node owns `cpu`.
    pub fn cpu_to_node(&self, cpu: usize) -> Result<usize, NumaError> {
        if cpu >= self.cpu_possible {
            return Err(NumaError::CpuOutOfRange {
                cpu,
                max: self.cpu_possible.saturating_sub(1),
            });
        }
        self.cpu_node
            .get(&cpu)
            .copied()
            .ok_or(NumaError::CpuNotFound(cpu))
    }

    /// Total and free memory of `node` in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::NotSupported`] if NUMA is unavailable.
    /// Returns [`NumaError::Io`] or [`NumaError::ParseError`] if the node's
    /// `meminfo` cannot be read.
    pub fn node_mem_size(&self, node: usize) -> Result<(u64, u64), NumaError> {
        if !self.available {
            return Err(NumaError::NotSupported);
        }
        read_node_mem_size(&self.node_dir, node)
    }
}

/// Probes whether `get_mempolicy(2)` exists.
pub fn numa_available() -> bool {
    !matches!(get_mempolicy(None, 0, 0), Err(NumaError::NotSupported))
}

fn is_invalid_argument(err: &NumaError) -> bool {
    matches!(err, NumaError::Syscall { source, .. } if source.kind() == io::ErrorKind::InvalidInput)
}

/// Possible node count, from the `Mems_allowed` width in `status` or by growing a
/// nodemask until `get_mempolicy` stops rejecting it as too small.
fn possible_node_count(status_path: &Path) -> usize {
    if let Some(width) = fs::read_to_string(status_path)
        .ok()
        .and_then(|status| parse_mems_allowed_width(&status))
    {
        return width;
    }

    probe_nodemask_width(|mask| get_mempolicy(Some(mask), 0, 0).map(drop))
}

/// Doubles a nodemask until `probe` stops rejecting it with `EINVAL`, and returns
/// the width of the mask that was handed over last.
fn probe_nodemask_width(mut probe: impl FnMut(&mut Bitmask) -> Result<(), NumaError>) -> usize {
    let mut bits = INITIAL_NODEMASK_PROBE_BITS;
    while bits < MAX_NODEMASK_PROBE_BITS {
        let mut mask = Bitmask::new(bits << 1);
        bits = mask.len();
        match probe(&mut mask) {
            Err(err) if is_invalid_argument(&err) => continue,
            _ => break,
        }
    }
    bits
}

/// Possible CPU count: the kernel's affinity mask size, found by doubling the
/// buffer until `sched_getaffinity` accepts it.
fn possible_cpu_count() -> Option<usize> {
    let mut bits = INITIAL_CPUMASK_PROBE_BITS;
    loop {
        let mut mask = Bitmask::new(bits);
        match sched_getaffinity(0, &mut mask) {
            Ok(copied) => return Some(copied * 8),
            Err(err) if is_invalid_argument(&err) => bits *= 2,
            Err(NumaError::NotSupported) => return None,
            Err(err) => {
                warn!("sched_getaffinity probe failed: {err}");
                return Some(DEFAULT_POSSIBLE_CPUS);
            }
        }
    }
}

fn configured_cpu_count(config: &NumaConfig) -> usize {
    if let Ok(cpus) = indexed_entries(&config.cpu_dir(), "cpu") {
        if !cpus.is_empty() {
            return cpus.len();
        }
    }
    if let Ok(cpuinfo) = fs::read_to_string(config.cpuinfo()) {
        let count = count_cpuinfo_processors(&cpuinfo);
        if count > 0 {
            return count;
        }
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Sorted ids of the `<prefix><id>` directories in `dir`.
fn indexed_entries(dir: &Path, prefix: &str) -> io::Result<Vec<usize>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(id) = name
            .to_str()
            .and_then(|name| name.strip_prefix(prefix))
            .and_then(|id| id.parse::<usize>().ok())
        else {
            continue;
        };
        ids.push(id);
    }
    ids.sort_unstable();
    Ok(ids)
}

fn read_node_mem_size(node_dir: &Path, node: usize) -> Result<(u64, u64), NumaError> {
    let content = fs::read_to_string(node_dir.join(format!("node{node}/meminfo")))?;
    parse_node_meminfo(&content)
}

/// Width in bits of the `Mems_allowed` mask in `/proc/self/status`.
///
/// The mask is printed as 32-bit groups of 8 hex digits joined by commas, so
/// every 9 characters account for 32 bits.
pub(crate) fn parse_mems_allowed_width(status: &str) -> Option<usize> {
    let value = status
        .lines()
        .find_map(|line| line.strip_prefix("Mems_allowed:"))?
        .trim();
    let width = (value.len() + 1) * 32 / 9;
    (width > 0 && !value.is_empty()).then_some(width)
}

/// Parses a sysfs CPU bitmap such as `00000000,0000000f`.
///
/// Groups are most-significant first; each group contributes four bits per hex digit.
pub(crate) fn parse_cpumap(content: &str, capacity: usize) -> Result<Bitmask, NumaError> {
    let mut mask = Bitmask::new(capacity);
    let mut offset = 0;
    for token in content.trim().rsplit(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let bits = u64::from_str_radix(token, 16)
            .map_err(|_| NumaError::ParseError(format!("cpumap group {token:?}")))?;
        let mut rest = bits;
        while rest != 0 {
            let bit = rest.trailing_zeros() as usize;
            mask.set(offset + bit, true);
            rest &= rest - 1;
        }
        offset += token.len() * 4;
    }
    Ok(mask)
}

/// Total and free bytes from a per-node `meminfo`, whose lines look like
/// `Node 0 MemTotal:       16318996 kB`.
pub(crate) fn parse_node_meminfo(content: &str) -> Result<(u64, u64), NumaError> {
    fn field(line: &str, key: &str) -> Option<Result<u64, NumaError>> {
        let (_, rest) = line.split_once(key)?;
        let digits = rest.trim().trim_end_matches("kB").trim();
        Some(
            digits
                .parse::<u64>()
                .map(|kb| kb.saturating_mul(1024))
                .map_err(|_| NumaError::ParseError(format!("meminfo line {line:?}"))),
        )
    }

    let mut total = None;
    let mut free = 0;
    for line in content.lines().filter(|line| line.trim_end().ends_with("kB")) {
        if let Some(value) = field(line, "MemTotal:") {
            total = Some(value?);
        } else if let Some(value) = field(line, "MemFree:") {
            free = value?;
        }
    }
    total
        .map(|total| (total, free))
        .ok_or_else(|| NumaError::ParseError("meminfo without MemTotal".to_string()))
}

pub(crate) fn count_cpuinfo_processors(cpuinfo: &str) -> usize {
    cpuinfo
        .lines()
        .filter(|line| line.starts_with("processor"))
        .count()
}
