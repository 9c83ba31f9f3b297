//! Integration tests for agave-numa-utils
//!
//! Most of these tests require a Linux system and are skipped on other platforms.
//! They exercise the live topology, thread affinity and memory policy.

use agave_numa_utils::*;

fn numa() -> Numa {
    Numa::new(&NumaConfig::default()).expect("Failed to discover NUMA state")
}

/// Permission denied is acceptable in CI/containers
#[cfg(target_os = "linux")]
fn permission_denied(err: &NumaError) -> bool {
    err.raw_os_error() == Some(1) // EPERM = 1
}

#[test]
fn test_topology_invariants() {
    let numa = numa();
    assert!(numa.node_count() > 0);
    assert!(numa.node_possible_count() >= numa.node_count());
    assert!(numa.max_possible_node_id() >= numa.max_node_id());
    assert!(numa.cpu_count() > 0);
    assert!(numa.cpu_possible_count() >= numa.cpu_count());

    for (node, cpus) in numa.topology().nodes() {
        assert_eq!(
            numa.node_to_cpu_mask(node).expect("discovered node"),
            *cpus
        );
        for cpu in cpus.iter_ones() {
            assert_eq!(
                numa.cpu_to_node(cpu).expect("CPU of a discovered node"),
                node,
                "CPU {cpu} must map back to node {node}"
            );
        }
    }
}

#[test]
fn test_run_on_node_out_of_range() {
    let numa = numa();
    let max = numa.max_possible_node_id();
    for node in [-2, -100, (max + 1) as isize, 1 << 20] {
        match numa.run_on_node(node) {
            Err(NumaError::NodeOutOfRange { node: rejected, .. }) => assert_eq!(rejected, node),
            other => panic!("run_on_node({node}) should be out of range, got {other:?}"),
        }
    }
}

#[test]
#[cfg(target_os = "linux")]
fn test_run_on_all_nodes() {
    let numa = numa();
    let original = numa
        .running_cpu_mask()
        .expect("Failed to get original affinity");

    match numa.run_on_node(ALL_NODES) {
        Ok(()) => {
            let all = numa.running_cpu_mask().expect("Failed to get new affinity");
            for cpu in original.iter_ones() {
                assert!(all.get(cpu), "CPU {cpu} dropped from the affinity");
            }
            syscall::sched_setaffinity(0, &original).expect("Failed to restore affinity");
        }
        Err(e) if permission_denied(&e) => {
            eprintln!("Skipping affinity test: insufficient permissions");
        }
        Err(e) => panic!("Unexpected error: {e:?}"),
    }
}

#[test]
#[cfg(target_os = "linux")]
fn test_run_on_node_matches_cpu_set() {
    let numa = numa();
    let original = numa
        .running_cpu_mask()
        .expect("Failed to get original affinity");

    // only nodes whose CPUs are all allowed here can be matched exactly
    let Some((node, cpus)) = numa
        .topology()
        .nodes()
        .find(|(_, cpus)| cpus.count() > 0 && cpus.iter_ones().all(|cpu| original.get(cpu)))
    else {
        eprintln!("Skipping: no node lies entirely within the current affinity");
        return;
    };

    match numa.run_on_node(node as isize) {
        Ok(()) => {
            let current = numa.running_cpu_mask().expect("Failed to get new affinity");
            assert_eq!(current.text(), cpus.text());

            let (cpu, current_node) = numa.current_cpu_and_node().unwrap();
            assert!(cpus.get(cpu), "running on CPU {cpu} outside node {node}");
            assert_eq!(current_node, node);

            syscall::sched_setaffinity(0, &original).expect("Failed to restore affinity");
        }
        Err(e) if permission_denied(&e) => {
            eprintln!("Skipping affinity test: insufficient permissions");
        }
        Err(e) => panic!("Unexpected error: {e:?}"),
    }
}

#[test]
#[cfg(target_os = "linux")]
fn test_bind_to_current_node() {
    let numa = numa();
    if !numa.is_available() {
        return;
    }
    let original = numa
        .running_cpu_mask()
        .expect("Failed to get original affinity");
    let (_, node) = numa.current_cpu_and_node().unwrap();
    if !numa.node_mask().get(node) {
        return;
    }
    let mut nodes = Bitmask::new(numa.node_possible_count());
    nodes.set(node, true);

    match numa.bind(&nodes) {
        Ok(()) => {
            let (policy, bound) = numa.mem_policy().expect("Failed to get memory policy");
            assert_eq!(policy, MemPolicy::Bind);
            assert_eq!(bound.text(), node.to_string());
            assert_eq!(
                numa.running_nodes_mask().expect("running nodes").text(),
                node.to_string()
            );

            numa.set_mem_policy(MemPolicy::Default, None)
                .expect("Failed to restore memory policy");
            syscall::sched_setaffinity(0, &original).expect("Failed to restore affinity");
        }
        Err(e) if permission_denied(&e) => {
            // affinity may have been changed before set_mempolicy was refused
            let _ = syscall::sched_setaffinity(0, &original);
            eprintln!("Skipping bind test: insufficient permissions");
        }
        Err(e) => panic!("Unexpected error: {e:?}"),
    }
}

#[test]
#[cfg(target_os = "linux")]
fn test_concurrent_current_cpu_and_node() {
    use std::{sync::Arc, thread};

    let numa = Arc::new(numa());
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let numa = numa.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    let (cpu, node) = numa
                        .current_cpu_and_node()
                        .expect("Failed to query current CPU");
                    if let Ok(expected) = numa.cpu_to_node(cpu) {
                        assert_eq!(node, expected, "CPU {cpu} attributed to the wrong node");
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("query thread panicked");
    }
}

#[test]
#[cfg(target_os = "linux")]
fn test_fast_path_toggle() {
    let numa = numa();
    let fast_path = numa.fast_path();
    for enabled in [false, true, false] {
        numa.set_fast_path(enabled);
        assert_eq!(numa.fast_path(), enabled);
        let (cpu, _) = numa.current_cpu_and_node().unwrap();
        assert!(cpu < numa.cpu_possible_count());
    }
    numa.set_fast_path(fast_path);
}

#[test]
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn test_resolve_symbol() {
    let numa = numa();
    let address = numa
        .resolve_symbol("__vdso_getcpu")
        .expect("__vdso_getcpu must be exported");
    assert_ne!(address, 0);
    assert!(numa.resolve_symbol("__vdso_clock_gettime").is_some());
    assert_eq!(numa.resolve_symbol("__abc"), None);
    assert_eq!(numa.resolve_symbol(""), None);
}

#[test]
#[cfg(not(target_os = "linux"))]
fn test_non_linux_returns_not_supported() {
    let numa = numa();
    assert!(!numa.is_available());
    assert_eq!(numa.node_count(), 1);
    assert!(matches!(
        numa.run_on_node(ALL_NODES).unwrap_err(),
        NumaError::NotSupported
    ));
    assert!(matches!(
        numa.running_cpu_mask().unwrap_err(),
        NumaError::NotSupported
    ));
    assert!(matches!(
        numa.mem_policy().unwrap_err(),
        NumaError::NotSupported
    ));
    assert!(matches!(
        numa.current_cpu_and_node().unwrap_err(),
        NumaError::NotSupported
    ));
    assert_eq!(numa.resolve_symbol("__vdso_getcpu"), None);
}
