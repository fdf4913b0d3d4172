//! CPU topology and thread pinning.
//!
//! Workers are pinned to CPUs chosen core-major: both SMT siblings of a
//! physical core before moving to the next core. On Linux the layout comes
//! from `/sys/devices/system/cpu/cpu*/topology/thread_siblings_list`;
//! elsewhere the mapping is sequential and pinning is a no-op.

use tracing::info;

#[derive(Clone, Copy, Debug)]
struct CpuInfo {
    cpu_id: usize,
    core_id: usize,
    smt_index: usize,
}

/// Parse "0,12" or "0-2,12-14". Returns (first cpu in the sibling set,
/// position of `cpu_id` inside it).
#[cfg(target_os = "linux")]
fn parse_siblings(list: &str, cpu_id: usize) -> (usize, usize) {
    let mut first = None;
    let mut idx = 0usize;
    for part in list.trim().split(',') {
        let mut bounds = part.splitn(2, '-');
        let lo: usize = match bounds.next().and_then(|s| s.parse().ok()) {
            Some(v) => v,
            None => continue,
        };
        let hi: usize = bounds.next().and_then(|s| s.parse().ok()).unwrap_or(lo);
        for cpu in lo..=hi {
            if first.is_none() {
                first = Some(cpu);
            }
            if cpu == cpu_id {
                return (first.unwrap(), idx);
            }
            idx += 1;
        }
    }
    (cpu_id, 0)
}

#[cfg(target_os = "linux")]
fn read_cpus(count: usize) -> Vec<CpuInfo> {
    let mut cpus = Vec::new();
    for cpu in 0..512 {
        if cpus.len() >= count {
            break;
        }
        let path = format!(
            "/sys/devices/system/cpu/cpu{}/topology/thread_siblings_list",
            cpu
        );
        let Ok(list) = std::fs::read_to_string(&path) else {
            continue;
        };
        let (core_id, smt_index) = parse_siblings(&list, cpu);
        cpus.push(CpuInfo { cpu_id: cpu, core_id, smt_index });
    }
    cpus
}

#[cfg(not(target_os = "linux"))]
fn read_cpus(_count: usize) -> Vec<CpuInfo> {
    Vec::new()
}

/// `map[worker] = cpu`. Order: core0_t0, core0_t1, core1_t0, core1_t1, ...
pub fn build_cpu_map(count: usize) -> Vec<usize> {
    let mut cpus = read_cpus(count);
    if cpus.is_empty() {
        return (0..count).collect();
    }

    cpus.sort_by_key(|c| (c.smt_index, c.core_id));

    let max_smt = cpus.iter().map(|c| c.smt_index).max().unwrap_or(0);
    let mut physical = cpus.len() / (max_smt + 1);
    if physical == 0 {
        physical = cpus.len();
    }

    let mut map = Vec::with_capacity(count);
    'outer: for core in 0..physical {
        for smt in 0..=max_smt {
            if let Some(c) = cpus
                .iter()
                .filter(|c| c.smt_index == smt)
                .nth(core)
            {
                map.push(c.cpu_id);
                if map.len() == count {
                    break 'outer;
                }
            }
        }
    }
    while map.len() < count {
        map.push(map.len());
    }

    info!(physical, smt = max_smt + 1, "cpu topology");
    map
}

/// Pin the calling thread to `cpu`. Best-effort; returns false on failure.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> bool {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu: usize) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_covers_requested_count() {
        for n in [1usize, 2, 4, 7] {
            let map = build_cpu_map(n);
            assert_eq!(map.len(), n);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_siblings() {
        assert_eq!(parse_siblings("0,12", 12), (0, 1));
        assert_eq!(parse_siblings("0,12", 0), (0, 0));
        assert_eq!(parse_siblings("0-3", 2), (0, 2));
        assert_eq!(parse_siblings("4-5,10-11", 10), (4, 2));
    }
}
