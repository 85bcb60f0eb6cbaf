// Cluster health snapshot, spec §4.2 "Health snapshot": one combined shell pipeline reports CPU
// allocation, node states, memory, running/pending counts, GRES GPU availability, and optional
// fairshare. The parser segments the output by `===SECTION===` markers, one `sinfo`/`squeue`/
// `sshare` invocation per section, so the whole snapshot is a single SSH round trip.
//
// Node-state grouping reuses `crate::nodelist::parse` for the same compressed-nodelist grammar
// `%N` produces elsewhere (spec's job-queue `%N` field); CPU/fairshare fractions are rounded with
// `crate::util::format::three_places`, matching the precision the teacher's own fairshare/CPU
// fraction fields use.

use serde::Serialize;

use crate::nodelist;
use crate::util::format::three_places;

pub const CPU_SECTION: &str = "===CPU===";
pub const NODES_SECTION: &str = "===NODES===";
pub const MEM_SECTION: &str = "===MEM===";
pub const QUEUE_SECTION: &str = "===QUEUE===";
pub const GRES_SECTION: &str = "===GRES===";
pub const FAIRSHARE_SECTION: &str = "===FAIRSHARE===";

/// Builds the combined `sinfo`/`squeue`/`sshare` pipeline; each section's command output is
/// collected between its own `===SECTION===` marker and the next.
pub fn build_health_script() -> String {
    format!(
        "echo '{CPU_SECTION}'\n\
         sinfo -h -o '%C'\n\
         echo '{NODES_SECTION}'\n\
         sinfo -h -o '%T|%N'\n\
         echo '{MEM_SECTION}'\n\
         sinfo -N -h -o '%e|%m'\n\
         echo '{QUEUE_SECTION}'\n\
         squeue -a -h -o '%T'\n\
         echo '{GRES_SECTION}'\n\
         sinfo -h -o '%G'\n\
         echo '{FAIRSHARE_SECTION}'\n\
         sshare -n -o fairshare 2>/dev/null | head -n1\n",
    )
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct NodeStateGroup {
    pub state: String,
    /// Compressed nodelist elements for this state, as produced by `%N`, e.g. `c1-[5-6,8-9]`.
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct HealthSnapshot {
    pub cpu_allocated: u32,
    pub cpu_idle: u32,
    pub cpu_other: u32,
    pub cpu_total: u32,
    pub cpu_allocated_fraction: f64,
    pub node_states: Vec<NodeStateGroup>,
    pub memory_allocated_mb: u64,
    pub memory_total_mb: u64,
    pub running_jobs: u32,
    pub pending_jobs: u32,
    pub gres_gpu_total: Option<u32>,
    pub fairshare: Option<f64>,
}

fn section(output: &str, marker: &str) -> String {
    let Some(start) = output.find(marker) else {
        return String::new();
    };
    let after = &output[start + marker.len()..];
    let end = after
        .find("===")
        .unwrap_or(after.len());
    after[..end].trim().to_string()
}

pub fn parse_health_snapshot(output: &str) -> HealthSnapshot {
    let mut snapshot = HealthSnapshot::default();

    let cpu_text = section(output, CPU_SECTION);
    let (mut alloc, mut idle, mut other, mut total) = (0u32, 0u32, 0u32, 0u32);
    for line in cpu_text.lines() {
        let parts: Vec<&str> = line.trim().split('/').collect();
        if parts.len() != 4 {
            continue;
        }
        alloc += parts[0].parse::<u32>().unwrap_or(0);
        idle += parts[1].parse::<u32>().unwrap_or(0);
        other += parts[2].parse::<u32>().unwrap_or(0);
        total += parts[3].parse::<u32>().unwrap_or(0);
    }
    snapshot.cpu_allocated = alloc;
    snapshot.cpu_idle = idle;
    snapshot.cpu_other = other;
    snapshot.cpu_total = total;
    snapshot.cpu_allocated_fraction = if total > 0 {
        three_places(alloc as f64 / total as f64)
    } else {
        0.0
    };

    let nodes_text = section(output, NODES_SECTION);
    for line in nodes_text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((state, nodelist)) = line.split_once('|') else {
            continue;
        };
        let nodes = nodelist::parse(nodelist).unwrap_or_default();
        snapshot.node_states.push(NodeStateGroup {
            state: state.to_string(),
            nodes,
        });
    }

    let mem_text = section(output, MEM_SECTION);
    let (mut free_sum, mut total_sum) = (0u64, 0u64);
    for line in mem_text.lines() {
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() != 2 {
            continue;
        }
        free_sum += parts[0].parse::<u64>().unwrap_or(0);
        total_sum += parts[1].parse::<u64>().unwrap_or(0);
    }
    snapshot.memory_total_mb = total_sum;
    snapshot.memory_allocated_mb = total_sum.saturating_sub(free_sum);

    let queue_text = section(output, QUEUE_SECTION);
    for line in queue_text.lines() {
        match line.trim() {
            "RUNNING" => snapshot.running_jobs += 1,
            "PENDING" => snapshot.pending_jobs += 1,
            _ => {}
        }
    }

    let gres_text = section(output, GRES_SECTION);
    let mut gpu_total = 0u32;
    let mut saw_gpu = false;
    for line in gres_text.lines() {
        let line = line.trim();
        for entry in line.split(',') {
            let mut fields = entry.split(':');
            let Some(kind) = fields.next() else { continue };
            if kind != "gpu" {
                continue;
            }
            saw_gpu = true;
            // `gpu:<type>:<count>` or `gpu:<count>`; the count is always the last colon field,
            // possibly followed by a `(S:...)` socket annotation sinfo appends.
            if let Some(count_field) = fields.last() {
                let digits: String = count_field.chars().take_while(|c| c.is_ascii_digit()).collect();
                gpu_total += digits.parse::<u32>().unwrap_or(0);
            }
        }
    }
    snapshot.gres_gpu_total = if saw_gpu { Some(gpu_total) } else { None };

    let fairshare_text = section(output, FAIRSHARE_SECTION);
    snapshot.fairshare = fairshare_text.trim().parse::<f64>().ok().map(three_places);

    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_output() -> String {
        format!(
            "{CPU_SECTION}\n10/22/0/32\n2/6/0/8\n{NODES_SECTION}\nidle|c1-[1-3]\nalloc|c1-[4-5]\n{MEM_SECTION}\n4000|16000\n8000|16000\n{QUEUE_SECTION}\nRUNNING\nRUNNING\nPENDING\n{GRES_SECTION}\ngpu:a100:4\n(null)\n{FAIRSHARE_SECTION}\n0.123456\n",
        )
    }

    #[test]
    fn parses_cpu_allocation_summed_across_lines() {
        let snap = parse_health_snapshot(&sample_output());
        assert_eq!(snap.cpu_allocated, 12);
        assert_eq!(snap.cpu_total, 40);
        assert_eq!(snap.cpu_allocated_fraction, 0.3);
    }

    #[test]
    fn parses_node_states_via_nodelist_grammar() {
        let snap = parse_health_snapshot(&sample_output());
        assert_eq!(snap.node_states.len(), 2);
        assert_eq!(snap.node_states[0].state, "idle");
        assert_eq!(snap.node_states[0].nodes, vec!["c1-[1-3]".to_string()]);
    }

    #[test]
    fn memory_allocated_is_total_minus_free() {
        let snap = parse_health_snapshot(&sample_output());
        assert_eq!(snap.memory_total_mb, 32000);
        assert_eq!(snap.memory_allocated_mb, 20000);
    }

    #[test]
    fn counts_running_and_pending_jobs() {
        let snap = parse_health_snapshot(&sample_output());
        assert_eq!(snap.running_jobs, 2);
        assert_eq!(snap.pending_jobs, 1);
    }

    #[test]
    fn sums_gpu_gres_and_ignores_null() {
        let snap = parse_health_snapshot(&sample_output());
        assert_eq!(snap.gres_gpu_total, Some(4));
    }

    #[test]
    fn fairshare_is_rounded_to_three_places() {
        let snap = parse_health_snapshot(&sample_output());
        assert_eq!(snap.fairshare, Some(0.123));
    }

    #[test]
    fn missing_fairshare_section_is_none() {
        let output = sample_output().replace("0.123456\n", "");
        let snap = parse_health_snapshot(&output);
        assert_eq!(snap.fairshare, None);
    }

    #[test]
    fn build_health_script_emits_every_marker_in_order() {
        let script = build_health_script();
        let positions: Vec<usize> = [
            CPU_SECTION,
            NODES_SECTION,
            MEM_SECTION,
            QUEUE_SECTION,
            GRES_SECTION,
            FAIRSHARE_SECTION,
        ]
        .iter()
        .map(|m| script.find(m).unwrap())
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }
}
