// Parse the pipe-delimited `squeue --format='%i|%j|%T|%N|%L|%l|%C|%m|%S'` output into one
// JobRecord per known IDE job name. Mirrors the teacher's `slurmjobs.rs` field-splitting idiom
// (`util::pipe_fields`) for the pattern of "last field may itself be free text".  It's not
// needed here since none of these fields can contain `|`, but the absent-value sentinels
// (`(null)`, `N/A`, `INVALID`) are the same ones `slurmjobs.rs` filters.

use std::collections::HashMap;

use super::{Ide, JobRecord, JobState};

const ABSENT: &[&str] = &["(null)", "n/a", "invalid", ""];

fn present(field: &str) -> Option<&str> {
    if ABSENT.contains(&field.to_lowercase().as_str()) {
        None
    } else {
        Some(field)
    }
}

pub fn parse_queue(squeue_output: &str) -> HashMap<Ide, JobRecord> {
    let mut out = HashMap::new();
    for line in squeue_output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields = crate::util::pipe_fields(line, 9);
        if fields.len() < 9 {
            continue;
        }
        let job_id = fields[0].trim().to_string();
        let job_name = fields[1].trim();
        let Some(ide) = Ide::from_job_name(job_name) else {
            continue;
        };
        let state = match fields[2].trim() {
            "RUNNING" => JobState::Running,
            "PENDING" => JobState::Pending,
            _ => continue,
        };
        let node = present(fields[3].trim()).map(|s| s.to_string());
        let time_left = present(fields[4].trim()).map(|s| s.to_string());
        let time_limit = present(fields[5].trim()).map(|s| s.to_string());
        let cpus = present(fields[6].trim()).and_then(|s| s.parse::<u32>().ok());
        let memory = present(fields[7].trim()).map(|s| s.to_string());
        let start_time = present(fields[8].trim()).map(|s| s.to_string());

        out.insert(
            ide,
            JobRecord {
                job_id,
                ide,
                state,
                node,
                time_left,
                time_limit,
                cpus,
                memory,
                start_time,
            },
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_running_job_with_node() {
        let out = parse_queue("12345|vscode-slurm|RUNNING|c1-5|1:59:00|2:00:00|4|16000|2026-07-28T10:00:00\n");
        let rec = out.get(&Ide::Vscode).expect("vscode job present");
        assert_eq!(rec.job_id, "12345");
        assert_eq!(rec.state, JobState::Running);
        assert_eq!(rec.node.as_deref(), Some("c1-5"));
        assert_eq!(rec.cpus, Some(4));
    }

    #[test]
    fn pending_job_has_no_node() {
        let out = parse_queue("999|jupyter-slurm|PENDING|(null)|N/A|2:00:00|2|8000|2026-07-28T12:00:00\n");
        let rec = out.get(&Ide::Jupyter).expect("jupyter job present");
        assert_eq!(rec.state, JobState::Pending);
        assert_eq!(rec.node, None);
        assert_eq!(rec.time_left, None);
    }

    #[test]
    fn unknown_job_names_are_ignored() {
        let out = parse_queue("1|some-other-job|RUNNING|c1-1|1:00:00|1:00:00|1|1000|2026-07-28T09:00:00\n");
        assert!(out.is_empty());
    }

    #[test]
    fn blank_lines_are_skipped() {
        let out = parse_queue("\n\n");
        assert!(out.is_empty());
    }
}
