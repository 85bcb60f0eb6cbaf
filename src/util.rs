pub mod format;

// Split a pipe-delimited line into exactly `n` fields, catenating any excess trailing fields into
// the last one. Mirrors how the teacher handles `sacct` output where the final field (job name)
// may itself contain the delimiter; `squeue`'s `%j` field has the same property.
pub fn pipe_fields(line: &str, n: usize) -> Vec<String> {
    let fields = line.split('|').collect::<Vec<&str>>();
    if fields.len() <= n {
        return fields.into_iter().map(|s| s.to_string()).collect();
    }
    let mut out: Vec<String> = fields[..n - 1].iter().map(|s| s.to_string()).collect();
    out.push(fields[n - 1..].join("|"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_fields_catenates_excess_into_last() {
        let got = pipe_fields("1|PENDING|my|job|name", 3);
        assert_eq!(got, vec!["1", "PENDING", "my|job|name"]);
    }

    #[test]
    fn pipe_fields_exact_count() {
        let got = pipe_fields("1|PENDING|name", 3);
        assert_eq!(got, vec!["1", "PENDING", "name"]);
    }
}
