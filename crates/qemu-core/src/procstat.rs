//! `cpu_stat` (spec §4.5) — utime/stime for the QEMU PID, read directly
//! from `/proc/<pid>/stat` rather than via a general-purpose process-stats
//! crate, since only these two fields are ever needed and the comm field
//! can contain spaces/parens that a generic parser would have to special-case
//! anyway.

use std::time::Duration;

use crate::error::{DriverError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuStat {
    pub user: Duration,
    pub system: Duration,
}

/// Parse `/proc/<pid>/stat` and convert fields 14 (`utime`) and 15
/// (`stime`), in clock ticks, to wall-clock durations via `sysconf(_SC_CLK_TCK)`.
pub fn cpu_stat(pid: i32) -> Result<CpuStat> {
    let path = format!("/proc/{pid}/stat");
    let contents = std::fs::read_to_string(&path)?;
    parse_stat(&contents)
}

fn parse_stat(contents: &str) -> Result<CpuStat> {
    // The second field (`comm`) is parenthesized and may itself contain
    // spaces and parens, so split on the *last* `)` rather than on
    // whitespace from the start.
    let close_paren = contents
        .rfind(')')
        .ok_or_else(|| DriverError::Protocol("malformed /proc/<pid>/stat: no comm field".into()))?;
    let rest = &contents[close_paren + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // `rest` starts at field 3 (`state`); utime is field 14, stime is 15,
    // i.e. indices 11 and 12 in `fields` (0-based from field 3).
    let utime_ticks: u64 = fields
        .get(11)
        .ok_or_else(|| DriverError::Protocol("malformed /proc/<pid>/stat: missing utime".into()))?
        .parse()
        .map_err(|_| DriverError::Protocol("malformed /proc/<pid>/stat: non-numeric utime".into()))?;
    let stime_ticks: u64 = fields
        .get(12)
        .ok_or_else(|| DriverError::Protocol("malformed /proc/<pid>/stat: missing stime".into()))?
        .parse()
        .map_err(|_| DriverError::Protocol("malformed /proc/<pid>/stat: non-numeric stime".into()))?;

    let ticks_per_sec = clock_ticks_per_second();
    Ok(CpuStat {
        user: ticks_to_duration(utime_ticks, ticks_per_sec),
        system: ticks_to_duration(stime_ticks, ticks_per_sec),
    })
}

fn clock_ticks_per_second() -> u64 {
    // SAFETY: `sysconf` with `_SC_CLK_TCK` has no preconditions and never
    // fails in a way that would invalidate memory; a negative return is
    // handled by falling back to the near-universal Linux default of 100.
    let raw = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if raw > 0 {
        raw as u64
    } else {
        100
    }
}

fn ticks_to_duration(ticks: u64, ticks_per_sec: u64) -> Duration {
    Duration::from_secs_f64(ticks as f64 / ticks_per_sec as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_stat_line() {
        let line = "1234 (qemu-system-x86) S 1 1234 1234 0 -1 4194560 100 0 0 0 1500 300 0 0 20 0 1 0 123 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 17 1 0 0 0 0 0 0 0 0 0 0 0 0 0";
        let stat = parse_stat(line).unwrap();
        assert_eq!(stat.user, ticks_to_duration(1500, clock_ticks_per_second()));
        assert_eq!(stat.system, ticks_to_duration(300, clock_ticks_per_second()));
    }

    #[test]
    fn comm_field_with_embedded_parens_and_spaces() {
        let line = "99 (a (weird) name) R 1 99 99 0 -1 0 0 0 0 0 7 8 0 0 20 0 1 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 17 1 0 0 0 0 0 0 0 0 0 0 0 0 0";
        let stat = parse_stat(line).unwrap();
        assert_eq!(stat.user, ticks_to_duration(7, clock_ticks_per_second()));
        assert_eq!(stat.system, ticks_to_duration(8, clock_ticks_per_second()));
    }

    #[test]
    fn rejects_truncated_stat_line() {
        assert!(parse_stat("1234 (qemu) S 1").is_err());
    }
}
