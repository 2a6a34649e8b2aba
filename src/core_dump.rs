//! Best-effort discovery of the core file left behind by a crashed tracee.
//! The kernel's core_pattern decides where cores land; we expand it for the
//! crashed process, add a few well-known locations, and scan for a match.
//!
//! Limitation: when several processes of one tree crash, the scan may find
//! the same core file more than once.

use crate::log::LogLevel::LogDebug;
use crate::util::{get_cwd, read_file_safe};
use libc::pid_t;
use regex::Regex;
use std::fs;

const PROC_CORE_PATTERN: &str = "/proc/sys/kernel/core_pattern";
const PROC_CORE_USES_PID: &str = "/proc/sys/kernel/core_uses_pid";

/// Directories cores commonly end up in regardless of core_pattern, e.g.
/// when a crash handler pipeline re-writes them.
const WELL_KNOWN: &[(&str, &str)] = &[
    ("/coredumps", "%e.%p.%s"),
    ("/coredumps", "*%p*"),
    ("/cores", "*%p*"),
    ("/var/lib/systemd/coredump", "*%p*"),
];

/// Substitute the core_pattern format specifiers we can resolve; anything
/// else widens to a wildcard.
fn expand_pattern(pattern: &str, pid: pid_t, comm: &str, sig: i32) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('p') => out.push_str(&pid.to_string()),
            Some('e') => out.push_str(comm),
            Some('s') => out.push_str(&sig.to_string()),
            Some('%') => out.push('%'),
            Some(_) => out.push('*'),
            None => break,
        }
    }
    out
}

/// An expanded mask is a filename with '*' wildcards; everything else is
/// literal. Anchored so "core" does not match "uncored.txt".
fn mask_to_regex(mask: &str) -> Option<Regex> {
    let mut expr = String::from("^");
    for c in mask.chars() {
        if c == '*' {
            expr.push_str(".*");
        } else {
            expr.push_str(&regex::escape(&c.to_string()));
        }
    }
    expr.push('$');
    Regex::new(&expr).ok()
}

/// (directory, unexpanded mask) pairs to try, in order.
fn candidate_masks(pattern: &str, core_uses_pid: bool) -> Vec<(String, String)> {
    let mut candidates: Vec<(String, String)> = Vec::new();
    if pattern.is_empty() || pattern.starts_with('|') {
        // Piped patterns hand the core to a helper program; fall back to
        // the classic name in the working directory.
        let mask = if core_uses_pid { "core.%p" } else { "core" };
        candidates.push((get_cwd(), mask.to_owned()));
    } else if let Some(slash) = pattern.rfind('/') {
        candidates.push((pattern[..slash].to_owned(), pattern[slash + 1..].to_owned()));
    } else {
        candidates.push((get_cwd(), pattern.to_owned()));
    }
    for (dir, mask) in WELL_KNOWN.iter() {
        candidates.push(((*dir).to_owned(), (*mask).to_owned()));
    }
    candidates
}

fn scan_dir(dir: &str, re: &Regex) -> Option<String> {
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        if !file_type.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if re.is_match(name) {
                return Some(format!("{}/{}", dir, name));
            }
        }
    }
    None
}

/// Look for the core file a crash of `pid` (command `comm`, killed by
/// `sig`) would have produced. Returns the first plausible path, if any.
pub fn locate_core_dump(pid: pid_t, comm: &str, sig: i32) -> Option<String> {
    let pattern = read_file_safe(PROC_CORE_PATTERN, Some(4096));
    let core_uses_pid = read_file_safe(PROC_CORE_USES_PID, Some(16)) == "1";
    for (dir, mask) in candidate_masks(&pattern, core_uses_pid) {
        let expanded = expand_pattern(&mask, pid, comm, sig);
        let re = match mask_to_regex(&expanded) {
            Some(re) => re,
            None => continue,
        };
        log!(
            LogDebug,
            "searching {} for core dumps matching '{}'",
            dir,
            expanded
        );
        if let Some(path) = scan_dir(&dir, &re) {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pattern_expansion() {
        assert_eq!(expand_pattern("core.%p", 1234, "crashy", 11), "core.1234");
        assert_eq!(
            expand_pattern("%e.%p.%s", 1234, "crashy", 11),
            "crashy.1234.11"
        );
        assert_eq!(expand_pattern("100%%.%p", 7, "x", 6), "100%.7");
        // Unknown specifiers widen to wildcards.
        assert_eq!(expand_pattern("core-%t-%p", 7, "x", 6), "core-*-7");
    }

    #[test]
    fn masks_anchor_and_escape() {
        let re = mask_to_regex("core.1234").unwrap();
        assert!(re.is_match("core.1234"));
        assert!(!re.is_match("core.12345"));
        assert!(!re.is_match("xcore.1234"));
        // The dot must be literal.
        assert!(!re.is_match("coreX1234"));

        let re = mask_to_regex("*1234*").unwrap();
        assert!(re.is_match("core.1234.11.zst"));
        assert!(!re.is_match("core.999"));
    }

    #[test]
    fn piped_pattern_falls_back_to_classic_names() {
        let candidates = candidate_masks("|/usr/lib/systemd/systemd-coredump %P", true);
        assert_eq!(candidates[0].1, "core.%p");
        let candidates = candidate_masks("", false);
        assert_eq!(candidates[0].1, "core");
    }

    #[test]
    fn absolute_pattern_splits_into_dir_and_mask() {
        let candidates = candidate_masks("/var/crash/core.%e.%p", false);
        assert_eq!(candidates[0].0, "/var/crash");
        assert_eq!(candidates[0].1, "core.%e.%p");
        // Well-known locations are still appended.
        assert!(candidates.len() > 1);
        assert!(candidates.iter().any(|(d, _)| d == "/var/lib/systemd/coredump"));
    }

    #[test]
    fn found_core_in_a_directory() {
        let dir = std::env::temp_dir().join(format!("wtrace-core-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let core = dir.join("core.4242");
        fs::write(&core, b"not really a core").unwrap();
        let re = mask_to_regex("core.4242").unwrap();
        let found = scan_dir(dir.to_str().unwrap(), &re);
        assert_eq!(found, Some(core.to_str().unwrap().to_owned()));
        let miss = scan_dir(dir.to_str().unwrap(), &mask_to_regex("core.1").unwrap());
        assert!(miss.is_none());
        fs::remove_dir_all(&dir).unwrap();
    }
}
