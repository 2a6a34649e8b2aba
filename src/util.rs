use crate::kernel_metadata::errno_name;
use nix::{
    errno::errno,
    fcntl::{fcntl, FcntlArg},
    sys::{stat::fstat, utsname::uname},
    unistd::getcwd,
};
use std::{
    fs::File,
    io::Read,
    os::unix::io::RawFd,
    path::Path,
};

/// Read up to `limit` bytes of a file, stripped of surrounding whitespace.
/// `None` means no limit. Returns an empty string on any error.
pub fn read_file_safe<P: AsRef<Path>>(filename: P, limit: Option<usize>) -> String {
    let mut res = String::new();
    if let Ok(mut file) = File::open(filename) {
        match limit {
            None => {
                file.read_to_string(&mut res).unwrap_or(0);
            }
            Some(0) => (),
            Some(limit) => {
                let mut buf = vec![0u8; limit];
                let n = file.read(&mut buf).unwrap_or(0);
                res = String::from_utf8_lossy(&buf[..n]).into_owned();
            }
        }
    }
    res.trim().to_owned()
}

pub fn get_cwd() -> String {
    match getcwd() {
        Ok(path) => path.to_string_lossy().into_owned(),
        Err(_) => String::new(),
    }
}

/// File length in bytes, or 0 for anything unstattable.
pub fn file_length(filename: &str) -> u64 {
    match nix::sys::stat::stat(filename) {
        Ok(st) => st.st_size as u64,
        Err(_) => 0,
    }
}

/// The command line of `pid` per /proc, NUL separators flattened to spaces.
pub fn command_line(pid: libc::pid_t, limit: Option<usize>) -> String {
    let cmdline = read_file_safe(format!("/proc/{}/cmdline", pid), limit);
    cmdline.replace('\0', " ")
}

/// The command name (comm) of `pid` per /proc.
pub fn command_name(pid: libc::pid_t) -> String {
    read_file_safe(format!("/proc/{}/comm", pid), None)
}

/// Highest descriptor number this process may have open, scanned downwards
/// from the rlimit until a live one answers fcntl.
pub fn my_highest_fd() -> Option<RawFd> {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } != 0 {
        fatal!("getrlimit(RLIMIT_NOFILE) failed: {}", errno_name(errno()));
    }

    let mut fd = rlim.rlim_cur as RawFd;
    while fd >= 0 {
        if fcntl(fd, FcntlArg::F_GETFD).is_ok() {
            return Some(fd);
        }
        fd -= 1;
    }
    None
}

pub fn is_regular_file_fd(fd: RawFd) -> bool {
    match fstat(fd) {
        Ok(st) => (st.st_mode & libc::S_IFMT) == libc::S_IFREG,
        Err(_) => false,
    }
}

/// Compare two kernel release strings by their leading numeric components,
/// strverscmp-style but only as deep as both strings go.
pub fn release_at_least(release: &str, wanted: &str) -> bool {
    let parse = |s: &str| -> Vec<u32> {
        s.split(|c: char| !c.is_ascii_digit())
            .take_while(|part| !part.is_empty())
            .filter_map(|part| part.parse().ok())
            .collect()
    };
    let have = parse(release);
    let want = parse(wanted);
    for (h, w) in have.iter().zip(want.iter()) {
        if h != w {
            return h > w;
        }
    }
    have.len() >= want.len()
}

/// Does the running kernel satisfy `wanted` (e.g. "4.8")?
pub fn kernel_at_least(wanted: &str) -> bool {
    release_at_least(uname().release(), wanted)
}

pub fn kernel_release() -> String {
    uname().release().to_owned()
}

const SIZE_SUFFIXES: [&str; 6] = ["b", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Render a byte count the way df -h does (three significant digits at most).
pub fn human_readable_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0".into();
    }

    let log2 = 63 - bytes.leading_zeros() as u64;
    let k = ((log2 / 10) as usize).min(SIZE_SUFFIXES.len() - 1);
    let val = bytes as f64 / (1u64 << (10 * k)) as f64;

    if val >= 100.0 {
        format!("{}{}", val as u64, SIZE_SUFFIXES[k])
    } else {
        format!("{:.1}{}", val, SIZE_SUFFIXES[k])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn release_comparison() {
        assert!(release_at_least("4.8.0-53-generic", "3.5"));
        assert!(release_at_least("4.8.0-53-generic", "4.8"));
        assert!(!release_at_least("4.7.10", "4.8"));
        assert!(release_at_least("5.15.0", "4.8.0"));
        assert!(!release_at_least("3.4.113", "3.5.0"));
    }

    #[test]
    fn human_sizes() {
        assert_eq!(human_readable_size(0), "0");
        assert_eq!(human_readable_size(1023), "1023b");
        assert_eq!(human_readable_size(1536), "1.5KiB");
        assert_eq!(human_readable_size(100 * 1024 * 1024), "100MiB");
        assert_eq!(human_readable_size(3 * 1024 * 1024 * 1024), "3.0GiB");
    }

    #[test]
    fn bounded_file_read() {
        let path = std::env::temp_dir().join(format!("wtrace-util-test-{}", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"  hello world\n").unwrap();
        drop(f);

        assert_eq!(read_file_safe(&path, None), "hello world");
        assert_eq!(read_file_safe(&path, Some(7)), "hello");
        assert_eq!(read_file_safe(&path, Some(0)), "");
        assert_eq!(read_file_safe("/nonexistent-wtrace-test", None), "");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn own_fds_look_sane() {
        // Test binaries always have std fds open.
        assert!(my_highest_fd().unwrap() >= 2);
    }
}
