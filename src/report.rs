//! Renders the end-of-trace summary: the largest written files, a legend
//! mapping each entry to the process that wrote it, and the running total.

use crate::log::LogLevel::LogError;
use crate::storage::FileStorage;
use crate::task_state::ProcInfoSharedPtr;
use crate::util::human_readable_size;
use crate::wtrace_options::Options;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::rc::Rc;

/// Width that comfortably fits any human-readable size.
const HUMAN_PADDING: usize = 9;

/// A short token that distinguishes processes sharing a pid (pids get
/// reused; the ProcInfo allocation does not).
fn proc_token(info: &ProcInfoSharedPtr) -> usize {
    Rc::as_ptr(info) as usize
}

fn render<W: Write>(out: &mut W, storage: &FileStorage, options: &Options) -> io::Result<()> {
    write!(out, "Output tracer summary report")?;
    if options.report_size > 0 {
        write!(out, " (limit: {})", options.report_size)?;
    }
    writeln!(out)?;

    let files = storage.largest_files();

    let padding = if options.human_readable {
        HUMAN_PADDING
    } else {
        let max = files.iter().map(|f| f.size).max().unwrap_or(0);
        max.to_string().len() + 2
    };

    let dump_proc_legend = options.cmdline_size != 0;
    let mut legend: Vec<ProcInfoSharedPtr> = Vec::new();

    for entry in &files {
        if options.human_readable {
            write!(out, "{:>width$}", human_readable_size(entry.size), width = padding)?;
        } else {
            write!(out, "{:>width$}b", entry.size, width = padding)?;
        }
        write!(out, " {}", entry.filename)?;
        if dump_proc_legend {
            write!(
                out,
                " (pid:{}|{})",
                entry.proc_info.pid,
                proc_token(&entry.proc_info)
            )?;
            if !legend
                .iter()
                .any(|p| Rc::ptr_eq(p, &entry.proc_info))
            {
                legend.push(Rc::clone(&entry.proc_info));
            }
        }
        writeln!(out)?;
    }

    if dump_proc_legend {
        writeln!(out, "Proc legend:")?;
        for pinfo in &legend {
            writeln!(
                out,
                "  {}|{} (ppid:{}) {}",
                pinfo.pid,
                proc_token(pinfo),
                pinfo.ppid,
                pinfo.cmdline
            )?;
        }
    }

    let total = storage.total_size();
    if options.human_readable {
        writeln!(out, "Total output: {}", human_readable_size(total))?;
    } else {
        writeln!(out, "Total output: {}b", total)?;
    }
    Ok(())
}

/// Write the report to the configured destination. Falls back to stderr if
/// the output file cannot be opened; rendering errors are reported but not
/// fatal, the trace itself already succeeded.
pub fn print_report(storage: &FileStorage, options: &Options) {
    let result = match &options.output {
        Some(path) => {
            let mut open_opts = OpenOptions::new();
            open_opts.write(true).create(true);
            if options.append {
                open_opts.append(true);
            } else {
                open_opts.truncate(true);
            }
            match open_opts.open(path) {
                Ok(mut file) => render(&mut file, storage, options),
                Err(e) => {
                    eprintln!("Failed to open {}: {}", path.display(), e);
                    render(&mut io::stderr().lock(), storage, options)
                }
            }
        }
        None => render(&mut io::stderr().lock(), storage, options),
    };
    if let Err(e) = result {
        log!(LogError, "failed to write report: {}", e);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task_state::{OutputFile, ProcInfo};

    fn sample_storage() -> FileStorage {
        let writer = ProcInfo::new(100, 1, "dd".into(), "dd if=/dev/zero of=/tmp/big".into());
        let other = ProcInfo::new(101, 100, "logger".into(), "logger".into());
        let mut storage = FileStorage::new(-1, false);
        storage.add(OutputFile::new("/tmp/big".into(), 1_048_576, Rc::clone(&writer)));
        storage.add(OutputFile::new("/tmp/log".into(), 420, other));
        storage.add(OutputFile::new("/tmp/small".into(), 12, writer));
        storage
    }

    fn rendered(options: &Options) -> String {
        let mut buf = Vec::new();
        render(&mut buf, &sample_storage(), options).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn report_lists_largest_first_with_total() {
        let options = Options {
            report_size: -1,
            ..Default::default()
        };
        let text = rendered(&options);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Output tracer summary report");
        assert!(lines[1].contains("1048576b /tmp/big (pid:100|"));
        assert!(lines[2].contains("420b /tmp/log (pid:101|"));
        assert!(lines[3].contains("12b /tmp/small (pid:100|"));
        assert!(text.contains("Proc legend:"));
        assert!(text.contains("(ppid:1) dd if=/dev/zero of=/tmp/big"));
        assert!(text.contains("(ppid:100) logger"));
        assert!(text.ends_with("Total output: 1048588b\n"));
    }

    #[test]
    fn limit_shows_in_header_when_bounded() {
        let options = Options {
            report_size: 24,
            ..Default::default()
        };
        assert!(rendered(&options).starts_with("Output tracer summary report (limit: 24)"));
    }

    #[test]
    fn sizes_right_align_to_the_widest_entry() {
        let options = Options {
            report_size: -1,
            ..Default::default()
        };
        let text = rendered(&options);
        // Widest size is 7 digits, so every size column is 9 wide plus 'b'.
        assert!(text.lines().nth(1).unwrap().starts_with("  1048576b"));
        assert!(text.lines().nth(2).unwrap().starts_with("      420b"));
    }

    #[test]
    fn human_readable_sizes() {
        let options = Options {
            report_size: -1,
            human_readable: true,
            ..Default::default()
        };
        let text = rendered(&options);
        assert!(text.contains("1.0MiB /tmp/big"));
        assert!(text.contains("420b /tmp/log"));
        assert!(text.ends_with("Total output: 1.0MiB\n"));
    }

    #[test]
    fn legend_disabled_with_zero_cmdline_size() {
        let options = Options {
            report_size: -1,
            cmdline_size: 0,
            ..Default::default()
        };
        let text = rendered(&options);
        assert!(!text.contains("pid:"));
        assert!(!text.contains("Proc legend:"));
    }

    #[test]
    fn same_process_appears_once_in_legend() {
        let options = Options {
            report_size: -1,
            ..Default::default()
        };
        let text = rendered(&options);
        let count = text.matches("(ppid:1) dd").count();
        assert_eq!(count, 1);
    }
}
