use std::ffi::OsString;
use std::path::PathBuf;
use structopt::clap::AppSettings;
use structopt::StructOpt;

/// Signals conventionally forwarded to an interactive foreground job.
pub const CONVENTIONAL_SIGNALS: &[i32] = &[
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGILL,
    libc::SIGABRT,
    libc::SIGFPE,
    libc::SIGSEGV,
    libc::SIGPIPE,
    libc::SIGALRM,
    libc::SIGTERM,
    libc::SIGUSR1,
    libc::SIGUSR2,
];

fn parse_signal(s: &str) -> Result<i32, String> {
    if let Ok(n) = s.parse::<i32>() {
        if (1..=64).contains(&n) {
            return Ok(n);
        }
        return Err(format!("signal number {} out of range", n));
    }
    let name = s.trim_start_matches("SIG");
    let sig = match name {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "ILL" => libc::SIGILL,
        "TRAP" => libc::SIGTRAP,
        "ABRT" => libc::SIGABRT,
        "BUS" => libc::SIGBUS,
        "FPE" => libc::SIGFPE,
        "USR1" => libc::SIGUSR1,
        "SEGV" => libc::SIGSEGV,
        "USR2" => libc::SIGUSR2,
        "PIPE" => libc::SIGPIPE,
        "ALRM" => libc::SIGALRM,
        "TERM" => libc::SIGTERM,
        "CHLD" => libc::SIGCHLD,
        "CONT" => libc::SIGCONT,
        "TSTP" => libc::SIGTSTP,
        "TTIN" => libc::SIGTTIN,
        "TTOU" => libc::SIGTTOU,
        "URG" => libc::SIGURG,
        "XCPU" => libc::SIGXCPU,
        "XFSZ" => libc::SIGXFSZ,
        "VTALRM" => libc::SIGVTALRM,
        "PROF" => libc::SIGPROF,
        "WINCH" => libc::SIGWINCH,
        "IO" => libc::SIGIO,
        "PWR" => libc::SIGPWR,
        "SYS" => libc::SIGSYS,
        _ => return Err(format!("unrecognized signal '{}'", s)),
    };
    Ok(sig)
}

fn parse_size(s: &str) -> Result<i64, String> {
    s.parse::<i64>()
        .map_err(|e| format!("not a valid size: {}", e))
}

#[derive(Clone, Debug, StructOpt)]
#[structopt(
    name = "wtrace",
    about = "Trace a program and report the largest files it causes to be written",
    global_settings = &[
        AppSettings::AllowNegativeNumbers,
        AppSettings::UnifiedHelpMessage,
    ],
    settings = &[AppSettings::TrailingVarArg]
)]
pub struct WtraceOptions {
    /// Maximum command line length shown in the report legend. Negative
    /// means unlimited, 0 disables the legend entirely
    #[structopt(
        short = "c",
        long,
        default_value = "100",
        parse(try_from_str = parse_size),
        value_name = "SIZE"
    )]
    pub cmdline_size: i64,

    /// Number of files in the report. Negative means unlimited, 0 disables
    /// the report
    #[structopt(
        short = "r",
        long,
        default_value = "24",
        parse(try_from_str = parse_size),
        value_name = "SIZE"
    )]
    pub report_size: i64,

    /// Write the report to FILE instead of stderr
    #[structopt(short = "o", long, parse(from_os_str), value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Append to the output file instead of truncating it
    #[structopt(short = "a", long)]
    pub append: bool,

    /// Print sizes in human readable form (KiB, MiB, ...)
    #[structopt(short = "H", long)]
    pub human_readable: bool,

    /// Trace descendant processes and threads of PROG
    #[structopt(short = "f", long)]
    pub follow_forks: bool,

    /// Do not kill the traced tree when the tracer dies
    #[structopt(short = "J", long = "no-jail-forks")]
    pub no_jail_forks: bool,

    /// With --follow-forks, keep tracing daemonized descendants after the
    /// root process exits
    #[structopt(short = "w", long)]
    pub wait_daemons: bool,

    /// Never install the seccomp syscall pre-filter
    #[structopt(short = "C", long = "no-seccomp")]
    pub no_seccomp: bool,

    /// Do not search for core dumps when a tracee crashes
    #[structopt(short = "D", long = "no-coredumps")]
    pub no_coredumps: bool,

    /// Keep zero-byte files in the report
    #[structopt(short = "E", long)]
    pub store_empty: bool,

    /// Forward SIG to the tracee; may be given multiple times (SIGINT is
    /// always forwarded)
    #[structopt(
        short = "s",
        long = "forward-sig",
        number_of_values = 1,
        parse(try_from_str = parse_signal),
        value_name = "SIG"
    )]
    pub forward_sig: Vec<i32>,

    /// Forward the conventional job-control signal set to the tracee
    #[structopt(short = "S", long)]
    pub forward_all_signals: bool,

    /// The program to trace, followed by its arguments
    #[structopt(parse(from_os_str), required = true, value_name = "PROG")]
    pub command: Vec<OsString>,
}

/// Resolved options with the negated flags flipped into positive form.
#[derive(Clone, Debug)]
pub struct Options {
    pub cmdline_size: i64,
    pub report_size: i64,
    pub output: Option<PathBuf>,
    pub append: bool,
    pub human_readable: bool,
    pub follow_forks: bool,
    pub jail_forks: bool,
    pub wait_daemons: bool,
    pub use_seccomp: bool,
    pub search_core_dumps: bool,
    pub store_empty: bool,
    pub forwarded_signals: Vec<i32>,
    pub command: Vec<OsString>,
}

impl From<WtraceOptions> for Options {
    fn from(opts: WtraceOptions) -> Options {
        let mut forwarded_signals: Vec<i32> = if opts.forward_all_signals {
            CONVENTIONAL_SIGNALS.to_vec()
        } else {
            vec![libc::SIGINT]
        };
        for sig in opts.forward_sig {
            if !forwarded_signals.contains(&sig) {
                forwarded_signals.push(sig);
            }
        }
        Options {
            cmdline_size: opts.cmdline_size,
            report_size: opts.report_size,
            output: opts.output,
            append: opts.append,
            human_readable: opts.human_readable,
            follow_forks: opts.follow_forks,
            jail_forks: !opts.no_jail_forks,
            wait_daemons: opts.wait_daemons,
            use_seccomp: !opts.no_seccomp,
            search_core_dumps: !opts.no_coredumps,
            store_empty: opts.store_empty,
            forwarded_signals,
            command: opts.command,
        }
    }
}

#[cfg(test)]
impl Default for Options {
    fn default() -> Options {
        Options {
            cmdline_size: 100,
            report_size: 24,
            output: None,
            append: false,
            human_readable: false,
            follow_forks: false,
            jail_forks: true,
            wait_daemons: false,
            use_seccomp: true,
            search_core_dumps: true,
            store_empty: false,
            forwarded_signals: vec![libc::SIGINT],
            command: vec!["true".into()],
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trailing_args_belong_to_the_tracee() {
        let opts = WtraceOptions::from_iter(&["wtrace", "-f", "-r", "10", "ls", "-l", "/tmp"]);
        assert!(opts.follow_forks);
        assert_eq!(opts.report_size, 10);
        let cmd: Vec<&OsString> = opts.command.iter().collect();
        assert_eq!(cmd, ["ls", "-l", "/tmp"]);
    }

    #[test]
    fn negative_sizes_parse() {
        let opts = WtraceOptions::from_iter(&["wtrace", "-r", "-1", "-c", "-1", "true"]);
        assert_eq!(opts.report_size, -1);
        assert_eq!(opts.cmdline_size, -1);
    }

    #[test]
    fn signal_names_and_numbers() {
        assert_eq!(parse_signal("9"), Ok(9));
        assert_eq!(parse_signal("TERM"), Ok(libc::SIGTERM));
        assert_eq!(parse_signal("SIGINT"), Ok(libc::SIGINT));
        assert!(parse_signal("0").is_err());
        assert!(parse_signal("NOSUCH").is_err());
    }

    #[test]
    fn sigint_always_forwarded() {
        let opts =
            WtraceOptions::from_iter(&["wtrace", "-s", "TERM", "-s", "USR1", "true"]);
        let resolved: Options = opts.into();
        assert!(resolved.forwarded_signals.contains(&libc::SIGINT));
        assert!(resolved.forwarded_signals.contains(&libc::SIGTERM));
        assert!(resolved.forwarded_signals.contains(&libc::SIGUSR1));
    }

    #[test]
    fn negated_flags_resolve_positively() {
        let opts = WtraceOptions::from_iter(&["wtrace", "-J", "-C", "-D", "true"]);
        let resolved: Options = opts.into();
        assert!(!resolved.jail_forks);
        assert!(!resolved.use_seccomp);
        assert!(!resolved.search_core_dumps);
    }
}
