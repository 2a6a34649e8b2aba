use crate::kernel_metadata::errno_name;
use backtrace::Backtrace;
use nix::errno::errno;
use std::{
    collections::HashMap,
    env,
    env::var_os,
    fs::{File, OpenOptions},
    io::{self, Result, Write},
    path::Path,
    sync::{Mutex, MutexGuard},
};

#[derive(Clone)]
struct LogModule {
    name: String,
    level: LogLevel,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    log_modules_cache: HashMap<String, LogModule>,
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let maybe_filename = var_os("WTRACE_LOG_FILE");
        let maybe_append_filename = var_os("WTRACE_APPEND_LOG_FILE");
        let f: Box<dyn Write + Send>;
        if let Some(filename) = maybe_filename {
            f = Box::new(File::create(&filename).unwrap_or_else(|e| {
                panic!("Could not create log file `{:?}' from WTRACE_LOG_FILE: {}", filename, e)
            }));
        } else if let Some(append_filename) = maybe_append_filename {
            f = Box::new(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&append_filename)
                    .unwrap_or_else(|e| {
                        panic!(
                            "Could not append to log file `{:?}' from WTRACE_APPEND_LOG_FILE: {}",
                            append_filename, e
                        )
                    }),
            );
        } else {
            f = Box::new(io::stderr());
        }

        let (default_level, level_map) = match env::var("WTRACE_LOG") {
            Ok(spec) => init_log_levels(&spec),
            Err(_) => (LogError, HashMap::new()),
        };

        Mutex::new(LogGlobals {
            level_map,
            log_modules_cache: HashMap::new(),
            log_file: f,
            default_level,
        })
    };
}

fn log_level_string_to_level(log_level_string: &str) -> LogLevel {
    match log_level_string {
        "fatal" => LogFatal,
        "error" => LogError,
        "warn" => LogWarn,
        "info" => LogInfo,
        "debug" => LogDebug,
        _ => LogWarn,
    }
}

fn init_log_levels(spec: &str) -> (LogLevel, HashMap<String, LogLevel>) {
    let mut hm: HashMap<String, LogLevel> = HashMap::new();
    let mut default_level = LogDebug;
    for mod_colon_level in spec.split(',') {
        let res: Vec<&str> = mod_colon_level.splitn(2, ':').collect();
        if res.len() == 2 {
            let mod_name = res[0].trim();
            let log_level_string = res[1].trim();
            if mod_name == "all" {
                default_level = log_level_string_to_level(log_level_string);
            } else {
                hm.insert(
                    mod_name.to_owned(),
                    log_level_string_to_level(log_level_string),
                );
            }
        }
    }
    (default_level, hm)
}

/// Given a module name, what is its log level?
fn get_log_level(module_name: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    // We DONT lowercase here as filenames are usually case sensitive on Linux.
    match l.level_map.get(module_name) {
        Some(log_level) => *log_level,
        None => l.default_level,
    }
}

/// Given a filename what is the corresponding module name?
fn filename_to_module_name(filename: &str) -> String {
    let path = Path::new(filename);
    path.file_stem().unwrap().to_string_lossy().to_string()
}

/// Given the filename get the corresponding LogModule.
fn get_log_module(filename: &str, l: &mut MutexGuard<LogGlobals>) -> LogModule {
    if let Some(log_module) = l.log_modules_cache.get(filename) {
        log_module.to_owned()
    } else {
        let name = filename_to_module_name(filename);
        let level = get_log_level(&name, l);
        let m = LogModule { level, name };
        l.log_modules_cache.insert(filename.to_owned(), m.clone());
        m
    }
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

pub struct NewLineTerminatingOstream {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        always_enabled: bool,
    ) -> Option<NewLineTerminatingOstream> {
        let mut lock = LOG_GLOBALS.lock().unwrap();
        let m = get_log_module(filename, &mut lock);
        let enabled = always_enabled || level <= m.level;
        if enabled {
            let mut stream = NewLineTerminatingOstream {
                message: Vec::new(),
                enabled,
                lock,
            };
            if level == LogDebug {
                write!(stream, "[{}] ", m.name).unwrap();
            } else {
                write_prefix(&mut stream, level, filename, line);
            }

            Some(stream)
        } else {
            None
        }
    }
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        if self.enabled {
            self.write(b"\n").unwrap();
            self.flush().unwrap_or(());
        }
    }
}

impl Write for NewLineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }

        // Need to pretend these were written even if the stream was not
        // enabled, otherwise callers get a WriteZero error.
        Ok(buf.len())
    }
}

pub fn write_prefix(stream: &mut dyn Write, level: LogLevel, filename: &str, line: u32) {
    write!(stream, "[{} {}:{}", log_name(level), filename, line).unwrap();

    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {}", errno_name(err)).unwrap();
    }
    write!(stream, "] ").unwrap();
}

/// This is almost always not the function you want. Use the log!() macro instead.
pub fn log(
    log_level: LogLevel,
    filename: &str,
    line: u32,
    always_enabled: bool,
) -> Option<NewLineTerminatingOstream> {
    NewLineTerminatingOstream::new(log_level, filename, line, always_enabled)
}

/// Write a log message to the log file (or stderr if no log file was
/// specified). The program continues normally afterwards.
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            let maybe_stream = crate::log::log($log_level, file!(), line!(), false);
            match maybe_stream {
                Some(mut stream) => write!(stream, $($args)+).unwrap(),
                None => (),
            }
        }
    };
}

/// Log the message, print a backtrace to stderr and abort.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let maybe_stream = crate::log::log(LogFatal, file!(), line!(), true);
                match maybe_stream {
                    Some(mut stream) => write!(stream, $($args)+).unwrap(),
                    None => (),
                }
            }
            crate::log::notifying_abort(backtrace::Backtrace::new());
        }
    };
}

/// Output to stderr always. No backtrace -- simply exit.
#[allow(unused_macros)]
macro_rules! clean_fatal {
    ($($args:tt)+) => {
        use std::io::stderr;
        crate::log::write_prefix(&mut stderr(), crate::log::LogLevel::LogFatal, file!(), line!());
        eprintln!($($args)+);
        std::process::exit(1);
    };
}

/// Dump the stacktrace and abort.
pub fn notifying_abort(bt: Backtrace) -> ! {
    dump_wtrace_stack(bt);
    std::process::abort();
}

/// Write the backtrace to stderr.
fn dump_wtrace_stack(bt: Backtrace) {
    eprintln!("=== Start wtrace backtrace:");
    eprintln!("{:?}", bt);
    eprintln!("=== End wtrace backtrace");
}
