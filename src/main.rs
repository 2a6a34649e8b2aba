#[macro_use]
extern crate lazy_static;

#[macro_use]
mod log;

mod core_dump;
mod kernel_metadata;
mod kernel_supplement;
mod ptrace;
mod registers;
mod report;
mod seccomp_bpf;
mod storage;
mod task_state;
mod trace_context;
mod tracer;
mod util;
mod wait_status;
mod wtrace_options;

use crate::util::{kernel_at_least, kernel_release};
use crate::wtrace_options::{Options, WtraceOptions};
use std::fs::OpenOptions;
use structopt::StructOpt;

fn assert_prerequisites() {
    // PTRACE_O_EXITKILL, the youngest ptrace feature we rely on.
    if !kernel_at_least("3.8") {
        clean_fatal!(
            "wtrace requires Linux 3.8 or newer; this kernel is {}",
            kernel_release()
        );
    }
}

/// Fail before tracing starts rather than after a long run. Opens in
/// append mode either way; truncation happens when the report is written.
fn validate_output_file(options: &Options) {
    if let Some(path) = &options.output {
        let probe = OpenOptions::new()
            .write(true)
            .create(true)
            .append(true)
            .open(path);
        if let Err(e) = probe {
            clean_fatal!("cannot write report to {}: {}", path.display(), e);
        }
    }
}

fn main() {
    let options: Options = WtraceOptions::from_args().into();
    assert_prerequisites();
    validate_output_file(&options);
    let exit_code = tracer::trace_program(&options);
    std::process::exit(exit_code);
}
