//! `vm` — the LS-VM host launcher.
//!
//! Mirrors the original runtime's own launcher (`vm_create`'s argv scan,
//! `lscript/main.c`): a flat pass over argv rather than a subcommand
//! tree, since every flag here is a single-dash JVM-style switch
//! (`-path`, `-heaps`, ...) that clap's `--long` convention can't
//! express directly (`spec.md` §6).

use std::process::ExitCode;

use lsvm_core::vm::{self, RunOutcome, Vm, VmOptions};

const USAGE: &str = "\
usage: vm [options] <mainclass> [args...]

options:
  -version        print the runtime version and exit
  -help, -?        print this message and exit
  -verbose         log class loading to stderr
  -verr            log uncaught-exception detail to stderr
  -nodebug         accepted for compatibility; has no effect
  -path <dir>      add a classpath directory (repeatable)
  -heaps <size>    heap size, e.g. 512K, 256M, 2G (default 2G)
  -stacks <size>   per-call stack size, e.g. 2K, 64K (default 2K)";

struct Invocation {
    options: VmOptions,
    main_class: String,
    args: Vec<String>,
}

enum ParseOutcome {
    Run(Invocation),
    PrintVersion,
    PrintUsage,
}

fn parse_args(argv: &[String]) -> anyhow::Result<ParseOutcome> {
    let mut options = VmOptions::default();
    let mut main_class = None;
    let mut i = 0;
    while i < argv.len() {
        let arg = argv[i].as_str();
        match arg {
            "-version" => return Ok(ParseOutcome::PrintVersion),
            "-help" | "-?" => return Ok(ParseOutcome::PrintUsage),
            "-verbose" => options.verbose = true,
            "-verr" => options.verr = true,
            "-nodebug" => options.nodebug = true,
            "-path" => {
                i += 1;
                let dir = argv.get(i).ok_or_else(|| anyhow::anyhow!("-path requires a directory argument"))?;
                options.classpath.push(std::path::PathBuf::from(dir));
            }
            "-heaps" => {
                i += 1;
                let size = argv.get(i).ok_or_else(|| anyhow::anyhow!("-heaps requires a size argument"))?;
                options.heap_size = parse_size(size)?;
            }
            "-stacks" => {
                i += 1;
                let size = argv.get(i).ok_or_else(|| anyhow::anyhow!("-stacks requires a size argument"))?;
                options.stack_size = parse_size(size)?;
            }
            _ if main_class.is_none() => main_class = Some(arg.to_owned()),
            _ => break,
        }
        i += 1;
    }

    let Some(main_class) = main_class else { return Ok(ParseOutcome::PrintUsage) };
    let args = argv[i..].to_vec();
    Ok(ParseOutcome::Run(Invocation { options, main_class, args }))
}

/// Parse a `-heaps`/`-stacks` size argument: a decimal count followed by
/// an optional `K`/`M`/`G` suffix (`spec.md` §6).
fn parse_size(text: &str) -> anyhow::Result<usize> {
    let (digits, multiplier) = match text.chars().last() {
        Some('K') | Some('k') => (&text[..text.len() - 1], 1024),
        Some('M') | Some('m') => (&text[..text.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&text[..text.len() - 1], 1024 * 1024 * 1024),
        _ => (text, 1),
    };
    let count: usize = digits.parse().map_err(|_| anyhow::anyhow!("invalid size `{text}`"))?;
    Ok(count * multiplier)
}

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let invocation = match parse_args(&argv) {
        Ok(ParseOutcome::Run(inv)) => inv,
        Ok(ParseOutcome::PrintVersion) => {
            println!("vm {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        Ok(ParseOutcome::PrintUsage) => {
            println!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("vm: {e}");
            eprintln!("{USAGE}");
            return ExitCode::from(0xBC); // BAD_COMMAND, spec.md §7
        }
    };

    match run(invocation) {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("vm: {e}");
            ExitCode::from(0xC1)
        }
    }
}

fn run(invocation: Invocation) -> anyhow::Result<i32> {
    let verr = invocation.options.verr;
    let vm = Vm::new(invocation.options)?;
    let outcome: RunOutcome = vm.run_main(&invocation.main_class, &invocation.args)?;
    if let Some(env) = &outcome.failed_environment {
        if verr {
            vm::print_exception_trace(env);
        } else if let Some(exc) = env.exception() {
            eprintln!("Uncaught {} in {}", exc.error, exc.function_name);
        }
    }
    Ok(outcome.exit_code)
}
