use std::env;
use std::path::PathBuf;
use std::process;
use std::thread;

use marl_core::error::format_error;
use marl_core::interrupt;
use marl_core::options::EvalOptions;
use marl_lang::{run, RunRequest};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::flag;

/// The dispatcher is recursive, so evaluation runs on a worker thread with a
/// stack sized well past the configured recursion ceiling.
const EVAL_STACK_SIZE: usize = 256 * 1024 * 1024;

fn help() -> ! {
    println!("Usage: marl [--strict] [--read-only] [--version] [-e CODE] [file]");
    println!();
    println!("Options:");
    println!("  -e CODE         Evaluate CODE instead of a file");
    println!("  --strict        Force the whole result, not just its head");
    println!("  --read-only     Compute store paths without writing to the store");
    println!("  --version       Show version");
    println!("  -h, --help      Show this help");
    std::process::exit(0);
}

fn unknown_option(opt: &str) -> ! {
    eprintln!("unknown option: {}", opt);
    help();
}

fn main() {
    let mut source: Option<String> = None;
    let mut file: Option<PathBuf> = None;
    let mut strict = false;
    let mut read_only = false;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => help(),
            "--version" => {
                println!("marl {}", env!("CARGO_PKG_VERSION"));
                return;
            }
            "--strict" => strict = true,
            "--read-only" => read_only = true,
            "-e" => match args.next() {
                Some(code) => source = Some(code),
                None => {
                    eprintln!("-e requires an argument");
                    process::exit(2);
                }
            },
            other if other.starts_with('-') => unknown_option(other),
            other => {
                if file.is_some() {
                    eprintln!("only one file may be evaluated at a time");
                    process::exit(2);
                }
                file = Some(PathBuf::from(other));
            }
        }
    }

    if source.is_none() && file.is_none() {
        eprintln!("nothing to evaluate; pass a file or -e CODE");
        process::exit(2);
    }

    for signal in [SIGINT, SIGTERM] {
        let _ = flag::register(signal, interrupt::interrupt_flag());
    }

    let request = RunRequest {
        source,
        file,
        strict,
        options: EvalOptions {
            read_only,
            ..EvalOptions::default()
        },
    };

    let worker = thread::Builder::new()
        .name("eval".into())
        .stack_size(EVAL_STACK_SIZE)
        .spawn(move || run(&request))
        .expect("failed to spawn evaluation thread");

    match worker.join() {
        Ok(Ok(rendered)) => println!("{}", rendered),
        Ok(Err(err)) => {
            for line in format_error(&err) {
                eprintln!("{}", line);
            }
            process::exit(1);
        }
        Err(_) => {
            eprintln!("evaluation thread panicked");
            process::exit(1);
        }
    }
}
