use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use clap::Parser;

use kuroko::diagnostic::{Diagnostic, ansi::AnsiRenderer, json, registry};
use kuroko::modules::register_host_modules;
use kuroko::value::Value;
use kuroko::{Vm, VmConfig};

#[derive(Parser, Debug)]
#[command(name = "kuroko", version)]
#[command(about = "Run a compiled kuroko code file")]
struct Args {
    /// Compiled code file (JSON)
    file: Option<PathBuf>,

    /// Arguments exposed to the program as `kuroko.argv`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Log every executed instruction
    #[arg(short = 't', long)]
    trace: bool,

    /// Collect garbage at every safe point
    #[arg(short = 'g', long = "stress-gc")]
    stress_gc: bool,

    /// Add a directory to the module search path
    #[arg(short = 'I', long = "module-path")]
    module_path: Vec<PathBuf>,

    /// Print the module search path and exit
    #[arg(short = 'M', long = "module-paths")]
    module_paths: bool,

    /// Report uncaught exceptions as JSON on stderr
    #[arg(long)]
    json: bool,

    /// Explain an error code (e.g. KRK-E004) and exit
    #[arg(long, value_name = "CODE")]
    explain: Option<String>,
}

static INTERRUPT: OnceLock<Arc<AtomicBool>> = OnceLock::new();

#[cfg(unix)]
extern "C" fn on_sigint(_: libc::c_int) {
    if let Some(flag) = INTERRUPT.get() {
        flag.store(true, Ordering::Relaxed);
    }
}

#[cfg(unix)]
fn install_interrupt_handler(flag: Arc<AtomicBool>) {
    if INTERRUPT.set(flag).is_ok() {
        let handler = on_sigint as extern "C" fn(libc::c_int);
        unsafe {
            libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        }
    }
}

#[cfg(not(unix))]
fn install_interrupt_handler(flag: Arc<AtomicBool>) {
    let _ = INTERRUPT.set(flag);
}

fn init_logging(trace: bool) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if trace {
        builder.filter_level(log::LevelFilter::Trace);
    }
    builder.format_timestamp(None).init();
}

fn report(d: &Diagnostic, as_json: bool) {
    if as_json {
        eprintln!("{}", json::render(d));
    } else {
        let renderer = AnsiRenderer { use_color: std::io::stderr().is_terminal() };
        eprint!("{}", renderer.render(d));
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.trace);

    if let Some(code) = &args.explain {
        match registry::lookup(code) {
            Some(entry) => {
                println!("{}", entry.long);
                return;
            }
            None => {
                eprintln!("unknown error code '{code}'");
                process::exit(1);
            }
        }
    }

    let mut module_paths = VmConfig::default().module_paths;
    module_paths.extend(args.module_path.iter().cloned());
    if args.module_paths {
        for path in &module_paths {
            println!("{}", path.display());
        }
        return;
    }

    let Some(file) = args.file else {
        eprintln!("Usage: kuroko [OPTIONS] <FILE> [ARGS]...");
        process::exit(2);
    };

    let config = VmConfig { module_paths, trace: args.trace, stress_gc: args.stress_gc, ..VmConfig::default() };
    let mut vm = Vm::new(config);
    install_interrupt_handler(vm.interrupt_handle());

    let mut argv = vec![file.display().to_string()];
    argv.extend(args.args);
    register_host_modules(&mut vm, argv);

    match vm.run_file(&file) {
        Ok(Value::None) => {}
        Ok(result) => match vm.stringify(result) {
            Ok(text) => println!("{text}"),
            Err(err) => {
                report(&Diagnostic::from(&err), args.json);
                process::exit(1);
            }
        },
        Err(err) => {
            report(&Diagnostic::from(&err), args.json);
            process::exit(1);
        }
    }
}
