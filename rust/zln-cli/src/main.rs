//! zln: command-line runner for zlang program images.

mod config;
mod report;

use clap::{Parser as ClapParser, Subcommand};
use config::ZlnConfig;
use report::{ErrorReport, RunReport, ValidateReport};
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use zln_vm::program::{DEFAULT_HEAP_SIZE, HEADER_SIZE};
use zln_vm::{opcode, LoadedProgram, ProgramHeader, RuntimeConfig, VmError};

// ---------------------------------------------------------------------------
// ANSI color helpers
// ---------------------------------------------------------------------------

fn green(s: &str) -> String {
    format!("\x1b[32m{}\x1b[0m", s)
}
fn red(s: &str) -> String {
    format!("\x1b[31m{}\x1b[0m", s)
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{}\x1b[0m", s)
}
fn gray(s: &str) -> String {
    format!("\x1b[90m{}\x1b[0m", s)
}
fn status_label(label: &str) -> String {
    format!("{:>12}", bold(&green(label)))
}

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(ClapParser)]
#[command(name = "zln", version, about = "Runner for zlang bytecode images")]
struct Cli {
    /// Read settings from this file instead of searching for zln.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a program image
    Run {
        /// Path to the image
        file: PathBuf,
        /// Print every instruction before it executes
        #[arg(long)]
        trace: bool,
        /// Heap bytes, overriding the image header and zln.toml
        #[arg(long)]
        heap_size: Option<usize>,
        /// List heap entries after the run
        #[arg(long)]
        dump_heap: bool,
        /// Emit a JSON report instead of plain output
        #[arg(long)]
        json: bool,
    },
    /// Print the code segment of an image as assembly
    Disasm {
        /// Path to the image
        file: PathBuf,
    },
    /// Check an image header without running it
    Validate {
        /// Path to the image
        file: PathBuf,
        /// Emit a JSON report
        #[arg(long)]
        json: bool,
    },
    /// Write a default zln.toml into the current directory
    Init,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("cannot read '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Already reported to the user; only the exit status remains.
    #[error("")]
    Reported,
}

fn main() {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match ZlnConfig::load_from(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{} {}", red("error:"), e);
                std::process::exit(1);
            }
        },
        None => ZlnConfig::load(),
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run {
            file,
            trace,
            heap_size,
            dump_heap,
            json,
        } => cmd_run(
            &file,
            RunOptions {
                trace: trace || config.runtime.trace,
                heap_size: heap_size.or(config.runtime.heap_size),
                dump_heap,
                json,
            },
        ),
        Commands::Disasm { file } => cmd_disasm(&file),
        Commands::Validate { file, json } => cmd_validate(&file, json),
        Commands::Init => cmd_init(),
    };

    match result {
        Ok(()) => {}
        Err(CliError::Reported) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {}", red("error:"), e);
            std::process::exit(1);
        }
    }
}

fn read_image(path: &Path) -> Result<Vec<u8>, CliError> {
    std::fs::read(path).map_err(|source| CliError::Read {
        path: path.display().to_string(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

struct RunOptions {
    trace: bool,
    heap_size: Option<usize>,
    dump_heap: bool,
    json: bool,
}

fn cmd_run(path: &Path, opts: RunOptions) -> Result<(), CliError> {
    let image = read_image(path)?;
    let mut program = LoadedProgram::from_image(&image, opts.heap_size)?;
    debug!(
        file = %path.display(),
        heap_size = program.memory().len() - program.layout().heap_offset(),
        "image loaded"
    );

    let steps = Rc::new(Cell::new(0u64));
    let output = Rc::new(RefCell::new(Vec::new()));

    let step_counter = Rc::clone(&steps);
    let trace = opts.trace;
    let mut runtime = RuntimeConfig::new().with_debug_callback(move |step| {
        step_counter.set(step_counter.get() + 1);
        if trace {
            eprintln!(
                "{} {:<16} {:>6}  {:<28} {:?}",
                gray(&format!("[{:>3}]", step.stack_depth)),
                step.function,
                step.pc,
                step.instruction.to_string(),
                step.registers
            );
        }
    });
    if opts.json {
        let sink = Rc::clone(&output);
        runtime = runtime.with_print_callback(move |text| sink.borrow_mut().push(text.to_string()));
    } else {
        runtime = runtime.with_print_callback(|text| println!("{}", text));
    }

    let result = program.run(runtime);

    let heap = if opts.dump_heap {
        Some(report::heap_entries(&program.heap())?)
    } else {
        None
    };

    if opts.json {
        let report = RunReport {
            file: path.display().to_string(),
            success: result.is_ok(),
            steps: steps.get(),
            heap_offset: result.as_ref().ok().copied(),
            error: result.as_ref().err().map(ErrorReport::from),
            output: output.take(),
            heap,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return match result {
            Ok(_) => Ok(()),
            Err(_) => Err(CliError::Reported),
        };
    }

    if let Some(entries) = heap {
        eprintln!("{}", bold("heap:"));
        for e in &entries {
            let text = e
                .text
                .as_ref()
                .map(|t| format!(" {:?}", t))
                .unwrap_or_default();
            eprintln!(
                "  {:>8}  {:<16} refs={:<3} data={:<6} alloc={:<6}{}",
                e.entry.addr,
                e.type_name,
                e.entry.ref_count,
                e.entry.data_size,
                e.entry.alloc_size,
                gray(&text)
            );
        }
    }

    result?;
    eprintln!(
        "{} {} ({} steps)",
        status_label("Finished"),
        path.display(),
        steps.get()
    );
    Ok(())
}

fn cmd_disasm(path: &Path) -> Result<(), CliError> {
    let image = read_image(path)?;
    let header = ProgramHeader::decode(&image)?;
    header.validate()?;
    let code_end = HEADER_SIZE + header.code_segment_size as usize;
    let code = image.get(HEADER_SIZE..code_end).ok_or_else(|| {
        VmError::InvalidHeader(format!(
            "code segment of {} bytes runs past the end of the image",
            header.code_segment_size
        ))
    })?;

    println!(
        "{}",
        gray(&format!(
            "; {} bytes of code, entry point {}",
            header.code_segment_size, header.entry_point_address
        ))
    );
    for (offset, instr) in opcode::disassemble(code)? {
        println!("{:>6}: {}", offset, instr);
    }
    Ok(())
}

fn cmd_validate(path: &Path, json: bool) -> Result<(), CliError> {
    let image = read_image(path)?;
    let header = ProgramHeader::decode(&image)?;
    let verdict = header.validate();

    if json {
        let report = ValidateReport {
            file: path.display().to_string(),
            valid: verdict.is_ok(),
            header,
            layout: header.layout(),
            error: verdict.as_ref().err().map(|e| e.to_string()),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return verdict.map_err(|_| CliError::Reported);
    }

    verdict?;
    let layout = header.layout();
    println!(
        "{} {} (version {}.{})",
        status_label("Valid"),
        path.display(),
        header.major_version,
        header.minor_version
    );
    println!("  code:       {} bytes", layout.code_segment_size);
    println!("  consts:     {} bytes", layout.const_segment_size);
    println!("  globals:    {} bytes", layout.global_segment_size);
    println!("  registers:  {}", layout.register_count);
    println!("  max depth:  {}", layout.max_stack_depth);
    match layout.max_heap_size {
        0 => println!("  heap:       default ({} bytes)", DEFAULT_HEAP_SIZE),
        n => println!("  heap:       {} bytes", n),
    }
    println!("  entry:      {}", header.entry_point_address);
    Ok(())
}

fn cmd_init() -> Result<(), CliError> {
    let path = Path::new(config::CONFIG_FILE);
    if path.exists() {
        return Err(CliError::Config(format!(
            "{} already exists",
            config::CONFIG_FILE
        )));
    }
    std::fs::write(path, ZlnConfig::default_template())
        .map_err(|e| CliError::Config(format!("cannot write '{}': {}", path.display(), e)))?;
    println!("{} {}", status_label("Created"), config::CONFIG_FILE);
    Ok(())
}
