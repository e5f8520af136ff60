//! GEMM to Near-Memory SIMD Compiler CLI
//!
//! Usage:
//!   gemm2pim schedule 4 64 32 --out build/gemm
//!   gemm2pim schedule 1 300 16 --config hw.json --summary build/summary.json
//!   gemm2pim assemble build/gemm.asm --data build/gemm.data --addr build/gemm.addr --trace build/gemm.trace

use clap::{Parser as ClapParser, Subcommand};
use colored::Colorize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use gemm_to_pim::{
    schedule, Assembler, AssemblyReport, CompanionReader, CompileError, CompileResult, GemmWorkload, HwConfig,
    RawTraceWriter, Schedule, StreamKind, Streams,
};

#[derive(ClapParser, Debug)]
#[command(name = "gemm2pim")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Maps GEMM workloads onto a near-memory SIMD accelerator")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Hardware configuration (JSON)
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate assembly and companion streams for C[m x q] = A[m x n] B[n x q]
    Schedule {
        /// Output rows
        m: usize,
        /// Dot-product length
        n: usize,
        /// Output columns
        q: usize,

        /// Initial subword width in bits
        #[arg(short = 'w', long = "subword-width", default_value = "8")]
        subword_width: u32,

        /// CSD digits per constant
        #[arg(short = 'd', long = "digit-len", default_value = "8")]
        digit_len: u32,

        /// Output prefix; writes <prefix>.asm, <prefix>.data and <prefix>.addr
        #[arg(short = 'o', long = "out", default_value = "gemm")]
        out: PathBuf,

        /// Write a JSON schedule summary
        #[arg(short = 's', long = "summary")]
        summary: Option<PathBuf>,
    },

    /// Assemble a program into a raw memory-command trace
    Assemble {
        /// Assembly file
        #[arg(value_name = "ASM")]
        input: PathBuf,

        /// Literal data stream
        #[arg(long = "data")]
        data: Option<PathBuf>,

        /// Address stream
        #[arg(long = "addr")]
        addr: Option<PathBuf>,

        /// Raw trace output
        #[arg(short = 't', long = "trace", default_value = "out.trace")]
        trace: PathBuf,
    },
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => HwConfig::from_json_file(path).unwrap_or_else(|e| {
            eprintln!("{}: Failed to load config '{}': {}", "Error".red(), path.display(), e);
            std::process::exit(1);
        }),
        None => HwConfig::default(),
    };

    match args.command {
        Command::Schedule {
            m,
            n,
            q,
            subword_width,
            digit_len,
            out,
            summary,
        } => {
            let workload = GemmWorkload::new(m, n, q)
                .with_subword_width(subword_width)
                .with_digit_len(digit_len)
                .verbose(args.verbose);
            let program = schedule(&workload, &config).unwrap_or_else(|e| fail("Scheduling error", &e));

            if let Err(e) = write_schedule(&program, &out, summary.as_deref()) {
                fail("Error", &e);
            }
            print_schedule(&program, &out, args.verbose);
        }
        Command::Assemble {
            input,
            data,
            addr,
            trace,
        } => {
            let source = fs::read_to_string(&input).unwrap_or_else(|e| {
                eprintln!("{}: Failed to read file '{}': {}", "Error".red(), input.display(), e);
                std::process::exit(1);
            });

            let report = run_assembler(&source, &config, data.as_deref(), addr.as_deref(), &trace)
                .unwrap_or_else(|e| fail("Assembly error", &e));
            print_report(&report, &input, &trace);
        }
    }
}

fn fail(label: &str, error: &CompileError) -> ! {
    match error.line() {
        Some(line) => eprintln!("{} (line {}): {}", label.red(), line, error),
        None => eprintln!("{}: {}", label.red(), error),
    }
    std::process::exit(1);
}

fn with_extension(prefix: &Path, extension: &str) -> PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(".");
    path.push(extension);
    PathBuf::from(path)
}

fn write_schedule(program: &Schedule, prefix: &Path, summary: Option<&Path>) -> CompileResult<()> {
    fs::write(with_extension(prefix, "asm"), &program.assembly)?;
    fs::write(with_extension(prefix, "data"), program.data_text())?;
    fs::write(with_extension(prefix, "addr"), program.address_text())?;
    if let Some(path) = summary {
        fs::write(path, program.summary.to_json()?)?;
    }
    Ok(())
}

fn open_stream(kind: StreamKind, path: Option<&Path>) -> CompileResult<CompanionReader<BufReader<File>>> {
    Ok(match path {
        Some(path) => CompanionReader::new(kind, BufReader::new(File::open(path)?)),
        None => CompanionReader::missing(kind),
    })
}

fn run_assembler(
    source: &str,
    config: &HwConfig,
    data: Option<&Path>,
    addr: Option<&Path>,
    trace: &Path,
) -> CompileResult<AssemblyReport> {
    config.validate()?;
    let mut streams = Streams::new(
        open_stream(StreamKind::Data, data)?,
        open_stream(StreamKind::Address, addr)?,
    );
    let mut writer = RawTraceWriter::new(BufWriter::new(File::create(trace)?));

    let mut assembler = Assembler::new(config.clone());
    let result = assembler.assemble(source, &mut streams, &mut writer);
    // Keep whatever was written before a failing line
    writer.flush()?;
    result?;
    Ok(assembler.finish(&streams))
}

fn print_schedule(program: &Schedule, prefix: &Path, verbose: bool) {
    let summary = &program.summary;
    println!("{}", "Schedule Results".bold().green());
    println!("{}", "=".repeat(50));
    println!();

    let w = &summary.workload;
    println!("{}: {}x{} @ {}x{}", "Workload".cyan(), w.m, w.n, w.n, w.q);
    println!(
        "{}: SW{}, {} CSD digits, {} pad NOP(s) per multiply",
        "Operands".cyan(),
        w.subword_width,
        w.digit_len,
        summary.pad_nops
    );
    println!("{}: {}", "Mapping".cyan(), summary.mode);
    println!(
        "{}: {} x {} products, remainder {}",
        "Chunks".cyan(),
        summary.full_chunks,
        summary.chunk,
        summary.peel
    );
    println!("{}: {}", "Row tiles".cyan(), summary.row_tiles);
    println!("{}: {} layer(s)", "Adder tree".cyan(), summary.tree.len());
    println!(
        "{}: {} data, {} address records",
        "Streams".cyan(),
        program.data.len(),
        program.addresses.len()
    );
    println!();

    if verbose || summary.passes.len() <= 8 {
        println!("{}", "Pass Details".bold().yellow());
        println!("{}", "-".repeat(50));
        for (id, pass) in summary.passes.iter().enumerate() {
            println!(
                "{} {}: {:?}, {} entries x {} iteration(s), {} exec(s), {} -> {} partial sums",
                "Pass".bold(),
                id.to_string().bold(),
                pass.kind,
                pass.body_len,
                pass.iterations,
                pass.execs,
                pass.operands_in,
                pass.operands_out
            );
        }
        println!();
    } else {
        println!("({} passes, use -v for details)", summary.passes.len());
    }

    for warning in &summary.warnings {
        println!("{}: {}", "Warning".yellow(), warning);
    }
    println!(
        "{}: {}.{{asm,data,addr}}",
        "Written".cyan(),
        prefix.display()
    );
}

fn print_report(report: &AssemblyReport, input: &Path, trace: &Path) {
    let stats = &report.stats;
    println!("{}", "Assembly Results".bold().green());
    println!("{}", "=".repeat(50));
    println!();
    println!("{}: {}", "Input".cyan(), input.display());
    println!("{}: {}", "Instruction buffer writes".cyan(), stats.ib_writes);
    println!("{}: {}", "Register file writes".cyan(), stats.rf_writes + stats.loop_writes);
    println!("{}: {}", "Executions".cyan(), stats.execs);
    println!(
        "{}: {} data, {} address",
        "Companion records".cyan(),
        stats.data_records,
        stats.address_records
    );
    println!("{}: {} -> {}", "Trace records".cyan(), stats.trace_records, trace.display());

    for diagnostic in &report.diagnostics {
        println!("{}: {}", "Warning".yellow(), diagnostic);
    }
}
