//! GEMM to Near-Memory SIMD Compiler
//!
//! This library maps a dense matrix product onto a near-memory SIMD
//! accelerator. The scheduler tiles the workload, plans the adder tree that
//! reduces the partial products and emits assembly with its companion data
//! and address streams. The assembler turns that assembly into the raw
//! memory-command trace the accelerator would see.
//!
//! # Example
//!
//! ```rust
//! use gemm_to_pim::{assemble, schedule, GemmWorkload, HwConfig, Streams};
//!
//! let config = HwConfig::default();
//! let program = schedule(&GemmWorkload::new(2, 16, 24), &config).unwrap();
//!
//! let data = program.data_text();
//! let addresses = program.address_text();
//! let mut streams = Streams::from_text(&data, &addresses);
//! let mut trace = Vec::new();
//! let report = assemble(&program.assembly, &config, &mut streams, &mut trace).unwrap();
//! assert_eq!(report.stats.trace_records, trace.len());
//! ```

pub mod adder_tree;
pub mod assembler;
pub mod codec;
pub mod codegen;
pub mod companion;
pub mod error;
pub mod hardware;
pub mod isa;
pub mod lexer;
pub mod parser;
pub mod reduction;
pub mod tiling;
pub mod trace;

use std::io::BufRead;

use tracing::info;

pub use adder_tree::{plan_adder_tree, AddTreeLayer, AdderTree};
pub use assembler::{Assembler, AssemblyReport, AssemblyStats};
pub use codegen::{CodeGenerator, PassKind, PassSummary, Schedule, ScheduleSummary};
pub use companion::{CompanionReader, StreamKind, Streams};
pub use error::{CompileError, CompileResult, Diagnostic, ErrorCategory};
pub use hardware::{AddressMap, DirectionPolicy, HwConfig};
pub use isa::{Instruction, LoopRegister, MacroInstr};
pub use tiling::{ChunkPlan, GemmWorkload, MapMode, TilingStrategy};
pub use trace::{MemCommand, RawTraceWriter, TraceSink};

/// Schedule a GEMM workload into assembly and companion streams
pub fn schedule(workload: &GemmWorkload, config: &HwConfig) -> CompileResult<Schedule> {
    config.validate()?;

    // Pick the chunk size and plan the tree
    let tiler = TilingStrategy::new(config.clone());
    let plan = tiler.plan(workload)?;
    info!(
        "m={} n={} q={}: chunk {} ({}), {} full, peel {}",
        workload.m, workload.n, workload.q, plan.chunk, plan.mode, plan.full_chunks, plan.peel
    );

    // Emit the passes
    CodeGenerator::new(config.clone(), workload, &plan).generate()
}

/// Assemble `source` into `sink`, reading operands from `streams`.
///
/// Records emitted before a failing line stay in the sink.
pub fn assemble<D, A, S>(
    source: &str,
    config: &HwConfig,
    streams: &mut Streams<D, A>,
    sink: &mut S,
) -> CompileResult<AssemblyReport>
where
    D: BufRead,
    A: BufRead,
    S: TraceSink,
{
    config.validate()?;
    let mut assembler = Assembler::new(config.clone());
    assembler.assemble(source, streams, sink)?;
    Ok(assembler.finish(streams))
}
