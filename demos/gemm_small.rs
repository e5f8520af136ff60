//! Example: scheduling a small GEMM
//!
//! Schedules a 2x16 @ 16x24 product, prints the generated assembly and
//! replays it through the assembler.
//!
//! Run with: cargo run --example gemm_small

use gemm_to_pim::{assemble, schedule, GemmWorkload, HwConfig, Streams};

fn main() {
    println!("=== Small GEMM Example ===\n");

    let config = HwConfig::default();
    let workload = GemmWorkload::new(2, 16, 24).verbose(true);
    let program = schedule(&workload, &config).unwrap();

    println!("Mapping: {}", program.summary.mode);
    println!(
        "Chunks: {} x {} products, remainder {}\n",
        program.summary.full_chunks, program.summary.chunk, program.summary.peel
    );
    println!("{}", program.assembly);

    let data = program.data_text();
    let addresses = program.address_text();
    let mut streams = Streams::from_text(&data, &addresses);
    let mut trace = Vec::new();
    let report = assemble(&program.assembly, &config, &mut streams, &mut trace).unwrap();

    println!("Trace records: {}", report.stats.trace_records);
    println!(
        "Companion records: {} data, {} address",
        report.stats.data_records, report.stats.address_records
    );
    println!("\nFirst commands:");
    for command in trace.iter().take(8) {
        println!("  {}", command);
    }
}
