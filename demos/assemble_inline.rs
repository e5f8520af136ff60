//! Example: assembling a hand-written program
//!
//! Loads two constants, multiplies two words in place and adds them,
//! looping the body three times. Operands are literals so no companion
//! files are needed.
//!
//! Run with: cargo run --example assemble_inline

use gemm_to_pim::{assemble, HwConfig, RawTraceWriter, Streams};

const PROGRAM: &str = "\
; constants and row addresses are inline
WRF DLEN0 0x8
WRF IB0
GLMV CSD_0 0x80 0x5
GLMV CSD_1 0xc0 0x11
RLB VWR_0 0x100
RLB VWR_1 0x140
VFUX MUL SW8 VWR_0[0] VWR_0[0] CSD_0
VFUX MUL SW8 VWR_1[0] VWR_1[0] CSD_1
VMV R1 VWR_0[0]
VMV R2 VWR_1[0]
VFUX ADD SW8 R0 R1R2
VMV VWR_0[16] R0
WLB VWR_0 0x180
NOP EXIT
LOOP 0 10 3
EXEC
";

fn main() {
    println!("=== Inline Assembly Example ===\n");

    let config = HwConfig::default();
    let mut streams = Streams::from_text("", "");
    let mut writer = RawTraceWriter::new(Vec::new());
    let report = assemble(PROGRAM, &config, &mut streams, &mut writer).unwrap();

    println!("Instruction buffer writes: {}", report.stats.ib_writes);
    println!("Trace records: {}\n", report.stats.trace_records);
    print!("{}", String::from_utf8_lossy(&writer.into_inner()));
}
