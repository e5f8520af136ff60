//! Assembler for accelerator assembly text
//!
//! Each line either stages an instruction in the buffer, writes a register
//! file, programs the hardware loop or runs the staged program. Every
//! staging and register write is itself a memory command, so the trace
//! starts with the writes that load the program.

use std::io::BufRead;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::{self, LOOP_COUNT_BITS};
use crate::companion::Streams;
use crate::error::{CompileError, CompileResult, Diagnostic};
use crate::hardware::{HwConfig, RegFile};
use crate::isa::{DataOperand, Direction, Instruction, LoopRegister};
use crate::parser::{parse_line, Statement};
use crate::trace::{IbEntry, MemCommand, TraceSimulator, TraceSink};

/// Counters reported after a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyStats {
    pub ib_writes: usize,
    pub rf_writes: usize,
    pub loop_writes: usize,
    pub execs: usize,
    pub trace_records: usize,
    pub data_records: usize,
    pub address_records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyReport {
    pub stats: AssemblyStats,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    /// Staging instructions from `next` on
    IbWrite { next: usize },
}

/// Line-by-line assembler with its simulated instruction buffer
pub struct Assembler {
    config: HwConfig,
    mode: Mode,
    ib: Vec<Option<IbEntry>>,
    lr: LoopRegister,
    simulator: TraceSimulator,
    stats: AssemblyStats,
    diagnostics: Vec<Diagnostic>,
}

impl Assembler {
    pub fn new(config: HwConfig) -> Self {
        Self {
            ib: vec![None; config.ib_entries],
            simulator: TraceSimulator::new(config.clone()),
            config,
            mode: Mode::Idle,
            lr: LoopRegister::default(),
            stats: AssemblyStats::default(),
            diagnostics: Vec::new(),
        }
    }

    pub fn loop_register(&self) -> LoopRegister {
        self.lr
    }

    /// Assemble a whole file, stopping at the first error
    pub fn assemble<D, A, S>(
        &mut self,
        source: &str,
        streams: &mut Streams<D, A>,
        sink: &mut S,
    ) -> CompileResult<()>
    where
        D: BufRead,
        A: BufRead,
        S: TraceSink,
    {
        for (i, text) in source.lines().enumerate() {
            self.assemble_line(i + 1, text, streams, sink)?;
        }
        Ok(())
    }

    pub fn assemble_line<D, A, S>(
        &mut self,
        line: usize,
        text: &str,
        streams: &mut Streams<D, A>,
        sink: &mut S,
    ) -> CompileResult<()>
    where
        D: BufRead,
        A: BufRead,
        S: TraceSink,
    {
        let Some(statement) = parse_line(line, text)? else {
            return Ok(());
        };

        match statement {
            Statement::Wrf {
                target: RegFile::InstrBuffer,
                index,
                ..
            } => {
                if index >= self.config.ib_entries {
                    return Err(CompileError::capacity(line, "instruction buffer", index, self.config.ib_entries));
                }
                self.mode = Mode::IbWrite { next: index };
            }
            Statement::Wrf { target, index, values } => {
                self.write_register(line, target, index, values, streams, sink)?;
            }
            Statement::Instr(instr) => self.stage(line, instr, sink)?,
            Statement::Loop(lr) => self.write_loop(line, lr, sink)?,
            Statement::Exec => {
                let records = self.simulator.execute(&self.ib, &self.lr, streams, sink, line)?;
                debug!("line {}: EXEC produced {} records", line, records);
                self.stats.execs += 1;
                self.stats.trace_records += records;
                self.mode = Mode::Idle;
            }
        }
        Ok(())
    }

    fn stage<S: TraceSink>(&mut self, line: usize, instr: Instruction, sink: &mut S) -> CompileResult<()> {
        let Mode::IbWrite { next } = self.mode else {
            return Err(CompileError::grammar(
                line,
                format!("'{}' outside an instruction-buffer write, expected WRF IB<n> first", instr),
            ));
        };
        if next >= self.config.ib_entries {
            return Err(CompileError::capacity(line, "instruction buffer", next, self.config.ib_entries));
        }

        for overflow in codec::overflows(&instr.op) {
            let message = format!("IB{}: {}", next, overflow);
            warn!("line {}: {}", line, message);
            self.diagnostics.push(Diagnostic::new(Some(line), message));
        }

        let entry = IbEntry::new(instr);
        let address = self
            .config
            .address_map
            .register_file_address(RegFile::InstrBuffer, next);
        self.emit(sink, MemCommand::new(address, Direction::Write, vec![entry.word as u64]))?;
        self.ib[next] = Some(entry);
        self.stats.ib_writes += 1;
        self.mode = Mode::IbWrite { next: next + 1 };
        Ok(())
    }

    fn write_register<D, A, S>(
        &mut self,
        line: usize,
        target: RegFile,
        index: usize,
        values: Option<DataOperand>,
        streams: &mut Streams<D, A>,
        sink: &mut S,
    ) -> CompileResult<()>
    where
        D: BufRead,
        A: BufRead,
        S: TraceSink,
    {
        let capacity = target.capacity(&self.config);
        if index >= capacity {
            return Err(CompileError::capacity(line, target.prefix(), index, capacity));
        }

        let words = match values {
            Some(DataOperand::Literal(words)) => words,
            Some(DataOperand::File) => streams.data.next_record(line)?,
            None => {
                let message = format!("WRF {}{} needs a value", target.prefix(), index);
                return Err(CompileError::grammar(line, message));
            }
        };
        if words.len() != target.literal_width() {
            return Err(CompileError::grammar(
                line,
                format!(
                    "{} takes {} word(s), got {}",
                    target.prefix(),
                    target.literal_width(),
                    words.len()
                ),
            ));
        }

        if target == RegFile::LoopReg {
            let (start, end, iterations) = codec::decode_loop(words[0]);
            self.lr = LoopRegister::new(start, end, iterations);
        }

        let address = self.config.address_map.register_file_address(target, index);
        self.emit(sink, MemCommand::new(address, Direction::Write, words))?;
        self.stats.rf_writes += 1;
        Ok(())
    }

    fn write_loop<S: TraceSink>(&mut self, line: usize, lr: LoopRegister, sink: &mut S) -> CompileResult<()> {
        if lr.end >= self.config.ib_entries {
            return Err(CompileError::capacity(line, "loop end", lr.end, self.config.ib_entries));
        }
        if lr.start > lr.end {
            return Err(CompileError::grammar(
                line,
                format!("loop start {} is past its end {}", lr.start, lr.end),
            ));
        }
        if lr.iterations >> LOOP_COUNT_BITS != 0 {
            let message = format!(
                "loop count {} truncated to {} bits",
                lr.iterations, LOOP_COUNT_BITS
            );
            warn!("line {}: {}", line, message);
            self.diagnostics.push(Diagnostic::new(Some(line), message));
        }

        let word = codec::encode_loop(lr.start, lr.end, lr.iterations);
        let (start, end, iterations) = codec::decode_loop(word);
        self.lr = LoopRegister::new(start, end, iterations);

        let address = self
            .config
            .address_map
            .register_file_address(RegFile::LoopReg, 0);
        self.emit(sink, MemCommand::new(address, Direction::Write, vec![word]))?;
        self.stats.loop_writes += 1;
        Ok(())
    }

    fn emit<S: TraceSink>(&mut self, sink: &mut S, command: MemCommand) -> CompileResult<()> {
        sink.record(command)?;
        self.stats.trace_records += 1;
        Ok(())
    }

    pub fn finish<D: BufRead, A: BufRead>(self, streams: &Streams<D, A>) -> AssemblyReport {
        let mut stats = self.stats;
        stats.data_records = streams.data.consumed();
        stats.address_records = streams.addresses.consumed();
        AssemblyReport {
            stats,
            diagnostics: self.diagnostics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::isa::MacroInstr;
    use pretty_assertions::assert_eq;

    fn run(source: &str, data: &str, addrs: &str) -> (CompileResult<()>, Vec<MemCommand>, AssemblyReport) {
        let mut asm = Assembler::new(HwConfig::default());
        let mut streams = Streams::from_text(data, addrs);
        let mut out = Vec::new();
        let result = asm.assemble(source, &mut streams, &mut out);
        let report = asm.finish(&streams);
        (result, out, report)
    }

    #[test]
    fn test_ib_index_out_of_range_writes_nothing() {
        let (result, out, _) = run("WRF IB64\nNOP\n", "", "");
        let err = result.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Resource);
        assert_eq!(err.line(), Some(1));
        assert!(out.is_empty());
    }

    #[test]
    fn test_single_staged_instruction() {
        let (result, out, report) = run("WRF IB0\nVFUX MUL SW8 VWR_0[2] VWR_0[2] CSD_3\n", "", "");
        result.unwrap();
        let map = HwConfig::default().address_map;
        let word = codec::encode(&MacroInstr::mul(8, 0, 2, 3));
        assert_eq!(
            out,
            vec![MemCommand::new(
                map.register_file_address(RegFile::InstrBuffer, 0),
                Direction::Write,
                vec![word as u64]
            )]
        );
        assert_eq!(report.stats.data_records + report.stats.address_records, 0);
        assert_eq!(report.stats.ib_writes, 1);
    }

    #[test]
    fn test_instruction_outside_write_mode() {
        let (result, out, _) = run("; header\nNOP\n", "", "");
        let err = result.unwrap_err();
        assert!(matches!(err, CompileError::Grammar { line: 2, .. }));
        assert!(out.is_empty());

        // EXEC closes the staging window
        let (result, _, _) = run("WRF IB0\nNOP EXIT\nEXEC\nNOP\n", "", "");
        assert!(matches!(result, Err(CompileError::Grammar { line: 4, .. })));
    }

    #[test]
    fn test_register_file_writes() {
        let (result, out, report) = run(
            "WRF SRF1 0x10\nWRF MRF0 DataFile\nWRF DLEN0 8\n",
            "1 2 3 4\n",
            "",
        );
        result.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].payload, vec![1, 2, 3, 4]);
        assert_eq!(report.stats.rf_writes, 3);
        assert_eq!(report.stats.data_records, 1);

        let (result, _, _) = run("WRF SRF1 1 2\n", "", "");
        assert!(matches!(result, Err(CompileError::Grammar { line: 1, .. })));
        let (result, _, _) = run("WRF SRF4 1\n", "", "");
        assert!(matches!(result, Err(CompileError::Capacity { index: 4, .. })));
        let (result, _, _) = run("WRF CSD0 DataFile\n", "", "");
        assert!(matches!(result, Err(CompileError::StreamExhausted { line: 1, .. })));
    }

    #[test]
    fn test_loop_register_writes() {
        let mut asm = Assembler::new(HwConfig::default());
        let mut streams = Streams::from_text("", "");
        let mut out = Vec::new();
        asm.assemble("LOOP 2 9 100\n", &mut streams, &mut out).unwrap();
        assert_eq!(asm.loop_register(), LoopRegister::new(2, 9, 100));
        assert_eq!(out[0].payload, vec![codec::encode_loop(2, 9, 100)]);

        let word = codec::encode_loop(0, 3, 7);
        asm.assemble(&format!("WRF LR0 {:#x}\n", word), &mut streams, &mut out)
            .unwrap();
        assert_eq!(asm.loop_register(), LoopRegister::new(0, 3, 7));

        let (result, _, _) = run("LOOP 0 64 1\n", "", "");
        assert!(matches!(result, Err(CompileError::Capacity { .. })));
        let (result, _, _) = run("LOOP 5 4 1\n", "", "");
        assert!(matches!(result, Err(CompileError::Grammar { .. })));
    }

    #[test]
    fn test_exec_replays_loop() {
        let source = "\
WRF IB0
RLB VWR_0 AddrFile
VFUX MUL SW8 VWR_0[0] VWR_0[0] CSD_0
WLB VWR_0 AddrFile
NOP EXIT
LOOP 0 2 3
EXEC
";
        let (result, out, report) = run(source, "", "0x10\n0x20\n0x30\n0x40\n0x50\n0x60\n");
        result.unwrap();
        // Four staging writes, one loop write, three passes and the exit
        assert_eq!(out.len(), 4 + 1 + 3 * 3 + 1);
        assert_eq!(report.stats.execs, 1);
        assert_eq!(report.stats.address_records, 6);
        assert_eq!(report.stats.trace_records, out.len());

        let executed = &out[5..];
        assert_eq!(executed[0], MemCommand::new(0x10, Direction::Read, vec![]));
        assert_eq!(executed[1].address, 0x10);
        assert_eq!(executed[2], MemCommand::new(0x20, Direction::Write, vec![]));
        assert_eq!(executed[3].address, 0x30);
    }

    #[test]
    fn test_truncation_is_a_diagnostic() {
        let (result, out, report) = run("WRF IB5\nVMV R1 VWR_0[40]\n", "", "");
        result.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].line, Some(2));
    }

    #[test]
    fn test_error_keeps_earlier_records() {
        let (result, out, _) = run("WRF IB0\nNOP\nBOGUS 1\nNOP\n", "", "");
        assert!(matches!(result, Err(CompileError::UnknownMnemonic { line: 3, .. })));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_staging_past_the_end() {
        let (result, out, _) = run("WRF IB63\nNOP\nNOP\n", "", "");
        assert!(matches!(result, Err(CompileError::Capacity { line: 3, index: 64, .. })));
        assert_eq!(out.len(), 1);
    }
}
