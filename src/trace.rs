//! Execution-trace simulator
//!
//! Replays the staged instruction buffer the way the accelerator's
//! sequencer would and records one memory command per visited entry.
//! Addresses and payloads come from literals captured at assembly time or
//! from the companion streams.

use std::fmt;
use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::codec;
use crate::companion::Streams;
use crate::error::{CompileError, CompileResult};
use crate::hardware::{AddressTuple, DirectionPolicy, HwConfig};
use crate::isa::{AddrOperand, DataOperand, Direction, Instruction, LoopRegister, Opcode};

/// One record of the raw trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemCommand {
    pub address: u64,
    pub direction: Direction,
    pub payload: Vec<u64>,
}

impl MemCommand {
    pub fn new(address: u64, direction: Direction, payload: Vec<u64>) -> Self {
        Self {
            address,
            direction,
            payload,
        }
    }
}

impl fmt::Display for MemCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}\t{}", self.address, self.direction)?;
        if !self.payload.is_empty() {
            let words: Vec<String> = self.payload.iter().map(|w| format!("{:#x}", w)).collect();
            write!(f, "\t{}", words.join(" "))?;
        }
        Ok(())
    }
}

/// Destination for memory commands
pub trait TraceSink {
    fn record(&mut self, command: MemCommand) -> CompileResult<()>;
}

impl TraceSink for Vec<MemCommand> {
    fn record(&mut self, command: MemCommand) -> CompileResult<()> {
        self.push(command);
        Ok(())
    }
}

/// Writes the tab-delimited raw trace format
pub struct RawTraceWriter<W: Write> {
    out: W,
    records: usize,
}

impl<W: Write> RawTraceWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, records: 0 }
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn flush(&mut self) -> CompileResult<()> {
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> TraceSink for RawTraceWriter<W> {
    fn record(&mut self, command: MemCommand) -> CompileResult<()> {
        writeln!(self.out, "{}", command)?;
        self.records += 1;
        Ok(())
    }
}

/// One staged instruction-buffer entry: the packed word as the hardware
/// holds it, plus the memory operands captured from its assembly line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IbEntry {
    pub word: u32,
    pub instr: Instruction,
}

impl IbEntry {
    pub fn new(instr: Instruction) -> Self {
        Self {
            word: codec::encode(&instr.op),
            instr,
        }
    }
}

/// Sequencer state that survives between `EXEC`s
pub struct TraceSimulator {
    config: HwConfig,
    last: AddressTuple,
    last_direction: Direction,
}

impl TraceSimulator {
    pub fn new(config: HwConfig) -> Self {
        Self {
            config,
            last: AddressTuple::default(),
            last_direction: Direction::Read,
        }
    }

    /// Run the staged program once. `line` is the `EXEC` line, used in
    /// errors. Returns the number of records produced.
    pub fn execute<D, A, S>(
        &mut self,
        ib: &[Option<IbEntry>],
        lr: &LoopRegister,
        streams: &mut Streams<D, A>,
        sink: &mut S,
        line: usize,
    ) -> CompileResult<usize>
    where
        D: BufRead,
        A: BufRead,
        S: TraceSink,
    {
        let limit = self.config.ib_entries.min(ib.len());
        let looping = lr.start <= lr.end;
        let mut remaining = lr.iterations.saturating_sub(1);
        let mut pc = 0;
        let mut records = 0;

        while pc < limit {
            let Some(entry) = &ib[pc] else {
                break;
            };
            let op = codec::decode(entry.word).ok_or_else(|| {
                CompileError::grammar(
                    line,
                    format!("instruction buffer entry {} holds undecodable word {:#x}", pc, entry.word),
                )
            })?;

            let command = self.step(op.opcode(), &entry.instr, streams, line)?;
            trace!("pc {}: {}", pc, command);
            sink.record(command)?;
            records += 1;

            if op.opcode() == Opcode::Exit {
                break;
            }
            if looping && pc == lr.end && remaining > 0 {
                remaining -= 1;
                pc = lr.start;
            } else {
                pc += 1;
            }
        }
        Ok(records)
    }

    fn step<D: BufRead, A: BufRead>(
        &mut self,
        opcode: Opcode,
        instr: &Instruction,
        streams: &mut Streams<D, A>,
        line: usize,
    ) -> CompileResult<MemCommand> {
        let map = &self.config.address_map;
        let (address, direction) = match opcode.memory_direction() {
            Some(direction) => {
                let address = match &instr.addr {
                    Some(AddrOperand::Literal(a)) => *a,
                    Some(AddrOperand::File) => streams.addresses.next_word(line)?,
                    None => map.compose(&self.last),
                };
                self.last = map.decompose(address);
                self.last_direction = direction;
                (address, direction)
            }
            None => {
                // Stay on the open row so no precharge is implied
                let direction = match self.config.direction_policy {
                    DirectionPolicy::DefaultRead => Direction::Read,
                    DirectionPolicy::DefaultWrite => Direction::Write,
                    DirectionPolicy::InheritPrevious => self.last_direction,
                };
                (map.compose(&self.last), direction)
            }
        };

        let payload = match &instr.data {
            Some(DataOperand::File) => streams.data.next_record(line)?,
            Some(DataOperand::Literal(words)) => words.clone(),
            None => Vec::new(),
        };
        Ok(MemCommand::new(address, direction, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{MacroInstr, StorageClass};
    use pretty_assertions::assert_eq;

    fn staged(instrs: Vec<Instruction>) -> Vec<Option<IbEntry>> {
        let mut ib: Vec<Option<IbEntry>> = instrs.into_iter().map(|i| Some(IbEntry::new(i))).collect();
        ib.resize(64, None);
        ib
    }

    fn run(
        config: HwConfig,
        ib: &[Option<IbEntry>],
        lr: LoopRegister,
        data: &str,
        addrs: &str,
    ) -> CompileResult<Vec<MemCommand>> {
        let mut sim = TraceSimulator::new(config);
        let mut streams = Streams::from_text(data, addrs);
        let mut out = Vec::new();
        sim.execute(ib, &lr, &mut streams, &mut out, 1)?;
        Ok(out)
    }

    #[test]
    fn test_exit_only_program() {
        let ib = staged(vec![MacroInstr::exit().into()]);
        let out = run(HwConfig::default(), &ib, LoopRegister::new(0, 0, 10), "", "").unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].direction, Direction::Read);
    }

    #[test]
    fn test_loop_visits_body_each_iteration() {
        let ib = staged(vec![
            MacroInstr::vmv_load(StorageClass::R1, 0, 0).into(),
            MacroInstr::add_pair(8).into(),
            MacroInstr::nop().into(),
            MacroInstr::exit().into(),
        ]);
        let out = run(HwConfig::default(), &ib, LoopRegister::new(0, 2, 4), "", "").unwrap();
        assert_eq!(out.len(), 4 * 3 + 1);

        // An inner loop with a prologue entry before it
        let out = run(HwConfig::default(), &ib, LoopRegister::new(1, 2, 3), "", "").unwrap();
        assert_eq!(out.len(), 1 + 3 * 2 + 1);

        // No loop programmed
        let out = run(HwConfig::default(), &ib, LoopRegister::default(), "", "").unwrap();
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_memory_operands() {
        let map = HwConfig::default().address_map;
        let row = map.compose(&AddressTuple {
            row: 0x42,
            column: 3,
            ..AddressTuple::default()
        });
        let ib = staged(vec![
            Instruction::new(MacroInstr::glmv(2))
                .with_addr(AddrOperand::File)
                .with_data(DataOperand::File),
            Instruction::new(MacroInstr::rlb(0)).with_addr(AddrOperand::Literal(row)),
            MacroInstr::nop().into(),
            MacroInstr::exit().into(),
        ]);
        let out = run(HwConfig::default(), &ib, LoopRegister::default(), "0x15\n", "0x100\n").unwrap();
        assert_eq!(out[0], MemCommand::new(0x100, Direction::Write, vec![0x15]));
        assert_eq!(out[1], MemCommand::new(row, Direction::Read, vec![]));
        // Internal operations stay on the last row and column
        assert_eq!(out[2], MemCommand::new(row, Direction::Read, vec![]));
    }

    #[test]
    fn test_direction_policies() {
        let ib = staged(vec![
            Instruction::new(MacroInstr::wlb(1)).with_addr(AddrOperand::Literal(0x80)),
            MacroInstr::nop().into(),
            MacroInstr::exit().into(),
        ]);
        let directions = |policy| {
            let config = HwConfig {
                direction_policy: policy,
                ..HwConfig::default()
            };
            run(config, &ib, LoopRegister::default(), "", "")
                .unwrap()
                .iter()
                .map(|c| c.direction)
                .collect::<Vec<_>>()
        };
        use Direction::{Read, Write};
        assert_eq!(directions(DirectionPolicy::DefaultRead), vec![Write, Read, Read]);
        assert_eq!(directions(DirectionPolicy::DefaultWrite), vec![Write, Write, Write]);
        assert_eq!(directions(DirectionPolicy::InheritPrevious), vec![Write, Write, Write]);
    }

    #[test]
    fn test_stops_at_unstaged_entry() {
        let ib = staged(vec![MacroInstr::nop().into()]);
        let out = run(HwConfig::default(), &ib, LoopRegister::default(), "", "").unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_exhausted_address_stream() {
        let ib = staged(vec![
            Instruction::new(MacroInstr::rlb(0)).with_addr(AddrOperand::File),
            MacroInstr::exit().into(),
        ]);
        let err = run(HwConfig::default(), &ib, LoopRegister::new(0, 0, 3), "", "0x10\n0x20\n").unwrap_err();
        assert!(matches!(err, CompileError::StreamExhausted { line: 1, .. }));
    }

    #[test]
    fn test_raw_trace_format() {
        let mut writer = RawTraceWriter::new(Vec::new());
        writer
            .record(MemCommand::new(0x1f, Direction::Write, vec![0xa, 0xffff]))
            .unwrap();
        writer.record(MemCommand::new(0x20, Direction::Read, vec![])).unwrap();
        assert_eq!(writer.records(), 2);
        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(text, "0x1f\tWR\t0xa 0xffff\n0x20\tRD\n");
    }
}
