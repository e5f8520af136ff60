//! Instruction set of the accelerator
//!
//! [`MacroInstr`] is the tagged form of one instruction-buffer entry. The
//! three variants share bit positions once packed by [`crate::codec`];
//! keeping them apart here means the layout is never ambiguous.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hardware::{next_width, SUBWORD_LADDER};

/// Opcode table, in packed index order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    Nop,
    Exit,
    Rlb,
    Wlb,
    Vmv,
    Rmv,
    Glmv,
    Perm,
    Mul,
    Add,
    Sub,
    Shl,
    Shr,
    Pack,
}

/// Which field group an opcode packs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Move,
    Compute,
    Pack,
}

/// Direction of a memory command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "RD"),
            Direction::Write => write!(f, "WR"),
        }
    }
}

impl Opcode {
    pub const TABLE: [Opcode; 14] = [
        Opcode::Nop,
        Opcode::Exit,
        Opcode::Rlb,
        Opcode::Wlb,
        Opcode::Vmv,
        Opcode::Rmv,
        Opcode::Glmv,
        Opcode::Perm,
        Opcode::Mul,
        Opcode::Add,
        Opcode::Sub,
        Opcode::Shl,
        Opcode::Shr,
        Opcode::Pack,
    ];

    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn from_index(index: u32) -> Option<Self> {
        Self::TABLE.get(index as usize).copied()
    }

    pub fn family(self) -> Family {
        match self {
            Opcode::Mul | Opcode::Add | Opcode::Sub | Opcode::Shl | Opcode::Shr => Family::Compute,
            Opcode::Pack => Family::Pack,
            _ => Family::Move,
        }
    }

    /// Memory direction for instructions that touch external memory
    pub fn memory_direction(self) -> Option<Direction> {
        match self {
            Opcode::Rlb => Some(Direction::Read),
            Opcode::Wlb | Opcode::Glmv => Some(Direction::Write),
            _ => None,
        }
    }

    /// Sub-operation name written after `VFUX`
    pub fn vfu_name(self) -> Option<&'static str> {
        match self {
            Opcode::Mul => Some("MUL"),
            Opcode::Add => Some("ADD"),
            Opcode::Sub => Some("SUB"),
            Opcode::Shl => Some("SHL"),
            Opcode::Shr => Some("SHR"),
            _ => None,
        }
    }

    pub fn from_vfu_name(name: &str) -> Option<Self> {
        match name {
            "MUL" => Some(Opcode::Mul),
            "ADD" => Some(Opcode::Add),
            "SUB" => Some(Opcode::Sub),
            "SHL" => Some(Opcode::Shl),
            "SHR" => Some(Opcode::Shr),
            _ => None,
        }
    }
}

/// Physical storage an instruction field can name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageClass {
    R0,
    R1,
    R2,
    R3,
    /// R1 and R2 read together as one operand pair
    R1R2,
    Vwr(u8),
}

impl StorageClass {
    pub fn code(self) -> u32 {
        match self {
            StorageClass::R0 => 0,
            StorageClass::R1 => 1,
            StorageClass::R2 => 2,
            StorageClass::R3 => 3,
            StorageClass::R1R2 => 4,
            StorageClass::Vwr(v) => 5 + v as u32,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(StorageClass::R0),
            1 => Some(StorageClass::R1),
            2 => Some(StorageClass::R2),
            3 => Some(StorageClass::R3),
            4 => Some(StorageClass::R1R2),
            c if c >= 5 && ((c - 5) as usize) < crate::hardware::VWR_COUNT => {
                Some(StorageClass::Vwr((c - 5) as u8))
            }
            _ => None,
        }
    }

    pub fn is_vwr(self) -> bool {
        matches!(self, StorageClass::Vwr(_))
    }

    /// Render with a word index when the storage is word addressed
    pub fn with_index(self, index: u32) -> String {
        match self {
            StorageClass::Vwr(_) => format!("{}[{}]", self, index),
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageClass::R0 => write!(f, "R0"),
            StorageClass::R1 => write!(f, "R1"),
            StorageClass::R2 => write!(f, "R2"),
            StorageClass::R3 => write!(f, "R3"),
            StorageClass::R1R2 => write!(f, "R1R2"),
            StorageClass::Vwr(v) => write!(f, "VWR_{}", v),
        }
    }
}

/// Subword width change performed by `PACK`, only between adjacent ladder widths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepackKind {
    W3To4,
    W4To6,
    W6To8,
    W8To12,
    W12To16,
    W16To24,
}

impl RepackKind {
    pub const ALL: [RepackKind; 6] = [
        RepackKind::W3To4,
        RepackKind::W4To6,
        RepackKind::W6To8,
        RepackKind::W8To12,
        RepackKind::W12To16,
        RepackKind::W16To24,
    ];

    /// Repack needed to widen `from` to `to`; equal or non-adjacent widths need none
    pub fn between(from: u32, to: u32) -> Option<Self> {
        if from == to || next_width(from) != to {
            return None;
        }
        Self::ALL.into_iter().find(|k| k.widths() == (from, to))
    }

    pub fn widths(self) -> (u32, u32) {
        let i = self as usize;
        (SUBWORD_LADDER[i], SUBWORD_LADDER[i + 1])
    }

    pub fn selector(self) -> u32 {
        self as u32
    }

    pub fn from_selector(selector: u32) -> Option<Self> {
        Self::ALL.get(selector as usize).copied()
    }
}

impl fmt::Display for RepackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (from, to) = self.widths();
        write!(f, "PK{}TO{}", from, to)
    }
}

/// Move family: immediate, destination, source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveFields {
    pub opcode: Opcode,
    pub imm: u32,
    pub dst: StorageClass,
    pub src: StorageClass,
}

/// Compute family, one `VFUX` operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeFields {
    pub opcode: Opcode,
    /// Subword width in bits; must be a ladder width
    pub subword: u32,
    /// CSD entry for `MUL`, shift amount for `SHL`/`SHR`
    pub csd: u32,
    pub dst_idx: u32,
    pub src_idx: u32,
    pub dst: StorageClass,
    pub src: StorageClass,
}

/// Pack family: repack `R0` into a destination word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackFields {
    pub repack: RepackKind,
    /// First subword of `R0` taken by this pack
    pub offset: u32,
    pub dst_idx: u32,
    pub dst: StorageClass,
}

/// One instruction-buffer entry before packing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacroInstr {
    Move(MoveFields),
    Compute(ComputeFields),
    Pack(PackFields),
}

impl MacroInstr {
    pub fn opcode(&self) -> Opcode {
        match self {
            MacroInstr::Move(f) => f.opcode,
            MacroInstr::Compute(f) => f.opcode,
            MacroInstr::Pack(_) => Opcode::Pack,
        }
    }

    fn bare(opcode: Opcode, imm: u32, dst: StorageClass, src: StorageClass) -> Self {
        MacroInstr::Move(MoveFields { opcode, imm, dst, src })
    }

    pub fn nop() -> Self {
        Self::bare(Opcode::Nop, 0, StorageClass::R0, StorageClass::R0)
    }

    pub fn exit() -> Self {
        Self::bare(Opcode::Exit, 0, StorageClass::R0, StorageClass::R0)
    }

    pub fn rlb(vwr: u8) -> Self {
        Self::bare(Opcode::Rlb, 0, StorageClass::Vwr(vwr), StorageClass::R0)
    }

    pub fn wlb(vwr: u8) -> Self {
        Self::bare(Opcode::Wlb, 0, StorageClass::R0, StorageClass::Vwr(vwr))
    }

    pub fn glmv(csd: u32) -> Self {
        Self::bare(Opcode::Glmv, csd, StorageClass::R0, StorageClass::R0)
    }

    pub fn perm(vwr: u8, pattern: u32) -> Self {
        Self::bare(Opcode::Perm, pattern, StorageClass::Vwr(vwr), StorageClass::Vwr(vwr))
    }

    /// Load one VWR word into a register
    pub fn vmv_load(reg: StorageClass, vwr: u8, word: usize) -> Self {
        Self::bare(Opcode::Vmv, word as u32, reg, StorageClass::Vwr(vwr))
    }

    /// Store a register into one VWR word
    pub fn vmv_store(vwr: u8, word: usize, reg: StorageClass) -> Self {
        Self::bare(Opcode::Vmv, word as u32, StorageClass::Vwr(vwr), reg)
    }

    pub fn rmv(dst: StorageClass, src: StorageClass, shift: u32) -> Self {
        Self::bare(Opcode::Rmv, shift, dst, src)
    }

    /// In-place constant multiply of one VWR word
    pub fn mul(subword: u32, vwr: u8, word: usize, csd: u32) -> Self {
        MacroInstr::Compute(ComputeFields {
            opcode: Opcode::Mul,
            subword,
            csd,
            dst_idx: word as u32,
            src_idx: word as u32,
            dst: StorageClass::Vwr(vwr),
            src: StorageClass::Vwr(vwr),
        })
    }

    /// `R0 = R1 + R2`
    pub fn add_pair(subword: u32) -> Self {
        MacroInstr::Compute(ComputeFields {
            opcode: Opcode::Add,
            subword,
            csd: 0,
            dst_idx: 0,
            src_idx: 0,
            dst: StorageClass::R0,
            src: StorageClass::R1R2,
        })
    }

    pub fn pack(repack: RepackKind, offset: u32, vwr: u8, word: usize) -> Self {
        MacroInstr::Pack(PackFields {
            repack,
            offset,
            dst_idx: word as u32,
            dst: StorageClass::Vwr(vwr),
        })
    }
}

/// Where a memory access takes its address from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddrOperand {
    Literal(u64),
    File,
}

/// Where a write takes its payload from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataOperand {
    Literal(Vec<u64>),
    File,
}

/// One assembly instruction line: the packed part plus memory attachments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: MacroInstr,
    pub addr: Option<AddrOperand>,
    pub data: Option<DataOperand>,
}

impl Instruction {
    pub fn new(op: MacroInstr) -> Self {
        Self {
            op,
            addr: None,
            data: None,
        }
    }

    pub fn with_addr(mut self, addr: AddrOperand) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn with_data(mut self, data: DataOperand) -> Self {
        self.data = Some(data);
        self
    }

    pub fn reads_addr_file(&self) -> bool {
        matches!(self.addr, Some(AddrOperand::File))
    }

    pub fn reads_data_file(&self) -> bool {
        matches!(self.data, Some(DataOperand::File))
    }
}

impl From<MacroInstr> for Instruction {
    fn from(op: MacroInstr) -> Self {
        Instruction::new(op)
    }
}

impl fmt::Display for AddrOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrOperand::Literal(a) => write!(f, "{:#x}", a),
            AddrOperand::File => write!(f, "AddrFile"),
        }
    }
}

impl fmt::Display for DataOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataOperand::Literal(words) => {
                let parts: Vec<String> = words.iter().map(|w| format!("{:#x}", w)).collect();
                write!(f, "{}", parts.join(" "))
            }
            DataOperand::File => write!(f, "DataFile"),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            MacroInstr::Move(m) => match m.opcode {
                Opcode::Nop => write!(f, "NOP")?,
                Opcode::Exit => write!(f, "NOP EXIT")?,
                Opcode::Rlb => write!(f, "RLB {}", m.dst)?,
                Opcode::Wlb => write!(f, "WLB {}", m.src)?,
                Opcode::Vmv => write!(
                    f,
                    "VMV {} {}",
                    m.dst.with_index(m.imm),
                    m.src.with_index(m.imm)
                )?,
                Opcode::Rmv => write!(f, "RMV {} {} {}", m.dst, m.src, m.imm)?,
                Opcode::Glmv => write!(f, "GLMV CSD_{}", m.imm)?,
                Opcode::Perm => write!(f, "PERM {} {}", m.dst, m.imm)?,
                other => write!(f, "; invalid move opcode {:?}", other)?,
            },
            MacroInstr::Compute(c) => {
                let name = c.opcode.vfu_name().unwrap_or("?");
                write!(
                    f,
                    "VFUX {} SW{} {} {}",
                    name,
                    c.subword,
                    c.dst.with_index(c.dst_idx),
                    c.src.with_index(c.src_idx)
                )?;
                match c.opcode {
                    Opcode::Mul => write!(f, " CSD_{}", c.csd)?,
                    Opcode::Shl | Opcode::Shr => write!(f, " {}", c.csd)?,
                    _ => {}
                }
            }
            MacroInstr::Pack(p) => write!(
                f,
                "PACK {} {} {}",
                p.repack,
                p.offset,
                p.dst.with_index(p.dst_idx)
            )?,
        }
        if let Some(addr) = &self.addr {
            write!(f, " {}", addr)?;
        }
        if let Some(data) = &self.data {
            write!(f, " {}", data)?;
        }
        Ok(())
    }
}

/// Hardware loop register contents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopRegister {
    pub start: usize,
    pub end: usize,
    /// Total passes over `start..=end`
    pub iterations: u64,
}

impl LoopRegister {
    pub fn new(start: usize, end: usize, iterations: u64) -> Self {
        Self { start, end, iterations }
    }
}

impl fmt::Display for LoopRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LOOP {} {} {}", self.start, self.end, self.iterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_table_order() {
        for (i, op) in Opcode::TABLE.iter().enumerate() {
            assert_eq!(op.index() as usize, i);
            assert_eq!(Opcode::from_index(i as u32), Some(*op));
        }
        assert_eq!(Opcode::from_index(Opcode::TABLE.len() as u32), None);
    }

    #[test]
    fn test_repack_adjacency() {
        assert_eq!(RepackKind::between(8, 12), Some(RepackKind::W8To12));
        assert_eq!(RepackKind::between(16, 24), Some(RepackKind::W16To24));
        assert_eq!(RepackKind::between(8, 8), None);
        assert_eq!(RepackKind::between(8, 16), None);
        assert_eq!(RepackKind::W4To6.to_string(), "PK4TO6");
    }

    #[test]
    fn test_instruction_text() {
        let mul = Instruction::new(MacroInstr::mul(8, 0, 2, 3));
        assert_eq!(mul.to_string(), "VFUX MUL SW8 VWR_0[2] VWR_0[2] CSD_3");

        let glmv = Instruction::new(MacroInstr::glmv(4))
            .with_addr(AddrOperand::File)
            .with_data(DataOperand::File);
        assert_eq!(glmv.to_string(), "GLMV CSD_4 AddrFile DataFile");

        let load = Instruction::new(MacroInstr::vmv_load(StorageClass::R1, 1, 7));
        assert_eq!(load.to_string(), "VMV R1 VWR_1[7]");

        let pack = Instruction::new(MacroInstr::pack(RepackKind::W8To12, 4, 1, 3));
        assert_eq!(pack.to_string(), "PACK PK8TO12 4 VWR_1[3]");

        assert_eq!(Instruction::new(MacroInstr::exit()).to_string(), "NOP EXIT");
        assert_eq!(Instruction::new(MacroInstr::add_pair(12)).to_string(), "VFUX ADD SW12 R0 R1R2");
    }
}
