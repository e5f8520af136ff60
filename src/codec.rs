//! Bit packing for instruction-buffer words
//!
//! Layout, most significant first:
//!
//! ```text
//! [ opcode | move:    imm | dst | src                                  ]
//! [ opcode | compute: subword | csd | dst_idx | src_idx | dst | src    ]
//! [ opcode | pack:    repack | offset | dst_idx | dst                  ]
//! ```
//!
//! Every group is right-aligned under the opcode. Out-of-range values wrap
//! to their field width, the same way the hardware registers truncate.

use crate::hardware::{
    bits_for, ladder_index, CSD_ENTRIES, SUBWORD_LADDER, VWR_COUNT, VWR_WORDS, WORD_BITS,
};
use crate::isa::{ComputeFields, Family, MacroInstr, MoveFields, Opcode, PackFields, RepackKind, StorageClass};

pub const OPCODE_BITS: u32 = bits_for(Opcode::TABLE.len());
pub const STORAGE_BITS: u32 = bits_for(5 + VWR_COUNT);
pub const INDEX_BITS: u32 = bits_for(VWR_WORDS);
pub const CSD_BITS: u32 = bits_for(CSD_ENTRIES);
pub const IMM_BITS: u32 = max(INDEX_BITS, CSD_BITS);
pub const SUBWORD_BITS: u32 = bits_for(SUBWORD_LADDER.len());
pub const REPACK_BITS: u32 = bits_for(RepackKind::ALL.len());
pub const OFFSET_BITS: u32 = bits_for((WORD_BITS / SUBWORD_LADDER[0]) as usize);

pub const MOVE_BITS: u32 = IMM_BITS + 2 * STORAGE_BITS;
pub const COMPUTE_BITS: u32 = SUBWORD_BITS + CSD_BITS + 2 * INDEX_BITS + 2 * STORAGE_BITS;
pub const PACK_BITS: u32 = REPACK_BITS + OFFSET_BITS + INDEX_BITS + STORAGE_BITS;
pub const GROUP_BITS: u32 = max(MOVE_BITS, max(COMPUTE_BITS, PACK_BITS));
pub const INSTR_BITS: u32 = OPCODE_BITS + GROUP_BITS;

const _: () = assert!(INSTR_BITS <= 32);

const fn max(a: u32, b: u32) -> u32 {
    if a > b {
        a
    } else {
        b
    }
}

fn mask(bits: u32) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1 << bits) - 1
    }
}

/// A field value that does not fit its packed width
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldOverflow {
    pub field: &'static str,
    pub value: u32,
    pub bits: u32,
}

impl std::fmt::Display for FieldOverflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} value {} truncated to {} bits ({})",
            self.field,
            self.value,
            self.bits,
            self.value & mask(self.bits)
        )
    }
}

struct Packer(u32);

impl Packer {
    fn push(&mut self, value: u32, bits: u32) {
        self.0 = (self.0 << bits) | (value & mask(bits));
    }
}

struct Unpacker(u32);

impl Unpacker {
    /// Fields come out least significant first
    fn pull(&mut self, bits: u32) -> u32 {
        let value = self.0 & mask(bits);
        self.0 >>= bits;
        value
    }
}

fn subword_code(width: u32) -> u32 {
    ladder_index(width).unwrap_or(0) as u32
}

/// Pack one instruction into its buffer word
pub fn encode(instr: &MacroInstr) -> u32 {
    let mut p = Packer(0);
    match instr {
        MacroInstr::Move(m) => {
            p.push(m.imm, IMM_BITS);
            p.push(m.dst.code(), STORAGE_BITS);
            p.push(m.src.code(), STORAGE_BITS);
        }
        MacroInstr::Compute(c) => {
            p.push(subword_code(c.subword), SUBWORD_BITS);
            p.push(c.csd, CSD_BITS);
            p.push(c.dst_idx, INDEX_BITS);
            p.push(c.src_idx, INDEX_BITS);
            p.push(c.dst.code(), STORAGE_BITS);
            p.push(c.src.code(), STORAGE_BITS);
        }
        MacroInstr::Pack(k) => {
            p.push(k.repack.selector(), REPACK_BITS);
            p.push(k.offset, OFFSET_BITS);
            p.push(k.dst_idx, INDEX_BITS);
            p.push(k.dst.code(), STORAGE_BITS);
        }
    }
    (instr.opcode().index() & mask(OPCODE_BITS)) << GROUP_BITS | p.0
}

/// Unpack a buffer word; `None` when it names an opcode, width or storage
/// class that does not exist
pub fn decode(word: u32) -> Option<MacroInstr> {
    let opcode = Opcode::from_index((word >> GROUP_BITS) & mask(OPCODE_BITS))?;
    let mut u = Unpacker(word & mask(GROUP_BITS));
    let instr = match opcode.family() {
        Family::Move => {
            let src = StorageClass::from_code(u.pull(STORAGE_BITS))?;
            let dst = StorageClass::from_code(u.pull(STORAGE_BITS))?;
            let imm = u.pull(IMM_BITS);
            MacroInstr::Move(MoveFields { opcode, imm, dst, src })
        }
        Family::Compute => {
            let src = StorageClass::from_code(u.pull(STORAGE_BITS))?;
            let dst = StorageClass::from_code(u.pull(STORAGE_BITS))?;
            let src_idx = u.pull(INDEX_BITS);
            let dst_idx = u.pull(INDEX_BITS);
            let csd = u.pull(CSD_BITS);
            let subword = *SUBWORD_LADDER.get(u.pull(SUBWORD_BITS) as usize)?;
            MacroInstr::Compute(ComputeFields {
                opcode,
                subword,
                csd,
                dst_idx,
                src_idx,
                dst,
                src,
            })
        }
        Family::Pack => {
            let dst = StorageClass::from_code(u.pull(STORAGE_BITS))?;
            let dst_idx = u.pull(INDEX_BITS);
            let offset = u.pull(OFFSET_BITS);
            let repack = RepackKind::from_selector(u.pull(REPACK_BITS))?;
            MacroInstr::Pack(PackFields {
                repack,
                offset,
                dst_idx,
                dst,
            })
        }
    };
    Some(instr)
}

/// Numeric fields that will wrap when packed
pub fn overflows(instr: &MacroInstr) -> Vec<FieldOverflow> {
    let fields: Vec<(&'static str, u32, u32)> = match instr {
        MacroInstr::Move(m) => vec![("immediate", m.imm, IMM_BITS)],
        MacroInstr::Compute(c) => vec![
            ("csd", c.csd, CSD_BITS),
            ("dst index", c.dst_idx, INDEX_BITS),
            ("src index", c.src_idx, INDEX_BITS),
        ],
        MacroInstr::Pack(k) => vec![
            ("pack offset", k.offset, OFFSET_BITS),
            ("dst index", k.dst_idx, INDEX_BITS),
        ],
    };
    fields
        .into_iter()
        .filter(|&(_, value, bits)| value > mask(bits))
        .map(|(field, value, bits)| FieldOverflow { field, value, bits })
        .collect()
}

/// The instruction as it reads back after packing
pub fn truncated(instr: &MacroInstr) -> MacroInstr {
    match *instr {
        MacroInstr::Move(m) => MacroInstr::Move(MoveFields {
            imm: m.imm & mask(IMM_BITS),
            ..m
        }),
        MacroInstr::Compute(c) => MacroInstr::Compute(ComputeFields {
            csd: c.csd & mask(CSD_BITS),
            dst_idx: c.dst_idx & mask(INDEX_BITS),
            src_idx: c.src_idx & mask(INDEX_BITS),
            ..c
        }),
        MacroInstr::Pack(k) => MacroInstr::Pack(PackFields {
            offset: k.offset & mask(OFFSET_BITS),
            dst_idx: k.dst_idx & mask(INDEX_BITS),
            ..k
        }),
    }
}

pub const LOOP_INDEX_BITS: u32 = bits_for(crate::hardware::IB_ENTRIES);
pub const LOOP_COUNT_BITS: u32 = 32;

/// Pack the loop register triple into one word
pub fn encode_loop(start: usize, end: usize, iterations: u64) -> u64 {
    let index_mask = (1u64 << LOOP_INDEX_BITS) - 1;
    let count_mask = (1u64 << LOOP_COUNT_BITS) - 1;
    ((start as u64 & index_mask) << (LOOP_INDEX_BITS + LOOP_COUNT_BITS))
        | ((end as u64 & index_mask) << LOOP_COUNT_BITS)
        | (iterations & count_mask)
}

pub fn decode_loop(word: u64) -> (usize, usize, u64) {
    let index_mask = (1u64 << LOOP_INDEX_BITS) - 1;
    let count_mask = (1u64 << LOOP_COUNT_BITS) - 1;
    (
        ((word >> (LOOP_INDEX_BITS + LOOP_COUNT_BITS)) & index_mask) as usize,
        ((word >> LOOP_COUNT_BITS) & index_mask) as usize,
        word & count_mask,
    )
}
