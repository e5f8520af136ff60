//! Hardware interface definitions for the near-memory SIMD accelerator
//!
//! Constants here size every packed instruction field, so they are fixed
//! per build. [`HwConfig`] carries the runtime limits a schedule may use,
//! which can only tighten the compile-time maxima.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CompileError, CompileResult};

/// Bits in one hardware word
pub const WORD_BITS: u32 = 48;
/// Words processed by one instruction (one per SIMD core)
pub const CORES: usize = 4;
/// Number of very wide registers
pub const VWR_COUNT: usize = 2;
/// Words per core held by one very wide register
pub const VWR_WORDS: usize = 32;
/// Instruction buffer capacity
pub const IB_ENTRIES: usize = 64;
/// Constant-operand (CSD) store capacity
pub const CSD_ENTRIES: usize = 16;
/// Scalar register file entries
pub const SRF_ENTRIES: usize = 4;
/// Mask register file entries
pub const MRF_ENTRIES: usize = 4;

/// Subword widths the datapath supports, narrowest first
pub const SUBWORD_LADDER: [u32; 7] = [3, 4, 6, 8, 12, 16, 24];

/// Bits needed to represent `count` distinct values
pub const fn bits_for(count: usize) -> u32 {
    if count <= 1 {
        1
    } else {
        usize::BITS - (count - 1).leading_zeros()
    }
}

/// Position of a width on the ladder
pub fn ladder_index(width: u32) -> Option<usize> {
    SUBWORD_LADDER.iter().position(|&w| w == width)
}

/// Next wider ladder width, clamped at the maximum
pub fn next_width(width: u32) -> u32 {
    match ladder_index(width) {
        Some(i) if i + 1 < SUBWORD_LADDER.len() => SUBWORD_LADDER[i + 1],
        _ => *SUBWORD_LADDER.last().unwrap_or(&width),
    }
}

/// Next narrower ladder width, or the width itself at the bottom
pub fn previous_width(width: u32) -> u32 {
    match ladder_index(width) {
        Some(i) if i > 0 => SUBWORD_LADDER[i - 1],
        _ => width,
    }
}

pub fn max_width() -> u32 {
    SUBWORD_LADDER[SUBWORD_LADDER.len() - 1]
}

/// Subwords of `width` bits that fit in one word
pub fn subwords_per_word(width: u32) -> usize {
    (WORD_BITS / width) as usize
}

/// Instruction tiles needed to cover `q` output columns at `width`
pub fn word_tiles(q: usize, width: u32) -> usize {
    let per_tile = CORES * subwords_per_word(width);
    q.div_ceil(per_tile)
}

/// Words per core one product packet occupies once widened to `width`.
///
/// A packet is one multiply result at the initial width, which always
/// fills exactly one word.
pub fn packet_words(initial: u32, width: u32) -> usize {
    subwords_per_word(initial).div_ceil(subwords_per_word(width))
}

/// Default memory direction for instructions that never touch memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionPolicy {
    #[default]
    DefaultRead,
    DefaultWrite,
    InheritPrevious,
}

/// One level of the DRAM address hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddrLevel {
    Channel,
    Column,
    Rank,
    BankGroup,
    Bank,
    Row,
}

/// Decomposed memory address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressTuple {
    pub channel: u64,
    pub rank: u64,
    pub bank_group: u64,
    pub bank: u64,
    pub row: u64,
    pub column: u64,
}

impl AddressTuple {
    pub fn get(&self, level: AddrLevel) -> u64 {
        match level {
            AddrLevel::Channel => self.channel,
            AddrLevel::Column => self.column,
            AddrLevel::Rank => self.rank,
            AddrLevel::BankGroup => self.bank_group,
            AddrLevel::Bank => self.bank,
            AddrLevel::Row => self.row,
        }
    }

    pub fn set(&mut self, level: AddrLevel, value: u64) {
        match level {
            AddrLevel::Channel => self.channel = value,
            AddrLevel::Column => self.column = value,
            AddrLevel::Rank => self.rank = value,
            AddrLevel::BankGroup => self.bank_group = value,
            AddrLevel::Bank => self.bank = value,
            AddrLevel::Row => self.row = value,
        }
    }
}

/// Mapping between address tuples and linear addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressMap {
    /// Offset added to every linear address
    pub base: u64,
    /// Levels from least to most significant, with their bit widths
    pub levels: Vec<(AddrLevel, u32)>,
}

impl Default for AddressMap {
    fn default() -> Self {
        Self {
            base: 0,
            levels: vec![
                (AddrLevel::Channel, 1),
                (AddrLevel::Column, 7),
                (AddrLevel::Rank, 1),
                (AddrLevel::BankGroup, 2),
                (AddrLevel::Bank, 2),
                (AddrLevel::Row, 15),
            ],
        }
    }
}

impl AddressMap {
    pub fn width(&self, level: AddrLevel) -> u32 {
        self.levels
            .iter()
            .find(|(l, _)| *l == level)
            .map(|(_, w)| *w)
            .unwrap_or(0)
    }

    /// Row bit that redirects an access to a register file
    pub fn rf_flag(&self) -> u64 {
        match self.width(AddrLevel::Row) {
            0 => 0,
            w => 1 << (w - 1),
        }
    }

    pub fn compose(&self, tuple: &AddressTuple) -> u64 {
        let mut offset = 0;
        let mut linear = 0u64;
        for &(level, width) in &self.levels {
            linear |= (tuple.get(level) & mask(width)) << offset;
            offset += width;
        }
        self.base.wrapping_add(linear)
    }

    pub fn decompose(&self, address: u64) -> AddressTuple {
        let mut linear = address.wrapping_sub(self.base);
        let mut tuple = AddressTuple::default();
        for &(level, width) in &self.levels {
            tuple.set(level, linear & mask(width));
            linear >>= width;
        }
        tuple
    }

    /// Mapped address of entry `index` of a register file
    pub fn register_file_address(&self, rf: RegFile, index: usize) -> u64 {
        let tuple = AddressTuple {
            row: self.rf_flag() | rf.row_id(),
            column: index as u64,
            ..AddressTuple::default()
        };
        self.compose(&tuple)
    }

    pub fn is_register_file(&self, address: u64) -> bool {
        self.decompose(address).row & self.rf_flag() != 0
    }
}

fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Register files reachable through `WRF`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegFile {
    InstrBuffer,
    Scalar,
    Mask,
    ConstStore,
    LoopReg,
    DigitLength,
}

impl RegFile {
    pub const ALL: [RegFile; 6] = [
        RegFile::InstrBuffer,
        RegFile::Scalar,
        RegFile::Mask,
        RegFile::ConstStore,
        RegFile::LoopReg,
        RegFile::DigitLength,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            RegFile::InstrBuffer => "IB",
            RegFile::Scalar => "SRF",
            RegFile::Mask => "MRF",
            RegFile::ConstStore => "CSD",
            RegFile::LoopReg => "LR",
            RegFile::DigitLength => "DLEN",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|rf| rf.prefix() == prefix)
    }

    pub fn row_id(self) -> u64 {
        self as u64
    }

    /// Literal words one entry holds
    pub fn literal_width(self) -> usize {
        match self {
            RegFile::Mask => CORES,
            _ => 1,
        }
    }

    pub fn capacity(self, config: &HwConfig) -> usize {
        match self {
            RegFile::InstrBuffer => config.ib_entries,
            RegFile::Scalar => SRF_ENTRIES,
            RegFile::Mask => MRF_ENTRIES,
            RegFile::ConstStore => config.csd_entries,
            RegFile::LoopReg | RegFile::DigitLength => 1,
        }
    }
}

/// Runtime configuration for the accelerator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HwConfig {
    /// Usable instruction buffer entries
    pub ib_entries: usize,
    /// Usable constant store entries
    pub csd_entries: usize,
    /// Usable words per core in each very wide register
    pub vwr_words: usize,
    /// Minimum cycles between DRAM column accesses
    pub dram_interval: u32,
    pub address_map: AddressMap,
    pub direction_policy: DirectionPolicy,
    /// Seed for synthetic operands and addresses
    pub seed: u64,
}

impl Default for HwConfig {
    fn default() -> Self {
        Self {
            ib_entries: IB_ENTRIES,
            csd_entries: CSD_ENTRIES,
            vwr_words: VWR_WORDS,
            dram_interval: 4,
            address_map: AddressMap::default(),
            direction_policy: DirectionPolicy::default(),
            seed: 0,
        }
    }
}

impl HwConfig {
    pub fn new(ib_entries: usize, csd_entries: usize, dram_interval: u32) -> Self {
        Self {
            ib_entries,
            csd_entries,
            dram_interval,
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> CompileResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> CompileResult<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Words per core in one ping-pong half of a very wide register
    pub fn half_words(&self) -> usize {
        self.vwr_words / 2
    }

    pub fn validate(&self) -> CompileResult<()> {
        if self.ib_entries == 0 || self.ib_entries > IB_ENTRIES {
            return Err(CompileError::config(format!(
                "ib_entries must be in 1..={}, got {}",
                IB_ENTRIES, self.ib_entries
            )));
        }
        if self.csd_entries == 0 || self.csd_entries > CSD_ENTRIES {
            return Err(CompileError::config(format!(
                "csd_entries must be in 1..={}, got {}",
                CSD_ENTRIES, self.csd_entries
            )));
        }
        if self.vwr_words < 2 || self.vwr_words > VWR_WORDS || self.vwr_words % 2 != 0 {
            return Err(CompileError::config(format!(
                "vwr_words must be even and in 2..={}, got {}",
                VWR_WORDS, self.vwr_words
            )));
        }
        if self.dram_interval == 0 {
            return Err(CompileError::config("dram_interval must be positive"));
        }

        let map = &self.address_map;
        let total: u32 = map.levels.iter().map(|(_, w)| *w).sum();
        if total > 64 {
            return Err(CompileError::config(format!(
                "address map spans {} bits, more than 64",
                total
            )));
        }
        let rf_ids = bits_for(RegFile::ALL.len());
        if map.width(AddrLevel::Row) < rf_ids + 1 {
            return Err(CompileError::config(format!(
                "row field needs at least {} bits to address register files",
                rf_ids + 1
            )));
        }
        let largest_rf = IB_ENTRIES.max(CSD_ENTRIES);
        if map.width(AddrLevel::Column) < bits_for(largest_rf) {
            return Err(CompileError::config(format!(
                "column field needs at least {} bits to index register files",
                bits_for(largest_rf)
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_steps() {
        assert_eq!(next_width(3), 4);
        assert_eq!(next_width(8), 12);
        assert_eq!(next_width(24), 24);
        assert_eq!(previous_width(12), 8);
        assert_eq!(previous_width(3), 3);
        assert!(SUBWORD_LADDER.iter().all(|w| WORD_BITS % w == 0));
    }

    #[test]
    fn test_sizing() {
        assert_eq!(bits_for(64), 6);
        assert_eq!(bits_for(7), 3);
        assert_eq!(bits_for(16), 4);
        assert_eq!(subwords_per_word(8), 6);
        // 8 columns at 8 bits: 24 subwords per instruction tile
        assert_eq!(word_tiles(8, 8), 1);
        assert_eq!(word_tiles(25, 8), 2);
        assert_eq!(packet_words(8, 8), 1);
        assert_eq!(packet_words(8, 12), 2);
        assert_eq!(packet_words(8, 24), 3);
    }

    #[test]
    fn test_address_round_trip() {
        let map = AddressMap::default();
        let tuple = AddressTuple {
            channel: 1,
            rank: 0,
            bank_group: 2,
            bank: 3,
            row: 0x1234,
            column: 0x55,
        };
        let linear = map.compose(&tuple);
        assert_eq!(map.decompose(linear), tuple);
        assert!(!map.is_register_file(linear));
    }

    #[test]
    fn test_register_file_address() {
        let map = AddressMap::default();
        let addr = map.register_file_address(RegFile::InstrBuffer, 5);
        let tuple = map.decompose(addr);
        assert_eq!(tuple.column, 5);
        assert_eq!(tuple.row, map.rf_flag());
        assert!(map.is_register_file(addr));
        assert_ne!(addr, map.register_file_address(RegFile::LoopReg, 5));
    }

    #[test]
    fn test_config_validation() {
        assert!(HwConfig::default().validate().is_ok());
        assert!(HwConfig::new(IB_ENTRIES + 1, 4, 4).validate().is_err());
        assert!(HwConfig::new(16, 0, 4).validate().is_err());

        let parsed = HwConfig::from_json(r#"{ "ib_entries": 32, "direction_policy": "inherit_previous" }"#)
            .unwrap();
        assert_eq!(parsed.ib_entries, 32);
        assert_eq!(parsed.csd_entries, CSD_ENTRIES);
        assert_eq!(parsed.direction_policy, DirectionPolicy::InheritPrevious);
    }
}
