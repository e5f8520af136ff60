//! Multiply-chunk sizing for the accelerator
//!
//! A GEMM row is `n` products per output column. The products are batched
//! into chunks; one chunk is staged in the instruction buffer and re-run
//! once per output row tile. Three capacities bound the chunk:
//! - the very wide registers hold at most `vwr_words` products
//! - every product needs its own constant in the CSD store
//! - the whole chunk body must fit the instruction buffer

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tracing::{debug, warn};

use crate::adder_tree::{plan_adder_tree, AdderTree};
use crate::error::{CompileError, CompileResult, Diagnostic};
use crate::hardware::{ladder_index, packet_words, word_tiles, HwConfig, WORD_BITS};
use crate::reduction::{loaded_slots, ReductionGenerator};

/// Instructions closing every staged body: up to two PERMs, up to two
/// WLBs and the exit marker
pub const BODY_TRAILER: usize = 5;

/// Workload parameters for one scheduling run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GemmWorkload {
    pub m: usize,
    /// Dot-product length
    pub n: usize,
    /// Output row width
    pub q: usize,
    /// Initial subword width
    pub subword_width: u32,
    /// CSD digits per constant operand
    pub digit_len: u32,
    /// Annotate the assembly with comments
    pub verbose: bool,
}

impl GemmWorkload {
    pub fn new(m: usize, n: usize, q: usize) -> Self {
        Self {
            m,
            n,
            q,
            subword_width: 8,
            digit_len: 8,
            verbose: false,
        }
    }

    pub fn with_subword_width(mut self, width: u32) -> Self {
        self.subword_width = width;
        self
    }

    pub fn with_digit_len(mut self, digit_len: u32) -> Self {
        self.digit_len = digit_len;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn validate(&self) -> CompileResult<()> {
        if self.m == 0 || self.n == 0 || self.q == 0 {
            return Err(CompileError::schedule(format!(
                "workload dimensions must be positive, got m={} n={} q={}",
                self.m, self.n, self.q
            )));
        }
        if ladder_index(self.subword_width).is_none() {
            return Err(CompileError::schedule(format!(
                "initial subword width {} is not a supported width",
                self.subword_width
            )));
        }
        // Two bits per CSD digit, one constant per word
        if self.digit_len == 0 || self.digit_len * 2 > WORD_BITS {
            return Err(CompileError::schedule(format!(
                "digit length must be in 1..={}, got {}",
                WORD_BITS / 2,
                self.digit_len
            )));
        }
        Ok(())
    }
}

/// Which capacity first limited the chunk size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapMode {
    Unconstrained,
    ConstantStoreConstrained,
    InstrBufferConstrained,
}

/// Unconstrained sits below both constrained modes; the two constrained
/// modes name different resources and do not compare
impl PartialOrd for MapMode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (a, b) if a == b => Some(Ordering::Equal),
            (MapMode::Unconstrained, _) => Some(Ordering::Less),
            (_, MapMode::Unconstrained) => Some(Ordering::Greater),
            _ => None,
        }
    }
}

impl fmt::Display for MapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapMode::Unconstrained => write!(f, "unconstrained"),
            MapMode::ConstantStoreConstrained => write!(f, "constant-store constrained"),
            MapMode::InstrBufferConstrained => write!(f, "instruction-buffer constrained"),
        }
    }
}

/// NOP padding that hides multiply latency behind instruction issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Padding {
    /// Worst-case multiply latency in cycles
    pub latency: u32,
    /// Latency not covered by one DRAM access interval
    pub pad_cycles: u32,
    /// NOPs issued after each multiply
    pub pad_nops: usize,
}

impl Padding {
    /// A CSD constant with no adjacent non-zero digits has at most
    /// `ceil(digits / 2)` non-zeros, one shift-add cycle each
    pub fn for_digits(digit_len: u32, dram_interval: u32) -> Self {
        let latency = digit_len.div_ceil(2);
        let pad_cycles = latency.saturating_sub(dram_interval);
        Self {
            latency,
            pad_cycles,
            pad_nops: pad_cycles.div_ceil(dram_interval) as usize,
        }
    }
}

/// Result of chunk sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub mode: MapMode,
    /// Products per full chunk
    pub chunk: usize,
    pub full_chunks: usize,
    /// Products in the remainder chunk, 0 when `chunk` divides `n`
    pub peel: usize,
    /// Instruction tiles covering one output row
    pub q_tiles: usize,
    /// Loop iterations of every staged body: one per row tile
    pub row_tiles: usize,
    /// Multiplies needed per output row
    pub mul_ops_per_row: usize,
    pub padding: Padding,
    pub tree: AdderTree,
    pub warnings: Vec<Diagnostic>,
}

/// Chunk sizing against one hardware configuration
pub struct TilingStrategy {
    config: HwConfig,
}

impl TilingStrategy {
    pub fn new(config: HwConfig) -> Self {
        Self { config }
    }

    /// Pick the chunk size for `workload`
    pub fn plan(&self, workload: &GemmWorkload) -> CompileResult<ChunkPlan> {
        workload.validate()?;
        self.config.validate()?;

        let sw = workload.subword_width;
        let q_tiles = word_tiles(workload.q, sw);
        let row_tiles = workload.m * q_tiles;
        let mul_ops_per_row = workload.n * q_tiles;

        let tree = plan_adder_tree(workload.n, sw, workload.q)?;
        let mut warnings = tree.warnings.clone();

        // Every layer writes its results into one VWR half
        let widest = tree.final_width(sw);
        let packet = packet_words(sw, widest);
        if packet > self.config.half_words() {
            return Err(CompileError::register_half(packet, widest, self.config.half_words()));
        }

        let padding = Padding::for_digits(workload.digit_len, self.config.dram_interval);
        if padding.pad_cycles > self.config.dram_interval {
            let message = format!(
                "multiply padding of {} cycles exceeds the DRAM interval of {}",
                padding.pad_cycles, self.config.dram_interval
            );
            warn!("{}", message);
            warnings.push(Diagnostic::new(None, message));
        }

        let generator = ReductionGenerator::new(&tree, sw, &self.config);
        let fold_cost = |c: usize| -> Option<usize> {
            if c < 2 {
                return Some(0);
            }
            generator
                .plan_layer(0, &loaded_slots(c, 1), 0)
                .map(|plan| plan.len())
        };

        let mut mode = MapMode::Unconstrained;
        let mut chunk = self.config.vwr_words.min(workload.n);
        // Layer 0 results must fit the other VWR half
        while chunk > 1 && fold_cost(chunk).is_none() {
            chunk -= 1;
        }

        if chunk > self.config.csd_entries {
            chunk = self.config.csd_entries;
            mode = MapMode::ConstantStoreConstrained;
        }

        let mandatory = |c: usize| -> Option<usize> {
            let loads = if c > 1 { 2 } else { 1 };
            Some(c + loads + c * (1 + padding.pad_nops) + fold_cost(c)? + BODY_TRAILER)
        };
        let fits = |c: usize| mandatory(c).is_some_and(|len| len <= self.config.ib_entries);

        if !fits(chunk) {
            mode = MapMode::InstrBufferConstrained;
            while chunk > 1 && !fits(chunk) {
                chunk -= 1;
            }
            if !fits(chunk) {
                return Err(CompileError::schedule(format!(
                    "a single-product chunk needs {} instructions but the buffer holds {}",
                    mandatory(1).unwrap_or(0),
                    self.config.ib_entries
                )));
            }
        }

        // Keep pairs whole unless the chunk covers the entire row
        if chunk > 1 && chunk % 2 == 1 && chunk < workload.n {
            chunk -= 1;
        }

        let plan = ChunkPlan {
            mode,
            chunk,
            full_chunks: workload.n / chunk,
            peel: workload.n % chunk,
            q_tiles,
            row_tiles,
            mul_ops_per_row,
            padding,
            tree,
            warnings,
        };
        debug!(
            "chunk plan: {} products per chunk ({}), {} full, peel {}",
            plan.chunk, plan.mode, plan.full_chunks, plan.peel
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_two_product_row() {
        let tiler = TilingStrategy::new(HwConfig::default());
        let plan = tiler.plan(&GemmWorkload::new(1, 2, 8)).unwrap();
        assert_eq!(plan.tree.depth(), 1);
        let layer = &plan.tree.layers[0];
        assert_eq!((layer.inputs, layer.outputs, layer.additions), (2, 1, 1));
        assert_eq!(plan.mode, MapMode::Unconstrained);
        assert_eq!(plan.chunk, 2);
        assert_eq!(plan.peel, 0);
        assert_eq!(plan.full_chunks, 1);
        assert_eq!(plan.row_tiles, 1);
    }

    #[test]
    fn test_constant_store_bound() {
        let tiler = TilingStrategy::new(HwConfig::new(64, 4, 4));
        let plan = tiler.plan(&GemmWorkload::new(2, 10, 8)).unwrap();
        assert_eq!(plan.mode, MapMode::ConstantStoreConstrained);
        assert_eq!(plan.chunk, 4);
        assert_eq!((plan.full_chunks, plan.peel), (2, 2));
        assert_eq!(plan.row_tiles, 2);
    }

    #[test]
    fn test_instruction_buffer_bound() {
        // 16 products: 16 GLMV + 2 RLB + 16 MUL + 40 fold + 5 > 32
        let tiler = TilingStrategy::new(HwConfig::new(32, 16, 4));
        let plan = tiler.plan(&GemmWorkload::new(1, 16, 8)).unwrap();
        assert_eq!(plan.mode, MapMode::InstrBufferConstrained);
        // c = 4: 4 + 2 + 4 + 10 + 5 = 25; c = 5: 5 + 2 + 5 + 13 + 5 = 30
        // c = 6: 6 + 2 + 6 + 15 + 5 = 34, and 5 is odd so it rounds down
        assert_eq!(plan.chunk, 4);
    }

    #[test]
    fn test_padding() {
        assert_eq!(Padding::for_digits(8, 4).pad_nops, 0);
        let p = Padding::for_digits(20, 4);
        assert_eq!((p.latency, p.pad_cycles, p.pad_nops), (10, 6, 2));

        let tiler = TilingStrategy::new(HwConfig::new(64, 16, 2));
        let plan = tiler
            .plan(&GemmWorkload::new(1, 4, 8).with_digit_len(16))
            .unwrap();
        assert_eq!(plan.padding.pad_nops, 3);
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn test_whole_row_keeps_odd_chunk() {
        let tiler = TilingStrategy::new(HwConfig::default());
        let plan = tiler.plan(&GemmWorkload::new(1, 5, 8)).unwrap();
        assert_eq!((plan.chunk, plan.peel), (5, 0));
    }

    #[test]
    fn test_resource_monotonicity() {
        for n in [2usize, 3, 7, 16, 33, 100] {
            let workload = GemmWorkload::new(2, n, 24);
            let mut previous: Option<ChunkPlan> = None;
            for ib in (8..=64).rev() {
                let Ok(plan) = TilingStrategy::new(HwConfig::new(ib, 16, 4)).plan(&workload) else {
                    break;
                };
                if let Some(prev) = &previous {
                    assert!(plan.chunk <= prev.chunk, "n={} ib={}", n, ib);
                    assert!(!(plan.mode < prev.mode), "n={} ib={}", n, ib);
                }
                previous = Some(plan);
            }

            let mut previous: Option<ChunkPlan> = None;
            for csd in (1..=16).rev() {
                let plan = TilingStrategy::new(HwConfig::new(64, csd, 4))
                    .plan(&workload)
                    .unwrap();
                if let Some(prev) = &previous {
                    assert!(plan.chunk <= prev.chunk, "n={} csd={}", n, csd);
                    assert!(!(plan.mode < prev.mode), "n={} csd={}", n, csd);
                }
                previous = Some(plan);
            }
        }
    }

    #[test]
    fn test_widest_packet_must_fit_register_half() {
        let config = HwConfig {
            vwr_words: 4,
            ..HwConfig::default()
        };
        let tiler = TilingStrategy::new(config);
        // 3-bit products widen to 8 bits over four layers: 3 words per packet
        let err = tiler
            .plan(&GemmWorkload::new(1, 9, 8).with_subword_width(3))
            .unwrap_err();
        assert!(matches!(
            err,
            CompileError::RegisterHalf {
                packet: 3,
                width: 8,
                half_words: 2
            }
        ));
        assert_eq!(err.category(), crate::error::ErrorCategory::Resource);
        assert!(err.to_string().contains("VWR half"));

        // Two products only widen to 4 bits, which still fits
        assert!(tiler.plan(&GemmWorkload::new(1, 2, 8).with_subword_width(3)).is_ok());
    }

    #[test]
    fn test_map_mode_order() {
        assert!(MapMode::Unconstrained < MapMode::ConstantStoreConstrained);
        assert!(MapMode::Unconstrained < MapMode::InstrBufferConstrained);
        assert_eq!(
            MapMode::ConstantStoreConstrained.partial_cmp(&MapMode::InstrBufferConstrained),
            None
        );
    }

    #[test]
    fn test_rejects_bad_workload() {
        let tiler = TilingStrategy::new(HwConfig::default());
        assert!(tiler.plan(&GemmWorkload::new(0, 2, 8)).is_err());
        assert!(tiler.plan(&GemmWorkload::new(1, 2, 8).with_subword_width(7)).is_err());
        assert!(tiler.plan(&GemmWorkload::new(1, 2, 8).with_digit_len(25)).is_err());
        assert!(TilingStrategy::new(HwConfig::new(6, 16, 4))
            .plan(&GemmWorkload::new(1, 2, 8))
            .is_err());
    }
}
