//! Add-reduction code generator
//!
//! Emits the move/add/pack sequences that fold one or more adder-tree
//! layers inside the very wide registers. Operands of a layer are read
//! from one half of the VWRs and results land in the other half, so a
//! layer never overwrites a word it has yet to read.

use tracing::debug;

use crate::adder_tree::{AddTreeLayer, AdderTree};
use crate::hardware::{packet_words, subwords_per_word, HwConfig};
use crate::isa::{Instruction, MacroInstr, StorageClass};

/// Location of one operand packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub vwr: u8,
    /// First word of the packet
    pub word: usize,
}

impl Slot {
    pub fn new(vwr: u8, word: usize) -> Self {
        Self { vwr, word }
    }
}

/// Running state threaded through successive generator calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReductionCursor {
    /// Next adder-tree layer to fold (0-based)
    pub layer: usize,
    /// Instructions already placed in the buffer
    pub instr_count: usize,
    /// Operand packets alive before `layer`
    pub operands: usize,
    /// VWR half (0 or 1) holding the live operands
    pub half: usize,
}

impl ReductionCursor {
    pub fn new(layer: usize, instr_count: usize, operands: usize) -> Self {
        Self {
            layer,
            instr_count,
            operands,
            half: 0,
        }
    }

    /// Account for one folded layer
    pub fn advance(&mut self, plan: &LayerPlan) {
        self.layer += 1;
        self.instr_count += plan.len();
        self.operands = plan.reduced + plan.non_reduced;
        self.half ^= 1;
    }
}

/// Why a generator call handed control back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The next layer does not fit in the remaining instruction budget
    Budget,
    /// Fewer than two operands remain
    NoAdditions,
    /// The caller's layer limit was reached
    LayerLimit,
    /// Every layer of the tree has been folded
    TreeExhausted,
    /// The next layer's results do not fit in a VWR half
    Capacity,
}

/// Instructions for one layer, grouped so callers can interleave them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPlan {
    /// One sequence per operand pair
    pub pairs: Vec<Vec<MacroInstr>>,
    /// Moves the odd operand, if any, into the output half
    pub carry: Vec<MacroInstr>,
    /// Operand locations for the next layer
    pub slots: Vec<Slot>,
    pub reduced: usize,
    pub non_reduced: usize,
}

impl LayerPlan {
    pub fn len(&self) -> usize {
        self.pairs.iter().map(Vec::len).sum::<usize>() + self.carry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_instructions(self) -> impl Iterator<Item = Instruction> {
        self.pairs
            .into_iter()
            .flatten()
            .chain(self.carry)
            .map(Instruction::new)
    }
}

/// Operand layout after a batch load: packets alternate between the two
/// VWRs in the lower half, pairing `VWR_0` packet `j` with `VWR_1` packet `j`
pub fn loaded_slots(count: usize, words_per_packet: usize) -> Vec<Slot> {
    (0..count)
        .map(|i| Slot::new((i % 2) as u8, (i / 2) * words_per_packet))
        .collect()
}

/// Where the packs for one input word go: `(R0 subword offset, output word)`.
///
/// Offsets repeat every LCM of the two subwords-per-word counts; `values`
/// bounds the packet so trailing empty subwords are never packed.
pub fn pack_schedule(word: usize, spw_in: usize, spw_out: usize, values: usize) -> Vec<(u32, usize)> {
    let lcm = spw_in / gcd(spw_in, spw_out) * spw_out;
    let in_per_packet = lcm / spw_in;
    let out_per_packet = lcm / spw_out;
    let packet = word / in_per_packet;
    let lo = (word % in_per_packet) * spw_in;
    let hi = lo + spw_in;

    (0..out_per_packet)
        .filter_map(|k| {
            let start = k * spw_out;
            let global = packet * lcm + start;
            (start >= lo && start < hi && global < values)
                .then(|| ((start - lo) as u32, packet * out_per_packet + k))
        })
        .collect()
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Generator bound to one adder tree and register geometry
pub struct ReductionGenerator<'a> {
    layers: &'a [AddTreeLayer],
    initial: u32,
    half_words: usize,
}

impl<'a> ReductionGenerator<'a> {
    pub fn new(tree: &'a AdderTree, initial: u32, config: &HwConfig) -> Self {
        Self {
            layers: &tree.layers,
            initial,
            half_words: config.half_words(),
        }
    }

    pub fn layers(&self) -> &'a [AddTreeLayer] {
        self.layers
    }

    /// Plan folding `layer` over `slots`, whose packets sit in `half`.
    /// `None` when the results do not fit in the other half.
    pub fn plan_layer(&self, layer: usize, slots: &[Slot], half: usize) -> Option<LayerPlan> {
        let tl = self.layers.get(layer)?;
        let pw_in = packet_words(self.initial, tl.sw_in);
        let pw_out = packet_words(self.initial, tl.sw_out);
        let base = (half ^ 1) * self.half_words;
        let mut next_free = [0usize; 2];

        let mut allocate = |target: usize| -> Option<Slot> {
            if next_free[target] + pw_out > self.half_words {
                return None;
            }
            let slot = Slot::new(target as u8, base + next_free[target]);
            next_free[target] += pw_out;
            Some(slot)
        };

        let additions = slots.len() / 2;
        let mut pairs = Vec::with_capacity(additions);
        let mut next_slots = Vec::with_capacity(slots.len().div_ceil(2));

        for p in 0..additions {
            let (a, b) = (slots[2 * p], slots[2 * p + 1]);
            let dst = allocate(p % 2)?;
            let mut ops = Vec::new();
            for w in 0..pw_in {
                ops.push(MacroInstr::vmv_load(StorageClass::R1, a.vwr, a.word + w));
                ops.push(MacroInstr::vmv_load(StorageClass::R2, b.vwr, b.word + w));
                ops.push(MacroInstr::add_pair(tl.sw_in));
                self.write_back(&mut ops, tl, w, dst);
            }
            pairs.push(ops);
            next_slots.push(dst);
        }

        let mut carry = Vec::new();
        let non_reduced = slots.len() % 2;
        if non_reduced == 1 {
            let c = slots[slots.len() - 1];
            let dst = allocate(additions % 2)?;
            for w in 0..pw_in {
                carry.push(MacroInstr::vmv_load(StorageClass::R0, c.vwr, c.word + w));
                self.write_back(&mut carry, tl, w, dst);
            }
            next_slots.push(dst);
        }

        Some(LayerPlan {
            pairs,
            carry,
            slots: next_slots,
            reduced: additions,
            non_reduced,
        })
    }

    /// Store `R0`, holding input word `w` of a packet, into the result packet
    fn write_back(&self, ops: &mut Vec<MacroInstr>, tl: &AddTreeLayer, w: usize, dst: Slot) {
        match tl.repack {
            None => ops.push(MacroInstr::vmv_store(dst.vwr, dst.word + w, StorageClass::R0)),
            Some(kind) => {
                let values = subwords_per_word(self.initial);
                for (offset, out) in pack_schedule(
                    w,
                    subwords_per_word(tl.sw_in),
                    subwords_per_word(tl.sw_out),
                    values,
                ) {
                    ops.push(MacroInstr::pack(kind, offset, dst.vwr, dst.word + out));
                }
            }
        }
    }

    /// Fold layers until the budget, the tree, the operands or
    /// `layer_limit` run out. Emitted instructions are appended to `out`.
    ///
    /// With a limit, folding continues to that layer even once a single
    /// operand remains, so the result matches the width of chunks that
    /// reached the same layer with more operands.
    pub fn generate(
        &self,
        cursor: &mut ReductionCursor,
        slots: &mut Vec<Slot>,
        budget: usize,
        layer_limit: Option<usize>,
        out: &mut Vec<Instruction>,
    ) -> StopReason {
        loop {
            if cursor.layer >= self.layers.len() {
                return StopReason::TreeExhausted;
            }
            if layer_limit.is_some_and(|limit| cursor.layer >= limit) {
                return StopReason::LayerLimit;
            }
            // Under a layer limit a lone operand is still carried so its
            // width keeps pace with the tree
            if slots.is_empty() || (slots.len() == 1 && layer_limit.is_none()) {
                return StopReason::NoAdditions;
            }
            let Some(plan) = self.plan_layer(cursor.layer, slots, cursor.half) else {
                return StopReason::Capacity;
            };
            if cursor.instr_count + plan.len() > budget {
                return StopReason::Budget;
            }

            debug!(
                "folded layer {}: {} operands -> {}, {} instructions",
                cursor.layer + 1,
                slots.len(),
                plan.slots.len(),
                plan.len()
            );
            cursor.advance(&plan);
            *slots = plan.slots.clone();
            out.extend(plan.into_instructions());
        }
    }
}
