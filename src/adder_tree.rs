//! Adder-tree planner
//!
//! Sums `n` partial products per output with a binary tree. Each addition
//! can carry one bit out of a subword, so the subword width climbs the
//! ladder as the tree deepens; the planner decides where it climbs.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CompileError, CompileResult, Diagnostic};
use crate::hardware::{ladder_index, max_width, next_width, previous_width, word_tiles};
use crate::isa::RepackKind;

/// One level of the reduction tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddTreeLayer {
    /// 1-based layer number
    pub index: usize,
    pub inputs: usize,
    pub outputs: usize,
    pub additions: usize,
    pub sw_in: u32,
    pub sw_out: u32,
    pub repack: Option<RepackKind>,
    /// Vector additions needed across all `q` columns
    pub add_ops: usize,
    /// Repack operations needed across all `q` columns
    pub repack_ops: usize,
    /// Growth was warranted but the ladder was already at its maximum
    pub overflow_risk: bool,
}

/// Complete tree for one dot-product length
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdderTree {
    pub layers: Vec<AddTreeLayer>,
    pub warnings: Vec<Diagnostic>,
}

impl AdderTree {
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Width of the fully reduced result
    pub fn final_width(&self, initial: u32) -> u32 {
        self.layers.last().map(|l| l.sw_out).unwrap_or(initial)
    }
}

/// Plan the tree summing `n` products of `initial_width`-bit subwords over
/// `q` output columns
pub fn plan_adder_tree(n: usize, initial_width: u32, q: usize) -> CompileResult<AdderTree> {
    if n == 0 {
        return Err(CompileError::schedule("dot-product length must be at least 1"));
    }
    if ladder_index(initial_width).is_none() {
        return Err(CompileError::schedule(format!(
            "initial subword width {} is not a supported width",
            initial_width
        )));
    }

    let mut layers = Vec::new();
    let mut warnings = Vec::new();
    let mut inputs = n;
    let mut width = initial_width;
    // Layers since the width last grew; each one spent a bit of headroom
    let mut since_growth = 0usize;

    while inputs > 1 {
        let index = layers.len() + 1;
        let sw_in = width;
        let grow = if layers.is_empty() {
            true
        } else {
            let headroom = (sw_in - previous_width(sw_in)) as usize;
            headroom <= since_growth
        };

        let mut overflow_risk = false;
        let sw_out = if !grow {
            sw_in
        } else if sw_in < max_width() {
            next_width(sw_in)
        } else {
            overflow_risk = true;
            sw_in
        };

        if overflow_risk {
            let message = format!(
                "adder-tree layer {}: subword width already {} bits, partial sums may overflow",
                index, sw_in
            );
            warn!("{}", message);
            warnings.push(Diagnostic::new(None, message));
        }

        if sw_out != sw_in {
            since_growth = 1;
        } else {
            since_growth += 1;
        }

        let additions = inputs / 2;
        let outputs = inputs.div_ceil(2);
        let repack = RepackKind::between(sw_in, sw_out);
        layers.push(AddTreeLayer {
            index,
            inputs,
            outputs,
            additions,
            sw_in,
            sw_out,
            repack,
            add_ops: additions * word_tiles(q, sw_in),
            repack_ops: if repack.is_some() {
                outputs * word_tiles(q, sw_out)
            } else {
                0
            },
            overflow_risk,
        });

        inputs = outputs;
        width = sw_out;
    }

    Ok(AdderTree { layers, warnings })
}
