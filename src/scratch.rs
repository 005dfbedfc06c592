//! Per-worker mutable state threaded through the scenario recursion.
//!
//! The six sequence types form a closed enum, so the per-scenario
//! reconstruction lives in fixed-index arrays instead of keyed maps. The
//! scratchpad is built once per worker, shallow-reset at the start of each
//! sequence, and mutated in place with stack-local undo inside the
//! recursion.

use crate::graph::GeneClass;
use crate::nucleotide::{complement, compatible, IntSeq};

/// The six reconstructed sub-sequences of a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqType {
    VGeneSeq,
    DGeneSeq,
    JGeneSeq,
    VDInsSeq,
    VJInsSeq,
    DJInsSeq,
}

/// Read-order (5'->3') concatenation of the sequence types; parts a model
/// does not produce stay empty.
pub const ASSEMBLY_ORDER: [SeqType; 6] = [
    SeqType::VGeneSeq,
    SeqType::VJInsSeq,
    SeqType::VDInsSeq,
    SeqType::DGeneSeq,
    SeqType::DJInsSeq,
    SeqType::JGeneSeq,
];

/// Index of a gene class into the gene-segment slots.
pub fn gene_slot(class: GeneClass) -> Option<usize> {
    match class {
        GeneClass::V => Some(0),
        GeneClass::D => Some(1),
        GeneClass::J => Some(2),
        _ => None,
    }
}

pub const GENE_CLASSES: [GeneClass; 3] = [GeneClass::V, GeneClass::D, GeneClass::J];

/// Index of a composite class into the insertion-window slots.
pub fn ins_slot(class: GeneClass) -> Option<usize> {
    match class {
        GeneClass::VD => Some(0),
        GeneClass::VJ => Some(1),
        GeneClass::DJ => Some(2),
        _ => None,
    }
}

/// One chosen gene segment: which alignment fixed it and the current
/// (deletion-adjusted) read window.
#[derive(Debug, Clone, Copy)]
pub struct GeneSegment {
    /// Index into the read's alignment list for this gene class.
    pub alignment: usize,
    /// Realisation index of the chosen template.
    pub realization: usize,
    /// Read index where template position 0 aligns.
    pub offset: i32,
    pub template_len: i32,
    /// Current 5' end in read coordinates (inclusive).
    pub begin: i32,
    /// Current 3' end in read coordinates (inclusive); `end < begin` is an
    /// empty segment.
    pub end: i32,
    /// Signed 5'/3' deletion values; negative values are palindromic
    /// P-nucleotide extensions.
    pub trim_5: i32,
    pub trim_3: i32,
}

impl GeneSegment {
    /// Expected germline code at a read position inside the window.
    /// Positions past the template ends mirror into the palindromic
    /// extension.
    pub fn germline_at(&self, template: &[u8], read_pos: i32) -> u8 {
        let t = read_pos - self.offset;
        if t < 0 {
            complement(template[(-t - 1) as usize])
        } else if t < self.template_len {
            template[t as usize]
        } else {
            complement(template[(2 * self.template_len - 1 - t) as usize])
        }
    }
}

/// An inserted-segment window in read coordinates, inclusive; `end < begin`
/// is the valid zero-length insertion.
#[derive(Debug, Clone, Copy)]
pub struct InsWindow {
    pub begin: i32,
    pub end: i32,
}

impl InsWindow {
    pub fn len(&self) -> i32 {
        (self.end - self.begin + 1).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.begin
    }
}

/// Per-worker scenario scratchpad. Containers are cleared between
/// sequences, never re-allocated.
#[derive(Debug, Default)]
pub struct Scratchpad {
    /// V, D, J gene segments.
    pub gene: [Option<GeneSegment>; 3],
    /// VD, VJ, DJ insertion windows.
    pub ins: [Option<InsWindow>; 3],
    /// Reusable germline reconstruction buffers, one per gene slot.
    pub germline_buf: [IntSeq; 3],
    /// Reusable window-relative mismatch buffers, one per gene slot.
    pub mismatch_buf: [Vec<usize>; 3],
    /// Tensor slots touched by the scenario being completed.
    pub scenario_slots: Vec<usize>,
    /// Slots of the best scenario seen for this read (Viterbi mode).
    pub best_slots: Vec<usize>,
}

impl Scratchpad {
    pub fn new() -> Self {
        Scratchpad::default()
    }

    /// Shallow reset at the start of each sequence.
    pub fn reset(&mut self) {
        self.gene = [None; 3];
        self.ins = [None; 3];
        for buf in &mut self.germline_buf {
            buf.clear();
        }
        for buf in &mut self.mismatch_buf {
            buf.clear();
        }
        self.scenario_slots.clear();
        self.best_slots.clear();
    }

    /// Rebuild the germline/mismatch buffers of one gene slot for the
    /// segment's current window, comparing against the read.
    pub fn rebuild_segment_buffers(&mut self, slot: usize, template: &[u8], read: &[u8]) {
        let segment = self.gene[slot].expect("segment set before scoring");
        let germline = &mut self.germline_buf[slot];
        let mismatches = &mut self.mismatch_buf[slot];
        germline.clear();
        mismatches.clear();
        if segment.end < segment.begin {
            return;
        }
        for read_pos in segment.begin..=segment.end {
            let expected = segment.germline_at(template, read_pos);
            if !compatible(expected, read[read_pos as usize]) {
                mismatches.push(germline.len());
            }
            germline.push(expected);
        }
    }
}
