//! Per-event-kind realisation machinery shared by the enumeration kernel
//! and the forward generator.

use rand::rngs::SmallRng;
use rand::Rng;

use crate::nucleotide::{canonical_bases, complement, IntSeq};
use crate::scratch::InsWindow;

/// First canonical base of a (possibly ambiguous) code, used when a chain
/// has to continue through an ambiguous nucleotide.
#[inline]
pub(crate) fn first_canonical(code: u8) -> u8 {
    canonical_bases(code).next().unwrap_or(0)
}

/// Closed-form likelihood of the nucleotides observed in an insertion
/// window under the dinucleotide Markov chain. `slab_base` addresses the
/// event's 4x4 transition slab (row-normalised, previous nucleotide major).
/// `prev` is the flanking germline nucleotide the chain starts from; when it
/// is unknown the first factor averages over starting rows. `reverse` walks
/// the window 3'->5' (DJ insertions).
///
/// Ambiguous read bases contribute the sum over their compatible canonical
/// bases and continue the chain through their first canonical base.
pub(crate) fn dinuc_window_factor(
    marginals: &[f64],
    slab_base: usize,
    read: &[u8],
    window: InsWindow,
    prev: Option<u8>,
    reverse: bool,
) -> f64 {
    let mut factor = 1.0;
    let mut prev = prev.map(first_canonical);
    let mut walk = |pos: i32| {
        let code = read[pos as usize];
        match prev {
            Some(pr) => {
                let row = &marginals[slab_base + 4 * pr as usize..slab_base + 4 * pr as usize + 4];
                factor *= canonical_bases(code).map(|c| row[c as usize]).sum::<f64>();
            }
            None => {
                let mut sum = 0.0;
                for pr in 0..4usize {
                    let row = &marginals[slab_base + 4 * pr..slab_base + 4 * pr + 4];
                    sum += canonical_bases(code).map(|c| row[c as usize]).sum::<f64>();
                }
                factor *= sum / 4.0;
            }
        }
        prev = Some(first_canonical(code));
    };
    if window.is_empty() {
        return 1.0;
    }
    if reverse {
        for pos in (window.begin..=window.end).rev() {
            walk(pos);
        }
    } else {
        for pos in window.begin..=window.end {
            walk(pos);
        }
    }
    factor
}

/// Visit the `(previous, current)` transitions consumed by an insertion
/// window, resolving ambiguous bases to their first canonical base.
/// Positions with no conditioning nucleotide (unknown flank) are skipped.
pub(crate) fn for_each_dinuc_transition(
    read: &[u8],
    window: InsWindow,
    prev: Option<u8>,
    reverse: bool,
    mut f: impl FnMut(u8, u8),
) {
    if window.is_empty() {
        return;
    }
    let mut prev = prev.map(first_canonical);
    let mut walk = |pos: i32| {
        let cur = first_canonical(read[pos as usize]);
        if let Some(pr) = prev {
            f(pr, cur);
        }
        prev = Some(cur);
    };
    if reverse {
        for pos in (window.begin..=window.end).rev() {
            walk(pos);
        }
    } else {
        for pos in window.begin..=window.end {
            walk(pos);
        }
    }
}

/// Sample an index from an unnormalised probability slice.
pub(crate) fn draw_index(slice: &[f64], rng: &mut SmallRng) -> usize {
    let total: f64 = slice.iter().sum();
    if total <= 0.0 {
        return rng.gen_range(0..slice.len());
    }
    let mut target = rng.gen::<f64>() * total;
    for (index, &p) in slice.iter().enumerate() {
        target -= p;
        if target <= 0.0 {
            return index;
        }
    }
    slice.len() - 1
}

/// Sample an inserted nucleotide string of a given length from the
/// transition slab, conditioned on `prev`. The reverse flag mirrors the
/// DJ-side walk; the returned codes are always in read (5'->3') order.
pub(crate) fn draw_dinuc_sequence(
    marginals: &[f64],
    slab_base: usize,
    length: usize,
    prev: Option<u8>,
    reverse: bool,
    rng: &mut SmallRng,
) -> IntSeq {
    let mut prev = prev.map(first_canonical);
    let mut out = Vec::with_capacity(length);
    for _ in 0..length {
        let code = match prev {
            Some(pr) => {
                let row = &marginals[slab_base + 4 * pr as usize..slab_base + 4 * pr as usize + 4];
                draw_index(row, rng) as u8
            }
            None => rng.gen_range(0..4u8),
        };
        out.push(code);
        prev = Some(code);
    }
    if reverse {
        out.reverse();
    }
    out
}

/// Apply signed 5'/3' trims to a template: positive values trim, negative
/// values append the palindromic mirror of the corresponding end.
pub(crate) fn apply_trims(template: &[u8], trim_5: i32, trim_3: i32) -> IntSeq {
    let len = template.len() as i32;
    let cut_5 = trim_5.max(0);
    let cut_3 = trim_3.max(0);
    if cut_5 + cut_3 >= len {
        return IntSeq::new();
    }
    let pal_5 = (-trim_5).max(0) as usize;
    let pal_3 = (-trim_3).max(0) as usize;
    let core = &template[cut_5 as usize..(len - cut_3) as usize];
    let mut out = IntSeq::with_capacity(pal_5 + core.len() + pal_3);
    out.extend(template[..pal_5.min(template.len())].iter().rev().map(|&c| complement(c)));
    out.extend_from_slice(core);
    out.extend(
        template[template.len() - pal_3.min(template.len())..]
            .iter()
            .rev()
            .map(|&c| complement(c)),
    );
    out
}
