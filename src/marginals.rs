//! The packed conditional-probability tensor.
//!
//! All event conditionals live in one flat array. Each event owns a slab of
//! length `own_dim * prod(parent dims)`; within a slab the event's own
//! realisation index varies fastest, so normalisation and the per-sequence
//! accumulator work on contiguous slices. Parents are ordered by descending
//! priority (ties broken lexicographically by name), which fixes the strides
//! uniquely.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::ops::{Add, AddAssign};
use std::path::Path;

use itertools::Itertools;
use rand::rngs::SmallRng;
use rand::Rng;

use crate::error::{Result, VdjError};
use crate::graph::{EventId, ModelParms};

/// Precomputed addressing of the flat tensor: per-event base offsets and
/// parent strides, in the canonical queue order.
#[derive(Debug, Clone)]
pub struct MarginalLayout {
    /// Canonical topological order the tensor blocks follow.
    pub queue: Vec<EventId>,
    /// Base offset of each event's slab, indexed by event id.
    pub index_map: Vec<usize>,
    /// Per event, `(parent, stride)` pairs; the final index is
    /// `base + sum(stride_i * realization(parent_i)) + own_index`.
    pub offsets_map: Vec<Vec<(EventId, usize)>>,
    /// Slab length per event.
    pub event_sizes: Vec<usize>,
    pub total_size: usize,
}

impl MarginalLayout {
    pub fn new(parms: &ModelParms) -> Self {
        let queue = parms.model_queue();
        let n = parms.n_events();
        let mut index_map = vec![0usize; n];
        let mut offsets_map = vec![Vec::new(); n];
        let mut event_sizes = vec![0usize; n];
        let mut base = 0usize;
        for &id in &queue {
            let event = parms.event(id);
            let mut parents = parms.parents(id).to_vec();
            parents.sort_by(|&a, &b| {
                let (ea, eb) = (parms.event(a), parms.event(b));
                eb.priority
                    .cmp(&ea.priority)
                    .then_with(|| ea.name().cmp(&eb.name()))
            });
            let mut strides = Vec::with_capacity(parents.len());
            let mut acc = event.marginal_dim();
            for &parent in parents.iter().rev() {
                strides.push((parent, acc));
                acc *= parms.event(parent).n_realizations();
            }
            strides.reverse();
            index_map[id] = base;
            event_sizes[id] = acc;
            offsets_map[id] = strides;
            base += acc;
        }
        MarginalLayout {
            queue,
            index_map,
            offsets_map,
            event_sizes,
            total_size: base,
        }
    }

    /// Flat index of one event entry given the chosen realisation index of
    /// every event (indexed by event id).
    pub fn slot(&self, event: EventId, chosen: &[usize], own_index: usize) -> usize {
        let mut index = self.index_map[event] + own_index;
        for &(parent, stride) in &self.offsets_map[event] {
            index += stride * chosen[parent];
        }
        index
    }

    /// Number of parent combinations of an event's slab.
    fn n_combinations(&self, parms: &ModelParms, event: EventId) -> usize {
        self.event_sizes[event] / parms.event(event).marginal_dim()
    }
}

/// The flat tensor of conditional probabilities (or, during an iteration,
/// posterior frequencies).
#[derive(Debug, Clone, PartialEq)]
pub struct Marginals {
    probas: Vec<f64>,
}

impl Marginals {
    /// A zero-filled tensor sized for the given graph.
    pub fn new(parms: &ModelParms) -> Self {
        Marginals {
            probas: vec![0.0; MarginalLayout::new(parms).total_size],
        }
    }

    pub fn compute_size(parms: &ModelParms) -> usize {
        MarginalLayout::new(parms).total_size
    }

    pub fn len(&self) -> usize {
        self.probas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probas.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.probas
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.probas
    }

    /// A zero tensor of the same size, used as a per-thread or per-sequence
    /// accumulator.
    pub fn empty_copy(&self) -> Self {
        Marginals {
            probas: vec![0.0; self.probas.len()],
        }
    }

    pub fn null_initialize(&mut self) {
        self.probas.iter_mut().for_each(|x| *x = 0.0);
    }

    pub fn uniform_initialize(&mut self, parms: &ModelParms) {
        let layout = MarginalLayout::new(parms);
        for &id in &layout.queue {
            let base = layout.index_map[id];
            let size = layout.event_sizes[id];
            let value = 1.0 / parms.event(id).norm_block() as f64;
            self.probas[base..base + size].iter_mut().for_each(|x| *x = value);
        }
    }

    /// Unit-simplex draws per normalisation block.
    pub fn random_initialize(&mut self, parms: &ModelParms, rng: &mut SmallRng) {
        for x in self.probas.iter_mut() {
            *x = rng.gen::<f64>();
        }
        self.normalize(parms);
    }

    /// Renormalise each conditional slice to sum to one; an all-zero slice
    /// becomes uniform.
    pub fn normalize(&mut self, parms: &ModelParms) {
        let layout = MarginalLayout::new(parms);
        for &id in &layout.queue {
            let event = parms.event(id);
            let base = layout.index_map[id];
            let size = layout.event_sizes[id];
            let block = event.norm_block();
            for chunk in self.probas[base..base + size].chunks_mut(block) {
                let sum: f64 = chunk.iter().sum();
                if sum > 0.0 {
                    chunk.iter_mut().for_each(|x| *x /= sum);
                } else {
                    let uniform = 1.0 / block as f64;
                    chunk.iter_mut().for_each(|x| *x = uniform);
                }
            }
        }
    }

    /// Restore the slabs of fixed events from the previous iteration.
    pub fn copy_fixed_events_marginals(&mut self, previous: &Marginals, parms: &ModelParms) {
        let layout = MarginalLayout::new(parms);
        for &id in &layout.queue {
            if !parms.event(id).fixed {
                continue;
            }
            let base = layout.index_map[id];
            let size = layout.event_sizes[id];
            self.probas[base..base + size].copy_from_slice(&previous.probas[base..base + size]);
        }
    }

    /// Clamp one realisation of an event to probability `p` and rescale the
    /// remaining realisations proportionally, per parent combination.
    pub fn set_realization_proba(
        &mut self,
        parms: &ModelParms,
        event: EventId,
        realization_name: &str,
        p: f64,
    ) -> Result<()> {
        let target = parms
            .event(event)
            .realization_by_name(realization_name)
            .ok_or_else(|| {
                VdjError::Config(format!(
                    "event \"{}\" has no realization \"{realization_name}\"",
                    parms.event(event).name()
                ))
            })?
            .index;
        let layout = MarginalLayout::new(parms);
        let base = layout.index_map[event];
        let size = layout.event_sizes[event];
        let block = parms.event(event).norm_block();
        for chunk in self.probas[base..base + size].chunks_mut(block) {
            let others: f64 = chunk
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != target)
                .map(|(_, x)| x)
                .sum();
            if others > 0.0 {
                let factor = (1.0 - p) / others;
                for (i, x) in chunk.iter_mut().enumerate() {
                    if i != target {
                        *x *= factor;
                    }
                }
            } else if block > 1 {
                let uniform = (1.0 - p) / (block - 1) as f64;
                for (i, x) in chunk.iter_mut().enumerate() {
                    if i != target {
                        *x = uniform;
                    }
                }
            }
            chunk[target] = p;
        }
        Ok(())
    }

    /// Marginalise an event out of the conditionals that mention it: its own
    /// slab becomes uniform and every child's slab is averaged over the
    /// event's dimension, preserving the children's marginals.
    pub fn flatten(&mut self, parms: &ModelParms, event: EventId) -> Result<()> {
        let layout = MarginalLayout::new(parms);
        let base = layout.index_map[event];
        let size = layout.event_sizes[event];
        let uniform = 1.0 / parms.event(event).norm_block() as f64;
        self.probas[base..base + size].iter_mut().for_each(|x| *x = uniform);

        let n_flat = parms.event(event).n_realizations();
        for &child in layout.queue.iter() {
            let Some(&(_, stride)) = layout.offsets_map[child]
                .iter()
                .find(|(parent, _)| *parent == event)
            else {
                continue;
            };
            let child_base = layout.index_map[child];
            let child_size = layout.event_sizes[child];
            // Walk each position of the slab once, averaging across the
            // flattened dimension from its zero-index plane.
            for pos in 0..child_size {
                let local = pos % (stride * n_flat);
                if local / stride != 0 {
                    continue;
                }
                let mut avg = 0.0;
                for r in 0..n_flat {
                    avg += self.probas[child_base + pos + r * stride];
                }
                avg /= n_flat as f64;
                for r in 0..n_flat {
                    self.probas[child_base + pos + r * stride] = avg;
                }
            }
        }
        Ok(())
    }

    /// Reverse the conditioning between `a` and its child `b` while
    /// preserving the joint distribution. Supported for a parent-less `a`
    /// (pairwise neighbouring-dimension swap); richer surroundings are
    /// rejected.
    pub fn invert_edge(
        &self,
        parms: &mut ModelParms,
        a: EventId,
        b: EventId,
    ) -> Result<Marginals> {
        if !parms.has_edge(a, b) {
            return Err(VdjError::Config(format!(
                "no edge \"{}\" -> \"{}\" to invert",
                parms.event(a).name(),
                parms.event(b).name()
            )));
        }
        if !parms.parents(a).is_empty() || parms.parents(b).len() != 1 {
            return Err(VdjError::Config(format!(
                "inverting edge \"{}\" -> \"{}\": only a neighbouring root/child pair can be swapped",
                parms.event(a).name(),
                parms.event(b).name()
            )));
        }
        let old_layout = MarginalLayout::new(parms);
        let n_a = parms.event(a).n_realizations();
        let n_b = parms.event(b).n_realizations();
        let stride_a_old = old_layout.offsets_map[b]
            .iter()
            .find(|(parent, _)| *parent == a)
            .map(|&(_, s)| s)
            .expect("edge exists");

        parms.invert_edge(a, b)?;
        let new_layout = MarginalLayout::new(parms);
        let mut new = Marginals {
            probas: vec![0.0; new_layout.total_size],
        };

        let mut chosen = vec![0usize; parms.n_events()];
        for x_b in 0..n_b {
            // P'(b) = sum_a P(a) P(b | a)
            let mut marginal_b = 0.0;
            for x_a in 0..n_a {
                let p_a = self.probas[old_layout.index_map[a] + x_a];
                let p_b_given_a = self.probas[old_layout.index_map[b] + stride_a_old * x_a + x_b];
                marginal_b += p_a * p_b_given_a;
            }
            chosen[b] = x_b;
            new.probas[new_layout.slot(b, &chosen, x_b)] = marginal_b;

            // P'(a | b) = P(a) P(b | a) / P'(b)
            for x_a in 0..n_a {
                let p_a = self.probas[old_layout.index_map[a] + x_a];
                let p_b_given_a = self.probas[old_layout.index_map[b] + stride_a_old * x_a + x_b];
                let slot_a = new_layout.slot(a, &chosen, x_a);
                new.probas[slot_a] = if marginal_b > 0.0 {
                    p_a * p_b_given_a / marginal_b
                } else {
                    1.0 / n_a as f64
                };
            }
        }
        Ok(new)
    }

    pub fn write_txt<P: AsRef<Path>>(&self, path: P, parms: &ModelParms) -> Result<()> {
        let layout = MarginalLayout::new(parms);
        let mut w = BufWriter::new(File::create(path)?);
        for &id in &layout.queue {
            let event = parms.event(id);
            let label = if event.nickname.is_empty() {
                event.name()
            } else {
                event.nickname.clone()
            };
            writeln!(w, "@{label}")?;
            let parent_dims: Vec<String> = layout.offsets_map[id]
                .iter()
                .map(|&(parent, _)| parms.event(parent).n_realizations().to_string())
                .collect();
            let own_dim = event.marginal_dim();
            let dims = parent_dims
                .into_iter()
                .chain(std::iter::once(own_dim.to_string()))
                .collect::<Vec<_>>()
                .join(",");
            writeln!(w, "$Dim[{dims}]")?;

            let base = layout.index_map[id];
            let n_combos = layout.n_combinations(parms, id);
            for combo in 0..n_combos {
                let mut labels = Vec::new();
                let mut rem = combo;
                for &(parent, _) in layout.offsets_map[id].iter().rev() {
                    let n = parms.event(parent).n_realizations();
                    labels.push(format!(
                        "[{},{}]",
                        parent_label(parms, parent),
                        rem % n
                    ));
                    rem /= n;
                }
                labels.reverse();
                writeln!(w, "#{}", labels.join(","))?;
                let start = base + combo * own_dim;
                writeln!(w, "%{}", self.probas[start..start + own_dim].iter().join(","))?;
            }
        }
        Ok(())
    }

    pub fn read_txt<P: AsRef<Path>>(path: P, parms: &ModelParms) -> Result<Marginals> {
        let layout = MarginalLayout::new(parms);
        let mut marginals = Marginals {
            probas: vec![0.0; layout.total_size],
        };
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut lines = reader
            .lines()
            .collect::<std::io::Result<Vec<String>>>()?
            .into_iter()
            .peekable();

        for &id in &layout.queue {
            let event = parms.event(id);
            let header = lines
                .next()
                .ok_or_else(|| VdjError::InputFormat("truncated marginals file".to_string()))?;
            let label = header.strip_prefix('@').ok_or_else(|| {
                VdjError::InputFormat(format!("expected event header, got \"{header}\""))
            })?;
            if label != event.nickname && label != event.name() {
                return Err(VdjError::InputFormat(format!(
                    "marginals block \"{label}\" does not match event \"{}\"",
                    event.name()
                )));
            }
            let dims_line = lines
                .next()
                .ok_or_else(|| VdjError::InputFormat("truncated marginals file".to_string()))?;
            if !dims_line.starts_with("$Dim[") {
                return Err(VdjError::InputFormat(format!(
                    "expected $Dim line, got \"{dims_line}\""
                )));
            }

            let base = layout.index_map[id];
            let own_dim = event.marginal_dim();
            let n_combos = layout.n_combinations(parms, id);
            for combo in 0..n_combos {
                let parent_line = lines
                    .next()
                    .filter(|l| l.starts_with('#'))
                    .ok_or_else(|| {
                        VdjError::InputFormat(format!(
                            "missing parent-combination line for event \"{}\"",
                            event.name()
                        ))
                    })?;
                let _ = parent_line;
                let proba_line = lines
                    .next()
                    .filter(|l| l.starts_with('%'))
                    .ok_or_else(|| {
                        VdjError::InputFormat(format!(
                            "missing probability line for event \"{}\"",
                            event.name()
                        ))
                    })?;
                let values = proba_line[1..]
                    .split(',')
                    .map(|x| {
                        x.trim().parse::<f64>().map_err(|_| {
                            VdjError::InputFormat(format!("bad float in \"{proba_line}\""))
                        })
                    })
                    .collect::<Result<Vec<f64>>>()?;
                if values.len() != own_dim {
                    return Err(VdjError::InputFormat(format!(
                        "expected {own_dim} probabilities for event \"{}\", got {}",
                        event.name(),
                        values.len()
                    )));
                }
                let start = base + combo * own_dim;
                marginals.probas[start..start + own_dim].copy_from_slice(&values);
            }
        }
        Ok(marginals)
    }
}

fn parent_label(parms: &ModelParms, parent: EventId) -> String {
    let event = parms.event(parent);
    if event.nickname.is_empty() {
        event.name()
    } else {
        event.nickname.clone()
    }
}

impl AddAssign<&Marginals> for Marginals {
    fn add_assign(&mut self, rhs: &Marginals) {
        debug_assert_eq!(self.probas.len(), rhs.probas.len());
        for (a, b) in self.probas.iter_mut().zip(&rhs.probas) {
            *a += b;
        }
    }
}

impl Add<&Marginals> for Marginals {
    type Output = Marginals;

    fn add(mut self, rhs: &Marginals) -> Marginals {
        self += rhs;
        self
    }
}
