//! The recursive scenario-enumeration kernel.
//!
//! One read at a time: events are visited in the canonical queue order, each
//! enumerating the realisations consistent with the scratchpad so far.
//! Partial scenarios whose best possible completion falls below
//! `threshold_factor * p_best` are pruned using precomputed downstream
//! bounds. Completed scenarios are scored through the error model and their
//! weight written into the per-sequence accumulator at every event's tensor
//! slot.

use fnv::FnvHashMap;

use crate::align::Alignment;
use crate::error::{Result, VdjError};
use crate::error_model::{ErrorModel, ScenarioObservation, SegmentObservation};
use crate::graph::{EventId, EventType, GeneClass, ModelParms, SeqSide};
use crate::marginals::{MarginalLayout, Marginals};
use crate::nucleotide::IntSeq;
use crate::scratch::{gene_slot, ins_slot, GeneSegment, InsWindow, Scratchpad, GENE_CLASSES};

use super::events::{dinuc_window_factor, for_each_dinuc_transition};

/// Per-read alignment lists keyed by gene class.
pub type AlignmentBundle = FnvHashMap<GeneClass, Vec<Alignment>>;

/// Read-only state shared by every worker during one EM iteration.
pub(crate) struct SharedInference<'a> {
    pub parms: &'a ModelParms,
    pub layout: &'a MarginalLayout,
    pub marginals: &'a Marginals,
    /// Upper bound on the product of downstream conditionals, per queue
    /// position (excluding the event at that position).
    pub bounds_after: &'a [f64],
    pub threshold_factor: f64,
    pub likelihood_threshold: f64,
    pub viterbi: bool,
    /// GeneChoice event per gene slot (V, D, J), if the model has one.
    pub gene_choice_events: [Option<EventId>; 3],
}

impl<'a> SharedInference<'a> {
    pub fn gene_choice_template(&self, slot: usize, segment: &GeneSegment) -> &'a [u8] {
        let event = self.gene_choice_events[slot].expect("segment implies a gene choice event");
        self.parms.event(event).realizations()[segment.realization]
            .seq
            .as_deref()
            .expect("gene choice realizations carry sequences")
    }
}

/// Upper bound per queue position on the product of marginal conditionals
/// of all downstream events. Recomputed once per EM iteration.
pub(crate) fn downstream_bounds(
    parms: &ModelParms,
    layout: &MarginalLayout,
    marginals: &Marginals,
) -> Vec<f64> {
    let mut bounds = vec![1.0; layout.queue.len()];
    let mut acc = 1.0f64;
    for qpos in (0..layout.queue.len()).rev() {
        bounds[qpos] = acc;
        let id = layout.queue[qpos];
        let event = parms.event(id);
        let event_bound = match event.event_type {
            // The chain factor is a product of row entries, each <= 1.
            EventType::DinucMarkov => 1.0,
            _ => {
                let base = layout.index_map[id];
                let size = layout.event_sizes[id];
                marginals.as_slice()[base..base + size]
                    .iter()
                    .fold(0.0f64, |a, &b| a.max(b))
            }
        };
        acc *= event_bound;
    }
    bounds
}

/// Result of enumerating one read.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SequenceOutcome {
    pub likelihood: f64,
    pub mean_errors: f64,
    pub n_scenarios: u64,
    pub best_scenario: f64,
}

struct RunStats {
    likelihood_sum: f64,
    /// Best completed-scenario likelihood, seeded so that scenarios below
    /// the likelihood threshold are pruned from the start.
    p_best: f64,
    best_scenario: f64,
    n_scenarios: u64,
}

/// Per-worker enumeration state, reset between reads.
pub(crate) struct Enumerator {
    chosen: Vec<usize>,
    scratch: Scratchpad,
    pub seq_marginals: Vec<f64>,
}

impl Enumerator {
    pub fn new(n_events: usize, tensor_len: usize) -> Self {
        Enumerator {
            chosen: vec![0; n_events],
            scratch: Scratchpad::new(),
            seq_marginals: vec![0.0; tensor_len],
        }
    }

    /// Enumerate all scenarios of one read, filling `seq_marginals` with
    /// posterior weights normalised to unit mass.
    pub fn run(
        &mut self,
        shared: &SharedInference,
        error_model: &mut ErrorModel,
        read: &IntSeq,
        bundle: &AlignmentBundle,
    ) -> Result<SequenceOutcome> {
        self.scratch.reset();
        self.chosen.iter_mut().for_each(|x| *x = 0);
        self.seq_marginals.iter_mut().for_each(|x| *x = 0.0);

        let mut stats = RunStats {
            likelihood_sum: 0.0,
            p_best: shared.likelihood_threshold / shared.threshold_factor,
            best_scenario: 0.0,
            n_scenarios: 0,
        };
        self.iterate(shared, error_model, read, bundle, 0, 1.0, &mut stats)?;

        let likelihood = if shared.viterbi {
            for &slot in &self.scratch.best_slots {
                self.seq_marginals[slot] += stats.best_scenario;
            }
            stats.best_scenario
        } else {
            stats.likelihood_sum
        };

        // Unit mass per read.
        if likelihood > 0.0 {
            self.seq_marginals.iter_mut().for_each(|x| *x /= likelihood);
        }

        Ok(SequenceOutcome {
            likelihood,
            mean_errors: error_model.seq_mean_errors(),
            n_scenarios: stats.n_scenarios,
            best_scenario: stats.best_scenario,
        })
    }

    fn iterate(
        &mut self,
        shared: &SharedInference,
        error_model: &mut ErrorModel,
        read: &IntSeq,
        bundle: &AlignmentBundle,
        qpos: usize,
        p: f64,
        stats: &mut RunStats,
    ) -> Result<()> {
        if qpos == shared.layout.queue.len() {
            self.terminal(shared, error_model, read, p, stats);
            return Ok(());
        }
        let id = shared.layout.queue[qpos];
        let event = shared.parms.event(id);
        match event.event_type {
            EventType::GeneChoice => {
                self.iterate_gene_choice(shared, error_model, read, bundle, qpos, p, stats)
            }
            EventType::Deletion => {
                self.iterate_deletion(shared, error_model, read, bundle, qpos, p, stats)
            }
            EventType::Insertion => {
                self.iterate_insertion(shared, error_model, read, bundle, qpos, p, stats)
            }
            EventType::DinucMarkov => {
                self.iterate_dinuc(shared, error_model, read, bundle, qpos, p, stats)
            }
        }
    }

    #[inline]
    fn should_explore(&self, shared: &SharedInference, qpos: usize, p: f64, stats: &RunStats) -> bool {
        p * shared.bounds_after[qpos] >= shared.threshold_factor * stats.p_best
    }

    fn iterate_gene_choice(
        &mut self,
        shared: &SharedInference,
        error_model: &mut ErrorModel,
        read: &IntSeq,
        bundle: &AlignmentBundle,
        qpos: usize,
        p: f64,
        stats: &mut RunStats,
    ) -> Result<()> {
        let id = shared.layout.queue[qpos];
        let event = shared.parms.event(id);
        let slot = gene_slot(event.class).ok_or_else(|| {
            VdjError::Config(format!(
                "GeneChoice event \"{}\" must have gene class V, D or J",
                event.name()
            ))
        })?;
        // An empty alignment list contributes zero weight, not an error.
        let Some(alignments) = bundle.get(&event.class) else {
            return Ok(());
        };
        let read_len = read.len() as i32;

        for (alignment_index, alignment) in alignments.iter().enumerate() {
            let realization = event.realization_by_name(&alignment.gene_name).ok_or_else(|| {
                VdjError::Config(format!(
                    "alignment references template \"{}\" unknown to event \"{}\"",
                    alignment.gene_name,
                    event.name()
                ))
            })?;
            self.chosen[id] = realization.index;
            let p_event =
                shared.marginals.as_slice()[shared.layout.slot(id, &self.chosen, realization.index)];
            if p_event <= 0.0 {
                continue;
            }
            let template_len = realization.seq.as_ref().map_or(0, Vec::len) as i32;
            let segment = GeneSegment {
                alignment: alignment_index,
                realization: realization.index,
                offset: alignment.offset,
                template_len,
                begin: alignment.offset.max(0),
                end: (alignment.offset + template_len - 1).min(read_len - 1),
                trim_5: 0,
                trim_3: 0,
            };
            self.scratch.gene[slot] = Some(segment);
            let new_p = p * p_event;
            if self.should_explore(shared, qpos, new_p, stats) {
                self.iterate(shared, error_model, read, bundle, qpos + 1, new_p, stats)?;
            }
        }
        self.scratch.gene[slot] = None;
        Ok(())
    }

    fn iterate_deletion(
        &mut self,
        shared: &SharedInference,
        error_model: &mut ErrorModel,
        read: &IntSeq,
        bundle: &AlignmentBundle,
        qpos: usize,
        p: f64,
        stats: &mut RunStats,
    ) -> Result<()> {
        let id = shared.layout.queue[qpos];
        let event = shared.parms.event(id);
        let slot = gene_slot(event.class).ok_or_else(|| {
            VdjError::Config(format!(
                "Deletion event \"{}\" must have gene class V, D or J",
                event.name()
            ))
        })?;
        let Some(original) = self.scratch.gene[slot] else {
            // The gene class was not assigned for this read.
            return Ok(());
        };
        let read_len = read.len() as i32;

        for r in 0..event.n_realizations() {
            let realization = &event.realizations()[r];
            let trim = realization.value;
            // A palindromic extension cannot mirror more than the template.
            if trim < -original.template_len || trim > original.template_len {
                continue;
            }
            let mut segment = original;
            match event.side {
                SeqSide::ThreePrime => {
                    segment.trim_3 = trim;
                    segment.end =
                        (original.offset + original.template_len - 1 - trim).min(read_len - 1);
                }
                SeqSide::FivePrime => {
                    segment.trim_5 = trim;
                    segment.begin = (original.offset + trim).max(0);
                }
                SeqSide::Undefined => {
                    return Err(VdjError::Config(format!(
                        "Deletion event \"{}\" needs a defined sequence side",
                        event.name()
                    )));
                }
            }
            self.chosen[id] = realization.index;
            let p_event =
                shared.marginals.as_slice()[shared.layout.slot(id, &self.chosen, realization.index)];
            if p_event <= 0.0 {
                continue;
            }
            self.scratch.gene[slot] = Some(segment);
            let new_p = p * p_event;
            if self.should_explore(shared, qpos, new_p, stats) {
                self.iterate(shared, error_model, read, bundle, qpos + 1, new_p, stats)?;
            }
        }
        self.scratch.gene[slot] = Some(original);
        Ok(())
    }

    fn iterate_insertion(
        &mut self,
        shared: &SharedInference,
        error_model: &mut ErrorModel,
        read: &IntSeq,
        bundle: &AlignmentBundle,
        qpos: usize,
        p: f64,
        stats: &mut RunStats,
    ) -> Result<()> {
        let id = shared.layout.queue[qpos];
        let event = shared.parms.event(id);
        let ins_index = ins_slot(event.class).ok_or_else(|| {
            VdjError::Config(format!(
                "Insertion event \"{}\" must have gene class VD, VJ or DJ",
                event.name()
            ))
        })?;
        let (left, right) = match event.class {
            GeneClass::VD => (self.scratch.gene[0], self.scratch.gene[1]),
            GeneClass::VJ => (self.scratch.gene[0], self.scratch.gene[2]),
            GeneClass::DJ => (self.scratch.gene[1], self.scratch.gene[2]),
            _ => unreachable!("checked by ins_slot"),
        };
        let (Some(left), Some(right)) = (left, right) else {
            return Ok(());
        };
        // The insertion count is fixed by the gap between the flanking
        // segments; it is consistent iff the count is a realisation.
        let gap = right.begin - left.end - 1;
        let Some(realization) = event.realization_by_value(gap) else {
            return Ok(());
        };
        self.chosen[id] = realization.index;
        let p_event =
            shared.marginals.as_slice()[shared.layout.slot(id, &self.chosen, realization.index)];
        if p_event <= 0.0 {
            return Ok(());
        }
        self.scratch.ins[ins_index] = Some(InsWindow {
            begin: left.end + 1,
            end: right.begin - 1,
        });
        let new_p = p * p_event;
        if self.should_explore(shared, qpos, new_p, stats) {
            self.iterate(shared, error_model, read, bundle, qpos + 1, new_p, stats)?;
        }
        self.scratch.ins[ins_index] = None;
        Ok(())
    }

    fn iterate_dinuc(
        &mut self,
        shared: &SharedInference,
        error_model: &mut ErrorModel,
        read: &IntSeq,
        bundle: &AlignmentBundle,
        qpos: usize,
        p: f64,
        stats: &mut RunStats,
    ) -> Result<()> {
        let id = shared.layout.queue[qpos];
        let event = shared.parms.event(id);
        let ins_index = ins_slot(event.class).ok_or_else(|| {
            VdjError::Config(format!(
                "DinucMarkov event \"{}\" must have gene class VD, VJ or DJ",
                event.name()
            ))
        })?;
        let Some(window) = self.scratch.ins[ins_index] else {
            return Ok(());
        };
        self.chosen[id] = 0;
        let (prev, reverse) = self.dinuc_context(shared, event.class);
        let slab_base = shared.layout.slot(id, &self.chosen, 0);
        let factor = dinuc_window_factor(
            shared.marginals.as_slice(),
            slab_base,
            read,
            window,
            prev,
            reverse,
        );
        let new_p = p * factor;
        if new_p > 0.0 && self.should_explore(shared, qpos, new_p, stats) {
            self.iterate(shared, error_model, read, bundle, qpos + 1, new_p, stats)?;
        }
        Ok(())
    }

    /// Conditioning nucleotide and walk direction for an insertion window:
    /// VD/VJ chains run 5'->3' from the V side, DJ chains run 3'->5' from
    /// the J side.
    fn dinuc_context(&self, shared: &SharedInference, class: GeneClass) -> (Option<u8>, bool) {
        match class {
            GeneClass::VD | GeneClass::VJ => {
                let flank = self.scratch.gene[0];
                let prev = flank.filter(|s| s.end >= s.begin).map(|s| {
                    s.germline_at(shared.gene_choice_template(0, &s), s.end)
                });
                (prev, false)
            }
            GeneClass::DJ => {
                let flank = self.scratch.gene[2];
                let prev = flank.filter(|s| s.end >= s.begin).map(|s| {
                    s.germline_at(shared.gene_choice_template(2, &s), s.begin)
                });
                (prev, true)
            }
            _ => (None, false),
        }
    }

    /// After the last event: score the mismatches, update the running best
    /// and write the scenario weight into the per-sequence accumulator.
    fn terminal(
        &mut self,
        shared: &SharedInference,
        error_model: &mut ErrorModel,
        read: &IntSeq,
        p: f64,
        stats: &mut RunStats,
    ) {
        for slot in 0..3 {
            if let Some(segment) = self.scratch.gene[slot] {
                let template = shared.gene_choice_template(slot, &segment);
                self.scratch.rebuild_segment_buffers(slot, template, read);
            }
        }
        let mut observation: ScenarioObservation = [None, None, None];
        for slot in 0..3 {
            if self.scratch.gene[slot].is_some() {
                observation[slot] = Some(SegmentObservation {
                    class: GENE_CLASSES[slot],
                    germline: &self.scratch.germline_buf[slot],
                    mismatches: &self.scratch.mismatch_buf[slot],
                });
            }
        }

        let scenario_likelihood = p * error_model.scenario_factor(&observation);
        stats.n_scenarios += 1;
        if scenario_likelihood <= 0.0 {
            return;
        }

        self.scratch.scenario_slots.clear();
        for &id in &shared.layout.queue {
            let event = shared.parms.event(id);
            match event.event_type {
                EventType::DinucMarkov => {
                    let Some(ins_index) = ins_slot(event.class) else {
                        continue;
                    };
                    let Some(window) = self.scratch.ins[ins_index] else {
                        continue;
                    };
                    let (prev, reverse) = self.dinuc_context(shared, event.class);
                    let slab_base = shared.layout.slot(id, &self.chosen, 0);
                    let slots = &mut self.scratch.scenario_slots;
                    for_each_dinuc_transition(read, window, prev, reverse, |pr, cur| {
                        slots.push(slab_base + 4 * pr as usize + cur as usize);
                    });
                }
                _ => {
                    self.scratch
                        .scenario_slots
                        .push(shared.layout.slot(id, &self.chosen, self.chosen[id]));
                }
            }
        }

        if shared.viterbi {
            if scenario_likelihood > stats.best_scenario {
                stats.best_scenario = scenario_likelihood;
                stats.p_best = stats.p_best.max(scenario_likelihood);
                error_model.discard_sequence();
                error_model.accumulate(scenario_likelihood, &observation);
                self.scratch.best_slots.clear();
                self.scratch
                    .best_slots
                    .extend_from_slice(&self.scratch.scenario_slots);
            }
        } else {
            stats.likelihood_sum += scenario_likelihood;
            stats.best_scenario = stats.best_scenario.max(scenario_likelihood);
            stats.p_best = stats.p_best.max(scenario_likelihood);
            error_model.accumulate(scenario_likelihood, &observation);
            for &slot in &self.scratch.scenario_slots {
                self.seq_marginals[slot] += scenario_likelihood;
            }
        }
    }
}
