//! Expectation-Maximisation over a corpus of aligned reads.
//!
//! Each iteration fans the reads out over rayon workers. A worker owns its
//! accumulators (marginal tensor, error-model counters, counter plug-ins)
//! and shares the iteration inputs read-only; the only guarded sections are
//! progress emission, the per-sequence log line, counter dumps and the
//! end-of-iteration reduction. Merged marginals are order-independent
//! because the merge is plain addition.

pub(crate) mod events;
mod kernel;

pub use kernel::AlignmentBundle;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use fnv::FnvHashMap;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::align::Alignment;
use crate::counters::CounterRegistry;
use crate::error::{Result, VdjError};
use crate::error_model::ErrorModel;
use crate::graph::{EventId, EventType, GeneClass, ModelParms, SeqSide};
use crate::io::IndexedSeq;
use crate::marginals::{MarginalLayout, Marginals};
use crate::nucleotide::nt2int;
use crate::scratch::gene_slot;

use kernel::{downstream_bounds, Enumerator, SharedInference};

/// One read with its alignment bundle, the unit of work for inference.
#[derive(Debug, Clone)]
pub struct SequenceRecord {
    pub index: i32,
    pub seq: String,
    pub alignments: AlignmentBundle,
}

/// Merge per-class alignment tables (as read back from CSV) into one record
/// per indexed read.
pub fn build_sequence_records(
    sequences: &[IndexedSeq],
    per_class: Vec<(GeneClass, FnvHashMap<i32, Vec<Alignment>>)>,
) -> Vec<SequenceRecord> {
    let mut records: Vec<SequenceRecord> = sequences
        .iter()
        .map(|s| SequenceRecord {
            index: s.index,
            seq: s.seq.clone(),
            alignments: AlignmentBundle::default(),
        })
        .collect();
    for (class, mut alignments) in per_class {
        for record in &mut records {
            let class_alignments = alignments.remove(&record.index).unwrap_or_default();
            record.alignments.insert(class, class_alignments);
        }
    }
    records
}

#[derive(Debug, Clone)]
pub struct InferenceOptions {
    pub n_iterations: usize,
    pub likelihood_threshold: f64,
    pub proba_threshold_factor: f64,
    pub viterbi: bool,
    pub mean_error_threshold: f64,
    /// Restrict the first iteration to the best V/J alignments.
    pub fast_iter: bool,
    /// Where log files and per-iteration snapshots are written; `None`
    /// disables file output.
    pub output_dir: Option<PathBuf>,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        InferenceOptions {
            n_iterations: 1,
            likelihood_threshold: 1e-25,
            proba_threshold_factor: 1e-3,
            viterbi: false,
            mean_error_threshold: f64::INFINITY,
            fast_iter: false,
            output_dir: None,
        }
    }
}

impl InferenceOptions {
    pub fn n_iterations(mut self, n: usize) -> Self {
        self.n_iterations = n;
        self
    }

    pub fn likelihood_threshold(mut self, threshold: f64) -> Self {
        self.likelihood_threshold = threshold;
        self
    }

    pub fn proba_threshold_factor(mut self, factor: f64) -> Self {
        self.proba_threshold_factor = factor;
        self
    }

    pub fn viterbi(mut self, viterbi: bool) -> Self {
        self.viterbi = viterbi;
        self
    }

    pub fn mean_error_threshold(mut self, threshold: f64) -> Self {
        self.mean_error_threshold = threshold;
        self
    }

    pub fn fast_iter(mut self, fast: bool) -> Self {
        self.fast_iter = fast;
        self
    }

    pub fn output_dir(mut self, dir: PathBuf) -> Self {
        self.output_dir = Some(dir);
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IterationSummary {
    pub mean_log_likelihood: f64,
    /// Sequences with non-zero likelihood; underflowing reads are counted
    /// apart and excluded from updates.
    pub n_seq: u64,
    pub n_underflow: u64,
}

#[derive(Debug, Clone, Default)]
pub struct InferenceSummary {
    pub iterations: Vec<IterationSummary>,
}

/// Run EM on the corpus, replacing `marginals` and the error model in
/// `parms` after each iteration.
pub fn infer(
    parms: &mut ModelParms,
    marginals: &mut Marginals,
    sequences: &[SequenceRecord],
    counters: &mut CounterRegistry,
    opts: &InferenceOptions,
) -> Result<InferenceSummary> {
    let threshold_factor = if opts.viterbi {
        log::info!("running Viterbi-like inference, only the best scenario is counted");
        1.0
    } else {
        opts.proba_threshold_factor
    };
    if !(0.0..=1.0).contains(&opts.likelihood_threshold) || opts.likelihood_threshold <= 0.0 {
        return Err(VdjError::Threshold(format!(
            "likelihood threshold {} must be in (0, 1]",
            opts.likelihood_threshold
        )));
    }
    if !(0.0..=1.0).contains(&threshold_factor) || threshold_factor <= 0.0 {
        return Err(VdjError::Threshold(format!(
            "probability threshold ratio {threshold_factor} must be in (0, 1]"
        )));
    }

    let layout = MarginalLayout::new(parms);
    validate_model_queue(parms, &layout)?;
    let gene_choice_events = gene_choice_map(parms);

    let mut output = OutputFiles::create(opts)?;
    if let Some(files) = &output {
        marginals.write_txt(files.dir.join("initial_marginals.txt"), parms)?;
        parms.write_model_parms(files.dir.join("initial_model.txt"))?;
    }
    counters.initialize_all(parms, marginals)?;

    let mut summary = InferenceSummary::default();

    for iteration in 0..opts.n_iterations {
        log::info!("performing evaluate/inference iteration {}", iteration + 1);

        // Only the best V/J alignments on the first pass when requested.
        let fast_sequences;
        let iteration_sequences: &[SequenceRecord] = if opts.fast_iter && iteration == 0 {
            fast_sequences = best_alignments_only(sequences);
            &fast_sequences
        } else {
            sequences
        };

        let bounds_after = downstream_bounds(parms, &layout, marginals);
        let shared = SharedInference {
            parms: &*parms,
            layout: &layout,
            marginals: &*marginals,
            bounds_after: &bounds_after,
            threshold_factor,
            likelihood_threshold: opts.likelihood_threshold,
            viterbi: opts.viterbi,
            gene_choice_events,
        };

        let last_iteration = iteration == opts.n_iterations - 1;
        let progress = iteration_progress(iteration_sequences.len() as u64, iteration);
        let processed = AtomicUsize::new(0);
        let log_writer = output.as_mut().map(|f| Mutex::new(&mut f.seq_log));
        let dump_guard = Mutex::new(());

        let reduced = iteration_sequences
            .par_iter()
            .try_fold(
                || {
                    Worker::new(
                        Marginals::new(parms),
                        parms.error_model.clone(),
                        counters.copy_for_iteration(last_iteration),
                        Enumerator::new(parms.n_events(), layout.total_size),
                    )
                },
                |mut worker, record| {
                    worker.process(
                        &shared,
                        record,
                        iteration,
                        opts.mean_error_threshold,
                        &log_writer,
                        &dump_guard,
                        &processed,
                        &progress,
                    )?;
                    Ok::<Worker, VdjError>(worker)
                },
            )
            .try_reduce_with(|mut a, b| {
                a.merge(b)?;
                Ok(a)
            })
            .transpose()?;
        progress.finish_and_clear();
        drop(log_writer);

        let iteration_summary = match reduced {
            Some(worker) => {
                let Worker {
                    marginals_acc,
                    error_model,
                    counters: worker_counters,
                    sum_log_likelihood,
                    n_nonzero,
                    n_underflow,
                    ..
                } = worker;

                counters.add_from(worker_counters)?;

                let mut updated_error = parms.error_model.clone();
                updated_error.add_to(&error_model)?;
                updated_error.update();
                parms.error_model = updated_error;

                let mut new_marginals = marginals_acc;
                new_marginals.normalize(parms);
                new_marginals.copy_fixed_events_marginals(marginals, parms);
                *marginals = new_marginals;

                IterationSummary {
                    mean_log_likelihood: if n_nonzero > 0 {
                        sum_log_likelihood / n_nonzero as f64
                    } else {
                        f64::NEG_INFINITY
                    },
                    n_seq: n_nonzero,
                    n_underflow,
                }
            }
            None => IterationSummary {
                mean_log_likelihood: f64::NEG_INFINITY,
                n_seq: 0,
                n_underflow: 0,
            },
        };

        counters.dump_summaries(iteration)?;

        if let Some(files) = &mut output {
            writeln!(
                files.likelihood_log,
                "{};{};{}",
                iteration + 1,
                iteration_summary.mean_log_likelihood,
                iteration_summary.n_seq
            )?;
            marginals.write_txt(
                files.dir.join(format!("iteration_{}.txt", iteration + 1)),
                parms,
            )?;
            parms.write_model_parms(
                files.dir.join(format!("iteration_{}_parms.txt", iteration + 1)),
            )?;
        }
        summary.iterations.push(iteration_summary);
    }

    if let Some(files) = &mut output {
        marginals.write_txt(files.dir.join("final_marginals.txt"), parms)?;
        parms.write_model_parms(files.dir.join("final_parms.txt"))?;
        files.likelihood_log.flush()?;
        files.seq_log.flush()?;
    }
    Ok(summary)
}

/// Posterior statistics of a single read under the current model.
#[derive(Debug, Clone)]
pub struct SequenceEvaluation {
    pub likelihood: f64,
    pub mean_errors: f64,
    pub n_scenarios: u64,
    pub best_scenario: f64,
    /// Per-sequence accumulator normalised to unit mass, laid out like the
    /// marginal tensor.
    pub seq_marginals: Vec<f64>,
}

/// Enumerate the scenarios of one read without touching the model, e.g. for
/// counters or tests.
pub fn evaluate_sequence(
    parms: &ModelParms,
    marginals: &Marginals,
    record: &SequenceRecord,
    opts: &InferenceOptions,
) -> Result<SequenceEvaluation> {
    let threshold_factor = if opts.viterbi {
        1.0
    } else {
        opts.proba_threshold_factor
    };
    let layout = MarginalLayout::new(parms);
    validate_model_queue(parms, &layout)?;
    let bounds_after = downstream_bounds(parms, &layout, marginals);
    let shared = SharedInference {
        parms,
        layout: &layout,
        marginals,
        bounds_after: &bounds_after,
        threshold_factor,
        likelihood_threshold: opts.likelihood_threshold,
        viterbi: opts.viterbi,
        gene_choice_events: gene_choice_map(parms),
    };
    let mut error_model = parms.error_model.clone();
    let mut enumerator = Enumerator::new(parms.n_events(), layout.total_size);
    let int_seq = nt2int(&record.seq).map_err(|e| VdjError::Sequence {
        seq_index: record.index,
        reason: e.to_string(),
    })?;
    let outcome = enumerator
        .run(&shared, &mut error_model, &int_seq, &record.alignments)
        .map_err(|e| VdjError::Sequence {
            seq_index: record.index,
            reason: e.to_string(),
        })?;
    Ok(SequenceEvaluation {
        likelihood: outcome.likelihood,
        mean_errors: outcome.mean_errors,
        n_scenarios: outcome.n_scenarios,
        best_scenario: outcome.best_scenario,
        seq_marginals: enumerator.seq_marginals,
    })
}

struct Worker {
    marginals_acc: Marginals,
    error_model: ErrorModel,
    counters: CounterRegistry,
    enumerator: Enumerator,
    sum_log_likelihood: f64,
    n_nonzero: u64,
    n_underflow: u64,
}

impl Worker {
    fn new(
        marginals_acc: Marginals,
        error_model: ErrorModel,
        counters: CounterRegistry,
        enumerator: Enumerator,
    ) -> Self {
        Worker {
            marginals_acc,
            error_model,
            counters,
            enumerator,
            sum_log_likelihood: 0.0,
            n_nonzero: 0,
            n_underflow: 0,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process(
        &mut self,
        shared: &SharedInference,
        record: &SequenceRecord,
        iteration: usize,
        mean_error_threshold: f64,
        log_writer: &Option<Mutex<&mut BufWriter<File>>>,
        dump_guard: &Mutex<()>,
        processed: &AtomicUsize,
        progress: &ProgressBar,
    ) -> Result<()> {
        let started = Instant::now();
        let int_seq = nt2int(&record.seq).map_err(|e| VdjError::Sequence {
            seq_index: record.index,
            reason: e.to_string(),
        })?;

        let outcome = self
            .enumerator
            .run(shared, &mut self.error_model, &int_seq, &record.alignments)
            .map_err(|e| {
                log::error!(
                    "scenario enumeration failed on sequence {};{}",
                    record.index,
                    record.seq
                );
                VdjError::Sequence {
                    seq_index: record.index,
                    reason: e.to_string(),
                }
            })?;

        let seq_processed = processed.fetch_add(1, Ordering::Relaxed) + 1;

        if let Some(writer) = log_writer {
            let n_v = record.alignments.get(&GeneClass::V).map_or(0, Vec::len);
            let n_j = record.alignments.get(&GeneClass::J).map_or(0, Vec::len);
            let mut w = writer.lock().expect("sequence log writer poisoned");
            writeln!(
                w,
                "{};{};{};{};{};{};{};{};{};{};{}",
                iteration,
                seq_processed,
                record.index,
                record.seq,
                n_v,
                n_j,
                outcome.likelihood,
                outcome.mean_errors,
                outcome.n_scenarios,
                outcome.best_scenario,
                started.elapsed().as_secs_f64()
            )?;
        }

        self.counters.count_sequence(
            outcome.likelihood,
            &self.enumerator.seq_marginals,
            shared.parms,
        )?;
        {
            let _guard = dump_guard.lock().expect("counter dump guard poisoned");
            self.counters.dump_sequence_data(record.index, iteration)?;
        }

        if outcome.likelihood <= 0.0 {
            self.n_underflow += 1;
            self.error_model.discard_sequence();
        } else if outcome.mean_errors <= mean_error_threshold {
            self.sum_log_likelihood += outcome.likelihood.ln();
            self.n_nonzero += 1;
            self.error_model.commit_sequence(outcome.likelihood);
            for (acc, x) in self
                .marginals_acc
                .as_mut_slice()
                .iter_mut()
                .zip(&self.enumerator.seq_marginals)
            {
                *acc += x;
            }
        } else {
            // Too error-laden to trust: no marginal or error contribution.
            self.sum_log_likelihood += outcome.likelihood.ln();
            self.n_nonzero += 1;
            self.error_model.discard_sequence();
        }

        if seq_processed % 50 == 0 {
            progress.set_position(seq_processed as u64);
        }
        Ok(())
    }

    fn merge(&mut self, other: Worker) -> Result<()> {
        self.marginals_acc += &other.marginals_acc;
        self.error_model.add_to(&other.error_model)?;
        self.counters.add_from(other.counters)?;
        self.sum_log_likelihood += other.sum_log_likelihood;
        self.n_nonzero += other.n_nonzero;
        self.n_underflow += other.n_underflow;
        Ok(())
    }
}

struct OutputFiles {
    dir: PathBuf,
    likelihood_log: BufWriter<File>,
    seq_log: BufWriter<File>,
}

impl OutputFiles {
    fn create(opts: &InferenceOptions) -> Result<Option<Self>> {
        let Some(dir) = &opts.output_dir else {
            return Ok(None);
        };
        std::fs::create_dir_all(dir)?;
        let mut likelihood_log = BufWriter::new(File::create(dir.join("likelihoods.out"))?);
        writeln!(likelihood_log, "iteration;mean_log_Likelihood;n_seq")?;
        let mut seq_log = BufWriter::new(File::create(dir.join("inference_logs.txt"))?);
        writeln!(
            seq_log,
            "iteration_n;seq_processed;seq_index;nt_sequence;n_V_aligns;n_J_aligns;seq_likelihood;seq_mean_n_errors;seq_n_scenarios;seq_best_scenario;time"
        )?;
        Ok(Some(OutputFiles {
            dir: dir.clone(),
            likelihood_log,
            seq_log,
        }))
    }
}

/// Keep, per read, only the best-scoring alignments of every class except D
/// (the D repertoire is too degenerate for a meaningful best).
fn best_alignments_only(sequences: &[SequenceRecord]) -> Vec<SequenceRecord> {
    let mut filtered = sequences.to_vec();
    for record in &mut filtered {
        for (class, alignments) in record.alignments.iter_mut() {
            if *class == GeneClass::D {
                continue;
            }
            let best = alignments
                .iter()
                .map(|a| a.score)
                .fold(f64::NEG_INFINITY, f64::max);
            alignments.retain(|a| a.score >= best);
        }
    }
    filtered
}

fn gene_choice_map(parms: &ModelParms) -> [Option<EventId>; 3] {
    let mut map = [None; 3];
    for event in parms.events() {
        if event.event_type == EventType::GeneChoice {
            if let Some(slot) = gene_slot(event.class) {
                map[slot] = Some(event.id());
            }
        }
    }
    map
}

/// Structural checks the queue must satisfy before any sequence is
/// processed: deletions after their gene choice, insertions after both
/// flanks (choices and relevant trims), dinucleotide chains after their
/// sizing insertion.
pub(crate) fn validate_model_queue(parms: &ModelParms, layout: &MarginalLayout) -> Result<()> {
    let mut position = vec![0usize; parms.n_events()];
    for (qpos, &id) in layout.queue.iter().enumerate() {
        position[id] = qpos;
    }
    let find = |event_type: EventType, class: GeneClass, side: Option<SeqSide>| -> Option<EventId> {
        parms
            .events()
            .find(|e| {
                e.event_type == event_type
                    && e.class == class
                    && side.map_or(true, |s| e.side == s)
            })
            .map(|e| e.id())
    };
    let require_before = |dependency: Option<EventId>, dependent: EventId, what: &str| -> Result<()> {
        match dependency {
            Some(dep) if position[dep] < position[dependent] => Ok(()),
            Some(dep) => Err(VdjError::Config(format!(
                "event \"{}\" must come before \"{}\" in the model queue",
                parms.event(dep).name(),
                parms.event(dependent).name()
            ))),
            None => Err(VdjError::Config(format!(
                "event \"{}\" requires a {what} event",
                parms.event(dependent).name()
            ))),
        }
    };

    for event in parms.events() {
        match event.event_type {
            EventType::Deletion => {
                let choice = find(EventType::GeneChoice, event.class, None);
                require_before(choice, event.id(), "GeneChoice")?;
            }
            EventType::Insertion | EventType::DinucMarkov => {
                let flanks: &[(GeneClass, SeqSide)] = match event.class {
                    GeneClass::VD => &[(GeneClass::V, SeqSide::ThreePrime), (GeneClass::D, SeqSide::FivePrime)],
                    GeneClass::VJ => &[(GeneClass::V, SeqSide::ThreePrime), (GeneClass::J, SeqSide::FivePrime)],
                    GeneClass::DJ => &[(GeneClass::D, SeqSide::ThreePrime), (GeneClass::J, SeqSide::FivePrime)],
                    _ => {
                        return Err(VdjError::Config(format!(
                            "event \"{}\" must have a composite gene class",
                            event.name()
                        )))
                    }
                };
                if event.event_type == EventType::Insertion {
                    for &(class, side) in flanks {
                        let choice = find(EventType::GeneChoice, class, None);
                        require_before(choice, event.id(), "GeneChoice")?;
                        if let Some(deletion) = find(EventType::Deletion, class, Some(side)) {
                            require_before(Some(deletion), event.id(), "Deletion")?;
                        }
                    }
                } else {
                    let insertion = find(EventType::Insertion, event.class, None);
                    require_before(insertion, event.id(), "Insertion")?;
                }
            }
            EventType::GeneChoice => {
                if gene_slot(event.class).is_none() {
                    return Err(VdjError::Config(format!(
                        "GeneChoice event \"{}\" must have gene class V, D or J",
                        event.name()
                    )));
                }
            }
        }
    }
    Ok(())
}

fn iteration_progress(total: u64, iteration: usize) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{msg} [{bar:50}] {pos}/{len}")
            .expect("valid progress template")
            .progress_chars("=> "),
    );
    pb.set_message(format!("Iteration {}", iteration + 1));
    pb
}
