//! Sequencing-error / hypermutation models.
//!
//! Three concrete kinds behind one closed sum type: a single global per-base
//! rate, and two N-mer hypermutation variants (a shared factor with
//! per-position contributions, or one independent rate per N-mer). All three
//! score observed mismatches, accumulate weighted sufficient statistics per
//! worker, and merge into a master copy at the end of an EM iteration.

use std::io::Write;

use itertools::Itertools;
use rand::rngs::SmallRng;
use rand::Rng;

use crate::error::{Result, VdjError};
use crate::graph::GeneClass;
use crate::nucleotide::{canonical_bases, IntSeq};

/// One genomic segment of a scenario as seen by the error model: the
/// germline nucleotides expected at each covered read position and the
/// mismatch positions within that window.
#[derive(Debug, Clone, Copy)]
pub struct SegmentObservation<'a> {
    pub class: GeneClass,
    /// Expected germline codes, one per covered read position.
    pub germline: &'a [u8],
    /// Window-relative mismatch positions (sorted).
    pub mismatches: &'a [usize],
}

impl SegmentObservation<'_> {
    pub fn len(&self) -> usize {
        self.germline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.germline.is_empty()
    }
}

/// All genomic segments of one scenario (at most V, D and J).
pub type ScenarioObservation<'a> = [Option<SegmentObservation<'a>>; 3];

fn total_errors(obs: &ScenarioObservation) -> usize {
    obs.iter().flatten().map(|s| s.mismatches.len()).sum()
}

fn total_length(obs: &ScenarioObservation) -> usize {
    obs.iter().flatten().map(|s| s.len()).sum()
}

const LAPLACE_ALPHA: f64 = 1.0;
const MIN_RATE: f64 = 1e-10;
const MAX_RATE: f64 = 0.999;

#[derive(Debug, Clone)]
pub enum ErrorModel {
    SingleRate(SingleErrorRate),
    HypermutationGlobal(HypermutationGlobalRate),
    HypermutationFull(HypermutationFullRate),
}

impl Default for ErrorModel {
    fn default() -> Self {
        ErrorModel::SingleRate(SingleErrorRate::new(1e-3))
    }
}

impl ErrorModel {
    /// Likelihood factor contributed by the observed mismatches of one
    /// scenario.
    pub fn scenario_factor(&self, obs: &ScenarioObservation) -> f64 {
        match self {
            ErrorModel::SingleRate(m) => m.scenario_factor(obs),
            ErrorModel::HypermutationGlobal(m) => m.scenario_factor(obs),
            ErrorModel::HypermutationFull(m) => m.scenario_factor(obs),
        }
    }

    /// Record one scenario's weighted error statistics into the per-sequence
    /// scratch counters.
    pub fn accumulate(&mut self, weight: f64, obs: &ScenarioObservation) {
        match self {
            ErrorModel::SingleRate(m) => m.accumulate(weight, obs),
            ErrorModel::HypermutationGlobal(m) => m.accumulate(weight, obs),
            ErrorModel::HypermutationFull(m) => m.accumulate(weight, obs),
        }
    }

    /// Weighted mean number of errors of the scenarios seen since the last
    /// commit/discard, or 0 when nothing was recorded.
    pub fn seq_mean_errors(&self) -> f64 {
        let (w_err, w) = match self {
            ErrorModel::SingleRate(m) => (m.seq_weighted_errors, m.seq_weight),
            ErrorModel::HypermutationGlobal(m) => (m.counts.seq_weighted_errors, m.counts.seq_weight),
            ErrorModel::HypermutationFull(m) => (m.counts.seq_weighted_errors, m.counts.seq_weight),
        };
        if w > 0.0 {
            w_err / w
        } else {
            0.0
        }
    }

    /// Fold the per-sequence scratch into the corpus accumulators, giving
    /// the sequence unit mass (division by its likelihood).
    pub fn commit_sequence(&mut self, seq_likelihood: f64) {
        match self {
            ErrorModel::SingleRate(m) => m.commit_sequence(seq_likelihood),
            ErrorModel::HypermutationGlobal(m) => m.counts.commit(seq_likelihood),
            ErrorModel::HypermutationFull(m) => m.counts.commit(seq_likelihood),
        }
    }

    /// Drop the per-sequence scratch without contributing to the update.
    pub fn discard_sequence(&mut self) {
        match self {
            ErrorModel::SingleRate(m) => m.discard_sequence(),
            ErrorModel::HypermutationGlobal(m) => m.counts.discard(),
            ErrorModel::HypermutationFull(m) => m.counts.discard(),
        }
    }

    /// Merge a worker's corpus accumulators into `self`. Kinds must match.
    pub fn add_to(&mut self, other: &ErrorModel) -> Result<()> {
        match (self, other) {
            (ErrorModel::SingleRate(a), ErrorModel::SingleRate(b)) => a.merge(b),
            (ErrorModel::HypermutationGlobal(a), ErrorModel::HypermutationGlobal(b)) => {
                a.counts.merge(&b.counts)
            }
            (ErrorModel::HypermutationFull(a), ErrorModel::HypermutationFull(b)) => {
                a.counts.merge(&b.counts)
            }
            _ => {
                return Err(VdjError::Config(
                    "cannot merge error models of different kinds".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// Re-estimate the model from the corpus accumulators and reset them.
    pub fn update(&mut self) {
        match self {
            ErrorModel::SingleRate(m) => m.update(),
            ErrorModel::HypermutationGlobal(m) => m.update(),
            ErrorModel::HypermutationFull(m) => m.update(),
        }
    }

    /// Introduce substitution errors in a generated sequence, returning the
    /// mutated positions.
    pub fn generate_errors(&self, seq: &mut IntSeq, rng: &mut SmallRng) -> Vec<usize> {
        match self {
            ErrorModel::SingleRate(m) => m.generate_errors(seq, rng),
            ErrorModel::HypermutationGlobal(m) => {
                generate_context_errors(seq, rng, m.nmer_size, |ctx| m.rate_for(ctx))
            }
            ErrorModel::HypermutationFull(m) => {
                generate_context_errors(seq, rng, m.nmer_size, |ctx| m.rates[ctx])
            }
        }
    }

    pub fn write_block<W: Write>(&self, w: &mut W) -> Result<()> {
        match self {
            ErrorModel::SingleRate(m) => {
                writeln!(w, "#SingleErrorRate")?;
                writeln!(w, "{}", m.rate)?;
            }
            ErrorModel::HypermutationGlobal(m) => {
                writeln!(
                    w,
                    "#Hypermutationglobalerrorrate;{};{};{}",
                    m.nmer_size, m.learn_on, m.apply_on
                )?;
                writeln!(w, "{}", m.global_rate)?;
                writeln!(w, "{}", join_floats(&m.contributions))?;
            }
            ErrorModel::HypermutationFull(m) => {
                writeln!(
                    w,
                    "#HypermutationfullNmererrorrate;{};{};{}",
                    m.nmer_size, m.learn_on, m.apply_on
                )?;
                writeln!(w, "{}", join_floats(&m.rates))?;
            }
        }
        Ok(())
    }

    /// Parse the `@ErrorRate` block from its header line and the remaining
    /// payload lines.
    pub fn read_block(header: &str, lines: &mut impl Iterator<Item = String>) -> Result<Self> {
        let mut fields = header.split(';');
        let kind = fields.next().unwrap_or_default();
        match kind {
            "#SingleErrorRate" => {
                let rate = parse_float_line(lines, header)?;
                Ok(ErrorModel::SingleRate(SingleErrorRate::new(rate)))
            }
            "#Hypermutationglobalerrorrate" => {
                let (nmer_size, learn_on, apply_on) = parse_hypermut_header(&mut fields, header)?;
                let global_rate = parse_float_line(lines, header)?;
                let contributions = parse_float_list_line(lines, header)?;
                if contributions.len() != 4 * nmer_size {
                    return Err(VdjError::InputFormat(format!(
                        "expected {} hypermutation contributions, got {} in \"{header}\"",
                        4 * nmer_size,
                        contributions.len()
                    )));
                }
                Ok(ErrorModel::HypermutationGlobal(HypermutationGlobalRate::new(
                    nmer_size,
                    learn_on,
                    apply_on,
                    global_rate,
                    contributions,
                )))
            }
            "#HypermutationfullNmererrorrate" => {
                let (nmer_size, learn_on, apply_on) = parse_hypermut_header(&mut fields, header)?;
                let rates = parse_float_list_line(lines, header)?;
                if rates.len() != 4usize.pow(nmer_size as u32) {
                    return Err(VdjError::InputFormat(format!(
                        "expected {} N-mer rates, got {} in \"{header}\"",
                        4usize.pow(nmer_size as u32),
                        rates.len()
                    )));
                }
                Ok(ErrorModel::HypermutationFull(HypermutationFullRate::new(
                    nmer_size, learn_on, apply_on, rates,
                )))
            }
            other => Err(VdjError::InputFormat(format!(
                "unknown error-rate kind \"{other}\""
            ))),
        }
    }
}

fn join_floats(xs: &[f64]) -> String {
    xs.iter().join(";")
}

fn parse_hypermut_header<'a>(
    fields: &mut impl Iterator<Item = &'a str>,
    header: &str,
) -> Result<(usize, GeneClass, GeneClass)> {
    let bad = || VdjError::InputFormat(format!("malformed error-rate header \"{header}\""));
    let nmer_size: usize = fields.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if nmer_size % 2 == 0 {
        return Err(VdjError::InputFormat(format!(
            "hypermutation N-mer size must be odd in \"{header}\""
        )));
    }
    let learn_on: GeneClass = fields.next().ok_or_else(bad)?.parse()?;
    let apply_on: GeneClass = fields.next().ok_or_else(bad)?.parse()?;
    Ok((nmer_size, learn_on, apply_on))
}

fn parse_float_line(lines: &mut impl Iterator<Item = String>, ctx: &str) -> Result<f64> {
    let line = lines
        .next()
        .ok_or_else(|| VdjError::InputFormat(format!("missing error-rate payload after \"{ctx}\"")))?;
    line.trim()
        .parse()
        .map_err(|_| VdjError::InputFormat(format!("bad float \"{line}\"")))
}

fn parse_float_list_line(lines: &mut impl Iterator<Item = String>, ctx: &str) -> Result<Vec<f64>> {
    let line = lines
        .next()
        .ok_or_else(|| VdjError::InputFormat(format!("missing error-rate payload after \"{ctx}\"")))?;
    line.trim()
        .split(';')
        .map(|f| {
            f.parse()
                .map_err(|_| VdjError::InputFormat(format!("bad float \"{f}\" in \"{line}\"")))
        })
        .collect()
}

/// One global per-base error probability. A mismatch can be read as any of
/// the three other bases, hence the r/3 factor per observed error.
#[derive(Debug, Clone)]
pub struct SingleErrorRate {
    pub rate: f64,
    seq_weighted_errors: f64,
    seq_weighted_length: f64,
    seq_weight: f64,
    norm_weighted_errors: f64,
    norm_weighted_length: f64,
}

impl SingleErrorRate {
    pub fn new(rate: f64) -> Self {
        SingleErrorRate {
            rate,
            seq_weighted_errors: 0.0,
            seq_weighted_length: 0.0,
            seq_weight: 0.0,
            norm_weighted_errors: 0.0,
            norm_weighted_length: 0.0,
        }
    }

    fn scenario_factor(&self, obs: &ScenarioObservation) -> f64 {
        let n_err = total_errors(obs) as f64;
        let len = total_length(obs) as f64;
        (self.rate / 3.0).powf(n_err) * (1.0 - self.rate).powf(len - n_err)
    }

    fn accumulate(&mut self, weight: f64, obs: &ScenarioObservation) {
        self.seq_weighted_errors += weight * total_errors(obs) as f64;
        self.seq_weighted_length += weight * total_length(obs) as f64;
        self.seq_weight += weight;
    }

    fn commit_sequence(&mut self, seq_likelihood: f64) {
        if seq_likelihood > 0.0 {
            self.norm_weighted_errors += self.seq_weighted_errors / seq_likelihood;
            self.norm_weighted_length += self.seq_weighted_length / seq_likelihood;
        }
        self.discard_sequence();
    }

    fn discard_sequence(&mut self) {
        self.seq_weighted_errors = 0.0;
        self.seq_weighted_length = 0.0;
        self.seq_weight = 0.0;
    }

    fn merge(&mut self, other: &SingleErrorRate) {
        self.norm_weighted_errors += other.norm_weighted_errors;
        self.norm_weighted_length += other.norm_weighted_length;
    }

    fn update(&mut self) {
        if self.norm_weighted_length > 0.0 {
            self.rate = (self.norm_weighted_errors / self.norm_weighted_length)
                .clamp(MIN_RATE, MAX_RATE);
        }
        self.norm_weighted_errors = 0.0;
        self.norm_weighted_length = 0.0;
    }

    fn generate_errors(&self, seq: &mut IntSeq, rng: &mut SmallRng) -> Vec<usize> {
        let mut positions = Vec::new();
        for (pos, code) in seq.iter_mut().enumerate() {
            if rng.gen::<f64>() < self.rate {
                *code = substitute(*code, rng);
                positions.push(pos);
            }
        }
        positions
    }
}

fn substitute(code: u8, rng: &mut SmallRng) -> u8 {
    let shift = rng.gen_range(1..4u8);
    (code + shift) % 4
}

/// Weighted per-context mutation/coverage counts shared by the two
/// hypermutation variants.
#[derive(Debug, Clone)]
struct ContextCounts {
    mutated: Vec<f64>,
    covered: Vec<f64>,
    seq_mutated: Vec<f64>,
    seq_covered: Vec<f64>,
    seq_weighted_errors: f64,
    seq_weight: f64,
}

impl ContextCounts {
    fn new(n_contexts: usize) -> Self {
        ContextCounts {
            mutated: vec![0.0; n_contexts],
            covered: vec![0.0; n_contexts],
            seq_mutated: vec![0.0; n_contexts],
            seq_covered: vec![0.0; n_contexts],
            seq_weighted_errors: 0.0,
            seq_weight: 0.0,
        }
    }

    fn commit(&mut self, seq_likelihood: f64) {
        if seq_likelihood > 0.0 {
            for (master, seq) in self.mutated.iter_mut().zip(&self.seq_mutated) {
                *master += seq / seq_likelihood;
            }
            for (master, seq) in self.covered.iter_mut().zip(&self.seq_covered) {
                *master += seq / seq_likelihood;
            }
        }
        self.discard();
    }

    fn discard(&mut self) {
        self.seq_mutated.iter_mut().for_each(|x| *x = 0.0);
        self.seq_covered.iter_mut().for_each(|x| *x = 0.0);
        self.seq_weighted_errors = 0.0;
        self.seq_weight = 0.0;
    }

    fn merge(&mut self, other: &ContextCounts) {
        for (a, b) in self.mutated.iter_mut().zip(&other.mutated) {
            *a += b;
        }
        for (a, b) in self.covered.iter_mut().zip(&other.covered) {
            *a += b;
        }
    }

    fn reset(&mut self) {
        self.mutated.iter_mut().for_each(|x| *x = 0.0);
        self.covered.iter_mut().for_each(|x| *x = 0.0);
    }
}

/// Walk the full-context positions of a segment. The context is taken from
/// the germline (expected) nucleotides; ambiguous germline codes contribute
/// their first canonical base.
fn for_each_context(
    seg: &SegmentObservation,
    nmer_size: usize,
    mut f: impl FnMut(usize, bool),
) -> (usize, usize) {
    let half = nmer_size / 2;
    let len = seg.len();
    let mut edge_positions = 0;
    let mut edge_errors = 0;
    for pos in 0..len {
        let mutated = seg.mismatches.binary_search(&pos).is_ok();
        if pos < half || pos + half >= len {
            edge_positions += 1;
            edge_errors += usize::from(mutated);
            continue;
        }
        let mut ctx = 0usize;
        for code in &seg.germline[pos - half..=pos + half] {
            let base = canonical_bases(*code).next().unwrap_or(0);
            ctx = ctx * 4 + base as usize;
        }
        f(ctx, mutated);
    }
    (edge_positions, edge_errors)
}

fn context_factor(
    obs: &ScenarioObservation,
    apply_on: GeneClass,
    nmer_size: usize,
    avg_rate: f64,
    rate: impl Fn(usize) -> f64,
) -> f64 {
    let mut factor = 1.0;
    for seg in obs.iter().flatten() {
        if !apply_on.contains(seg.class) {
            continue;
        }
        let (edge_positions, edge_errors) = for_each_context(seg, nmer_size, |ctx, mutated| {
            let mu = rate(ctx).clamp(MIN_RATE, MAX_RATE);
            factor *= if mutated { mu / 3.0 } else { 1.0 - mu };
        });
        // Positions whose window falls off the segment use the averaged rate.
        factor *= (avg_rate / 3.0).powf(edge_errors as f64)
            * (1.0 - avg_rate).powf((edge_positions - edge_errors) as f64);
    }
    factor
}

fn context_accumulate(
    counts: &mut ContextCounts,
    obs: &ScenarioObservation,
    learn_on: GeneClass,
    nmer_size: usize,
    weight: f64,
) {
    counts.seq_weighted_errors += weight * total_errors(obs) as f64;
    counts.seq_weight += weight;
    for seg in obs.iter().flatten() {
        if !learn_on.contains(seg.class) {
            continue;
        }
        for_each_context(seg, nmer_size, |ctx, mutated| {
            counts.seq_covered[ctx] += weight;
            if mutated {
                counts.seq_mutated[ctx] += weight;
            }
        });
    }
}

fn generate_context_errors(
    seq: &mut IntSeq,
    rng: &mut SmallRng,
    nmer_size: usize,
    rate: impl Fn(usize) -> f64,
) -> Vec<usize> {
    let half = nmer_size / 2;
    let clean = seq.clone();
    let mut positions = Vec::new();
    for pos in 0..clean.len() {
        if pos < half || pos + half >= clean.len() {
            continue;
        }
        let mut ctx = 0usize;
        for code in &clean[pos - half..=pos + half] {
            ctx = ctx * 4 + *code as usize;
        }
        if rng.gen::<f64>() < rate(ctx).clamp(MIN_RATE, MAX_RATE) {
            seq[pos] = substitute(seq[pos], rng);
            positions.push(pos);
        }
    }
    positions
}

/// Hypermutation model factorised as one shared rate times per-position,
/// per-base contributions.
#[derive(Debug, Clone)]
pub struct HypermutationGlobalRate {
    pub nmer_size: usize,
    pub learn_on: GeneClass,
    pub apply_on: GeneClass,
    pub global_rate: f64,
    /// 4 * nmer_size multiplicative contributions, position-major.
    pub contributions: Vec<f64>,
    counts: ContextCounts,
}

impl HypermutationGlobalRate {
    pub fn new(
        nmer_size: usize,
        learn_on: GeneClass,
        apply_on: GeneClass,
        global_rate: f64,
        contributions: Vec<f64>,
    ) -> Self {
        HypermutationGlobalRate {
            nmer_size,
            learn_on,
            apply_on,
            global_rate,
            contributions,
            counts: ContextCounts::new(4usize.pow(nmer_size as u32)),
        }
    }

    fn rate_for(&self, ctx: usize) -> f64 {
        let mut mu = self.global_rate;
        let mut rem = ctx;
        for pos in (0..self.nmer_size).rev() {
            let base = rem % 4;
            rem /= 4;
            mu *= self.contributions[pos * 4 + base];
        }
        mu
    }

    fn avg_rate(&self) -> f64 {
        self.global_rate.clamp(MIN_RATE, MAX_RATE)
    }

    fn scenario_factor(&self, obs: &ScenarioObservation) -> f64 {
        context_factor(obs, self.apply_on, self.nmer_size, self.avg_rate(), |ctx| {
            self.rate_for(ctx)
        })
    }

    fn accumulate(&mut self, weight: f64, obs: &ScenarioObservation) {
        let learn_on = self.learn_on;
        let nmer_size = self.nmer_size;
        context_accumulate(&mut self.counts, obs, learn_on, nmer_size, weight);
    }

    fn update(&mut self) {
        let total_mut: f64 = self.counts.mutated.iter().sum();
        let total_cov: f64 = self.counts.covered.iter().sum();
        if total_cov <= 0.0 {
            self.counts.reset();
            return;
        }
        let new_rate = ((total_mut + LAPLACE_ALPHA) / (total_cov + 2.0 * LAPLACE_ALPHA))
            .clamp(MIN_RATE, MAX_RATE);

        // Per-position, per-base Laplace-smoothed rates relative to the
        // shared one.
        let n = self.nmer_size;
        let mut new_contributions = vec![1.0; 4 * n];
        for pos in 0..n {
            for base in 0..4usize {
                let mut mutated = 0.0;
                let mut covered = 0.0;
                for ctx in 0..self.counts.mutated.len() {
                    let ctx_base = (ctx / 4usize.pow((n - 1 - pos) as u32)) % 4;
                    if ctx_base == base {
                        mutated += self.counts.mutated[ctx];
                        covered += self.counts.covered[ctx];
                    }
                }
                let mu = (mutated + LAPLACE_ALPHA) / (covered + 2.0 * LAPLACE_ALPHA);
                new_contributions[pos * 4 + base] = mu / new_rate;
            }
        }
        self.global_rate = new_rate;
        self.contributions = new_contributions;
        self.counts.reset();
    }
}

/// Hypermutation model with an independent rate per N-mer context.
#[derive(Debug, Clone)]
pub struct HypermutationFullRate {
    pub nmer_size: usize,
    pub learn_on: GeneClass,
    pub apply_on: GeneClass,
    /// 4^nmer_size per-context mutation probabilities.
    pub rates: Vec<f64>,
    counts: ContextCounts,
}

impl HypermutationFullRate {
    pub fn new(nmer_size: usize, learn_on: GeneClass, apply_on: GeneClass, rates: Vec<f64>) -> Self {
        let n = rates.len();
        HypermutationFullRate {
            nmer_size,
            learn_on,
            apply_on,
            rates,
            counts: ContextCounts::new(n),
        }
    }

    fn avg_rate(&self) -> f64 {
        let avg = self.rates.iter().sum::<f64>() / self.rates.len() as f64;
        avg.clamp(MIN_RATE, MAX_RATE)
    }

    fn scenario_factor(&self, obs: &ScenarioObservation) -> f64 {
        context_factor(obs, self.apply_on, self.nmer_size, self.avg_rate(), |ctx| {
            self.rates[ctx]
        })
    }

    fn accumulate(&mut self, weight: f64, obs: &ScenarioObservation) {
        let learn_on = self.learn_on;
        let nmer_size = self.nmer_size;
        context_accumulate(&mut self.counts, obs, learn_on, nmer_size, weight);
    }

    fn update(&mut self) {
        for (ctx, rate) in self.rates.iter_mut().enumerate() {
            let covered = self.counts.covered[ctx];
            if covered > 0.0 {
                *rate = ((self.counts.mutated[ctx] + LAPLACE_ALPHA)
                    / (covered + 2.0 * LAPLACE_ALPHA))
                    .clamp(MIN_RATE, MAX_RATE);
            }
        }
        self.counts.reset();
    }
}

#[cfg(test)]
mod test {
    use rand::SeedableRng;

    use super::*;
    use crate::nucleotide::nt2int;

    fn single_segment<'a>(germline: &'a [u8], mismatches: &'a [usize]) -> ScenarioObservation<'a> {
        [
            Some(SegmentObservation {
                class: GeneClass::V,
                germline,
                mismatches,
            }),
            None,
            None,
        ]
    }

    #[test]
    fn single_rate_factor() {
        let model = ErrorModel::SingleRate(SingleErrorRate::new(0.1));
        let germline = nt2int("ACGTACGT").unwrap();
        let obs = single_segment(&germline, &[5]);
        let expected = (0.1 / 3.0) * 0.9f64.powi(7);
        assert!((model.scenario_factor(&obs) - expected).abs() < 1e-12);
    }

    #[test]
    fn single_rate_update_is_weighted_ratio() {
        let mut model = ErrorModel::SingleRate(SingleErrorRate::new(0.5));
        let germline = nt2int("ACGTACGTAC").unwrap();
        let obs = single_segment(&germline, &[0]);
        model.accumulate(2.0, &obs);
        assert!((model.seq_mean_errors() - 1.0).abs() < 1e-12);
        model.commit_sequence(2.0);
        model.update();
        match model {
            ErrorModel::SingleRate(m) => assert!((m.rate - 0.1).abs() < 1e-12),
            _ => unreachable!(),
        }
    }

    #[test]
    fn discard_drops_contribution() {
        let mut model = ErrorModel::SingleRate(SingleErrorRate::new(0.25));
        let germline = nt2int("ACGT").unwrap();
        model.accumulate(1.0, &single_segment(&germline, &[1]));
        model.discard_sequence();
        model.update();
        match model {
            ErrorModel::SingleRate(m) => assert!((m.rate - 0.25).abs() < 1e-12),
            _ => unreachable!(),
        }
    }

    #[test]
    fn merge_requires_same_kind() {
        let mut a = ErrorModel::SingleRate(SingleErrorRate::new(0.1));
        let b = ErrorModel::HypermutationFull(HypermutationFullRate::new(
            1,
            GeneClass::V,
            GeneClass::V,
            vec![0.1; 4],
        ));
        assert!(a.add_to(&b).is_err());
    }

    #[test]
    fn full_nmer_learns_per_context() {
        let mut model = HypermutationFullRate::new(1, GeneClass::V, GeneClass::V, vec![0.5; 4]);
        let germline = nt2int("AAAA").unwrap();
        let obs = single_segment(&germline, &[0, 1]);
        model.accumulate(1.0, &obs);
        model.counts.commit(1.0);
        model.update();
        // context A: 2 mutated of 4 covered, Laplace smoothed.
        assert!((model.rates[0] - 3.0 / 6.0).abs() < 1e-12);
        // untouched contexts keep their rate.
        assert!((model.rates[1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn generated_errors_are_reported_positions() {
        let model = ErrorModel::SingleRate(SingleErrorRate::new(0.5));
        let mut rng = SmallRng::seed_from_u64(7);
        let clean = nt2int("ACGTACGTACGTACGT").unwrap();
        let mut seq = clean.clone();
        let errors = model.generate_errors(&mut seq, &mut rng);
        for (pos, (a, b)) in clean.iter().zip(&seq).enumerate() {
            assert_eq!(errors.binary_search(&pos).is_ok(), a != b);
        }
    }

    #[test]
    fn block_roundtrip() {
        let models = vec![
            ErrorModel::SingleRate(SingleErrorRate::new(0.0042)),
            ErrorModel::HypermutationGlobal(HypermutationGlobalRate::new(
                3,
                GeneClass::VD,
                GeneClass::V,
                0.01,
                (0..12).map(|i| 1.0 + i as f64 / 10.0).collect(),
            )),
            ErrorModel::HypermutationFull(HypermutationFullRate::new(
                1,
                GeneClass::J,
                GeneClass::J,
                vec![0.1, 0.2, 0.3, 0.4],
            )),
        ];
        for model in models {
            let mut buf = Vec::new();
            model.write_block(&mut buf).unwrap();
            let text = String::from_utf8(buf).unwrap();
            let mut lines = text.lines().map(str::to_string);
            let header = lines.next().unwrap();
            let back = ErrorModel::read_block(&header, &mut lines).unwrap();
            let mut buf2 = Vec::new();
            back.write_block(&mut buf2).unwrap();
            let mut buf1 = Vec::new();
            model.write_block(&mut buf1).unwrap();
            assert_eq!(buf1, buf2);
        }
    }
}
