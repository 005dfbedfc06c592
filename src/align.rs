//! Banded, offset-constrained Smith-Waterman alignment of reads against
//! germline templates.
//!
//! The fill front expands by squares from the top-left corner; every
//! connected region of positive cells gets an alignment id and one traceback
//! from its maximum. V templates are aligned without the local zero clamp so
//! the whole template aligns into the read from its 5' end; D, J and
//! undefined templates use plain local alignment.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use fnv::FnvHashMap;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VdjError};
use crate::graph::GeneClass;
use crate::io::{IndexedSeq, Template};
use crate::nucleotide::{canonical_bases, compatible, nt2int, IntSeq, ALPHABET_SIZE};

/// A 15x15 nucleotide substitution matrix. 4x4 input is expanded on the fly:
/// scores involving ambiguous codes are the maximum over compatible
/// canonical pairs.
#[derive(Debug, Clone)]
pub struct SubstitutionMatrix {
    scores: Array2<f64>,
}

impl SubstitutionMatrix {
    pub fn from_canonical(canonical: &Array2<f64>) -> Result<Self> {
        if canonical.dim() != (4, 4) {
            return Err(VdjError::Config(format!(
                "expected a 4x4 substitution matrix, got {:?}",
                canonical.dim()
            )));
        }
        let mut scores = Array2::zeros((ALPHABET_SIZE, ALPHABET_SIZE));
        for a in 0..ALPHABET_SIZE as u8 {
            for b in 0..ALPHABET_SIZE as u8 {
                let best = canonical_bases(a)
                    .flat_map(|x| canonical_bases(b).map(move |y| canonical[(x as usize, y as usize)]))
                    .fold(f64::NEG_INFINITY, f64::max);
                scores[(a as usize, b as usize)] = best;
            }
        }
        Ok(SubstitutionMatrix { scores })
    }

    pub fn from_full(scores: Array2<f64>) -> Result<Self> {
        if scores.dim() != (ALPHABET_SIZE, ALPHABET_SIZE) {
            return Err(VdjError::Config(format!(
                "expected a 15x15 substitution matrix, got {:?}",
                scores.dim()
            )));
        }
        Ok(SubstitutionMatrix { scores })
    }

    /// Uniform diagonal/off-diagonal matrix over the canonical bases.
    pub fn simple(match_score: f64, mismatch_score: f64) -> Self {
        let canonical = Array2::from_shape_fn((4, 4), |(i, j)| {
            if i == j {
                match_score
            } else {
                mismatch_score
            }
        });
        SubstitutionMatrix::from_canonical(&canonical).expect("4x4 by construction")
    }

    /// Read a comma-separated 4x4 or 15x15 matrix from a file.
    pub fn read_csv<P: AsRef<Path>>(path: P, sep: char) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut rows: Vec<Vec<f64>> = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let row = line
                .split(sep)
                .map(|f| {
                    f.trim()
                        .parse()
                        .map_err(|_| VdjError::InputFormat(format!("bad matrix entry in \"{line}\"")))
                })
                .collect::<Result<Vec<f64>>>()?;
            rows.push(row);
        }
        let n = rows.len();
        if (n != 4 && n != ALPHABET_SIZE) || rows.iter().any(|r| r.len() != n) {
            return Err(VdjError::InputFormat(
                "substitution matrix must be 4x4 or 15x15".to_string(),
            ));
        }
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        let arr = Array2::from_shape_vec((n, n), flat).expect("checked dimensions");
        if n == 4 {
            SubstitutionMatrix::from_canonical(&arr)
        } else {
            SubstitutionMatrix::from_full(arr)
        }
    }

    #[inline]
    fn score(&self, a: u8, b: u8) -> f64 {
        self.scores[(a as usize, b as usize)]
    }
}

/// One above-threshold alignment of a template against a read.
#[derive(Debug, Clone, PartialEq)]
pub struct Alignment {
    pub gene_name: String,
    pub score: f64,
    /// Read index where template position 0 aligns; negative when the
    /// template extends 5' of the read.
    pub offset: i32,
    /// Read coordinate of the first aligned position.
    pub five_p_offset: i32,
    /// Read coordinate of the last aligned position.
    pub three_p_offset: i32,
    pub length: usize,
    /// Read coordinates carrying a base absent from the template.
    pub insertions: Vec<i32>,
    /// Template coordinates carrying a base absent from the read.
    pub deletions: Vec<i32>,
    /// Read coordinates where both sequences have incompatible bases.
    pub mismatches: Vec<i32>,
}

/// Per-template offset bounds, keyed by template name.
pub type OffsetBounds = FnvHashMap<String, (i32, i32)>;

#[derive(Debug, Clone)]
pub struct AlignmentOptions {
    pub score_threshold: f64,
    pub best_align_only: bool,
    pub best_gene_only: bool,
    /// Per-template offset bounds; templates without an entry are an error.
    /// `None` leaves offsets unconstrained.
    pub offset_bounds: Option<OffsetBounds>,
    /// Re-anchor offset bounds to the 3' end of the read.
    pub rev_offset_frame: bool,
    /// Restrict alignment to these template names.
    pub restricted_templates: Option<Vec<String>>,
}

impl Default for AlignmentOptions {
    fn default() -> Self {
        AlignmentOptions {
            score_threshold: 0.0,
            best_align_only: false,
            best_gene_only: false,
            offset_bounds: None,
            rev_offset_frame: false,
            restricted_templates: None,
        }
    }
}

impl AlignmentOptions {
    pub fn score_threshold(mut self, threshold: f64) -> Self {
        self.score_threshold = threshold;
        self
    }

    pub fn best_align_only(mut self, best: bool) -> Self {
        self.best_align_only = best;
        self
    }

    pub fn best_gene_only(mut self, best: bool) -> Self {
        self.best_gene_only = best;
        self
    }

    pub fn offset_bounds(mut self, bounds: OffsetBounds) -> Self {
        self.offset_bounds = Some(bounds);
        self
    }

    pub fn rev_offset_frame(mut self, rev: bool) -> Self {
        self.rev_offset_frame = rev;
        self
    }

    pub fn restricted_templates(mut self, names: Vec<String>) -> Self {
        self.restricted_templates = Some(names);
        self
    }
}

pub struct Aligner {
    matrix: SubstitutionMatrix,
    gap_penalty: f64,
    gene: GeneClass,
    local_align: bool,
    flip_seqs: bool,
    templates: Vec<(String, IntSeq)>,
}

impl Aligner {
    /// Build an aligner for one gene class. V templates get a global-ish
    /// right-anchored alignment (no zero clamp); D, J and undefined use
    /// local mode.
    pub fn new(matrix: SubstitutionMatrix, gap_penalty: f64, gene: GeneClass) -> Result<Self> {
        let local_align = match gene {
            GeneClass::V => false,
            GeneClass::D | GeneClass::J | GeneClass::Undefined => true,
            other => {
                return Err(VdjError::Config(format!(
                    "gene class {other} cannot be aligned"
                )))
            }
        };
        Ok(Aligner {
            matrix,
            gap_penalty,
            gene,
            local_align,
            flip_seqs: false,
            templates: Vec::new(),
        })
    }

    /// Align both sequences reversed, reflecting offsets and in/del
    /// coordinates on output.
    pub fn flip_sequences(mut self, flip: bool) -> Self {
        self.flip_seqs = flip;
        self
    }

    pub fn gene(&self) -> GeneClass {
        self.gene
    }

    pub fn set_templates(&mut self, templates: &[Template]) -> Result<()> {
        self.templates = templates
            .iter()
            .map(|t| Ok((t.name.clone(), nt2int(&t.seq)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    pub fn template_names(&self) -> impl Iterator<Item = &str> {
        self.templates.iter().map(|(name, _)| name.as_str())
    }

    /// Constant offset bounds over all loaded templates.
    pub fn uniform_bounds(&self, min_offset: i32, max_offset: i32) -> OffsetBounds {
        self.templates
            .iter()
            .map(|(name, _)| (name.clone(), (min_offset, max_offset)))
            .collect()
    }

    /// Align every (restricted) template against one read.
    pub fn align_seq(&self, nt_seq: &str, opts: &AlignmentOptions) -> Result<Vec<Alignment>> {
        let int_seq = nt2int(nt_seq)?;
        let seq_len = int_seq.len() as i32;
        let mut alignments = Vec::new();

        for (name, template) in &self.templates {
            if let Some(restricted) = &opts.restricted_templates {
                if !restricted.iter().any(|n| n == name) {
                    continue;
                }
            }
            let (mut min_offset, mut max_offset) = match &opts.offset_bounds {
                Some(bounds) => *bounds.get(name).ok_or_else(|| {
                    VdjError::Config(format!(
                        "missing genomic offset bounds for template \"{name}\""
                    ))
                })?,
                None => (i32::from(i16::MIN), i32::from(i16::MAX)),
            };
            if opts.rev_offset_frame {
                min_offset += seq_len - 1;
                max_offset += seq_len - 1;
            }
            let mut found = self.sw_align(
                &int_seq,
                template,
                opts.score_threshold,
                opts.best_align_only,
                min_offset,
                max_offset,
            );
            for alignment in &mut found {
                alignment.gene_name = name.clone();
            }
            alignments.extend(found);
        }

        if opts.best_gene_only {
            alignments = extract_best_gene_alignments(alignments);
        }
        Ok(alignments)
    }

    /// Align a corpus of indexed reads in parallel, keeping results in
    /// memory.
    pub fn align_seqs(
        &self,
        sequences: &[IndexedSeq],
        opts: &AlignmentOptions,
    ) -> Result<FnvHashMap<i32, Vec<Alignment>>> {
        let progress = alignment_progress(sequences.len() as u64, self.gene);
        let processed = AtomicUsize::new(0);
        let results: Result<Vec<(i32, Vec<Alignment>)>> = sequences
            .par_iter()
            .map(|seq| {
                let alignments = self.align_seq(&seq.seq, opts).map_err(|e| {
                    log::error!("alignment failed on sequence {};{}", seq.index, seq.seq);
                    e
                })?;
                let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                if done % 50 == 0 {
                    progress.set_position(done as u64);
                }
                Ok((seq.index, alignments))
            })
            .collect();
        progress.finish_and_clear();
        Ok(results?.into_iter().collect())
    }

    /// Align a corpus and stream the rows to a CSV file as reads complete,
    /// avoiding holding all alignments in memory.
    pub fn align_seqs_to_file<P: AsRef<Path>>(
        &self,
        path: P,
        sequences: &[IndexedSeq],
        opts: &AlignmentOptions,
    ) -> Result<()> {
        log::info!(
            "aligning {} sequences against {} {} templates (threshold {}, best_align_only {}, best_gene_only {})",
            sequences.len(),
            self.templates.len(),
            self.gene,
            opts.score_threshold,
            opts.best_align_only,
            opts.best_gene_only,
        );
        let writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .from_path(path.as_ref())?;
        let writer = Mutex::new(writer);
        let progress = alignment_progress(sequences.len() as u64, self.gene);
        let processed = AtomicUsize::new(0);

        sequences.par_iter().try_for_each(|seq| -> Result<()> {
            let alignments = self.align_seq(&seq.seq, opts).map_err(|e| {
                log::error!("alignment failed on sequence {};{}", seq.index, seq.seq);
                e
            })?;
            {
                let mut w = writer.lock().expect("alignment writer poisoned");
                for alignment in &alignments {
                    w.serialize(AlignmentRow::from_alignment(seq.index, alignment))?;
                }
            }
            let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
            if done % 50 == 0 {
                progress.set_position(done as u64);
            }
            Ok(())
        })?;
        progress.finish_and_clear();
        writer
            .into_inner()
            .expect("alignment writer poisoned")
            .flush()?;
        Ok(())
    }

    /// Smith-Waterman on integer-coded sequences. Returns alignments with an
    /// empty gene name, coordinates already reflected when flipping is on.
    fn sw_align(
        &self,
        read: &IntSeq,
        template: &IntSeq,
        score_threshold: f64,
        best_only: bool,
        min_offset: i32,
        max_offset: i32,
    ) -> Vec<Alignment> {
        let mut read_work = read.clone();
        let mut template_work = template.clone();
        if self.flip_seqs {
            read_work.reverse();
            template_work.reverse();
        }

        let n_rows = read_work.len();
        let n_cols = template_work.len();
        if n_rows == 0 || n_cols == 0 {
            return Vec::new();
        }

        let mut fill = FillState::new(n_rows, n_cols);

        // Square fronts from (1,1), then the leftover rows or columns.
        let k_max = n_rows.min(n_cols);
        for k in 1..=k_max {
            let mut i = 1;
            let mut j = 1;
            while i != k && j != k {
                self.fill_cell(&read_work, &template_work, i, k, &mut fill);
                i += 1;
                self.fill_cell(&read_work, &template_work, k, j, &mut fill);
                j += 1;
            }
            self.fill_cell(&read_work, &template_work, k, k, &mut fill);
        }
        if n_rows > n_cols {
            for i in (k_max + 1)..=n_rows {
                for j in 1..=n_cols {
                    self.fill_cell(&read_work, &template_work, i, j, &mut fill);
                }
            }
        } else {
            for j in (k_max + 1)..=n_cols {
                for i in 1..=n_rows {
                    self.fill_cell(&read_work, &template_work, i, j, &mut fill);
                }
            }
        }

        let mut results = Vec::new();
        let mut max_align_score = f64::NEG_INFINITY;
        for region in 0..fill.region_score.len() {
            if fill.region_score[region] < score_threshold {
                continue;
            }
            if let Some(alignment) = self.traceback(
                read,
                template,
                &fill,
                region,
                min_offset,
                max_offset,
            ) {
                max_align_score = max_align_score.max(alignment.score);
                results.push(alignment);
            }
        }
        if best_only {
            results.retain(|a| a.score >= max_align_score);
        }
        results
    }

    #[inline]
    fn fill_cell(&self, read: &[u8], template: &[u8], i: usize, j: usize, fill: &mut FillState) {
        let template_gap_score = fill.score[(i, j - 1)] - self.gap_penalty;
        let read_gap_score = fill.score[(i - 1, j)] - self.gap_penalty;
        let subs_score =
            fill.score[(i - 1, j - 1)] + self.matrix.score(read[i - 1], template[j - 1]);

        // Preference order: substitution, then gap in template (read base
        // consumed), then gap in read.
        if subs_score >= read_gap_score
            && subs_score >= template_gap_score
            && (subs_score > 0.0 || !self.local_align)
        {
            fill.score[(i, j)] = subs_score;
            fill.row_move[(i, j)] = 1;
            fill.col_move[(i, j)] = 1;
            if fill.region[(i - 1, j - 1)] == NO_REGION {
                fill.region[(i, j)] = fill.region_score.len() as i32;
                fill.region_score.push(subs_score);
                fill.region_max.push((i, j));
            } else {
                fill.region[(i, j)] = fill.region[(i - 1, j - 1)];
            }
        } else if read_gap_score >= template_gap_score
            && (read_gap_score > 0.0 || !self.local_align)
        {
            fill.score[(i, j)] = read_gap_score;
            fill.row_move[(i, j)] = 1;
            fill.col_move[(i, j)] = 0;
            fill.region[(i, j)] = fill.region[(i - 1, j)];
        } else if template_gap_score > 0.0 || !self.local_align {
            fill.score[(i, j)] = template_gap_score;
            fill.row_move[(i, j)] = 0;
            fill.col_move[(i, j)] = 1;
            fill.region[(i, j)] = fill.region[(i, j - 1)];
        } else {
            fill.score[(i, j)] = 0.0;
            fill.row_move[(i, j)] = 0;
            fill.col_move[(i, j)] = 0;
            fill.region[(i, j)] = fill.region[(i - 1, j - 1)];
        }

        let region = fill.region[(i, j)];
        if region != NO_REGION {
            let region = region as usize;
            if fill.score[(i, j)] > fill.region_score[region] {
                fill.region_score[region] = fill.score[(i, j)];
                fill.region_max[region] = (i, j);
            }
        }
    }

    fn traceback(
        &self,
        read: &IntSeq,
        template: &IntSeq,
        fill: &FillState,
        region: usize,
        min_offset: i32,
        max_offset: i32,
    ) -> Option<Alignment> {
        let read_len = read.len() as i32;
        let template_len = template.len() as i32;
        let (max_i, max_j) = fill.region_max[region];

        let mut insertions = Vec::new();
        let mut deletions = Vec::new();
        let mut length = 0usize;
        let mut i = max_i;
        let mut j = max_j;
        loop {
            let row_move = fill.row_move[(i, j)];
            let col_move = fill.col_move[(i, j)];
            if row_move == 0 && col_move == 0 {
                break;
            }
            if row_move == 0 {
                deletions.push(j as i32 - 1);
            } else if col_move == 0 {
                insertions.push(i as i32 - 1);
            }
            i -= row_move;
            j -= col_move;
            length += 1;
        }

        let mut offset = i as i32 - j as i32;
        let mut five_p_offset = i as i32;
        let mut three_p_offset = max_i as i32 - 1;
        if self.flip_seqs {
            offset = read_len - template_len - offset;
            let new_five = read_len - 1 - three_p_offset;
            three_p_offset = read_len - 1 - five_p_offset;
            five_p_offset = new_five;
            insertions = insertions.iter().map(|&p| read_len - 1 - p).collect();
            deletions = deletions.iter().map(|&p| template_len - 1 - p).collect();
        }
        insertions.sort_unstable();
        deletions.sort_unstable();

        if offset < min_offset || offset > max_offset {
            return None;
        }

        let mismatches = overlap_mismatches(read, template, offset, &insertions, &deletions);

        Some(Alignment {
            gene_name: String::new(),
            score: fill.region_score[region],
            offset,
            five_p_offset,
            three_p_offset,
            length,
            insertions,
            deletions,
            mismatches,
        })
    }
}

const NO_REGION: i32 = -1;

struct FillState {
    score: Array2<f64>,
    row_move: Array2<usize>,
    col_move: Array2<usize>,
    region: Array2<i32>,
    region_score: Vec<f64>,
    region_max: Vec<(usize, usize)>,
}

impl FillState {
    fn new(n_rows: usize, n_cols: usize) -> Self {
        FillState {
            score: Array2::zeros((n_rows + 1, n_cols + 1)),
            row_move: Array2::zeros((n_rows + 1, n_cols + 1)),
            col_move: Array2::zeros((n_rows + 1, n_cols + 1)),
            region: Array2::from_elem((n_rows + 1, n_cols + 1), NO_REGION),
            region_score: Vec::new(),
            region_max: Vec::new(),
        }
    }
}

/// Mismatch positions over the whole read/template overlap, skipping in/del
/// columns. Positions are read coordinates where `compatible` is false.
fn overlap_mismatches(
    read: &IntSeq,
    template: &IntSeq,
    offset: i32,
    insertions: &[i32],
    deletions: &[i32],
) -> Vec<i32> {
    let read_start = offset.max(0) as usize;
    let template_start = (-offset).max(0) as usize;
    if read_start >= read.len() || template_start >= template.len() {
        return Vec::new();
    }
    let n_ins = insertions.len();
    let n_del = deletions.len();
    // Clip both windows so they end together, accounting for gap columns.
    let mut read_window = read.len() - read_start;
    let mut template_window = template.len() - template_start;
    if read_window + n_del > template_window + n_ins {
        read_window = template_window + n_ins - n_del;
    } else {
        template_window = read_window + n_del - n_ins;
    }

    let mut mismatches = Vec::new();
    let mut read_ind = 0usize;
    let mut template_ind = 0usize;
    while read_ind < read_window && template_ind < template_window {
        let template_coord = (template_start + template_ind) as i32;
        let read_coord = (read_start + read_ind) as i32;
        if deletions.contains(&template_coord) {
            template_ind += 1;
        } else if insertions.contains(&read_coord) {
            read_ind += 1;
        } else {
            if !compatible(
                template[template_start + template_ind],
                read[read_start + read_ind],
            ) {
                mismatches.push(read_coord);
            }
            read_ind += 1;
            template_ind += 1;
        }
    }
    mismatches
}

/// Keep all tied alignments of all tied best genes/alleles.
pub fn extract_best_gene_alignments(alignments: Vec<Alignment>) -> Vec<Alignment> {
    let best_score = alignments
        .iter()
        .map(|a| a.score)
        .fold(f64::NEG_INFINITY, f64::max);
    let best_genes: Vec<&str> = {
        let mut names: Vec<&str> = alignments
            .iter()
            .filter(|a| a.score == best_score)
            .map(|a| a.gene_name.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    };
    let best_genes: Vec<String> = best_genes.into_iter().map(String::from).collect();
    alignments
        .into_iter()
        .filter(|a| best_genes.iter().any(|g| g == &a.gene_name))
        .collect()
}

fn alignment_progress(total: u64, gene: GeneClass) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{msg} [{bar:50}] {pos}/{len}")
            .expect("valid progress template")
            .progress_chars("=> "),
    );
    pb.set_message(format!("{gene} alignments"));
    pb
}

/// One CSV row of the alignment table.
#[derive(Debug, Serialize, Deserialize)]
struct AlignmentRow {
    seq_index: i32,
    gene_name: String,
    score: f64,
    offset: i32,
    #[serde(with = "brace_list")]
    insertions: Vec<i32>,
    #[serde(with = "brace_list")]
    deletions: Vec<i32>,
    #[serde(with = "brace_list")]
    mismatches: Vec<i32>,
    align_length: usize,
    #[serde(rename = "5_p_align_offset")]
    five_p_align_offset: i32,
    #[serde(rename = "3_p_align_offset")]
    three_p_align_offset: i32,
}

impl AlignmentRow {
    fn from_alignment(seq_index: i32, alignment: &Alignment) -> Self {
        AlignmentRow {
            seq_index,
            gene_name: alignment.gene_name.clone(),
            score: alignment.score,
            offset: alignment.offset,
            insertions: alignment.insertions.clone(),
            deletions: alignment.deletions.clone(),
            mismatches: alignment.mismatches.clone(),
            align_length: alignment.length,
            five_p_align_offset: alignment.five_p_offset,
            three_p_align_offset: alignment.three_p_offset,
        }
    }

    fn into_alignment(self) -> (i32, Alignment) {
        (
            self.seq_index,
            Alignment {
                gene_name: self.gene_name,
                score: self.score,
                offset: self.offset,
                five_p_offset: self.five_p_align_offset,
                three_p_offset: self.three_p_align_offset,
                length: self.align_length,
                insertions: self.insertions,
                deletions: self.deletions,
                mismatches: self.mismatches,
            },
        )
    }
}

/// Comma-separated integer lists wrapped in curly braces, e.g. `{3,17,22}`.
mod brace_list {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(list: &[i32], serializer: S) -> Result<S::Ok, S::Error> {
        let inner = list
            .iter()
            .map(|x| x.to_string())
            .collect::<Vec<_>>()
            .join(",");
        serializer.serialize_str(&format!("{{{inner}}}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<i32>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let inner = raw
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .ok_or_else(|| de::Error::custom(format!("expected braced list, got \"{raw}\"")))?;
        if inner.is_empty() {
            return Ok(Vec::new());
        }
        inner
            .split(',')
            .map(|x| {
                x.trim()
                    .parse()
                    .map_err(|_| de::Error::custom(format!("bad integer \"{x}\" in \"{raw}\"")))
            })
            .collect()
    }
}

/// Write alignments held in memory to the semicolon-separated table.
pub fn write_alignments_csv<P: AsRef<Path>>(
    path: P,
    alignments: &FnvHashMap<i32, Vec<Alignment>>,
) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().delimiter(b';').from_path(path)?;
    let mut indices: Vec<i32> = alignments.keys().copied().collect();
    indices.sort_unstable();
    for index in indices {
        for alignment in &alignments[&index] {
            writer.serialize(AlignmentRow::from_alignment(index, alignment))?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Read the alignment table back, dropping rows below `score_threshold` and,
/// unless `allow_in_dels` is set, rows with insertions or deletions. Rows
/// missing the mismatch field are rejected.
pub fn read_alignments_csv<P: AsRef<Path>>(
    path: P,
    score_threshold: f64,
    allow_in_dels: bool,
) -> Result<FnvHashMap<i32, Vec<Alignment>>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .from_path(path.as_ref())?;
    let mut alignments: FnvHashMap<i32, Vec<Alignment>> = FnvHashMap::default();
    for row in reader.deserialize::<AlignmentRow>() {
        let row = row.map_err(|e| VdjError::InputFormat(format!("bad alignment row: {e}")))?;
        let (index, alignment) = row.into_alignment();
        if alignment.score < score_threshold {
            continue;
        }
        if !allow_in_dels && (!alignment.insertions.is_empty() || !alignment.deletions.is_empty()) {
            continue;
        }
        alignments.entry(index).or_default().push(alignment);
    }
    Ok(alignments)
}

/// Read the alignment table keeping, per read, alignments scoring within
/// `score_range` of that read's best, sorted by descending score.
pub fn read_alignments_csv_score_range<P: AsRef<Path>>(
    path: P,
    score_range: f64,
    allow_in_dels: bool,
) -> Result<FnvHashMap<i32, Vec<Alignment>>> {
    let mut alignments = read_alignments_csv(path, f64::NEG_INFINITY, allow_in_dels)?;
    for seq_alignments in alignments.values_mut() {
        let best = seq_alignments
            .iter()
            .map(|a| a.score)
            .fold(f64::NEG_INFINITY, f64::max);
        seq_alignments.retain(|a| a.score >= best - score_range);
        seq_alignments.sort_by(|a, b| b.score.partial_cmp(&a.score).expect("finite scores"));
    }
    Ok(alignments)
}

/// Read template-specific offset bounds from a `gene;min;max` CSV.
pub fn read_offset_bounds_csv<P: AsRef<Path>>(path: P, sep: char) -> Result<OffsetBounds> {
    let text = std::fs::read_to_string(path)?;
    let mut bounds = OffsetBounds::default();
    for line in text.lines().skip(1).filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split(sep).collect();
        if fields.len() < 3 {
            return Err(VdjError::InputFormat(format!(
                "expected three fields (gene;min;max) in \"{line}\""
            )));
        }
        let min: i32 = fields[1].trim().parse().map_err(|_| {
            VdjError::InputFormat(format!("bad min offset in \"{line}\""))
        })?;
        let max: i32 = fields[2].trim().parse().map_err(|_| {
            VdjError::InputFormat(format!("bad max offset in \"{line}\""))
        })?;
        bounds.insert(fields[0].trim().to_string(), (min, max));
    }
    Ok(bounds)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::Template;

    fn template(name: &str, seq: &str) -> Template {
        Template {
            name: name.to_string(),
            seq: seq.to_string(),
        }
    }

    fn test_aligner(gene: GeneClass, templates: &[Template]) -> Aligner {
        let mut aligner =
            Aligner::new(SubstitutionMatrix::simple(5.0, -4.0), 10.0, gene).unwrap();
        aligner.set_templates(templates).unwrap();
        aligner
    }

    fn band(aligner: &Aligner, min: i32, max: i32) -> AlignmentOptions {
        AlignmentOptions::default().offset_bounds(aligner.uniform_bounds(min, max))
    }

    #[test]
    fn perfect_match_scores_full_length() {
        let aligner = test_aligner(GeneClass::J, &[template("t", "ACGTACGT")]);
        let opts = band(&aligner, -2, 2).score_threshold(10.0);
        let alignments = aligner.align_seq("ACGTACGT", &opts).unwrap();
        assert_eq!(alignments.len(), 1);
        let a = &alignments[0];
        assert_eq!(a.score, 40.0);
        assert_eq!(a.offset, 0);
        assert_eq!(a.length, 8);
        assert!(a.insertions.is_empty());
        assert!(a.deletions.is_empty());
        assert!(a.mismatches.is_empty());
        assert_eq!(a.five_p_offset, 0);
        assert_eq!(a.three_p_offset, 7);
    }

    #[test]
    fn single_mismatch_is_located() {
        let aligner = test_aligner(GeneClass::J, &[template("t", "ACGTAAGT")]);
        let opts = band(&aligner, -2, 2).score_threshold(10.0);
        let alignments = aligner.align_seq("ACGTACGT", &opts).unwrap();
        assert_eq!(alignments.len(), 1);
        let a = &alignments[0];
        assert_eq!(a.score, 31.0);
        assert_eq!(a.offset, 0);
        assert_eq!(a.mismatches, vec![5]);
    }

    #[test]
    fn offset_band_bounds_are_inclusive() {
        // Template aligns at read offset 2 with score 25.
        let aligner = test_aligner(GeneClass::J, &[template("t", "GTACG")]);
        let hit = aligner
            .align_seq("ACGTACGT", &band(&aligner, 2, 2).score_threshold(20.0))
            .unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].offset, 2);

        let above = aligner
            .align_seq("ACGTACGT", &band(&aligner, 3, 5).score_threshold(20.0))
            .unwrap();
        assert!(above.is_empty());
        let below = aligner
            .align_seq("ACGTACGT", &band(&aligner, -3, 1).score_threshold(20.0))
            .unwrap();
        assert!(below.is_empty());
    }

    #[test]
    fn missing_band_entry_is_fatal() {
        let aligner = test_aligner(GeneClass::J, &[template("t", "ACGT")]);
        let mut bounds = OffsetBounds::default();
        bounds.insert("other".to_string(), (0, 0));
        let opts = AlignmentOptions::default().offset_bounds(bounds);
        assert!(matches!(
            aligner.align_seq("ACGT", &opts),
            Err(VdjError::Config(_))
        ));
    }

    #[test]
    fn below_threshold_yields_empty_list() {
        let aligner = test_aligner(GeneClass::J, &[template("t", "ACGT")]);
        let opts = band(&aligner, -8, 8).score_threshold(1000.0);
        assert!(aligner.align_seq("ACGTACGT", &opts).unwrap().is_empty());
    }

    #[test]
    fn v_mode_aligns_template_through_read_start() {
        // Template longer than its read overlap: offset is negative and the
        // global-ish mode still reports the alignment.
        let aligner = test_aligner(GeneClass::V, &[template("v", "TTTACGTACG")]);
        let opts = band(&aligner, -5, 0).score_threshold(20.0);
        let alignments = aligner.align_seq("ACGTACGTTT", &opts).unwrap();
        assert_eq!(alignments.len(), 1);
        assert_eq!(alignments[0].offset, -3);
        assert!(alignments[0].mismatches.is_empty());
    }

    #[test]
    fn negative_offset_mismatches_are_read_coordinates() {
        let aligner = test_aligner(GeneClass::V, &[template("v", "TTACGAACGT")]);
        let opts = band(&aligner, -2, -2).score_threshold(10.0);
        let alignments = aligner.align_seq("ACGTACGT", &opts).unwrap();
        assert_eq!(alignments.len(), 1);
        // template[2..] = ACGAACGT vs read ACGTACGT: mismatch at read pos 3.
        assert_eq!(alignments[0].mismatches, vec![3]);
    }

    #[test]
    fn best_gene_only_keeps_all_ties() {
        let aligner = test_aligner(
            GeneClass::J,
            &[
                template("a", "ACGTACGT"),
                template("b", "ACGTACGT"),
                template("worse", "ACGTAAAA"),
            ],
        );
        let opts = band(&aligner, -2, 2).best_gene_only(true).score_threshold(10.0);
        let alignments = aligner.align_seq("ACGTACGT", &opts).unwrap();
        let mut genes: Vec<&str> = alignments.iter().map(|a| a.gene_name.as_str()).collect();
        genes.sort_unstable();
        assert_eq!(genes, vec!["a", "b"]);
    }

    #[test]
    fn gap_produces_insertion_coordinates() {
        // Read carries one extra base relative to the template.
        let aligner = test_aligner(GeneClass::J, &[template("t", "ACGTACGT")]);
        let opts = band(&aligner, -2, 2).score_threshold(20.0);
        let alignments = aligner.align_seq("ACGTAACGT", &opts).unwrap();
        assert!(!alignments.is_empty());
        let best = alignments
            .iter()
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap())
            .unwrap();
        assert_eq!(best.score, 30.0);
        assert_eq!(best.insertions.len(), 1);
        assert!(best.deletions.is_empty());
    }

    #[test]
    fn alignment_csv_roundtrip() {
        use assert_fs::TempDir;

        let aligner = test_aligner(GeneClass::J, &[template("t", "ACGTAAGT")]);
        let opts = band(&aligner, -2, 2);
        let mut alignments = FnvHashMap::default();
        alignments.insert(3, aligner.align_seq("ACGTACGT", &opts).unwrap());

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("alignments.csv");
        write_alignments_csv(&path, &alignments).unwrap();

        let header = std::fs::read_to_string(&path).unwrap();
        assert!(header.starts_with(
            "seq_index;gene_name;score;offset;insertions;deletions;mismatches;align_length;5_p_align_offset;3_p_align_offset"
        ));

        let back = read_alignments_csv(&path, f64::NEG_INFINITY, false).unwrap();
        assert_eq!(back[&3], alignments[&3]);
    }

    #[test]
    fn alignment_row_missing_mismatches_is_rejected() {
        use assert_fs::TempDir;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("alignments.csv");
        std::fs::write(
            &path,
            "seq_index;gene_name;score;offset;insertions;deletions;mismatches;align_length;5_p_align_offset;3_p_align_offset\n0;t;40;0;{};{};8;0;7\n",
        )
        .unwrap();
        assert!(matches!(
            read_alignments_csv(&path, 0.0, false),
            Err(VdjError::InputFormat(_))
        ));
    }

    #[test]
    fn score_range_read_back_keeps_near_best() {
        use assert_fs::TempDir;

        let aligner = test_aligner(
            GeneClass::J,
            &[
                template("best", "ACGTACGT"),
                template("close", "ACGTAAGT"),
                template("far", "AAAAACGT"),
            ],
        );
        let opts = band(&aligner, -2, 2).score_threshold(5.0);
        let mut alignments = FnvHashMap::default();
        alignments.insert(0, aligner.align_seq("ACGTACGT", &opts).unwrap());

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("alignments.csv");
        write_alignments_csv(&path, &alignments).unwrap();

        let back = read_alignments_csv_score_range(&path, 9.0, false).unwrap();
        let genes: Vec<&str> = back[&0].iter().map(|a| a.gene_name.as_str()).collect();
        assert_eq!(genes, vec!["best", "close"]);
    }
}
