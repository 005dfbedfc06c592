//! Forward sampling of synthetic reads from the current model.
//!
//! The event queue is traversed once per read; each event samples one
//! realisation from its conditional given the already-sampled parents,
//! using the same tensor layout as inference. The error model then
//! introduces per-site substitutions.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use itertools::Itertools;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::error::{Result, VdjError};
use crate::graph::{EventType, GeneClass, ModelParms, SeqSide};
use crate::infer::events::{apply_trims, draw_dinuc_sequence, draw_index, first_canonical};
use crate::infer::validate_model_queue;
use crate::marginals::{MarginalLayout, Marginals};
use crate::nucleotide::{int2nt, IntSeq};
use crate::scratch::{gene_slot, ins_slot, SeqType, ASSEMBLY_ORDER};

#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    /// RNG seed; derived from entropy (and logged) when absent.
    pub seed: Option<u64>,
    pub with_errors: bool,
}

impl GenerationOptions {
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_errors(mut self, with_errors: bool) -> Self {
        self.with_errors = with_errors;
        self
    }
}

/// One synthetic read with its latent realisation tuples (one per event, in
/// queue order) and the error positions.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSequence {
    pub index: usize,
    pub seq: String,
    pub realizations: Vec<Vec<i64>>,
    pub errors: Vec<usize>,
}

pub struct Generator<'a> {
    parms: &'a ModelParms,
    marginals: &'a Marginals,
    layout: MarginalLayout,
}

impl<'a> Generator<'a> {
    pub fn new(parms: &'a ModelParms, marginals: &'a Marginals) -> Result<Self> {
        let layout = MarginalLayout::new(parms);
        validate_model_queue(parms, &layout)?;
        Ok(Generator {
            parms,
            marginals,
            layout,
        })
    }

    /// Sample `n` reads. A fixed seed yields a reproducible stream.
    pub fn generate(&self, n: usize, opts: &GenerationOptions) -> Result<Vec<GeneratedSequence>> {
        let seed = opts.seed.unwrap_or_else(rand::random);
        log::info!("generating {n} sequences with seed {seed}");
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut sequences = Vec::with_capacity(n);
        for index in 0..n {
            sequences.push(self.generate_one(index, opts.with_errors, &mut rng)?);
        }
        Ok(sequences)
    }

    fn generate_one(
        &self,
        index: usize,
        with_errors: bool,
        rng: &mut SmallRng,
    ) -> Result<GeneratedSequence> {
        let probas = self.marginals.as_slice();
        let mut chosen = vec![0usize; self.parms.n_events()];
        let mut realizations: Vec<Vec<i64>> = Vec::with_capacity(self.parms.n_events() + 1);

        // Sampled state: template and signed trims per gene slot, insertion
        // lengths and inserted nucleotides per composite slot.
        let mut templates: [Option<&IntSeq>; 3] = [None; 3];
        let mut trims: [(i32, i32); 3] = [(0, 0); 3];
        let mut ins_lens: [usize; 3] = [0; 3];
        let mut ins_seqs: [IntSeq; 3] = [Vec::new(), Vec::new(), Vec::new()];

        for &id in &self.layout.queue {
            let event = self.parms.event(id);
            match event.event_type {
                EventType::GeneChoice => {
                    let base = self.layout.slot(id, &chosen, 0);
                    let drawn = draw_index(&probas[base..base + event.n_realizations()], rng);
                    chosen[id] = drawn;
                    let slot = gene_slot(event.class).expect("validated gene class");
                    templates[slot] = event.realizations()[drawn].seq.as_ref();
                    realizations.push(vec![drawn as i64]);
                }
                EventType::Deletion => {
                    let base = self.layout.slot(id, &chosen, 0);
                    let drawn = draw_index(&probas[base..base + event.n_realizations()], rng);
                    chosen[id] = drawn;
                    let slot = gene_slot(event.class).expect("validated gene class");
                    let value = event.realizations()[drawn].value;
                    match event.side {
                        SeqSide::FivePrime => trims[slot].0 = value,
                        SeqSide::ThreePrime => trims[slot].1 = value,
                        SeqSide::Undefined => {
                            return Err(VdjError::Config(format!(
                                "Deletion event \"{}\" needs a defined sequence side",
                                event.name()
                            )))
                        }
                    }
                    realizations.push(vec![drawn as i64]);
                }
                EventType::Insertion => {
                    let base = self.layout.slot(id, &chosen, 0);
                    let drawn = draw_index(&probas[base..base + event.n_realizations()], rng);
                    chosen[id] = drawn;
                    let slot = ins_slot(event.class).expect("validated gene class");
                    ins_lens[slot] = event.realizations()[drawn].value.max(0) as usize;
                    realizations.push(vec![drawn as i64]);
                }
                EventType::DinucMarkov => {
                    let slot = ins_slot(event.class).expect("validated gene class");
                    let slab_base = self.layout.slot(id, &chosen, 0);
                    let (prev, reverse) = match event.class {
                        GeneClass::DJ => (
                            flank_nucleotide(templates[2], trims[2], true),
                            true,
                        ),
                        _ => (flank_nucleotide(templates[0], trims[0], false), false),
                    };
                    let inserted = draw_dinuc_sequence(
                        probas,
                        slab_base,
                        ins_lens[slot],
                        prev,
                        reverse,
                        rng,
                    );
                    realizations.push(inserted.iter().map(|&c| c as i64).collect());
                    ins_seqs[slot] = inserted;
                }
            }
        }

        let mut codes = IntSeq::new();
        for seq_type in ASSEMBLY_ORDER {
            match seq_type {
                SeqType::VGeneSeq | SeqType::DGeneSeq | SeqType::JGeneSeq => {
                    let slot = match seq_type {
                        SeqType::VGeneSeq => 0,
                        SeqType::DGeneSeq => 1,
                        _ => 2,
                    };
                    if let Some(template) = templates[slot] {
                        codes.extend(apply_trims(template, trims[slot].0, trims[slot].1));
                    }
                }
                SeqType::VDInsSeq => codes.extend_from_slice(&ins_seqs[0]),
                SeqType::VJInsSeq => codes.extend_from_slice(&ins_seqs[1]),
                SeqType::DJInsSeq => codes.extend_from_slice(&ins_seqs[2]),
            }
        }

        let errors = if with_errors {
            self.parms.error_model.generate_errors(&mut codes, rng)
        } else {
            Vec::new()
        };

        Ok(GeneratedSequence {
            index,
            seq: int2nt(&codes),
            realizations,
            errors,
        })
    }
}

/// Last (or first, when walking from the 3' side) nucleotide of a trimmed
/// template, conditioning the adjacent insertion chain.
fn flank_nucleotide(template: Option<&IntSeq>, trims: (i32, i32), from_begin: bool) -> Option<u8> {
    let template = template?;
    let trimmed = apply_trims(template, trims.0, trims.1);
    let code = if from_begin {
        *trimmed.first()?
    } else {
        *trimmed.last()?
    };
    Some(first_canonical(code))
}

/// Write `seq_index;nt_sequence` for generated reads.
pub fn write_generated_sequences<P: AsRef<Path>>(
    path: P,
    sequences: &[GeneratedSequence],
) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "seq_index;nt_sequence")?;
    for sequence in sequences {
        writeln!(w, "{};{}", sequence.index, sequence.seq)?;
    }
    Ok(())
}

/// Write the per-event realisation tuples, one `(a,b,...)` group per event
/// in queue order, with the error positions last.
pub fn write_generated_realizations<P: AsRef<Path>>(
    path: P,
    parms: &ModelParms,
    sequences: &[GeneratedSequence],
) -> Result<()> {
    let layout = MarginalLayout::new(parms);
    let mut w = BufWriter::new(File::create(path)?);
    write!(w, "seq_index")?;
    for &id in &layout.queue {
        write!(w, ";{}", parms.event(id).name())?;
    }
    writeln!(w, ";Errors")?;
    for sequence in sequences {
        write!(w, "{}", sequence.index)?;
        for tuple in &sequence.realizations {
            write!(w, ";({})", tuple.iter().join(","))?;
        }
        writeln!(w, ";({})", sequence.errors.iter().join(","))?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::{Event, EventId};
    use crate::nucleotide::nt2int;

    fn two_event_model() -> (ModelParms, EventId, EventId) {
        let mut parms = ModelParms::new();
        let v = parms
            .add_event(Event::new(
                EventType::GeneChoice,
                GeneClass::V,
                SeqSide::Undefined,
                7,
                "v_choice",
            ))
            .unwrap();
        let j = parms
            .add_event(Event::new(
                EventType::GeneChoice,
                GeneClass::J,
                SeqSide::Undefined,
                6,
                "j_choice",
            ))
            .unwrap();
        for (name, seq) in [("V1", "ACGTAC"), ("V2", "ACGAAC")] {
            parms
                .event_mut(v)
                .add_realization(name, i32::MAX, Some(nt2int(seq).unwrap()));
        }
        for (name, seq) in [("J1", "TTGG"), ("J2", "CCAA")] {
            parms
                .event_mut(j)
                .add_realization(name, i32::MAX, Some(nt2int(seq).unwrap()));
        }
        (parms, v, j)
    }

    #[test]
    fn seeded_generation_is_reproducible() {
        let (parms, _, _) = two_event_model();
        let mut marginals = Marginals::new(&parms);
        marginals.uniform_initialize(&parms);
        let generator = Generator::new(&parms, &marginals).unwrap();
        let opts = GenerationOptions::default().seed(0x12345);
        let first = generator.generate(20, &opts).unwrap();
        let second = generator.generate(20, &opts).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn generated_sequence_is_template_concatenation() {
        let (parms, _, _) = two_event_model();
        let mut marginals = Marginals::new(&parms);
        marginals.uniform_initialize(&parms);
        let generator = Generator::new(&parms, &marginals).unwrap();
        let sequences = generator
            .generate(10, &GenerationOptions::default().seed(7))
            .unwrap();
        for sequence in sequences {
            let v = sequence.realizations[0][0] as usize;
            let j = sequence.realizations[1][0] as usize;
            let v_seq = ["ACGTAC", "ACGAAC"][v];
            let j_seq = ["TTGG", "CCAA"][j];
            assert_eq!(sequence.seq, format!("{v_seq}{j_seq}"));
            assert!(sequence.errors.is_empty());
        }
    }

    #[test]
    fn degenerate_marginals_pin_the_outcome() {
        let (parms, v, j) = two_event_model();
        let mut marginals = Marginals::new(&parms);
        marginals.uniform_initialize(&parms);
        marginals.set_realization_proba(&parms, v, "V2", 1.0).unwrap();
        marginals.set_realization_proba(&parms, j, "J1", 1.0).unwrap();
        let generator = Generator::new(&parms, &marginals).unwrap();
        let sequences = generator
            .generate(5, &GenerationOptions::default().seed(99))
            .unwrap();
        for sequence in sequences {
            assert_eq!(sequence.seq, "ACGAACTTGG");
        }
    }

    #[test]
    fn realization_files_are_written() {
        use assert_fs::TempDir;

        let (parms, _, _) = two_event_model();
        let mut marginals = Marginals::new(&parms);
        marginals.uniform_initialize(&parms);
        let generator = Generator::new(&parms, &marginals).unwrap();
        let sequences = generator
            .generate(3, &GenerationOptions::default().seed(1))
            .unwrap();

        let dir = TempDir::new().unwrap();
        let seq_path = dir.path().join("generated_seqs.csv");
        let real_path = dir.path().join("generated_realizations.csv");
        write_generated_sequences(&seq_path, &sequences).unwrap();
        write_generated_realizations(&real_path, &parms, &sequences).unwrap();

        let seq_text = std::fs::read_to_string(&seq_path).unwrap();
        assert!(seq_text.starts_with("seq_index;nt_sequence"));
        assert_eq!(seq_text.lines().count(), 4);

        let real_text = std::fs::read_to_string(&real_path).unwrap();
        let header = real_text.lines().next().unwrap();
        assert!(header.starts_with("seq_index;"));
        assert!(header.ends_with(";Errors"));
        for line in real_text.lines().skip(1) {
            assert_eq!(line.matches('(').count(), 3);
        }
    }
}
