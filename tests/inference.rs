//! End-to-end inference tests: alignment -> enumeration -> EM, plus the
//! generation round trip.

use anyhow::Result;
use fnv::FnvHashMap;

use vdjinf::align::{Aligner, AlignmentOptions, SubstitutionMatrix};
use vdjinf::counters::CounterRegistry;
use vdjinf::generate::{GenerationOptions, Generator};
use vdjinf::graph::{Event, EventType, GeneClass, ModelParms, SeqSide};
use vdjinf::infer::{evaluate_sequence, infer, InferenceOptions, SequenceRecord};
use vdjinf::marginals::{MarginalLayout, Marginals};
use vdjinf::nucleotide::nt2int;
use vdjinf::VdjError;

const V_TEMPLATE: &str = "ACGTACGG";
const D_TEMPLATE: &str = "GGGGG";
const J_TEMPLATE: &str = "CCCCAA";

/// A complete VDJ model: three gene choices, four trims, two insertions and
/// their dinucleotide chains, uniform marginals.
fn vdj_model() -> (ModelParms, Marginals) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut parms = ModelParms::new();
    let v = parms
        .add_event(Event::new(EventType::GeneChoice, GeneClass::V, SeqSide::Undefined, 10, "v_choice"))
        .unwrap();
    let d = parms
        .add_event(Event::new(EventType::GeneChoice, GeneClass::D, SeqSide::Undefined, 9, "d_gene"))
        .unwrap();
    let j = parms
        .add_event(Event::new(EventType::GeneChoice, GeneClass::J, SeqSide::Undefined, 8, "j_choice"))
        .unwrap();
    let v3 = parms
        .add_event(Event::new(EventType::Deletion, GeneClass::V, SeqSide::ThreePrime, 6, "v_3_del"))
        .unwrap();
    let d5 = parms
        .add_event(Event::new(EventType::Deletion, GeneClass::D, SeqSide::FivePrime, 5, "d_5_del"))
        .unwrap();
    let d3 = parms
        .add_event(Event::new(EventType::Deletion, GeneClass::D, SeqSide::ThreePrime, 4, "d_3_del"))
        .unwrap();
    let j5 = parms
        .add_event(Event::new(EventType::Deletion, GeneClass::J, SeqSide::FivePrime, 3, "j_5_del"))
        .unwrap();
    let vd_ins = parms
        .add_event(Event::new(EventType::Insertion, GeneClass::VD, SeqSide::Undefined, 2, "vd_ins"))
        .unwrap();
    let dj_ins = parms
        .add_event(Event::new(EventType::Insertion, GeneClass::DJ, SeqSide::Undefined, 1, "dj_ins"))
        .unwrap();
    parms
        .add_event(Event::new(EventType::DinucMarkov, GeneClass::VD, SeqSide::Undefined, 0, "vd_dinucl"))
        .unwrap();
    parms
        .add_event(Event::new(EventType::DinucMarkov, GeneClass::DJ, SeqSide::Undefined, -1, "dj_dinucl"))
        .unwrap();

    parms
        .event_mut(v)
        .add_realization("V1", i32::MAX, Some(nt2int(V_TEMPLATE).unwrap()));
    parms
        .event_mut(d)
        .add_realization("D1", i32::MAX, Some(nt2int(D_TEMPLATE).unwrap()));
    parms
        .event_mut(j)
        .add_realization("J1", i32::MAX, Some(nt2int(J_TEMPLATE).unwrap()));
    for del in -1..=2 {
        parms.event_mut(v3).add_realization(del.to_string(), del, None);
    }
    for del in 0..=1 {
        parms.event_mut(d5).add_realization(del.to_string(), del, None);
        parms.event_mut(d3).add_realization(del.to_string(), del, None);
    }
    for del in 0..=2 {
        parms.event_mut(j5).add_realization(del.to_string(), del, None);
    }
    for ins in 0..=3 {
        parms.event_mut(vd_ins).add_realization(ins.to_string(), ins, None);
        parms.event_mut(dj_ins).add_realization(ins.to_string(), ins, None);
    }

    let mut marginals = Marginals::new(&parms);
    marginals.uniform_initialize(&parms);
    (parms, marginals)
}

/// Align one read against the model templates and bundle the results.
fn align_read(index: i32, read: &str) -> Result<SequenceRecord> {
    let matrix = SubstitutionMatrix::simple(5.0, -4.0);
    let mut record = SequenceRecord {
        index,
        seq: read.to_string(),
        alignments: FnvHashMap::default(),
    };
    for (class, name, template, threshold) in [
        (GeneClass::V, "V1", V_TEMPLATE, 20.0),
        (GeneClass::D, "D1", D_TEMPLATE, 15.0),
        (GeneClass::J, "J1", J_TEMPLATE, 15.0),
    ] {
        let mut aligner = Aligner::new(matrix.clone(), 10.0, class)?;
        aligner.set_templates(&[vdjinf::io::Template {
            name: name.to_string(),
            seq: template.to_string(),
        }])?;
        let opts = AlignmentOptions::default().score_threshold(threshold);
        record
            .alignments
            .insert(class, aligner.align_seq(read, &opts)?);
    }
    Ok(record)
}

/// V (8nt) + "AT" + D (5nt) + "" + J (6nt).
const READ: &str = "ACGTACGGATGGGGGCCCCAA";

#[test]
fn posterior_weights_have_unit_mass_per_event() -> Result<()> {
    let (parms, marginals) = vdj_model();
    let record = align_read(0, READ)?;
    let evaluation = evaluate_sequence(&parms, &marginals, &record, &InferenceOptions::default())?;
    assert!(evaluation.likelihood > 0.0);
    assert!(evaluation.n_scenarios >= 1);

    // After unit-mass normalisation every non-Markov event slab carries
    // total posterior weight 1 (the raw accumulator summed to the sequence
    // likelihood).
    let layout = MarginalLayout::new(&parms);
    for event in parms.events() {
        if event.event_type == EventType::DinucMarkov {
            continue;
        }
        let base = layout.index_map[event.id()];
        let size = layout.event_sizes[event.id()];
        let mass: f64 = evaluation.seq_marginals[base..base + size].iter().sum();
        assert!(
            (mass - 1.0).abs() < 1e-9,
            "event {} carries posterior mass {mass}",
            event.name()
        );
    }
    Ok(())
}

#[test]
fn viterbi_support_is_a_single_scenario() -> Result<()> {
    let (parms, marginals) = vdj_model();
    let record = align_read(0, READ)?;
    let opts = InferenceOptions::default().viterbi(true);
    let evaluation = evaluate_sequence(&parms, &marginals, &record, &opts)?;
    assert!(evaluation.likelihood > 0.0);
    assert!((evaluation.likelihood - evaluation.best_scenario).abs() < 1e-15);

    let layout = MarginalLayout::new(&parms);
    for event in parms.events() {
        if event.event_type == EventType::DinucMarkov {
            continue;
        }
        let base = layout.index_map[event.id()];
        let size = layout.event_sizes[event.id()];
        let slab = &evaluation.seq_marginals[base..base + size];
        let nonzero: Vec<(usize, f64)> = slab
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, x)| *x != 0.0)
            .collect();
        assert_eq!(nonzero.len(), 1, "event {}", event.name());
        assert!((nonzero[0].1 - 1.0).abs() < 1e-9);
    }
    Ok(())
}

#[test]
fn viterbi_recovers_the_intended_scenario() -> Result<()> {
    let (parms, marginals) = vdj_model();
    let record = align_read(0, READ)?;
    let opts = InferenceOptions::default().viterbi(true);
    let evaluation = evaluate_sequence(&parms, &marginals, &record, &opts)?;

    let layout = MarginalLayout::new(&parms);
    // Expected realisations: no trims anywhere, 2 VD insertions, 0 DJ
    // insertions (realisation indices: trims -1..=2 make "0" index 1).
    let expected: &[(&str, usize)] = &[
        ("v_choice", 0),
        ("d_gene", 0),
        ("j_choice", 0),
        ("v_3_del", 1),
        ("d_5_del", 0),
        ("d_3_del", 0),
        ("j_5_del", 0),
        ("vd_ins", 2),
        ("dj_ins", 0),
    ];
    for &(nickname, realization) in expected {
        let id = parms.event_by_nickname(nickname)?;
        let base = layout.index_map[id];
        let size = layout.event_sizes[id];
        let slab = &evaluation.seq_marginals[base..base + size];
        let support: Vec<usize> = (0..size).filter(|&i| slab[i] != 0.0).collect();
        assert_eq!(support.len(), 1, "event {nickname}");
        // The slab index modulo the event's own dimension is the
        // realisation index.
        let own_dim = parms.event(id).n_realizations();
        assert_eq!(support[0] % own_dim, realization, "event {nickname}");
    }
    Ok(())
}

#[test]
fn empty_alignment_list_contributes_zero_weight() -> Result<()> {
    let (parms, marginals) = vdj_model();
    let mut record = align_read(0, READ)?;
    record.alignments.insert(GeneClass::V, Vec::new());
    let evaluation = evaluate_sequence(&parms, &marginals, &record, &InferenceOptions::default())?;
    assert_eq!(evaluation.likelihood, 0.0);
    assert!(evaluation.seq_marginals.iter().all(|&x| x == 0.0));
    Ok(())
}

#[test]
fn thresholds_outside_unit_interval_are_fatal() {
    let (mut parms, mut marginals) = vdj_model();
    let mut counters = CounterRegistry::new();
    let opts = InferenceOptions::default().likelihood_threshold(2.0);
    let err = infer(&mut parms, &mut marginals, &[], &mut counters, &opts).unwrap_err();
    assert!(matches!(err, VdjError::Threshold(_)));

    let opts = InferenceOptions::default().proba_threshold_factor(0.0);
    let err = infer(&mut parms, &mut marginals, &[], &mut counters, &opts).unwrap_err();
    assert!(matches!(err, VdjError::Threshold(_)));
}

#[test]
fn em_iteration_concentrates_posterior_mass() -> Result<()> {
    let (mut parms, mut marginals) = vdj_model();
    let records = vec![align_read(0, READ)?, align_read(1, READ)?];
    let mut counters = CounterRegistry::new();
    let summary = infer(
        &mut parms,
        &mut marginals,
        &records,
        &mut counters,
        &InferenceOptions::default(),
    )?;
    assert_eq!(summary.iterations.len(), 1);
    assert_eq!(summary.iterations[0].n_seq, 2);
    assert!(summary.iterations[0].mean_log_likelihood.is_finite());

    // The dominant scenario has two VD insertions; after one EM pass the
    // VD-insertion marginal must favour count 2.
    let layout = MarginalLayout::new(&parms);
    let vd_ins = parms.event_by_nickname("vd_ins")?;
    let base = layout.index_map[vd_ins];
    let slab = &marginals.as_slice()[base..base + 4];
    let argmax = (0..4)
        .max_by(|&a, &b| slab[a].partial_cmp(&slab[b]).unwrap())
        .unwrap();
    assert_eq!(argmax, 2);
    let mass: f64 = slab.iter().sum();
    assert!((mass - 1.0).abs() < 1e-9);
    Ok(())
}

#[test]
fn parallel_and_serial_inference_agree() -> Result<()> {
    let (parms, marginals) = vdj_model();
    let reads = [
        READ,
        "ACGTACGGGGGGGCCCCAA",
        "ACGTACGATGGGGGTCCCCAA",
        "ACGTACGGTTGGGGGCCCCAA",
        "ACGTACGGATGGGGGACCCCAA",
        "ACGTACGGGGGGGACCCCAA",
    ];
    let records: Vec<SequenceRecord> = reads
        .iter()
        .enumerate()
        .map(|(i, read)| align_read(i as i32, read))
        .collect::<Result<_>>()?;

    let run = |n_threads: usize| -> Result<Vec<f64>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build()?;
        let mut parms = parms.clone();
        let mut marginals = marginals.clone();
        let mut counters = CounterRegistry::new();
        pool.install(|| {
            infer(
                &mut parms,
                &mut marginals,
                &records,
                &mut counters,
                &InferenceOptions::default(),
            )
        })?;
        Ok(marginals.as_slice().to_vec())
    };

    let serial = run(1)?;
    let parallel = run(4)?;
    for (a, b) in serial.iter().zip(&parallel) {
        float_eq::assert_float_eq!(*a, *b, abs <= 1e-300, rmax <= 1e-10);
    }
    Ok(())
}

#[test]
fn generation_round_trip_recovers_realizations() -> Result<()> {
    // Two-event toy model with mutually distant templates, so the
    // generating (V, J) pair is unambiguous.
    let v_templates = [("V1", "ACGTACGTAC"), ("V2", "TGCATGCATG")];
    let j_templates = [("J1", "TTTTCC"), ("J2", "GGAAGG")];

    let mut parms = ModelParms::new();
    let v = parms
        .add_event(Event::new(EventType::GeneChoice, GeneClass::V, SeqSide::Undefined, 7, "v_choice"))
        .unwrap();
    let j = parms
        .add_event(Event::new(EventType::GeneChoice, GeneClass::J, SeqSide::Undefined, 6, "j_choice"))
        .unwrap();
    for (name, seq) in v_templates {
        parms
            .event_mut(v)
            .add_realization(name, i32::MAX, Some(nt2int(seq)?));
    }
    for (name, seq) in j_templates {
        parms
            .event_mut(j)
            .add_realization(name, i32::MAX, Some(nt2int(seq)?));
    }
    let mut marginals = Marginals::new(&parms);
    marginals.uniform_initialize(&parms);

    let generator = Generator::new(&parms, &marginals)?;
    let generated = generator.generate(10, &GenerationOptions::default().seed(0x12345))?;

    let matrix = SubstitutionMatrix::simple(5.0, -4.0);
    for sequence in &generated {
        let mut record = SequenceRecord {
            index: sequence.index as i32,
            seq: sequence.seq.clone(),
            alignments: FnvHashMap::default(),
        };
        for (class, templates, threshold) in [
            (GeneClass::V, &v_templates[..], 30.0),
            (GeneClass::J, &j_templates[..], 20.0),
        ] {
            let mut aligner = Aligner::new(matrix.clone(), 10.0, class)?;
            let library: Vec<vdjinf::io::Template> = templates
                .iter()
                .map(|(name, seq)| vdjinf::io::Template {
                    name: name.to_string(),
                    seq: seq.to_string(),
                })
                .collect();
            aligner.set_templates(&library)?;
            let opts = AlignmentOptions::default().score_threshold(threshold);
            record
                .alignments
                .insert(class, aligner.align_seq(&sequence.seq, &opts)?);
        }

        let opts = InferenceOptions::default().viterbi(true);
        let evaluation = evaluate_sequence(&parms, &marginals, &record, &opts)?;
        assert!(evaluation.likelihood > 0.0);

        let layout = MarginalLayout::new(&parms);
        for (qpos, &id) in layout.queue.iter().enumerate() {
            let generated_choice = sequence.realizations[qpos][0] as usize;
            let base = layout.index_map[id];
            let size = layout.event_sizes[id];
            let slab = &evaluation.seq_marginals[base..base + size];
            let support: Vec<usize> = (0..size).filter(|&i| slab[i] != 0.0).collect();
            assert_eq!(support, vec![generated_choice], "sequence {}", sequence.index);
        }
    }
    Ok(())
}
