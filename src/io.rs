//! Readers and writers for read corpora and germline template libraries.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use bio::io::fasta;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VdjError};

/// A read with its stable corpus index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedSeq {
    #[serde(rename = "seq_index")]
    pub index: i32,
    #[serde(rename = "sequence")]
    pub seq: String,
}

/// A germline gene template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub name: String,
    pub seq: String,
}

/// Read a fasta file of target sequences, indexing records in file order.
pub fn read_fasta<P: AsRef<Path>>(path: P) -> Result<Vec<IndexedSeq>> {
    let reader = fasta::Reader::from_file(path.as_ref())
        .map_err(|e| VdjError::InputFormat(format!("cannot open fasta: {e}")))?;
    let mut sequences = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record =
            record.map_err(|e| VdjError::InputFormat(format!("bad fasta record: {e}")))?;
        let seq = String::from_utf8_lossy(record.seq()).to_uppercase();
        sequences.push(IndexedSeq {
            index: index as i32,
            seq,
        });
    }
    Ok(sequences)
}

/// Read germline templates from fasta. IMGT alignment gaps ('.') are
/// stripped from the sequences.
pub fn read_genomic_fasta<P: AsRef<Path>>(path: P) -> Result<Vec<Template>> {
    let reader = fasta::Reader::from_file(path.as_ref())
        .map_err(|e| VdjError::InputFormat(format!("cannot open fasta: {e}")))?;
    let mut templates = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| VdjError::InputFormat(format!("bad fasta record: {e}")))?;
        let seq: String = String::from_utf8_lossy(record.seq())
            .to_uppercase()
            .chars()
            .filter(|&c| c != '.')
            .collect();
        templates.push(Template {
            name: record.id().to_string(),
            seq,
        });
    }
    Ok(templates)
}

/// Read one sequence per line, indexing in file order.
pub fn read_txt<P: AsRef<Path>>(path: P) -> Result<Vec<IndexedSeq>> {
    let reader = BufReader::new(File::open(path)?);
    let mut sequences = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        sequences.push(IndexedSeq {
            index: sequences.len() as i32,
            seq: trimmed.to_uppercase(),
        });
    }
    Ok(sequences)
}

/// Write the `seq_index;sequence` table.
pub fn write_indexed_csv<P: AsRef<Path>>(path: P, sequences: &[IndexedSeq]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().delimiter(b';').from_path(path)?;
    for seq in sequences {
        writer.serialize(seq)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read the `seq_index;sequence` table back, upper-casing sequences.
pub fn read_indexed_csv<P: AsRef<Path>>(path: P) -> Result<Vec<IndexedSeq>> {
    let mut reader = csv::ReaderBuilder::new().delimiter(b';').from_path(path)?;
    let mut sequences = Vec::new();
    for row in reader.deserialize::<IndexedSeq>() {
        let mut seq =
            row.map_err(|e| VdjError::InputFormat(format!("bad indexed sequence row: {e}")))?;
        seq.seq = seq.seq.to_uppercase();
        sequences.push(seq);
    }
    Ok(sequences)
}

/// Randomly subsample `sample_size` indexed sequences. The seed is logged so
/// runs can be reproduced.
pub fn sample_indexed_seq(
    sequences: &[IndexedSeq],
    sample_size: usize,
    seed: Option<u64>,
) -> Result<Vec<IndexedSeq>> {
    if sample_size > sequences.len() {
        return Err(VdjError::Config(format!(
            "trying to sample {sample_size} sequences from a pool of {}",
            sequences.len()
        )));
    }
    let seed = seed.unwrap_or_else(rand::random);
    log::info!("subsampling {sample_size} sequences with seed {seed}");
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut pool: Vec<IndexedSeq> = sequences.to_vec();
    pool.shuffle(&mut rng);
    pool.truncate(sample_size);
    Ok(pool)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn indexed_csv_roundtrip() {
        use assert_fs::TempDir;

        let sequences = vec![
            IndexedSeq {
                index: 0,
                seq: "ACGTACGT".to_string(),
            },
            IndexedSeq {
                index: 1,
                seq: "TTGGAACC".to_string(),
            },
        ];
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("indexed_seqs.csv");
        write_indexed_csv(&path, &sequences).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("seq_index;sequence"));

        let back = read_indexed_csv(&path).unwrap();
        assert_eq!(back, sequences);
    }

    #[test]
    fn genomic_fasta_strips_imgt_gaps() {
        use assert_fs::TempDir;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("genomics.fasta");
        std::fs::write(&path, ">TRBV1*01\nacg...tACGT\n>TRBV2*01\nGGG\nTTT\n").unwrap();
        let templates = read_genomic_fasta(&path).unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].name, "TRBV1*01");
        assert_eq!(templates[0].seq, "ACGTACGT");
        assert_eq!(templates[1].seq, "GGGTTT");
    }

    #[test]
    fn sampling_more_than_pool_fails() {
        let sequences = vec![IndexedSeq {
            index: 0,
            seq: "ACGT".to_string(),
        }];
        assert!(sample_indexed_seq(&sequences, 2, Some(1)).is_err());
        let sampled = sample_indexed_seq(&sequences, 1, Some(1)).unwrap();
        assert_eq!(sampled.len(), 1);
    }
}
