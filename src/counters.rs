//! Extension hooks observing per-sequence posterior statistics.
//!
//! Plug-ins are held in an ordered registry; each worker gets its own copies
//! for the iteration and the master copies absorb them at the reduction
//! point. Plug-ins may read shared model state but never mutate it.

use std::any::Any;
use std::collections::BTreeMap;

use crate::error::{Result, VdjError};
use crate::graph::ModelParms;
use crate::marginals::Marginals;

pub trait Counter: Send + Sync {
    /// Called once before the first iteration, e.g. to open output streams.
    fn initialize(&mut self, parms: &ModelParms, marginals: &Marginals) -> Result<()>;

    /// Observe one read's likelihood and its normalised per-sequence
    /// marginal accumulator.
    fn count_sequence(
        &mut self,
        seq_likelihood: f64,
        seq_marginals: &[f64],
        parms: &ModelParms,
    ) -> Result<()>;

    /// Emit per-sequence output; called under the shared dump guard.
    fn dump_sequence_data(&mut self, seq_index: i32, iteration: usize) -> Result<()>;

    /// Emit end-of-iteration output on the master copy.
    fn dump_data_summary(&mut self, iteration: usize) -> Result<()>;

    /// Absorb a worker copy into this master copy.
    fn add_to_counter(&mut self, other: &dyn Counter) -> Result<()>;

    fn box_clone(&self) -> Box<dyn Counter>;

    fn as_any(&self) -> &dyn Any;

    /// Counters that only observe the final iteration skip worker copies on
    /// earlier ones.
    fn is_last_iter_only(&self) -> bool {
        false
    }
}

/// Ordered plug-in registry; iteration order is the key order.
#[derive(Default)]
pub struct CounterRegistry {
    counters: BTreeMap<usize, Box<dyn Counter>>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        CounterRegistry::default()
    }

    pub fn register(&mut self, priority: usize, counter: Box<dyn Counter>) -> Result<()> {
        if self.counters.contains_key(&priority) {
            return Err(VdjError::Config(format!(
                "a counter is already registered at position {priority}"
            )));
        }
        self.counters.insert(priority, counter);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn initialize_all(&mut self, parms: &ModelParms, marginals: &Marginals) -> Result<()> {
        for counter in self.counters.values_mut() {
            counter.initialize(parms, marginals)?;
        }
        Ok(())
    }

    /// Worker copies for one iteration; last-iter-only counters are copied
    /// only on the final one.
    pub fn copy_for_iteration(&self, last_iteration: bool) -> CounterRegistry {
        let mut copy = CounterRegistry::new();
        for (&priority, counter) in &self.counters {
            if counter.is_last_iter_only() && !last_iteration {
                continue;
            }
            copy.counters.insert(priority, counter.box_clone());
        }
        copy
    }

    pub fn count_sequence(
        &mut self,
        seq_likelihood: f64,
        seq_marginals: &[f64],
        parms: &ModelParms,
    ) -> Result<()> {
        for counter in self.counters.values_mut() {
            counter.count_sequence(seq_likelihood, seq_marginals, parms)?;
        }
        Ok(())
    }

    pub fn dump_sequence_data(&mut self, seq_index: i32, iteration: usize) -> Result<()> {
        for counter in self.counters.values_mut() {
            counter.dump_sequence_data(seq_index, iteration)?;
        }
        Ok(())
    }

    pub fn dump_summaries(&mut self, iteration: usize) -> Result<()> {
        for counter in self.counters.values_mut() {
            counter.dump_data_summary(iteration)?;
        }
        Ok(())
    }

    /// Fold worker copies back into the masters.
    pub fn add_from(&mut self, other: CounterRegistry) -> Result<()> {
        for (priority, counter) in other.counters {
            let master = self.counters.get_mut(&priority).ok_or_else(|| {
                VdjError::Config(format!(
                    "merging an unregistered counter at position {priority}"
                ))
            })?;
            master.add_to_counter(counter.as_ref())?;
        }
        Ok(())
    }
}

/// Reference plug-in: tracks the corpus log-likelihood of the sequences it
/// observes and reports it per iteration through the log facade.
#[derive(Debug, Clone, Default)]
pub struct LikelihoodCounter {
    sum_log_likelihood: f64,
    n_sequences: u64,
    n_underflow: u64,
}

impl LikelihoodCounter {
    pub fn new() -> Self {
        LikelihoodCounter::default()
    }

    pub fn mean_log_likelihood(&self) -> f64 {
        if self.n_sequences > 0 {
            self.sum_log_likelihood / self.n_sequences as f64
        } else {
            f64::NEG_INFINITY
        }
    }

    pub fn n_sequences(&self) -> u64 {
        self.n_sequences
    }
}

impl Counter for LikelihoodCounter {
    fn initialize(&mut self, _parms: &ModelParms, _marginals: &Marginals) -> Result<()> {
        self.sum_log_likelihood = 0.0;
        self.n_sequences = 0;
        self.n_underflow = 0;
        Ok(())
    }

    fn count_sequence(
        &mut self,
        seq_likelihood: f64,
        _seq_marginals: &[f64],
        _parms: &ModelParms,
    ) -> Result<()> {
        if seq_likelihood > 0.0 {
            self.sum_log_likelihood += seq_likelihood.ln();
            self.n_sequences += 1;
        } else {
            self.n_underflow += 1;
        }
        Ok(())
    }

    fn dump_sequence_data(&mut self, _seq_index: i32, _iteration: usize) -> Result<()> {
        Ok(())
    }

    fn dump_data_summary(&mut self, iteration: usize) -> Result<()> {
        log::info!(
            "iteration {}: mean log-likelihood {} over {} sequences ({} underflowed)",
            iteration + 1,
            self.mean_log_likelihood(),
            self.n_sequences,
            self.n_underflow
        );
        Ok(())
    }

    fn add_to_counter(&mut self, other: &dyn Counter) -> Result<()> {
        let other = other
            .as_any()
            .downcast_ref::<LikelihoodCounter>()
            .ok_or_else(|| {
                VdjError::Config("cannot merge counters of different kinds".to_string())
            })?;
        self.sum_log_likelihood += other.sum_log_likelihood;
        self.n_sequences += other.n_sequences;
        self.n_underflow += other.n_underflow;
        Ok(())
    }

    fn box_clone(&self) -> Box<dyn Counter> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
