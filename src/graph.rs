//! The recombination-event DAG.
//!
//! Events live in an append-only arena and are referenced by dense integer
//! ids; adjacency is two id vectors per node. The topological model queue is
//! recomputed on demand from ids and priorities, so nothing dangles when an
//! event is renamed or its fixed flag changes.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use fnv::FnvHashMap;

use crate::error::{Result, VdjError};
use crate::error_model::ErrorModel;
use crate::nucleotide::{int2nt, nt2int, IntSeq};

/// Biological role of a template or event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeneClass {
    V,
    D,
    J,
    VD,
    VJ,
    DJ,
    Undefined,
}

impl GeneClass {
    /// Whether this (possibly composite) class covers a single gene class,
    /// e.g. `VD` covers both `V` and `D`. Used by the error models'
    /// learn-on/apply-on subsets.
    pub fn contains(self, single: GeneClass) -> bool {
        match self {
            GeneClass::VD => matches!(single, GeneClass::V | GeneClass::D),
            GeneClass::VJ => matches!(single, GeneClass::V | GeneClass::J),
            GeneClass::DJ => matches!(single, GeneClass::D | GeneClass::J),
            other => other == single,
        }
    }
}

impl fmt::Display for GeneClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            GeneClass::V => "V_gene",
            GeneClass::D => "D_gene",
            GeneClass::J => "J_gene",
            GeneClass::VD => "VD_genes",
            GeneClass::VJ => "VJ_genes",
            GeneClass::DJ => "DJ_gene",
            GeneClass::Undefined => "Undefined_gene",
        };
        f.write_str(token)
    }
}

impl FromStr for GeneClass {
    type Err = VdjError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "V_gene" => Ok(GeneClass::V),
            "D_gene" => Ok(GeneClass::D),
            "J_gene" => Ok(GeneClass::J),
            "VD_genes" => Ok(GeneClass::VD),
            "VJ_genes" => Ok(GeneClass::VJ),
            "DJ_gene" => Ok(GeneClass::DJ),
            "Undefined_gene" => Ok(GeneClass::Undefined),
            other => Err(VdjError::InputFormat(format!("unknown gene class \"{other}\""))),
        }
    }
}

/// Which end of a gene segment an event acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeqSide {
    FivePrime,
    ThreePrime,
    Undefined,
}

impl fmt::Display for SeqSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            SeqSide::FivePrime => "Five_prime",
            SeqSide::ThreePrime => "Three_prime",
            SeqSide::Undefined => "Undefined_side",
        };
        f.write_str(token)
    }
}

impl FromStr for SeqSide {
    type Err = VdjError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Five_prime" => Ok(SeqSide::FivePrime),
            "Three_prime" => Ok(SeqSide::ThreePrime),
            "Undefined_side" => Ok(SeqSide::Undefined),
            other => Err(VdjError::InputFormat(format!("unknown sequence side \"{other}\""))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    GeneChoice,
    Deletion,
    Insertion,
    DinucMarkov,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            EventType::GeneChoice => "GeneChoice",
            EventType::Deletion => "Deletion",
            EventType::Insertion => "Insertion",
            EventType::DinucMarkov => "DinucMarkov",
        };
        f.write_str(token)
    }
}

impl FromStr for EventType {
    type Err = VdjError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GeneChoice" => Ok(EventType::GeneChoice),
            "Deletion" => Ok(EventType::Deletion),
            "Insertion" => Ok(EventType::Insertion),
            "DinucMarkov" => Ok(EventType::DinucMarkov),
            other => Err(VdjError::InputFormat(format!("unknown event type \"{other}\""))),
        }
    }
}

/// One concrete outcome of an event.
#[derive(Debug, Clone, PartialEq)]
pub struct Realization {
    pub name: String,
    /// Trimmed length, insertion count or nucleotide code. Negative deletion
    /// values denote palindromic P nucleotides.
    pub value: i32,
    /// Template sequence for GeneChoice realisations.
    pub seq: Option<IntSeq>,
    /// Dense index in `[0, n_realizations)`.
    pub index: usize,
}

pub type EventId = usize;

#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub class: GeneClass,
    pub side: SeqSide,
    pub priority: i32,
    pub nickname: String,
    pub fixed: bool,
    realizations: Vec<Realization>,
    id: EventId,
}

impl Event {
    pub fn new(
        event_type: EventType,
        class: GeneClass,
        side: SeqSide,
        priority: i32,
        nickname: impl Into<String>,
    ) -> Self {
        let mut event = Event {
            event_type,
            class,
            side,
            priority,
            nickname: nickname.into(),
            fixed: false,
            realizations: Vec::new(),
            id: usize::MAX,
        };
        if event_type == EventType::DinucMarkov {
            // The four transition targets; the marginal slab is 4x4.
            for (idx, nt) in ["A", "C", "G", "T"].iter().enumerate() {
                event.realizations.push(Realization {
                    name: (*nt).to_string(),
                    value: idx as i32,
                    seq: None,
                    index: idx,
                });
            }
        }
        event
    }

    /// Unique name derived from type, class and side.
    pub fn name(&self) -> String {
        format!("{}_{}_{}", self.event_type, self.class, self.side)
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn realizations(&self) -> &[Realization] {
        &self.realizations
    }

    pub fn n_realizations(&self) -> usize {
        self.realizations.len()
    }

    /// Append a realisation; indices stay a contiguous range from 0.
    pub fn add_realization(&mut self, name: impl Into<String>, value: i32, seq: Option<IntSeq>) {
        let index = self.realizations.len();
        self.realizations.push(Realization {
            name: name.into(),
            value,
            seq,
            index,
        });
    }

    pub fn realization_by_name(&self, name: &str) -> Option<&Realization> {
        self.realizations.iter().find(|r| r.name == name)
    }

    pub fn realization_by_value(&self, value: i32) -> Option<&Realization> {
        self.realizations.iter().find(|r| r.value == value)
    }

    /// Size of the event's own dimension in the marginal tensor. The
    /// dinucleotide Markov event stores a full transition matrix, so its
    /// dimension is squared.
    pub fn marginal_dim(&self) -> usize {
        match self.event_type {
            EventType::DinucMarkov => self.realizations.len() * self.realizations.len(),
            _ => self.realizations.len(),
        }
    }

    /// Length of a contiguous slice that must sum to one after
    /// normalisation. For DinucMarkov this is one row of the transition
    /// matrix, not the whole slab.
    pub fn norm_block(&self) -> usize {
        self.realizations.len()
    }

    fn write_block<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "#{};{};{};{};{}",
            self.event_type, self.class, self.side, self.priority, self.nickname
        )?;
        for r in &self.realizations {
            match &r.seq {
                Some(seq) => writeln!(w, "%{};{};{}", r.name, int2nt(seq), r.index)?,
                None => writeln!(w, "%{};{};{}", r.name, r.value, r.index)?,
            }
        }
        Ok(())
    }
}

/// Priority-descending order with lexicographic names breaking ties.
fn event_order(a: &Event, b: &Event) -> std::cmp::Ordering {
    b.priority.cmp(&a.priority).then_with(|| a.name().cmp(&b.name()))
}

/// The event DAG plus the attached error model. Structure is frozen for the
/// duration of one inference run; marginals may change, edges may not.
#[derive(Debug, Clone, Default)]
pub struct ModelParms {
    events: Vec<Event>,
    parents: Vec<Vec<EventId>>,
    children: Vec<Vec<EventId>>,
    name_index: FnvHashMap<String, EventId>,
    pub error_model: ErrorModel,
}

impl ModelParms {
    pub fn new() -> Self {
        ModelParms::default()
    }

    pub fn add_event(&mut self, mut event: Event) -> Result<EventId> {
        let name = event.name();
        if self.name_index.contains_key(&name) {
            return Err(VdjError::Config(format!("duplicate event \"{name}\"")));
        }
        if !event.nickname.is_empty()
            && self.events.iter().any(|e| e.nickname == event.nickname)
        {
            return Err(VdjError::Config(format!(
                "duplicate event nickname \"{}\"",
                event.nickname
            )));
        }
        let id = self.events.len();
        event.id = id;
        self.name_index.insert(name, id);
        self.events.push(event);
        self.parents.push(Vec::new());
        self.children.push(Vec::new());
        Ok(id)
    }

    pub fn n_events(&self) -> usize {
        self.events.len()
    }

    pub fn event(&self, id: EventId) -> &Event {
        &self.events[id]
    }

    pub fn event_mut(&mut self, id: EventId) -> &mut Event {
        &mut self.events[id]
    }

    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn event_by_name(&self, name: &str) -> Result<EventId> {
        self.name_index
            .get(name)
            .copied()
            .ok_or_else(|| VdjError::Config(format!("unknown event \"{name}\"")))
    }

    pub fn event_by_nickname(&self, nickname: &str) -> Result<EventId> {
        self.events
            .iter()
            .position(|e| e.nickname == nickname)
            .ok_or_else(|| VdjError::Config(format!("unknown event nickname \"{nickname}\"")))
    }

    /// Find an event by its (type, class, side) signature, if present.
    pub fn find_event(
        &self,
        event_type: EventType,
        class: GeneClass,
        side: SeqSide,
    ) -> Option<EventId> {
        self.events
            .iter()
            .position(|e| e.event_type == event_type && e.class == class && e.side == side)
    }

    pub fn parents(&self, id: EventId) -> &[EventId] {
        &self.parents[id]
    }

    pub fn children(&self, id: EventId) -> &[EventId] {
        &self.children[id]
    }

    /// All events above `id` in the genealogy, any degree of linkage.
    pub fn ancestors(&self, id: EventId) -> Vec<EventId> {
        let mut seen = vec![false; self.events.len()];
        let mut queue: Vec<EventId> = self.parents[id].clone();
        let mut out = Vec::new();
        while let Some(next) = queue.pop() {
            if seen[next] {
                continue;
            }
            seen[next] = true;
            out.push(next);
            queue.extend_from_slice(&self.parents[next]);
        }
        out
    }

    pub fn has_edge(&self, parent: EventId, child: EventId) -> bool {
        self.children[parent].contains(&child)
    }

    /// Add a directed edge, rejecting self-loops, duplicates and anything
    /// that would close a cycle. The graph is untouched on failure.
    pub fn add_edge(&mut self, parent: EventId, child: EventId) -> Result<()> {
        if parent >= self.events.len() || child >= self.events.len() {
            return Err(VdjError::Config("edge references unknown event".to_string()));
        }
        if parent == child {
            return Err(VdjError::Config(format!(
                "self-loop on event \"{}\"",
                self.events[parent].name()
            )));
        }
        if self.has_edge(parent, child) {
            return Err(VdjError::Config(format!(
                "edge \"{}\" -> \"{}\" already exists",
                self.events[parent].name(),
                self.events[child].name()
            )));
        }
        if self.ancestors(parent).contains(&child) {
            return Err(VdjError::Config(format!(
                "\"{}\" is an ancestor of \"{}\", adding the edge would create a cycle",
                self.events[child].name(),
                self.events[parent].name()
            )));
        }
        self.children[parent].push(child);
        self.parents[child].push(parent);
        Ok(())
    }

    pub fn remove_edge(&mut self, parent: EventId, child: EventId) -> Result<()> {
        if !self.has_edge(parent, child) {
            return Err(VdjError::Config(format!(
                "edge \"{}\" -> \"{}\" does not exist",
                self.events[parent].name(),
                self.events[child].name()
            )));
        }
        self.children[parent].retain(|&c| c != child);
        self.parents[child].retain(|&p| p != parent);
        Ok(())
    }

    /// Reverse an existing edge between two events, whichever direction it
    /// currently has.
    pub fn invert_edge(&mut self, a: EventId, b: EventId) -> Result<()> {
        if self.has_edge(a, b) {
            self.remove_edge(a, b)?;
            self.add_edge(b, a)
        } else if self.has_edge(b, a) {
            self.remove_edge(b, a)?;
            self.add_edge(a, b)
        } else {
            Err(VdjError::Config(format!(
                "no edge between \"{}\" and \"{}\" in any direction",
                self.events[a].name(),
                self.events[b].name()
            )))
        }
    }

    pub fn set_fixed_all_events(&mut self, fixed: bool) {
        for event in &mut self.events {
            event.fixed = fixed;
        }
    }

    /// Events with no parents, sorted by priority (highest first).
    pub fn roots(&self) -> Vec<EventId> {
        let mut roots: Vec<EventId> = (0..self.events.len())
            .filter(|&id| self.parents[id].is_empty())
            .collect();
        roots.sort_by(|&a, &b| event_order(&self.events[a], &self.events[b]));
        roots
    }

    /// The canonical topological order: among events whose parents have all
    /// been emitted, the highest priority goes first, ties broken
    /// lexicographically by name. Deterministic given the graph.
    pub fn model_queue(&self) -> Vec<EventId> {
        let mut remaining: Vec<EventId> = (0..self.events.len()).collect();
        remaining.sort_by(|&a, &b| event_order(&self.events[a], &self.events[b]));
        let mut emitted = vec![false; self.events.len()];
        let mut queue = Vec::with_capacity(self.events.len());
        while !remaining.is_empty() {
            let pos = remaining
                .iter()
                .position(|&id| self.parents[id].iter().all(|&p| emitted[p]))
                .expect("event graph is acyclic");
            let id = remaining.remove(pos);
            emitted[id] = true;
            queue.push(id);
        }
        queue
    }

    pub fn write_model_parms<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "@Event_list")?;
        for event in &self.events {
            event.write_block(&mut w)?;
        }
        writeln!(w, "@Edges")?;
        for (id, children) in self.children.iter().enumerate() {
            for &child in children {
                writeln!(w, "%{};{}", self.events[id].name(), self.events[child].name())?;
            }
        }
        writeln!(w, "@ErrorRate")?;
        self.error_model.write_block(&mut w)?;
        Ok(())
    }

    pub fn read_model_parms<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut lines = reader
            .lines()
            .collect::<std::io::Result<Vec<String>>>()?
            .into_iter()
            .map(|l| l.trim_end().to_string())
            .peekable();

        let mut parms = ModelParms::new();

        match lines.next().as_deref() {
            Some("@Event_list") => {}
            other => {
                return Err(VdjError::InputFormat(format!(
                    "expected @Event_list, got \"{}\"",
                    other.unwrap_or("<eof>")
                )))
            }
        }

        while matches!(lines.peek(), Some(l) if l.starts_with('#')) {
            let header = lines.next().expect("peeked");
            let mut fields = header[1..].split(';');
            let bad = || VdjError::InputFormat(format!("malformed event header \"{header}\""));
            let event_type: EventType = fields.next().ok_or_else(bad)?.parse()?;
            let class: GeneClass = fields.next().ok_or_else(bad)?.parse()?;
            let side: SeqSide = fields.next().ok_or_else(bad)?.parse()?;
            let priority: i32 = fields
                .next()
                .ok_or_else(bad)?
                .parse()
                .map_err(|_| bad())?;
            let nickname = fields.next().unwrap_or("").to_string();

            let mut event = Event::new(event_type, class, side, priority, nickname);
            if event_type == EventType::DinucMarkov {
                // Realisations are implied; skip the listed ones.
                while matches!(lines.peek(), Some(l) if l.starts_with('%')) {
                    lines.next();
                }
            } else {
                let mut parsed: Vec<Realization> = Vec::new();
                while matches!(lines.peek(), Some(l) if l.starts_with('%')) {
                    let line = lines.next().expect("peeked");
                    let mut fields = line[1..].split(';');
                    let bad =
                        || VdjError::InputFormat(format!("malformed realization \"{line}\""));
                    let name = fields.next().ok_or_else(bad)?.to_string();
                    let payload = fields.next().ok_or_else(bad)?;
                    let index: usize = fields
                        .next()
                        .ok_or_else(bad)?
                        .parse()
                        .map_err(|_| bad())?;
                    let (value, seq) = match event_type {
                        EventType::GeneChoice => (i32::MAX, Some(nt2int(payload)?)),
                        _ => (payload.parse().map_err(|_| bad())?, None),
                    };
                    parsed.push(Realization { name, value, seq, index });
                }
                parsed.sort_by_key(|r| r.index);
                for (expected, r) in parsed.iter().enumerate() {
                    if r.index != expected {
                        return Err(VdjError::InputFormat(format!(
                            "realization indices of event \"{}\" are not contiguous",
                            event.name()
                        )));
                    }
                }
                event.realizations = parsed;
            }
            parms.add_event(event)?;
        }

        match lines.next().as_deref() {
            Some("@Edges") => {}
            other => {
                return Err(VdjError::InputFormat(format!(
                    "expected @Edges, got \"{}\"",
                    other.unwrap_or("<eof>")
                )))
            }
        }
        while matches!(lines.peek(), Some(l) if l.starts_with('%')) {
            let line = lines.next().expect("peeked");
            let (parent, child) = line[1..].split_once(';').ok_or_else(|| {
                VdjError::InputFormat(format!("malformed edge line \"{line}\""))
            })?;
            let parent = parms.event_by_name(parent)?;
            let child = parms.event_by_name(child)?;
            parms.add_edge(parent, child)?;
        }

        match lines.next().as_deref() {
            Some("@ErrorRate") => {}
            other => {
                return Err(VdjError::InputFormat(format!(
                    "expected @ErrorRate, got \"{}\"",
                    other.unwrap_or("<eof>")
                )))
            }
        }
        let header = lines
            .next()
            .ok_or_else(|| VdjError::InputFormat("missing error-rate header".to_string()))?;
        parms.error_model = ErrorModel::read_block(&header, &mut lines)?;

        Ok(parms)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn three_chain() -> (ModelParms, EventId, EventId, EventId) {
        let mut parms = ModelParms::new();
        let a = parms
            .add_event(Event::new(
                EventType::GeneChoice,
                GeneClass::V,
                SeqSide::Undefined,
                7,
                "v_choice",
            ))
            .unwrap();
        let b = parms
            .add_event(Event::new(
                EventType::GeneChoice,
                GeneClass::J,
                SeqSide::Undefined,
                6,
                "j_choice",
            ))
            .unwrap();
        let c = parms
            .add_event(Event::new(
                EventType::Deletion,
                GeneClass::V,
                SeqSide::ThreePrime,
                5,
                "v_3_del",
            ))
            .unwrap();
        parms.add_edge(a, b).unwrap();
        parms.add_edge(b, c).unwrap();
        (parms, a, b, c)
    }

    #[test]
    fn cycle_rejected_and_graph_unchanged() {
        let (mut parms, a, _b, c) = three_chain();
        let before_children: Vec<_> = (0..parms.n_events()).map(|i| parms.children(i).to_vec()).collect();
        let err = parms.add_edge(c, a).unwrap_err();
        assert!(matches!(err, VdjError::Config(_)));
        let after_children: Vec<_> = (0..parms.n_events()).map(|i| parms.children(i).to_vec()).collect();
        assert_eq!(before_children, after_children);
    }

    #[test]
    fn add_then_remove_edge_is_identity() {
        let (mut parms, a, _b, c) = three_chain();
        let before: Vec<_> = (0..parms.n_events())
            .map(|i| (parms.parents(i).to_vec(), parms.children(i).to_vec()))
            .collect();
        parms.add_edge(a, c).unwrap();
        parms.remove_edge(a, c).unwrap();
        let after: Vec<_> = (0..parms.n_events())
            .map(|i| (parms.parents(i).to_vec(), parms.children(i).to_vec()))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn self_loop_rejected() {
        let (mut parms, a, _, _) = three_chain();
        assert!(parms.add_edge(a, a).is_err());
    }

    #[test]
    fn queue_is_priority_then_name_within_ready_events() {
        let mut parms = ModelParms::new();
        let v = parms
            .add_event(Event::new(EventType::GeneChoice, GeneClass::V, SeqSide::Undefined, 7, "v"))
            .unwrap();
        let j = parms
            .add_event(Event::new(EventType::GeneChoice, GeneClass::J, SeqSide::Undefined, 7, "j"))
            .unwrap();
        let d = parms
            .add_event(Event::new(EventType::GeneChoice, GeneClass::D, SeqSide::Undefined, 6, "d"))
            .unwrap();
        let del = parms
            .add_event(Event::new(EventType::Deletion, GeneClass::V, SeqSide::ThreePrime, 5, "vdel"))
            .unwrap();
        parms.add_edge(v, del).unwrap();
        parms.add_edge(j, d).unwrap();
        // Both roots have priority 7: GeneChoice_J_gene_... sorts before
        // GeneChoice_V_gene_... lexicographically.
        assert_eq!(parms.model_queue(), vec![j, v, d, del]);
    }

    #[test]
    fn invert_edge_flips_direction() {
        let (mut parms, a, b, _c) = three_chain();
        parms.invert_edge(a, b).unwrap();
        assert!(parms.has_edge(b, a));
        assert!(!parms.has_edge(a, b));
    }

    #[test]
    fn duplicate_event_name_rejected() {
        let mut parms = ModelParms::new();
        parms
            .add_event(Event::new(EventType::GeneChoice, GeneClass::V, SeqSide::Undefined, 7, "v1"))
            .unwrap();
        let err = parms
            .add_event(Event::new(EventType::GeneChoice, GeneClass::V, SeqSide::Undefined, 3, "v2"))
            .unwrap_err();
        assert!(matches!(err, VdjError::Config(_)));
    }

    #[test]
    fn parms_file_roundtrip() {
        use assert_fs::TempDir;
        use pretty_assertions::assert_eq;

        let (mut parms, _a, _b, _c) = three_chain();
        parms.event_mut(0).add_realization("TRBV1*01", i32::MAX, Some(nt2int("ACGTACGT").unwrap()));
        parms.event_mut(1).add_realization("TRBJ1*01", i32::MAX, Some(nt2int("TTGG").unwrap()));
        for del in -2..=3 {
            parms.event_mut(2).add_realization(del.to_string(), del, None);
        }
        parms
            .add_event(Event::new(
                EventType::DinucMarkov,
                GeneClass::VJ,
                SeqSide::Undefined,
                2,
                "vj_dinucl",
            ))
            .unwrap();
        parms.error_model = crate::error_model::ErrorModel::HypermutationGlobal(
            crate::error_model::HypermutationGlobalRate::new(
                3,
                GeneClass::VJ,
                GeneClass::V,
                0.002,
                (0..12).map(|i| 0.5 + i as f64 / 8.0).collect(),
            ),
        );

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model_parms.txt");
        parms.write_model_parms(&path).unwrap();
        let back = ModelParms::read_model_parms(&path).unwrap();

        let mut original_block = Vec::new();
        parms.error_model.write_block(&mut original_block).unwrap();
        let mut read_block = Vec::new();
        back.error_model.write_block(&mut read_block).unwrap();
        assert_eq!(original_block, read_block);

        assert_eq!(back.n_events(), parms.n_events());
        for (orig, read) in parms.events().zip(back.events()) {
            assert_eq!(orig.name(), read.name());
            assert_eq!(orig.nickname, read.nickname);
            assert_eq!(orig.priority, read.priority);
            assert_eq!(orig.realizations(), read.realizations());
        }
        for id in 0..parms.n_events() {
            assert_eq!(parms.children(id), back.children(id));
            assert_eq!(parms.parents(id), back.parents(id));
        }
    }
}
