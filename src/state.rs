use std::cmp::max;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;

use derive_more::{Add, From, Sub};
use serde::Serialize;
use thiserror::Error;

use crate::serialize::{EventKind, Record};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct NodeID(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct FuncID(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct BlockID(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SmID(pub u32);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Add, Sub, From, Serialize,
)]
pub struct Timestamp(pub u64 /* cycles */);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("log length {0} is not a multiple of the 32-byte event record")]
    MalformedLog(usize),

    #[error("record {index}: unknown event kind {kind}")]
    UnknownEventKind { index: usize, kind: u32 },

    #[error("{kind:?} event arrived before the first run begin")]
    EventBeforeRunBegin { kind: EventKind },

    #[error(
        "node {} maps to both (func {}, {} invocations) and (func {}, {} invocations)",
        .node_id.0, .first.func_id.0, .first.invocations, .second.func_id.0, .second.invocations
    )]
    InconsistentNodeMapping {
        node_id: NodeID,
        first: NodeDesc,
        second: NodeDesc,
    },

    #[error("duplicate {kind:?} event (node {}, block {})", .node_id.0, .block_id.0)]
    DuplicateEvent {
        kind: EventKind,
        node_id: NodeID,
        block_id: BlockID,
    },

    #[error(
        "block start collides with an open block (SM {}, node {}, block {}, invocation {})",
        .sm_id.0, .key.node_id.0, .key.block_id.0, .key.invocations
    )]
    UnexpectedBlockStart { sm_id: SmID, key: BlockKey },

    #[error(
        "block event without a prior block start (SM {}, node {}, block {}, invocation {})",
        .sm_id.0, .key.node_id.0, .key.block_id.0, .key.invocations
    )]
    OrphanBlockEvent { sm_id: SmID, key: BlockKey },

    #[error("block with no samples past its start (SM {}, block {})", .sm_id.0, .block_id.0)]
    UnterminatedBlock { sm_id: SmID, block_id: BlockID },

    #[error("node {} has end {} before start {}", .node_id.0, .end.0, .start.0)]
    NegativeDuration {
        node_id: NodeID,
        start: Timestamp,
        end: Timestamp,
    },

    #[error("block timestamps regress (SM {}, block {})", .sm_id.0, .block_id.0)]
    NonMonotonicBlock { sm_id: SmID, block_id: BlockID },

    #[error("block started before the run itself (SM {}, block {})", .sm_id.0, .block_id.0)]
    BlockBeforeRunStart { sm_id: SmID, block_id: BlockID },

    #[error("node {} started before the run itself", .node_id.0)]
    NodeBeforeRunStart { node_id: NodeID },

    #[error(
        "busy interval [{}, {}] on SM {} straddles the window of node {}",
        .start.0, .stop.0, .sm_id.0, .node_id.0
    )]
    UnattributableInterval {
        sm_id: SmID,
        node_id: NodeID,
        start: Timestamp,
        stop: Timestamp,
    },

    #[error("rendering failed: {0}")]
    Render(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// The (funcID, invocations) pair a node is bound to, fixed on first
/// observation within a step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NodeDesc {
    pub func_id: FuncID,
    pub invocations: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EventSample {
    pub sm_id: SmID,
    pub block_id: BlockID,
    pub cycle: Timestamp,
}

/// At most one start and one end report per node per step.
#[derive(Debug, Copy, Clone, Default)]
pub struct NodeEvents {
    pub start: Option<EventSample>,
    pub end: Option<EventSample>,
}

/// Identifies one thread-block execution on an SM.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockKey {
    pub invocations: u32,
    pub node_id: NodeID,
    pub block_id: BlockID,
}

/// One megakernel launch, assembled from the event stream.
#[derive(Debug)]
pub struct Step {
    pub start_timestamp: Timestamp,
    pub final_timestamp: Timestamp,
    pub node_events: BTreeMap<NodeID, NodeEvents>,
    pub node_mapping: BTreeMap<NodeID, NodeDesc>,
    pub sms: BTreeMap<SmID, BTreeMap<BlockKey, Vec<Timestamp>>>,
    pub final_cycles: BTreeMap<BlockID, Timestamp>,
    /// False until a subsequent run begin proves the step was fully logged.
    /// The trailing step of a log may be truncated by rotation or a crash.
    pub complete: bool,
}

impl Step {
    fn new(start_timestamp: Timestamp) -> Self {
        Step {
            start_timestamp,
            final_timestamp: Timestamp(0),
            node_events: BTreeMap::new(),
            node_mapping: BTreeMap::new(),
            sms: BTreeMap::new(),
            final_cycles: BTreeMap::new(),
            complete: false,
        }
    }

    fn process_record(&mut self, record: &Record) -> Result<(), TraceError> {
        match record.kind {
            EventKind::RunBegin => unreachable!("handled by State"),
            EventKind::NodeStart | EventKind::NodeEnd => {
                let desc = NodeDesc {
                    func_id: record.func_id,
                    invocations: record.num_invocations,
                };
                match self.node_mapping.entry(record.node_id) {
                    Entry::Vacant(entry) => {
                        entry.insert(desc);
                    }
                    Entry::Occupied(entry) => {
                        if *entry.get() != desc {
                            return Err(TraceError::InconsistentNodeMapping {
                                node_id: record.node_id,
                                first: *entry.get(),
                                second: desc,
                            });
                        }
                    }
                }
                let events = self.node_events.entry(record.node_id).or_default();
                let slot = match record.kind {
                    EventKind::NodeStart => &mut events.start,
                    _ => &mut events.end,
                };
                if slot.is_some() {
                    return Err(TraceError::DuplicateEvent {
                        kind: record.kind,
                        node_id: record.node_id,
                        block_id: record.block_id,
                    });
                }
                *slot = Some(EventSample {
                    sm_id: record.sm_id,
                    block_id: record.block_id,
                    cycle: record.cycle_count,
                });
            }
            EventKind::BlockStart => {
                let key = BlockKey {
                    invocations: record.num_invocations,
                    node_id: record.node_id,
                    block_id: record.block_id,
                };
                match self.sms.entry(record.sm_id).or_default().entry(key) {
                    Entry::Occupied(_) => {
                        return Err(TraceError::UnexpectedBlockStart {
                            sm_id: record.sm_id,
                            key,
                        });
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(vec![record.cycle_count]);
                    }
                }
            }
            EventKind::BlockProgress => {
                let key = BlockKey {
                    invocations: record.num_invocations,
                    node_id: record.node_id,
                    block_id: record.block_id,
                };
                let samples = self
                    .sms
                    .get_mut(&record.sm_id)
                    .and_then(|blocks| blocks.get_mut(&key))
                    .ok_or(TraceError::OrphanBlockEvent {
                        sm_id: record.sm_id,
                        key,
                    })?;
                samples.push(record.cycle_count);
            }
            EventKind::BlockExit => {
                match self.final_cycles.entry(record.block_id) {
                    Entry::Occupied(_) => {
                        return Err(TraceError::DuplicateEvent {
                            kind: record.kind,
                            node_id: record.node_id,
                            block_id: record.block_id,
                        });
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(record.cycle_count);
                    }
                }
                self.final_timestamp = max(self.final_timestamp, record.cycle_count);
            }
        }
        Ok(())
    }
}

/// The ordered collection of steps assembled from one device log.
#[derive(Debug, Default)]
pub struct State {
    pub steps: Vec<Step>,
}

impl State {
    pub fn process_records(&mut self, records: &[Record]) -> Result<(), TraceError> {
        for record in records {
            self.process_record(record)?;
        }
        Ok(())
    }

    fn process_record(&mut self, record: &Record) -> Result<(), TraceError> {
        if record.kind == EventKind::RunBegin {
            // The new launch closes out the previous step.
            if let Some(previous) = self.steps.last_mut() {
                previous.complete = true;
            }
            self.steps.push(Step::new(record.cycle_count));
            return Ok(());
        }
        let step = self
            .steps
            .last_mut()
            .ok_or(TraceError::EventBeforeRunBegin { kind: record.kind })?;
        step.process_record(record)
    }

    /// Rebase the run bounds to run-relative time. Node and block cycle
    /// counts stay absolute; the analyses calibrate them against
    /// `start_timestamp` as they go.
    pub fn calibrate(&mut self) {
        for step in &mut self.steps {
            // A truncated trailing step may have logged no block exits at
            // all, leaving final_timestamp below the run start.
            step.final_timestamp =
                Timestamp(step.final_timestamp.0.saturating_sub(step.start_timestamp.0));
            for cycle in step.final_cycles.values_mut() {
                *cycle = Timestamp(cycle.0.saturating_sub(step.start_timestamp.0));
            }
        }
    }

    pub fn num_complete(&self) -> usize {
        self.steps.iter().filter(|step| step.complete).count()
    }
}
