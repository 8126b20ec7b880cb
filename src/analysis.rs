use std::cmp::{max, min};
use std::collections::BTreeMap;

use log::warn;
use serde::Serialize;

use crate::state::{BlockID, FuncID, NodeID, SmID, Step, Timestamp, TraceError};

/// Timing and utilization metrics for one node in one step. All timestamps
/// are run-relative.
#[derive(Debug, Clone, Serialize)]
pub struct NodeMetrics {
    #[serde(rename = "nodeID")]
    pub node_id: NodeID,
    #[serde(rename = "funcID")]
    pub func_id: FuncID,
    pub invocations: u32,
    pub start: Timestamp,
    pub end: Timestamp,
    #[serde(rename = "duration (cycles)")]
    pub duration: Timestamp,
    #[serde(rename = "percentage (%)")]
    pub percentage: f64,
    #[serde(rename = "SM utilization")]
    pub sm_utilization: f64,
}

/// An inclusive span of busy time on one SM, run-relative.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Interval {
    pub start: Timestamp,
    pub stop: Timestamp,
}

impl Interval {
    pub fn length(&self) -> u64 {
        self.stop.0 - self.start.0
    }
}

/// Per-SM view of one step: the merged busy coverage plus the chronological
/// block-interval indexes the renderer draws from.
#[derive(Debug, Default)]
pub struct SmTimeline {
    /// Sorted, pairwise-disjoint union of all block intervals.
    pub coverage: Vec<Interval>,
    pub by_block: BTreeMap<BlockID, Vec<(Interval, NodeID)>>,
    pub by_node: BTreeMap<NodeID, Vec<(Interval, BlockID)>>,
}

#[derive(Debug)]
pub struct StepAnalysis {
    pub nodes: Vec<NodeMetrics>,
    pub sms: BTreeMap<SmID, SmTimeline>,
}

/// Insert a block interval into a sorted disjoint list, keeping the list the
/// minimal representation of the union. An insertion can bridge previously
/// separate intervals, so after extending a touched interval we keep
/// absorbing successors the extension now reaches.
fn merge_insert(intervals: &mut Vec<Interval>, new: Interval) {
    let mut p = 0;
    while p < intervals.len() {
        if new.start > intervals[p].stop {
            p += 1;
            continue;
        }
        if new.stop < intervals[p].start {
            intervals.insert(p, new);
            return;
        }
        intervals[p].start = min(intervals[p].start, new.start);
        intervals[p].stop = max(intervals[p].stop, new.stop);
        while p + 1 < intervals.len() && intervals[p + 1].start <= intervals[p].stop {
            intervals[p].stop = max(intervals[p].stop, intervals[p + 1].stop);
            intervals.remove(p + 1);
        }
        return;
    }
    intervals.push(new);
}

fn node_windows(step: &Step) -> Result<Vec<NodeMetrics>, TraceError> {
    let mut nodes = Vec::new();
    for (&node_id, events) in &step.node_events {
        let raw_start = match events.start {
            Some(sample) => sample.cycle,
            // The root node never reports its own start; it spans from the
            // run begin.
            None if node_id == NodeID(0) => step.start_timestamp,
            None => {
                warn!("node {} has no start event, skipping", node_id.0);
                continue;
            }
        };
        let Some(end_sample) = events.end else {
            warn!("node {} has no end event, skipping", node_id.0);
            continue;
        };
        let raw_end = end_sample.cycle;
        if raw_start < step.start_timestamp {
            return Err(TraceError::NodeBeforeRunStart { node_id });
        }
        let start = raw_start - step.start_timestamp;
        if raw_end < raw_start {
            return Err(TraceError::NegativeDuration {
                node_id,
                start,
                end: Timestamp(raw_end.0.saturating_sub(step.start_timestamp.0)),
            });
        }
        let end = raw_end - step.start_timestamp;
        let desc = step.node_mapping[&node_id];
        nodes.push(NodeMetrics {
            node_id,
            func_id: desc.func_id,
            invocations: desc.invocations,
            start,
            end,
            duration: end - start,
            percentage: 0.0,
            sm_utilization: 0.0,
        });
    }

    let total: u64 = nodes.iter().map(|node| node.duration.0).sum();
    if total > 0 {
        for node in &mut nodes {
            node.percentage = node.duration.0 as f64 / total as f64 * 100.0;
        }
    }
    Ok(nodes)
}

fn sm_timeline(step: &Step, sm_id: SmID) -> Result<SmTimeline, TraceError> {
    let mut timeline = SmTimeline::default();
    for (key, samples) in &step.sms[&sm_id] {
        let raw_start = samples[0];
        let raw_stop = samples[1..]
            .iter()
            .copied()
            .max()
            .ok_or(TraceError::UnterminatedBlock {
                sm_id,
                block_id: key.block_id,
            })?;
        if raw_stop < raw_start {
            return Err(TraceError::NonMonotonicBlock {
                sm_id,
                block_id: key.block_id,
            });
        }
        if raw_start < step.start_timestamp {
            return Err(TraceError::BlockBeforeRunStart {
                sm_id,
                block_id: key.block_id,
            });
        }
        let interval = Interval {
            start: raw_start - step.start_timestamp,
            stop: raw_stop - step.start_timestamp,
        };
        merge_insert(&mut timeline.coverage, interval);
        timeline
            .by_block
            .entry(key.block_id)
            .or_default()
            .push((interval, key.node_id));
        timeline
            .by_node
            .entry(key.node_id)
            .or_default()
            .push((interval, key.block_id));
    }

    for (&block_id, spans) in &mut timeline.by_block {
        spans.sort_by_key(|(interval, _)| (interval.start, interval.stop));
        // A block never overlaps itself.
        for pair in spans.windows(2) {
            if pair[1].0.start <= pair[0].0.stop {
                return Err(TraceError::NonMonotonicBlock { sm_id, block_id });
            }
        }
    }
    for spans in timeline.by_node.values_mut() {
        spans.sort_by_key(|(interval, _)| (interval.start, interval.stop));
    }
    Ok(timeline)
}

/// Attribute one SM's merged coverage to the node windows and accumulate the
/// per-node utilization sample. Both sides are walked in start order with
/// monotone cursors; an interval not fully inside a window is a boundary bug.
fn attribute_coverage(
    sm_id: SmID,
    coverage: &[Interval],
    nodes: &[NodeMetrics],
    order: &[usize],
    samples: &mut [f64],
) -> Result<(), TraceError> {
    let mut p = 0;
    for &i in order {
        let node = &nodes[i];
        let mut occupied = 0u64;
        while p < coverage.len() {
            let interval = coverage[p];
            if node.end < interval.start {
                break;
            }
            if node.start <= interval.start && interval.stop <= node.end {
                occupied += interval.length();
                p += 1;
            } else {
                return Err(TraceError::UnattributableInterval {
                    sm_id,
                    node_id: node.node_id,
                    start: interval.start,
                    stop: interval.stop,
                });
            }
        }
        if node.duration.0 > 0 {
            samples[i] += occupied as f64 / node.duration.0 as f64;
        }
    }
    Ok(())
}

/// Analyze one assembled step: per-node metrics plus per-SM busy coverage.
/// Pure function of the step; callers should skip incomplete steps.
pub fn analyze_step(step: &Step) -> Result<StepAnalysis, TraceError> {
    let mut nodes = node_windows(step)?;

    let mut sms = BTreeMap::new();
    for &sm_id in step.sms.keys() {
        sms.insert(sm_id, sm_timeline(step, sm_id)?);
    }

    // Window start order for the monotone attribution walk.
    let mut order: Vec<usize> = (0..nodes.len()).collect();
    order.sort_by_key(|&i| (nodes[i].start, nodes[i].end));

    let mut samples = vec![0.0; nodes.len()];
    for (&sm_id, timeline) in &sms {
        attribute_coverage(sm_id, &timeline.coverage, &nodes, &order, &mut samples)?;
    }
    // Exactly one sample per SM per node; SMs a node never ran on count as 0.
    if !sms.is_empty() {
        for (node, total) in nodes.iter_mut().zip(&samples) {
            node.sm_utilization = total / sms.len() as f64;
        }
    }

    Ok(StepAnalysis { nodes, sms })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::{EventKind, Record};
    use crate::state::State;

    fn interval(start: u64, stop: u64) -> Interval {
        Interval {
            start: Timestamp(start),
            stop: Timestamp(stop),
        }
    }

    fn event(
        kind: EventKind,
        func_id: u32,
        invocations: u32,
        node_id: u32,
        block_id: u32,
        sm_id: u32,
        cycle: u64,
    ) -> Record {
        Record {
            kind,
            func_id: FuncID(func_id),
            num_invocations: invocations,
            node_id: NodeID(node_id),
            block_id: BlockID(block_id),
            sm_id: SmID(sm_id),
            cycle_count: Timestamp(cycle),
        }
    }

    fn assemble(records: &[Record]) -> State {
        let mut state = State::default();
        state.process_records(records).unwrap();
        state.calibrate();
        state
    }

    /// One node spanning the whole run, blocks on two SMs.
    fn simple_step() -> Vec<Record> {
        vec![
            event(EventKind::RunBegin, 0, 0, 0, 0, 0, 1000),
            event(EventKind::BlockStart, 0, 1, 0, 0, 0, 1010),
            event(EventKind::BlockProgress, 0, 1, 0, 0, 0, 1060),
            event(EventKind::BlockStart, 0, 1, 0, 1, 1, 1020),
            event(EventKind::BlockProgress, 0, 1, 0, 1, 1, 1040),
            event(EventKind::NodeEnd, 7, 1, 0, 0, 0, 1100),
            event(EventKind::BlockExit, 0, 0, 0, 0, 0, 1100),
            event(EventKind::BlockExit, 0, 0, 0, 1, 1, 1100),
        ]
    }

    #[test]
    fn test_merge_example() {
        let mut intervals = Vec::new();
        merge_insert(&mut intervals, interval(10, 20));
        merge_insert(&mut intervals, interval(15, 25));
        merge_insert(&mut intervals, interval(30, 40));
        assert_eq!(intervals, vec![interval(10, 25), interval(30, 40)]);
    }

    #[test]
    fn test_merge_bridges_disjoint_intervals() {
        let mut intervals = vec![interval(10, 20), interval(30, 40), interval(50, 60)];
        merge_insert(&mut intervals, interval(15, 55));
        assert_eq!(intervals, vec![interval(10, 60)]);
    }

    #[test]
    fn test_merge_insert_before_and_between() {
        let mut intervals = vec![interval(30, 40)];
        merge_insert(&mut intervals, interval(10, 20));
        merge_insert(&mut intervals, interval(50, 60));
        merge_insert(&mut intervals, interval(22, 28));
        assert_eq!(
            intervals,
            vec![
                interval(10, 20),
                interval(22, 28),
                interval(30, 40),
                interval(50, 60)
            ]
        );
    }

    #[test]
    fn test_merge_union_is_disjoint_and_sorted() {
        let raw = [
            (35, 45),
            (5, 12),
            (40, 42),
            (11, 20),
            (60, 61),
            (19, 22),
        ];
        let mut intervals = Vec::new();
        for (start, stop) in raw {
            merge_insert(&mut intervals, interval(start, stop));
        }
        for pair in intervals.windows(2) {
            assert!(pair[0].stop < pair[1].start);
        }
        // union preserved: every raw point is covered, every covered point
        // comes from some raw interval
        for t in 0..70u64 {
            let in_raw = raw.iter().any(|&(s, e)| s <= t && t <= e);
            let in_merged = intervals
                .iter()
                .any(|iv| iv.start.0 <= t && t <= iv.stop.0);
            assert_eq!(in_raw, in_merged, "cycle {}", t);
        }
    }

    #[test]
    fn test_simple_step_metrics() {
        let state = assemble(&simple_step());
        let analysis = analyze_step(&state.steps[0]).unwrap();

        assert_eq!(analysis.nodes.len(), 1);
        let node = &analysis.nodes[0];
        // root node start synthesized from the run begin
        assert_eq!(node.start, Timestamp(0));
        assert_eq!(node.end, Timestamp(100));
        assert_eq!(node.duration, Timestamp(100));
        assert_eq!(node.percentage, 100.0);

        // SM 0 busy 10..60, SM 1 busy 20..40 -> (0.5 + 0.2) / 2
        assert_eq!(
            analysis.sms[&SmID(0)].coverage,
            vec![interval(10, 60)]
        );
        assert_eq!(
            analysis.sms[&SmID(1)].coverage,
            vec![interval(20, 40)]
        );
        assert!((node.sm_utilization - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_rendering_indexes() {
        let state = assemble(&simple_step());
        let analysis = analyze_step(&state.steps[0]).unwrap();
        let timeline = &analysis.sms[&SmID(0)];
        assert_eq!(
            timeline.by_block[&BlockID(0)],
            vec![(interval(10, 60), NodeID(0))]
        );
        assert_eq!(
            timeline.by_node[&NodeID(0)],
            vec![(interval(10, 60), BlockID(0))]
        );
    }

    #[test]
    fn test_negative_duration() {
        let records = vec![
            event(EventKind::RunBegin, 0, 0, 0, 0, 0, 1000),
            event(EventKind::NodeStart, 7, 1, 1, 0, 0, 1500),
            event(EventKind::NodeEnd, 7, 1, 1, 0, 0, 1200),
            event(EventKind::NodeEnd, 0, 1, 0, 0, 0, 1600),
        ];
        let state = assemble(&records);
        let err = analyze_step(&state.steps[0]).unwrap_err();
        assert!(matches!(
            err,
            TraceError::NegativeDuration {
                node_id: NodeID(1),
                ..
            }
        ));
    }

    #[test]
    fn test_non_monotonic_block() {
        let records = vec![
            event(EventKind::RunBegin, 0, 0, 0, 0, 0, 1000),
            event(EventKind::NodeEnd, 0, 1, 0, 0, 0, 2000),
            event(EventKind::BlockStart, 0, 1, 0, 0, 0, 1500),
            event(EventKind::BlockProgress, 0, 1, 0, 0, 0, 1400),
        ];
        let state = assemble(&records);
        let err = analyze_step(&state.steps[0]).unwrap_err();
        assert!(matches!(err, TraceError::NonMonotonicBlock { .. }));
    }

    #[test]
    fn test_block_before_run_start() {
        let records = vec![
            event(EventKind::RunBegin, 0, 0, 0, 0, 0, 1000),
            event(EventKind::NodeEnd, 0, 1, 0, 0, 0, 2000),
            event(EventKind::BlockStart, 0, 1, 0, 0, 0, 900),
            event(EventKind::BlockProgress, 0, 1, 0, 0, 0, 1400),
        ];
        let state = assemble(&records);
        let err = analyze_step(&state.steps[0]).unwrap_err();
        assert!(matches!(err, TraceError::BlockBeforeRunStart { .. }));
    }

    #[test]
    fn test_unattributable_interval() {
        // Node 1 runs 100..200 but its block keeps running until 250,
        // straddling the window boundary.
        let records = vec![
            event(EventKind::RunBegin, 0, 0, 0, 0, 0, 0),
            event(EventKind::NodeEnd, 0, 1, 0, 0, 0, 90),
            event(EventKind::NodeStart, 7, 1, 1, 0, 0, 100),
            event(EventKind::NodeEnd, 7, 1, 1, 0, 0, 200),
            event(EventKind::BlockStart, 7, 1, 1, 0, 0, 120),
            event(EventKind::BlockProgress, 7, 1, 1, 0, 0, 250),
        ];
        let state = assemble(&records);
        let err = analyze_step(&state.steps[0]).unwrap_err();
        assert!(matches!(
            err,
            TraceError::UnattributableInterval {
                node_id: NodeID(1),
                ..
            }
        ));
    }

    #[test]
    fn test_node_without_blocks_has_zero_utilization() {
        let records = vec![
            event(EventKind::RunBegin, 0, 0, 0, 0, 0, 0),
            event(EventKind::NodeEnd, 0, 1, 0, 0, 0, 50),
            event(EventKind::NodeStart, 7, 1, 1, 0, 0, 100),
            event(EventKind::NodeEnd, 7, 1, 1, 0, 0, 200),
            event(EventKind::BlockStart, 0, 1, 0, 0, 0, 10),
            event(EventKind::BlockProgress, 0, 1, 0, 0, 0, 40),
        ];
        let state = assemble(&records);
        let analysis = analyze_step(&state.steps[0]).unwrap();
        let idle = analysis
            .nodes
            .iter()
            .find(|node| node.node_id == NodeID(1))
            .unwrap();
        assert_eq!(idle.sm_utilization, 0.0);
        let busy = analysis
            .nodes
            .iter()
            .find(|node| node.node_id == NodeID(0))
            .unwrap();
        assert!(busy.sm_utilization > 0.0 && busy.sm_utilization <= 1.0);
    }

    #[test]
    fn test_percentages_partitioning_step() {
        // Two nodes splitting the run back to back: percentages sum to 100.
        let records = vec![
            event(EventKind::RunBegin, 0, 0, 0, 0, 0, 0),
            event(EventKind::NodeEnd, 0, 1, 0, 0, 0, 400),
            event(EventKind::NodeStart, 7, 1, 1, 0, 0, 400),
            event(EventKind::NodeEnd, 7, 1, 1, 0, 0, 1000),
        ];
        let state = assemble(&records);
        let analysis = analyze_step(&state.steps[0]).unwrap();
        let sum: f64 = analysis.nodes.iter().map(|node| node.percentage).sum();
        assert!((sum - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentages_overlapping_step() {
        // Concurrent nodes: durations overlap in wall clock, so the summed
        // percentages understate each node individually and the total stays
        // 100 only because it is duration-weighted, not wall-clock-weighted.
        let records = vec![
            event(EventKind::RunBegin, 0, 0, 0, 0, 0, 0),
            event(EventKind::NodeEnd, 0, 1, 0, 0, 0, 1000),
            event(EventKind::NodeStart, 7, 1, 1, 0, 0, 0),
            event(EventKind::NodeEnd, 7, 1, 1, 0, 0, 1000),
        ];
        let state = assemble(&records);
        let analysis = analyze_step(&state.steps[0]).unwrap();
        let sum: f64 = analysis.nodes.iter().map(|node| node.percentage).sum();
        assert!((sum - 100.0).abs() < 1e-9);
        // each node individually covers the full run
        for node in &analysis.nodes {
            assert_eq!(node.duration, Timestamp(1000));
            assert!((node.percentage - 50.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_skipped_node_ids_tolerated() {
        let records = vec![
            event(EventKind::RunBegin, 0, 0, 0, 0, 0, 0),
            event(EventKind::NodeEnd, 0, 1, 0, 0, 0, 100),
            event(EventKind::NodeStart, 9, 2, 5, 0, 0, 100),
            event(EventKind::NodeEnd, 9, 2, 5, 0, 0, 300),
        ];
        let state = assemble(&records);
        let analysis = analyze_step(&state.steps[0]).unwrap();
        let ids: Vec<_> = analysis.nodes.iter().map(|node| node.node_id).collect();
        assert_eq!(ids, vec![NodeID(0), NodeID(5)]);
    }
}
