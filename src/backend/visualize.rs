use std::cmp::{min, Reverse};
use std::collections::BTreeMap;
use std::fs::{create_dir, remove_dir_all, File};
use std::path::{Path, PathBuf};

use log::info;
use plotters::prelude::*;
use rayon::prelude::*;
use serde::Serialize;

use crate::analysis::{NodeMetrics, StepAnalysis};
use crate::backend::tabular;
use crate::state::{FuncID, State, Timestamp, TraceError};

const PIXELS_PER_TRACK: u32 = 12;
const TRACK_GAP: u32 = PIXELS_PER_TRACK / 2;
const LABEL_BAND: u32 = PIXELS_PER_TRACK * 40;

/// Colors handed out to highlighted functions, in assignment order.
/// Everything else renders in the default color.
const PALETTE: &[RGBColor] = &[
    RGBColor(0, 0, 255),     // blue
    RGBColor(255, 165, 0),   // orange
    RGBColor(255, 0, 0),     // red
    RGBColor(0, 128, 0),     // green
    RGBColor(128, 0, 128),   // purple
    RGBColor(0, 255, 255),   // cyan
    RGBColor(255, 192, 203), // pink
    RGBColor(255, 0, 255),   // magenta
    RGBColor(128, 128, 0),   // olive
    RGBColor(0, 0, 128),     // navy
    RGBColor(0, 128, 128),   // teal
    RGBColor(128, 0, 0),     // maroon
    RGBColor(255, 255, 0),   // yellow
];
const DEFAULT_COLOR: RGBColor = RGBColor(0, 0, 0);

fn render_err<E: std::fmt::Display>(err: E) -> TraceError {
    TraceError::Render(err.to_string())
}

/// funcID to display color mapping. Supplied as configuration or assigned
/// from the longest-running nodes of a step.
#[derive(Debug, Clone, Default)]
pub struct Palette {
    colors: BTreeMap<FuncID, RGBColor>,
}

impl Palette {
    /// Load a funcID -> [r, g, b] mapping from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TraceError> {
        let file = File::open(path)?;
        let raw: BTreeMap<u32, (u8, u8, u8)> = serde_json::from_reader(file)?;
        Ok(Palette {
            colors: raw
                .into_iter()
                .map(|(func, (r, g, b))| (FuncID(func), RGBColor(r, g, b)))
                .collect(),
        })
    }

    /// Give the functions of the `highlight` longest-running nodes distinct
    /// colors, first come first served.
    pub fn assign(nodes: &[NodeMetrics], highlight: usize) -> Self {
        let mut by_duration: Vec<&NodeMetrics> = nodes.iter().collect();
        by_duration.sort_by_key(|node| (Reverse(node.duration), node.node_id));
        let mut colors = BTreeMap::new();
        for node in by_duration.into_iter().take(highlight) {
            if colors.len() >= PALETTE.len() {
                break;
            }
            if !colors.contains_key(&node.func_id) {
                colors.insert(node.func_id, PALETTE[colors.len()]);
            }
        }
        Palette { colors }
    }

    fn color(&self, func_id: FuncID) -> RGBColor {
        self.colors.get(&func_id).copied().unwrap_or(DEFAULT_COLOR)
    }
}

fn lighten(color: RGBColor) -> RGBColor {
    RGBColor(
        ((color.0 as u16 + 255) / 2) as u8,
        ((color.1 as u16 + 255) / 2) as u8,
        ((color.2 as u16 + 255) / 2) as u8,
    )
}

/// Render one step's timeline: one horizontal band per SM, each block
/// interval a bar colored by the owning node's function, x scaled linearly
/// from 0 to the step's final timestamp.
pub fn emit_timeline<P: AsRef<Path>>(
    path: P,
    final_timestamp: Timestamp,
    analysis: &StepAnalysis,
    palette: &Palette,
    highlight: usize,
) -> Result<(), TraceError> {
    if final_timestamp.0 == 0 || analysis.sms.is_empty() {
        info!("step has no bounded timeline, skipping image");
        return Ok(());
    }

    let track_pitch = PIXELS_PER_TRACK + TRACK_GAP;
    let y_limit = analysis.sms.len() as u32 * track_pitch + LABEL_BAND;
    let x_limit = y_limit * 2;
    let cast_coor =
        |t: Timestamp| min((t.0 as f64 / final_timestamp.0 as f64 * x_limit as f64) as i32, x_limit as i32);

    let root = BitMapBackend::new(path.as_ref(), (x_limit, y_limit)).into_drawing_area();
    root.fill(&WHITE).map_err(render_err)?;

    let func_of: BTreeMap<_, _> = analysis
        .nodes
        .iter()
        .map(|node| (node.node_id, node.func_id))
        .collect();

    for (track, timeline) in analysis.sms.values().enumerate() {
        let mut y = (track as u32 * track_pitch) as i32;
        for spans in timeline.by_block.values() {
            for (interval, node_id) in spans {
                let color = func_of
                    .get(node_id)
                    .map(|&func_id| palette.color(func_id))
                    .unwrap_or(DEFAULT_COLOR);
                let (x0, x1) = (cast_coor(interval.start), cast_coor(interval.stop));
                root.draw(&Rectangle::new(
                    [(x0, y), (x1, y + PIXELS_PER_TRACK as i32)],
                    color.filled(),
                ))
                .map_err(render_err)?;
                // lighten the first pixels to mark the start of the block
                root.draw(&Rectangle::new(
                    [(x0, y), (x0 + 2, y + PIXELS_PER_TRACK as i32)],
                    lighten(color).filled(),
                ))
                .map_err(render_err)?;
            }
            y += TRACK_GAP as i32;
        }
    }

    // mark the start and the end of the longest nodes in the label band
    let mut top_nodes: Vec<&NodeMetrics> = analysis.nodes.iter().collect();
    top_nodes.sort_by_key(|node| (Reverse(node.duration), node.node_id));
    let mut y_shift = 0.9;
    for node in top_nodes.into_iter().take(highlight) {
        let (left, right) = (cast_coor(node.start), cast_coor(node.end));
        root.draw(&PathElement::new(
            vec![(left, 0), (left, y_limit as i32)],
            RGBColor(255, 0, 0),
        ))
        .map_err(render_err)?;
        root.draw(&PathElement::new(
            vec![(right, 0), (right, y_limit as i32)],
            RGBColor(0, 128, 0),
        ))
        .map_err(render_err)?;
        root.draw(&Text::new(
            format!(
                "f: {}  t: {} cy  {:.1}%",
                node.func_id.0, node.duration, node.percentage
            ),
            (left, (y_limit as f64 - LABEL_BAND as f64 * y_shift) as i32),
            ("sans-serif", 12),
        ))
        .map_err(render_err)?;
        y_shift = 1.3 - y_shift;
    }

    root.present().map_err(render_err)?;
    Ok(())
}

#[derive(Serialize)]
struct StepScale {
    step: usize,
    final_timestamp: u64,
}

fn create_unique_dir<P: AsRef<Path>>(path: P, force: bool) -> Result<PathBuf, TraceError> {
    let mut path = path.as_ref().to_owned();
    if force {
        info!("Removing previous contents of {:?}", &path);
        let _ = remove_dir_all(&path); // ignore failure, we'll catch it on create
        create_dir(&path)?;
    } else if create_dir(&path).is_err() {
        let mut i = 1;
        let retry_limit = 100;
        loop {
            let mut f = path.file_name().unwrap().to_owned();
            f.push(format!(".{}", i));
            let p = path.with_file_name(f);
            let r = create_dir(&p);
            if r.is_ok() {
                path = p.as_path().to_owned();
                break;
            } else if i >= retry_limit {
                // tried too many times, assume this is a permanent failure
                r?;
            }
            i += 1;
        }
    }
    Ok(path)
}

/// Emit one image and one table per analyzed step, plus a run-scale sidecar.
pub fn emit_visualization<P: AsRef<Path>>(
    state: &State,
    analyses: &[(usize, StepAnalysis)],
    palette: Option<&Palette>,
    highlight: usize,
    output: P,
    force: bool,
) -> Result<PathBuf, TraceError> {
    let path = create_unique_dir(output, force)?;
    info!(
        "Generating timeline images and metric tables in directory {:?}",
        &path
    );

    analyses.par_iter().try_for_each(|(index, analysis)| {
        let step = &state.steps[*index];
        let assigned;
        let palette = match palette {
            Some(palette) => palette,
            None => {
                assigned = Palette::assign(&analysis.nodes, highlight);
                &assigned
            }
        };
        emit_timeline(
            path.join(format!("step{}.png", index)),
            step.final_timestamp,
            analysis,
            palette,
            highlight,
        )?;
        tabular::emit_step_tsv(&path, *index, analysis)
    })?;

    let scales: Vec<StepScale> = analyses
        .iter()
        .map(|(index, _)| StepScale {
            step: *index,
            final_timestamp: state.steps[*index].final_timestamp.0,
        })
        .collect();
    let file = File::create(path.join("scale.json"))?;
    serde_json::to_writer(&file, &scales)?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NodeID;

    fn metrics(node_id: u32, func_id: u32, duration: u64) -> NodeMetrics {
        NodeMetrics {
            node_id: NodeID(node_id),
            func_id: FuncID(func_id),
            invocations: 1,
            start: Timestamp(0),
            end: Timestamp(duration),
            duration: Timestamp(duration),
            percentage: 0.0,
            sm_utilization: 0.0,
        }
    }

    #[test]
    fn test_palette_assignment_order() {
        let nodes = vec![
            metrics(0, 10, 50),
            metrics(1, 20, 500),
            metrics(2, 30, 5),
        ];
        let palette = Palette::assign(&nodes, 2);
        // longest two nodes get colors, in duration order
        assert_eq!(palette.color(FuncID(20)), PALETTE[0]);
        assert_eq!(palette.color(FuncID(10)), PALETTE[1]);
        assert_eq!(palette.color(FuncID(30)), DEFAULT_COLOR);
    }

    #[test]
    fn test_palette_shared_function() {
        // two highlighted nodes of the same function share one color
        let nodes = vec![metrics(0, 10, 50), metrics(1, 10, 500)];
        let palette = Palette::assign(&nodes, 2);
        assert_eq!(palette.color(FuncID(10)), PALETTE[0]);
    }

    #[test]
    fn test_lighten() {
        assert_eq!(lighten(RGBColor(0, 76, 153)), RGBColor(127, 165, 204));
        assert_eq!(lighten(RGBColor(255, 255, 255)), RGBColor(255, 255, 255));
    }
}
