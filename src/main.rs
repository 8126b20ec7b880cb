use std::cmp::min;
use std::ffi::OsString;

use clap::Parser;

use log::{info, warn};

use rayon::prelude::*;

use megakernel_prof::analysis::{analyze_step, StepAnalysis};
use megakernel_prof::backend::{analyze, visualize};
use megakernel_prof::serialize::deserialize;
use megakernel_prof::state::{State, TraceError};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(required = true, help = "input megakernel device log filename")]
    filename: OsString,

    #[arg(long, default_value_t = 1, help = "number of steps to analyze")]
    steps: usize,

    #[arg(
        long = "start-from",
        default_value_t = 10,
        help = "first step to analyze"
    )]
    start_from: usize,

    #[arg(
        long,
        default_value_t = 10,
        help = "number of longest-running nodes to highlight"
    )]
    highlight: usize,

    #[arg(
        short,
        long,
        help = "output directory pathname (defaults to <logfile>_megakernel_events)"
    )]
    output: Option<OsString>,

    #[arg(long, help = "funcID to display color mapping file (JSON)")]
    palette: Option<OsString>,

    #[arg(short, long, help = "overwrite output directory if it exists")]
    force: bool,

    #[arg(short, long, help = "print statistics instead of rendering")]
    statistics: bool,

    #[arg(short, long, help = "print verbose profiling information")]
    verbose: bool,
}

fn main() -> Result<(), TraceError> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "info" }),
    )
    .init();

    info!("Reading log file {:?}...", &cli.filename);
    let records = deserialize(&cli.filename)?;
    info!("{} events were logged in total", records.len());

    let mut state = State::default();
    state.process_records(&records)?;
    state.calibrate();

    // The trailing step may be truncated by log rotation or a crash; only
    // the steps closed by a later launch are analyzable.
    let complete = state.num_complete();
    info!(
        "complete traces for {} of {} steps are available",
        complete,
        state.steps.len()
    );
    if complete == 0 {
        println!("Nothing to do");
        return Ok(());
    }

    let mut start = cli.start_from;
    if start >= complete {
        start = complete - 1;
        warn!(
            "requested start step {} is beyond the {} complete steps, starting from step {}",
            cli.start_from, complete, start
        );
    }
    let stop = min(start + cli.steps, complete);

    let analyses: Vec<(usize, StepAnalysis)> = (start..stop)
        .into_par_iter()
        .map(|index| analyze_step(&state.steps[index]).map(|analysis| (index, analysis)))
        .collect::<Result<_, _>>()?;

    if cli.statistics {
        for (index, analysis) in &analyses {
            analyze::print_statistics(*index, analysis);
        }
        return Ok(());
    }

    let palette = cli
        .palette
        .as_ref()
        .map(visualize::Palette::from_file)
        .transpose()?;
    let output = cli.output.unwrap_or_else(|| {
        let mut path = cli.filename.clone();
        path.push("_megakernel_events");
        path
    });
    let path = visualize::emit_visualization(
        &state,
        &analyses,
        palette.as_ref(),
        cli.highlight,
        output,
        cli.force,
    )?;
    println!("Wrote {} step timelines to {:?}", analyses.len(), path);

    Ok(())
}
