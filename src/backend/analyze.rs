use std::cmp::Reverse;

use crate::analysis::StepAnalysis;

/// Print a per-node breakdown of one analyzed step, longest node first.
pub fn print_statistics(step: usize, analysis: &StepAnalysis) {
    // Find the order to output these statistics in, currently we'll do it
    // by the node duration
    let mut ordering: Vec<usize> = (0..analysis.nodes.len()).collect();
    ordering.sort_by_key(|&i| Reverse(analysis.nodes[i].duration));

    println!();
    println!("  -------------------------");
    println!("  Step {} Statistics", step);
    println!("  -------------------------");
    for i in ordering {
        let node = &analysis.nodes[i];
        println!();
        println!("      Node {} Function {}", node.node_id.0, node.func_id.0);
        println!("          Invocations: {}", node.invocations);
        println!(
            "          Duration: {} cycles ({:.2}%)",
            node.duration, node.percentage
        );
        println!(
            "          Window: [{}, {}]",
            node.start, node.end
        );
        println!("          SM utilization: {:.3}", node.sm_utilization);
    }

    let coverage: f64 = analysis
        .nodes
        .iter()
        .map(|node| node.sm_utilization * node.percentage)
        .sum();
    println!();
    println!(
        "  For each SM on average, {:.3}% of the time there is at least one block running",
        coverage
    );
}
