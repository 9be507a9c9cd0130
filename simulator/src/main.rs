use anyhow::Context;
use clap::Parser;
use generator::template::SCENARIOS;
use std::fs;
use std::path::{Path, PathBuf};
use workflow::config::WorkflowConfig;
use workflow::runner::{Runner, WorkflowResult};

mod generator;
mod workflow;

#[derive(Parser)]
#[command(author, version, about = "Offline driver for the magnetic survey merge core")]
struct Args {
    /// Load a workflow config from YAML
    #[arg(long)]
    workflow: Option<PathBuf>,
    /// Synthesize one of the canned survey layouts
    #[arg(long)]
    scenario: Option<String>,
    /// Extra dataset serialized as JSON (repeatable)
    #[arg(long = "input")]
    inputs: Vec<PathBuf>,
    /// Dataset to hold fixed while leveling
    #[arg(long)]
    reference: Option<String>,
    /// prefer-newer, prefer-higher-precision or prefer-explicit-dataset-order
    #[arg(long)]
    precedence: Option<String>,
    /// exclude-both or admit-flagged
    #[arg(long)]
    conflict_policy: Option<String>,
    #[arg(long, default_value = "tools/data")]
    output_dir: PathBuf,
    #[arg(long, default_value_t = false)]
    list_scenarios: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.list_scenarios {
        for name in SCENARIOS {
            println!("{}", name);
        }
        return Ok(());
    }

    let mut workflow_config = if let Some(path) = &args.workflow {
        WorkflowConfig::load(path)?
    } else {
        WorkflowConfig::from_scenario(args.scenario.as_deref().unwrap_or("adjacent-blocks"))
    };
    if args.workflow.is_some() && args.scenario.is_some() {
        workflow_config.scenario = args.scenario.clone();
    }
    workflow_config.inputs.extend(args.inputs.iter().cloned());
    if let Some(reference) = args.reference {
        workflow_config.reference = Some(reference);
    }
    if let Some(precedence) = args.precedence {
        workflow_config.precedence = precedence;
    }
    if let Some(policy) = args.conflict_policy {
        workflow_config.conflict_policy = policy;
    }

    let result = Runner::new(workflow_config).execute()?;
    print_summary(&result);
    write_outputs(&args.output_dir, &result)?;
    Ok(())
}

fn print_summary(result: &WorkflowResult) {
    let report = &result.report;
    println!(
        "Merged {} inputs -> {} lines, {} of {} samples admitted, {} skipped (reference {})",
        result.input_count,
        result.merged.lines.len(),
        report.counts.admitted,
        report.counts.input,
        report.counts.skipped,
        report.reference_dataset.as_deref().unwrap_or("-")
    );
    for level in &report.corrections {
        let relative = level
            .local_reference
            .as_deref()
            .map(|local| format!(" relative to {}", local))
            .unwrap_or_default();
        println!(
            "  {:<20} {:?} offset {:+.3} nT{} ({} pairs, {} outliers)",
            level.dataset,
            level.status,
            level.correction.offset,
            relative,
            level.pairs_used,
            level.outliers_excluded
        );
    }
    for overlap in &report.overlaps {
        println!(
            "  {} x {}: {} pairs, residual {:+.3} +/- {:.3} nT, {} conflicts{}",
            overlap.dataset_a,
            overlap.dataset_b,
            overlap.pair_count,
            overlap.residual.mean,
            overlap.residual.std_dev,
            overlap.conflicts,
            if overlap.accepted { "" } else { " [review]" }
        );
    }
    for condition in &report.conditions {
        println!("  ! {:?}", condition);
    }
}

fn write_outputs(dir: &Path, result: &WorkflowResult) -> anyhow::Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let merged_path = dir.join("merged.json");
    let merged = serde_json::to_string(&result.merged).context("serializing merged dataset")?;
    fs::write(&merged_path, merged)
        .with_context(|| format!("writing {}", merged_path.display()))?;

    let report_path = dir.join("merge_report.json");
    let report = result.report.to_json().context("serializing merge report")?;
    fs::write(&report_path, report)
        .with_context(|| format!("writing {}", report_path.display()))?;

    log::info!(
        "wrote {} and {}",
        merged_path.display(),
        report_path.display()
    );
    Ok(())
}
