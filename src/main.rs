use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;

use focusstack::image_io::save_output;
use focusstack::progress::format_duration;
use focusstack::{logger, settings, Engine, EngineConfig, ProgressModel, RunMode, RunOutcome, Stage, StageEvent};

/// Focus-stack a bracket of images into one sharp image.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Where to write the stacked image (format from extension).
    #[arg(short, long)]
    output: PathBuf,

    /// Inputs are already aligned; skip registration.
    #[arg(long)]
    no_align: bool,

    /// Pyramid depth (levels below full resolution).
    #[arg(long)]
    depth: Option<usize>,

    /// Maximum number of images processed concurrently.
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Directory for spilled pyramid levels (default: temp dir).
    #[arg(long)]
    scratch: Option<PathBuf>,

    /// Index of the reference image.
    #[arg(long)]
    reference: Option<usize>,

    /// Persist the effective settings as the new defaults.
    #[arg(long)]
    save_settings: bool,

    /// Images to stack, in order.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

fn apply_overrides(config: &mut EngineConfig, args: &Args) {
    if let Some(depth) = args.depth {
        config.pyramid_depth = depth;
    }
    if let Some(jobs) = args.jobs {
        config.max_concurrency = jobs;
    }
    if let Some(reference) = args.reference {
        config.reference_index = reference;
    }
}

fn print_progress(model: &ProgressModel, event: &StageEvent) {
    print!(
        "\r{:5.1}%  {:<8} {:>3}/{:<3}  ETA {:<12}",
        model.overall_percentage(),
        event.stage_key(),
        event.images_done,
        event.images_total,
        format_duration(model.eta())
    );
    let _ = std::io::stdout().flush();
}

fn main() -> Result<()> {
    logger::init();

    let args = Args::parse();

    let mut config = settings::load_settings();
    apply_overrides(&mut config, &args);
    config.validate()?;
    if args.save_settings {
        let path = settings::save_settings(&config)?;
        log::info!("Settings saved to {}", path.display());
    }

    let scratch = args.scratch.clone().unwrap_or_else(std::env::temp_dir);
    let engine = Engine::with_config(&scratch, config.clone())?;
    engine.set_images(args.inputs.clone())?;

    let (mode, stages) = if args.no_align {
        (RunMode::StackOnly, vec![Stage::Build, Stage::Fuse, Stage::Collapse])
    } else {
        (RunMode::AlignAndStack, Stage::ALL.to_vec())
    };

    let (tx, rx) = crossbeam_channel::unbounded::<StageEvent>();
    let handle = engine.run_async(mode, Arc::new(tx));
    let mut model = ProgressModel::new(config.stage_weights.clone());
    model.begin_run(&stages);

    loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(event) => {
                model.record(&event);
                print_progress(&model, &event);
            }
            Err(RecvTimeoutError::Timeout) => {
                if handle.is_done() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    println!();

    match handle.result() {
        RunOutcome::Completed(report) => {
            for warning in &report.warnings {
                eprintln!("warning: {}", warning);
            }
            let output = engine
                .output_image()
                .context("run completed without an output image")?;
            save_output(&output, &args.output)?;
            println!(
                "Stacked {} of {} images in {} -> {}",
                report.images_used.len(),
                args.inputs.len(),
                format_duration(report.elapsed),
                args.output.display()
            );
            Ok(())
        }
        RunOutcome::Cancelled => bail!("stacking was cancelled"),
        RunOutcome::Failed(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_command_line() {
        let args = Args::try_parse_from([
            "focusstack", "--no-align", "--depth", "4", "-j", "2", "-o", "out.png", "a.jpg", "b.jpg",
        ])
        .unwrap();
        assert!(args.no_align);
        assert_eq!(args.depth, Some(4));
        assert_eq!(args.jobs, Some(2));
        assert_eq!(args.output, PathBuf::from("out.png"));
        assert_eq!(args.inputs, vec![PathBuf::from("a.jpg"), PathBuf::from("b.jpg")]);

        let mut config = EngineConfig::default();
        apply_overrides(&mut config, &args);
        assert_eq!(config.pyramid_depth, 4);
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.reference_index, 0);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Args::try_parse_from(["focusstack", "a.jpg"]).is_err());
        assert!(Args::try_parse_from(["focusstack", "-o", "out.png"]).is_err());
        assert!(Args::try_parse_from(["focusstack", "--depth", "x", "-o", "o.png", "a.jpg"]).is_err());
        assert!(Args::try_parse_from(["focusstack", "--bogus", "-o", "o.png", "a.jpg"]).is_err());
    }

    #[test]
    fn test_args_definition_is_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
