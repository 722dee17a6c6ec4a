//! polymap CLI
//!
//! Runs the outer-band mapping pass on a scop file and prints the mapped
//! schedule tree, the coordinate mappings and the inserted barriers.
//!
//! # Usage
//!
//! ## Map a kernel
//! ```bash
//! cargo run --bin polymap -- map --input kernel.json
//! cargo run --bin polymap -- map --input kernel.json --json --output report.json
//! ```
//!
//! ## Inspect a kernel without mapping it
//! ```bash
//! cargo run --bin polymap -- show --input kernel.json
//! ```
//!
//! Set `RUST_LOG=debug` to follow the pass.

use clap::{Parser, Subcommand};
use polymap::{MappingOuterBand, MappingReport, ScopFile};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(name = "polymap")]
#[clap(about = "polymap - GPU thread/block mapping for polyhedral schedule trees")]
#[clap(version = "0.1")]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bind threads and blocks, insert barriers and print the result
    Map {
        /// Scop file (schedule, dependences, config)
        #[clap(long = "input", short = 'i', value_name = "FILE")]
        input: PathBuf,

        /// Write the report here instead of stdout
        #[clap(long = "output", short = 'o', value_name = "FILE")]
        output: Option<PathBuf>,

        /// Print the report as JSON
        #[clap(long = "json")]
        json: bool,
    },

    /// Print the schedule tree and dependences of a scop file
    Show {
        /// Scop file (schedule, dependences, config)
        #[clap(long = "input", short = 'i', value_name = "FILE")]
        input: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Commands::Map {
            input,
            output,
            json,
        } => map_command(input, output, json)?,
        Commands::Show { input } => show_command(input)?,
    }

    Ok(())
}

fn map_command(
    input: PathBuf,
    output: Option<PathBuf>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let (sch, pass_info, mut scop_info) = ScopFile::from_file(&input)
        .and_then(ScopFile::load)
        .map_err(|e| format!("Failed to load {}: {}", input.display(), e))?;

    let sch = MappingOuterBand::new(&pass_info, &mut scop_info)
        .run(sch)
        .map_err(|e| format!("Mapping failed: {}", e))?;
    let report = MappingReport::new(&sch, &scop_info);

    let text = if json {
        report.to_json()?
    } else {
        render_report(&report)
    };
    match output {
        Some(path) => {
            std::fs::write(&path, text)
                .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
            println!("Report written to {}", path.display());
        }
        None => println!("{}", text),
    }
    Ok(())
}

fn show_command(input: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let (sch, pass_info, scop_info) = ScopFile::from_file(&input)
        .and_then(ScopFile::load)
        .map_err(|e| format!("Failed to load {}: {}", input.display(), e))?;

    println!("Schedule tree:");
    print!("{}", sch);
    println!("\nDependences ({} pairs):", pass_info.dependences.len());
    println!("  {}", pass_info.dependences);
    if let Ok(cfg) = scop_info.user_config.thread_config() {
        println!("\nThread config: {:?}", cfg.iter().collect::<Vec<_>>());
    }
    if let Ok(cfg) = scop_info.user_config.block_config() {
        println!("Block config: {:?}", cfg.iter().collect::<Vec<_>>());
    }
    Ok(())
}

fn render_report(report: &MappingReport) -> String {
    let mut out = String::new();
    out.push_str("Mapped schedule tree:\n");
    out.push_str(&report.schedule);

    out.push_str("\nMappings:\n");
    for entry in &report.mappings {
        out.push_str(&format!("  node #{}\n", entry.node));
        for (coord, upa) in &entry.coords {
            out.push_str(&format!("    {} = {}\n", coord, upa));
        }
    }

    out.push_str("\nBarriers:\n");
    if report.syncs.is_empty() {
        out.push_str("  (none)\n");
    }
    for sync in &report.syncs {
        out.push_str(&format!(
            "  {} barrier {} after child {} of sequence #{}\n",
            sync.level, sync.statement, sync.pos, sync.sequence
        ));
    }
    if !report.block_shift.is_empty() {
        out.push_str(&format!("\nBlock shift: {:?}\n", report.block_shift));
    }
    if report.atomic_add {
        out.push_str("\nReduction axes bound to blocks: atomic add required\n");
    }
    out
}
