#![forbid(unsafe_code)]

use std::path::PathBuf;

use aero_engine::{parse_policy, AccessPolicy, Engine, EngineConfig, EngineEvent};
use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Translate and run a flat x86-64 image on the aero-dbt engine")]
struct Args {
    /// Flat binary image to load.
    image: PathBuf,

    /// Guest address the image is mapped at.
    #[arg(long, value_parser = parse_u64)]
    load_address: Option<u64>,

    /// Entry point (defaults to the load address).
    #[arg(long, value_parser = parse_u64)]
    entry: Option<u64>,

    /// Instruction budget per run while safety mode is on.
    #[arg(long)]
    budget: Option<u64>,

    /// Disable safety mode (no budget, unsafe forms allowed).
    #[arg(long)]
    no_safety: bool,

    /// Guest memory size in MiB.
    #[arg(long)]
    memory_mib: Option<u64>,

    /// Memory access policy: `regions` or `bounds`.
    #[arg(long, value_parser = parse_policy_arg)]
    policy: Option<AccessPolicy>,

    /// Print a disassembly of the first N image bytes before running.
    #[arg(long, value_name = "N")]
    disasm: Option<usize>,

    /// Print the guest region table after the run.
    #[arg(long)]
    regions: bool,
}

fn parse_u64(raw: &str) -> Result<u64, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|err| format!("`{raw}`: {err}"))
}

fn parse_policy_arg(raw: &str) -> Result<AccessPolicy, String> {
    parse_policy(raw).ok_or_else(|| format!("unknown policy `{raw}` (expected regions or bounds)"))
}

fn config(args: &Args) -> Result<EngineConfig> {
    let mut cfg = EngineConfig::from_env().context("reading AERO_DBT_* environment")?;
    if let Some(addr) = args.load_address {
        cfg.load_address = addr;
    }
    if let Some(budget) = args.budget {
        cfg.budget = budget;
    }
    if args.no_safety {
        cfg.safety = false;
    }
    if let Some(mib) = args.memory_mib {
        cfg.memory_size = mib
            .checked_mul(1024 * 1024)
            .context("memory size overflow")?;
    }
    if let Some(policy) = args.policy {
        cfg.policy = policy;
    }
    Ok(cfg)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cfg = config(&args)?;
    let image = std::fs::read(&args.image)
        .with_context(|| format!("failed to read image {}", args.image.display()))?;
    if image.is_empty() {
        bail!("image {} is empty", args.image.display());
    }

    let load_address = cfg.load_address;
    let entry = args.entry.unwrap_or(load_address);
    let mut engine = Engine::new(cfg).context("failed to create engine")?;
    engine
        .load_image(load_address, &image, entry)
        .with_context(|| format!("failed to load image at {load_address:#x}"))?;
    tracing::info!(load_address, entry, len = image.len(), "image loaded");

    if let Some(len) = args.disasm {
        let len = len.min(image.len());
        for line in engine.disassemble(load_address, len)? {
            println!("{line}");
        }
        println!();
    }

    let outcome = engine.run();

    println!("{}", engine.dump_registers());
    if args.regions {
        print!("{}", engine.dump_regions());
    }
    for event in engine.drain_events() {
        match event {
            EngineEvent::Retired { rip, text } => println!("retired {rip:#x} {text}"),
            other => println!("event {other:?}"),
        }
    }
    let dropped = engine.dropped_events();
    if dropped > 0 {
        println!("({dropped} events dropped)");
    }

    match outcome {
        Ok(result) => {
            println!(
                "exit: {:?} after {} instructions",
                result.reason, result.executed
            );
            Ok(())
        }
        Err(err) => bail!("{} fault: {err}", err.kind().name()),
    }
}
