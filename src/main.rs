use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tracing_subscriber::EnvFilter;

use modgraph::{RuntimeConfig, Scenario};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MODGRAPH_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let mut config_path: Option<PathBuf> = None;
    let mut input_path: Option<String> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config_path = Some(
                    args.next()
                        .ok_or_else(|| anyhow::anyhow!("Missing config path after {arg}"))?
                        .into(),
                );
            }
            _ => {
                input_path = Some(arg);
                if args.next().is_some() {
                    bail!("Only one scenario file is supported");
                }
                break;
            }
        }
    }

    let source = if let Some(path) = input_path {
        fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?
    } else {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Reading stdin")?;
        buffer
    };

    let mut scenario = Scenario::from_yaml_str(&source)?;
    if let Some(path) = config_path {
        scenario.config = RuntimeConfig::from_path(&path)?;
    }
    scenario.config = scenario.config.with_env_overrides()?;

    let output = scenario.run()?;
    if !output.is_empty() {
        print!("{output}");
    }
    Ok(())
}
