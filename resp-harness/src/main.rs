use anyhow::{Result, bail};
use clap::Parser;
use tracing::info;

use resp_harness::{
    cli::{Cli, Format},
    scenario,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the report.
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.scenario_config();
    info!(
        server = %config.server.program.display(),
        master = config.master_port,
        replica = config.replica_port,
        late_replica = config.late_replica_port,
        sync = ?config.sync,
        "starting run"
    );

    let report = scenario::run(&config);
    match cli.format {
        Format::Text => println!("{}", report.render_text()),
        Format::Json => println!("{}", report.to_json()?),
    }

    if !report.success() {
        bail!("run failed");
    }
    Ok(())
}
