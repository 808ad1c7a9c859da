use anyhow::Result;
use clap::Parser;
use schemaflow_cli::{run_cli, Cli, LogFormat};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_format());
    run_cli(cli)
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_env("SCHEMAFLOW_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
