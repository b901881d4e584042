use clap::Parser;
use fixtures::{run_server, Backend, FixtureArgs};

/// Billing backend fixture server
#[derive(Parser, Debug)]
#[clap(name = "backend-fixture")]
struct Cli {
    #[clap(flatten)]
    common: FixtureArgs,

    /// Delay every token refresh by this many milliseconds
    #[arg(long, default_value = "0")]
    refresh_delay_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let backend = Backend::new();
    backend.set_refresh_delay(std::time::Duration::from_millis(args.refresh_delay_ms));

    run_server(args.common, backend.router()).await
}
