//! toolgate binary entry point.

use clap::Parser;

use toolgate::cli::{self, Cli};
use toolgate::observability::{LogFormat, init_logging};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let format = if cli.log_json { LogFormat::Json } else { LogFormat::Human };
    init_logging(format, cli.verbose);

    if let Err(e) = cli::run(cli).await {
        tracing::error!(error = %e, "fatal");
        std::process::exit(1);
    }
}
