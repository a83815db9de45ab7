use clap::Parser;

use mirrorline_cli::Cli;
use mirrorline_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    mirrorline_observability::tracing::init_with_default(LogFormat::Compact, "warn");

    let cli = Cli::parse();
    let mut stdout = std::io::stdout().lock();
    mirrorline_cli::run(cli, &mut stdout).await
}
