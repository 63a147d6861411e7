use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    trustmed_collect::logging::init().context("init logging")?;

    let cli = trustmed_collect::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        trustmed_collect::cli::Command::Collect(args) => {
            trustmed_collect::driver::run(args).await.context("collect")?;
        }
        trustmed_collect::cli::Command::FetchReplies(args) => {
            trustmed_collect::replies::run(args)
                .await
                .context("fetch-replies")?;
        }
        trustmed_collect::cli::Command::Combine(args) => {
            trustmed_collect::combine::run(args).context("combine")?;
        }
        trustmed_collect::cli::Command::Prepare(args) => {
            trustmed_collect::prepare::run(args).context("prepare")?;
        }
        trustmed_collect::cli::Command::Upload(args) => {
            trustmed_collect::object_store::run(args)
                .await
                .context("upload")?;
        }
    }

    Ok(())
}
