//! CLI for building rootfs directories from OCI images.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use strata_oci::{PullSpec, Puller};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strata", version, about = "Materialize an OCI image as a rootfs directory")]
struct Cli {
    /// Pull configuration (JSON).
    config: PathBuf,

    /// Print the image digest instead of extracting.
    #[arg(long)]
    digest_only: bool,

    /// Log debug output to stderr.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(e) = cli.run().await {
        eprintln!("strata: {e:#}");
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins over `-v`.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

impl Cli {
    async fn run(self) -> Result<()> {
        let spec = PullSpec::from_file(&self.config)?;
        let mut image = Puller::default()
            .pull(&spec)
            .await
            .with_context(|| format!("pulling {}", spec.image))?;

        if self.digest_only {
            println!("{}", image.digest().await?);
            return Ok(());
        }

        image
            .extract()
            .await
            .with_context(|| format!("extracting {}", spec.image))?;
        Ok(())
    }
}
