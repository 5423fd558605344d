mod cli;
mod initializers;

use clap::Parser;
use tracing::error;

use crate::{
    cli::{CLI, run},
    initializers::init_tracing,
};

#[tokio::main]
async fn main() {
    let CLI { opts, command } = CLI::parse();
    init_tracing(&opts);

    if let Err(error) = run(opts, command).await {
        error!(error = %error, "bitnode-monitor failed");
        std::process::exit(1);
    }
}
