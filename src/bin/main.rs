use clap::Parser;

use refmirror::{cli, telemetry};

fn main() {
    let cli = cli::Cli::parse();
    telemetry::init(cli.verbose);
    std::process::exit(cli::run(cli));
}
