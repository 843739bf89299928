use clap::Parser;
use fluvio_future::task::run_block_on;

use keystone_operator::cli::OperatorOpt;

fn main() -> anyhow::Result<()> {
    fluvio_future::subscriber::init_tracer(None);
    let opt = OperatorOpt::parse();
    run_block_on(opt.process())
}
