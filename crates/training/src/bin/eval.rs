use clap::Parser;
use training::cli::{run_eval, EvalArgs};

fn main() -> anyhow::Result<()> {
    cli_support::init_tracing()?;
    let args = EvalArgs::parse();
    run_eval(args)
}
