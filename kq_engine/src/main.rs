use anyhow::Result;
use env_logger::Env;

fn main() -> Result<()> {
    let args = kq_engine::cli::parse()?;

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    kq_engine::runtime::execute(args)
}
