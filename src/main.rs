use std::error::Error;

use log::debug;

use racebud::callbacks::RaceBudCallbacks;
use racebud::config::{FLAGS_ENV, LOG_ENV};
use racebud::options::Options;

fn parse_options() -> Result<Options, Box<dyn Error>> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let options = match std::env::var(FLAGS_ENV) {
        Ok(flags) => Options::parse_from_str(&flags)?.merge(Options::parse_from_args(&args)?),
        Err(_) => Options::parse_from_args(&args)?,
    };
    debug!("Options: {:?}", options);
    Ok(options)
}

fn run() -> Result<(), Box<dyn Error>> {
    let options = parse_options()?;
    RaceBudCallbacks::new(options)?.run()?;
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or(LOG_ENV, "warn")).init();
    let result = run();
    if let Err(err) = &result {
        eprintln!("racebud: {}", err);
    }
    std::process::exit(result.is_err() as i32);
}
