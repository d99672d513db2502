use anyhow::Result;
use clap::Parser;

use crate::{cmd::Args, init::logger};

pub fn init() -> Result<Args> {
    let args = Args::parse();
    logger::init(&args.log_level, args.colored)?;
    log::debug!("{args:?}");
    Ok(args)
}
