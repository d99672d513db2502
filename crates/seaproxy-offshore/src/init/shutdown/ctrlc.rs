use anyhow::{Context, Result};

pub fn install() -> Result<ctrlc2::AsyncCtrlC> {
    ctrlc2::AsyncCtrlC::new(|| {
        println!("Ctrl-C received, shutting down...");
        true
    })
    .context("failed to install the Ctrl-C handler")
}
