//! `IrScope` - Raw IR stream viewer for proprietary UVC bulk cameras
//!
//! The camera streams an undocumented payload over a bulk endpoint using
//! UVC payload headers. This crate reassembles frames from those packets,
//! strips the vendor metadata prefix, filters out the corrupted frames the
//! device produces regularly and renders what remains as grayscale.
//!
//! Everything below the [`viewer`] is usable without hardware: a recorded
//! stream can be replayed through [`replay::ReplayTransport`].

pub mod accumulator;
pub mod capture;
pub mod cli;
pub mod config;
pub mod dump;
pub mod frame_assembler;
pub mod frame_validation;
pub mod metadata;
pub mod render;
pub mod replay;
pub mod stability;
pub mod test_utils;
pub mod transport;
pub mod usb;
pub mod viewer;

use anyhow::Context;
use clap::Parser;

use crate::cli::{Cli, Command};
use crate::config::ViewerConfig;
use crate::transport::RunFlag;

/// Run the `IrScope` command line
///
/// Initializes logging, loads configuration (file, environment, flags),
/// installs the Ctrl+C handler and runs the requested subcommand.
///
/// # Errors
///
/// Returns an error if configuration is invalid or the subcommand fails.
pub fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config =
        ViewerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    log::info!("IrScope starting up");

    let running = RunFlag::new();
    {
        let running = running.clone();
        if let Err(err) = ctrlc::set_handler(move || running.stop()) {
            log::warn!("Failed to install Ctrl+C handler: {}", err);
        }
    }

    cli::execute(cli.command.unwrap_or(Command::View), config, &running)
}
