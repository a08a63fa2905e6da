#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::wildcard_imports)]

use std::ffi::OsStr;
use std::io;
use std::path::PathBuf;

use clap::{arg, command, value_parser, Args, Command, FromArgMatches as _, Parser, Subcommand};
use clap_complete::{generate, Shell};

use qbarr::config::Config;
use qbarr::errors::*;
use qbarr::Supervisor;

const NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Parser, Debug)]
#[command()]
pub struct Cli {
    /// Log verbosity
    #[arg(long, short, action = clap::ArgAction::Count)]
    pub verbose: u8,
    #[command(subcommand)]
    pub cmd: Option<CliSub>,
}

#[derive(Subcommand, Debug)]
pub enum CliSub {
    #[command(hide(true))]
    GenCompletions {
        /// Shell the completions are generated for
        shell: Shell,
    },
}

#[derive(Args)]
struct CustomOpts {
    config: PathBuf,
}

fn build_cli() -> Result<Command> {
    let parser = command!();
    let default_cfgpath: &'static OsStr =
        Box::leak(Config::config_path()?.into_boxed_path()).as_os_str();
    let parser = parser.arg(
        arg!(-c --config <CONFIG> "Configuration file")
            .value_parser(value_parser!(PathBuf))
            .default_value(default_cfgpath),
    );
    Ok(Cli::augment_args(parser))
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("{NAME}={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run() -> Result<()> {
    let parser = build_cli()?;
    let matches = parser.get_matches();
    let cli = Cli::from_arg_matches(&matches)?;
    let opts = CustomOpts::from_arg_matches(&matches)?;

    if let Some(CliSub::GenCompletions { shell }) = cli.cmd {
        generate(shell, &mut build_cli()?, NAME, &mut io::stdout());
        return Ok(());
    }

    init_tracing(cli.verbose);
    let cfg = Config::load_path(&opts.config)?;
    Supervisor::new(cfg).run()
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{NAME}: {err:#}");
        std::process::exit(1);
    }
}
