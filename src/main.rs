//! The `liftoff-tools` command line tool.
//!
//! Compiles the functions of a WebAssembly module with the Liftoff baseline
//! compiler and prints the generated code. See `liftoff-tools --help` for
//! usage.

use anyhow::Result;
use clap::Parser;

mod commands;

/// Liftoff baseline compiler
#[derive(Parser)]
#[command(name = "liftoff-tools", version)]
struct Liftoff {
    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Parser)]
enum Subcommand {
    /// Compiles every function of a WebAssembly module.
    Compile(commands::CompileCommand),

    /// Displays the compilation settings and their defaults.
    Settings(commands::SettingsCommand),
}

impl Liftoff {
    /// Executes the command.
    pub fn execute(self) -> Result<()> {
        match self.subcommand {
            Subcommand::Compile(c) => c.execute(),

            Subcommand::Settings(c) => c.execute(),
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    Liftoff::parse().execute()
}

#[test]
fn verify_cli() {
    use clap::CommandFactory;
    Liftoff::command().debug_assert()
}
