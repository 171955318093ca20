//! The module that implements the `liftoff-tools settings` command.

use super::CodegenOptions;
use anyhow::Result;
use clap::Parser;

/// Displays the compilation settings selected for a target.
#[derive(Parser)]
pub struct SettingsCommand {
    #[command(flatten)]
    codegen: CodegenOptions,
}

impl SettingsCommand {
    /// Executes the command.
    pub fn execute(self) -> Result<()> {
        let isa = self.codegen.isa()?;
        let settings = isa.settings();
        println!("Liftoff settings for target '{}' ({}):", isa.triple(), isa.name());
        let rows = [
            ("use_trap_handler", settings.use_trap_handler),
            ("bounds_checks", settings.bounds_checks),
            ("stack_checks", settings.stack_checks),
            ("runtime_exception_support", settings.runtime_exception_support),
        ];
        let width = rows.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
        for (name, value) in rows {
            println!("  {name:width$} {value}");
        }
        Ok(())
    }
}
