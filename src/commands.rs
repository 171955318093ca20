//! The module for the Liftoff CLI commands.

mod compile;
pub use self::compile::*;

mod settings;
pub use self::settings::*;
