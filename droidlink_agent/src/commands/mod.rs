//! CLI command implementations

pub mod identity;
pub mod run;
pub mod scan;
pub mod status;
pub mod token;

use colored::Colorize;

/// Report a completed step
pub fn done(msg: &str) {
    println!("{} {}", "ok".green().bold(), msg);
}

/// Report a failure to stderr
pub fn fail(msg: &str) {
    eprintln!("{} {}", "error".red().bold(), msg);
}

/// Print an aligned `name: value` line
pub fn field(name: &str, value: impl std::fmt::Display) {
    println!("  {} {}", format!("{:<12}", format!("{}:", name)).bold(), value);
}
