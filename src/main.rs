//! `dlfind-params`: inspect and scaffold DL-FIND engine option files.
//!
//! # Usage
//!
//! ```bash
//! # Write a commented template with every engine option
//! dlfind-params template [dlfind.cfg]
//!
//! # Print the options resolved from the standard locations, or from one file
//! dlfind-params show [path]
//!
//! # List option names with their numeric kinds
//! dlfind-params fields
//! ```

use dlfind::params::FIELDS;
use dlfind::settings::{ConfigError, SettingsManager, FILE_NAME};
use log::error;
use std::env;
use std::path::Path;
use std::process;

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .target(env_logger::Target::Stdout)
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    let program = args.first().map_or("dlfind-params", String::as_str);
    let Some(command) = args.get(1) else {
        print_usage(program);
        process::exit(1);
    };

    let result = match command.as_str() {
        "template" => {
            let path = args.get(2).map_or(FILE_NAME, String::as_str);
            run_template(Path::new(path))
        }
        "show" => run_show(args.get(2).map(Path::new)),
        "fields" => {
            for field in FIELDS {
                println!("{:<16} {}", field.name, field.kind);
            }
            Ok(())
        }
        "-h" | "--help" | "help" => {
            print_usage(program);
            Ok(())
        }
        other => {
            eprintln!("Error: unknown command '{}'", other);
            print_usage(program);
            process::exit(1);
        }
    };

    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
}

fn run_template(path: &Path) -> Result<(), ConfigError> {
    SettingsManager::create_template(path)?;
    println!("Settings template written to {}", path.display());
    Ok(())
}

fn run_show(path: Option<&Path>) -> Result<(), ConfigError> {
    let settings = match path {
        Some(path) => SettingsManager::load_file(path)?,
        None => SettingsManager::load()?,
    };
    println!("# source: {}", settings.config_source());
    println!("{}", serde_json::to_string_pretty(settings.params())?);
    Ok(())
}

fn print_usage(program: &str) {
    eprintln!("Usage:");
    eprintln!("  {} template [path]  - Write a settings template", program);
    eprintln!("  {} show [path]      - Print resolved engine options as JSON", program);
    eprintln!("  {} fields           - List engine options", program);
}
