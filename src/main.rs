//! Planewire - schema inspection utility
//!
//! Debug tool for working with module definition files: list loaded
//! modules and their fingerprints, check stale definitions, and decode
//! captured payloads against a named schema.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use planewire::schema::{load_dir, load_module};
use planewire::{ArrayMode, Config, FieldKind, Registry};

/// Planewire - dataplane binary API schema tools
#[derive(Parser)]
#[command(name = "planewire")]
#[command(version = "0.1.0")]
#[command(about = "Inspect dataplane API schemas and decode captured payloads", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding .json module definitions
    #[arg(short, long, global = true)]
    schema_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List modules, messages and fingerprints
    Show,

    /// Check one definition file, including declared CRCs
    Check {
        /// Module definition file
        file: PathBuf,
    },

    /// Decode a hex payload against a registered message schema
    Decode {
        /// Message name the payload belongs to
        #[arg(short, long)]
        message: String,

        /// Payload as a hex string
        payload: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = Config::load_or_default(cli.config.as_deref());
    let schema_dir = cli
        .schema_dir
        .or(config.schema.dir)
        .unwrap_or_else(|| PathBuf::from("."));

    match cli.command {
        Commands::Show => {
            let modules = load_dir(&schema_dir)?;
            if modules.is_empty() {
                println!("No module definitions found in {}", schema_dir.display());
                return Ok(());
            }
            for module in modules {
                println!(
                    "module {} version {} crc {:#010x}",
                    module.name, module.api_version, module.module_crc
                );
                for message in module.messages() {
                    println!("  {:<40} {:>8} {:#010x}", message.name, message.kind.to_string(), message.crc);
                }
            }
        }

        Commands::Check { file } => {
            // load_module cross-checks every declared CRC
            let module = load_module(&file)?;
            println!(
                "{}: module {} version {} crc {:#010x}, {} messages ok",
                file.display(),
                module.name,
                module.api_version,
                module.module_crc,
                module.messages().len()
            );
        }

        Commands::Decode { message, payload } => {
            let registry = Registry::from_modules(load_dir(&schema_dir)?)?;
            let schema = registry
                .lookup_by_name(&message)
                .ok_or_else(|| anyhow::anyhow!("message '{message}' is not registered"))?;
            let bytes = hex::decode(payload.trim())?;
            let record = planewire::decode(&bytes, schema)?;

            println!("{} ({}, crc {:#010x})", schema.name, schema.kind, schema.crc);
            for field in &schema.fields {
                let note = match (&field.kind, &field.array) {
                    (_, ArrayMode::CountedBy(count)) => format!(" (counted by {count})"),
                    (_, ArrayMode::Fixed(n)) => format!(" [{n}]"),
                    (FieldKind::Struct(layout), _) => format!(" ({})", layout.name),
                    _ => String::new(),
                };
                match record.get(&field.name) {
                    Some(value) => println!("  {}{}: {:?}", field.name, note, value),
                    None => println!("  {}{}: <absent>", field.name, note),
                }
            }
        }
    }

    Ok(())
}
