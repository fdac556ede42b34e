//! Protoc Sandbox Config CLI
//!
//! View and manage code generation configuration.

use clap::{Parser, Subcommand};
use protoc_sandbox::CodegenConfig;

#[derive(Parser)]
#[command(name = "protoc-sandbox-config")]
#[command(about = "View and manage protoc-sandbox configuration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current configuration
    Show {
        /// Config file to load (optional)
        #[arg(short, long)]
        config: Option<String>,

        /// Output as TOML
        #[arg(long)]
        toml: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Initialize a new config file
    Init {
        /// Output path (default: protoc-sandbox.toml)
        #[arg(short, long, default_value = "protoc-sandbox.toml")]
        output: String,
    },

    /// Validate configuration
    Validate {
        /// Config file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Show { config, toml, json } => {
            let cfg = CodegenConfig::load_from(config.as_deref())?;

            if json {
                println!("{}", serde_json::to_string_pretty(&cfg)?);
            } else if toml {
                println!("{}", ::toml::to_string_pretty(&cfg)?);
            } else {
                println!("📋 Protoc Sandbox Configuration\n");
                println!("Paths:");
                println!("  Source: {:?}", cfg.paths.source_dir);
                println!("  Work: {:?}", cfg.paths.work_dir);
                println!("  Output: {:?}", cfg.paths.out_dir);
                println!("  Test scope: {}", cfg.test);
                println!("  Skip: {}", cfg.skip);

                println!("\nScan:");
                println!("  Dependencies: {}", cfg.scan.dependencies);
                println!("  Imports: {}", cfg.scan.imports);
                println!("  Strip options: {}", cfg.scan.strip_options.join(", "));
                for (package, globs) in &cfg.scan.include {
                    println!("  Include {}: {}", package, globs.join(", "));
                }
                for (package, globs) in &cfg.scan.exclude {
                    println!("  Exclude {}: {}", package, globs.join(", "));
                }

                println!("\nSandbox:");
                println!("  Compiler image: {:?}", cfg.sandbox.compiler_image);
                println!(
                    "  Memory pages: {}..{}",
                    cfg.sandbox.min_memory_pages, cfg.sandbox.max_memory_pages
                );
                match cfg.sandbox.fuel {
                    Some(fuel) => println!("  Fuel: {}", fuel),
                    None => println!("  Fuel: unlimited"),
                }

                println!("\nGenerators:");
                for id in &cfg.generators.enabled {
                    match cfg.generators.guests.get(id) {
                        Some(guest) => println!("  - {} (guest, args: {})", id, guest.args.join(" ")),
                        None => println!("  - {} (in-process)", id),
                    }
                }

                if cfg.descriptor_set.generate {
                    println!("\nDescriptor set: {:?}", cfg.descriptor_set_path());
                }
            }
        }

        Commands::Init { output } => {
            let cfg = CodegenConfig::default();
            cfg.save(&output)?;
            println!("✅ Created config file: {}", output);
        }

        Commands::Validate { config } => {
            match CodegenConfig::load_from(config.as_deref())
                .map_err(protoc_sandbox::CodegenError::from)
                .and_then(|cfg| cfg.validate().map(|_| cfg))
            {
                Ok(cfg) => {
                    println!("✅ Configuration is valid");
                    println!("   Source: {:?}", cfg.paths.source_dir);
                    println!("   Generators: {}", cfg.generators.enabled.join(", "));
                }
                Err(e) => {
                    eprintln!("❌ Configuration error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
