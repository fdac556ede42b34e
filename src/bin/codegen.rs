//! Protoc Sandbox CLI
//!
//! Runs the sandboxed code generation pipeline, or prints the resolved
//! import graph of the schemas it would compile.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use petgraph::dot::{Config as DotConfig, Dot};
use protoc_sandbox::{CodegenConfig, Coordinate, PackageContent, Pipeline, ResolvedPackage};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "protoc-sandbox")]
#[command(about = "Compile protobuf schemas in a WebAssembly sandbox and run code generators")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate code for all collected schemas
    Generate {
        #[command(flatten)]
        run: RunArgs,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the resolved import graph in DOT format
    Graph {
        #[command(flatten)]
        run: RunArgs,

        /// DOT output file (defaults to stdout)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Config file to load (optional)
    #[arg(short, long)]
    config: Option<String>,

    /// Primary schema source directory
    #[arg(short, long)]
    source: Option<PathBuf>,

    /// Output directory for generated files
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Work directory for extracted dependency schemas
    #[arg(short, long)]
    work: Option<PathBuf>,

    /// Resolved dependency package as COORDINATE=PATH (directory, .zip or .jar)
    #[arg(short, long = "package", value_parser = parse_package)]
    packages: Vec<ResolvedPackage>,

    /// Test scope: skip dependency scanning
    #[arg(long)]
    test: bool,
}

impl RunArgs {
    fn load(&self) -> Result<CodegenConfig, Box<dyn std::error::Error>> {
        let mut config = CodegenConfig::load_from(self.config.as_deref())?;
        if let Some(source) = &self.source {
            config.paths.source_dir = source.clone();
        }
        if let Some(out) = &self.out {
            config.paths.out_dir = out.clone();
        }
        if let Some(work) = &self.work {
            config.paths.work_dir = work.clone();
        }
        if self.test {
            config.test = true;
        }
        Ok(config)
    }
}

fn parse_package(value: &str) -> Result<ResolvedPackage, String> {
    let (coordinate, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected COORDINATE=PATH, got '{}'", value))?;
    let coordinate = Coordinate::parse(coordinate)
        .ok_or_else(|| format!("invalid coordinate '{}', expected group:artifact[:version[:classifier]]", coordinate))?;
    let path = PathBuf::from(path);
    let content = if path.is_dir() {
        PackageContent::Directory(path)
    } else {
        PackageContent::Archive(path)
    };
    Ok(ResolvedPackage::new(coordinate, content))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Generate { run: args, json } => {
            let config = args.load()?;
            let report = Pipeline::new(config).with_packages(args.packages).execute()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            if !report.processed {
                println!("Nothing to do");
                return Ok(());
            }

            println!("✅ Generated {} files", report.written.len());
            println!("   Roots: {}", report.roots.join(", "));
            println!("   Descriptors: {}", report.request_files);
            if let Some(path) = &report.descriptor_set {
                println!("   Descriptor set: {:?}", path);
            }
            if !report.diagnostics.is_empty() {
                println!();
                print!("{}", report.diagnostics);
            }
        }

        Commands::Graph { run: args, output } => {
            let config = args.load()?;
            let Some(prepared) = Pipeline::new(config).with_packages(args.packages).prepare()? else {
                eprintln!("No schema files found");
                return Ok(());
            };

            let mut compiler = prepared.compiler()?;
            let request = prepared.resolve(&mut compiler)?;
            let graph = request.dependency_graph();
            let dot = format!("{:?}", Dot::with_config(&graph, &[DotConfig::EdgeNoLabel]));

            match output {
                Some(path) => {
                    std::fs::write(&path, &dot)?;
                    println!("✅ Exported DOT to: {:?}", path);
                }
                None => println!("{}", dot),
            }
        }
    }

    Ok(())
}
