//! Arbor repository server.
//!
//! ```text
//! arbor-repository [--languages <file.json>] [--seed <chunk.json>] [bind-addr]
//! ```
//!
//! Configuration comes from `ARBOR_*` environment variables (see
//! [`ServerConfig::from_env`]); a positional bind address overrides
//! `ARBOR_BIND_ADDR`. Log verbosity is controlled by `RUST_LOG`.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use arbor_core::{Chunk, Language, LanguageRegistry};
use arbor_sync::{RepositoryServer, ServerConfig};
use clap::Parser;
use log::info;

#[derive(Debug, Parser)]
#[command(name = "arbor-repository")]
#[command(about = "Central repository for Arbor delta synchronization", long_about = None)]
struct Cli {
    /// JSON file holding a list of language definitions
    #[arg(long)]
    languages: Option<PathBuf>,

    /// Chunk whose roots become the initial partitions
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Address to bind, overriding ARBOR_BIND_ADDR
    bind_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Cli::parse();
    let mut config = ServerConfig::from_env();
    if let Some(addr) = args.bind_addr {
        config.bind_addr = addr;
    }

    let mut registry = LanguageRegistry::new();
    if let Some(path) = &args.languages {
        let languages: Vec<Language> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        for language in languages {
            registry.register(language);
        }
    }
    info!("Loaded {} language(s)", registry.len());

    let server = RepositoryServer::new(config, Arc::new(registry));
    if let Some(path) = &args.seed {
        let chunk = Chunk::from_json(&std::fs::read_to_string(path)?)?;
        server.seed(&chunk).await?;
    }

    server.run().await
}
