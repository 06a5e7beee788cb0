//! A small CLI for exercising a [`keepcache::Cache`] against an in-memory
//! upstream, useful for poking at the disk layout and tidy behavior by hand.
//! A real deployment wires `Cache::new` to an actual remote-storage
//! [`keepcache::Gateway`] instead of [`keepcache::test_util::MemoryGateway`].

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use keepcache::{BlockWriteOptions, Cache, Config, Gateway as _};

#[derive(Parser)]
struct Opt {
    /// Cache directory to open (created if missing).
    #[arg(long, default_value = "./keepcache-demo-data")]
    dir: PathBuf,
    /// Size budget in bytes; 0 picks a dynamic default (10% of free disk
    /// space).
    #[arg(long, default_value_t = 0)]
    max_size: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a block containing the given bytes, printing the locator it
    /// was assigned.
    Put { data: String },
    /// Read back the block named by a locator and print its bytes.
    Get { locator: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    keepcache::logging::init();
    let opt = Opt::parse();

    let upstream = Arc::new(keepcache::test_util::MemoryGateway::new());
    let config = Config::new(&opt.dir).with_max_size(opt.max_size);
    let cache = Cache::new(config, upstream).await?;

    match opt.command {
        Command::Put { data } => {
            let resp = cache
                .block_write(BlockWriteOptions::from_bytes(data.into_bytes()))
                .await?;
            println!("{}", resp.locator);
        }
        Command::Get { locator } => {
            let locator = keepcache::Locator::parse(locator)?;
            let mut buf = vec![0u8; locator.size() as usize];
            let n = cache.read_at(&locator, &mut buf, 0).await?;
            print!("{}", String::from_utf8_lossy(&buf[..n]));
        }
    }

    Ok(())
}
