//! Prints the public points of the first `--count` key indices.

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::{Env, Target};
use keyring_core::{KeyIndex, KeyWindowManager};
use keyring_hardware_hal::HsmCapability;
use tpm_keyring::{dump_points, BackendKind, KeyringConfig};

#[derive(Parser)]
#[command(about = "List SEC1 public points of derived keys, one hex line per index")]
struct Cli {
    /// Number of indices to list, starting at the root (index 0)
    #[arg(long, default_value_t = 500)]
    count: KeyIndex,

    /// Window start used to initialize the keyring
    #[arg(long, default_value_t = 1)]
    start: KeyIndex,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .target(Target::Stderr)
        .init();

    let cli = Cli::parse();
    let config = KeyringConfig::load().context("loading configuration")?;

    match config.backend {
        BackendKind::Simulator => {
            let hsm = config.open_simulator().context("opening simulator")?;
            list(hsm, &cli)
        }
        BackendKind::Tpm => list_tpm(&config, &cli),
    }
}

#[cfg(feature = "tpm")]
fn list_tpm(config: &KeyringConfig, cli: &Cli) -> Result<()> {
    let hsm = keyring_hardware_hal::TpmHsm::open(config.tcti.as_deref())
        .context("opening TPM")?;
    list(hsm, cli)
}

#[cfg(not(feature = "tpm"))]
fn list_tpm(_config: &KeyringConfig, _cli: &Cli) -> Result<()> {
    bail!("TPM backend requested but this build lacks the `tpm` feature")
}

fn list<H: HsmCapability>(hsm: H, cli: &Cli) -> Result<()> {
    let mut manager = KeyWindowManager::new(hsm);
    manager
        .initialize(cli.start)
        .with_context(|| format!("initializing key window at {}", cli.start))?;

    let stdout = std::io::stdout();
    let listed = dump_points(&mut manager, 0..cli.count, &mut stdout.lock())?;
    log::info!("listed {} public points", listed);
    Ok(())
}
