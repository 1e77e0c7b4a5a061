use anyhow::{bail, Context, Result};
use env_logger::{Env, Target};
use keyring_core::SharedKeyring;
use keyring_hardware_hal::HsmCapability;
use tpm_keyring::{serve, window_report, BackendKind, Dispatcher, KeyringConfig, ServeOutcome};

fn main() -> Result<()> {
    // stdout carries frames; logs go to stderr.
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(Target::Stderr)
        .init();

    let config = KeyringConfig::load().context("loading configuration")?;
    log::info!("keyring port starting with {:?} backend", config.backend);

    match config.backend {
        BackendKind::Simulator => {
            let hsm = config.open_simulator().context("opening simulator")?;
            run(hsm, &config)
        }
        BackendKind::Tpm => run_tpm(&config),
    }
}

#[cfg(feature = "tpm")]
fn run_tpm(config: &KeyringConfig) -> Result<()> {
    let hsm = keyring_hardware_hal::TpmHsm::open(config.tcti.as_deref())
        .context("opening TPM")?;
    run(hsm, config)
}

#[cfg(not(feature = "tpm"))]
fn run_tpm(_config: &KeyringConfig) -> Result<()> {
    bail!("TPM backend requested but this build lacks the `tpm` feature")
}

fn run<H: HsmCapability>(hsm: H, config: &KeyringConfig) -> Result<()> {
    let info = serde_json::to_string(&hsm.info()).context("describing backend")?;
    log::info!("backend {}", info);

    let keyring = SharedKeyring::new(hsm);
    if config.initialize_on_start {
        keyring
            .initialize(config.start_index)
            .with_context(|| format!("initializing key window at {}", config.start_index))?;
        log::info!("window {}", window_report(&keyring.state()));
    }

    let dispatcher = Dispatcher::new(keyring);
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let outcome = serve(&dispatcher, &mut stdin.lock(), &mut stdout.lock())
        .context("serving requests")?;

    match outcome {
        ServeOutcome::EndOfInput => Ok(()),
        ServeOutcome::Fatal => bail!("keyring entered a fatal state"),
    }
}
