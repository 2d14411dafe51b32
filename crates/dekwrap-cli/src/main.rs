mod backend;
mod output;
mod provision;

use anyhow::{anyhow, Context, Result};
use clap::error::ErrorKind;
use clap::{Args, CommandFactory, Parser, Subcommand};
use dekwrap_core::crypto::KdfParams;
use dekwrap_core::{paths, Credential, EnvelopeWorkflow, Settings, SlotId, Verification, WorkflowConfig};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use crate::backend::BackendArgs;

/// Supplies the PIN when `-p` is not given.
const PIN_ENV: &str = "DEKWRAP_PIN";

const EXIT_FAILURE: u8 = 1;
const EXIT_MISMATCH: u8 = 3;

#[derive(Parser, Debug)]
#[command(author, version, about = "Wrap a DEK under a secure-element KEK and verify the stored copy", long_about = None)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Settings file (defaults to the per-user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Wrap the DEK file, store it under a label, read it back and verify
    Store(StoreArgs),
    /// Create an encrypted soft-token file, optionally with a fresh KEK
    InitSoftToken(InitArgs),
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Slot holding the KEK (defaults to the settings file)
    #[arg(short, long)]
    slot: Option<u64>,

    /// User PIN; prompted for when omitted
    #[arg(short, long)]
    pin: Option<String>,

    /// Label of the KEK
    #[arg(short, long = "kek-label")]
    kek_label: String,

    /// Label to store the wrapped DEK under
    #[arg(short, long = "dek-label")]
    dek_label: String,

    /// File holding the plaintext DEK
    #[arg(short = 'f', long = "dek-file")]
    dek_file: PathBuf,

    /// Never prompt for the PIN
    #[arg(long)]
    no_prompt: bool,

    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Args, Debug)]
struct InitArgs {
    /// Token file to create (defaults to the per-user data dir)
    #[arg(long)]
    token_file: Option<PathBuf>,

    #[arg(short, long, default_value_t = 0)]
    slot: u64,

    /// User PIN for the new token; prompted for when omitted
    #[arg(short, long)]
    pin: Option<String>,

    /// Generate a random AES-256 KEK under this label
    #[arg(long)]
    kek_label: Option<String>,

    /// Argon2id memory cost in KiB
    #[arg(long)]
    kdf_memory_kib: Option<u32>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<ExitCode> {
    let settings = load_settings(cli.config)?;
    match cli.command {
        Commands::Store(args) => store_command(args, &settings, cli.verbose > 0),
        Commands::InitSoftToken(args) => {
            init_command(args)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_settings(config: Option<PathBuf>) -> Result<Settings> {
    let path = match config {
        Some(path) => path,
        None => paths::settings_path()?,
    };
    let settings = Settings::load(&path)?;
    info!(path = %path.display(), "settings loaded");
    Ok(settings)
}

fn store_command(args: StoreArgs, settings: &Settings, verbose: bool) -> Result<ExitCode> {
    let Some(slot) = args.slot.map(SlotId).or(settings.default_slot) else {
        usage_error("a slot is required: pass --slot or set default_slot in the settings file");
    };
    let pin = match resolve_pin(args.pin, args.no_prompt, "User PIN: ")? {
        Some(pin) => pin,
        None => usage_error("a PIN is required: pass --pin, set DEKWRAP_PIN, or drop --no-prompt"),
    };
    let credential = Credential::new(pin.as_str());

    let backend = backend::resolve(&args.backend, settings)?;
    let token = backend::open(&backend)?;

    let config = WorkflowConfig::new(slot, args.kek_label, args.dek_label, args.dek_file)
        .with_search_limit(settings.search_limit);
    output::banner(&config);
    let report = EnvelopeWorkflow::new(config).run(token, &credential)?;
    output::report(&report, verbose);

    Ok(ExitCode::from(exit_status(report.verification)))
}

/// Process status for a completed run: 0 on match, `EXIT_MISMATCH` otherwise.
fn exit_status(verification: Verification) -> u8 {
    match verification {
        Verification::Match => 0,
        Verification::Mismatch => EXIT_MISMATCH,
    }
}

fn init_command(args: InitArgs) -> Result<()> {
    let path = match args.token_file {
        Some(path) => path,
        None => paths::default_token_file()?,
    };
    let Some(pin) = resolve_pin(args.pin, false, "New user PIN: ")? else {
        usage_error("a PIN is required for the new token");
    };
    let kdf = match args.kdf_memory_kib {
        Some(memory) => KdfParams::with_memory_cost(memory),
        None => KdfParams::default(),
    };
    provision::init_soft_token(&path, SlotId(args.slot), &pin, args.kek_label.as_deref(), kdf)
        .with_context(|| format!("cannot initialize soft token at {}", path.display()))?;
    println!("Soft token created at {}", path.display());
    Ok(())
}

/// Flag, then environment, then an interactive prompt if allowed.
fn resolve_pin(flag: Option<String>, no_prompt: bool, prompt: &str) -> Result<Option<Zeroizing<String>>> {
    if let Some(pin) = flag {
        return Ok(Some(Zeroizing::new(pin)));
    }
    if let Ok(pin) = std::env::var(PIN_ENV) {
        if !pin.is_empty() {
            return Ok(Some(Zeroizing::new(pin)));
        }
    }
    if no_prompt || !std::io::stdin().is_terminal() {
        return Ok(None);
    }
    let pin = rpassword::prompt_password(prompt).map_err(|e| anyhow!("PIN prompt: {e}"))?;
    Ok(Some(Zeroizing::new(pin)))
}

fn usage_error(message: &str) -> ! {
    Cli::command().error(ErrorKind::MissingRequiredArgument, message).exit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_exits_successfully() {
        assert_eq!(exit_status(Verification::Match), 0);
    }

    #[test]
    fn mismatch_has_its_own_exit_code() {
        assert_eq!(exit_status(Verification::Mismatch), 3);
        assert_ne!(exit_status(Verification::Mismatch), EXIT_FAILURE);
    }

    #[test]
    fn store_arguments_parse() {
        let cli = Cli::try_parse_from([
            "dekwrap", "store", "-s", "0", "-k", "MasterKey1", "-d", "DEK-A", "-f", "dek.bin", "--no-prompt",
        ])
        .unwrap();
        let Commands::Store(args) = cli.command else {
            panic!("expected the store subcommand");
        };
        assert_eq!(args.slot, Some(0));
        assert!(args.pin.is_none());
        assert!(args.no_prompt);
    }
}
