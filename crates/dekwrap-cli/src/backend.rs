use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use dekwrap_core::{paths, Backend, Settings, SoftToken, Token};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    Soft,
    Pkcs11,
}

#[derive(Args, Debug)]
pub struct BackendArgs {
    /// Secure element backend (defaults to the settings file)
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Soft-token file
    #[arg(long)]
    pub token_file: Option<PathBuf>,

    /// PKCS#11 module to load
    #[arg(long)]
    pub module: Option<PathBuf>,
}

/// Flags win over the settings file; a lone --module or --token-file picks its backend.
pub fn resolve(args: &BackendArgs, settings: &Settings) -> Result<Backend> {
    let kind = match args.backend {
        Some(kind) => kind,
        None if args.module.is_some() => BackendKind::Pkcs11,
        None if args.token_file.is_some() => BackendKind::Soft,
        None => return Ok(settings.backend.clone()),
    };
    let backend = match kind {
        BackendKind::Soft => Backend::Soft {
            token_file: args.token_file.clone().or_else(|| match &settings.backend {
                Backend::Soft { token_file } => token_file.clone(),
                Backend::Pkcs11 { .. } => None,
            }),
        },
        BackendKind::Pkcs11 => {
            let module = args
                .module
                .clone()
                .or_else(|| match &settings.backend {
                    Backend::Pkcs11 { module } => Some(module.clone()),
                    Backend::Soft { .. } => None,
                })
                .context("the pkcs11 backend needs --module or a module in the settings file")?;
            Backend::Pkcs11 { module }
        }
    };
    Ok(backend)
}

pub fn open(backend: &Backend) -> Result<Box<dyn Token>> {
    match backend {
        Backend::Soft { token_file } => {
            let path = match token_file {
                Some(path) => path.clone(),
                None => paths::default_token_file()?,
            };
            let token = SoftToken::open_file(&path)
                .with_context(|| format!("cannot open soft token {}", path.display()))?;
            info!(path = %path.display(), "soft token opened");
            Ok(Box::new(token))
        }
        Backend::Pkcs11 { module } => open_pkcs11(module),
    }
}

#[cfg(feature = "pkcs11")]
fn open_pkcs11(module: &std::path::Path) -> Result<Box<dyn Token>> {
    info!(module = %module.display(), "using PKCS#11 module");
    Ok(Box::new(dekwrap_core::token::Pkcs11Token::new(module)))
}

#[cfg(not(feature = "pkcs11"))]
fn open_pkcs11(module: &std::path::Path) -> Result<Box<dyn Token>> {
    anyhow::bail!(
        "cannot load {}: built without PKCS#11 support (enable the pkcs11 feature)",
        module.display()
    )
}
