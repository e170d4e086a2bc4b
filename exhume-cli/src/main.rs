use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Password;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{fmt, EnvFilter};

use exhume_core::info::DeviceInfo;
use exhume_core::{ExtractOptions, Layout, Progress};

mod backups;
mod config;
mod output;

#[derive(Parser)]
#[command(name = "exhume")]
#[command(about = "Decrypt and extract encrypted iOS device backups")]
#[command(version)]
struct Cli {
    /// Backup directory (interactive selection when omitted)
    #[arg(short, long)]
    backup: Option<PathBuf>,

    /// Backup decryption password (prompted when omitted)
    #[arg(short, long, env = "EXHUME_PASSWORD")]
    password: Option<String>,

    /// Output directory root
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Extract only the first file whose relative path contains this substring
    #[arg(short, long)]
    file: Option<String>,

    /// Recreate the original domain/relative-path layout instead of flat output
    #[arg(short, long)]
    relative: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

struct Spinner {
    bar: ProgressBar,
}

impl Spinner {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(ProgressStyle::default_spinner());
        bar.set_message("Decrypting...");
        Self { bar }
    }
}

impl Progress for Spinner {
    fn file_written(&self, relative_path: &str) {
        self.bar.set_message(format!("Decrypting {relative_path}"));
        self.bar.tick();
    }
}

fn main() {
    if let Err(err) = run() {
        output::print_error(format!("{err:#}"));
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("exhume_core=debug,exhume=debug"))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("exhume_core=warn,exhume=warn"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    let backup_path = match cli.backup {
        Some(path) => {
            anyhow::ensure!(
                path.is_dir(),
                "backup folder does not exist: {}",
                path.display()
            );
            path
        }
        None => {
            let root = backups::default_backup_root()?;
            backups::select_backup(&root)?
        }
    };

    let device = match DeviceInfo::from_backup_dir(&backup_path) {
        Ok(device) => device,
        Err(err) => {
            eprintln!("Warning: couldn't read Info.plist: {err}");
            None
        }
    };
    let config = config::Config::load()?;
    let out_dir = backups::output_directory(
        cli.output.as_deref(),
        config.output_path.as_deref(),
        &backup_path,
        device.as_ref(),
    )?;

    let password = match cli.password {
        Some(password) => password,
        None => Password::new().with_prompt("Backup password").interact()?,
    };

    let options = ExtractOptions {
        filter: cli.file,
        layout: if cli.relative {
            Layout::Preserve
        } else {
            Layout::Flat
        },
        ..Default::default()
    };

    let spinner = Spinner::new();
    let summary = exhume_core::extract(&backup_path, &password, &out_dir, &options, &spinner)
        .with_context(|| format!("extraction failed for {}", backup_path.display()))?;
    spinner.bar.finish_and_clear();

    output::print_success(format!(
        "Extraction complete: {} decrypted, {} copied unencrypted, {} skipped → {}",
        summary.written,
        summary.unencrypted,
        summary.skipped,
        out_dir.display()
    ));
    Ok(())
}
