mod interactive;
mod prompt;

use anyhow::{Context, Result};
use clap::Parser;
use fieldsync::{DEFAULT_FIELD, SyncConfig, SyncEngine};
use fieldsync_odoo::{OdooClient, OdooConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use crate::interactive::Target;
use crate::prompt::{PromptExtension, Prompter};

#[derive(Parser, Debug)]
#[command(name = "fieldsync", version)]
#[command(about = "Edit an Odoo record field in your editor; every save is pushed back")]
struct Cli {
    /// Server URL, without the port
    #[arg(long)]
    url: Option<String>,

    /// Server port
    #[arg(long)]
    port: Option<u16>,

    /// Database name
    #[arg(long)]
    db: Option<String>,

    /// Login
    #[arg(short, long)]
    username: Option<String>,

    /// Password
    #[arg(long)]
    password: Option<String>,

    /// Don't ask for connection details; use flags and defaults
    #[arg(short, long)]
    yes: bool,

    /// Record URL as copied from the browser (e.g. .../web#id=288&model=ir.ui.view)
    #[arg(short, long)]
    locator: Option<String>,

    /// Field to edit [default: arch_base]
    #[arg(short, long)]
    field: Option<String>,

    /// Scratch file extension when the record doesn't declare one
    #[arg(long)]
    ext: Option<String>,

    /// Directory for scratch files (default: a temporary directory)
    #[arg(long)]
    dir: Option<PathBuf>,
}

impl Cli {
    /// Connection settings from flags, falling back to the usual local defaults.
    fn odoo_config(&self) -> OdooConfig {
        let defaults = OdooConfig::default();
        OdooConfig {
            base_url: self.url.clone().unwrap_or(defaults.base_url),
            port: self.port.or(defaults.port),
            db: self.db.clone().unwrap_or(defaults.db),
            username: self.username.clone().unwrap_or(defaults.username),
            password: self.password.clone().unwrap_or(defaults.password),
        }
    }

    fn sync_config(&self) -> SyncConfig {
        let config = SyncConfig::new();
        match &self.dir {
            Some(dir) => config.with_scratch_root(dir),
            None => config,
        }
    }
}

/// Asks for every connection setting not given as a flag, unless `--yes`.
async fn ask_connection(cli: &Cli, prompter: &Mutex<Prompter>) -> Result<OdooConfig> {
    let mut config = cli.odoo_config();
    if cli.yes {
        return Ok(config);
    }
    let mut prompter = prompter.lock().await;

    if cli.url.is_none() {
        config.base_url = prompter.ask("Server URL", Some(&config.base_url)).await?;
    }
    if cli.port.is_none() {
        let default = config.port.map(|p| p.to_string()).unwrap_or_default();
        config.port = loop {
            let answer = prompter.ask("Port", Some(&default)).await?;
            match answer.parse::<u16>() {
                Ok(port) => break Some(port),
                Err(_) => prompter.say(&format!("{:?} is not a port number", answer))?,
            }
        };
    }
    if cli.db.is_none() {
        config.db = prompter.ask("Database", Some(&config.db)).await?;
    }
    if cli.username.is_none() {
        config.username = prompter.ask("Username", Some(&config.username)).await?;
    }
    if cli.password.is_none() {
        config.password = prompter.ask("Password", Some(&config.password)).await?;
    }
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("could not start the async runtime")?;
    let result = runtime.block_on(start(cli));
    // A stdin read still pending after a signal cannot be cancelled; waiting
    // for it would hang until the next line is typed.
    runtime.shutdown_background();
    result
}

async fn start(cli: Cli) -> Result<()> {
    let prompter = Arc::new(Mutex::new(Prompter::stdio()));

    let odoo = ask_connection(&cli, &prompter).await?;
    let client = OdooClient::connect(&odoo).await.with_context(|| {
        format!(
            "could not connect to {} (port {}, database {:?}, user {:?})",
            odoo.base_url,
            odoo.port.map_or_else(|| "default".to_string(), |p| p.to_string()),
            odoo.db,
            odoo.username
        )
    })?;
    tracing::info!(uid = client.uid(), endpoint = %client.endpoint(), "logged in");

    let extensions = PromptExtension::new(prompter.clone(), cli.ext.clone());
    let engine = SyncEngine::new(Arc::new(client), Arc::new(extensions), cli.sync_config())
        .context("could not prepare the scratch directory")?;

    let first = Target {
        locator: cli.locator.clone(),
        field: cli
            .field
            .clone()
            .or_else(|| cli.yes.then(|| DEFAULT_FIELD.to_string())),
    };
    interactive::run(engine, prompter, first).await
}
