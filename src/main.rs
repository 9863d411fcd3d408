use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, Months, NaiveDate};
use clap::{Parser, Subcommand};
use elbakit::api::{DocumentsEndpoint, PagedEndpoint, TransactionsEndpoint};
use elbakit::browser::chrome::ChromeSession;
use elbakit::browser::BrowserSession;
use elbakit::collect::Collected;
use elbakit::config::{default_config_path, ResolvedConfig};
use elbakit::credentials::{load_credential, save_credential, Credential, TokenCache};
use elbakit::orchestrator::forget_session;
use elbakit::scrape::DocumentQuery;
use elbakit::SessionOrchestrator;
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "elbakit")]
#[command(about = "Fetch accounts, transactions and documents from Raiffeisen ELBA")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Show the browser window (overrides browser.headless)
    #[arg(long, global = true)]
    headed: bool,

    /// Write raw API payloads to the debug directory
    #[arg(long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Store the ELBA identifier and PIN
    Setup,

    /// Log in (approve in the banking app) and cache a bearer token
    Login,

    /// Forget the cached token
    Logout,

    /// List accounts, cards and depots
    Accounts,

    /// Download all transactions of one account
    Transactions {
        #[arg(long)]
        iban: String,

        /// First booking date (YYYY-MM-DD)
        #[arg(long)]
        from: NaiveDate,

        /// Last booking date (YYYY-MM-DD)
        #[arg(long)]
        until: NaiveDate,

        /// Write JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List mailbox documents
    Documents {
        /// Defaults to one year before --until
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Defaults to today
        #[arg(long)]
        until: Option<NaiveDate>,

        /// Read the list from the page instead of the API
        #[arg(long)]
        scrape: bool,

        /// Download each listed document into this directory
        #[arg(long, requires = "scrape")]
        output_dir: Option<PathBuf>,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show depot positions
    Portfolio {
        #[arg(long)]
        depot: String,

        /// Positions as of this date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Show current configuration
    Config,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,chromiumoxide=warn,chromiumoxide::conn=off,chromiumoxide::handler=off")
    });
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .init();
    } else {
        tracing_subscriber::registry().with(filter).with(layer).init();
    }
}

fn write_json<T: Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

/// Write whatever was collected, then fail if collection did not complete.
fn finish_collection<T: Serialize>(collected: &Collected<T>, output: Option<&Path>) -> Result<()> {
    write_json(&collected.items, output)?;
    if !collected.is_success() {
        anyhow::bail!(
            "Collection incomplete after {} pages ({} items): {}",
            collected.pages,
            collected.items.len(),
            collected.status
        );
    }
    Ok(())
}

async fn open_session(config: &ResolvedConfig) -> Result<SessionOrchestrator> {
    let cache = Arc::new(TokenCache::with_path(config.session_dir())?);
    let browser: Arc<dyn BrowserSession> = Arc::new(
        ChromeSession::launch(&config.browser, &config.profile_dir, &config.portal).await?,
    );
    SessionOrchestrator::new(config.clone(), config.credentials.build(), cache, browser)
}

async fn setup(config: &ResolvedConfig) -> Result<()> {
    use dialoguer::theme::ColorfulTheme;
    use dialoguer::{Input, Password};

    let store = config.credentials.build();
    if !store.supports_write() {
        anyhow::bail!(
            "Credential backend {} is read-only; set the values there instead",
            config.credentials.describe()
        );
    }

    let theme = ColorfulTheme::default();
    let identifier: String = Input::with_theme(&theme)
        .with_prompt("ELBA identifier (Verfügernummer)")
        .validate_with(|input: &String| -> Result<(), String> {
            match elbakit::auth::region_for(input) {
                Some(_) => Ok(()),
                None => Err(format!(
                    "Unknown region prefix {}",
                    elbakit::auth::region_prefix(input)
                )),
            }
        })
        .interact_text()?;
    let pin = Password::with_theme(&theme).with_prompt("PIN").interact()?;

    save_credential(store.as_ref(), &Credential::new(identifier.trim(), pin)).await?;
    println!("Credentials saved to {}", config.credentials.describe());
    Ok(())
}

async fn run(cli: Cli, mut config: ResolvedConfig) -> Result<()> {
    if cli.headed {
        config.browser.headless = false;
    }
    if cli.debug {
        config.debug = true;
    }

    let Some(command) = cli.command else {
        println!("elbakit - ELBA banking automation");
        println!("Config: {}", cli.config.display());
        println!("Data directory: {}", config.data_dir.display());
        println!("Run 'elbakit --help' for commands.");
        return Ok(());
    };

    match command {
        Command::Setup => setup(&config).await,
        Command::Config => {
            println!("Config file: {}", cli.config.display());
            println!("Data directory: {}", config.data_dir.display());
            println!("Browser profile: {}", config.profile_dir.display());
            println!("Credentials: {}", config.credentials.describe());
            let store = config.credentials.build();
            match load_credential(store.as_ref()).await? {
                Some(credential) => println!("Identifier: {}...", credential.display_prefix()),
                None => println!("Identifier: (not set)"),
            }
            let cache = TokenCache::with_path(config.session_dir())?;
            if let Some(url) = cache.read_last_url() {
                println!("Last session URL: {url}");
            }
            Ok(())
        }
        Command::Logout => {
            let cache = TokenCache::with_path(config.session_dir())?;
            if forget_session(&cache, &config.profile_dir)? {
                println!("Removed browser profile {}", config.profile_dir.display());
            }
            println!("Logged out.");
            Ok(())
        }
        command => {
            let session = open_session(&config).await?;
            let result = run_with_session(&session, &config, command).await;
            if let Err(e) = session.close().await {
                tracing::debug!(error = %e, "Browser close failed");
            }
            result
        }
    }
}

async fn run_with_session(
    session: &SessionOrchestrator,
    config: &ResolvedConfig,
    command: Command,
) -> Result<()> {
    match command {
        Command::Login => {
            if !session.authenticate().await {
                let reason = session
                    .last_failure()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                anyhow::bail!("Login failed: {reason}");
            }
            let ctx = session.resolve_session().await?;
            println!("Logged in. Token cached ({}...).", ctx.token.prefix());
        }
        Command::Accounts => {
            let accounts = session.accounts().await?;
            write_json(&accounts, None)?;
        }
        Command::Transactions {
            iban,
            from,
            until,
            output,
        } => {
            let endpoint: Arc<dyn PagedEndpoint> = Arc::new(TransactionsEndpoint::new(
                iban,
                from,
                until,
                config.collector.transactions_page_size,
            ));
            let collected = session.fetch_all(endpoint).await?;
            finish_collection(&collected, output.as_deref())?;
        }
        Command::Documents {
            from,
            until,
            scrape,
            output_dir,
            output,
        } => {
            let until = until.unwrap_or_else(|| Local::now().date_naive());
            let from = from
                .or_else(|| until.checked_sub_months(Months::new(12)))
                .unwrap_or(until);
            if scrape {
                let query = DocumentQuery {
                    from: Some(from),
                    until: Some(until),
                    download_dir: output_dir,
                };
                let collected = session.documents_via_ui(&query).await?;
                finish_collection(&collected, output.as_deref())?;
            } else {
                let endpoint: Arc<dyn PagedEndpoint> = Arc::new(DocumentsEndpoint::new(
                    from,
                    until,
                    config.collector.documents_page_size,
                ));
                let collected = session.fetch_all(endpoint).await?;
                finish_collection(&collected, output.as_deref())?;
            }
        }
        Command::Portfolio { depot, date } => {
            let positions = session.portfolio(&depot, date).await?;
            write_json(&positions, None)?;
        }
        Command::Setup | Command::Logout | Command::Config => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = ResolvedConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config: {}", cli.config.display()))?;

    run(cli, config).await
}
