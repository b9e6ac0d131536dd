use std::process::ExitCode;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quotaflow::config::Settings;
use quotaflow::quota::CounterBackend;
use quotaflow::store::{DocumentBackend, KeyValueBackend, MemoryStore, RedisStore};
use quotaflow::{GrantOutcome, Quota, RateIdent, RateLimit, WindowIdentifier};

/// Grant, schedule and inspect quotas kept in Redis.
#[derive(Debug, Parser)]
#[command(name = "quotaflow", version, about)]
struct Cli {
    /// Configuration file (YAML); `QUOTAFLOW__*` variables override it
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Redis URL, overriding the configuration
    #[arg(long, global = true)]
    redis_url: Option<String>,

    /// Identifier prefix, overriding the configuration
    #[arg(long, global = true)]
    prefix: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Keep counters in process memory instead of Redis
    #[arg(long, global = true)]
    memory: bool,

    /// With `--memory`, store counters as namespaced documents
    #[arg(long, global = true, requires = "memory")]
    document: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consume one unit of the configured rates plus the given ones
    Grant {
        /// Rates as `key:unit:limit`
        rates: Vec<RateLimit>,
    },
    /// Like `grant`, but print when the work may run instead of failing
    Schedule {
        /// Rates as `key:unit:limit`
        rates: Vec<RateLimit>,
    },
    /// Delete current-window counters (all configured rates when none given)
    Flush {
        /// Counters as `key:unit`
        idents: Vec<RateIdent>,
    },
    /// Print current-window usage (all configured rates when none given)
    Usage {
        /// Counters as `key:unit`
        idents: Vec<RateIdent>,
    },
    /// Build or parse counter identifiers
    Identifier {
        #[command(subcommand)]
        action: IdentifierCommand,
    },
}

#[derive(Debug, Subcommand)]
enum IdentifierCommand {
    /// Identifier of the current window of `key:unit`
    Build { ident: RateIdent },
    /// Split an identifier into its parts
    Parse { identifier: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(url) = cli.redis_url {
        settings.store.redis_url = url;
    }
    if let Some(prefix) = cli.prefix {
        settings.quota.prefix = prefix;
        settings.quota.validate()?;
    }

    if let Command::Identifier { action } = &cli.command {
        let output = match action {
            IdentifierCommand::Build { ident } => {
                let id = WindowIdentifier::build(&settings.quota.prefix, ident, Utc::now());
                json!({ "identifier": id.to_string() })
            }
            IdentifierCommand::Parse { identifier } => {
                let id = WindowIdentifier::parse(identifier)?;
                json!({
                    "prefix": id.prefix,
                    "window_start": id.window_start,
                    "key": id.key,
                })
            }
        };
        println!("{}", output);
        return Ok(ExitCode::SUCCESS);
    }

    info!(
        prefix = %settings.quota.prefix,
        default_rates = settings.quota.rates.len(),
        memory = cli.memory,
        "Quota engine ready"
    );

    if cli.memory && cli.document {
        let backend = DocumentBackend::new(MemoryStore::new(), settings.store.namespace.clone());
        backend.setup(false).await?;
        run(Quota::new(backend, settings.quota)?, cli.command).await
    } else if cli.memory {
        let backend = KeyValueBackend::new(MemoryStore::new());
        run(Quota::new(backend, settings.quota)?, cli.command).await
    } else {
        let store = RedisStore::connect(&settings.store.redis_url).await?;
        run(Quota::new(KeyValueBackend::new(store), settings.quota)?, cli.command).await
    }
}

async fn run<B: CounterBackend>(quota: Quota<B>, command: Command) -> anyhow::Result<ExitCode> {
    let exit = match command {
        Command::Grant { rates } => match quota.check(&rates).await? {
            GrantOutcome::Granted => {
                println!("{}", json!({ "granted": true }));
                ExitCode::SUCCESS
            }
            GrantOutcome::Exceeded {
                limit,
                next_available,
            } => {
                println!(
                    "{}",
                    json!({
                        "granted": false,
                        "limit": limit,
                        "next_available": next_available,
                    })
                );
                ExitCode::FAILURE
            }
        },
        Command::Schedule { rates } => {
            let at = quota.schedule(&rates).await?;
            println!("{}", json!({ "at": at }));
            ExitCode::SUCCESS
        }
        Command::Flush { idents } => {
            quota.flush(&idents).await?;
            ExitCode::SUCCESS
        }
        Command::Usage { idents } => {
            let idents = if idents.is_empty() {
                quota.rates().iter().map(RateLimit::ident).collect()
            } else {
                idents
            };
            let usage = quota.usage(&idents).await?;
            let rows: Vec<_> = idents
                .iter()
                .zip(usage)
                .map(|(ident, used)| json!({ "key": ident.key, "unit": ident.unit, "used": used }))
                .collect();
            println!("{}", serde_json::Value::Array(rows));
            ExitCode::SUCCESS
        }
        Command::Identifier { .. } => ExitCode::SUCCESS,
    };

    Ok(exit)
}
