//! Main entry point for the routewise service.
//!
//! Responsibilities:
//! - Handle basic CLI flags (`--help`, `--version`).
//! - Initialize logging and tracing.
//! - Load application configuration.
//! - Establish shared infrastructure (database, registry, gate).
//! - Either start the Axum web server, or run a one-shot CLI command.

use std::{collections::HashMap, net::SocketAddr, path::PathBuf, process, sync::Arc};

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use routewise::{
    api::RouterApi,
    audit::AuditStore,
    capability::CapabilityEngine,
    config,
    credentials::CredentialStore,
    database::{self, DbPool},
    error::AppError,
    executor::{EchoAdapterFactory, Executor, JobLedgerStore},
    gate::KeyStore,
    metrics::{DbMetricsSink, MetricsStore},
    models::{Constraints, Request},
    registry::{parse_csv_catalogue, ProviderRegistry, ProviderRegistryStore, StaticSource},
    routes,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

enum CliCommand {
    Run,
    Help,
    Version,
    Init,
    Submit(SubmitOptions),
    ListProviders,
    ReloadProviders(PathBuf),
    CreateKey(String),
    SetCredential(String),
}

#[derive(Default, Clone, Debug)]
struct SubmitOptions {
    prompt: Option<String>,
    prompt_file: Option<PathBuf>,
    task_type: Option<String>,
    max_cost: Option<f64>,
}

#[tokio::main]
async fn main() {
    let command = match parse_cli_command() {
        Ok(cmd) => cmd,
        Err(err) => {
            eprintln!("routewise: {err}");
            print_help();
            process::exit(2);
        }
    };

    match command {
        CliCommand::Help => {
            print_help();
            return;
        }
        CliCommand::Version => {
            print_version();
            return;
        }
        CliCommand::Init => {
            if let Err(err) = handle_init().await {
                eprintln!("routewise: {err}");
                process::exit(1);
            }
            return;
        }
        _ => {}
    }

    let config = match config::AppConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("routewise: configuration error: {err}");
            process::exit(1);
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "routewise=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let db_pool = match database::init_db(&config.database.url).await {
        Ok(pool) => Arc::new(pool),
        Err(err) => {
            error!(error = %err, "failed to connect to database");
            eprintln!("routewise: database connection failed: {err}");
            process::exit(1);
        }
    };

    if let Err(err) = database::ensure_schema(db_pool.as_ref()).await {
        error!(error = %err, "failed to ensure database schema");
        eprintln!("routewise: database schema error: {err}");
        process::exit(1);
    }

    let credential_store = match CredentialStore::new(Arc::clone(&db_pool)).await {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, "failed to initialise credential store");
            eprintln!("routewise: credential store error: {err}");
            process::exit(1);
        }
    };

    let registry_store = Arc::new(ProviderRegistryStore::new(Arc::clone(&db_pool)));
    let registry = Arc::new(ProviderRegistry::with_store(Arc::clone(&registry_store)));
    match registry.hydrate_from_store().await {
        Ok(true) => info!("rehydrated provider catalogue from persisted store"),
        Ok(false) => {}
        Err(err) => error!(error = %err, "failed to rehydrate provider catalogue from store"),
    }
    if let Some(path) = &config.catalogue.path {
        match std::fs::read_to_string(path) {
            Ok(contents) => match parse_csv_catalogue(&contents) {
                Ok(providers) => {
                    if let Err(err) = registry.reload(&StaticSource(providers)).await {
                        error!(error = %err, "failed to load provider catalogue");
                    }
                }
                Err(err) => error!(error = %err, "failed to parse provider catalogue"),
            },
            Err(err) => error!(error = %err, path = %path.display(), "failed to read catalogue file"),
        }
    }

    let capability_engine = Arc::new(CapabilityEngine::new());
    let metrics = Arc::new(MetricsStore::new());
    if let Err(err) = metrics.hydrate(&db_pool).await {
        error!(error = %err, "failed to hydrate provider metrics from store");
    }
    let audit = Arc::new(AuditStore::new(Arc::clone(&db_pool)));
    let keys = match load_key_store(Arc::clone(&db_pool)).await {
        Ok(store) => store,
        Err(err) => {
            eprintln!("routewise: key store error: {err}");
            process::exit(1);
        }
    };

    let executor = Arc::new(Executor::with_weights(
        Arc::clone(&registry),
        Arc::clone(&capability_engine),
        Arc::clone(&metrics),
        Arc::new(EchoAdapterFactory),
        config.routing.max_workers,
        config.routing.selector_weights(),
    ));

    let shutdown = CancellationToken::new();
    let _metrics_flush = metrics.clone().spawn_flush_loop(
        Arc::new(DbMetricsSink::new(Arc::clone(&db_pool))),
        config.routing.metrics_flush_period(),
        shutdown.clone(),
    );
    let _key_maintenance = keys.clone().spawn_maintenance(shutdown.clone());
    let ledger = Arc::new(JobLedgerStore::new(Arc::clone(&db_pool)));

    match command {
        CliCommand::Submit(options) => {
            if let Err(err) = handle_submit(options, &executor, &keys, &audit).await {
                eprintln!("routewise: {err}");
                process::exit(1);
            }
        }
        CliCommand::ListProviders => {
            for provider in registry.list() {
                println!("{}\t{:?}\t{}", provider.name, provider.tier, provider.endpoint);
            }
        }
        CliCommand::ReloadProviders(path) => match std::fs::read_to_string(&path) {
            Ok(contents) => match parse_csv_catalogue(&contents) {
                Ok(providers) => {
                    let count = providers.len();
                    if let Err(err) = registry.reload(&StaticSource(providers)).await {
                        eprintln!("routewise: reload rejected: {err}");
                        process::exit(1);
                    }
                    println!("reloaded {count} providers");
                }
                Err(err) => {
                    eprintln!("routewise: {err}");
                    process::exit(1);
                }
            },
            Err(err) => {
                eprintln!("routewise: failed to read {}: {err}", path.display());
                process::exit(1);
            }
        },
        CliCommand::CreateKey(owner) => match keys.create_key(&owner).await {
            Ok((secret, key)) => {
                println!("id: {}", key.id);
                println!("secret: {secret}");
            }
            Err(err) => {
                eprintln!("routewise: {err}");
                process::exit(1);
            }
        },
        CliCommand::SetCredential(reference) => {
            if let Err(err) = handle_set_credential(&reference, &credential_store).await {
                eprintln!("routewise: {err}");
                process::exit(1);
            }
        }
        CliCommand::Run => {
            info!("starting routewise server");
            let api = RouterApi::new(
                Arc::clone(&executor),
                Arc::clone(&registry),
                Arc::clone(&keys),
                Arc::clone(&audit),
                ledger,
            );
            let app = routes::api_router(api);

            let addr_str = format!("{}:{}", config.server.host, config.server.port);
            let addr: SocketAddr = addr_str.parse().expect("invalid server address format");

            let listener = match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!(error = %err, "failed to bind TCP listener");
                    eprintln!("routewise: cannot bind to {addr} ({err})");
                    process::exit(1);
                }
            };

            info!("server listening on {addr}");
            axum::serve(listener, app).await.expect("server crashed");
        }
        CliCommand::Help | CliCommand::Version | CliCommand::Init => unreachable!(),
    }

    shutdown.cancel();
}

async fn load_key_store(pool: Arc<DbPool>) -> Result<Arc<KeyStore>, AppError> {
    let store = KeyStore::new(pool);
    store.load().await?;
    Ok(Arc::new(store))
}

async fn handle_submit(
    options: SubmitOptions,
    executor: &Executor,
    keys: &KeyStore,
    audit: &AuditStore,
) -> Result<(), AppError> {
    let prompt = match (options.prompt, options.prompt_file) {
        (Some(prompt), _) => prompt,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .map_err(|err| AppError::Internal(format!("failed to read prompt file: {err}")))?,
        (None, None) => {
            return Err(AppError::Internal(
                "submit requires --prompt or --prompt-file".into(),
            ))
        }
    };

    // The CLI path runs against an operator key minted ad hoc for local use.
    let (secret, key) = keys.create_key("cli").await?;
    let task_type_hint = options.task_type.as_deref().and_then(parse_task_type);

    let request = Request {
        id: Uuid::new_v4(),
        caller_key: key.id.clone(),
        prompt,
        context: HashMap::new(),
        constraints: Constraints {
            max_cost: options.max_cost,
            task_type_hint,
            ..Constraints::default()
        },
    };

    let validated = keys.validate(&secret, None, None, audit).await?;
    let caller = validated.constraints();
    let plan = executor.build_plan(&request, &caller).await?;
    let report = executor.execute(plan, &request, caller, CancellationToken::new()).await?;

    println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
    Ok(())
}

async fn handle_set_credential(
    reference: &str,
    credential_store: &CredentialStore,
) -> Result<(), AppError> {
    let secret = rpassword::prompt_password(format!("secret for {reference}: "))
        .map_err(|err| AppError::Internal(format!("failed to read secret: {err}")))?;
    if secret.is_empty() {
        return Err(AppError::Internal("secret must not be empty".into()));
    }
    credential_store.set(reference, &secret).await?;
    println!("stored credential for {reference}");
    Ok(())
}

async fn handle_init() -> Result<(), AppError> {
    let config = config::AppConfig::load().unwrap_or_else(|_| {
        eprintln!("routewise: no configuration found yet; proceeding with defaults");
        process::exit(1);
    });
    let pool = database::init_db(&config.database.url).await?;
    database::ensure_schema(&pool).await?;
    let _ = CredentialStore::new(Arc::new(pool)).await?;
    println!("initialised routewise at {}", config.database.url);
    Ok(())
}

fn parse_cli_command() -> Result<CliCommand, String> {
    let mut args = std::env::args().skip(1);
    let Some(first) = args.next() else {
        return Ok(CliCommand::Run);
    };

    match first.as_str() {
        "-h" | "--help" | "help" => Ok(CliCommand::Help),
        "-V" | "--version" | "version" => Ok(CliCommand::Version),
        "init" => Ok(CliCommand::Init),
        "run" | "serve" => Ok(CliCommand::Run),
        "submit" => {
            let mut options = SubmitOptions::default();
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--prompt" => options.prompt = args.next(),
                    "--prompt-file" => options.prompt_file = args.next().map(PathBuf::from),
                    "--task-type" => options.task_type = args.next(),
                    "--max-cost" => {
                        options.max_cost = args.next().and_then(|v| v.parse().ok());
                    }
                    other => return Err(format!("unrecognised submit flag: {other}")),
                }
            }
            Ok(CliCommand::Submit(options))
        }
        "providers" => match args.next().as_deref() {
            Some("list") | None => Ok(CliCommand::ListProviders),
            Some("reload") => {
                let path = args.next().ok_or("providers reload requires a CSV path")?;
                Ok(CliCommand::ReloadProviders(PathBuf::from(path)))
            }
            Some(other) => Err(format!("unrecognised providers subcommand: {other}")),
        },
        "keys" => match args.next().as_deref() {
            Some("create") => {
                let owner = args.next().ok_or("keys create requires an owner")?;
                Ok(CliCommand::CreateKey(owner))
            }
            Some(other) => Err(format!("unrecognised keys subcommand: {other}")),
            None => Err("keys requires a subcommand (create)".into()),
        },
        "credentials" => match args.next().as_deref() {
            Some("set") => {
                let reference = args.next().ok_or("credentials set requires a reference")?;
                Ok(CliCommand::SetCredential(reference))
            }
            Some(other) => Err(format!("unrecognised credentials subcommand: {other}")),
            None => Err("credentials requires a subcommand (set)".into()),
        },
        other => Err(format!("unrecognised command: {other}")),
    }
}

fn parse_task_type(value: &str) -> Option<routewise::models::TaskType> {
    use routewise::models::TaskType;
    match value.to_lowercase().as_str() {
        "text" => Some(TaskType::Text),
        "image" => Some(TaskType::Image),
        "code" => Some(TaskType::Code),
        "audio" => Some(TaskType::Audio),
        "video" => Some(TaskType::Video),
        "multimodal" => Some(TaskType::Multimodal),
        _ => None,
    }
}

fn print_help() {
    println!(
        "routewise — cost-optimizing router for upstream generative-AI providers\n\n\
         USAGE:\n    \
         routewise [COMMAND]\n\n\
         COMMANDS:\n    \
         run                          Start the HTTP server (default)\n    \
         init                         Initialise the database and secret key\n    \
         submit --prompt <TEXT>       Classify, select, and dispatch one request\n    \
         providers list               List the current provider catalogue\n    \
         providers reload <CSV>       Reload the catalogue from a CSV file\n    \
         keys create <OWNER>          Mint a new API key for OWNER\n    \
         credentials set <REF>        Store a provider secret (masked prompt)\n    \
         help, -h, --help             Show this message\n    \
         version, -V, --version       Show the version\n"
    );
}

fn print_version() {
    println!("routewise {}", env!("CARGO_PKG_VERSION"));
}
