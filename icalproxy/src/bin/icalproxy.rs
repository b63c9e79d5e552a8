// Copyright (C) 2025 icalproxy contributors
//
// This file is part of icalproxy.
//
// icalproxy is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// icalproxy is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with icalproxy.  If not,
// see <http://www.gnu.org/licenses/>.

//! # icalproxy
//!
//! Process entry point. The interesting logic all lives in the library; this binary parses the
//! (deliberately tiny) command line, wires configuration from the environment, sets up logging &
//! telemetry, and runs one of:
//!
//! - `server` -- migrate the schema, then serve the cache with the refresher & notifier attached
//! - `db migrate` / `db reset` -- schema management
//! - `dev create-bucket` -- create the configured object-store bucket for local development
//!
//! icalproxy runs in the foreground and logs to stdout/stderr; it's built to live in a container
//! or on a PaaS, where daemonization would just fight the supervisor.

use std::{env, fmt::Display, str::FromStr, sync::Arc, time::Duration};

use clap::{Arg, ArgAction, Command, crate_version, value_parser};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use snafu::{ResultExt, Snafu};
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info};
use tracing_subscriber::{Layer, Registry, filter::EnvFilter, fmt, layer::SubscriberExt};

use icalproxy::{
    bodystore::{self, S3Storage},
    config::Config,
    icalproxy::IcalProxy,
    metrics::Instruments,
    notifier::{self, Notifier},
    postgres::PgStore,
    refresher::{self, Refresher},
    scheduler, server,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     application Error type                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// `main()` returns `Result<(), Error>`; the Rust runtime renders the `Err` variant through
/// `Debug`, so `Debug` is implemented by hand to produce the readable `Display` form instead of
/// the derived tree. (Exiting through `std::process::exit` instead would skip destructors.)
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to port {port}: {source}"))]
    Bind { port: u16, source: std::io::Error },
    #[snafu(display("Failed to create the bucket: {source}"))]
    Bucket { source: bodystore::Error },
    #[snafu(display("Failed to load configuration: {source}"))]
    Config { source: icalproxy::config::Error },
    #[snafu(display("Database error: {source}"))]
    Db { source: icalproxy::postgres::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("While building the OTLP exporter, {source}"))]
    OtlpExporter {
        source: opentelemetry_otlp::ExporterBuildError,
    },
    #[snafu(display("The server exited abnormally: {source}"))]
    Serve { source: std::io::Error },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      logging & telemetry                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn configure_logging(cfg: &Config) -> Result<()> {
    let level = Level::from_str(&cfg.log_level).unwrap_or(Level::INFO);
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()
        .context(EnvFilterSnafu)?;
    // `json()` & `compact()` produce differently-typed layers; boxing is what lets one binding
    // serve both branches.
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if cfg.log_format == "json" {
        Box::new(fmt::Layer::default().json().with_current_span(true))
    } else {
        Box::new(fmt::Layer::default().compact())
    };
    tracing::subscriber::set_global_default(Registry::default().with(formatter).with(filter))
        .context(SubscriberSnafu)
}

/// Install the global meter provider. With `OTEL_EXPORTER_OTLP_ENDPOINT` set, metrics are pushed
/// there periodically; without it the instruments still exist (and stay cheap), there's just no
/// reader draining them.
fn init_telemetry() -> Result<()> {
    let mut provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder().with_resource(
        opentelemetry_sdk::Resource::builder_empty()
            .with_attribute(KeyValue::new("service.name", "icalproxy"))
            .build(),
    );
    if let Ok(endpoint) = env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        if !endpoint.is_empty() {
            let exporter = opentelemetry_otlp::MetricExporter::builder()
                .with_http()
                .with_endpoint(&endpoint)
                .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
                .build()
                .context(OtlpExporterSnafu)?;
            provider = provider
                .with_reader(opentelemetry_sdk::metrics::PeriodicReader::builder(exporter).build());
        }
    }
    global::set_meter_provider(provider.build());
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM; shutting down."),
        _ = sigint.recv() => info!("Received SIGINT; shutting down."),
    }
}

async fn await_scheduler(name: &str, handle: JoinHandle<()>) {
    if let Err(err) = tokio::time::timeout(Duration::from_secs(5), handle).await {
        error!(scheduler = name, error = %err, "scheduler_shutdown_timeout");
    }
}

async fn serve(cfg: Config) -> Result<()> {
    let cfg = Arc::new(cfg);
    let store = Arc::new(PgStore::connect(&cfg).context(DbSnafu)?);
    store.migrate().await.context(DbSnafu)?;
    let bodies: Arc<dyn bodystore::Backend + Send + Sync> = Arc::new(S3Storage::new(&cfg).await);
    let client = reqwest::Client::new();
    let instruments = Arc::new(Instruments::new("icalproxy"));

    let state = Arc::new(IcalProxy {
        config: cfg.clone(),
        storage: store.clone(),
        bodies: bodies.clone(),
        client: client.clone(),
        instruments: instruments.clone(),
    });
    let mut router = server::make_router(state);
    if cfg.http_request_timeout > 0 {
        router = router.layer(tower_http::timeout::TimeoutLayer::new(Duration::from_secs(
            cfg.http_request_timeout,
        )));
    }

    // The schedulers share one cancellation token with the server's shutdown: when the listener
    // winds down, in-flight refresh transactions roll back & their origin fetches abort.
    let token = CancellationToken::new();
    let refresher_handle = scheduler::start(
        Refresher::new(
            store.clone(),
            bodies.clone(),
            client.clone(),
            cfg.clone(),
            instruments.clone(),
        ),
        refresher::INTERVAL,
        token.clone(),
        instruments.clone(),
    );
    let notifier_handle = if cfg.webhook_configured() {
        Some(scheduler::start(
            Notifier::new(store.clone(), client.clone(), cfg.clone(), instruments.clone()),
            notifier::INTERVAL,
            token.clone(),
            instruments.clone(),
        ))
    } else {
        info!("notifier_scheduler_webhook_not_configured");
        None
    };

    let listener = TcpListener::bind(("0.0.0.0", cfg.port))
        .await
        .context(BindSnafu { port: cfg.port })?;
    info!(port = cfg.port, "server_listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context(ServeSnafu)?;

    token.cancel();
    await_scheduler("refresher", refresher_handle).await;
    if let Some(handle) = notifier_handle {
        await_scheduler("notifier", handle).await;
    }
    info!("server_stopped");
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn run(matches: clap::ArgMatches) -> Result<()> {
    let mut cfg = Config::load().context(ConfigSnafu)?;
    if matches.get_flag("debug") {
        cfg.debug = true;
        cfg.log_level = "debug".to_owned();
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        cfg.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        cfg.log_format = format.clone();
    }
    configure_logging(&cfg)?;
    init_telemetry()?;
    info!(
        version = crate_version!(),
        command = matches.subcommand_name().unwrap_or(""),
        process_pid = std::process::id(),
        "cli_started"
    );

    match matches.subcommand() {
        Some(("server", sub)) => {
            if let Some(port) = sub.get_one::<u16>("port") {
                cfg.port = *port;
            }
            serve(cfg).await
        }
        Some(("db", sub)) => {
            let store = PgStore::connect(&cfg).context(DbSnafu)?;
            match sub.subcommand() {
                Some(("migrate", _)) => store.migrate().await.context(DbSnafu),
                Some(("reset", _)) => store.reset().await.context(DbSnafu),
                _ => unreachable!("db requires a subcommand"),
            }
        }
        Some(("dev", sub)) => match sub.subcommand() {
            Some(("create-bucket", _)) => S3Storage::new(&cfg)
                .await
                .create_bucket()
                .await
                .context(BucketSnafu),
            _ => unreachable!("dev requires a subcommand"),
        },
        _ => unreachable!("a subcommand is required"),
    }
}

fn main() -> Result<()> {
    let matches = Command::new("icalproxy")
        .version(crate_version!())
        .about("Caching reverse proxy for iCalendar feeds")
        .arg(
            Arg::new("debug")
                .long("debug")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("DEBUG")
                .help("produce debug output"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .num_args(1)
                .env("LOG_LEVEL")
                .help("log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .num_args(1)
                .env("LOG_FORMAT")
                .help("log format (json, text)"),
        )
        .subcommand(
            Command::new("server").about("Run the web server").arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .num_args(1)
                    .value_parser(value_parser!(u16))
                    .env("PORT")
                    .help("port to bind to"),
            ),
        )
        .subcommand(
            Command::new("db")
                .about("Run commands on the DB")
                .subcommand_required(true)
                .subcommand(Command::new("migrate").about("Create tables and indices if missing"))
                .subcommand(
                    Command::new("reset").about("Drop tables (destructive; development only)"),
                ),
        )
        .subcommand(
            Command::new("dev")
                .about("Development helpers")
                .subcommand_required(true)
                .subcommand(
                    Command::new("create-bucket").about("Create the configured feed bucket"),
                ),
        )
        .subcommand_required(true)
        .get_matches();

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(run(matches))
}
