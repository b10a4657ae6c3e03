use std::env;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use amqp_publisher::{AmqpPublisher, MessagePublisher};
use outbox_store::{OutboxStore, SqlxOutboxStore};
use resilience::CircuitBreaker;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use outbox_relay::config::Config;
use outbox_relay::handlers::{register_routes, AppState};
use outbox_relay::metrics::{RelayMetrics, BREAKER_COMPONENT};
use outbox_relay::processor::{BatchProcessor, ProcessorSettings};
use outbox_relay::relay::{BatchSummary, OutboxRelay};
use outbox_relay::RelayError;

struct RelayContext {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn MessagePublisher>,
    breaker: CircuitBreaker,
    relay: Arc<OutboxRelay>,
}

#[actix_web::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("");

    let code = match command {
        "start" => cmd_start().await,
        "process" => cmd_process(&args[2..]).await,
        "stats" => cmd_stats(&args[2..]).await,
        "reset-cb" => cmd_reset_cb().await,
        "validate-config" => cmd_validate_config(),
        _ => {
            print_usage();
            1
        }
    };

    std::process::exit(code);
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  outbox-relay start                      run the relay continuously");
    eprintln!("  outbox-relay process [--batch-size N]   run one batch cycle and exit");
    eprintln!("  outbox-relay stats [--json]             print outbox statistics");
    eprintln!("  outbox-relay reset-cb                   reset the running relay's circuit breaker");
    eprintln!("  outbox-relay validate-config            validate configuration and exit");
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config() -> Result<Config, i32> {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return Err(1);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("{e}");
        return Err(1);
    }
    Ok(config)
}

/// Wire up the collaborators. Everything is constructed here and passed
/// down; nothing reaches for process-wide defaults.
async fn build_context(config: &Config) -> Result<RelayContext, RelayError> {
    let pool = tokio::time::timeout(
        config.store.connect_timeout(),
        config
            .store
            .pool_options()
            .connect(&config.store.connection_url()),
    )
    .await
    .map_err(|_| RelayError::Startup("timed out connecting to the outbox database".to_string()))?
    .map_err(outbox_store::OutboxStoreError::from)?;

    let store: Arc<dyn OutboxStore> = Arc::new(SqlxOutboxStore::new(pool));
    let publisher: Arc<dyn MessagePublisher> =
        Arc::new(AmqpPublisher::new(config.broker.publisher_config()));

    let metrics = RelayMetrics::new();

    let trips = metrics.circuit_breaker_trips.clone();
    let state_gauge = metrics.circuit_breaker_state.clone();
    let breaker = CircuitBreaker::new(config.breaker.breaker_config()).with_observer(Arc::new(
        move |from, to| {
            trips
                .with_label_values(&[BREAKER_COMPONENT, from.as_str(), to.as_str()])
                .inc();
            state_gauge
                .with_label_values(&[BREAKER_COMPONENT])
                .set(to.as_gauge_value());
        },
    ));

    let processor = Arc::new(BatchProcessor::new(
        Arc::clone(&store),
        Arc::clone(&publisher),
        breaker.clone(),
        config.retry.policy(),
        metrics,
        ProcessorSettings {
            batch_size: config.batch.size,
            max_batch_size: config.batch.max_size,
            consumer_name: config.relay.consumer_name.clone(),
            max_attempts_cap: config.retry.max_attempts as i32,
        },
    ));

    let relay = Arc::new(OutboxRelay::new(
        processor,
        Arc::clone(&store),
        Arc::clone(&publisher),
        config.relay.clone(),
        config.batch.interval(),
    ));

    Ok(RelayContext {
        store,
        publisher,
        breaker,
        relay,
    })
}

async fn cmd_start() -> i32 {
    let config = match load_config() {
        Ok(config) => config,
        Err(code) => return code,
    };

    tracing::info!(
        bind_addr = %config.http.bind_addr,
        consumer = %config.relay.consumer_name,
        "Starting outbox relay"
    );

    let ctx = match build_context(&config).await {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!("Initialisation failed: {}", e);
            return 1;
        }
    };

    if let Err(e) = ctx.relay.start().await {
        tracing::error!("Relay failed to start: {}", e);
        return 1;
    }

    let app_state = AppState {
        relay: Arc::clone(&ctx.relay),
        store: Arc::clone(&ctx.store),
        publisher: Arc::clone(&ctx.publisher),
        breaker: ctx.breaker.clone(),
    };

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .configure(register_routes)
    })
    .bind(&config.http.bind_addr);

    let server = match server {
        Ok(server) => server.run(),
        Err(e) => {
            tracing::error!(addr = %config.http.bind_addr, "Failed to bind HTTP surface: {}", e);
            ctx.relay.stop().await;
            return 1;
        }
    };

    // actix installs its own SIGINT/SIGTERM handling; when the server
    // future completes the process is shutting down.
    let result = server.await;
    tracing::info!("HTTP surface stopped, shutting relay down");
    ctx.relay.stop().await;

    match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("HTTP server error: {}", e);
            1
        }
    }
}

async fn cmd_process(args: &[String]) -> i32 {
    let batch_size = match parse_batch_size(args) {
        Ok(batch_size) => batch_size,
        Err(message) => {
            eprintln!("{message}");
            return 1;
        }
    };

    let mut config = match load_config() {
        Ok(config) => config,
        Err(code) => return code,
    };
    // One-shot run: no tick task, no startup cycle beyond the one we
    // trigger explicitly.
    config.relay.mode = outbox_relay::config::RelayMode::Polling;
    config.relay.process_on_startup = false;

    let ctx = match build_context(&config).await {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!("Initialisation failed: {}", e);
            return 1;
        }
    };

    if let Err(e) = ctx.relay.start().await {
        tracing::error!("Relay failed to start: {}", e);
        return 1;
    }

    let result = ctx.relay.trigger_batch(batch_size).await;
    let summary = BatchSummary::from(&result);
    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Failed to render batch result: {e}"),
    }

    ctx.relay.stop().await;
    0
}

fn parse_batch_size(args: &[String]) -> Result<Option<i64>, String> {
    match args {
        [] => Ok(None),
        [flag, value] if flag.as_str() == "--batch-size" => value
            .parse::<i64>()
            .map(Some)
            .map_err(|_| format!("invalid --batch-size value: {value}")),
        _ => Err("usage: outbox-relay process [--batch-size N]".to_string()),
    }
}

async fn cmd_stats(args: &[String]) -> i32 {
    let as_json = args.iter().any(|a| a == "--json");

    let config = match load_config() {
        Ok(config) => config,
        Err(code) => return code,
    };

    let ctx = match build_context(&config).await {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!("Initialisation failed: {}", e);
            return 1;
        }
    };

    let stats = match ctx.store.stats().await {
        Ok(stats) => stats,
        Err(e) => {
            eprintln!("Failed to read outbox statistics: {e}");
            ctx.store.close().await;
            return 1;
        }
    };

    if as_json {
        match serde_json::to_string_pretty(&stats) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Failed to render statistics: {e}");
                ctx.store.close().await;
                return 1;
            }
        }
    } else {
        println!("Outbox statistics");
        println!("  pending:    {}", stats.pending);
        println!("  processing: {}", stats.processing);
        println!("  published:  {}", stats.published);
        println!("  failed:     {}", stats.failed);
        println!("  discarded:  {}", stats.discarded);
        println!("  total:      {}", stats.total());
        if let Some(oldest) = stats.oldest_pending {
            println!("  oldest pending occurred at: {oldest}");
        }
        if let Some(newest) = stats.newest_pending {
            println!("  newest pending occurred at: {newest}");
        }
    }

    ctx.store.close().await;
    0
}

/// The breaker lives inside the running relay process, so resetting it goes
/// through the relay's admin endpoint rather than this process's memory.
async fn cmd_reset_cb() -> i32 {
    let addr = env::var("RELAY_HTTP_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let addr = addr.replace("0.0.0.0", "127.0.0.1");
    let url = format!("http://{addr}/admin/circuit-breaker/reset");

    let client = reqwest::Client::new();
    match client.post(&url).send().await {
        Ok(response) if response.status().is_success() => {
            println!("Circuit breaker reset");
            0
        }
        Ok(response) => {
            eprintln!("Relay refused the reset: HTTP {}", response.status());
            1
        }
        Err(e) => {
            eprintln!("Could not reach the relay at {url}: {e}");
            1
        }
    }
}

fn cmd_validate_config() -> i32 {
    match Config::from_env().and_then(|config| config.validate().map(|_| config)) {
        Ok(config) => {
            println!("Configuration OK");
            println!("  mode:          {:?}", config.relay.mode);
            println!("  consumer:      {}", config.relay.consumer_name);
            println!("  batch size:    {}", config.batch.size);
            println!("  interval (ms): {}", config.batch.interval_ms);
            0
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}
