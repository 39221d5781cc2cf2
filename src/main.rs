use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use zlink::app_state::AppState;
use zlink::commands::CommandRouter;
use zlink::config::{AppConfig, DEFAULT_CONFIG_PATH};
use zlink::notify::{LogOnlyChannel, MessagingChannel};
use zlink::oracle::{start_price_refresh_task, CoinGeckoOracle, PriceOracle};
use zlink::store::Store;
use zlink::telegram::TelegramChannel;
use zlink::watcher::spawn_watcher;

/// Buffered watcher events before watchers wait on the orchestrator
const EVENT_QUEUE: usize = 256;

#[derive(Parser)]
#[clap(rename_all = "kebab-case", author, version, about = "Cross-chain deposits to Zcash payouts")]
struct Args {
    /// TOML configuration file (missing file = defaults)
    #[clap(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Database directory (overrides config and ZLINK_DATA_DIR)
    #[clap(long)]
    data_dir: Option<PathBuf>,
    /// HTTP listen address (overrides config and ZLINK_HTTP_BIND)
    #[clap(long)]
    http_bind: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run watchers, chat bot and HTTP view (default)
    Run,
    /// Print the pending payout queue
    Pending,
    /// Print transfers not yet matched to a user
    Unattributed,
}

fn load_config(args: &Args) -> anyhow::Result<AppConfig> {
    let mut cfg = AppConfig::load(&args.config)?;
    cfg.apply_env_overrides()?;
    if let Some(dir) = &args.data_dir {
        cfg.data_dir = dir.clone();
    }
    if let Some(bind) = &args.http_bind {
        cfg.http.bind = bind.clone();
    }
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "zlink=info".into());
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("zlink=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    let cfg = load_config(&args)?;
    let store = Store::open(&cfg.data_dir)
        .with_context(|| format!("opening database at {}", cfg.data_dir.display()))?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(cfg, store).await,
        Command::Pending => print_pending(&cfg, store),
        Command::Unattributed => print_unattributed(store),
    }
}

fn print_pending(cfg: &AppConfig, store: Store) -> anyhow::Result<()> {
    let state = AppState::new(
        store,
        Arc::new(zlink::oracle::StaticPriceOracle::new(cfg.fallback_prices()?)),
        Arc::new(LogOnlyChannel),
        cfg.to_service_options(),
    );
    let pending = state.payouts.list_pending()?;
    println!("{} pending payout(s)", pending.len());
    for p in pending {
        println!(
            "{}  {}  @{} ({})  {} {} -> {} {}  to {}",
            p.claim_id,
            p.created_at.format("%Y-%m-%d %H:%M"),
            p.beneficiary_username,
            p.beneficiary_user_id,
            p.source_amount,
            p.source_coin,
            p.payout_amount,
            p.payout_coin,
            p.payout_address
        );
    }
    Ok(())
}

fn print_unattributed(store: Store) -> anyhow::Result<()> {
    let ledger = zlink::ledger::TransferLedger::new(store);
    let records = ledger.list_unprocessed()?;
    println!("{} unattributed transfer(s)", records.len());
    for r in records {
        println!(
            "{}  {}  {}  from {}  amount {}",
            r.observed_at.format("%Y-%m-%d %H:%M"),
            r.chain,
            r.tx_ref,
            r.from_address,
            r.amount
        );
    }
    Ok(())
}

async fn run(cfg: AppConfig, store: Store) -> anyhow::Result<()> {
    info!(data_dir = %cfg.data_dir.display(), "ZLink starting up");

    // prices
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("building HTTP client")?;
    let oracle = Arc::new(CoinGeckoOracle::new(
        http,
        cfg.oracle.api_url.clone(),
        Duration::from_secs(cfg.oracle.max_age_secs),
        cfg.fallback_prices()?,
    ));
    start_price_refresh_task(oracle.clone(), cfg.oracle.refresh_secs);

    // chat surface
    let telegram = match cfg.telegram.bot_token.as_deref() {
        Some(token) => Some(Arc::new(
            TelegramChannel::new(token, &cfg.telegram.api_base).context("building Telegram client")?,
        )),
        None => {
            warn!("[TELEGRAM] No bot token configured, messages go to the log only");
            None
        }
    };
    let channel: Arc<dyn MessagingChannel> = match &telegram {
        Some(t) => t.clone(),
        None => Arc::new(LogOnlyChannel),
    };

    let oracle_dyn: Arc<dyn PriceOracle> = oracle;
    let state = Arc::new(AppState::new(store.clone(), oracle_dyn, channel, cfg.to_service_options()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // pick up anything a previous run recorded but did not finish
    match state.orchestrator.reconcile_unprocessed().await {
        Ok(report) if report.attributed > 0 => {
            info!(attributed = report.attributed, "[LEDGER] Recovered unprocessed transfers")
        }
        Ok(_) => {}
        Err(e) => error!("[LEDGER] Startup reconciliation failed: {}", e),
    }

    // watchers -> orchestrator
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let mut watcher_tasks = Vec::new();
    for wc in cfg.usable_watchers() {
        match wc.build(cfg.backoff) {
            Ok(w) => watcher_tasks.push(spawn_watcher(w, events_tx.clone(), cfg.backoff, shutdown_rx.clone())),
            Err(e) => error!("[WATCHER] Not starting: {}", e),
        }
    }
    drop(events_tx);
    if watcher_tasks.is_empty() {
        warn!("[WATCHER] No chain watchers running");
    } else {
        info!(count = watcher_tasks.len(), "[WATCHER] Chain watchers running");
    }
    let orchestrator_task = tokio::spawn(state.orchestrator.clone().run(events_rx));

    let telegram_task = telegram.map(|t| {
        let router = Arc::new(CommandRouter::new(state.clone()));
        tokio::spawn(t.run_updates(router, cfg.telegram.poll_timeout_secs, cfg.backoff, shutdown_rx.clone()))
    });

    let addr = cfg.http_bind()?;
    let app = zlink::http::router(state.clone());
    info!(listen = %addr, "HTTP claim view listening");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(listen = %addr, err = ?e, "failed to bind to address");
            std::process::exit(1);
        }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await
        .context("HTTP server")?;

    let _ = shutdown_tx.send(true);
    for task in watcher_tasks {
        let _ = task.await;
    }
    // all senders are gone once the watchers stop
    let _ = orchestrator_task.await;
    if let Some(task) = telegram_task {
        let _ = task.await;
    }
    store.flush().await?;
    info!("ZLink stopped");
    Ok(())
}
