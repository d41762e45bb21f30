//! stockwatch - volatility buy alerts for a stock watchlist
//! Mission: Tell each user when a watched ticker falls 0.5σ, 1σ or 2σ below its last close

use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Local, NaiveDate};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use stockwatch_backend::{
    analysis::{run_backtest, BacktestParams, PriceSeries},
    api::{build_router, WebState},
    auth::JwtHandler,
    bot::{run_poller, BotHandler},
    charts::{ChartRenderer, FontConfig},
    collector::DataCollector,
    config::{init_tracing, load_env, AppConfig},
    market::{MarketDataProvider, YahooChartClient},
    models::{AlertRecord, Country, NewUser, User},
    monitor::RealtimeMonitor,
    notify::{
        ntfy::NtfyClient, telegram::TelegramClient, Notification, NotificationChannel,
        NotificationDispatcher, SETTING_BOT_TOKEN, SETTING_NTFY_SERVER,
    },
    report,
    scheduler::Scheduler,
    storage::{SettingsSnapshot, StockDb},
};

#[derive(Parser, Debug)]
#[command(name = "stockwatch")]
#[command(about = "Volatility buy-level alerts for a stock watchlist")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler, the Telegram bot and the web API
    Serve,

    /// Load daily history for the given tickers (default: every watched ticker)
    InitData {
        #[arg(long)]
        years: Option<u32>,
        tickers: Vec<String>,
    },

    /// Fetch new daily bars and refresh today's targets
    Update,

    /// Print buy levels for a ticker
    Analyze {
        ticker: String,
        #[arg(long)]
        amount: Option<f64>,
        /// Also render the chart
        #[arg(long)]
        chart: bool,
    },

    /// Replay the 1σ/2σ dip-buying rule over past closes
    Backtest {
        ticker: String,
        #[arg(long, default_value = "5")]
        years: u32,
        #[arg(long, default_value = "252")]
        window: usize,
        #[arg(long, default_value = "1000")]
        amount_1sigma: f64,
        #[arg(long, default_value = "2000")]
        amount_2sigma: f64,
    },

    /// Run one realtime alert check now
    Check,

    /// Show data coverage, users and notification settings
    Status,

    /// Delete old minute data and vacuum
    Cleanup {
        #[arg(long)]
        days: Option<i64>,
    },

    /// Write a consistent copy of the database
    Backup { path: PathBuf },

    #[command(subcommand)]
    User(UserCommand),

    #[command(subcommand)]
    Watch(WatchCommand),

    #[command(subcommand)]
    Settings(SettingsCommand),

    #[command(subcommand)]
    Alerts(AlertsCommand),

    /// Send a test notification to a user, ignoring their notification switch
    TestNotify { user: String },
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    Add {
        name: String,
        #[arg(long)]
        chat_id: Option<i64>,
        #[arg(long)]
        topic: Option<String>,
    },
    List,
    /// Set the web login password
    Password { name: String, password: String },
    /// Set or clear (no argument) the user's ntfy topic
    Topic { name: String, topic: Option<String> },
    Enable { name: String },
    Disable { name: String },
}

#[derive(Subcommand, Debug)]
enum WatchCommand {
    Add {
        user: String,
        ticker: String,
        #[arg(long)]
        amount: Option<f64>,
        #[arg(long)]
        name: Option<String>,
    },
    Remove { user: String, ticker: String },
    List { user: String },
    Amount { user: String, ticker: String, amount: f64 },
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
    Set {
        key: String,
        value: String,
        #[arg(long)]
        description: Option<String>,
    },
    Get { key: String },
    List,
    Delete { key: String },
    /// Write users, watchlists and settings as JSON
    Export { path: PathBuf },
    Import { path: PathBuf },
}

#[derive(Subcommand, Debug)]
enum AlertsCommand {
    List {
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        ticker: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Delete alert history, optionally only for one date (YYYY-MM-DD)
    Clear {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

/// Long-lived components shared by the commands.
struct App {
    config: AppConfig,
    db: StockDb,
    collector: DataCollector,
    dispatcher: NotificationDispatcher,
    telegram: Option<TelegramClient>,
    charts: Option<ChartRenderer>,
}

impl App {
    fn build(config: AppConfig) -> Result<Self> {
        let db = StockDb::new(&config.db_path)?;
        info!("🗄️  Database: {}", config.db_path);

        let provider: Arc<dyn MarketDataProvider> = Arc::new(YahooChartClient::new()?);
        let collector = DataCollector::new(
            db.clone(),
            provider,
            config.lookback_days,
            config.history_years,
        );

        // Stored settings override the environment
        let bot_token = db
            .get_setting(SETTING_BOT_TOKEN)?
            .filter(|t| !t.trim().is_empty())
            .or_else(|| config.telegram_bot_token.clone());
        let telegram = match bot_token {
            Some(token) => Some(TelegramClient::new(&token)?),
            None => {
                warn!("⚠️  No Telegram bot token; bot and Telegram delivery disabled");
                None
            }
        };
        let ntfy_server = db.get_setting_or(SETTING_NTFY_SERVER, &config.ntfy_server)?;
        let ntfy = NtfyClient::new(&ntfy_server)?;

        let dispatcher = NotificationDispatcher::new(
            db.clone(),
            telegram
                .clone()
                .map(|t| Arc::new(t) as Arc<dyn NotificationChannel>),
            Some(Arc::new(ntfy) as Arc<dyn NotificationChannel>),
        );

        let charts = match ChartRenderer::new(
            &config.chart_dir,
            FontConfig::discover(config.font_path.as_deref()),
        ) {
            Ok(renderer) => Some(renderer),
            Err(e) => {
                warn!("⚠️  Charts disabled: {:#}", e);
                None
            }
        };

        Ok(Self {
            config,
            db,
            collector,
            dispatcher,
            telegram,
            charts,
        })
    }

    fn monitor(&self) -> RealtimeMonitor {
        RealtimeMonitor::new(
            self.db.clone(),
            self.collector.clone(),
            self.dispatcher.clone(),
            self.config.alerts.clone(),
        )
    }

    fn find_user(&self, name: &str) -> Result<User> {
        self.db
            .get_user_by_name(name)?
            .ok_or_else(|| anyhow!("No user named {}", name))
    }

    fn tickers_or_watched(&self, tickers: Vec<String>) -> Result<Vec<String>> {
        if tickers.is_empty() {
            return self.db.watched_tickers();
        }
        Ok(tickers.iter().map(|t| t.trim().to_uppercase()).collect())
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let app = App::build(AppConfig::from_env())?;

    match cli.command {
        Commands::Serve => serve(app).await?,
        Commands::InitData { years, tickers } => {
            let tickers = app.tickers_or_watched(tickers)?;
            let years = years.unwrap_or(app.config.history_years);
            let outcome = app
                .collector
                .initialize_history(&tickers, years, today())
                .await;
            app.collector.refresh_statistics(&outcome.succeeded, today());
            println!(
                "Loaded {} of {} tickers ({} failed)",
                outcome.succeeded.len(),
                outcome.total(),
                outcome.failed.len()
            );
            for (ticker, reason) in &outcome.failed {
                println!("  {}: {}", ticker, reason);
            }
        }
        Commands::Update => {
            let tickers = app.db.watched_tickers()?;
            let updated = app.collector.update_daily(&tickers, today()).await;
            let refreshed = app.collector.refresh_statistics(&tickers, today());
            println!(
                "Updated {} tickers, refreshed targets for {}",
                updated.succeeded.len(),
                refreshed.succeeded.len()
            );
        }
        Commands::Analyze {
            ticker,
            amount,
            chart,
        } => {
            let ticker = ticker.trim().to_uppercase();
            let analysis = app.collector.analyze(&ticker, today()).await?;
            let country = Country::infer(&ticker);
            let amount = amount.unwrap_or_else(|| country.default_investment());
            let name = analysis.stats.display_name().to_string();
            print!(
                "{}",
                report::ticker_summary(&ticker, &name, country, &analysis.report, amount)
            );
            if chart {
                let renderer = app
                    .charts
                    .as_ref()
                    .ok_or_else(|| anyhow!("Charts are disabled: set CHART_FONT_PATH"))?;
                let path = renderer.render(&ticker, &name, &analysis.bars, &analysis.report, today())?;
                println!("Chart: {}", path.display());
            }
        }
        Commands::Backtest {
            ticker,
            years,
            window,
            amount_1sigma,
            amount_2sigma,
        } => {
            let ticker = ticker.trim().to_uppercase();
            let end = today();
            let start = end - Duration::days(i64::from(years.max(1)) * 365);
            let outcome = app
                .collector
                .initialize_history(std::slice::from_ref(&ticker), years, end)
                .await;
            if let Some((_, reason)) = outcome.failed.first() {
                warn!(ticker = %ticker, "History refresh failed, using stored data: {}", reason);
            }
            let bars = app.db.get_daily_prices_range(&ticker, start, end)?;
            let series = PriceSeries::new(bars.iter().map(|b| (b.date, b.close)).collect())?;
            let params = BacktestParams {
                window,
                amount_1sigma,
                amount_2sigma,
            };
            let result = run_backtest(&series, &params)?;
            print!(
                "{}",
                report::backtest_summary(&ticker, Country::infer(&ticker), &result)
            );
        }
        Commands::Check => {
            let summary = app.monitor().run_check(Local::now().naive_local()).await?;
            println!(
                "Checked {} tickers: {} delivered, {} flushed, {} queued, {} suppressed, {} failed",
                summary.tickers,
                summary.delivered,
                summary.flushed,
                summary.queued,
                summary.suppressed,
                summary.failed.len()
            );
        }
        Commands::Status => print_status(&app)?,
        Commands::Cleanup { days } => {
            let keep = days.unwrap_or(app.config.schedule.minute_retention_days);
            let removed = app.db.cleanup_minute_data(today(), keep)?;
            app.db.vacuum()?;
            println!("Removed {} minute rows older than {} days", removed, keep);
        }
        Commands::Backup { path } => {
            app.db.backup_to(&path)?;
            println!("Backup written to {}", path.display());
        }
        Commands::User(cmd) => user_command(&app, cmd)?,
        Commands::Watch(cmd) => watch_command(&app, cmd).await?,
        Commands::Settings(cmd) => settings_command(&app, cmd)?,
        Commands::Alerts(cmd) => alerts_command(&app, cmd)?,
        Commands::TestNotify { user } => {
            let user = app.find_user(&user)?;
            let n = Notification::new(
                "🔔 stockwatch test",
                format!("Notifications for {} are working.", user.name),
            );
            app.dispatcher.send_unchecked(&user, &n).await?;
            println!("Sent test notification via {}", app.dispatcher.method()?.as_str());
        }
    }

    Ok(())
}

async fn serve(app: App) -> Result<()> {
    info!("🚀 stockwatch starting");
    if app.config.uses_dev_secret() {
        warn!("⚠️  JWT_SECRET not set, using the development secret");
    }

    let monitor = Arc::new(app.monitor());
    let scheduler = Scheduler::new(
        app.collector.clone(),
        monitor,
        app.dispatcher.clone(),
        app.charts.clone(),
        app.config.schedule.clone(),
    );
    tokio::spawn(scheduler.run());

    if let Some(client) = app.telegram.clone() {
        let handler = Arc::new(BotHandler::new(
            app.collector.clone(),
            app.charts.clone(),
            app.config.schedule.realtime_interval_minutes,
        ));
        tokio::spawn(run_poller(client, handler));
    }

    let jwt_handler = Arc::new(JwtHandler::with_ttl(
        app.config.jwt_secret.clone(),
        Duration::hours(app.config.jwt_ttl_hours),
    ));
    let state = WebState {
        db: app.db.clone(),
        collector: app.collector.clone(),
        charts: app.charts.clone(),
        alerts: app.config.alerts.clone(),
    };
    let router = build_router(state, jwt_handler);

    let addr = app.config.bind_addr.as_str();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, router).await.context("Server error")?;
    Ok(())
}

fn print_status(app: &App) -> Result<()> {
    let status = app.db.data_status()?;
    let users = app.db.list_users(true)?;
    let tickers = app.db.watched_tickers()?;

    println!("Database      {} (schema v{})", app.config.db_path, app.db.schema_version()?);
    println!(
        "Daily data    {} rows, {} tickers, {} → {}",
        status.daily_rows,
        status.daily_tickers,
        status.daily_first.as_deref().unwrap_or("-"),
        status.daily_last.as_deref().unwrap_or("-")
    );
    println!(
        "Minute data   {} rows, last {}",
        status.minute_rows,
        status.minute_last.as_deref().unwrap_or("-")
    );
    println!(
        "Statistics    {} cached, last {}",
        status.cached_statistics,
        status.cache_last.as_deref().unwrap_or("-")
    );
    println!(
        "Users         {} ({} enabled)",
        users.len(),
        users.iter().filter(|u| u.enabled).count()
    );
    println!("Watched       {}", tickers.join(", "));
    println!("Notify via    {}", app.dispatcher.method()?.as_str());
    println!(
        "Charts        {}",
        app.charts
            .as_ref()
            .map(|c| c.out_dir().display().to_string())
            .unwrap_or_else(|| "disabled".to_string())
    );
    Ok(())
}

fn user_command(app: &App, cmd: UserCommand) -> Result<()> {
    match cmd {
        UserCommand::Add {
            name,
            chat_id,
            topic,
        } => {
            let user = app.db.add_user(&NewUser {
                name,
                chat_id,
                ntfy_topic: topic,
            })?;
            println!("Added user {} (id {})", user.name, user.id);
        }
        UserCommand::List => {
            for u in app.db.list_users(true)? {
                println!(
                    "{:>3}  {:<16} chat {:<12} topic {:<20} {}{}",
                    u.id,
                    u.name,
                    u.chat_id.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
                    u.ntfy_topic.as_deref().unwrap_or("-"),
                    if u.enabled { "enabled" } else { "disabled" },
                    if u.notification_enabled { "" } else { ", muted" },
                );
            }
        }
        UserCommand::Password { name, password } => {
            let user = app.find_user(&name)?;
            app.db.set_password(user.id, &password)?;
            println!("Password set for {}", user.name);
        }
        UserCommand::Topic { name, topic } => {
            let user = app.find_user(&name)?;
            app.db.set_ntfy_topic(user.id, topic.as_deref())?;
            println!("ntfy topic for {}: {}", user.name, topic.as_deref().unwrap_or("(cleared)"));
        }
        UserCommand::Enable { name } => {
            let user = app.find_user(&name)?;
            app.db.set_user_enabled(user.id, true)?;
            println!("Enabled {}", user.name);
        }
        UserCommand::Disable { name } => {
            let user = app.find_user(&name)?;
            app.db.set_user_enabled(user.id, false)?;
            println!("Disabled {}", user.name);
        }
    }
    Ok(())
}

async fn watch_command(app: &App, cmd: WatchCommand) -> Result<()> {
    match cmd {
        WatchCommand::Add {
            user,
            ticker,
            amount,
            name,
        } => {
            let user = app.find_user(&user)?;
            let ticker = ticker.trim().to_uppercase();
            let quote = app
                .collector
                .provider()
                .quote(&ticker)
                .await
                .with_context(|| format!("Unknown ticker {}", ticker))?;
            let name = name.or(quote.name);
            app.db
                .add_watchlist_item(user.id, &ticker, name.as_deref(), amount)?;
            println!("{} now watches {}", user.name, ticker);
        }
        WatchCommand::Remove { user, ticker } => {
            let user = app.find_user(&user)?;
            let ticker = ticker.trim().to_uppercase();
            if app.db.remove_watchlist_item(user.id, &ticker)? {
                println!("{} no longer watches {}", user.name, ticker);
            } else {
                println!("{} is not in {}'s watchlist", ticker, user.name);
            }
        }
        WatchCommand::List { user } => {
            let user = app.find_user(&user)?;
            println!("{}", report::watchlist_text(&app.db.get_watchlist(user.id)?));
        }
        WatchCommand::Amount {
            user,
            ticker,
            amount,
        } => {
            let user = app.find_user(&user)?;
            let ticker = ticker.trim().to_uppercase();
            if !app.db.update_investment(user.id, &ticker, amount)? {
                return Err(anyhow!("{} is not in {}'s watchlist", ticker, user.name));
            }
            println!(
                "{} {}: {} per buy",
                user.name,
                ticker,
                report::format_amount(amount, Country::infer(&ticker))
            );
        }
    }
    Ok(())
}

fn settings_command(app: &App, cmd: SettingsCommand) -> Result<()> {
    match cmd {
        SettingsCommand::Set {
            key,
            value,
            description,
        } => {
            app.db.set_setting(&key, &value, description.as_deref())?;
            println!("{} = {}", key, value);
        }
        SettingsCommand::Get { key } => match app.db.get_setting(&key)? {
            Some(value) => println!("{}", value),
            None => println!("{} is not set", key),
        },
        SettingsCommand::List => {
            for s in app.db.list_settings()? {
                println!(
                    "{:<24} {:<32} {}",
                    s.key,
                    s.value,
                    s.description.as_deref().unwrap_or("")
                );
            }
        }
        SettingsCommand::Delete { key } => {
            if app.db.delete_setting(&key)? {
                println!("Deleted {}", key);
            } else {
                println!("{} is not set", key);
            }
        }
        SettingsCommand::Export { path } => {
            let snapshot = app.db.export_snapshot()?;
            let json = serde_json::to_string_pretty(&snapshot)?;
            std::fs::write(&path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "Exported {} users and {} settings to {}",
                snapshot.users.len(),
                snapshot.settings.len(),
                path.display()
            );
        }
        SettingsCommand::Import { path } => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let snapshot: SettingsSnapshot =
                serde_json::from_str(&raw).context("Invalid settings export")?;
            app.db.import_snapshot(&snapshot)?;
            println!("Imported {} users from {}", snapshot.users.len(), path.display());
        }
    }
    Ok(())
}

fn alerts_command(app: &App, cmd: AlertsCommand) -> Result<()> {
    match cmd {
        AlertsCommand::List {
            user,
            ticker,
            limit,
        } => {
            let alerts: Vec<AlertRecord> = match (user, ticker) {
                (Some(user), _) => {
                    let user = app.find_user(&user)?;
                    app.db
                        .user_alert_history(user.id, limit)?
                        .into_iter()
                        .map(|e| e.alert)
                        .collect()
                }
                (None, Some(ticker)) => app
                    .db
                    .ticker_alert_history(&ticker.trim().to_uppercase(), limit)?,
                (None, None) => return Err(anyhow!("Pass --user or --ticker")),
            };
            for a in alerts {
                println!(
                    "{}  {:<8} {:<5} {} → {} ({:.2}%){}",
                    a.alert_time.format("%Y-%m-%d %H:%M"),
                    a.ticker,
                    a.level.title(),
                    report::format_price(a.target_price, a.country),
                    report::format_price(a.current_price, a.country),
                    -a.drop_rate,
                    if a.sent { "" } else { "  [unsent]" },
                );
            }
        }
        AlertsCommand::Clear { date } => {
            let removed = app.db.clear_alert_history(date)?;
            println!("Removed {} alert records", removed);
        }
    }
    Ok(())
}
