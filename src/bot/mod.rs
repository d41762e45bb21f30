//! Chat Bot
//! Mission: Let users manage their watchlist and pull reports from chat
//!
//! [`BotHandler`] turns one incoming message into typed [`Reply`] values;
//! sending them is the poller's job.

pub mod poller;

use anyhow::Result;
use chrono::{Local, NaiveDate};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::charts::ChartRenderer;
use crate::collector::{DataCollector, TickerAnalysis};
use crate::models::{Country, User, WatchlistItem};
use crate::monitor::drop_rate;
use crate::report::{self, MorningEntry};

pub use poller::run_poller;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Help,
    List,
    Add { ticker: String, amount: Option<f64> },
    Remove { ticker: String },
    Amount { ticker: String, amount: f64 },
    Morning,
    Status { ticker: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    Photo { path: PathBuf, caption: String },
}

pub const HELP_TEXT: &str = "\
📈 stockwatch bot

/list - show your watchlist
/add TICKER [amount] - watch a ticker (e.g. /add TQQQ 2000, /add 005930)
/remove TICKER - stop watching a ticker
/amount TICKER AMOUNT - change the amount invested per buy
/morning - today's buy levels with charts
/status [TICKER] - live price vs. targets, or service status
/help - this message

Buy levels: test buy at 0.5σ, 1st buy at 1σ, 2nd buy at 2σ below the last close.";

/// Accepts `1000000`, `1,000,000` and `2500.5`; must be positive.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| *c != ',' && *c != '_').collect();
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|a| a.is_finite() && *a > 0.0)
}

fn normalize_ticker(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Parse a slash command. `Ok(None)` for plain text; `Err` carries a usage hint.
pub fn parse_command(text: &str) -> Result<Option<Command>, String> {
    let text = text.trim();
    if !text.starts_with('/') {
        return Ok(None);
    }
    let mut parts = text.split_whitespace();
    let head = parts.next().unwrap_or_default();
    // "/add@MyBot" in group chats
    let name = head[1..].split('@').next().unwrap_or_default().to_lowercase();
    let args: Vec<&str> = parts.collect();

    let cmd = match (name.as_str(), args.as_slice()) {
        ("start", _) => Command::Start,
        ("help", _) => Command::Help,
        ("list", _) => Command::List,
        ("morning", _) => Command::Morning,
        ("status", []) => Command::Status { ticker: None },
        ("status", [ticker, ..]) => Command::Status {
            ticker: Some(normalize_ticker(ticker)),
        },
        ("add", [ticker]) => Command::Add {
            ticker: normalize_ticker(ticker),
            amount: None,
        },
        ("add", [ticker, amount]) => Command::Add {
            ticker: normalize_ticker(ticker),
            amount: Some(
                parse_amount(amount).ok_or_else(|| format!("Invalid amount: {}", amount))?,
            ),
        },
        ("add", _) => return Err("Usage: /add TICKER [amount]".to_string()),
        ("remove", [ticker]) => Command::Remove {
            ticker: normalize_ticker(ticker),
        },
        ("remove", _) => return Err("Usage: /remove TICKER".to_string()),
        ("amount", [ticker, amount]) => Command::Amount {
            ticker: normalize_ticker(ticker),
            amount: parse_amount(amount).ok_or_else(|| format!("Invalid amount: {}", amount))?,
        },
        ("amount", _) => return Err("Usage: /amount TICKER AMOUNT".to_string()),
        (other, _) => return Err(format!("Unknown command /{}. Try /help.", other)),
    };
    Ok(Some(cmd))
}

pub struct BotHandler {
    collector: DataCollector,
    charts: Option<ChartRenderer>,
    check_interval_minutes: u32,
}

impl BotHandler {
    pub fn new(
        collector: DataCollector,
        charts: Option<ChartRenderer>,
        check_interval_minutes: u32,
    ) -> Self {
        Self {
            collector,
            charts,
            check_interval_minutes,
        }
    }

    /// Replies for one incoming message from `chat_id`.
    pub async fn handle(&self, chat_id: i64, text: &str) -> Vec<Reply> {
        let today = Local::now().date_naive();
        self.handle_on(chat_id, text, today).await
    }

    pub async fn handle_on(&self, chat_id: i64, text: &str, today: NaiveDate) -> Vec<Reply> {
        let command = match parse_command(text) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => return Vec::new(),
            Err(usage) => return vec![Reply::Text(usage)],
        };

        let user = match self.collector.db().get_user_by_chat_id(chat_id) {
            Ok(Some(user)) if user.enabled => user,
            Ok(_) => {
                info!(chat_id, "Message from unregistered chat");
                return vec![Reply::Text(format!(
                    "This chat is not registered.\nYour chat id is {}. Ask the admin to run:\n\
                     stockwatch user add NAME --chat-id {}",
                    chat_id, chat_id
                ))];
            }
            Err(e) => {
                warn!(chat_id, "User lookup failed: {:#}", e);
                return vec![Reply::Text("Something went wrong, try again later.".to_string())];
            }
        };

        match self.dispatch(&user, command, today).await {
            Ok(replies) => replies,
            Err(e) => {
                warn!(user = %user.name, "Bot command failed: {:#}", e);
                vec![Reply::Text(format!("⚠️  {}", e))]
            }
        }
    }

    async fn dispatch(&self, user: &User, command: Command, today: NaiveDate) -> Result<Vec<Reply>> {
        let db = self.collector.db();
        let text = |s: String| -> Result<Vec<Reply>> { Ok(vec![Reply::Text(s)]) };

        match command {
            Command::Start => text(format!("👋 Hi {}!\n\n{}", user.name, HELP_TEXT)),
            Command::Help => text(HELP_TEXT.to_string()),
            Command::List => text(report::watchlist_text(&db.get_watchlist(user.id)?)),
            Command::Add { ticker, amount } => {
                let quote = self
                    .collector
                    .provider()
                    .quote(&ticker)
                    .await
                    .map_err(|_| anyhow::anyhow!("Unknown ticker {}", ticker))?;
                db.add_watchlist_item(user.id, &ticker, quote.name.as_deref(), amount)?;
                let country = Country::infer(&ticker);
                let amount = amount.unwrap_or_else(|| country.default_investment());
                info!(user = %user.name, ticker = %ticker, "➕ Watchlist add");
                text(format!(
                    "✅ Added {} ({}) · {} per buy\nLast price {}",
                    quote.name.as_deref().unwrap_or(&ticker),
                    ticker,
                    report::format_amount(amount, country),
                    report::format_price(quote.price, country)
                ))
            }
            Command::Remove { ticker } => {
                if db.remove_watchlist_item(user.id, &ticker)? {
                    info!(user = %user.name, ticker = %ticker, "➖ Watchlist remove");
                    text(format!("🗑️  Removed {}", ticker))
                } else {
                    text(format!("{} is not on your watchlist", ticker))
                }
            }
            Command::Amount { ticker, amount } => {
                if db.update_investment(user.id, &ticker, amount)? {
                    text(format!(
                        "💰 {} now invests {} per buy",
                        ticker,
                        report::format_amount(amount, Country::infer(&ticker))
                    ))
                } else {
                    text(format!("{} is not on your watchlist", ticker))
                }
            }
            Command::Morning => self.morning(user, today).await,
            Command::Status { ticker: Some(ticker) } => self.ticker_status(user, &ticker, today).await,
            Command::Status { ticker: None } => {
                let status = db.data_status()?;
                let watchlist = db.get_watchlist(user.id)?;
                text(format!(
                    "🩺 Status\nWatchlist: {} ticker(s)\nNotifications: {}\nDaily bars: {} ({} tickers, last {})\nCached targets: {}",
                    watchlist.len(),
                    if user.notification_enabled { "on" } else { "off" },
                    status.daily_rows,
                    status.daily_tickers,
                    status.daily_last.as_deref().unwrap_or("-"),
                    status.cached_statistics,
                ))
            }
        }
    }

    async fn analyses(
        &self,
        items: &[WatchlistItem],
        today: NaiveDate,
    ) -> Vec<Option<TickerAnalysis>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match self.collector.analyze(&item.ticker, today).await {
                Ok(a) => out.push(Some(a)),
                Err(e) => {
                    warn!(ticker = %item.ticker, "{:#}", e);
                    out.push(None);
                }
            }
        }
        out
    }

    async fn chart_for(&self, item: &WatchlistItem, analysis: &TickerAnalysis, today: NaiveDate) -> Option<PathBuf> {
        let renderer = self.charts.as_ref()?;
        match renderer
            .render_blocking(
                item.ticker.clone(),
                item.name.clone(),
                analysis.bars.clone(),
                analysis.report.clone(),
                today,
            )
            .await
        {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(ticker = %item.ticker, "Chart failed, text only: {:#}", e);
                None
            }
        }
    }

    async fn morning(&self, user: &User, today: NaiveDate) -> Result<Vec<Reply>> {
        let items = self.collector.db().get_watchlist(user.id)?;
        if items.is_empty() {
            return Ok(vec![Reply::Text(report::watchlist_text(&items))]);
        }
        let analyses = self.analyses(&items, today).await;

        let mut replies = Vec::new();
        for (item, analysis) in items.iter().zip(&analyses) {
            let Some(analysis) = analysis else { continue };
            if let Some(path) = self.chart_for(item, analysis, today).await {
                replies.push(Reply::Photo {
                    path,
                    caption: report::ticker_summary(
                        &item.ticker,
                        &item.name,
                        item.country,
                        &analysis.report,
                        item.amount(),
                    ),
                });
            }
        }

        let entries: Vec<MorningEntry<'_>> = items
            .iter()
            .zip(&analyses)
            .map(|(item, a)| MorningEntry {
                item,
                report: a.as_ref().map(|a| &a.report),
            })
            .collect();
        let n = report::morning_report(&user.name, today, &entries, self.check_interval_minutes);
        replies.push(Reply::Text(n.text()));
        Ok(replies)
    }

    async fn ticker_status(&self, user: &User, ticker: &str, today: NaiveDate) -> Result<Vec<Reply>> {
        let analysis = self
            .collector
            .analyze(ticker, today)
            .await
            .map_err(|_| anyhow::anyhow!(report::analysis_failed(ticker)))?;
        let item = self.collector.db().get_watchlist_item(user.id, ticker)?;
        let country = Country::infer(ticker);
        let amount = item
            .as_ref()
            .map(|i| i.amount())
            .unwrap_or_else(|| country.default_investment());
        let name = item
            .as_ref()
            .map(|i| i.name.clone())
            .or_else(|| analysis.stats.ticker_name.clone())
            .unwrap_or_else(|| ticker.to_string());

        let mut out = report::ticker_summary(ticker, &name, country, &analysis.report, amount);
        match self.collector.provider().quote(ticker).await {
            Ok(quote) => {
                let drop = drop_rate(analysis.stats.current_price, quote.price);
                out.push_str(&format!(
                    "\nLive {} ({} vs last close)",
                    report::format_price(quote.price, country),
                    report::format_pct(-drop)
                ));
            }
            Err(e) => warn!(ticker, "Live quote unavailable: {:#}", e),
        }
        Ok(vec![Reply::Text(out)])
    }
}
