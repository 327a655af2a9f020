//! Position Guard CLI
//!
//! Inspect protected positions, open test positions and manage exchange credentials.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use position_guard::db::NewPosition;
use position_guard::vault::encrypt_secret;
use position_guard::{AccountType, Config, Database, PositionSide, PositionStore};
use rust_decimal::Decimal;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "position-guard")]
#[command(about = "Stop-loss / take-profit protection for exchange positions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List open positions that have a stop-loss or take-profit
    Positions,

    /// Record an open position
    Open {
        #[arg(long)]
        portfolio: i64,

        /// Trading pair, e.g. BTCUSDT
        #[arg(long)]
        symbol: String,

        /// LONG or SHORT
        #[arg(long, default_value = "LONG")]
        side: PositionSide,

        /// SPOT or MARGIN
        #[arg(long, default_value = "SPOT")]
        account: AccountType,

        #[arg(long)]
        quantity: Decimal,

        #[arg(long)]
        entry: Decimal,

        #[arg(long)]
        stop_loss: Option<Decimal>,

        #[arg(long)]
        take_profit: Option<Decimal>,
    },

    /// Create a portfolio
    AddPortfolio {
        #[arg(long)]
        name: String,

        #[arg(long)]
        user: Option<i64>,
    },

    /// Store exchange API credentials for a portfolio (secret is encrypted)
    AddExchange {
        #[arg(long)]
        portfolio: i64,

        #[arg(long, default_value = "binance")]
        exchange: String,

        #[arg(long)]
        api_key: String,

        #[arg(long)]
        api_secret: String,
    },

    /// Show realised statistics for a portfolio
    Stats {
        #[arg(long)]
        portfolio: i64,

        /// Recalculate from closed positions instead of reading the stored figures
        #[arg(long)]
        refresh: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let config = Config::from_env()?;
    let db = Database::new(&config.database_path).await?;

    match cli.command {
        Commands::Positions => list_positions(&db).await?,
        Commands::Open {
            portfolio,
            symbol,
            side,
            account,
            quantity,
            entry,
            stop_loss,
            take_profit,
        } => {
            let new = NewPosition {
                portfolio_id: portfolio,
                symbol,
                side,
                account_type: account,
                quantity,
                entry_price: entry,
                stop_loss,
                take_profit,
            };
            open_position(&db, &new).await?
        }
        Commands::AddPortfolio { name, user } => {
            let id = db.create_portfolio(user, &name).await?;
            println!("{} portfolio {} ({})", "Created".green(), id, name);
        }
        Commands::AddExchange {
            portfolio,
            exchange,
            api_key,
            api_secret,
        } => add_exchange(&config, &db, portfolio, &exchange, &api_key, &api_secret).await?,
        Commands::Stats { portfolio, refresh } => show_stats(&db, portfolio, refresh).await?,
    }

    Ok(())
}

async fn list_positions(db: &Database) -> Result<()> {
    let positions = db.get_monitorable_positions().await?;

    println!("\n{}", "=".repeat(96));
    println!("  PROTECTED POSITIONS ({})", positions.len());
    println!("{}\n", "=".repeat(96));

    if positions.is_empty() {
        println!("  No open positions with a stop-loss or take-profit.\n");
        return Ok(());
    }

    println!(
        "  {:>5}  {:>9}  {:<10} {:<6} {:<6} {:>14} {:>14} {:>12} {:>12}",
        "ID", "PORTFOLIO", "SYMBOL", "SIDE", "ACCT", "QTY", "ENTRY", "STOP", "TARGET"
    );
    for p in &positions {
        let dash = || "-".to_string();
        let side = match p.side {
            PositionSide::Long => p.side.as_str().green(),
            PositionSide::Short => p.side.as_str().red(),
        };
        println!(
            "  {:>5}  {:>9}  {:<10} {:<6} {:<6} {:>14} {:>14} {:>12} {:>12}",
            p.id,
            p.portfolio_id,
            p.symbol,
            side,
            p.account_type.as_str(),
            p.quantity,
            p.entry_price,
            p.stop_loss.map(|d| d.to_string()).unwrap_or_else(dash),
            p.take_profit.map(|d| d.to_string()).unwrap_or_else(dash),
        );
        if let Some(warning) = &p.warning_message {
            println!("         {} {}", "!".yellow().bold(), warning.yellow());
        }
    }
    println!();
    Ok(())
}

async fn open_position(db: &Database, new: &NewPosition) -> Result<()> {
    if new.stop_loss.is_none() && new.take_profit.is_none() {
        println!(
            "{} position has no stop-loss or take-profit and will not be monitored",
            "Note:".yellow()
        );
    }
    let id = db.create_position(new).await?;
    println!(
        "{} position {} {} {} x {} @ {}",
        "Opened".green(),
        id,
        new.side,
        new.symbol.to_uppercase(),
        new.quantity,
        new.entry_price
    );
    println!("  A running server picks it up via POST /api/monitor/positions/{}", id);
    Ok(())
}

async fn add_exchange(
    config: &Config,
    db: &Database,
    portfolio: i64,
    exchange: &str,
    api_key: &str,
    api_secret: &str,
) -> Result<()> {
    let passphrase = config
        .credentials_passphrase
        .as_deref()
        .context("CREDENTIALS_PASSPHRASE must be set to store exchange credentials")?;

    let encrypted = encrypt_secret(api_secret, passphrase)?;
    let id = db
        .add_exchange_account(portfolio, exchange, api_key, &encrypted)
        .await?;

    println!(
        "{} {} account {} for portfolio {} (previous accounts deactivated)",
        "Stored".green(),
        exchange,
        id,
        portfolio
    );
    Ok(())
}

async fn show_stats(db: &Database, portfolio: i64, refresh: bool) -> Result<()> {
    let stored = if refresh {
        None
    } else {
        db.get_portfolio_stats(portfolio).await?
    };
    let stats = match stored {
        Some(stats) => stats,
        None => db.recalculate_portfolio_stats(portfolio).await?,
    };

    let win_rate = if stats.closed_positions > 0 {
        stats.winning_positions as f64 / stats.closed_positions as f64 * 100.0
    } else {
        0.0
    };
    let pnl = if stats.realized_pnl >= Decimal::ZERO {
        format!("{}", stats.realized_pnl).green()
    } else {
        format!("{}", stats.realized_pnl).red()
    };

    println!("\n{}", "=".repeat(50));
    println!("  PORTFOLIO {} STATISTICS", portfolio);
    println!("{}", "=".repeat(50));
    println!("  Closed positions: {}", stats.closed_positions);
    println!("  Winners:          {} ({:.1}%)", stats.winning_positions, win_rate);
    println!("  Realised P&L:     {}", pnl);
    if let Some(updated_at) = stats.updated_at {
        println!("  Updated:          {}", updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("{}\n", "=".repeat(50));
    Ok(())
}
