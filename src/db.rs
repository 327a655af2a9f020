//! SQLite store for positions, exit orders, exchange accounts and portfolio statistics

use crate::types::{
    AccountType, ExitPnl, OrderSide, Position, PositionId, PositionSide, PositionStatus,
};
use crate::vault::EncryptedSecret;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

/// Maximum stored length of a position warning
pub const WARNING_MAX_LEN: usize = 255;

const POSITION_SELECT: &str =
    "SELECT p.*, pf.user_id AS user_id FROM positions p LEFT JOIN portfolios pf ON pf.id = p.portfolio_id";

/// Fields needed to open a position row
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub portfolio_id: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub account_type: AccountType,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// Active exchange account for a portfolio
#[derive(Debug, Clone)]
pub struct ExchangeAccount {
    pub id: i64,
    pub portfolio_id: i64,
    pub exchange: String,
    pub api_key: String,
    pub secret: EncryptedSecret,
}

/// Exit order as recorded alongside a close
#[derive(Debug, Clone)]
pub struct ExitOrder {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub quote_value: Decimal,
}

/// Everything persisted when a position closes
#[derive(Debug, Clone)]
pub struct CloseRecord {
    pub position_id: PositionId,
    pub exit: ExitPnl,
    pub order: ExitOrder,
    pub closed_at: DateTime<Utc>,
}

/// Aggregated statistics over a portfolio's closed positions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortfolioStats {
    pub portfolio_id: i64,
    pub closed_positions: i64,
    pub winning_positions: i64,
    pub realized_pnl: Decimal,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Storage operations the protection services depend on
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Every OPEN position with a stop-loss or take-profit
    async fn get_monitorable_positions(&self) -> Result<Vec<Position>>;

    async fn get_position(&self, id: PositionId) -> Result<Option<Position>>;

    async fn get_active_exchange(&self, portfolio_id: i64) -> Result<Option<ExchangeAccount>>;

    /// Mark the position CLOSED and insert its exit order, atomically
    async fn record_close(&self, record: &CloseRecord) -> Result<()>;

    /// Store a user-visible warning on the position (bounded length)
    async fn set_warning(&self, id: PositionId, message: &str) -> Result<()>;

    async fn recalculate_portfolio_stats(&self, portfolio_id: i64) -> Result<PortfolioStats>;
}

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// Private in-memory database (single connection so every query sees the same data)
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// Initialize database schema
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS portfolios (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                portfolio_id INTEGER NOT NULL REFERENCES portfolios(id),
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                account_type TEXT NOT NULL DEFAULT 'SPOT',
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                entry_value TEXT NOT NULL,
                stop_loss TEXT,
                take_profit TEXT,
                status TEXT NOT NULL DEFAULT 'OPEN',
                exit_price TEXT,
                exit_value TEXT,
                pnl TEXT,
                pnl_percent TEXT,
                warning_message TEXT,
                opened_at TEXT NOT NULL,
                closed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id INTEGER NOT NULL REFERENCES positions(id),
                exchange_order_id TEXT NOT NULL,
                client_order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                quote_value TEXT NOT NULL,
                purpose TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS exchange_accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                portfolio_id INTEGER NOT NULL REFERENCES portfolios(id),
                exchange TEXT NOT NULL,
                api_key TEXT NOT NULL,
                secret_ciphertext BLOB NOT NULL,
                secret_salt BLOB NOT NULL,
                secret_nonce BLOB NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS portfolio_stats (
                portfolio_id INTEGER PRIMARY KEY REFERENCES portfolios(id),
                closed_positions INTEGER NOT NULL,
                winning_positions INTEGER NOT NULL,
                realized_pnl TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Startup load filters on status + thresholds
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_portfolio ON positions(portfolio_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_position ON orders(position_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_exchange_accounts_portfolio ON exchange_accounts(portfolio_id, is_active)",
        )
        .execute(&self.pool)
        .await?;

        info!("Database initialized");
        Ok(())
    }

    /// Create a portfolio, returning its id
    pub async fn create_portfolio(&self, user_id: Option<i64>, name: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO portfolios (user_id, name, created_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(name)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Record a new OPEN position
    pub async fn create_position(&self, new: &NewPosition) -> Result<PositionId> {
        let entry_value = new.quantity * new.entry_price;

        let result = sqlx::query(
            r#"
            INSERT INTO positions (portfolio_id, symbol, side, account_type, quantity, entry_price,
                                   entry_value, stop_loss, take_profit, status, opened_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'OPEN', ?)
            "#,
        )
        .bind(new.portfolio_id)
        .bind(new.symbol.to_uppercase())
        .bind(new.side.as_str())
        .bind(new.account_type.as_str())
        .bind(new.quantity.to_string())
        .bind(new.entry_price.to_string())
        .bind(entry_value.to_string())
        .bind(new.stop_loss.map(|d| d.to_string()))
        .bind(new.take_profit.map(|d| d.to_string()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Store exchange credentials; earlier accounts of the portfolio are deactivated
    pub async fn add_exchange_account(
        &self,
        portfolio_id: i64,
        exchange: &str,
        api_key: &str,
        secret: &EncryptedSecret,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE exchange_accounts SET is_active = 0 WHERE portfolio_id = ?")
            .bind(portfolio_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO exchange_accounts (portfolio_id, exchange, api_key, secret_ciphertext,
                                           secret_salt, secret_nonce, is_active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(portfolio_id)
        .bind(exchange)
        .bind(api_key)
        .bind(&secret.ciphertext[..])
        .bind(&secret.salt[..])
        .bind(&secret.nonce[..])
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    /// Latest stored statistics for a portfolio
    pub async fn get_portfolio_stats(&self, portfolio_id: i64) -> Result<Option<PortfolioStats>> {
        let row = sqlx::query("SELECT * FROM portfolio_stats WHERE portfolio_id = ?")
            .bind(portfolio_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let pnl: String = r.get("realized_pnl");
                let updated_at: String = r.get("updated_at");
                Ok(Some(PortfolioStats {
                    portfolio_id: r.get("portfolio_id"),
                    closed_positions: r.get("closed_positions"),
                    winning_positions: r.get("winning_positions"),
                    realized_pnl: Decimal::from_str(&pnl)?,
                    updated_at: Some(DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc)),
                }))
            }
            None => Ok(None),
        }
    }

    /// Number of exit orders recorded for a position
    pub async fn count_exit_orders(&self, position_id: PositionId) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM orders WHERE position_id = ? AND purpose = 'EXIT'",
        )
        .bind(position_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }

    fn row_to_position(&self, row: &sqlx::sqlite::SqliteRow) -> Result<Position> {
        let decimal = |col: &str| -> Result<Decimal> {
            let s: String = row.get(col);
            Decimal::from_str(&s).with_context(|| format!("bad decimal in column {}", col))
        };
        let optional_decimal = |col: &str| -> Result<Option<Decimal>> {
            let s: Option<String> = row.get(col);
            s.map(|s| Decimal::from_str(&s).with_context(|| format!("bad decimal in column {}", col)))
                .transpose()
        };

        let side_str: String = row.get("side");
        let account_str: String = row.get("account_type");
        let status_str: String = row.get("status");
        let status = match status_str.as_str() {
            "OPEN" => PositionStatus::Open,
            _ => PositionStatus::Closed,
        };

        let opened_at_str: String = row.get("opened_at");
        let closed_at: Option<String> = row.get("closed_at");

        Ok(Position {
            id: row.get("id"),
            portfolio_id: row.get("portfolio_id"),
            user_id: row.try_get("user_id").unwrap_or(None),
            symbol: row.get("symbol"),
            side: PositionSide::from_str(&side_str)?,
            account_type: AccountType::from_str(&account_str)?,
            quantity: decimal("quantity")?,
            entry_price: decimal("entry_price")?,
            entry_value: decimal("entry_value")?,
            stop_loss: optional_decimal("stop_loss")?,
            take_profit: optional_decimal("take_profit")?,
            status,
            exit_price: optional_decimal("exit_price")?,
            exit_value: optional_decimal("exit_value")?,
            pnl: optional_decimal("pnl")?,
            pnl_percent: optional_decimal("pnl_percent")?,
            warning_message: row.get("warning_message"),
            opened_at: DateTime::parse_from_rfc3339(&opened_at_str)?.with_timezone(&Utc),
            closed_at: closed_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|d| d.with_timezone(&Utc)),
        })
    }
}

/// Cut a warning to the column bound on a char boundary
fn bounded_warning(message: &str) -> String {
    message.chars().take(WARNING_MAX_LEN).collect()
}

#[async_trait]
impl PositionStore for Database {
    async fn get_monitorable_positions(&self) -> Result<Vec<Position>> {
        let sql = format!(
            "{} WHERE p.status = 'OPEN' AND (p.stop_loss IS NOT NULL OR p.take_profit IS NOT NULL) ORDER BY p.id",
            POSITION_SELECT
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.row_to_position(row) {
                Ok(p) => positions.push(p),
                Err(e) => {
                    let id: PositionId = row.get("id");
                    tracing::warn!("Skipping unreadable position {}: {:#}", id, e)
                }
            }
        }
        Ok(positions)
    }

    async fn get_position(&self, id: PositionId) -> Result<Option<Position>> {
        let sql = format!("{} WHERE p.id = ?", POSITION_SELECT);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;

        match row {
            Some(r) => Ok(Some(self.row_to_position(&r)?)),
            None => Ok(None),
        }
    }

    async fn get_active_exchange(&self, portfolio_id: i64) -> Result<Option<ExchangeAccount>> {
        let row = sqlx::query(
            "SELECT * FROM exchange_accounts WHERE portfolio_id = ? AND is_active = 1 ORDER BY id DESC LIMIT 1",
        )
        .bind(portfolio_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ExchangeAccount {
            id: r.get("id"),
            portfolio_id: r.get("portfolio_id"),
            exchange: r.get("exchange"),
            api_key: r.get("api_key"),
            secret: EncryptedSecret {
                ciphertext: r.get("secret_ciphertext"),
                salt: r.get("secret_salt"),
                nonce: r.get("secret_nonce"),
            },
        }))
    }

    async fn record_close(&self, record: &CloseRecord) -> Result<()> {
        let closed_at = record.closed_at.to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE positions
            SET status = 'CLOSED', exit_price = ?, exit_value = ?, pnl = ?, pnl_percent = ?,
                closed_at = ?, warning_message = NULL
            WHERE id = ? AND status = 'OPEN'
            "#,
        )
        .bind(record.exit.exit_price.to_string())
        .bind(record.exit.exit_value.to_string())
        .bind(record.exit.pnl.to_string())
        .bind(record.exit.pnl_percent.round_dp(4).to_string())
        .bind(&closed_at)
        .bind(record.position_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            anyhow::bail!("Position {} is not open; close not recorded", record.position_id);
        }

        sqlx::query(
            r#"
            INSERT INTO orders (position_id, exchange_order_id, client_order_id, symbol, side,
                                order_type, quantity, price, quote_value, purpose, created_at)
            VALUES (?, ?, ?, ?, ?, 'MARKET', ?, ?, ?, 'EXIT', ?)
            "#,
        )
        .bind(record.position_id)
        .bind(&record.order.exchange_order_id)
        .bind(&record.order.client_order_id)
        .bind(&record.order.symbol)
        .bind(record.order.side.as_str())
        .bind(record.order.quantity.to_string())
        .bind(record.order.price.to_string())
        .bind(record.order.quote_value.to_string())
        .bind(&closed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_warning(&self, id: PositionId, message: &str) -> Result<()> {
        sqlx::query("UPDATE positions SET warning_message = ? WHERE id = ?")
            .bind(bounded_warning(message))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recalculate_portfolio_stats(&self, portfolio_id: i64) -> Result<PortfolioStats> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT pnl FROM positions WHERE portfolio_id = ? AND status = 'CLOSED' AND pnl IS NOT NULL",
        )
        .bind(portfolio_id)
        .fetch_all(&self.pool)
        .await?;

        // Summed in Decimal rather than SQL REAL to keep exact P&L
        let mut stats = PortfolioStats {
            portfolio_id,
            updated_at: Some(Utc::now()),
            ..Default::default()
        };
        for (pnl,) in rows {
            let pnl = Decimal::from_str(&pnl)?;
            stats.closed_positions += 1;
            if pnl > Decimal::ZERO {
                stats.winning_positions += 1;
            }
            stats.realized_pnl += pnl;
        }

        sqlx::query(
            r#"
            INSERT INTO portfolio_stats (portfolio_id, closed_positions, winning_positions, realized_pnl, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(portfolio_id) DO UPDATE SET
                closed_positions = excluded.closed_positions,
                winning_positions = excluded.winning_positions,
                realized_pnl = excluded.realized_pnl,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(portfolio_id)
        .bind(stats.closed_positions)
        .bind(stats.winning_positions)
        .bind(stats.realized_pnl.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(stats)
    }
}
