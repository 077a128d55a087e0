use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, Row};
use std::fs;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

fn split_sql_statements(input: &str) -> Vec<String> {
    // Simple splitter suitable for our schema.sql (no functions / dollar-quoting).
    // Skips comments/whitespace-only segments.
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_single = false;

    for line in input.lines() {
        let trimmed = line.trim_start();
        if !in_single && trimmed.starts_with("--") {
            continue;
        }
        for ch in line.chars() {
            match ch {
                '\'' => {
                    in_single = !in_single;
                    cur.push(ch);
                }
                ';' if !in_single => {
                    let s = cur.trim();
                    if !s.is_empty() {
                        out.push(s.to_string());
                    }
                    cur.clear();
                }
                _ => cur.push(ch),
            }
        }
        cur.push('\n');
    }
    let s = cur.trim();
    if !s.is_empty() {
        out.push(s.to_string());
    }
    out
}

// Symbols and their market-data tokens for the seeded demo universe.
const SEED_INSTRUMENTS: &[(&str, &str, i64, Option<i64>, &str)] = &[
    ("RELIANCE", "EQUITY", 1, Some(738_561), "2950.00"),
    ("TCS", "EQUITY", 1, Some(2_953_217), "4100.00"),
    ("INFY", "EQUITY", 1, Some(408_065), "1850.00"),
    ("HDFCBANK", "EQUITY", 1, Some(341_249), "1650.00"),
    ("NIFTYFUT", "DERIVATIVE", 25, None, "24500.00"),
];

#[tokio::main]
async fn main() -> Result<()> {
    let db_url = env_required("DATABASE_URL")?;
    let min = env_u32("DB_MIN_POOL_SIZE", 5).max(1);
    let max = env_u32("DB_MAX_POOL_SIZE", 20).max(min);
    let acquire = env_u64("DB_ACQUIRE_TIMEOUT_SECONDS", 30).max(5);
    let schema_path = env_string("SCHEMA_PATH", "schema.sql");
    let demo_owner = env_string("DEMO_ACCOUNT_OWNER", "demo");
    let demo_funds = env_string("DEMO_ACCOUNT_FUNDS", "1000000");

    let db = PgPoolOptions::new()
        .min_connections(min)
        .max_connections(max)
        .acquire_timeout(Duration::from_secs(acquire))
        .connect(&db_url)
        .await
        .context("connect postgres")?;

    // Hard reset (clean schema). POSTGRES_USER in compose is a superuser in dev.
    sqlx::query("DROP SCHEMA IF EXISTS public CASCADE")
        .execute(&db)
        .await
        .context("drop public schema")?;
    sqlx::query("CREATE SCHEMA public")
        .execute(&db)
        .await
        .context("create public schema")?;

    let schema_sql =
        fs::read_to_string(&schema_path).with_context(|| format!("read {schema_path}"))?;
    for stmt in split_sql_statements(&schema_sql) {
        sqlx::query(&stmt)
            .execute(&db)
            .await
            .with_context(|| format!("exec schema stmt: {}", stmt.lines().next().unwrap_or("<empty>")))?;
    }

    for (symbol, segment, lot_size, quote_token, last_price) in SEED_INSTRUMENTS {
        sqlx::query(
            "INSERT INTO instruments (symbol, segment, lot_size, quote_token, last_price)
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (symbol) DO NOTHING",
        )
        .bind(symbol)
        .bind(segment)
        .bind(lot_size)
        .bind(quote_token)
        .bind(Decimal::from_str(last_price)?)
        .execute(&db)
        .await?;
    }

    let funds = Decimal::from_str(&demo_funds)
        .with_context(|| format!("invalid DEMO_ACCOUNT_FUNDS: {demo_funds}"))?;
    let account_row = sqlx::query(
        "INSERT INTO trading_accounts (owner, balance, available_margin)
         VALUES ($1, $2, $2) RETURNING id",
    )
    .bind(&demo_owner)
    .bind(funds)
    .fetch_one(&db)
    .await
    .context("insert demo account")?;
    let account_id: Uuid = account_row.get("id");

    sqlx::query(
        "INSERT INTO fund_transactions (account_id, amount, direction, kind, description)
         VALUES ($1, $2, 'CREDIT', 'DEPOSIT', 'initial funding')",
    )
    .bind(account_id)
    .bind(funds)
    .execute(&db)
    .await
    .context("insert funding ledger row")?;

    sqlx::query("INSERT INTO feature_flags (name, enabled) VALUES ('order_worker', TRUE)")
        .execute(&db)
        .await
        .context("insert worker flag")?;

    println!(
        "initialized: account_id={}, instruments={}, funds={}",
        account_id,
        SEED_INSTRUMENTS.len(),
        funds
    );

    Ok(())
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required env var: {key}"))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}
