//! Idempotent schema bootstrap.
//!
//! The service owns its schema and applies it at startup; every statement is
//! `IF NOT EXISTS` so restarts and concurrent instances are safe.

use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sales (
        sale_id      TEXT PRIMARY KEY,
        window_start TIMESTAMPTZ NOT NULL,
        window_end   TIMESTAMPTZ NOT NULL,
        total_items  BIGINT NOT NULL,
        status       VARCHAR NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL
    )",
    // Partial: a cancelled partial sale must not block its window, the next
    // alignment starts fresh with a new sale_id.
    "CREATE UNIQUE INDEX IF NOT EXISTS sales_window_start_key
        ON sales (window_start) WHERE status <> 'cancelled'",
    "CREATE TABLE IF NOT EXISTS items (
        sale_id    TEXT NOT NULL REFERENCES sales (sale_id) ON DELETE CASCADE,
        item_id    TEXT NOT NULL,
        name       TEXT NOT NULL,
        image_ref  TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (sale_id, item_id)
    )",
    "CREATE TABLE IF NOT EXISTS users (
        user_id    TEXT PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS checkouts (
        code       TEXT PRIMARY KEY,
        user_id    TEXT NOT NULL,
        item_id    TEXT NOT NULL,
        sale_id    TEXT NOT NULL,
        status     VARCHAR NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS checkouts_status_expires_idx
        ON checkouts (status, expires_at)",
    "CREATE TABLE IF NOT EXISTS purchases (
        purchase_id   TEXT PRIMARY KEY,
        user_id       TEXT NOT NULL,
        item_id       TEXT NOT NULL,
        sale_id       TEXT NOT NULL,
        checkout_code TEXT NOT NULL,
        created_at    TIMESTAMPTZ NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS purchases_sale_item_key
        ON purchases (sale_id, item_id)",
    "CREATE INDEX IF NOT EXISTS purchases_sale_user_idx
        ON purchases (sale_id, user_id)",
];

/// Applies the schema. Safe to call on every startup.
pub async fn migrate(db: &DatabaseConnection) -> Result<(), DbErr> {
    for statement in SCHEMA {
        db.execute_unprepared(statement).await?;
    }
    Ok(())
}
