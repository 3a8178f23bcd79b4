use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::{
    auth::new_id,
    db,
    models::{ROLE_CUSTOMER, ROLE_EMPLOYEE},
};

/// Fresh in-memory database with the real migrations applied. Single
/// connection, since each in-memory connection is its own database.
pub async fn pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    db::run_migrations(&pool).await.expect("migrations");
    pool
}

pub async fn customer(pool: &SqlitePool, username: &str) -> String {
    db::insert_user(
        pool,
        username,
        &format!("Customer {username}"),
        &format!("{username}@example.com"),
        ROLE_CUSTOMER,
        "password",
    )
    .await
    .expect("insert customer")
}

pub async fn employee(pool: &SqlitePool, username: &str) -> String {
    db::insert_user(
        pool,
        username,
        &format!("Employee {username}"),
        &format!("{username}@example.com"),
        ROLE_EMPLOYEE,
        "password",
    )
    .await
    .expect("insert employee")
}

pub async fn block(pool: &SqlitePool, date: &str, start: &str, end: &str, reason: &str) {
    sqlx::query(
        "INSERT INTO blocked_intervals (id, date, start_time, end_time, reason, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(new_id())
    .bind(date)
    .bind(start)
    .bind(end)
    .bind(reason)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await
    .expect("insert blocked interval");
}

pub async fn project(pool: &SqlitePool, customer_id: &str, name: &str, status: &str) -> String {
    let id = new_id();
    sqlx::query(
        "INSERT INTO projects (id, customer_id, name, description, status) VALUES (?, ?, ?, NULL, ?)",
    )
    .bind(&id)
    .bind(customer_id)
    .bind(name)
    .bind(status)
    .execute(pool)
    .await
    .expect("insert project");
    id
}
