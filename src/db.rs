use std::{env, fs, path::Path};

use chrono::Utc;
use sqlx::SqlitePool;

use crate::{
    auth::{hash_password, new_id},
    models::{AppointmentRow, ProjectRow, UserRow, PROJECT_PLANNED, ROLE_ADMIN, ROLE_EMPLOYEE},
};

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

pub fn ensure_sqlite_dir(db_url: &str) -> std::io::Result<()> {
    let path = if let Some(path) = db_url.strip_prefix("sqlite://") {
        Some(path)
    } else if let Some(path) = db_url.strip_prefix("sqlite:") {
        Some(path)
    } else {
        None
    };

    let Some(path) = path else {
        return Ok(());
    };

    let path = path.split('?').next().unwrap_or(path);
    if path == ":memory:" || path.is_empty() {
        return Ok(());
    }

    let path = path.strip_prefix("file:").unwrap_or(path);
    let db_path = Path::new(path);
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub async fn seed_defaults(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    seed_admin(pool).await?;
    seed_employee(pool).await?;
    Ok(())
}

pub async fn fetch_user(
    pool: &SqlitePool,
    user_id: &str,
) -> Result<Option<UserRow>, sqlx::Error> {
    sqlx::query_as::<_, UserRow>(
        r#"SELECT id, username, display_name, email, role, password_hash, active, joined_date, created_at
           FROM users
           WHERE id = ?
           LIMIT 1"#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

pub async fn fetch_appointment(
    pool: &SqlitePool,
    appointment_id: &str,
) -> Result<Option<AppointmentRow>, sqlx::Error> {
    sqlx::query_as::<_, AppointmentRow>(
        r#"SELECT id, customer_id, vehicle, service, date, start_time, end_time, status, employee_id, requested_at
           FROM appointments
           WHERE id = ?
           LIMIT 1"#,
    )
    .bind(appointment_id)
    .fetch_optional(pool)
    .await
}

pub async fn fetch_project(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<Option<ProjectRow>, sqlx::Error> {
    sqlx::query_as::<_, ProjectRow>(
        r#"SELECT id, customer_id, name, description, status, start_date, end_date
           FROM projects
           WHERE id = ?
           LIMIT 1"#,
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await
}

pub async fn insert_user(
    pool: &SqlitePool,
    username: &str,
    display_name: &str,
    email: &str,
    role: &str,
    password: &str,
) -> Result<String, sqlx::Error> {
    let password_hash =
        hash_password(password).map_err(|_| sqlx::Error::Protocol("password hash failed".into()))?;
    let id = new_id();
    let now = Utc::now().to_rfc3339();

    sqlx::query(
        r#"INSERT INTO users (id, username, display_name, email, role, password_hash, active, joined_date, created_at)
           VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)"#,
    )
    .bind(&id)
    .bind(username)
    .bind(display_name)
    .bind(email)
    .bind(role)
    .bind(password_hash)
    .bind(Utc::now().date_naive().to_string())
    .bind(now)
    .execute(pool)
    .await?;

    Ok(id)
}

/// New projects always start out planned; progress entries move them on
/// from there.
pub async fn insert_project(
    pool: &SqlitePool,
    customer_id: &str,
    name: &str,
    description: Option<&str>,
    start_date: Option<&str>,
) -> Result<String, sqlx::Error> {
    let id = new_id();
    sqlx::query(
        r#"INSERT INTO projects (id, customer_id, name, description, status, start_date, end_date)
           VALUES (?, ?, ?, ?, ?, ?, NULL)"#,
    )
    .bind(&id)
    .bind(customer_id)
    .bind(name)
    .bind(description)
    .bind(PROJECT_PLANNED)
    .bind(start_date)
    .execute(pool)
    .await?;

    Ok(id)
}

async fn seed_admin(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let existing =
        sqlx::query_as::<_, (String,)>("SELECT id FROM users WHERE role = ? LIMIT 1")
            .bind(ROLE_ADMIN)
            .fetch_optional(pool)
            .await?;

    if existing.is_some() {
        return Ok(());
    }

    let username = env::var("ADMIN_USER").unwrap_or_else(|_| "admin".to_string());
    let password = env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "admin".to_string());
    let display_name =
        env::var("ADMIN_DISPLAY_NAME").unwrap_or_else(|_| "Workshop Admin".to_string());
    let email = env::var("ADMIN_EMAIL").unwrap_or_else(|_| "admin@servicebay.local".to_string());

    if password == "admin" {
        log::warn!("ADMIN_PASSWORD not set. Using default password 'admin'. Set ADMIN_PASSWORD in production.");
    }

    insert_user(pool, &username, &display_name, &email, ROLE_ADMIN, &password).await?;
    Ok(())
}

async fn seed_employee(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let employee_seed = env::var("SEED_EMPLOYEE").unwrap_or_else(|_| "false".to_string());
    if employee_seed != "true" {
        return Ok(());
    }

    let existing =
        sqlx::query_as::<_, (String,)>("SELECT id FROM users WHERE role = ? LIMIT 1")
            .bind(ROLE_EMPLOYEE)
            .fetch_optional(pool)
            .await?;
    if existing.is_some() {
        return Ok(());
    }

    let username = env::var("EMPLOYEE_USER").unwrap_or_else(|_| "mechanic1".to_string());
    let password = env::var("EMPLOYEE_PASSWORD").unwrap_or_else(|_| "change-me".to_string());
    let display_name =
        env::var("EMPLOYEE_DISPLAY_NAME").unwrap_or_else(|_| "Mechanic One".to_string());
    let email =
        env::var("EMPLOYEE_EMAIL").unwrap_or_else(|_| "mechanic1@servicebay.local".to_string());

    if password == "change-me" {
        log::warn!("EMPLOYEE_PASSWORD not set. Using default password 'change-me'. Set EMPLOYEE_PASSWORD in production.");
    }

    insert_user(pool, &username, &display_name, &email, ROLE_EMPLOYEE, &password).await?;
    Ok(())
}
