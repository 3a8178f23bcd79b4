use serde::Serialize;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_EMPLOYEE: &str = "employee";
pub const ROLE_CUSTOMER: &str = "customer";

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_UPCOMING: &str = "upcoming";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_CANCELLED: &str = "cancelled";

pub const PROJECT_PLANNED: &str = "planned";
pub const PROJECT_IN_PROGRESS: &str = "in_progress";
pub const PROJECT_ON_HOLD: &str = "on_hold";
pub const PROJECT_COMPLETED: &str = "completed";
pub const PROJECT_CANCELLED: &str = "cancelled";

pub const NOTIFICATION_PROGRESS_UPDATE: &str = "progress_update";

#[allow(dead_code)]
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub role: String,
    pub password_hash: String,
    pub active: i64,
    pub joined_date: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AppointmentRow {
    pub id: String,
    pub customer_id: String,
    pub vehicle: String,
    pub service: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub status: String,
    pub employee_id: Option<String>,
    pub requested_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProjectRow {
    pub id: String,
    pub customer_id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ProgressRow {
    pub id: i64,
    pub subject_kind: String,
    pub subject_id: String,
    pub stage: String,
    pub percentage: i64,
    pub remarks: Option<String>,
    pub updated_by: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct NotificationRow {
    pub id: String,
    pub user_id: String,
    pub r#type: String,
    pub message: String,
    pub is_read: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BlockedIntervalRow {
    pub id: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub reason: String,
    pub created_at: String,
}
