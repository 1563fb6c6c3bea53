use crate::db::{tables, Database};
use crate::errors::{AppError, AppResult};
use crate::models::LeaveStatus;
use crate::registry::{QueryParams, QueryRegistry};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;

pub mod ids {
    pub const LEAVE_BALANCE: &str = "leaveBalance";
    pub const LEAVE_REQUESTS: &str = "leaveRequests";
    pub const PENDING_APPROVALS: &str = "pendingApprovals";
    pub const ATTENDANCE_SUMMARY: &str = "attendanceSummary";
    pub const ANNOUNCEMENTS: &str = "announcements";
    pub const EMPLOYEE_PROFILE: &str = "employeeProfile";
    pub const TEAM_DIRECTORY: &str = "teamDirectory";
}

pub const DEFAULT_ANNOUNCEMENT_LIMIT: u32 = 10;
pub const MAX_ANNOUNCEMENT_LIMIT: u32 = 50;

static EMPLOYEE_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{2}-\d{4}$").expect("valid employee id regex"));
static MONTH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-(0[1-9]|1[0-2])$").expect("valid month regex"));

fn check_employee_id(field: &str, value: &str) -> AppResult<()> {
    if EMPLOYEE_ID_RE.is_match(value) {
        Ok(())
    } else {
        Err(AppError::InvalidParams(format!(
            "{} must look like ZP-1001, got '{}'",
            field, value
        )))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EmployeeParams {
    pub employee_id: String,
}

impl QueryParams for EmployeeParams {
    fn validate(&self) -> AppResult<()> {
        check_employee_id("employeeId", &self.employee_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LeaveRequestsParams {
    pub employee_id: String,
    #[serde(default)]
    pub status: Option<LeaveStatus>,
}

impl QueryParams for LeaveRequestsParams {
    fn validate(&self) -> AppResult<()> {
        check_employee_id("employeeId", &self.employee_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ManagerParams {
    pub manager_id: String,
}

impl QueryParams for ManagerParams {
    fn validate(&self) -> AppResult<()> {
        check_employee_id("managerId", &self.manager_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AttendanceParams {
    pub employee_id: String,
    pub month: String,
}

impl QueryParams for AttendanceParams {
    fn validate(&self) -> AppResult<()> {
        check_employee_id("employeeId", &self.employee_id)?;
        if !MONTH_RE.is_match(&self.month) {
            return Err(AppError::InvalidParams(format!(
                "month must be YYYY-MM, got '{}'",
                self.month
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AnnouncementParams {
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl AnnouncementParams {
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_ANNOUNCEMENT_LIMIT)
    }
}

impl QueryParams for AnnouncementParams {
    fn validate(&self) -> AppResult<()> {
        let limit = self.effective_limit();
        if !(1..=MAX_ANNOUNCEMENT_LIMIT).contains(&limit) {
            return Err(AppError::InvalidParams(format!(
                "limit must be between 1 and {}, got {}",
                MAX_ANNOUNCEMENT_LIMIT, limit
            )));
        }
        if self.audience.as_deref().is_some_and(|audience| audience.trim().is_empty()) {
            return Err(AppError::InvalidParams("audience must not be blank".to_string()));
        }
        Ok(())
    }
}

async fn leave_balance(db: Arc<Database>, params: EmployeeParams) -> AppResult<serde_json::Value> {
    let balances = db.leave_balances(&params.employee_id)?;
    Ok(serde_json::to_value(balances)?)
}

async fn leave_requests(db: Arc<Database>, params: LeaveRequestsParams) -> AppResult<serde_json::Value> {
    let requests = db.leave_requests(&params.employee_id, params.status)?;
    Ok(serde_json::to_value(requests)?)
}

async fn pending_approvals(db: Arc<Database>, params: ManagerParams) -> AppResult<serde_json::Value> {
    let requests = db.pending_approvals(&params.manager_id)?;
    Ok(serde_json::to_value(requests)?)
}

async fn attendance_summary(db: Arc<Database>, params: AttendanceParams) -> AppResult<serde_json::Value> {
    let summary = db.attendance_summary(&params.employee_id, &params.month)?;
    Ok(serde_json::to_value(summary)?)
}

async fn announcements(db: Arc<Database>, params: AnnouncementParams) -> AppResult<serde_json::Value> {
    let limit = params.effective_limit();
    let items = db.announcements(params.audience.as_deref().map(str::trim), limit)?;
    Ok(serde_json::to_value(items)?)
}

async fn employee_profile(db: Arc<Database>, params: EmployeeParams) -> AppResult<serde_json::Value> {
    let employee = db.employee_profile(&params.employee_id)?;
    Ok(serde_json::to_value(employee)?)
}

async fn team_directory(db: Arc<Database>, params: ManagerParams) -> AppResult<serde_json::Value> {
    let team = db.team_directory(&params.manager_id)?;
    Ok(serde_json::to_value(team)?)
}

pub fn hr_registry(db: Arc<Database>) -> AppResult<QueryRegistry> {
    let mut registry = QueryRegistry::new();

    let handle = Arc::clone(&db);
    registry.register(ids::LEAVE_BALANCE, &[tables::LEAVE_BALANCES], move |params| {
        leave_balance(Arc::clone(&handle), params)
    })?;

    let handle = Arc::clone(&db);
    registry.register(ids::LEAVE_REQUESTS, &[tables::LEAVE_REQUESTS], move |params| {
        leave_requests(Arc::clone(&handle), params)
    })?;

    let handle = Arc::clone(&db);
    registry.register(
        ids::PENDING_APPROVALS,
        &[tables::LEAVE_REQUESTS, tables::EMPLOYEES],
        move |params| pending_approvals(Arc::clone(&handle), params),
    )?;

    let handle = Arc::clone(&db);
    registry.register(ids::ATTENDANCE_SUMMARY, &[tables::ATTENDANCE], move |params| {
        attendance_summary(Arc::clone(&handle), params)
    })?;

    let handle = Arc::clone(&db);
    registry.register(ids::ANNOUNCEMENTS, &[tables::ANNOUNCEMENTS], move |params| {
        announcements(Arc::clone(&handle), params)
    })?;

    let handle = Arc::clone(&db);
    registry.register(ids::EMPLOYEE_PROFILE, &[tables::EMPLOYEES], move |params| {
        employee_profile(Arc::clone(&handle), params)
    })?;

    let handle = db;
    registry.register(ids::TEAM_DIRECTORY, &[tables::EMPLOYEES], move |params| {
        team_directory(Arc::clone(&handle), params)
    })?;

    Ok(registry)
}
