use crate::errors::{AppError, AppResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─── Query descriptors ──────────────────────────────────────────────────────

// A single query parameter: a scalar or a list of strings. Whole-valued
// numbers are always held as `Integer`, so `10` and `10.0` compare equal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
    TextList(Vec<String>),
}

impl ParamValue {
    pub fn number(value: f64) -> Self {
        // 2^63 is the first whole f64 outside the i64 range.
        let in_range = value >= i64::MIN as f64 && value < 9_223_372_036_854_775_808.0;
        if value.is_finite() && value.fract() == 0.0 && in_range {
            Self::Integer(value as i64)
        } else {
            Self::Number(value)
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawParamValue {
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
    TextList(Vec<String>),
}

impl<'de> Deserialize<'de> for ParamValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match RawParamValue::deserialize(deserializer)? {
            RawParamValue::Bool(value) => Self::Bool(value),
            RawParamValue::Integer(value) => Self::Integer(value),
            RawParamValue::Number(value) => Self::number(value),
            RawParamValue::Text(value) => Self::Text(value),
            RawParamValue::TextList(value) => Self::TextList(value),
        })
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::number(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(value: Vec<String>) -> Self {
        Self::TextList(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    pub query_id: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
}

impl QueryDescriptor {
    pub fn new(query_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn params_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or_else(|_| serde_json::json!({}))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query_id: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub data: serde_json::Value,
    pub query_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueryCatalogEntry {
    pub query_id: String,
    pub tables: Vec<String>,
}

// ─── Live query state ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LiveQueryPhase {
    Idle,
    Loading,
    Ready,
    Errored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveQueryState {
    pub phase: LiveQueryPhase,
    pub data: Option<serde_json::Value>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for LiveQueryState {
    fn default() -> Self {
        Self {
            phase: LiveQueryPhase::Idle,
            data: None,
            is_loading: false,
            error: None,
            error_code: None,
            updated_at: None,
        }
    }
}

// ─── Pinned widgets ─────────────────────────────────────────────────────────

pub const DEFAULT_WIDGET_WIDTH: i32 = 4;
pub const DEFAULT_WIDGET_HEIGHT: i32 = 3;
pub const MAX_GRID_EXTENT: i32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridLayout {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_w: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_h: Option<i32>,
}

impl GridLayout {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self {
            x,
            y,
            w,
            h,
            min_w: None,
            min_h: None,
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.x < 0 || self.y < 0 {
            return Err(AppError::InvalidParams(format!(
                "layout position must be non-negative (x={}, y={})",
                self.x, self.y
            )));
        }
        if self.w < 1 || self.h < 1 {
            return Err(AppError::InvalidParams(format!(
                "layout span must be at least 1x1 (w={}, h={})",
                self.w, self.h
            )));
        }
        if self.min_w.is_some_and(|min_w| self.w < min_w) || self.min_h.is_some_and(|min_h| self.h < min_h) {
            return Err(AppError::InvalidParams(
                "layout span is smaller than its minimum size".to_string(),
            ));
        }
        let within = |edge: Option<i32>| edge.is_some_and(|edge| edge <= MAX_GRID_EXTENT);
        if !within(self.right()) || !within(self.bottom()) {
            return Err(AppError::InvalidParams(format!(
                "layout must stay inside a {0}x{0} grid (x={1}, y={2}, w={3}, h={4})",
                MAX_GRID_EXTENT, self.x, self.y, self.w, self.h
            )));
        }
        Ok(())
    }

    pub fn right(&self) -> Option<i32> {
        self.x.checked_add(self.w)
    }

    pub fn bottom(&self) -> Option<i32> {
        self.y.checked_add(self.h)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinnedWidget {
    pub id: String,
    pub owner_id: String,
    pub component_name: String,
    pub query_descriptor: QueryDescriptor,
    pub title: String,
    pub layout: GridLayout,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinWidgetPayload {
    pub owner_id: String,
    pub component_name: String,
    pub query_descriptor: QueryDescriptor,
    pub title: String,
    pub layout: Option<GridLayout>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameWidgetPayload {
    pub owner_id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetLayoutItem {
    pub id: String,
    pub layout: GridLayout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveWidgetLayoutsPayload {
    pub owner_id: String,
    pub layouts: Vec<WidgetLayoutItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BooleanResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearWidgetsResponse {
    pub removed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetView {
    pub widget: PinnedWidget,
    pub state: LiveQueryState,
}

// ─── HR records ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersonaRole {
    Employee,
    Manager,
    Hr,
}

impl PersonaRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Employee => "employee",
            Self::Manager => "manager",
            Self::Hr => "hr",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Employee {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: PersonaRole,
    pub department: String,
    pub manager_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveBalance {
    pub employee_id: String,
    pub leave_type: String,
    pub total_days: f64,
    pub used_days: f64,
    pub remaining_days: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaveStatus {
    Pending,
    Approved,
    Rejected,
}

impl LeaveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRequestRecord {
    pub id: String,
    pub employee_id: String,
    pub employee_name: Option<String>,
    pub leave_type: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub days: f64,
    pub reason: Option<String>,
    pub status: LeaveStatus,
    pub approver_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitLeaveRequestPayload {
    pub employee_id: String,
    pub leave_type: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecideLeaveRequestPayload {
    pub request_id: String,
    pub approver_id: String,
    pub approve: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttendanceStatus {
    Present,
    Remote,
    Absent,
    OnLeave,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Remote => "remote",
            Self::Absent => "absent",
            Self::OnLeave => "on-leave",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub employee_id: String,
    pub work_date: NaiveDate,
    pub status: AttendanceStatus,
    pub check_in: Option<String>,
    pub check_out: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub employee_id: String,
    pub month: String,
    pub present_days: u32,
    pub remote_days: u32,
    pub absent_days: u32,
    pub leave_days: u32,
    pub records: Vec<AttendanceRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub id: String,
    pub title: String,
    pub body: String,
    pub audience: String,
    pub author_id: String,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostAnnouncementPayload {
    pub author_id: String,
    pub title: String,
    pub body: String,
    pub audience: Option<String>,
}
