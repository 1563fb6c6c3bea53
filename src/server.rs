use crate::errors::AppError;
use crate::models::{
    AttendanceRecord, BooleanResponse, ClearWidgetsResponse, DecideLeaveRequestPayload, ErrorResponse,
    PinWidgetPayload, PostAnnouncementPayload, QueryCatalogEntry, QueryRequest, QueryResponse,
    RenameWidgetPayload, SaveWidgetLayoutsPayload, SubmitLeaveRequestPayload,
};
use crate::AppCore;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(value: AppError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), error = %self.0, "request failed");
        } else {
            tracing::debug!(code = self.0.code(), error = %self.0, "request rejected");
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerQuery {
    #[serde(default)]
    pub owner_id: Option<String>,
}

impl OwnerQuery {
    fn require(self) -> Result<String, ApiError> {
        self.owner_id
            .filter(|owner_id| !owner_id.trim().is_empty())
            .ok_or_else(|| ApiError(AppError::InvalidParams("ownerId query parameter is required".to_string())))
    }
}

pub fn router(core: Arc<AppCore>) -> Router {
    Router::new()
        .route("/api/query", post(run_query))
        .route("/api/queries", get(list_queries))
        .route(
            "/api/widgets",
            get(list_widgets).post(pin_widget).delete(clear_widgets),
        )
        .route("/api/widgets/layouts", put(save_widget_layouts))
        .route("/api/widgets/{id}", patch(rename_widget).delete(unpin_widget))
        .route("/api/leave-requests", post(submit_leave_request))
        .route("/api/leave-requests/{id}/decision", post(decide_leave_request))
        .route("/api/attendance", put(record_attendance))
        .route("/api/announcements", post(post_announcement))
        .with_state(core)
}

fn parse_body<T: DeserializeOwned>(bytes: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(bytes)
        .map_err(|error| ApiError(AppError::InvalidParams(format!("malformed request body: {}", error))))
}

pub async fn run_query(State(core): State<Arc<AppCore>>, bytes: Bytes) -> ApiResult<QueryResponse> {
    let request: QueryRequest = parse_body(&bytes)?;
    Ok(Json(core.resolve_query(request).await?))
}

pub async fn list_queries(State(core): State<Arc<AppCore>>) -> Json<Vec<QueryCatalogEntry>> {
    Json(core.registry().catalog())
}

pub async fn list_widgets(
    State(core): State<Arc<AppCore>>,
    Query(owner): Query<OwnerQuery>,
) -> ApiResult<Vec<crate::models::PinnedWidget>> {
    let owner_id = owner.require()?;
    Ok(Json(core.db().list_widgets(&owner_id)?))
}

pub async fn pin_widget(State(core): State<Arc<AppCore>>, bytes: Bytes) -> Result<Response, ApiError> {
    let payload: PinWidgetPayload = parse_body(&bytes)?;
    let widget = core.db().pin_widget(&payload)?;
    Ok((StatusCode::CREATED, Json(widget)).into_response())
}

pub async fn rename_widget(
    State(core): State<Arc<AppCore>>,
    Path(widget_id): Path<String>,
    bytes: Bytes,
) -> ApiResult<crate::models::PinnedWidget> {
    let payload: RenameWidgetPayload = parse_body(&bytes)?;
    Ok(Json(core.db().rename_widget(&payload.owner_id, &widget_id, &payload.title)?))
}

pub async fn unpin_widget(
    State(core): State<Arc<AppCore>>,
    Path(widget_id): Path<String>,
    Query(owner): Query<OwnerQuery>,
) -> ApiResult<BooleanResponse> {
    let owner_id = owner.require()?;
    let success = core.db().unpin_widget(&owner_id, &widget_id)?;
    Ok(Json(BooleanResponse { success }))
}

pub async fn save_widget_layouts(State(core): State<Arc<AppCore>>, bytes: Bytes) -> ApiResult<BooleanResponse> {
    let payload: SaveWidgetLayoutsPayload = parse_body(&bytes)?;
    core.db().save_widget_layouts(&payload.owner_id, &payload.layouts)?;
    Ok(Json(BooleanResponse { success: true }))
}

pub async fn clear_widgets(
    State(core): State<Arc<AppCore>>,
    Query(owner): Query<OwnerQuery>,
) -> ApiResult<ClearWidgetsResponse> {
    let owner_id = owner.require()?;
    let removed = core.db().clear_widgets(&owner_id)?;
    Ok(Json(ClearWidgetsResponse { removed }))
}

pub async fn submit_leave_request(State(core): State<Arc<AppCore>>, bytes: Bytes) -> Result<Response, ApiError> {
    let payload: SubmitLeaveRequestPayload = parse_body(&bytes)?;
    let record = core.submit_leave_request(&payload)?;
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecisionBody {
    approver_id: String,
    approve: bool,
}

pub async fn decide_leave_request(
    State(core): State<Arc<AppCore>>,
    Path(request_id): Path<String>,
    bytes: Bytes,
) -> ApiResult<crate::models::LeaveRequestRecord> {
    let body: DecisionBody = parse_body(&bytes)?;
    let record = core.decide_leave_request(&DecideLeaveRequestPayload {
        request_id,
        approver_id: body.approver_id,
        approve: body.approve,
    })?;
    Ok(Json(record))
}

pub async fn record_attendance(State(core): State<Arc<AppCore>>, bytes: Bytes) -> ApiResult<AttendanceRecord> {
    let record: AttendanceRecord = parse_body(&bytes)?;
    Ok(Json(core.record_attendance(&record)?))
}

pub async fn post_announcement(State(core): State<Arc<AppCore>>, bytes: Bytes) -> Result<Response, ApiError> {
    let payload: PostAnnouncementPayload = parse_body(&bytes)?;
    let announcement = core.post_announcement(&payload)?;
    Ok((StatusCode::CREATED, Json(announcement)).into_response())
}

#[cfg(test)]
mod tests {
    use super::{
        clear_widgets, list_queries, list_widgets, pin_widget, rename_widget, run_query, save_widget_layouts,
        submit_leave_request, unpin_widget, OwnerQuery,
    };
    use crate::config::AppSettings;
    use crate::AppCore;
    use axum::body::{to_bytes, Bytes};
    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn core() -> (tempfile::TempDir, Arc<AppCore>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = AppSettings {
            data_dir: dir.path().to_path_buf(),
            ..AppSettings::default()
        };
        let core = AppCore::new(settings).expect("core");
        (dir, Arc::new(core))
    }

    fn owner(owner_id: &str) -> Query<OwnerQuery> {
        Query(OwnerQuery {
            owner_id: Some(owner_id.to_string()),
        })
    }

    fn body(value: Value) -> Bytes {
        Bytes::from(serde_json::to_vec(&value).expect("serialize body"))
    }

    async fn read(response: Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body bytes");
        let value = serde_json::from_slice(&bytes).expect("json body");
        (status, value)
    }

    #[tokio::test]
    async fn query_endpoint_wraps_data_with_id_and_timestamp() {
        let (_dir, core) = core();
        let response = run_query(
            State(core),
            body(json!({ "queryId": "leaveBalance", "params": { "employeeId": "ZP-1001" } })),
        )
        .await
        .into_response();
        let (status, value) = read(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["queryId"], "leaveBalance");
        assert!(value["timestamp"].is_string());
        assert_eq!(value["data"].as_array().expect("rows").len(), 2);
    }

    #[tokio::test]
    async fn query_errors_carry_a_code_and_status() {
        let (_dir, core) = core();

        let unknown = run_query(State(core.clone()), body(json!({ "queryId": "doesNotExist", "params": {} })))
            .await
            .into_response();
        let (status, value) = read(unknown).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["code"], "UNKNOWN_QUERY");
        assert!(value["error"].as_str().expect("message").contains("doesNotExist"));

        let malformed = run_query(State(core.clone()), Bytes::from_static(b"{not json"))
            .await
            .into_response();
        let (status, value) = read(malformed).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["code"], "INVALID_PARAMS");

        let missing = run_query(
            State(core),
            body(json!({ "queryId": "employeeProfile", "params": { "employeeId": "ZP-9999" } })),
        )
        .await
        .into_response();
        let (status, value) = read(missing).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(value["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn catalog_lists_every_query() {
        let (_dir, core) = core();
        let catalog = list_queries(State(core)).await.0;
        assert_eq!(catalog.len(), 7);
        assert!(catalog.iter().any(|entry| entry.query_id == "attendanceSummary"));
    }

    #[tokio::test]
    async fn widget_crud_round_trip() {
        let (_dir, core) = core();

        let created = pin_widget(
            State(core.clone()),
            body(json!({
                "ownerId": "ZP-1001",
                "componentName": "LeaveBalanceCard",
                "queryDescriptor": { "queryId": "leaveBalance", "params": { "employeeId": "ZP-1001" } },
                "title": "My Leave"
            })),
        )
        .await
        .expect("pin");
        let (status, widget) = read(created).await;
        assert_eq!(status, StatusCode::CREATED);
        let widget_id = widget["id"].as_str().expect("id").to_string();
        assert_eq!(widget["layout"], json!({ "x": 0, "y": 0, "w": 4, "h": 3 }));

        let renamed = rename_widget(
            State(core.clone()),
            Path(widget_id.clone()),
            body(json!({ "ownerId": "ZP-1001", "title": "Leave" })),
        )
        .await
        .expect("rename");
        assert_eq!(renamed.0.title, "Leave");

        let saved = save_widget_layouts(
            State(core.clone()),
            body(json!({
                "ownerId": "ZP-1001",
                "layouts": [{ "id": widget_id, "layout": { "x": 4, "y": 0, "w": 4, "h": 2 } }]
            })),
        )
        .await
        .expect("layouts");
        assert!(saved.0.success);

        let listed = list_widgets(State(core.clone()), owner("ZP-1001")).await.expect("list");
        assert_eq!(listed.0.len(), 1);
        assert_eq!(listed.0[0].layout.x, 4);
        let foreign = list_widgets(State(core.clone()), owner("ZP-1002")).await.expect("other owner");
        assert!(foreign.0.is_empty());

        let removed = unpin_widget(State(core.clone()), Path(widget_id), owner("ZP-1001"))
            .await
            .expect("unpin");
        assert!(removed.0.success);
        let cleared = clear_widgets(State(core), owner("ZP-1001")).await.expect("clear");
        assert_eq!(cleared.0.removed, 0);
    }

    #[tokio::test]
    async fn missing_owner_is_rejected() {
        let (_dir, core) = core();
        let response = list_widgets(State(core), Query(OwnerQuery::default()))
            .await
            .into_response();
        let (status, value) = read(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["code"], "INVALID_PARAMS");
    }

    #[tokio::test]
    async fn leave_submission_over_balance_is_a_conflict() {
        let (_dir, core) = core();
        let response = submit_leave_request(
            State(core),
            body(json!({
                "employeeId": "ZP-1002",
                "leaveType": "annual",
                "startDate": "2026-11-02",
                "endDate": "2026-11-27"
            })),
        )
        .await
        .into_response();
        let (status, value) = read(response).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(value["code"], "POLICY_DENIED");
    }
}
