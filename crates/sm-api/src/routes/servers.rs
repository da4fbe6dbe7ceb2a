use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use uuid::Uuid;

use sm_db::ServerFilter;
use sm_db::models::{ServerAction, ServerState};

use crate::dto::{
    ActionRequest, ActionResponse, EventLogResponse, ListQuery, ProvisionRequest,
    ProvisionResponse, ServerResponse,
};
use crate::error::ApiError;
use crate::state::AppState;

/// Events returned by the logs endpoint, at most.
const LOGS_LIMIT: i64 = 100;

pub async fn provision_server(
    State(state): State<AppState>,
    Json(req): Json<ProvisionRequest>,
) -> Result<(StatusCode, Json<ProvisionResponse>), ApiError> {
    let id = state.service.provision(&req.region, &req.server_type).await?;
    Ok((StatusCode::CREATED, Json(ProvisionResponse { id })))
}

pub async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServerResponse>, ApiError> {
    let id = parse_id(&id)?;
    let detail = state.service.get(id).await?;
    Ok(Json(ServerResponse::from(detail)))
}

pub async fn list_servers(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ServerResponse>>, ApiError> {
    // An unknown status can never match a row; short-circuit rather than
    // handing the store a value outside the state enum.
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => match raw.parse::<ServerState>() {
            Ok(state) => Some(state),
            Err(()) => return Ok(Json(Vec::new())),
        },
    };

    let filter = ServerFilter {
        region: query.region.filter(|r| !r.is_empty()),
        state: status,
        server_type: query.server_type.filter(|t| !t.is_empty()),
        limit: query.limit.and_then(|raw| raw.parse().ok()).unwrap_or(0),
        offset: query.offset.and_then(|raw| raw.parse().ok()).unwrap_or(0),
    };

    let servers = state.service.list(filter).await?;
    Ok(Json(servers.into_iter().map(ServerResponse::from).collect()))
}

pub async fn server_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ActionRequest>,
) -> Result<Json<ActionResponse>, ApiError> {
    // Reject unknown actions before touching any server state.
    let action: ServerAction = req
        .action
        .parse()
        .map_err(|()| ApiError::InvalidAction(req.action.clone()))?;
    let id = parse_id(&id)?;

    state.service.action(id, action).await?;
    Ok(Json(ActionResponse {
        result: format!("Action '{action}' initiated successfully"),
    }))
}

pub async fn server_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<EventLogResponse>>, ApiError> {
    let id = parse_id(&id)?;
    let events = state.service.last_events(id, LOGS_LIMIT).await?;
    if events.is_empty() {
        return Err(ApiError::NotFound);
    }
    Ok(Json(events.into_iter().map(EventLogResponse::from).collect()))
}

// IDs are opaque strings at the HTTP boundary; anything that is not a UUID
// cannot name a server, so it reads as absent rather than malformed.
fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound)
}
