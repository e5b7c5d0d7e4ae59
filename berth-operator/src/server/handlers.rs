//! HTTP request handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::dispatcher::PollOutcome;
use crate::error::{ApiResult, AppError};
use crate::server::auth::{AgentCredential, Session};
use crate::server::AppState;
use berth_core::models::{Application, DataSource, DataSourceNode, DataSourceSpec, NodeUpdate};

#[derive(Debug, Deserialize)]
pub struct UpdateDataSource {
    #[serde(default)]
    instances: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateNode {
    #[serde(default)]
    host: String,
}

#[derive(Debug, Deserialize)]
pub struct PutApp {
    #[serde(default)]
    version: String,
}

/// Unpack a JSON body, reporting malformed bodies as invalid input.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AppError::InvalidInput(rejection.body_text()))
}

pub async fn list_data_sources(State(state): State<AppState>, session: Session) -> ApiResult<Json<Vec<DataSource>>> {
    let data_sources = state.platform.list_data_sources(session.account()).await?;
    Ok(Json(data_sources))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn create_data_source(
    State(state): State<AppState>, session: Session, payload: Result<Json<DataSourceSpec>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<DataSource>)> {
    let spec = body(payload)?;
    let ds = state.platform.create_data_source(session.account(), spec).await?;
    Ok((StatusCode::CREATED, Json(ds)))
}

#[tracing::instrument(level = "debug", skip(state, session, payload))]
pub async fn update_data_source(
    State(state): State<AppState>, session: Session, Path(name): Path<String>, payload: Result<Json<UpdateDataSource>, JsonRejection>,
) -> ApiResult<Json<DataSource>> {
    let update = body(payload)?;
    let ds = match update.instances {
        Some(instances) => state.platform.update_instances(session.account(), &name, instances).await?,
        None => state.platform.get_data_source(session.account(), &name).await?,
    };
    Ok(Json(ds))
}

#[tracing::instrument(level = "debug", skip(state, session))]
pub async fn delete_data_source(State(state): State<AppState>, session: Session, Path(name): Path<String>) -> ApiResult<StatusCode> {
    state.platform.delete_data_source(session.account(), &name).await?;
    Ok(StatusCode::OK)
}

#[tracing::instrument(level = "debug", skip(state, session))]
pub async fn link_app(State(state): State<AppState>, session: Session, Path((name, app)): Path<(String, String)>) -> ApiResult<StatusCode> {
    state.platform.link_app(session.account(), &name, &app).await?;
    Ok(StatusCode::OK)
}

#[tracing::instrument(level = "debug", skip(state, session))]
pub async fn unlink_app(State(state): State<AppState>, session: Session, Path((name, app)): Path<(String, String)>) -> ApiResult<StatusCode> {
    state.platform.unlink_app(session.account(), &name, &app).await?;
    Ok(StatusCode::OK)
}

pub async fn list_nodes(State(state): State<AppState>, session: Session, Path(name): Path<String>) -> ApiResult<Json<Vec<DataSourceNode>>> {
    let nodes = state.platform.list_nodes(session.account(), &name).await?;
    Ok(Json(nodes))
}

#[tracing::instrument(level = "debug", skip(state, agent, payload))]
pub async fn create_node(
    State(state): State<AppState>, agent: AgentCredential, Path(name): Path<String>, payload: Result<Json<CreateNode>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<DataSourceNode>)> {
    let req = body(payload)?;
    let node = state.platform.create_node(&name, &agent.0, &req.host).await?;
    Ok((StatusCode::CREATED, Json(node)))
}

/// Patch a node.
///
/// A body naming only a role is a role transition, answered with `204 No Content`. Any body
/// naming a `masterHost` is a generic update, answered with the updated node.
#[tracing::instrument(level = "debug", skip(state, session, payload))]
pub async fn patch_node(
    State(state): State<AppState>, session: Session, Path((name, host)): Path<(String, String)>, payload: Result<Json<NodeUpdate>, JsonRejection>,
) -> ApiResult<Response> {
    let update = body(payload)?;
    match (&update.role, &update.master_host) {
        (Some(role), None) => {
            state.platform.set_role(session.account(), &name, &host, role).await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        _ => {
            let node = state.platform.update_node(session.account(), &name, &host, update).await?;
            Ok(Json(node).into_response())
        }
    }
}

/// Long poll for a node's pending command.
///
/// Answers `200` with the command, `200` with an empty body when the poll timed out, or
/// `410 Gone` when the data source was removed while polling.
#[tracing::instrument(level = "debug", skip(state, agent))]
pub async fn poll_command(State(state): State<AppState>, agent: AgentCredential, Path((name, host)): Path<(String, String)>) -> ApiResult<Response> {
    match state.platform.poll_command(&name, &agent.0, &host).await? {
        PollOutcome::Command(command) => Ok(Json(command).into_response()),
        PollOutcome::NoCommand => Ok(StatusCode::OK.into_response()),
        PollOutcome::ClusterRemoved => Err(AppError::ClusterRemoved.into()),
    }
}

#[tracing::instrument(level = "debug", skip(state, session, payload))]
pub async fn put_app(
    State(state): State<AppState>, session: Session, Path(name): Path<String>, payload: Result<Json<PutApp>, JsonRejection>,
) -> ApiResult<Json<Application>> {
    let req = body(payload)?;
    let app = state.platform.put_app(session.account(), &name, &req.version).await?;
    Ok(Json(app))
}
