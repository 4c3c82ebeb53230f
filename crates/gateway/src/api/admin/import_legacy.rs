//! Legacy (pre-staging) OpenClaw import endpoints.
//!
//! Superseded by the staging-based flow in [`super::import_staging`]
//! (`/v1/import/openclaw/preview` + `/apply`), kept for callers still on the
//! single-shot `/v1/admin/import/openclaw/scan` + `/apply` pair. Both thinly
//! wrap the same [`crate::import::openclaw`] internals, scoped to local paths
//! only — no SSH source, no multi-step staging review.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::api::import_openclaw::{ImportOptions, ImportSource, MergeStrategy};
use crate::state::AppState;

use super::guard::AdminGuard;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/admin/import/openclaw/scan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct ScanRequest {
    /// Local filesystem path to a `.openclaw` directory.
    pub path: PathBuf,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default)]
    pub include_models: bool,
    #[serde(default)]
    pub include_auth_profiles: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScannedAgent {
    pub agent_id: String,
    pub session_files: u32,
    pub has_models_json: bool,
    pub has_auth_profiles_json: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScannedWorkspace {
    pub name: String,
    pub rel_path: String,
    pub approx_files: u32,
    pub approx_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub staging_id: Uuid,
    pub agents: Vec<ScannedAgent>,
    pub workspaces: Vec<ScannedWorkspace>,
    pub approx_files: u32,
    pub approx_bytes: u64,
}

pub async fn scan_openclaw(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> impl IntoResponse {
    let staging_root = state.import_root.join("openclaw");
    let ws_dest = state.config.workspace.path.clone();
    let sess_dest = state.config.workspace.state_path.join("sessions");

    let source = ImportSource::Local {
        path: req.path,
        follow_symlinks: req.follow_symlinks,
    };
    let options = ImportOptions {
        include_models: req.include_models,
        include_auth_profiles: req.include_auth_profiles,
        ..Default::default()
    };

    match crate::import::openclaw::preview_openclaw_import(source, options, &staging_root, &ws_dest, &sess_dest)
        .await
    {
        Ok(resp) => {
            let agents = resp
                .inventory
                .agents
                .into_iter()
                .map(|a| ScannedAgent {
                    agent_id: a.agent_id,
                    session_files: a.session_files,
                    has_models_json: a.has_models_json,
                    has_auth_profiles_json: a.has_auth_profiles_json,
                })
                .collect();
            let workspaces = resp
                .inventory
                .workspaces
                .into_iter()
                .map(|w| ScannedWorkspace {
                    name: w.name,
                    rel_path: w.rel_path,
                    approx_files: w.approx_files,
                    approx_bytes: w.approx_bytes,
                })
                .collect();
            Json(ScanResult {
                staging_id: resp.staging_id,
                agents,
                workspaces,
                approx_files: resp.inventory.totals.approx_files,
                approx_bytes: resp.inventory.totals.approx_bytes,
            })
            .into_response()
        }
        Err(e) => map_err(e).into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/admin/import/openclaw/apply
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct ImportApplyRequest {
    pub staging_id: Uuid,
    #[serde(default)]
    pub merge_strategy: Option<MergeStrategy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportApplyResult {
    pub staging_id: Uuid,
    pub agents: Vec<String>,
    pub workspaces: Vec<String>,
    pub sessions_copied: u32,
    pub warnings: Vec<String>,
}

pub async fn apply_openclaw_import(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Json(req): Json<ImportApplyRequest>,
) -> impl IntoResponse {
    let staging_root = state.import_root.join("openclaw");
    let ws_dest = state.config.workspace.path.clone();
    let sess_dest = state.config.workspace.state_path.join("sessions");

    let full_req = crate::api::import_openclaw::ImportApplyRequest {
        staging_id: req.staging_id,
        merge_strategy: req.merge_strategy.unwrap_or(MergeStrategy::Replace),
        options: ImportOptions::default(),
    };

    match crate::import::openclaw::apply_openclaw_import(full_req, &staging_root, &ws_dest, &sess_dest).await {
        Ok(resp) => {
            state.workspace.refresh();
            Json(ImportApplyResult {
                staging_id: resp.staging_id,
                agents: resp.imported.agents,
                workspaces: resp.imported.workspaces,
                sessions_copied: resp.imported.sessions_copied,
                warnings: resp.warnings,
            })
            .into_response()
        }
        Err(e) => map_err(e).into_response(),
    }
}

fn map_err(e: crate::import::openclaw::OpenClawImportError) -> (StatusCode, Json<serde_json::Value>) {
    let msg = e.to_string();
    let code = match &e {
        crate::import::openclaw::OpenClawImportError::InvalidPath(_) => StatusCode::BAD_REQUEST,
        crate::import::openclaw::OpenClawImportError::ArchiveInvalid(_) => StatusCode::BAD_REQUEST,
        crate::import::openclaw::OpenClawImportError::SizeLimitExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
        crate::import::openclaw::OpenClawImportError::SshFailed(_) => StatusCode::BAD_GATEWAY,
        crate::import::openclaw::OpenClawImportError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        crate::import::openclaw::OpenClawImportError::Json(_) => StatusCode::BAD_REQUEST,
    };
    (code, Json(serde_json::json!({ "error": msg })))
}
