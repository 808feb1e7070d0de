use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{FromRequestParts, Query, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    auth::{AuthContext, TokenAuthority},
    checker::Checker,
    error::{CheckError, CheckResult},
    geo::{strip_brackets, GeoInfo},
    scanner::ScanControl,
    types::{now_rfc3339, ScanState},
};

#[derive(Clone)]
pub struct AppState {
    checker: Checker,
    authority: Arc<TokenAuthority>,
    inner: Arc<RwLock<ServerState>>, // the scan currently owned by the API, if any
}

#[derive(Debug, Default)]
struct ServerState {
    control: Option<ScanControl>,
    total_ranges: usize,
}

impl AppState {
    pub fn new(checker: Checker, authority: TokenAuthority) -> Self {
        Self {
            checker,
            authority: Arc::new(authority),
            inner: Arc::new(RwLock::new(ServerState::default())),
        }
    }
}

/// Per-request tokens derived from the `Host` and `User-Agent` headers.
impl FromRequestParts<AppState> for AuthContext {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let host = request_hostname(&parts.headers)
            .or_else(|| parts.uri.host().map(str::to_string))
            .unwrap_or_default();
        let caller = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("null");
        Ok(state.authority.context(&host, caller))
    }
}

fn request_hostname(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(header::HOST)?.to_str().ok()?;
    let name = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    Some(name.to_string())
}

fn require_token(auth: &AuthContext, token: Option<&str>, what: &str) -> CheckResult<()> {
    if auth.accepts(token) {
        Ok(())
    } else {
        Err(CheckError::Auth(format!("{what} Failed: Invalid TOKEN")))
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckParams {
    pub proxyip: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveParams {
    pub domain: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IpInfoParams {
    pub ip: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TokenParam {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub ranges: Vec<String>,
    #[serde(default)]
    pub confirm_between_ranges: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct TokenInfo {
    pub token: String,
    pub window_minutes: u64,
    pub refresh_hint_minutes: u64,
}

#[derive(Debug, Serialize)]
pub struct Resolved {
    pub success: bool,
    pub domain: String,
    pub ips: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ResolveFailed {
    pub success: bool,
    pub error: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct IpInfoBody {
    #[serde(flatten)]
    pub info: GeoInfo,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct Status {
    pub state: ScanState,
    pub total_ranges: usize,
    pub range_index: usize,
    pub checked: u64,
    pub successful: u64,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/scan/resume", post(post_resume))
        .route("/scan/cancel", post(post_cancel))
        .route("/results", get(get_results));

    Router::new()
        .route("/", get(get_index))
        .route("/check", get(get_check))
        .route("/resolve", get(get_resolve))
        .route("/ip-info", get(get_ip_info))
        .nest("/api", api)
        .with_state(state)
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, checker: Checker, authority: TokenAuthority) -> Result<()> {
    let app = router(AppState::new(checker, authority));
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "serving checker API");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn get_index(State(app): State<AppState>, auth: AuthContext) -> Response {
    if auth.secret_configured() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let cfg = app.authority.config();
    Json(TokenInfo {
        token: auth.ephemeral.value,
        window_minutes: cfg.window_minutes,
        refresh_hint_minutes: cfg.refresh_hint_minutes,
    })
    .into_response()
}

async fn get_check(
    State(app): State<AppState>,
    auth: AuthContext,
    Query(params): Query<CheckParams>,
) -> CheckResult<Response> {
    let proxyip = match params.proxyip.as_deref() {
        None => return Err(CheckError::Validation("Missing proxyip parameter".into())),
        Some("") => return Err(CheckError::Validation("Invalid proxyip parameter".into())),
        Some(p) => p,
    };
    if auth.secret_configured() {
        require_token(&auth, params.token.as_deref(), "ProxyIP Check")?;
    }

    let result = app.checker.check(proxyip).await;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    Ok((status, Json(result)).into_response())
}

async fn get_resolve(
    State(app): State<AppState>,
    auth: AuthContext,
    Query(params): Query<ResolveParams>,
) -> CheckResult<Response> {
    require_token(&auth, params.token.as_deref(), "Domain Resolve")?;
    let domain = match params.domain {
        Some(d) if !d.trim().is_empty() => d,
        _ => return Err(CheckError::Validation("Missing domain parameter".into())),
    };

    match app.checker.resolve(&domain).await {
        Ok(ips) => Ok(Json(Resolved {
            success: true,
            domain,
            ips,
        })
        .into_response()),
        Err(CheckError::Validation(msg)) => Err(CheckError::Validation(msg)),
        Err(e) => Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ResolveFailed {
                success: false,
                error: e.to_string(),
                timestamp: now_rfc3339(),
            }),
        )
            .into_response()),
    }
}

async fn get_ip_info(
    State(app): State<AppState>,
    auth: AuthContext,
    headers: HeaderMap,
    Query(params): Query<IpInfoParams>,
) -> CheckResult<Response> {
    require_token(&auth, params.token.as_deref(), "IP Info")?;
    let ip = params
        .ip
        .filter(|ip| !ip.trim().is_empty())
        .or_else(|| client_ip(&headers))
        .ok_or_else(|| CheckError::Validation("IP parameter not provided".into()))?;

    let geo = app
        .checker
        .geo()
        .ok_or_else(|| CheckError::Upstream("IP info lookups are disabled".into()))?;
    let info = geo.lookup(strip_brackets(&ip)).await.inspect_err(|e| {
        warn!(ip = %ip, error = %e, "ip-info lookup failed");
    })?;
    Ok(Json(IpInfoBody {
        info,
        timestamp: now_rfc3339(),
    })
    .into_response())
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    ["cf-connecting-ip", "x-forwarded-for"]
        .iter()
        .filter_map(|name| headers.get(*name)?.to_str().ok())
        .filter_map(|v| v.split(',').next())
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

async fn get_status(
    State(app): State<AppState>,
    auth: AuthContext,
    Query(q): Query<TokenParam>,
) -> CheckResult<Json<Status>> {
    require_token(&auth, q.token.as_deref(), "Scan Status")?;
    let s = app.inner.read().await;
    let out = match s.control.as_ref() {
        Some(control) => {
            let p = control.progress();
            Status {
                state: control.state(),
                total_ranges: s.total_ranges,
                range_index: p.range_index,
                checked: p.checked_count,
                successful: p.success_count,
            }
        }
        None => Status::default(),
    };
    Ok(Json(out))
}

async fn get_results(
    State(app): State<AppState>,
    auth: AuthContext,
    Query(q): Query<TokenParam>,
) -> CheckResult<Response> {
    require_token(&auth, q.token.as_deref(), "Scan Results")?;
    let s = app.inner.read().await;
    Ok(match s.control.as_ref() {
        Some(control) => (StatusCode::OK, Json(control.progress())).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn post_scan(
    State(app): State<AppState>,
    auth: AuthContext,
    Query(q): Query<TokenParam>,
    Json(req): Json<ScanRequest>,
) -> CheckResult<Response> {
    require_token(&auth, q.token.as_deref(), "Range Scan")?;
    let ranges: Vec<String> = req
        .ranges
        .iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();
    if ranges.is_empty() {
        return Err(CheckError::Validation("Missing ranges".into()));
    }

    let mut scan_cfg = app.checker.config().scan.clone();
    if let Some(confirm) = req.confirm_between_ranges {
        scan_cfg.confirm_between_ranges = confirm;
    }
    let scanner = app.checker.scanner_with(scan_cfg);
    let control = ScanControl::new();
    let total_ranges = ranges.len();

    {
        let mut s = app.inner.write().await;
        // Cancel any existing scan
        if let Some(previous) = s.control.take() {
            previous.cancel();
        }
        s.control = Some(control.clone());
        s.total_ranges = total_ranges;
    }

    let task_control = control.clone();
    tokio::spawn(async move {
        let progress = scanner.scan_queue(&ranges, &task_control).await;
        info!(
            checked = progress.checked_count,
            successful = progress.success_count,
            "API scan ended"
        );
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(Status {
            state: ScanState::Running,
            total_ranges,
            ..Status::default()
        }),
    )
        .into_response())
}

async fn post_resume(
    State(app): State<AppState>,
    auth: AuthContext,
    Query(q): Query<TokenParam>,
) -> CheckResult<Response> {
    require_token(&auth, q.token.as_deref(), "Scan Resume")?;
    let s = app.inner.read().await;
    let resumed = s.control.as_ref().is_some_and(ScanControl::resume);
    let status = if resumed {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(serde_json::json!({ "resumed": resumed }))).into_response())
}

async fn post_cancel(
    State(app): State<AppState>,
    auth: AuthContext,
    Query(q): Query<TokenParam>,
) -> CheckResult<Response> {
    require_token(&auth, q.token.as_deref(), "Scan Cancel")?;
    let s = app.inner.read().await;
    match s.control.as_ref() {
        Some(control) => {
            control.cancel();
            Ok(StatusCode::ACCEPTED.into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_strips_port() {
        let mut h = HeaderMap::new();
        h.insert(header::HOST, HeaderValue::from_static("check.example:8080"));
        assert_eq!(request_hostname(&h).as_deref(), Some("check.example"));
        h.insert(header::HOST, HeaderValue::from_static("check.example"));
        assert_eq!(request_hostname(&h).as_deref(), Some("check.example"));
    }

    #[test]
    fn client_ip_prefers_edge_header() {
        let mut h = HeaderMap::new();
        h.insert("x-forwarded-for", HeaderValue::from_static("9.9.9.9, 10.0.0.1"));
        assert_eq!(client_ip(&h).as_deref(), Some("9.9.9.9"));
        h.insert("cf-connecting-ip", HeaderValue::from_static("1.1.1.1"));
        assert_eq!(client_ip(&h).as_deref(), Some("1.1.1.1"));
        assert_eq!(client_ip(&HeaderMap::new()), None);
    }
}
