//! 认证处理、会话管理与登录限流。

use axum::extract::{Extension, Json, connect_info::ConnectInfo};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Json as JsonResponse;
use axum::{body::Body as AxumBody, middleware, response::IntoResponse};
use axum_extra::extract::{CookieJar, TypedHeader, cookie::Cookie};
use axum_extra::headers::{Authorization, authorization::Basic};
use cookie::time::Duration as CookieDuration;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AUTH_COOKIE_NAME;
use crate::error::ApiError;
use crate::http::{is_https_request, resolve_client_ip};

/// 静态凭据表：用户名映射到密码的 SHA-256 摘要。
#[derive(Debug)]
pub struct Credentials {
    entries: HashMap<String, String>,
}

impl Credentials {
    /// 构建单用户凭据表。
    pub fn single(username: String, password_hash: String) -> Self {
        Self {
            entries: HashMap::from([(username, password_hash.to_lowercase())]),
        }
    }

    /// 校验用户名与密码。未知用户与密码错误对调用方不可区分。
    pub fn verify(&self, username: &str, password: &str) -> bool {
        match self.entries.get(username) {
            Some(stored) => sha256_hex(password) == *stored,
            None => false,
        }
    }
}

/// 计算输入的 SHA-256 摘要（小写十六进制）。
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug)]
pub struct AuthConfig {
    pub credentials: Credentials,
    pub sessions: Mutex<HashMap<String, SessionEntry>>,
    pub session_ttl: Duration,
    pub login_attempts: Mutex<HashMap<IpAddr, LoginAttempt>>,
    pub login_window: Duration,
    pub login_max_attempts: u32,
    pub login_lockout: Duration,
}

#[derive(Debug)]
pub struct SessionEntry {
    pub username: String,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct LoginAttempt {
    window_start: Instant,
    failures: u32,
    locked_until: Option<Instant>,
}

impl LoginAttempt {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            failures: 0,
            locked_until: None,
        }
    }

    fn reset(&mut self, now: Instant) {
        self.window_start = now;
        self.failures = 0;
        self.locked_until = None;
    }
}

/// 认证中间件：校验会话 Cookie 或 Basic 认证。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
    auth_header: Option<TypedHeader<Authorization<Basic>>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<axum::response::Response, ApiError> {
    if is_auth_exempt_path(req.uri().path()) {
        return Ok(next.run(req).await);
    }

    if let Some(cookie) = jar.get(AUTH_COOKIE_NAME)
        && session_username(&auth, cookie.value()).await.is_some()
    {
        return Ok(next.run(req).await);
    }

    if let Some(TypedHeader(auth_header)) = auth_header
        && auth
            .credentials
            .verify(auth_header.username(), auth_header.password())
    {
        return Ok(next.run(req).await);
    }

    Err(ApiError::Unauthorized(HeaderMap::new()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthLoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthStatusResponse {
    username: String,
}

/// 登录接口：创建会话并写入 Cookie。
pub async fn auth_login(
    Extension(auth): Extension<Arc<AuthConfig>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<AuthLoginRequest>,
) -> Result<(CookieJar, axum::response::Response), ApiError> {
    let client_ip = resolve_client_ip(&headers, Some(addr.ip())).unwrap_or_else(|| addr.ip());

    if let Some(retry_after) = check_login_rate_limit(&auth, client_ip).await {
        return Err(ApiError::TooManyRequests(retry_after));
    }

    if !auth.credentials.verify(&payload.username, &payload.password) {
        register_login_failure(&auth, client_ip).await;
        return Err(ApiError::Unauthorized(HeaderMap::new()));
    }

    clear_login_failures(&auth, client_ip).await;

    let token = Uuid::new_v4().to_string();
    let expires_at = Instant::now() + auth.session_ttl;
    let mut sessions = auth.sessions.lock().await;
    sessions.insert(
        token.clone(),
        SessionEntry {
            username: payload.username.clone(),
            expires_at,
        },
    );
    info!(username = payload.username, "login");

    let secure = is_https_request(&headers);
    let cookie = Cookie::build((AUTH_COOKIE_NAME, token))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(axum_extra::extract::cookie::SameSite::Strict)
        .max_age(CookieDuration::seconds(auth.session_ttl.as_secs() as i64))
        .build();
    let jar = jar.add(cookie);
    Ok((jar, StatusCode::NO_CONTENT.into_response()))
}

/// 登出接口：清理会话并删除 Cookie。
pub async fn auth_logout(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
) -> (CookieJar, StatusCode) {
    if let Some(cookie) = jar.get(AUTH_COOKIE_NAME) {
        remove_session(&auth, cookie.value()).await;
    }

    (
        jar.remove(Cookie::build(AUTH_COOKIE_NAME).path("/").build()),
        StatusCode::NO_CONTENT,
    )
}

/// 查询当前登录状态与用户名。
pub async fn auth_status(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
) -> Result<JsonResponse<AuthStatusResponse>, ApiError> {
    if let Some(cookie) = jar.get(AUTH_COOKIE_NAME)
        && let Some(username) = session_username(&auth, cookie.value()).await
    {
        return Ok(JsonResponse(AuthStatusResponse { username }));
    }
    Err(ApiError::Unauthorized(HeaderMap::new()))
}

fn is_auth_exempt_path(path: &str) -> bool {
    if path == "/api/auth/login"
        || path == "/api/auth/logout"
        || path == "/api/auth/status"
        || path == "/api/version"
    {
        return true;
    }
    !path.starts_with("/api/")
}

async fn session_username(auth: &AuthConfig, token: &str) -> Option<String> {
    let mut sessions = auth.sessions.lock().await;
    let now = Instant::now();
    match sessions.get(token) {
        Some(entry) if entry.expires_at > now => Some(entry.username.clone()),
        Some(_) => {
            sessions.remove(token);
            None
        }
        None => None,
    }
}

async fn remove_session(auth: &AuthConfig, token: &str) {
    let mut sessions = auth.sessions.lock().await;
    sessions.remove(token);
}

async fn check_login_rate_limit(auth: &AuthConfig, ip: IpAddr) -> Option<u64> {
    if auth.login_max_attempts == 0 {
        return None;
    }

    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    let entry = attempts.entry(ip).or_insert_with(|| LoginAttempt::new(now));

    if let Some(locked_until) = entry.locked_until {
        if now < locked_until {
            return Some(locked_until.saturating_duration_since(now).as_secs());
        }
        entry.reset(now);
    }

    if now.duration_since(entry.window_start) > auth.login_window {
        entry.reset(now);
    }

    None
}

async fn register_login_failure(auth: &AuthConfig, ip: IpAddr) {
    if auth.login_max_attempts == 0 {
        return;
    }

    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    let entry = attempts.entry(ip).or_insert_with(|| LoginAttempt::new(now));

    if now.duration_since(entry.window_start) > auth.login_window {
        entry.reset(now);
    }

    entry.failures = entry.failures.saturating_add(1);
    if entry.failures >= auth.login_max_attempts {
        entry.locked_until = Some(now + auth.login_lockout);
        warn!(client_ip = %ip, "login locked out");
    }
}

async fn clear_login_failures(auth: &AuthConfig, ip: IpAddr) {
    let mut attempts = auth.login_attempts.lock().await;
    attempts.remove(&ip);
}

/// 清理过期会话。
pub async fn prune_expired_sessions(auth: &AuthConfig) {
    let mut sessions = auth.sessions.lock().await;
    let now = Instant::now();
    sessions.retain(|_, entry| entry.expires_at > now);
}

/// 清理过期的登录失败记录。
pub async fn prune_login_attempts(auth: &AuthConfig) {
    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    attempts.retain(|_, entry| {
        if let Some(locked_until) = entry.locked_until {
            return locked_until > now;
        }
        now.duration_since(entry.window_start) <= auth.login_window
    });
}
