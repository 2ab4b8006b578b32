//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    "{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}",
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const STORAGE_INDEX_FILE: &str = ".filedrop-index.json";
pub const DEFAULT_AUTH_USER: &str = "admin";
/// SHA-256 of the default password `123`.
pub const DEFAULT_AUTH_PASS_HASH: &str =
    "a665a45920422f9d417e4867efdc4fb8a04a1f3fff1fa07e998e86f7f7a27ae3";
pub const AUTH_COOKIE_NAME: &str = "FILEDROP_SESSION";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOGIN_WINDOW_SECS: u64 = 5 * 60;
pub const DEFAULT_LOGIN_LOCKOUT_SECS: u64 = 10 * 60;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 512 * 1024 * 1024;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 5;
pub const SESSION_PRUNE_INTERVAL_SECS: u64 = 300;
pub const STORAGE_SWEEP_INTERVAL_SECS: u64 = 900;
pub const STALE_TEMP_TTL_SECS: u64 = 24 * 60 * 60;

/// Upload extension allow-list. Matching is by extension only, content is not
/// inspected.
pub const ALLOWED_EXTENSIONS: &[&str] = &["pdf", "txt", "csv", "xlsx", "docx"];

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "filedrop", version = VERSION_INFO, about = "FileDrop upload server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "FILEDROP_STORAGE_DIR",
        default_value = "uploads",
        help = "Storage directory for uploaded files"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "FILEDROP_AUTH_USER",
        default_value = DEFAULT_AUTH_USER,
        help = "Auth username"
    )]
    pub auth_user: String,
    #[arg(
        long,
        env = "FILEDROP_AUTH_PASS_HASH",
        default_value = DEFAULT_AUTH_PASS_HASH,
        help = "SHA-256 hex digest of the auth password"
    )]
    pub auth_pass_hash: String,
    #[arg(
        short = 'b',
        long,
        env = "FILEDROP_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "FILEDROP_HTTP_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(long, env = "FILEDROP_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "FILEDROP_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Session expiration in seconds"
    )]
    pub session_ttl_secs: u64,
    #[arg(
        long,
        env = "FILEDROP_LOGIN_MAX_ATTEMPTS",
        default_value_t = DEFAULT_LOGIN_MAX_ATTEMPTS,
        help = "Max login attempts before lockout (0 to disable)"
    )]
    pub login_max_attempts: u32,
    #[arg(
        long,
        env = "FILEDROP_LOGIN_WINDOW_SECS",
        default_value_t = DEFAULT_LOGIN_WINDOW_SECS,
        help = "Login attempt window in seconds"
    )]
    pub login_window_secs: u64,
    #[arg(
        long,
        env = "FILEDROP_LOGIN_LOCKOUT_SECS",
        default_value_t = DEFAULT_LOGIN_LOCKOUT_SECS,
        help = "Login lockout time after max attempts"
    )]
    pub login_lockout_secs: u64,
    #[arg(
        long,
        env = "FILEDROP_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
}
