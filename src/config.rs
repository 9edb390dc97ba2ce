//! CLI arguments and server configuration defaults.

use clap::Parser;

pub const DEFAULT_STORAGE_DIR: &str = "./uploads";
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 6061;
pub const DEFAULT_BULK_THRESHOLD: usize = 500;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 500 * 1024 * 1024;
pub const DEFAULT_LOG_FILTER: &str = "info";
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(
    name = "local-ftp",
    version,
    about = "LAN file sharing over HTTP"
)]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "LOCAL_FTP_STORAGE_DIR",
        default_value = DEFAULT_STORAGE_DIR,
        help = "Flat directory holding shared files"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "LOCAL_FTP_BIND",
        default_value = DEFAULT_BIND,
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "LOCAL_FTP_PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        short = 't',
        long,
        env = "LOCAL_FTP_BULK_THRESHOLD",
        default_value_t = DEFAULT_BULK_THRESHOLD,
        help = "File count above which a bulk upload is stored as one zip archive"
    )]
    pub bulk_threshold: usize,
    #[arg(
        long,
        env = "LOCAL_FTP_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload request size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(long, env = "LOCAL_FTP_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
}
