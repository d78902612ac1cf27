//! Configuration structures and defaults.
//!
//! Settings are read from the environment once at startup and are read-only
//! afterwards; everything that needs one gets an `Arc<Settings>`.

use std::env;

/// Global launch settings of the application.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_host: String,
    pub bind_port: u16,

    /// Path of the SQLite record store holding jobs, steps and connections.
    pub database_path: String,

    /// Identity written to `executing_node` when this node claims a step.
    pub node_name: String,

    /// Max number of workers executing job steps in the background.
    pub max_job_workers: usize,
    /// Amount of job steps a node will submit for execution at a time.
    pub job_step_batch_size: usize,

    /// Prefix applied to every chunk prior to embeddings computation. Some
    /// models require indexed passages to be prefixed the way the model was
    /// trained.
    pub chunk_prefix: Option<String>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,

    pub index_url: String,
    /// Name of the index in which loaded documents are stored.
    pub index_name: String,
    pub index_user: Option<String>,
    pub index_password: Option<String>,
    pub index_verify_certs: bool,

    pub embeddings_url: String,

    /// Root directory, under which the file system crawler searches.
    pub fs_source_dir: String,
    /// Comma-separated list of case-sensitive glob patterns used by the file
    /// system crawler.
    pub fs_source_patterns: String,

    pub kms_url: Option<String>,
    pub kms_user: Option<String>,
    pub kms_password: Option<String>,

    pub wiki_url: Option<String>,
    pub wiki_user: Option<String>,
    pub wiki_password: Option<String>,

    pub drv_url: Option<String>,
    pub drv_user: Option<String>,
    pub drv_password: Option<String>,

    pub hub_url: Option<String>,
    pub hub_user: Option<String>,
    pub hub_password: Option<String>,

    pub max_upload_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 8000,
            database_path: "accretion.db".to_string(),
            node_name: "node-local".to_string(),
            max_job_workers: 4,
            job_step_batch_size: 100,
            chunk_prefix: Some("passage: ".to_string()),
            chunk_size: 500,
            chunk_overlap: 100,
            index_url: "http://localhost:9200".to_string(),
            index_name: "accretion-index".to_string(),
            index_user: None,
            index_password: None,
            index_verify_certs: true,
            embeddings_url: "http://localhost:8081/embeddings".to_string(),
            fs_source_dir: "data".to_string(),
            fs_source_patterns: "**/*.txt,**/*.md,**/*.pdf".to_string(),
            kms_url: None,
            kms_user: None,
            kms_password: None,
            wiki_url: None,
            wiki_user: None,
            wiki_password: None,
            drv_url: None,
            drv_user: None,
            drv_password: None,
            hub_url: None,
            hub_user: None,
            hub_password: None,
            max_upload_bytes: 20 * 1024 * 1024,
        }
    }
}

impl Settings {
    /// Builds the settings from environment variables, falling back to the
    /// defaults above.
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Self {
            bind_host: env_string("BIND_HOST", defaults.bind_host),
            bind_port: env_parse("BIND_PORT", defaults.bind_port),
            database_path: env_string("DATABASE_PATH", defaults.database_path),
            node_name: env::var("NODE_NAME")
                .or_else(|_| env::var("HOSTNAME"))
                .unwrap_or(defaults.node_name),
            max_job_workers: env_parse("MAX_JOB_WORKERS", defaults.max_job_workers),
            job_step_batch_size: env_parse("JOB_STEP_BATCH_SIZE", defaults.job_step_batch_size),
            chunk_prefix: env_opt("CHUNK_PREFIX").or(defaults.chunk_prefix),
            chunk_size: env_parse("CHUNK_SIZE", defaults.chunk_size),
            chunk_overlap: env_parse("CHUNK_OVERLAP", defaults.chunk_overlap),
            index_url: env_string("INDEX_URL", defaults.index_url),
            index_name: env_string("INDEX_NAME", defaults.index_name),
            index_user: env_opt("INDEX_USER"),
            index_password: env_opt("INDEX_PASSWORD"),
            index_verify_certs: env_parse("INDEX_VERIFY_CERTS", defaults.index_verify_certs),
            embeddings_url: env_string("EMBEDDINGS_URL", defaults.embeddings_url),
            fs_source_dir: env_string("FS_SOURCE_DIR", defaults.fs_source_dir),
            fs_source_patterns: env_string("FS_SOURCE_PATTERNS", defaults.fs_source_patterns),
            kms_url: env_opt("KMS_URL"),
            kms_user: env_opt("KMS_USER"),
            kms_password: env_opt("KMS_PASSWORD"),
            wiki_url: env_opt("WIKI_URL"),
            wiki_user: env_opt("WIKI_USER"),
            wiki_password: env_opt("WIKI_PASSWORD"),
            drv_url: env_opt("DRV_URL"),
            drv_user: env_opt("DRV_USER"),
            drv_password: env_opt("DRV_PASSWORD"),
            hub_url: env_opt("HUB_URL"),
            hub_user: env_opt("HUB_USER"),
            hub_password: env_opt("HUB_PASSWORD"),
            max_upload_bytes: env_parse("MAX_UPLOAD_BYTES", defaults.max_upload_bytes),
        }
    }

    /// Glob patterns of the file system crawler, split and trimmed.
    pub fn fs_patterns(&self) -> Vec<String> {
        self.fs_source_patterns
            .split(',')
            .map(str::trim)
            .filter(|pattern| !pattern.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn env_string(name: &str, default: String) -> String {
    env::var(name).unwrap_or(default)
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
