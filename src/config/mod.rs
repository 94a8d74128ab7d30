use serde::Deserialize;
use uuid::Uuid;

pub mod runtime;

pub use runtime::RuntimeSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the job queue
    pub redis_url: String,

    /// Key prefix for every queue key in Redis
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    /// Cloudflare account ID
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    pub cf_api_token: String,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// Public base URL objects are served from
    pub r2_public_url: String,

    /// Civitai API key; the public endpoints work without one
    #[serde(default)]
    pub civitai_api_key: Option<String>,

    /// Account that owns catalog characters created by batch generation
    pub system_user_id: Uuid,

    #[serde(default)]
    pub batch_generation_enabled: bool,

    #[serde(default = "default_daily_generation_limit")]
    pub daily_generation_limit: u32,

    #[serde(default = "default_batch_generation_cron")]
    pub batch_generation_cron: String,

    #[serde(default = "default_batch_generation_size")]
    pub batch_generation_size: usize,

    /// UTC hour of the daily curation run
    #[serde(default = "default_daily_curation_hour")]
    pub daily_curation_hour: u32,

    #[serde(default = "default_curation_limit")]
    pub curation_fetch_limit: usize,

    #[serde(default = "default_curation_limit")]
    pub curation_process_limit: usize,

    /// Credits charged per generated character
    #[serde(default = "default_character_generation_cost")]
    pub character_generation_cost: i64,

    #[serde(default = "default_daily_credit_grant")]
    pub daily_credit_grant: i64,

    /// Upper bound for a single generation stage
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,

    #[serde(default = "default_image_model")]
    pub image_model: String,

    #[serde(default = "default_vision_model")]
    pub vision_model: String,

    #[serde(default = "default_text_model")]
    pub text_model: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_queue_prefix() -> String {
    "charforge".to_string()
}

fn default_daily_generation_limit() -> u32 {
    24
}

fn default_batch_generation_cron() -> String {
    "0 * * * *".to_string()
}

fn default_batch_generation_size() -> usize {
    1
}

fn default_daily_curation_hour() -> u32 {
    3
}

fn default_curation_limit() -> usize {
    50
}

fn default_character_generation_cost() -> i64 {
    50
}

fn default_daily_credit_grant() -> i64 {
    10
}

fn default_stage_timeout_secs() -> u64 {
    300
}

fn default_image_model() -> String {
    "@cf/stabilityai/stable-diffusion-xl-base-1.0".to_string()
}

fn default_vision_model() -> String {
    "@cf/llava-hf/llava-1.5-7b-hf".to_string()
}

fn default_text_model() -> String {
    "@cf/meta/llama-3.1-8b-instruct".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
