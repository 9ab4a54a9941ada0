use clap::Parser;

/// CLI surface (§6.5 "recognized configuration keys", merge order CLI >
/// ENV > DB). `clap`'s `env` attribute gives every flag ENV precedence
/// for free, matching the teacher's `gproxy-core::bootstrap::CliArgs`.
#[derive(Debug, Clone, Parser)]
#[command(name = "autorouter", version, about = "A reverse-proxy gateway for LLM/AI inference APIs")]
pub struct Cli {
    /// Database DSN. Defaults to a sqlite file under `--data-dir`.
    #[arg(long, env = "AUTOROUTER_DSN")]
    pub dsn: Option<String>,

    /// Directory for the default sqlite DSN when `--dsn` isn't given.
    #[arg(long, env = "AUTOROUTER_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    #[arg(long, env = "AUTOROUTER_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "AUTOROUTER_PORT")]
    pub port: Option<u16>,

    /// Admin key (plaintext). Stored and compared as a hash.
    #[arg(long, env = "AUTOROUTER_ADMIN_KEY")]
    pub admin_key: Option<String>,

    /// Symmetric key used to decrypt `upstreams.api_key_encrypted`.
    #[arg(long, env = "AUTOROUTER_ENCRYPTION_KEY")]
    pub encryption_key: Option<String>,

    /// Outbound proxy used for all upstream requests.
    #[arg(long, env = "AUTOROUTER_PROXY")]
    pub proxy: Option<String>,

    #[arg(long, env = "AUTOROUTER_EVENT_REDACT_SENSITIVE")]
    pub event_redact_sensitive: Option<bool>,
}
