use anyhow::{Context, Result, bail};
use rave_manager::{Account, AgentConfig, ConnectionOptions, RetryPolicy, SessionMode, SupervisorConfig};
use rave_protocol::UserId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [supervisor]
//                    max_retries = 5
//
//   env var:         RAVE_SUPERVISOR__MAX_RETRIES=5   (double underscore = nesting)
//
//   (single underscore stays within field names: RAVE_ACCOUNT__AUTH_TOKEN)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub account: AccountFileConfig,
    #[serde(default)]
    pub api: ApiFileConfig,
    #[serde(default)]
    pub supervisor: SupervisorFileConfig,
    #[serde(default)]
    pub agent: AgentFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
}

/// Credentials the bot runs as (lives under `[account]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccountFileConfig {
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub auth_token: String,
}

impl AccountFileConfig {
    /// The runtime account, refusing to start with missing credentials.
    pub fn to_account(&self) -> Result<Account> {
        if self.user_id == 0 {
            bail!("account.user_id is not set (config.toml [account] or RAVE_ACCOUNT__USER_ID)");
        }
        if self.device_id.trim().is_empty() {
            bail!("account.device_id is not set (config.toml [account] or RAVE_ACCOUNT__DEVICE_ID)");
        }
        if self.auth_token.trim().is_empty() {
            bail!("account.auth_token is not set (config.toml [account] or RAVE_ACCOUNT__AUTH_TOKEN)");
        }
        Ok(Account {
            user_id: self.user_id,
            device_id: self.device_id.clone(),
            auth_token: self.auth_token.clone(),
        })
    }
}

/// REST endpoint and client identification (lives under `[api]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_ssaid")]
    pub ssaid: String,
    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            client_version: default_client_version(),
            api_version: default_api_version(),
            platform: default_platform(),
            user_agent: default_user_agent(),
            ssaid: default_ssaid(),
            timeout_secs: default_api_timeout_secs(),
        }
    }
}

/// Discovery, reaping and retry knobs (lives under `[supervisor]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SupervisorFileConfig {
    #[serde(default)]
    pub session_mode: SessionMode,
    #[serde(default = "default_session_limit")]
    pub session_limit: usize,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    #[serde(default = "default_start_stagger_ms")]
    pub start_stagger_ms: u64,
    #[serde(default = "default_health_poll_ms")]
    pub health_poll_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
}

impl Default for SupervisorFileConfig {
    fn default() -> Self {
        Self {
            session_mode: SessionMode::default(),
            session_limit: default_session_limit(),
            lang: default_lang(),
            discovery_interval_secs: default_discovery_interval_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            start_stagger_ms: default_start_stagger_ms(),
            health_poll_ms: default_health_poll_ms(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
        }
    }
}

/// Per-session behaviour (lives under `[agent]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentFileConfig {
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_leave_when_last: bool,
    #[serde(default = "default_true")]
    pub assume_recent_reply: bool,
    #[serde(default = "default_recent_reply_window_secs")]
    pub recent_reply_window_secs: u64,
    #[serde(default = "default_reply_ring_capacity")]
    pub reply_ring_capacity: usize,
    #[serde(default)]
    pub reconnect_in_session: bool,
    /// Greet members who join a session the bot is in.
    #[serde(default = "default_true")]
    pub welcome_members: bool,
    /// Sent once every time the bot (re)joins a session.
    #[serde(default)]
    pub greeting: Option<String>,
}

impl Default for AgentFileConfig {
    fn default() -> Self {
        Self {
            prefixes: default_prefixes(),
            auto_leave_when_last: true,
            assume_recent_reply: true,
            recent_reply_window_secs: default_recent_reply_window_secs(),
            reply_ring_capacity: default_reply_ring_capacity(),
            reconnect_in_session: false,
            welcome_members: true,
            greeting: None,
        }
    }
}

/// Socket timing (lives under `[connection]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.red.wemesh.ca".to_string()
}
fn default_client_version() -> String {
    "8.2.9".to_string()
}
fn default_api_version() -> String {
    "4.0".to_string()
}
fn default_platform() -> String {
    "android".to_string()
}
fn default_user_agent() -> String {
    "Rave/2149 (8.2.9) (Android 9; ASUS_X00TD; asus ASUS_X00T_2; en)".to_string()
}
fn default_ssaid() -> String {
    "b32a05e5c198bdc0".to_string()
}
fn default_api_timeout_secs() -> u64 {
    15
}
fn default_session_limit() -> usize {
    20
}
fn default_lang() -> String {
    "en".to_string()
}
fn default_discovery_interval_secs() -> u64 {
    60
}
fn default_reaper_interval_secs() -> u64 {
    180
}
fn default_start_stagger_ms() -> u64 {
    500
}
fn default_health_poll_ms() -> u64 {
    2000
}
fn default_max_retries() -> u32 {
    10
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_retry_cap_ms() -> u64 {
    60_000
}
fn default_prefixes() -> Vec<String> {
    vec!["!".to_string()]
}
fn default_true() -> bool {
    true
}
fn default_recent_reply_window_secs() -> u64 {
    30
}
fn default_reply_ring_capacity() -> usize {
    50
}
fn default_ping_interval_secs() -> u64 {
    15
}
fn default_request_timeout_secs() -> u64 {
    8
}
fn default_handshake_timeout_secs() -> u64 {
    15
}
fn default_reconnect_base_ms() -> u64 {
    1000
}
fn default_reconnect_cap_ms() -> u64 {
    12_500
}
fn default_reconnect_max_attempts() -> u32 {
    10
}

const REDACTED: &str = "********";

impl FileConfig {
    /// Copy with credentials masked, for printing.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.account.auth_token.is_empty() {
            copy.account.auth_token = REDACTED.to_string();
        }
        copy
    }
}

/// Build a figment that layers: defaults → config.toml → RAVE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `RAVE_ACCOUNT__AUTH_TOKEN=...`  →  `account.auth_token = "..."`
///   `RAVE_SUPERVISOR__SESSION_MODE=all`  →  `supervisor.session_mode = "all"`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("RAVE_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, handed to the library crates)
// =============================================================================

/// REST client settings (runtime view).
#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub base_url: String,
    pub client_version: String,
    pub api_version: String,
    pub platform: String,
    pub user_agent: String,
    pub ssaid: String,
    pub timeout: Duration,
}

impl ApiConfig {
    pub fn from_file(fc: &ApiFileConfig) -> Self {
        Self {
            base_url: fc.base_url.trim_end_matches('/').to_string(),
            client_version: fc.client_version.clone(),
            api_version: fc.api_version.clone(),
            platform: fc.platform.clone(),
            user_agent: fc.user_agent.clone(),
            ssaid: fc.ssaid.clone(),
            timeout: Duration::from_secs(fc.timeout_secs.max(1)),
        }
    }
}

pub fn agent_config(fc: &AgentFileConfig) -> AgentConfig {
    let prefixes: Vec<String> = fc
        .prefixes
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect();
    AgentConfig {
        prefixes: if prefixes.is_empty() {
            default_prefixes()
        } else {
            prefixes
        },
        auto_leave_when_last: fc.auto_leave_when_last,
        assume_recent_reply: fc.assume_recent_reply,
        recent_reply_window: Duration::from_secs(fc.recent_reply_window_secs),
        reply_ring_capacity: fc.reply_ring_capacity.max(1),
        reconnect_in_session: fc.reconnect_in_session,
    }
}

pub fn connection_options(fc: &ConnectionFileConfig) -> ConnectionOptions {
    ConnectionOptions {
        ping_interval: Duration::from_secs(fc.ping_interval_secs.max(1)),
        request_timeout: Duration::from_secs(fc.request_timeout_secs.max(1)),
        handshake_timeout: Duration::from_secs(fc.handshake_timeout_secs.max(1)),
        reconnect: RetryPolicy::new(
            Duration::from_millis(fc.reconnect_base_ms),
            Duration::from_millis(fc.reconnect_cap_ms.max(fc.reconnect_base_ms)),
            fc.reconnect_max_attempts,
        ),
    }
}

/// Everything the supervisor needs. Fails when the account is incomplete.
pub fn supervisor_config(fc: &FileConfig) -> Result<SupervisorConfig> {
    let sc = &fc.supervisor;
    Ok(SupervisorConfig {
        account: fc.account.to_account()?,
        discovery_interval: Duration::from_secs(sc.discovery_interval_secs.max(1)),
        reaper_interval: Duration::from_secs(sc.reaper_interval_secs.max(1)),
        start_stagger: Duration::from_millis(sc.start_stagger_ms),
        health_poll: Duration::from_millis(sc.health_poll_ms.max(10)),
        retry: RetryPolicy::new(
            Duration::from_millis(sc.retry_base_ms),
            Duration::from_millis(sc.retry_cap_ms.max(sc.retry_base_ms)),
            sc.max_retries,
        ),
        session_mode: sc.session_mode,
        session_limit: sc.session_limit,
        lang: sc.lang.clone(),
        agent: agent_config(&fc.agent),
        connection: connection_options(&fc.connection),
    })
}

// =============================================================================
// Directory layout config (derived from --data-dir, not tunable via figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RaveBotConfig {
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl RaveBotConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory; pass --data-dir")?
                .join(".ravebot"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let logs_dir = data_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, logs_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// Where `run` writes the final session table on shutdown.
    pub fn last_status_path(&self) -> PathBuf {
        self.logs_dir.join("last_status.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_supervisor_file_config_defaults() {
        let sc = SupervisorFileConfig::default();
        assert_eq!(sc.session_mode, SessionMode::Invited);
        assert_eq!(sc.session_limit, 20);
        assert_eq!(sc.lang, "en");
        assert_eq!(sc.discovery_interval_secs, 60);
        assert_eq!(sc.reaper_interval_secs, 180);
        assert_eq!(sc.start_stagger_ms, 500);
        assert_eq!(sc.max_retries, 10);
    }

    #[test]
    fn test_runtime_defaults_match_library_defaults() {
        let fc = FileConfig {
            account: AccountFileConfig {
                user_id: 42,
                device_id: "dev".into(),
                auth_token: "tok".into(),
            },
            ..Default::default()
        };
        let config = supervisor_config(&fc).unwrap();
        let library = SupervisorConfig::default();

        assert_eq!(config.discovery_interval, library.discovery_interval);
        assert_eq!(config.reaper_interval, library.reaper_interval);
        assert_eq!(config.start_stagger, library.start_stagger);
        assert_eq!(config.health_poll, library.health_poll);
        assert_eq!(config.retry, library.retry);
        assert_eq!(config.agent, library.agent);
        assert_eq!(config.connection, library.connection);
        assert_eq!(config.account.user_id, 42);
    }

    // ── account ─────────────────────────────────────────────────────────

    #[test]
    fn test_missing_credentials_are_rejected() {
        let mut account = AccountFileConfig::default();
        let err = account.to_account().unwrap_err().to_string();
        assert!(err.contains("user_id"));

        account.user_id = 7;
        account.device_id = "dev".into();
        let err = account.to_account().unwrap_err().to_string();
        assert!(err.contains("auth_token"));

        account.auth_token = "tok".into();
        assert!(account.to_account().is_ok());
    }

    #[test]
    fn test_redacted_masks_token_only() {
        let fc = FileConfig {
            account: AccountFileConfig {
                user_id: 7,
                device_id: "dev".into(),
                auth_token: "secret".into(),
            },
            ..Default::default()
        };
        let shown = fc.redacted();
        assert_eq!(shown.account.auth_token, REDACTED);
        assert_eq!(shown.account.device_id, "dev");

        let rendered = toml::to_string_pretty(&shown).unwrap();
        assert!(!rendered.contains("secret"));
    }

    // ── runtime conversions ─────────────────────────────────────────────

    #[test]
    fn test_agent_config_drops_empty_prefixes() {
        let fc = AgentFileConfig {
            prefixes: vec!["".into(), "?".into(), "~".into()],
            ..Default::default()
        };
        assert_eq!(agent_config(&fc).prefixes, vec!["?", "~"]);

        let fc = AgentFileConfig {
            prefixes: vec![],
            ..Default::default()
        };
        assert_eq!(agent_config(&fc).prefixes, vec!["!"]);
    }

    #[test]
    fn test_connection_cap_never_below_base() {
        let fc = ConnectionFileConfig {
            reconnect_base_ms: 5000,
            reconnect_cap_ms: 100,
            ..Default::default()
        };
        let options = connection_options(&fc);
        assert_eq!(options.reconnect.base, Duration::from_secs(5));
        assert_eq!(options.reconnect.cap, Duration::from_secs(5));
    }

    #[test]
    fn test_api_config_trims_trailing_slash() {
        let fc = ApiFileConfig {
            base_url: "http://127.0.0.1:9000/".into(),
            ..Default::default()
        };
        assert_eq!(ApiConfig::from_file(&fc).base_url, "http://127.0.0.1:9000");
    }

    // ── RaveBotConfig ───────────────────────────────────────────────────

    #[test]
    fn test_rave_bot_config_with_custom_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let config = RaveBotConfig::new(Some(tmp.path().to_path_buf())).unwrap();

        assert_eq!(config.data_dir, tmp.path());
        assert_eq!(config.logs_dir, tmp.path().join("logs"));
        assert!(tmp.path().join("logs").exists());
        assert_eq!(config.config_toml_path(), tmp.path().join("config.toml"));
        assert_eq!(
            config.last_status_path(),
            tmp.path().join("logs/last_status.json")
        );
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.api.base_url, "https://api.red.wemesh.ca");
        assert_eq!(fc.agent.prefixes, vec!["!"]);
        assert!(fc.agent.greeting.is_none());
        assert!(!fc.agent.reconnect_in_session);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            concat!(
                "[account]\nuser_id = 122414287\ndevice_id = \"abc\"\nauth_token = \"t\"\n",
                "[supervisor]\nsession_mode = \"all\"\nsession_limit = 5\n",
                "[agent]\nprefixes = [\"!\", \"?\"]\ngreeting = \"hi all\"\n",
            ),
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.account.user_id, 122414287);
        assert_eq!(fc.supervisor.session_mode, SessionMode::All);
        assert_eq!(fc.supervisor.session_limit, 5);
        // untouched fields keep their defaults
        assert_eq!(fc.supervisor.lang, "en");
        assert_eq!(fc.agent.prefixes, vec!["!", "?"]);
        assert_eq!(fc.agent.greeting.as_deref(), Some("hi all"));

        let config = supervisor_config(&fc).unwrap();
        assert_eq!(config.session_mode, SessionMode::All);
        assert_eq!(config.agent.prefixes, vec!["!", "?"]);
    }

    #[test]
    fn test_load_config_rejects_unknown_mode() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[supervisor]\nsession_mode = \"everything\"\n",
        )
        .unwrap();
        assert!(load_config(tmp.path()).extract::<FileConfig>().is_err());
    }
}
