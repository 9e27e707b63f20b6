//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `WORKFORCE__*` 覆盖（双下划线表示嵌套，如 `WORKFORCE__BROKER__MODE=redis`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub conversation: ConversationSection,
    #[serde(default)]
    pub admission: AdmissionSection,
}

/// [broker] 段：发布订阅后端（in-memory / redis / google-pub-sub / kafka）
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSection {
    #[serde(default = "default_mode")]
    pub mode: String,
    pub uri: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            uri: None,
            username: None,
            password: None,
        }
    }
}

/// [cache] 段：缓存后端（redis / in-memory），未知模式回退到内存
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_mode")]
    pub mode: String,
    pub uri: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Redis 键过期时间（秒）
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            uri: None,
            username: None,
            password: None,
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_mode() -> String {
    "in-memory".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    60 * 60 * 7
}

/// [transport] 段：握手与重连时序（毫秒）
#[derive(Debug, Clone, Deserialize)]
pub struct TransportSection {
    /// 连接建立后延迟发送 token
    #[serde(default = "default_token_delay_ms")]
    pub token_delay_ms: u64,
    /// 连接建立后等待认证确认的上限
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    /// 断开后重连间隔（固定，不递增）
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            token_delay_ms: default_token_delay_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl TransportSection {
    pub fn token_delay(&self) -> Duration {
        Duration::from_millis(self.token_delay_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

fn default_token_delay_ms() -> u64 {
    5_000
}

fn default_auth_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

/// [conversation] 段：release 之后保留会话状态的宽限期
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationSection {
    #[serde(default = "default_release_delay_secs")]
    pub release_delay_secs: u64,
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            release_delay_secs: default_release_delay_secs(),
        }
    }
}

impl ConversationSection {
    pub fn release_delay(&self) -> Duration {
        Duration::from_secs(self.release_delay_secs)
    }
}

fn default_release_delay_secs() -> u64 {
    30
}

/// [admission] 段：WIP 上限默认值与队列冲刷间隔
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionSection {
    #[serde(default = "default_wip_limit")]
    pub default_wip_limit: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            default_wip_limit: default_wip_limit(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl AdmissionSection {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

fn default_wip_limit() -> usize {
    1
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

/// 从 config 目录加载配置，环境变量 WORKFORCE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 WORKFORCE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("WORKFORCE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_timings() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.broker.mode, "in-memory");
        assert_eq!(cfg.cache.ttl_secs, 25_200);
        assert_eq!(cfg.transport.token_delay(), Duration::from_secs(5));
        assert_eq!(cfg.transport.auth_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.transport.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(cfg.conversation.release_delay(), Duration::from_secs(30));
        assert_eq!(cfg.admission.default_wip_limit, 1);
    }

    #[test]
    fn test_load_config_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[broker]\nmode = \"redis\"\nuri = \"redis://127.0.0.1:6379\"\n\n[conversation]\nrelease_delay_secs = 5"
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.broker.mode, "redis");
        assert_eq!(cfg.broker.uri.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(cfg.conversation.release_delay_secs, 5);
        assert_eq!(cfg.cache.mode, "in-memory");
    }
}
