//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The OIDC client secret is loaded from OIDC_CLIENT_SECRET or
//! client_secret_file, never stored in the TOML directly to avoid leaking
//! secrets.

use auth_session::SessionConfig;
use common::Secret;
use oidc_auth::OidcConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub oidc: OidcConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// HTTP listener and session persistence settings
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    /// Where `/callback` sends the browser after a successful login
    #[serde(default = "default_post_login_path")]
    pub post_login_path: String,
    /// Token store file; tokens survive restarts and are restored at startup
    #[serde(default = "default_token_store")]
    pub token_store: PathBuf,
    /// Stable session id so persisted tokens can be found again
    #[serde(default = "default_session_id")]
    pub session_id: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_post_login_path() -> String {
    "/session".into()
}

fn default_token_store() -> PathBuf {
    PathBuf::from("auth-gateway-tokens.json")
}

fn default_session_id() -> String {
    "operator".into()
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client secret resolution order:
    /// 1. OIDC_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        config.oidc.validate()?;
        config.session.validate()?;

        if !config.gateway.post_login_path.starts_with('/') {
            return Err(common::Error::Config(format!(
                "post_login_path must be an absolute path, got: {}",
                config.gateway.post_login_path
            )));
        }

        if config.gateway.session_id.trim().is_empty() {
            return Err(common::Error::Config("session_id must not be empty".into()));
        }

        if config.gateway.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        // Resolve client secret: env var takes precedence over file
        if let Ok(secret) = std::env::var("OIDC_CLIENT_SECRET") {
            config.oidc.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.oidc.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                config.oidc.client_secret = Some(Secret::new(secret));
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("auth-gateway.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn valid_toml() -> &'static str {
        r#"
[gateway]
listen_addr = "127.0.0.1:8400"

[oidc]
authorization_endpoint = "https://idp.example/authorize"
token_endpoint = "https://idp.example/oauth/token"
userinfo_endpoint = "https://idp.example/userinfo"
end_session_endpoint = "https://idp.example/v2/logout"
client_id = "client-1"
redirect_uri = "http://127.0.0.1:8400/callback"

[session]
auto_refresh = true
"#
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("auth-gateway.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_valid_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        unsafe { remove_env("OIDC_CLIENT_SECRET") };

        let config = Config::load(&path).unwrap();
        assert_eq!(config.gateway.listen_addr.port(), 8400);
        assert_eq!(config.gateway.post_login_path, "/session");
        assert_eq!(config.gateway.session_id, "operator");
        assert_eq!(config.gateway.max_connections, 1000);
        assert_eq!(
            config.gateway.token_store,
            PathBuf::from("auth-gateway-tokens.json")
        );
        assert_eq!(config.oidc.client_id, "client-1");
        assert!(config.oidc.client_secret.is_none());
        assert!(config.session.auto_refresh);
        assert_eq!(config.session.clock_skew_tolerance_secs, 60);
    }

    #[test]
    fn test_session_table_is_optional() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let toml = valid_toml().replace("[session]\nauto_refresh = true\n", "");
        let path = write_config(&dir, &toml);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        let result = Config::load(&path);
        assert!(matches!(result, Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_invalid_oidc_endpoint_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let toml = valid_toml().replace("https://idp.example/oauth/token", "idp.example/token");
        let path = write_config(&dir, &toml);

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("token_endpoint"), "got: {err}");
    }

    #[test]
    fn test_relative_post_login_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let toml = valid_toml().replace(
            "listen_addr = \"127.0.0.1:8400\"",
            "listen_addr = \"127.0.0.1:8400\"\npost_login_path = \"dashboard\"",
        );
        let path = write_config(&dir, &toml);

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("post_login_path"), "got: {err}");
    }

    #[test]
    fn test_zero_max_connections_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let toml = valid_toml().replace(
            "listen_addr = \"127.0.0.1:8400\"",
            "listen_addr = \"127.0.0.1:8400\"\nmax_connections = 0",
        );
        let path = write_config(&dir, &toml);

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("max_connections"), "got: {err}");
    }

    #[test]
    fn test_client_secret_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        unsafe { set_env("OIDC_CLIENT_SECRET", "env-secret") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("OIDC_CLIENT_SECRET") };

        assert_eq!(
            config.oidc.client_secret.as_ref().unwrap().expose(),
            "env-secret"
        );
    }

    #[test]
    fn test_client_secret_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("client-secret");
        std::fs::write(&secret_path, "file-secret\n").unwrap();
        let toml = valid_toml().replace(
            "client_id = \"client-1\"",
            &format!(
                "client_id = \"client-1\"\nclient_secret_file = \"{}\"",
                secret_path.display()
            ),
        );
        let path = write_config(&dir, &toml);

        unsafe { remove_env("OIDC_CLIENT_SECRET") };
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.oidc.client_secret.as_ref().unwrap().expose(),
            "file-secret"
        );
    }

    #[test]
    fn test_env_secret_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let toml = valid_toml().replace(
            "client_id = \"client-1\"",
            "client_id = \"client-1\"\nclient_secret_file = \"/nonexistent/secret\"",
        );
        let path = write_config(&dir, &toml);

        unsafe { set_env("OIDC_CLIENT_SECRET", "env-wins") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("OIDC_CLIENT_SECRET") };

        assert_eq!(config.oidc.client_secret.unwrap().expose(), "env-wins");
    }

    #[test]
    fn test_missing_secret_file_is_config_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let toml = valid_toml().replace(
            "client_id = \"client-1\"",
            "client_id = \"client-1\"\nclient_secret_file = \"/nonexistent/secret\"",
        );
        let path = write_config(&dir, &toml);

        unsafe { remove_env("OIDC_CLIENT_SECRET") };
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, common::Error::Config(ref m) if m.contains("client_secret_file")));
    }

    #[test]
    fn test_resolve_path_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/etc/auth-gateway/from-env.toml") };
        assert_eq!(
            Config::resolve_path(Some("/cli.toml")),
            PathBuf::from("/cli.toml")
        );
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("/etc/auth-gateway/from-env.toml")
        );
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("auth-gateway.toml")
        );
    }
}
