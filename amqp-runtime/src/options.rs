use std::time::Duration;

use rand::seq::SliceRandom;

use crate::error::AmqpRuntimeError;

/// Immutable broker connection options.
///
/// `host` may be given as a single string or a list; either way it's
/// normalized to a shuffled `Vec<String>` at construction, matching the
/// `random.shuffle` call in the connection params this crate is modeled on.
#[derive(Clone, Debug)]
pub struct BrokerOptions {
    pub hosts: Vec<String>,
    pub port: u16,
    pub vhost: String,
    pub user: String,
    pub password: String,
    pub tls_enabled: bool,
    pub tls_ca_path: Option<String>,
    pub socket_timeout: Duration,
    pub heartbeat: Duration,
    /// Display name advertised on the AMQP connection. `from_env` reads this
    /// from `AGENT_NAME`, matching the original client's environment fallback.
    pub connection_name: Option<String>,
}

const DEFAULT_PORT: u16 = 5672;
const DEFAULT_TLS_PORT: u16 = 5671;
const DEFAULT_VHOST: &str = "/";
const DEFAULT_SOCKET_TIMEOUT_SECS: u64 = 3;
const DEFAULT_HEARTBEAT_SECS: u64 = 30;

impl BrokerOptions {
    /// Builds options from an explicit host list (or a single host).
    ///
    /// Fails with `Config` if `hosts` is empty — the source this runtime is
    /// modeled on silently ignores `amqp_host=""`; here we treat an empty
    /// host list as a construction-time error instead.
    pub fn new<I, S>(hosts: I, user: impl Into<String>, password: impl Into<String>) -> Result<Self, AmqpRuntimeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut hosts: Vec<String> = hosts.into_iter().map(Into::into).collect();
        if hosts.is_empty() {
            return Err(AmqpRuntimeError::Config(
                "broker host list must not be empty".into(),
            ));
        }
        hosts.shuffle(&mut rand::thread_rng());

        Ok(Self {
            hosts,
            port: DEFAULT_PORT,
            vhost: DEFAULT_VHOST.to_string(),
            user: user.into(),
            password: password.into(),
            tls_enabled: false,
            tls_ca_path: None,
            socket_timeout: Duration::from_secs(DEFAULT_SOCKET_TIMEOUT_SECS),
            heartbeat: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            connection_name: None,
        })
    }

    /// Reads options from the environment: `AMQP_HOST` (comma-separated),
    /// `AMQP_PORT`, `AMQP_VHOST`, `AMQP_USER`, `AMQP_PASS`, `AMQP_TLS_ENABLED`,
    /// `AMQP_TLS_CA_PATH`, `AMQP_SOCKET_TIMEOUT_MS`, `AMQP_HEARTBEAT_SECS`.
    pub fn from_env() -> Result<Self, AmqpRuntimeError> {
        let host_var = std::env::var("AMQP_HOST")
            .map_err(|_| AmqpRuntimeError::Config("AMQP_HOST is not set".into()))?;
        let hosts: Vec<String> = host_var
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let user = std::env::var("AMQP_USER").unwrap_or_else(|_| "guest".into());
        let password = std::env::var("AMQP_PASS").unwrap_or_else(|_| "guest".into());
        let mut opts = Self::new(hosts, user, password)?;

        opts.tls_enabled = std::env::var("AMQP_TLS_ENABLED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        opts.tls_ca_path = std::env::var("AMQP_TLS_CA_PATH").ok();
        opts.port = std::env::var("AMQP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(if opts.tls_enabled { DEFAULT_TLS_PORT } else { DEFAULT_PORT });
        opts.vhost = std::env::var("AMQP_VHOST").unwrap_or_else(|_| DEFAULT_VHOST.to_string());
        if let Some(ms) = std::env::var("AMQP_SOCKET_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()) {
            opts.socket_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = std::env::var("AMQP_HEARTBEAT_SECS").ok().and_then(|v| v.parse().ok()) {
            opts.heartbeat = Duration::from_secs(secs);
        }
        opts.connection_name = std::env::var("AGENT_NAME").ok();

        Ok(opts)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    /// Enables TLS and sets the CA certificate path used to build the
    /// connector's trust store (`connect_phase` reads this file into an
    /// `OwnedTLSConfig` once per connect attempt cycle).
    pub fn with_tls(mut self, ca_path: impl Into<String>) -> Self {
        self.tls_enabled = true;
        self.tls_ca_path = Some(ca_path.into());
        self
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    /// Renders the connection URI for the given host, AMQP-scheme only
    /// (the CA cert itself is handed to lapin separately, as an
    /// `OwnedTLSConfig` built from `tls_ca_path` in `connect_phase`).
    pub fn amqp_uri(&self, host: &str) -> String {
        let scheme = if self.tls_enabled { "amqps" } else { "amqp" };
        format!(
            "{scheme}://{user}:{password}@{host}:{port}/{vhost}",
            scheme = scheme,
            user = self.user,
            password = self.password,
            host = host,
            port = self.port,
            vhost = urlencoding_vhost(&self.vhost),
        )
    }
}

fn urlencoding_vhost(vhost: &str) -> String {
    if vhost == "/" {
        String::new()
    } else {
        vhost.trim_start_matches('/').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_host_is_wrapped() {
        let opts = BrokerOptions::new(["broker.local"], "u", "p").unwrap();
        assert_eq!(opts.hosts, vec!["broker.local".to_string()]);
    }

    #[test]
    fn empty_hosts_rejected() {
        let err = BrokerOptions::new(Vec::<String>::new(), "u", "p").unwrap_err();
        assert!(matches!(err, AmqpRuntimeError::Config(_)));
    }

    #[test]
    fn shuffle_keeps_full_set() {
        let hosts = ["h1", "h2", "h3", "h4", "h5"];
        let opts = BrokerOptions::new(hosts, "u", "p").unwrap();
        let mut sorted = opts.hosts.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["h1", "h2", "h3", "h4", "h5"]);
    }

    #[test]
    fn default_vhost_renders_without_slash() {
        let opts = BrokerOptions::new(["h"], "u", "p").unwrap();
        assert_eq!(opts.amqp_uri("h"), "amqp://u:p@h:5672/");
    }

    #[test]
    fn tls_changes_scheme() {
        let opts = BrokerOptions::new(["h"], "u", "p").unwrap().with_tls("/ca.pem");
        assert!(opts.amqp_uri("h").starts_with("amqps://"));
    }
}
