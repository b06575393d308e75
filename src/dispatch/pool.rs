use crate::config::{AuthConfig, SystemConfig};
use crate::dispatch::TransportError;
use crate::error::{Error, ErrorContext};
use crate::Result;
use keyring::Entry;
use reqwest::Proxy;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

const KEYRING_SERVICE: &str = "sap-odata-agent";

#[derive(Clone)]
pub(crate) enum Credentials {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::None => f.write_str("None"),
            Credentials::Basic { username, .. } => write!(f, "Basic({username}, ***)"),
            Credentials::Bearer { .. } => f.write_str("Bearer(***)"),
        }
    }
}

/// HTTP client bound to one SAP system.
#[derive(Debug)]
pub struct SystemClient {
    pub id: String,
    pub base_url: Url,
    pub sap_client: Option<String>,
    credentials: Credentials,
    http: reqwest::Client,
}

impl SystemClient {
    /// Request with this system's credentials and JSON accept header.
    pub fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let req = self
            .http
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json");
        match &self.credentials {
            Credentials::None => req,
            Credentials::Basic { username, password } => req.basic_auth(username, Some(password)),
            Credentials::Bearer { token } => req.bearer_auth(token),
        }
    }

    /// Whether `url` points at this system (same scheme, host and port).
    pub fn owns(&self, url: &Url) -> bool {
        url.scheme() == self.base_url.scheme()
            && url.host_str() == self.base_url.host_str()
            && url.port_or_known_default() == self.base_url.port_or_known_default()
    }
}

/// Lazily built, per-system HTTP clients.
///
/// Each system gets its own `reqwest::Client` (and cookie jar), so sessions,
/// CSRF tokens and credentials never cross systems. Callers hold an
/// `Arc<SystemClient>` for the duration of one call.
pub struct ConnectionPool {
    systems: BTreeMap<String, SystemConfig>,
    clients: Mutex<HashMap<String, Arc<SystemClient>>>,
}

impl ConnectionPool {
    pub fn new(systems: BTreeMap<String, SystemConfig>) -> Self {
        let systems = systems
            .into_iter()
            .map(|(id, cfg)| (id.to_ascii_uppercase(), cfg))
            .collect();
        Self {
            systems,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn system_ids(&self) -> impl Iterator<Item = &str> {
        self.systems.keys().map(String::as_str)
    }

    pub fn contains(&self, system_id: &str) -> bool {
        self.systems.contains_key(&system_id.to_ascii_uppercase())
    }

    pub fn acquire(&self, system_id: &str) -> Result<Arc<SystemClient>> {
        let id = system_id.to_ascii_uppercase();
        let mut clients = self
            .clients
            .lock()
            .map_err(|e| Error::configuration(format!("connection pool lock poisoned: {}", e)))?;
        if let Some(client) = clients.get(&id) {
            return Ok(Arc::clone(client));
        }

        let cfg = self.systems.get(&id).ok_or_else(|| {
            Error::parameter_with_context(
                format!("unknown SAP system '{}'", system_id),
                ErrorContext::new()
                    .with_field_path("system_id")
                    .with_details(format!(
                        "configured systems: {}",
                        self.systems.keys().cloned().collect::<Vec<_>>().join(", ")
                    )),
            )
        })?;

        let client = Arc::new(build_client(&id, cfg)?);
        tracing::debug!(system = %id, base_url = %client.base_url, "Created SAP system client");
        clients.insert(id, Arc::clone(&client));
        Ok(client)
    }
}

fn build_client(id: &str, cfg: &SystemConfig) -> Result<SystemClient> {
    let base_url = Url::parse(cfg.base_url.trim_end_matches('/')).map_err(|e| {
        Error::configuration_with_context(
            format!("invalid base_url for system {}", id),
            ErrorContext::new()
                .with_field_path(format!("systems.{}.base_url", id))
                .with_details(e.to_string()),
        )
    })?;

    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
        .pool_max_idle_per_host(cfg.pool_max_idle_per_host)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .cookie_store(true)
        .danger_accept_invalid_certs(cfg.accept_invalid_certs);

    if let Some(proxy_url) = cfg.proxy.as_deref() {
        let proxy = Proxy::all(proxy_url).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid proxy for system {}", id),
                ErrorContext::new().with_details(e.to_string()),
            )
        })?;
        builder = builder.proxy(proxy);
    }

    let http = builder
        .build()
        .map_err(|e| Error::Transport(TransportError::Other(e.to_string())))?;

    Ok(SystemClient {
        id: id.to_string(),
        base_url,
        sap_client: cfg.client.clone(),
        credentials: resolve_credentials(id, &cfg.auth)?,
        http,
    })
}

/// Explicit config value, then the named (or conventional) env var, then the OS keyring.
fn resolve_credentials(system_id: &str, auth: &AuthConfig) -> Result<Credentials> {
    match auth {
        AuthConfig::None => Ok(Credentials::None),
        AuthConfig::Basic {
            username,
            password,
            password_env,
        } => {
            let env_name = password_env
                .clone()
                .unwrap_or_else(|| format!("SAP_{}_PASSWORD", system_id));
            let password = password
                .clone()
                .or_else(|| env::var(&env_name).ok())
                .or_else(|| keyring_secret(&format!("{}:{}", system_id, username)))
                .ok_or_else(|| {
                    Error::configuration_with_context(
                        format!("no password for SAP system {}", system_id),
                        ErrorContext::new()
                            .with_field_path(format!("systems.{}.auth", system_id))
                            .with_details(format!("set {} or store it in the OS keyring", env_name)),
                    )
                })?;
            Ok(Credentials::Basic {
                username: username.clone(),
                password,
            })
        }
        AuthConfig::Bearer { token, token_env } => {
            let env_name = token_env
                .clone()
                .unwrap_or_else(|| format!("SAP_{}_TOKEN", system_id));
            let token = token
                .clone()
                .or_else(|| env::var(&env_name).ok())
                .or_else(|| keyring_secret(&format!("{}:token", system_id)))
                .ok_or_else(|| {
                    Error::configuration_with_context(
                        format!("no bearer token for SAP system {}", system_id),
                        ErrorContext::new()
                            .with_field_path(format!("systems.{}.auth", system_id))
                            .with_details(format!("set {} or store it in the OS keyring", env_name)),
                    )
                })?;
            Ok(Credentials::Bearer { token })
        }
    }
}

fn keyring_secret(user: &str) -> Option<String> {
    Entry::new(KEYRING_SERVICE, user)
        .ok()
        .and_then(|entry| entry.get_password().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system(base_url: &str) -> SystemConfig {
        SystemConfig {
            base_url: base_url.to_string(),
            ..SystemConfig::default()
        }
    }

    #[test]
    fn test_clients_are_shared_per_system() {
        let mut systems = BTreeMap::new();
        systems.insert("d2a".to_string(), system("http://d2a.example:8000"));
        systems.insert("P01".to_string(), system("http://p01.example:8000/"));
        let pool = ConnectionPool::new(systems);

        let a = pool.acquire("D2A").unwrap();
        let b = pool.acquire("d2a").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let p = pool.acquire("P01").unwrap();
        assert!(!Arc::ptr_eq(&a, &p));
        assert_eq!(p.base_url.as_str(), "http://p01.example:8000/");
    }

    #[test]
    fn test_owns_compares_origin() {
        let mut systems = BTreeMap::new();
        systems.insert("D2A".to_string(), system("https://d2a.example"));
        let pool = ConnectionPool::new(systems);
        let client = pool.acquire("D2A").unwrap();

        let own = |u: &str| client.owns(&Url::parse(u).unwrap());
        assert!(own("https://d2a.example:443/sap/opu/odata/sap/S/E?$skiptoken=10"));
        assert!(!own("http://d2a.example/sap/opu/odata/sap/S/E"));
        assert!(!own("https://d2a.example:8443/sap/opu/odata/sap/S/E"));
        assert!(!own("https://collector.example/sap/opu/odata/sap/S/E"));
    }

    #[test]
    fn test_unknown_system_is_a_parameter_error() {
        let pool = ConnectionPool::new(BTreeMap::new());
        let err = pool.acquire("X99").unwrap_err();
        assert!(matches!(err, Error::ParameterValidation { .. }));
    }

    #[test]
    fn test_inline_basic_password_wins() {
        let creds = resolve_credentials(
            "D2A",
            &AuthConfig::Basic {
                username: "RFC_USER".into(),
                password: Some("secret".into()),
                password_env: None,
            },
        )
        .unwrap();
        assert!(matches!(creds, Credentials::Basic { ref password, .. } if password == "secret"));
        assert!(!format!("{creds:?}").contains("secret"));
    }
}
