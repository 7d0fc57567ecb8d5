//! `resolveServiceConfig` — merges a service configuration block into a
//! usable `(url, host, api_root, auth, verify_tls)` tuple (spec §4.3).

use serde::{Deserialize, Serialize};

/// Raw configuration block as it appears in a job request, e.g.
/// `sensorCloudConfiguration`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfigInput {
    #[serde(default)]
    pub url: String,
    pub scheme: Option<String>,
    pub host: Option<String>,
    #[serde(rename = "apiRoot")]
    pub api_root: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
    #[serde(default = "default_verify")]
    pub verify: bool,
}

fn default_verify() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    ApiKey(String),
    Basic { username: String, password: String },
}

/// The resolved, ready-to-use service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub url: String,
    pub host: String,
    pub api_root: String,
    pub auth: Option<Auth>,
    pub verify_tls: bool,
}

/// Merge `{url, scheme, host, apiRoot, port, username/password | apiKey,
/// verify}` into a resolved `ServiceConfig`.
///
/// Resolution order (spec §4.3):
/// 1. Parse `url` (default scheme `http` when absent).
/// 2. Override scheme/host/api_root component-by-component from the
///    explicit fields, when present.
/// 3. If `port` is given, splice it onto the host (replacing any port
///    already present in the host).
/// 4. Re-assemble the URL from the (possibly overridden) components.
/// 5. Prefer API-key auth over basic auth; `None` when neither is present.
pub fn resolve_service_config(input: &ServiceConfigInput) -> ServiceConfig {
    let parsed = parse_url_loose(&input.url);

    let scheme = input.scheme.clone().unwrap_or(parsed.scheme);
    let mut host = input.host.clone().unwrap_or(parsed.host);
    let api_root = input.api_root.clone().unwrap_or(parsed.api_root);

    if let Some(port) = input.port {
        let bare_host = host.split(':').next().unwrap_or(&host).to_string();
        host = format!("{}:{}", bare_host, port);
    }

    let url = reassemble_url(&scheme, &host, &api_root);

    let auth = if let Some(ref key) = input.api_key {
        Some(Auth::ApiKey(key.clone()))
    } else if let (Some(u), Some(p)) = (&input.username, &input.password) {
        Some(Auth::Basic {
            username: u.clone(),
            password: p.clone(),
        })
    } else {
        None
    };

    ServiceConfig {
        url,
        host,
        api_root,
        auth,
        verify_tls: input.verify,
    }
}

struct LooseUrl {
    scheme: String,
    host: String,
    api_root: String,
}

/// A deliberately forgiving URL splitter: defaults to `http` when no scheme
/// is present, and treats everything after the host as the api root path.
fn parse_url_loose(url: &str) -> LooseUrl {
    if url.is_empty() {
        return LooseUrl {
            scheme: "http".to_string(),
            host: String::new(),
            api_root: String::new(),
        };
    }

    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme.to_string(), rest),
        None => ("http".to_string(), url),
    };

    let (host, api_root) = match rest.split_once('/') {
        Some((host, path)) => (host.to_string(), format!("/{}", path)),
        None => (rest.to_string(), String::new()),
    };

    LooseUrl {
        scheme,
        host,
        api_root,
    }
}

fn reassemble_url(scheme: &str, host: &str, api_root: &str) -> String {
    if host.is_empty() {
        return String::new();
    }
    format!("{}://{}{}", scheme, host, api_root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(url: &str) -> ServiceConfigInput {
        ServiceConfigInput {
            url: url.to_string(),
            verify: true,
            ..Default::default()
        }
    }

    #[test]
    fn defaults_scheme_to_http() {
        let cfg = resolve_service_config(&input("example.com/api"));
        assert_eq!(cfg.url, "http://example.com/api");
    }

    #[test]
    fn preserves_explicit_scheme() {
        let cfg = resolve_service_config(&input("https://example.com/api"));
        assert_eq!(cfg.url, "https://example.com/api");
    }

    #[test]
    fn port_override_replaces_existing_port() {
        let mut cfg_input = input("http://example.com:8080/api");
        cfg_input.port = Some(9090);
        let cfg = resolve_service_config(&cfg_input);
        assert_eq!(cfg.host, "example.com:9090");
        assert_eq!(cfg.url, "http://example.com:9090/api");
    }

    #[test]
    fn api_key_preferred_over_basic_auth() {
        let mut cfg_input = input("http://example.com");
        cfg_input.api_key = Some("secret".to_string());
        cfg_input.username = Some("u".to_string());
        cfg_input.password = Some("p".to_string());
        let cfg = resolve_service_config(&cfg_input);
        assert_eq!(cfg.auth, Some(Auth::ApiKey("secret".to_string())));
    }

    #[test]
    fn basic_auth_used_when_no_api_key() {
        let mut cfg_input = input("http://example.com");
        cfg_input.username = Some("u".to_string());
        cfg_input.password = Some("p".to_string());
        let cfg = resolve_service_config(&cfg_input);
        assert_eq!(
            cfg.auth,
            Some(Auth::Basic {
                username: "u".to_string(),
                password: "p".to_string()
            })
        );
    }

    #[test]
    fn no_auth_when_neither_present() {
        let cfg = resolve_service_config(&input("http://example.com"));
        assert_eq!(cfg.auth, None);
    }

    #[test]
    fn explicit_host_overrides_parsed_host() {
        let mut cfg_input = input("http://example.com/api");
        cfg_input.host = Some("override.test".to_string());
        let cfg = resolve_service_config(&cfg_input);
        assert_eq!(cfg.host, "override.test");
        assert_eq!(cfg.url, "http://override.test/api");
    }
}
