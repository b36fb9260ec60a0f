//! CGI environment construction.
//!
//! Legacy web procedures read request metadata through `owa_util.get_cgi_env`,
//! so the gateway rebuilds the classic CGI variable set from the HTTP
//! request and pushes it into the session before invocation. Built once per
//! request, never mutated afterwards.

use std::collections::HashMap;

use axum::http::HeaderMap;

/// Immutable string map of CGI variables, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestEnvironment {
    vars: Vec<(String, String)>,
}

impl RequestEnvironment {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Parallel name/value arrays for `owa.init_cgi_env`.
    pub fn to_arrays(&self) -> (Vec<String>, Vec<String>) {
        let names = self.vars.iter().map(|(n, _)| n.clone()).collect();
        let values = self.vars.iter().map(|(_, v)| v.clone()).collect();
        (names, values)
    }

    fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some((_, v)) = self.vars.iter_mut().find(|(n, _)| *n == name) {
            *v = value;
        } else {
            self.vars.push((name, value));
        }
    }
}

/// Raw request facts the environment is derived from.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub method: String,
    pub prefix: String,
    pub proc_name: String,
    pub query_string: String,
    pub remote_addr: Option<String>,
    pub remote_user: Option<String>,
}

const FORWARDED_HEADERS: &[(&str, &str)] = &[
    ("host", "HTTP_HOST"),
    ("user-agent", "HTTP_USER_AGENT"),
    ("accept", "HTTP_ACCEPT"),
    ("accept-encoding", "HTTP_ACCEPT_ENCODING"),
    ("accept-language", "HTTP_ACCEPT_LANGUAGE"),
    ("referer", "HTTP_REFERER"),
    ("cookie", "HTTP_COOKIE"),
];

/// Derive the CGI variable set, then merge the route's static overrides
/// (override wins).
pub fn build(meta: &RequestMeta, headers: &HeaderMap, overrides: &HashMap<String, String>) -> RequestEnvironment {
    let mut env = RequestEnvironment::default();
    env.set("PLSQL_GATEWAY", "WebDb");
    env.set("GATEWAY_IVERSION", "2");
    env.set("SERVER_SOFTWARE", concat!("plsgate/", env!("CARGO_PKG_VERSION")));
    env.set("GATEWAY_INTERFACE", "CGI/1.1");
    env.set("SERVER_PROTOCOL", "HTTP/1.1");
    env.set("REQUEST_METHOD", meta.method.to_ascii_uppercase());
    env.set("SCRIPT_NAME", meta.prefix.clone());
    env.set("PATH_INFO", format!("/{}", meta.proc_name));
    env.set("QUERY_STRING", meta.query_string.clone());
    env.set("REMOTE_ADDR", meta.remote_addr.clone().unwrap_or_default());
    if let Some(user) = &meta.remote_user {
        env.set("REMOTE_USER", user.clone());
    }
    for (header, var) in FORWARDED_HEADERS {
        if let Some(value) = headers.get(*header).and_then(|v| v.to_str().ok()) {
            env.set(*var, value);
        }
    }
    for (name, value) in overrides {
        env.set(name.clone(), value.clone());
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn meta() -> RequestMeta {
        RequestMeta {
            method: "get".into(),
            prefix: "/pls/app".into(),
            proc_name: "sample.pageindex".into(),
            query_string: "name=Joe".into(),
            remote_addr: Some("10.0.0.7".into()),
            remote_user: None,
        }
    }

    #[test]
    fn derives_core_variables() {
        let headers = HeaderMap::new();
        let env = build(&meta(), &headers, &HashMap::new());
        assert_eq!(env.get("REQUEST_METHOD"), Some("GET"));
        assert_eq!(env.get("SCRIPT_NAME"), Some("/pls/app"));
        assert_eq!(env.get("PATH_INFO"), Some("/sample.pageindex"));
        assert_eq!(env.get("QUERY_STRING"), Some("name=Joe"));
        assert_eq!(env.get("REMOTE_ADDR"), Some("10.0.0.7"));
        assert_eq!(env.get("PLSQL_GATEWAY"), Some("WebDb"));
    }

    #[test]
    fn forwards_http_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static("test/1.0"));
        headers.insert("cookie", HeaderValue::from_static("session=abc"));
        let env = build(&meta(), &headers, &HashMap::new());
        assert_eq!(env.get("HTTP_USER_AGENT"), Some("test/1.0"));
        assert_eq!(env.get("HTTP_COOKIE"), Some("session=abc"));
    }

    #[test]
    fn static_overrides_win() {
        let mut overrides = HashMap::new();
        overrides.insert("REMOTE_ADDR".to_string(), "masked".to_string());
        overrides.insert("SERVER_NAME".to_string(), "example.test".to_string());
        let env = build(&meta(), &HeaderMap::new(), &overrides);
        assert_eq!(env.get("REMOTE_ADDR"), Some("masked"));
        assert_eq!(env.get("SERVER_NAME"), Some("example.test"));
    }

    #[test]
    fn arrays_are_parallel() {
        let env = build(&meta(), &HeaderMap::new(), &HashMap::new());
        let (names, values) = env.to_arrays();
        assert_eq!(names.len(), values.len());
        assert_eq!(names.len(), env.len());
    }
}
