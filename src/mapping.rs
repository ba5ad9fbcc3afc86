//! Path mapping rules
//! Parses `path = targetURL` rules from flags and environment variables

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

/// Environment variable holding a single mapping rule
pub const ENV_MAP: &str = "DEVPROXY_MAP";

/// Prefix for additional mapping variables (`DEVPROXY_MAP_API`, `DEVPROXY_MAP_2`, ...)
pub const ENV_MAP_PREFIX: &str = "DEVPROXY_MAP_";

/// Errors produced while parsing a single mapping rule
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("missing '=' separator")]
    MalformedRule,

    #[error("path cannot be empty")]
    EmptyPath,

    #[error("bad URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("URL cannot have empty scheme, must be either `http` or `https` scheme")]
    MissingScheme,

    #[error("unrecognized URL scheme `{0}`, must be either `http` or `https` scheme")]
    UnsupportedScheme(String),

    #[error("missing URL host")]
    MissingHost,
}

/// Errors produced while collecting rules from the environment
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable `{key}` = `{value}`: {error}")]
    Environ {
        key: String,
        value: String,
        error: MappingError,
    },
}

/// A mapping between a proxy path prefix and a backend URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapping {
    path: String,
    target: Url,
}

impl PathMapping {
    /// Parse a rule of the form `/from/path = http://host/to/path`
    pub fn parse(rule: &str) -> Result<Self, MappingError> {
        let (source, target) = rule.split_once('=').ok_or(MappingError::MalformedRule)?;

        let source = source.trim();
        let target_str = target.trim();

        if source.is_empty() {
            return Err(MappingError::EmptyPath);
        }

        let mut target = parse_target(target_str)?;

        if target.path().is_empty() {
            target.set_path("/");
        }

        // URL parsing may normalize away an explicit directory slash
        if target_str.ends_with('/') && !target.path().ends_with('/') {
            let path = format!("{}/", target.path());
            target.set_path(&path);
        }

        Ok(Self {
            path: normalize_source_path(source),
            target,
        })
    }

    /// Normalized source path, always rooted
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Backend URL requests are forwarded to
    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Target host including an explicit port, as sent in the `Host` header
    pub fn host(&self) -> String {
        let host = self.target.host_str().unwrap_or_default();
        match self.target.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Origin key of the target: scheme, userinfo and host, no path or query
    pub fn origin(&self) -> String {
        let mut origin = format!("{}://", self.target.scheme());

        if !self.target.username().is_empty() || self.target.password().is_some() {
            origin.push_str(self.target.username());
            if let Some(password) = self.target.password() {
                origin.push(':');
                origin.push_str(password);
            }
            origin.push('@');
        }

        origin.push_str(&self.host());
        origin
    }
}

impl FromStr for PathMapping {
    type Err = MappingError;

    fn from_str(rule: &str) -> Result<Self, Self::Err> {
        Self::parse(rule)
    }
}

impl fmt::Display for PathMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.path, self.target)
    }
}

/// Parse the target side of a rule and enforce scheme and host constraints
fn parse_target(raw: &str) -> Result<Url, MappingError> {
    let target = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => return Err(MappingError::MissingScheme),
        Err(url::ParseError::EmptyHost) => return Err(MappingError::MissingHost),
        Err(e) => return Err(MappingError::InvalidUrl(e)),
    };

    match target.scheme() {
        "http" | "https" => {}
        other => return Err(MappingError::UnsupportedScheme(other.to_string())),
    }

    // The url crate accepts `http:host` and `http:///host`; the raw authority must be present
    let authority_ok = raw_authority(raw).map_or(false, |a| !a.is_empty() && !a.starts_with(':'));
    let host_ok = target.host_str().map_or(false, |h| !h.is_empty());

    if !authority_ok || !host_ok {
        return Err(MappingError::MissingHost);
    }

    Ok(target)
}

/// Host and port portion of `scheme://[user@]host[:port]/...` as written
fn raw_authority(raw: &str) -> Option<&str> {
    let (_, rest) = raw.split_once("://")?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];

    Some(authority.rsplit_once('@').map_or(authority, |(_, host)| host))
}

/// Root and clean a source path, keeping an explicit trailing slash
fn normalize_source_path(source: &str) -> String {
    let rooted = if source.starts_with('/') {
        source.to_string()
    } else {
        format!("/{}", source)
    };

    let mut path = clean_path(&rooted);

    if source.ends_with('/') && !path.ends_with('/') {
        path.push('/');
    }

    path
}

/// Lexically clean a slash-separated path
///
/// Collapses repeated slashes, drops `.` elements and resolves `..` against
/// the preceding element. Rooted paths never climb above `/`. Trailing
/// slashes are removed except for the root itself.
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let rooted = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().map_or(false, |s| *s != "..") {
                    segments.pop();
                } else if !rooted {
                    segments.push("..");
                }
            }
            s => segments.push(s),
        }
    }

    let joined = segments.join("/");

    if rooted {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Collect mapping rules from `DEVPROXY_MAP` and `DEVPROXY_MAP_*` variables
///
/// Variables are visited in key order. The first rule that fails to parse
/// aborts with an error naming the variable.
pub fn mappings_from_environ<I>(vars: I) -> Result<Vec<PathMapping>, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut rules: Vec<(String, String)> = vars
        .into_iter()
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| key == ENV_MAP || key.starts_with(ENV_MAP_PREFIX))
        .collect();

    rules.sort_by(|a, b| a.0.cmp(&b.0));

    rules
        .into_iter()
        .map(|(key, value)| {
            PathMapping::parse(&value).map_err(|error| ConfigError::Environ { key, value, error })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_basic_rule() {
        let mapping = PathMapping::parse("/api = http://localhost:3000/v1").unwrap();

        assert_eq!(mapping.path(), "/api");
        assert_eq!(mapping.target().as_str(), "http://localhost:3000/v1");
        assert_eq!(mapping.host(), "localhost:3000");
    }

    #[test]
    fn test_parse_preserves_trailing_slashes() {
        let cases = [
            ("/api = http://a.test/v1", "/api", "/v1"),
            ("/api/ = http://a.test/v1", "/api/", "/v1"),
            ("/api = http://a.test/v1/", "/api", "/v1/"),
            ("/api/ = http://a.test/v1/", "/api/", "/v1/"),
        ];

        for (rule, path, target_path) in cases {
            let mapping = PathMapping::parse(rule).unwrap();
            assert_eq!(mapping.path(), path, "rule: {}", rule);
            assert_eq!(mapping.target().path(), target_path, "rule: {}", rule);
        }
    }

    #[test]
    fn test_parse_defaults_target_path() {
        let mapping = PathMapping::parse("/ = https://example.com").unwrap();
        assert_eq!(mapping.target().path(), "/");
        assert_eq!(mapping.path(), "/");
    }

    #[test]
    fn test_parse_cleans_source_path() {
        let mapping = PathMapping::parse(" //a/./b/../c// = http://a.test/").unwrap();
        assert_eq!(mapping.path(), "/a/c/");

        let mapping = PathMapping::parse("docs = http://a.test/").unwrap();
        assert_eq!(mapping.path(), "/docs");
    }

    #[test]
    fn test_parse_splits_on_first_separator() {
        let mapping = PathMapping::parse("/q = http://a.test/search?x=1").unwrap();
        assert_eq!(mapping.path(), "/q");
        assert_eq!(mapping.target().query(), Some("x=1"));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(PathMapping::parse("/api http://a.test"), Err(MappingError::MalformedRule));
        assert_eq!(PathMapping::parse("  = http://a.test"), Err(MappingError::EmptyPath));
        assert_eq!(PathMapping::parse("/api = /just/a/path"), Err(MappingError::MissingScheme));
        assert_eq!(
            PathMapping::parse("/api = ftp://files.test/"),
            Err(MappingError::UnsupportedScheme("ftp".to_string()))
        );
        assert_eq!(PathMapping::parse("/api = http://:8080/"), Err(MappingError::MissingHost));
        assert_eq!(PathMapping::parse("/api = http:///v1"), Err(MappingError::MissingHost));
        assert_eq!(PathMapping::parse("/api = http:a.test"), Err(MappingError::MissingHost));
    }

    #[test]
    fn test_parse_invalid_url() {
        let err = PathMapping::parse("/api = http://a.test:99999/").unwrap_err();
        assert!(matches!(err, MappingError::InvalidUrl(_)));
    }

    #[test]
    fn test_error_messages() {
        let err = PathMapping::parse("/x = gopher://a.test").unwrap_err();
        assert_eq!(
            err.to_string(),
            "unrecognized URL scheme `gopher`, must be either `http` or `https` scheme"
        );
    }

    #[test]
    fn test_origin_key() {
        let a = PathMapping::parse("/a = http://shared.test/a").unwrap();
        let b = PathMapping::parse("/b = http://shared.test/b?x=1").unwrap();
        assert_eq!(a.origin(), "http://shared.test");
        assert_eq!(a.origin(), b.origin());

        let c = PathMapping::parse("/c = https://user:pw@shared.test:8443/").unwrap();
        assert_eq!(c.origin(), "https://user:pw@shared.test:8443");
        assert_eq!(c.host(), "shared.test:8443");
    }

    #[test]
    fn test_display_round_trip() {
        let mapping = PathMapping::parse("/api/ = http://a.test/v1/").unwrap();
        assert_eq!(mapping.to_string(), "/api/ = http://a.test/v1/");

        let reparsed: PathMapping = mapping.to_string().parse().unwrap();
        assert_eq!(reparsed, mapping);
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(""), ".");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path("//a//b/"), "/a/b");
        assert_eq!(clean_path("/a/./b/../c"), "/a/c");
        assert_eq!(clean_path("/../x"), "/x");
        assert_eq!(clean_path("a/../../b"), "../b");
        assert_eq!(clean_path("a/.."), ".");
    }

    #[test]
    fn test_mappings_from_environ() {
        let env = vars(&[
            ("PATH", "/usr/bin"),
            ("DEVPROXY_MAP_B", "/b = http://b.test/"),
            ("DEVPROXY_MAP", "/ = http://root.test/"),
            ("DEVPROXY_MAPPING", "/ignored = http://x.test/"),
            ("DEVPROXY_MAP_A", " /a = http://a.test/ "),
        ]);

        let mappings = mappings_from_environ(env).unwrap();
        let paths: Vec<&str> = mappings.iter().map(|m| m.path()).collect();

        assert_eq!(paths, vec!["/", "/a", "/b"]);
    }

    #[test]
    fn test_mappings_from_environ_reports_key() {
        let env = vars(&[("DEVPROXY_MAP_BROKEN", "/x = ftp://x.test/")]);

        let err = mappings_from_environ(env).unwrap_err();
        let message = err.to_string();

        assert!(message.contains("DEVPROXY_MAP_BROKEN"));
        assert!(message.contains("ftp://x.test/"));
        assert!(message.contains("unrecognized URL scheme `ftp`"));
    }
}
