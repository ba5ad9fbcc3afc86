//! Mapping table
//! Immutable path-prefix routing table built once from parsed mappings
//!
//! Patterns ending in `/` match themselves and every path below them; other
//! patterns match only their exact path. The longest matching pattern wins.

use crate::mapping::{clean_path, PathMapping};
use crate::rewrite::Forwarder;
use crate::transport::{TransportOptions, TransportPool};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Characters re-encoded when a decoded path is sent back in a `Location` header
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Errors produced while building the table
#[derive(Debug, Error)]
pub enum TableError {
    #[error("duplicate mapping for path `{path}`: `{first}` and `{second}`")]
    DuplicatePath {
        path: String,
        first: String,
        second: String,
    },
}

/// A registered pattern and the forwarder serving it
pub struct Route {
    pattern: String,
    forwarder: Arc<Forwarder>,
    alias: bool,
}

impl Route {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    /// True for the implicit `path/` entry added for a `path` mapping
    pub fn is_alias(&self) -> bool {
        self.alias
    }

    /// Encoded request path to forward: the full path under `/`, otherwise
    /// the path with the pattern stripped
    ///
    /// The pattern was matched against the decoded path, so the prefix is
    /// measured in decoded bytes and the remainder keeps its original escapes.
    fn suffix(&self, raw: &str) -> String {
        if self.pattern == "/" {
            return raw.to_string();
        }

        let offset = encoded_offset(raw, self.pattern.trim_end_matches('/').len());
        raw.get(offset..).unwrap_or(raw).to_string()
    }
}

/// Outcome of routing a request path
pub enum Dispatch {
    /// Forward through `forwarder`, with the routed prefix removed from the path
    Forward {
        forwarder: Arc<Forwarder>,
        suffix: String,
    },
    /// Redirect the client to this path
    Redirect(String),
    NotFound,
}

/// Routing table plus the transports its forwarders use
pub struct MappingTable {
    routes: BTreeMap<String, Route>,
    transports: TransportPool,
}

impl MappingTable {
    /// Build the table, creating one transport per distinct origin
    ///
    /// Two explicit mappings for the same path are rejected. Every path
    /// without a trailing slash also answers `path/` unless another mapping
    /// claims that key explicitly.
    pub fn build<I>(mappings: I, options: TransportOptions) -> Result<Self, TableError>
    where
        I: IntoIterator<Item = PathMapping>,
    {
        let mut transports = TransportPool::new(options);
        let mut routes: BTreeMap<String, Route> = BTreeMap::new();

        for mapping in mappings {
            if let Some(existing) = routes.get(mapping.path()) {
                return Err(TableError::DuplicatePath {
                    path: mapping.path().to_string(),
                    first: existing.forwarder.mapping().target().to_string(),
                    second: mapping.target().to_string(),
                });
            }

            let transport = transports.get_or_create(&mapping);
            let pattern = mapping.path().to_string();

            routes.insert(
                pattern.clone(),
                Route {
                    pattern,
                    forwarder: Arc::new(Forwarder::new(mapping, transport)),
                    alias: false,
                },
            );
        }

        let aliases: Vec<Route> = routes
            .values()
            .filter(|route| !route.pattern.ends_with('/'))
            .map(|route| Route {
                pattern: format!("{}/", route.pattern),
                forwarder: route.forwarder.clone(),
                alias: true,
            })
            .filter(|alias| !routes.contains_key(&alias.pattern))
            .collect();

        for alias in aliases {
            routes.insert(alias.pattern.clone(), alias);
        }

        Ok(Self { routes, transports })
    }

    /// Route a percent-encoded request path
    ///
    /// Cleaning and matching run on the decoded path. Unclean paths redirect
    /// to their cleaned form, and a path whose only match is its own subtree
    /// pattern redirects to `path/`.
    pub fn dispatch(&self, raw: &str) -> Dispatch {
        let path = percent_decode_str(raw).decode_utf8_lossy();

        let cleaned = clean_request_path(&path);
        if cleaned != path {
            return Dispatch::Redirect(encode_path(&cleaned));
        }

        if let Some(route) = self.routes.get(path.as_ref()) {
            return self.forward(route, raw);
        }

        let subtree = format!("{}/", path);
        if self.routes.contains_key(&subtree) {
            return Dispatch::Redirect(encode_path(&subtree));
        }

        match self.longest_prefix(&path) {
            Some(route) => self.forward(route, raw),
            None => Dispatch::NotFound,
        }
    }

    /// Longest subtree pattern covering `path`
    fn longest_prefix(&self, path: &str) -> Option<&Route> {
        path.rmatch_indices('/')
            .map(|(i, _)| &path[..=i])
            .find_map(|prefix| self.routes.get(prefix))
    }

    fn forward(&self, route: &Route, raw: &str) -> Dispatch {
        Dispatch::Forward {
            forwarder: route.forwarder.clone(),
            suffix: route.suffix(raw),
        }
    }

    pub fn route(&self, pattern: &str) -> Option<&Route> {
        self.routes.get(pattern)
    }

    pub fn transports(&self) -> &TransportPool {
        &self.transports
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Display for MappingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for route in self.routes.values() {
            writeln!(
                f,
                "    {:<10} => {}",
                route.pattern,
                route.forwarder.mapping().target()
            )?;
        }
        Ok(())
    }
}

fn encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH_ENCODE_SET).to_string()
}

/// Byte offset in `raw` where its first `decoded_len` decoded bytes end
fn encoded_offset(raw: &str, decoded_len: usize) -> usize {
    let bytes = raw.as_bytes();
    let hex = |at: usize| bytes.get(at).map_or(false, u8::is_ascii_hexdigit);

    let mut offset = 0;
    for _ in 0..decoded_len {
        if offset >= bytes.len() {
            break;
        }
        offset += if bytes[offset] == b'%' && hex(offset + 1) && hex(offset + 2) {
            3
        } else {
            1
        };
    }

    offset
}

/// Clean a request path, keeping its trailing slash
fn clean_request_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut cleaned = if path.starts_with('/') {
        clean_path(path)
    } else {
        clean_path(&format!("/{}", path))
    };

    if path.ends_with('/') && cleaned != "/" {
        cleaned.push('/');
    }

    cleaned
}
