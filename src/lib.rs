//! devproxy - A local development HTTP/HTTPS reverse proxy
//!
//! Provides:
//! - Path-prefix mappings (`/api = http://localhost:3000/v1`) from flags and environment
//! - Longest-prefix routing with implicit trailing-slash aliases
//! - One pooled transport per backend origin
//! - HTTPS termination with an in-memory self-signed certificate

pub mod certificate;
pub mod mapping;
pub mod proxy;
pub mod rewrite;
pub mod table;
pub mod transport;

pub use certificate::{CertificateError, GeneratedCertificate};
pub use mapping::{mappings_from_environ, ConfigError, MappingError, PathMapping};
pub use proxy::{ProxyConfig, ProxyServer};
pub use rewrite::{join_path, ClientInfo, Forwarder};
pub use table::{Dispatch, MappingTable, TableError};
pub use transport::{Transport, TransportOptions, TransportPool};
