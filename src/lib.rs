//! Dynproxy - A dynamic HTTP/HTTPS reverse proxy
//!
//! - Host and virtual-directory routing from a SQLite route store
//! - Prefix redirect rules persisted as JSON files
//! - CONNECT tunnelling and WebSocket upgrades
//! - Location rewriting so redirects stay on the proxy
//! - SNI certificate selection with a periodic renewal scan

pub mod cert_store;
pub mod engine;
pub mod error;
pub mod flush;
pub mod inspect;
pub mod redirect;
pub mod rewrite;
pub mod routes;
pub mod server;
pub mod tunnel;

pub use cert_store::CertificateStore;
pub use engine::{ClientInfo, EngineConfig, PoolConfig, ReverseProxy};
pub use error::{CertificateError, ProxyError, RedirectError};
pub use redirect::{RedirectRule, RedirectRuleTable};
pub use rewrite::ResponseRewriteRuleSet;
pub use routes::{ProxyRoute, RouteStore};
pub use server::{ProxyServer, ServerConfig};
