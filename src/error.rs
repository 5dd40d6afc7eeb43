//! Error types shared by the proxy engine, the redirect table and the
//! certificate inspector.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Boxed error used for body streams and response hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while forwarding a request or establishing a tunnel.
///
/// None of these write anything to the client; the dispatcher decides which
/// status code (usually 502) the client sees.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Upstream request failed (DNS, refused connection, reset, timeout).
    #[error("upstream transport error: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),

    /// The response modification hook rejected the upstream response.
    #[error("response modification failed: {0}")]
    ModifyResponse(BoxError),

    /// The client connection cannot be taken over for a raw tunnel.
    #[error("http server does not support hijacking the connection")]
    HijackUnsupported,

    /// CONNECT request without a usable host:port target.
    #[error("invalid CONNECT target: {0}")]
    InvalidConnectTarget(String),

    /// Dialing the tunnel upstream failed.
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The upstream URL or the rewritten request URI could not be built.
    #[error("invalid upstream: {0}")]
    InvalidUpstream(String),

    /// Building the outbound request or client response failed.
    #[error("http error: {0}")]
    Http(#[from] hyper::http::Error),

    /// TLS connector setup for the upstream transport failed.
    #[error("tls setup failed: {0}")]
    Tls(#[from] native_tls::Error),
}

/// Errors raised by the redirect rule table.
#[derive(Debug, Error)]
pub enum RedirectError {
    /// The rule does not have the basic shape of a redirect.
    #[error("invalid redirect rule: {0}")]
    Invalid(String),

    /// A rule file could not be created, written or removed.
    #[error("redirect rule storage error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The rule file name is already taken by a rule with another prefix.
    #[error("redirect rule {match_prefix} would overwrite {owner} at {path}")]
    Conflict {
        match_prefix: String,
        owner: String,
        path: PathBuf,
    },

    /// The rule could not be serialized.
    #[error("redirect rule encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while decoding or parsing a certificate.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("decode cert bytes failed: {0}")]
    PemDecode(String),

    #[error("PEM block is {0:?}, expected CERTIFICATE")]
    NotCertificate(String),

    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("certificate issuer has no organization")]
    MissingIssuerOrganization,

    /// The chain or private key cannot be turned into a TLS identity.
    #[error("unusable key material: {0}")]
    KeyMaterial(String),

    #[error("failed to read certificate: {0}")]
    Io(#[from] io::Error),
}
