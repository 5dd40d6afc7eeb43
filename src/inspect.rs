//! Certificate inspection
//!
//! Stateless helpers over raw PEM bytes: SAN and issuer extraction plus
//! expiry classification for the renewal scan. Nothing here touches the
//! certificate store; callers hand in the bytes.

use crate::error::CertificateError;
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::path::Path;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::{parse_x509_pem, Pem};

/// Renewal window before `notAfter`
pub const RENEWAL_WINDOW_DAYS: i64 = 14;

/// Expiry classification of a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryStatus {
    Valid,
    ExpiringSoon,
    Expired,
    /// The bytes could not be decoded or parsed
    Unknown,
}

impl ExpiryStatus {
    /// Whether a renewal should be attempted for this certificate
    pub fn needs_renewal(self) -> bool {
        !matches!(self, ExpiryStatus::Valid)
    }
}

fn decode_pem(cert_bytes: &[u8]) -> Result<Pem, CertificateError> {
    parse_x509_pem(cert_bytes)
        .map(|(_, pem)| pem)
        .map_err(|e| CertificateError::PemDecode(e.to_string()))
}

/// `notAfter` of the first PEM block, as a unix timestamp
fn not_after(cert_bytes: &[u8]) -> Result<i64, CertificateError> {
    let pem = decode_pem(cert_bytes)?;
    let cert = pem
        .parse_x509()
        .map_err(|e| CertificateError::Parse(e.to_string()))?;
    Ok(cert.validity().not_after.timestamp())
}

/// DNS subject alternative names, deduplicated, in certificate order
pub fn extract_domains(cert_bytes: &[u8]) -> Result<Vec<String>, CertificateError> {
    let pem = decode_pem(cert_bytes)?;
    let cert = pem
        .parse_x509()
        .map_err(|e| CertificateError::Parse(e.to_string()))?;

    let mut domains: Vec<String> = Vec::new();
    let san = cert
        .subject_alternative_name()
        .map_err(|e| CertificateError::Parse(e.to_string()))?;

    if let Some(san) = san {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                if !domains.iter().any(|d| d == dns) {
                    domains.push(dns.to_string());
                }
            }
        }
    }

    Ok(domains)
}

/// First organization of the certificate issuer
pub fn extract_issuer_name(cert_bytes: &[u8]) -> Result<String, CertificateError> {
    let pem = decode_pem(cert_bytes)?;
    if pem.label != "CERTIFICATE" {
        return Err(CertificateError::NotCertificate(pem.label));
    }

    let cert = pem
        .parse_x509()
        .map_err(|e| CertificateError::Parse(e.to_string()))?;

    let organization = cert
        .issuer()
        .iter_organization()
        .next()
        .ok_or(CertificateError::MissingIssuerOrganization)?;

    organization
        .as_str()
        .map(str::to_string)
        .map_err(|e| CertificateError::Parse(e.to_string()))
}

/// Read a PEM file and extract its issuer organization
pub fn extract_issuer_name_from_file<P: AsRef<Path>>(path: P) -> Result<String, CertificateError> {
    let pem_data = fs::read(path)?;
    extract_issuer_name(&pem_data)
}

/// Classify a certificate against an explicit clock
pub fn expiry_status_at(cert_bytes: &[u8], now: DateTime<Utc>) -> ExpiryStatus {
    let not_after = match not_after(cert_bytes) {
        Ok(ts) => ts,
        Err(_) => return ExpiryStatus::Unknown,
    };

    let now = now.timestamp();
    if now > not_after {
        ExpiryStatus::Expired
    } else if not_after - now <= Duration::days(RENEWAL_WINDOW_DAYS).num_seconds() {
        ExpiryStatus::ExpiringSoon
    } else {
        ExpiryStatus::Valid
    }
}

pub fn expiry_status(cert_bytes: &[u8]) -> ExpiryStatus {
    expiry_status_at(cert_bytes, Utc::now())
}

/// True once `now` is past `notAfter`. Unparsable input yields false.
pub fn is_expired_at(cert_bytes: &[u8], now: DateTime<Utc>) -> bool {
    expiry_status_at(cert_bytes, now) == ExpiryStatus::Expired
}

pub fn is_expired(cert_bytes: &[u8]) -> bool {
    is_expired_at(cert_bytes, Utc::now())
}

/// True when at most 14 days remain (expired certificates included).
/// Unparsable input yields false.
pub fn is_expiring_soon_at(cert_bytes: &[u8], now: DateTime<Utc>) -> bool {
    matches!(
        expiry_status_at(cert_bytes, now),
        ExpiryStatus::ExpiringSoon | ExpiryStatus::Expired
    )
}

pub fn is_expiring_soon(cert_bytes: &[u8]) -> bool {
    is_expiring_soon_at(cert_bytes, Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rcgen::{date_time_ymd, Certificate, CertificateParams, DistinguishedName, DnType};

    fn make_cert(sans: &[&str], org: Option<&str>, not_after: (i32, u8, u8)) -> String {
        let mut params =
            CertificateParams::new(sans.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "inspect test");
        if let Some(org) = org {
            dn.push(DnType::OrganizationName, org);
        }
        params.distinguished_name = dn;
        params.not_before = date_time_ymd(2020, 1, 1);
        params.not_after = date_time_ymd(not_after.0, not_after.1, not_after.2);
        Certificate::from_params(params).unwrap().serialize_pem().unwrap()
    }

    #[test]
    fn test_extract_domains_dedups_in_order() {
        let pem = make_cert(
            &["b.example.com", "a.example.com", "b.example.com"],
            None,
            (2040, 1, 1),
        );
        let domains = extract_domains(pem.as_bytes()).unwrap();
        assert_eq!(domains, vec!["b.example.com", "a.example.com"]);
    }

    #[test]
    fn test_extract_domains_rejects_garbage() {
        assert!(matches!(
            extract_domains(b"not a certificate"),
            Err(CertificateError::PemDecode(_))
        ));
    }

    #[test]
    fn test_extract_issuer_name() {
        let pem = make_cert(&["example.com"], Some("Test Issuer Org"), (2040, 1, 1));
        assert_eq!(extract_issuer_name(pem.as_bytes()).unwrap(), "Test Issuer Org");

        let no_org = make_cert(&["example.com"], None, (2040, 1, 1));
        assert!(matches!(
            extract_issuer_name(no_org.as_bytes()),
            Err(CertificateError::MissingIssuerOrganization)
        ));
    }

    #[test]
    fn test_extract_issuer_name_wrong_block_type() {
        let pem = make_cert(&["example.com"], Some("Org"), (2040, 1, 1));
        let relabelled = pem.replace("CERTIFICATE", "PUBLIC KEY");
        assert!(matches!(
            extract_issuer_name(relabelled.as_bytes()),
            Err(CertificateError::NotCertificate(label)) if label == "PUBLIC KEY"
        ));
    }

    #[test]
    fn test_extract_issuer_name_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert.pem");
        fs::write(&path, make_cert(&["example.com"], Some("File Org"), (2040, 1, 1))).unwrap();
        assert_eq!(extract_issuer_name_from_file(&path).unwrap(), "File Org");
        assert!(extract_issuer_name_from_file(dir.path().join("missing.pem")).is_err());
    }

    #[test]
    fn test_expired_certificate() {
        let pem = make_cert(&["old.example.com"], None, (2021, 1, 1));
        assert!(is_expired(pem.as_bytes()));
        assert!(is_expiring_soon(pem.as_bytes()));
        assert_eq!(expiry_status(pem.as_bytes()), ExpiryStatus::Expired);
    }

    #[test]
    fn test_far_future_certificate() {
        let pem = make_cert(&["new.example.com"], None, (2090, 1, 1));
        assert!(!is_expired(pem.as_bytes()));
        assert!(!is_expiring_soon(pem.as_bytes()));
        assert_eq!(expiry_status(pem.as_bytes()), ExpiryStatus::Valid);
    }

    #[test]
    fn test_renewal_window_boundary_is_inclusive() {
        let pem = make_cert(&["edge.example.com"], None, (2030, 6, 15));
        let not_after = Utc.with_ymd_and_hms(2030, 6, 15, 0, 0, 0).unwrap();

        let at_boundary = not_after - Duration::days(14);
        assert!(is_expiring_soon_at(pem.as_bytes(), at_boundary));
        assert!(!is_expired_at(pem.as_bytes(), at_boundary));

        let before_boundary = at_boundary - Duration::seconds(1);
        assert!(!is_expiring_soon_at(pem.as_bytes(), before_boundary));

        assert!(!is_expired_at(pem.as_bytes(), not_after));
        assert!(is_expired_at(pem.as_bytes(), not_after + Duration::seconds(1)));
    }

    #[test]
    fn test_malformed_input_is_never_expiring() {
        assert!(!is_expired(b"garbage"));
        assert!(!is_expiring_soon(b"garbage"));
        assert_eq!(expiry_status(b"garbage"), ExpiryStatus::Unknown);
        assert!(ExpiryStatus::Unknown.needs_renewal());
    }
}
