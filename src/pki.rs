//! Cluster certificate authority and node certificates.
//!
//! All material lives as PEM files in the cluster's `generated/keys`
//! directory:
//!
//! - `ca.pem` / `ca-key.pem`: self-signed cluster CA
//! - `<host>.pem` / `<host>-key.pem`: one serving and client certificate per node
//! - `admin.pem` / `admin-key.pem`: cluster administrator client certificate
//!
//! Generation is idempotent: a certificate is reused while its files exist,
//! parse, and have not expired, unless regeneration is forced or the CA was
//! replaced.

use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Utc};
use rcgen::{
    string::{Ia5String, PrintableString}, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SigningKey,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::plan::{Certificates, Node, NodeRole, Plan};

/// CA certificate file name
pub const CA_CERT_FILE: &str = "ca.pem";
/// CA key file name
pub const CA_KEY_FILE: &str = "ca-key.pem";
/// Administrator certificate base name
pub const ADMIN_NAME: &str = "admin";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key or certificate generation failed
    #[error("certificate generation failed for {subject}: {source}")]
    Generation {
        /// Certificate subject
        subject: String,
        /// Underlying error
        #[source]
        source: rcgen::Error,
    },

    /// The plan's expiry could not be interpreted
    #[error("invalid certificate expiry {value:?}")]
    InvalidExpiry {
        /// Value from the plan
        value: String,
    },

    /// A name cannot be used in a certificate
    #[error("invalid subject alternative name {value:?}")]
    InvalidName {
        /// Offending name
        value: String,
    },

    /// IO error
    #[error("IO error at {}: {source}", path.display())]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Which certificates were produced and which were kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateReport {
    /// Subjects freshly generated
    pub generated: Vec<String>,
    /// Subjects reused from disk
    pub reused: Vec<String>,
}

impl CertificateReport {
    fn record(&mut self, subject: &str, generated: bool) {
        if generated {
            self.generated.push(subject.to_string());
        } else {
            self.reused.push(subject.to_string());
        }
    }
}

/// Certificate and key paths for `name` inside `keys_dir`.
pub fn cert_paths(keys_dir: &Path, name: &str) -> (PathBuf, PathBuf) {
    (keys_dir.join(format!("{name}.pem")), keys_dir.join(format!("{name}-key.pem")))
}

/// Ensure the CA, every node certificate and the admin certificate exist.
pub fn generate_certificates(plan: &Plan, keys_dir: &Path, force: bool) -> Result<CertificateReport> {
    let validity = plan
        .cluster
        .certificates
        .validity()
        .ok_or_else(|| PkiError::InvalidExpiry {
            value: plan.cluster.certificates.expiry.clone(),
        })?;

    fs::create_dir_all(keys_dir).map_err(io_err(keys_dir))?;

    let mut report = CertificateReport::default();
    let ca_cert_path = keys_dir.join(CA_CERT_FILE);
    let ca_key_path = keys_dir.join(CA_KEY_FILE);

    let regenerate_ca = force || !certificate_valid(&ca_cert_path, &ca_key_path);
    if regenerate_ca {
        let ca_name = format!("{}-ca", plan.cluster.name);
        let mut params = base_params(&plan.cluster.name, &ca_name, &plan.cluster.certificates, validity);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key_pair = KeyPair::generate().map_err(gen_err("ca"))?;
        let cert = params.self_signed(&key_pair).map_err(gen_err("ca"))?;
        write_pem(&ca_key_path, &key_pair.serialize_pem(), true)?;
        write_pem(&ca_cert_path, &cert.pem(), false)?;
        info!(cluster = %plan.cluster.name, "Generated cluster CA");
    }
    report.record("ca", regenerate_ca);

    let ca_cert_pem = read_pem(&ca_cert_path)?;
    let ca_key = KeyPair::from_pem(&read_pem(&ca_key_path)?).map_err(gen_err("ca"))?;
    let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, &ca_key).map_err(gen_err("ca"))?;

    for node in plan.all_nodes() {
        let (cert_path, key_path) = cert_paths(keys_dir, &node.host);
        let regenerate = regenerate_ca || force || !certificate_valid(&cert_path, &key_path);
        if regenerate {
            let mut params = base_params(&plan.cluster.name, &node.host, &plan.cluster.certificates, validity);
            params.subject_alt_names = node_sans(plan, node)?;
            params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
            params.extended_key_usages = vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ];
            sign_and_write(&params, &issuer, &node.host, &cert_path, &key_path)?;
            debug!(host = %node.host, "Generated node certificate");
        }
        report.record(&node.host, regenerate);
    }

    let (admin_cert, admin_key) = cert_paths(keys_dir, ADMIN_NAME);
    let regenerate_admin = regenerate_ca || force || !certificate_valid(&admin_cert, &admin_key);
    if regenerate_admin {
        let mut params = base_params("system:masters", ADMIN_NAME, &plan.cluster.certificates, validity);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        sign_and_write(&params, &issuer, ADMIN_NAME, &admin_cert, &admin_key)?;
    }
    report.record(ADMIN_NAME, regenerate_admin);

    info!(
        generated = report.generated.len(),
        reused = report.reused.len(),
        "Certificates ready"
    );
    Ok(report)
}

/// A certificate is reusable when both files exist, the certificate parses,
/// and it has not expired.
pub fn certificate_valid(cert_path: &Path, key_path: &Path) -> bool {
    if !key_path.is_file() {
        return false;
    }
    let Ok(bytes) = fs::read(cert_path) else {
        return false;
    };
    let Ok((_, pem)) = x509_parser::pem::parse_x509_pem(&bytes) else {
        return false;
    };
    match pem.parse_x509() {
        Ok(cert) => cert.validity().not_after.timestamp() > Utc::now().timestamp(),
        Err(_) => false,
    }
}

fn base_params(
    organization: &str,
    common_name: &str,
    location: &Certificates,
    validity: chrono::Duration,
) -> CertificateParams {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(DnType::OrganizationName, DnValue::Utf8String(organization.to_string()));
    if !location.location_city.is_empty() {
        dn.push(DnType::LocalityName, DnValue::Utf8String(location.location_city.clone()));
    }
    if !location.location_state.is_empty() {
        dn.push(DnType::StateOrProvinceName, DnValue::Utf8String(location.location_state.clone()));
    }
    if !location.location_country.is_empty() {
        if let Ok(country) = PrintableString::try_from(location.location_country.clone()) {
            dn.push(DnType::CountryName, DnValue::PrintableString(country));
        }
    }
    params.distinguished_name = dn;

    let today = Utc::now().date_naive();
    let expires = today + validity;
    params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
    params.not_after = rcgen::date_time_ymd(expires.year(), expires.month() as u8, expires.day() as u8);
    params
}

fn node_sans(plan: &Plan, node: &Node) -> Result<Vec<SanType>> {
    let mut names = vec![node.host.clone()];
    if plan.roles_of(&node.host).contains(&NodeRole::Master) {
        names.extend(
            [
                plan.master.load_balanced_fqdn.clone(),
                plan.master.load_balanced_short_name.clone(),
                "kubernetes".to_string(),
                "kubernetes.default".to_string(),
                "kubernetes.default.svc".to_string(),
            ]
            .into_iter()
            .filter(|n| !n.is_empty()),
        );
    }

    let mut sans = Vec::new();
    for name in names {
        let dns = Ia5String::try_from(name.clone()).map_err(|_| PkiError::InvalidName { value: name })?;
        let san = SanType::DnsName(dns);
        if !sans.contains(&san) {
            sans.push(san);
        }
    }
    for ip in [node.ip.as_str(), node.internal_ip()] {
        let addr: IpAddr = ip.parse().map_err(|_| PkiError::InvalidName { value: ip.to_string() })?;
        let san = SanType::IpAddress(addr);
        if !sans.contains(&san) {
            sans.push(san);
        }
    }
    Ok(sans)
}

fn sign_and_write<S: SigningKey>(
    params: &CertificateParams,
    issuer: &Issuer<'_, S>,
    subject: &str,
    cert_path: &Path,
    key_path: &Path,
) -> Result<()> {
    let key_pair = KeyPair::generate().map_err(gen_err(subject))?;
    let cert = params.signed_by(&key_pair, issuer).map_err(gen_err(subject))?;
    write_pem(key_path, &key_pair.serialize_pem(), true)?;
    write_pem(cert_path, &cert.pem(), false)
}

fn read_pem(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(io_err(path))
}

fn write_pem(path: &Path, pem: &str, private: bool) -> Result<()> {
    fs::write(path, pem).map_err(io_err(path))?;
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(io_err(path))?;
    }
    #[cfg(not(unix))]
    let _ = private;
    Ok(())
}

fn gen_err(subject: &str) -> impl FnOnce(rcgen::Error) -> PkiError {
    let subject = subject.to_string();
    move |source| PkiError::Generation { subject, source }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> PkiError {
    let path = path.to_path_buf();
    move |source| PkiError::Io { path, source }
}
