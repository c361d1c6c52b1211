//! Per-VM trust material.
//!
//! Every VM gets its own CA and a leaf certificate signed by it. The guest
//! agent serves the leaf and requires clients to present it; the
//! orchestrator trusts only that VM's CA.

use chrono::Datelike;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, SanType,
};
use tracing::debug;

use crate::error::{DriverError, DriverResult};

/// DNS name every agent certificate carries; clients verify against it
/// instead of the VM address, which changes across hibernate/resume.
pub const AGENT_SERVER_NAME: &str = "warmpool-agent";

/// PEM-encoded CA and leaf material for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsBundle {
    pub ca_cert: String,
    pub ca_key: String,
    pub tls_cert: String,
    pub tls_key: String,
}

fn cert_err(e: rcgen::Error) -> DriverError {
    DriverError::Certificate(e.to_string())
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "warmpool");
    dn.push(DnType::CommonName, common_name);
    dn
}

/// Mint a CA and a leaf certificate for the VM `name`.
///
/// `addresses` are added as extra SANs next to [`AGENT_SERVER_NAME`].
pub fn generate_bundle(name: &str, addresses: &[String]) -> DriverResult<TlsBundle> {
    let year = chrono::Utc::now().year();

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name = distinguished_name(&format!("{name} CA"));
    ca_params.not_after = rcgen::date_time_ymd(year + 10, 1, 1);
    let ca_key = KeyPair::generate().map_err(cert_err)?;
    let ca_cert = ca_params.self_signed(&ca_key).map_err(cert_err)?;

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(name);
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.subject_alt_names.push(SanType::DnsName(
        AGENT_SERVER_NAME.try_into().map_err(cert_err)?,
    ));
    for addr in addresses {
        if let Ok(ip) = addr.parse::<std::net::IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(SanType::DnsName(addr.clone().try_into().map_err(cert_err)?));
        }
    }
    params.not_after = rcgen::date_time_ymd(year + 1, 12, 31);
    let leaf_key = KeyPair::generate().map_err(cert_err)?;
    let leaf_cert = params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .map_err(cert_err)?;

    debug!(%name, sans = addresses.len() + 1, "generated instance certificates");

    Ok(TlsBundle {
        ca_cert: ca_cert.pem(),
        ca_key: ca_key.serialize_pem(),
        tls_cert: leaf_cert.pem(),
        tls_key: leaf_key.serialize_pem(),
    })
}
