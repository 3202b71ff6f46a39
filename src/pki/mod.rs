// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Key, CSR and certificate handling for cluster client identities.
//!
//! A managed cluster authenticates to the hub with a client certificate
//! whose subject is `O=hcm:clusters, CN=hcm:clusters:<namespace>:<name>`.
//! Keys are generated locally; only the CSR leaves the cluster.

pub mod digest;
pub mod jitter;

use crate::constants::subject::{ORGANIZATION, USER_PREFIX};
use crate::error::{McmError, Result};
use chrono::{DateTime, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose,
};
use x509_parser::prelude::*;

/// Key usages requested for cluster client certificates, in request order
pub const CLIENT_USAGES: [&str; 3] = ["digital signature", "key encipherment", "client auth"];

/// Certificate subject of a cluster identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub common_name: String,
    pub organizations: Vec<String>,
}

impl Subject {
    pub fn for_cluster(namespace: &str, name: &str) -> Self {
        Self {
            common_name: format!("{USER_PREFIX}:{namespace}:{name}"),
            organizations: vec![ORGANIZATION.to_string()],
        }
    }
}

/// A locally generated private key, kept as PEM since `KeyPair` is not `Clone`
#[derive(Clone)]
pub struct ClientKey {
    pem: String,
}

impl std::fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClientKey(..)")
    }
}

impl ClientKey {
    /// Generate a fresh ECDSA P-256 key
    pub fn generate() -> Result<Self> {
        let key_pair = KeyPair::generate()
            .map_err(|e| McmError::PkiError(format!("failed to generate key: {e}")))?;
        Ok(Self {
            pem: key_pair.serialize_pem(),
        })
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let pem = std::str::from_utf8(pem)
            .map_err(|e| McmError::PkiError(format!("key is not UTF-8: {e}")))?;
        KeyPair::from_pem(pem).map_err(|e| McmError::PkiError(format!("failed to parse key: {e}")))?;
        Ok(Self { pem: pem.to_string() })
    }

    fn key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.pem).map_err(|e| McmError::PkiError(format!("failed to load key: {e}")))
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// DER encoding of the private key, as fed into the join request digest
    pub fn der(&self) -> Result<Vec<u8>> {
        Ok(self.key_pair()?.serialize_der())
    }

    /// Build a PEM encoded CSR for `subject` with the client usages.
    pub fn csr_pem(&self, subject: &Subject) -> Result<String> {
        let key_pair = self.key_pair()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(subject.common_name.clone()),
        );
        for org in &subject.organizations {
            dn.push(DnType::OrganizationName, DnValue::Utf8String(org.clone()));
        }
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| McmError::PkiError(format!("failed to create CSR: {e}")))?;
        csr.pem()
            .map_err(|e| McmError::PkiError(format!("failed to serialize CSR: {e}")))
    }
}

/// Validity window and subject of a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub common_name: String,
}

impl CertInfo {
    /// Parse the first certificate of a PEM bundle
    pub fn from_pem(pem_data: &[u8]) -> Result<Self> {
        let der = parse_pem(pem_data, "CERTIFICATE")?;
        Self::from_der(&der)
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| McmError::PkiError(format!("failed to parse certificate: {e}")))?;

        let timestamp = |ts: i64| {
            DateTime::from_timestamp(ts, 0)
                .ok_or_else(|| McmError::PkiError(format!("certificate time {ts} out of range")))
        };

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        Ok(Self {
            not_before: timestamp(cert.validity().not_before.timestamp())?,
            not_after: timestamp(cert.validity().not_after.timestamp())?,
            common_name,
        })
    }

    pub fn lifetime(&self) -> chrono::Duration {
        self.not_after - self.not_before
    }
}

/// Self-signed serving certificate and key PEM for `hosts`, used when no
/// certificate files are mounted.
pub fn self_signed_serving(hosts: &[String]) -> Result<(String, String)> {
    let key_pair = KeyPair::generate()
        .map_err(|e| McmError::PkiError(format!("failed to generate key: {e}")))?;
    let mut params = CertificateParams::new(hosts.to_vec())
        .map_err(|e| McmError::PkiError(format!("invalid serving hosts: {e}")))?;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| McmError::PkiError(format!("failed to self-sign: {e}")))?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// Return the DER contents of the first PEM block with the given tag.
pub fn parse_pem(pem_data: &[u8], tag: &str) -> Result<Vec<u8>> {
    let blocks = ::pem::parse_many(pem_data)
        .map_err(|e| McmError::Validation(format!("failed to parse PEM: {e}")))?;
    blocks
        .into_iter()
        .find(|b| b.tag() == tag)
        .map(|b| b.into_contents())
        .ok_or_else(|| McmError::Validation(format!("no {tag} block found")))
}

/// Subject of a PEM encoded CSR, used by the hub to check who is asking.
pub fn csr_subject(csr_pem: &[u8]) -> Result<Subject> {
    let der = parse_pem(csr_pem, "CERTIFICATE REQUEST")?;
    let (_, csr) = X509CertificationRequest::from_der(&der)
        .map_err(|e| McmError::Validation(format!("bad CSR block: {e}")))?;
    let subject = &csr.certification_request_info.subject;
    let common_name = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("")
        .to_string();
    let organizations = subject
        .iter_organization()
        .filter_map(|o| o.as_str().ok())
        .map(String::from)
        .collect();
    Ok(Subject {
        common_name,
        organizations,
    })
}

#[cfg(test)]
pub(crate) mod test_ca {
    //! A throwaway CA for signing test CSRs.

    use rcgen::{BasicConstraints, CertificateSigningRequestParams, IsCa, Issuer};

    use super::*;

    pub struct TestCa {
        key: KeyPair,
        cert_pem: String,
    }

    impl TestCa {
        pub fn new() -> Self {
            let key = KeyPair::generate().unwrap();
            let mut params = CertificateParams::default();
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params
                .distinguished_name
                .push(DnType::CommonName, DnValue::Utf8String("test-ca".into()));
            let cert_pem = params.self_signed(&key).unwrap().pem();
            Self { key, cert_pem }
        }

        pub fn cert_pem(&self) -> &str {
            &self.cert_pem
        }

        /// Sign a CSR valid between the given calendar dates
        pub fn sign(&self, csr_pem: &str, from: (i32, u8, u8), to: (i32, u8, u8)) -> String {
            let mut csr = CertificateSigningRequestParams::from_pem(csr_pem).unwrap();
            csr.params.not_before = rcgen::date_time_ymd(from.0, from.1, from.2);
            csr.params.not_after = rcgen::date_time_ymd(to.0, to.1, to.2);
            let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &self.key).unwrap();
            csr.signed_by(&issuer).unwrap().pem()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_ca::TestCa;
    use super::*;

    #[test]
    fn test_subject_for_cluster() {
        let subject = Subject::for_cluster("c1", "c1");
        assert_eq!(subject.common_name, "hcm:clusters:c1:c1");
        assert_eq!(subject.organizations, vec!["hcm:clusters"]);
    }

    #[test]
    fn test_csr_carries_subject() {
        let key = ClientKey::generate().unwrap();
        let csr = key.csr_pem(&Subject::for_cluster("ns1", "c1")).unwrap();
        assert!(csr.contains("BEGIN CERTIFICATE REQUEST"));

        let subject = csr_subject(csr.as_bytes()).unwrap();
        assert_eq!(subject, Subject::for_cluster("ns1", "c1"));
    }

    #[test]
    fn test_cert_info_from_signed_cert() {
        let ca = TestCa::new();
        let key = ClientKey::generate().unwrap();
        let csr = key.csr_pem(&Subject::for_cluster("ns1", "c1")).unwrap();
        let cert = ca.sign(&csr, (2030, 1, 1), (2030, 1, 11));

        let info = CertInfo::from_pem(cert.as_bytes()).unwrap();
        assert_eq!(info.common_name, "hcm:clusters:ns1:c1");
        assert_eq!(info.lifetime(), chrono::Duration::days(10));
    }

    #[test]
    fn test_parse_pem_rejects_wrong_block() {
        let key = ClientKey::generate().unwrap();
        assert!(parse_pem(key.pem().as_bytes(), "CERTIFICATE").is_err());
        assert!(ClientKey::from_pem(key.pem().as_bytes()).is_ok());
    }

    #[test]
    fn test_self_signed_serving() {
        let (cert, key) = self_signed_serving(&["localhost".to_string()]).unwrap();
        assert!(CertInfo::from_pem(cert.as_bytes()).is_ok());
        assert!(ClientKey::from_pem(key.as_bytes()).is_ok());
    }
}
