//! Root certificate authority for intercepted hosts.
//!
//! The root key pair lives in the object store as `<prefix>.crt` and
//! `<prefix>.key`. It is generated on first use and read back afterwards.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, RsaKeySize, SanType, SignatureAlgorithm,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use time::OffsetDateTime;

use sluice_storage::{Store, StoreError};

use crate::config::RootCaConfig;
use crate::error::CaError;

/// Holds the root key and signs leaf certificates with it.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    root_der: CertificateDer<'static>,
    root_pem: String,
    root_not_after: OffsetDateTime,
    key_bits: u32,
    issued: AtomicU64,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("key_bits", &self.key_bits)
            .field("issued", &self.issued())
            .finish()
    }
}

impl CertificateAuthority {
    /// Loads the root from `store`, generating and storing it when absent.
    ///
    /// Finding only one of the two files is an error rather than a reason to
    /// overwrite the other.
    pub fn load_or_create(store: &dyn Store, config: &RootCaConfig) -> Result<Self, CaError> {
        let cert_name = format!("{}.crt", config.file_prefix);
        let key_name = format!("{}.key", config.file_prefix);

        let cert = optional(store.get(&cert_name))?;
        let key = optional(store.get(&key_name))?;

        let (cert_pem, key_pem) = match (cert, key) {
            (Some(cert), Some(key)) => (into_pem(cert, &cert_name)?, into_pem(key, &key_name)?),
            (None, None) => {
                let (cert_pem, key_pem) = generate_root(&config.name, config.key_bits)?;
                store.put(&key_name, key_pem.as_bytes())?;
                store.put(&cert_name, cert_pem.as_bytes())?;
                tracing::info!("Generated root CA {:?} in {}", config.name, store.url());
                (cert_pem, key_pem)
            }
            (Some(_), None) => return Err(CaError::Incomplete(format!("{key_name} is missing"))),
            (None, Some(_)) => return Err(CaError::Incomplete(format!("{cert_name} is missing"))),
        };

        Self::from_pem(&cert_pem, &key_pem, config.key_bits)
    }

    /// Builds an authority from PEM encoded root material.
    pub fn from_pem(cert_pem: &str, key_pem: &str, key_bits: u32) -> Result<Self, CaError> {
        algorithm_for(key_bits)?;

        let key_pair = KeyPair::from_pem(key_pem).map_err(|e| CaError::Parse(e.to_string()))?;
        let root_not_after = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| CaError::Parse(e.to_string()))?
            .not_after;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CaError::Parse(e.to_string()))?;

        let root_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CaError::Parse("no certificate in root PEM".into()))?
            .map_err(|e| CaError::Parse(e.to_string()))?;

        Ok(Self {
            issuer,
            root_der,
            root_pem: cert_pem.to_string(),
            root_not_after,
            key_bits,
            issued: AtomicU64::new(0),
        })
    }

    /// Validity a leaf issued now gets: `validity`, cut off where the root
    /// expires. Fails once the root itself has expired.
    pub fn leaf_validity(&self, validity: Duration) -> Result<Duration, CaError> {
        let remaining = Duration::try_from(self.root_not_after - OffsetDateTime::now_utc())
            .map_err(|_| CaError::Generation("root certificate has expired".into()))?;
        Ok(validity.min(remaining))
    }

    /// Signs a leaf for `common_name` valid from now for `validity`, never
    /// past the root's own expiry.
    ///
    /// IP literals get an IP address SAN, everything else a DNS SAN.
    pub fn issue(
        &self,
        common_name: &str,
        validity: Duration,
        key_bits: u32,
    ) -> Result<Arc<CertifiedKey>, CaError> {
        let leaf_key = generate_key(key_bits)?;
        let validity = time::Duration::try_from(self.leaf_validity(validity)?)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![match common_name.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(common_name.to_string().try_into()?),
        }];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now
            .checked_add(validity)
            .ok_or_else(|| CaError::Generation("leaf validity out of range".into()))?;

        let leaf = params.signed_by(&leaf_key, &self.issuer)?;
        self.issued.fetch_add(1, Ordering::Relaxed);

        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key_der)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        Ok(Arc::new(CertifiedKey::new(
            vec![leaf.der().clone(), self.root_der.clone()],
            signing_key,
        )))
    }

    /// Number of leaves signed so far.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn key_bits(&self) -> u32 {
        self.key_bits
    }

    pub fn root_not_after(&self) -> OffsetDateTime {
        self.root_not_after
    }

    pub fn root_der(&self) -> &CertificateDer<'static> {
        &self.root_der
    }

    /// Root certificate in PEM form, for installing into trust stores.
    pub fn root_pem(&self) -> &str {
        &self.root_pem
    }
}

fn optional(result: sluice_storage::Result<Vec<u8>>) -> Result<Option<Vec<u8>>, CaError> {
    match result {
        Ok(data) => Ok(Some(data)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn into_pem(data: Vec<u8>, name: &str) -> Result<String, CaError> {
    String::from_utf8(data).map_err(|_| CaError::Parse(format!("{name} is not PEM text")))
}

/// Maps a key size onto a signature algorithm. 256 and 384 select ECDSA,
/// the usual RSA moduli select RSA.
fn algorithm_for(key_bits: u32) -> Result<&'static SignatureAlgorithm, CaError> {
    match key_bits {
        256 => Ok(&rcgen::PKCS_ECDSA_P256_SHA256),
        384 => Ok(&rcgen::PKCS_ECDSA_P384_SHA384),
        2048 | 3072 | 4096 => Ok(&rcgen::PKCS_RSA_SHA256),
        other => Err(CaError::InvalidKeySize(other)),
    }
}

fn generate_key(key_bits: u32) -> Result<KeyPair, CaError> {
    let alg = algorithm_for(key_bits)?;
    let key = match key_bits {
        2048 => KeyPair::generate_rsa_for(alg, RsaKeySize::_2048)?,
        3072 => KeyPair::generate_rsa_for(alg, RsaKeySize::_3072)?,
        4096 => KeyPair::generate_rsa_for(alg, RsaKeySize::_4096)?,
        _ => KeyPair::generate_for(alg)?,
    };
    Ok(key)
}

fn generate_root(name: &str, key_bits: u32) -> Result<(String, String), CaError> {
    let key_pair = generate_key(key_bits)?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, name);
    dn.push(DnType::OrganizationName, name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(1);
    params.not_after = now + time::Duration::days(10 * 365);

    let cert = params.self_signed(&key_pair)?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}
