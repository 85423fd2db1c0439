//! Issues the webhook's serving certificate and the CA that vouches for it

use std::cmp::min;

use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::{BigNum, MsbOption},
    conf::{Conf, ConfMethod},
    hash::MessageDigest,
    nid::Nid,
    pkey::PKey,
    rsa::Rsa,
    stack::Stack,
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectAlternativeName, SubjectKeyIdentifier,
        },
        store::X509StoreBuilder,
        verify::X509VerifyParam,
        X509Builder, X509Name, X509NameBuilder, X509StoreContext, X509,
    },
};
use snafu::{ResultExt, Snafu};
use stackable_operator::time::Duration;
use time::OffsetDateTime;
use tracing::info;

use crate::{
    identity::ServiceIdentity,
    utils::{FmtByteSlice, Unloggable},
};

pub mod ca;

pub use ca::{CaProvider, CaSecretStore, CertificateAuthority, EphemeralCa, SecretCa};

/// Modulus size for every generated RSA key.
pub const KEY_SIZE_BITS: u32 = 4096;

/// Lifetime of the serving certificate, capped by the lifetime of the signing CA.
pub const LEAF_LIFETIME: Duration = Duration::from_days_unchecked(365);

const SUBJECT_COUNTRY: &str = "CN";
const SUBJECT_PROVINCE: &str = "Beijing";
const SUBJECT_LOCALITY: &str = "Beijing";
const SUBJECT_ORGANIZATION: &str = "admission.io";
const SUBJECT_ORGANIZATIONAL_UNIT: &str = "admission.io";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to provision CA"))]
    ProvisionCa { source: ca::Error },

    #[snafu(display("failed to generate server key"))]
    GenerateKey { source: openssl::error::ErrorStack },

    #[snafu(display("failed to build server certificate"))]
    BuildCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("failed to serialize {tpe:?}"))]
    Serialize {
        source: openssl::error::ErrorStack,
        tpe: PemType,
    },

    #[snafu(display("failed to serialize CA certificate"))]
    SerializeCa { source: ca::Error },

    #[snafu(display("issued certificate does not verify for {hostname:?}"))]
    VerifyIssued {
        source: VerifyError,
        hostname: String,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum PemType {
    ServerCertificate,
    ServerKey,
}

#[derive(Debug, Snafu)]
pub enum VerifyError {
    #[snafu(display("failed to parse {what} PEM"))]
    ParsePem {
        source: openssl::error::ErrorStack,
        what: &'static str,
    },

    #[snafu(display("failed to set up verification"))]
    Setup { source: openssl::error::ErrorStack },

    #[snafu(display("certificate rejected: {reason}"))]
    Rejected { reason: String },
}

/// PEM-encoded output of a successful issuance.
///
/// Only produced once every step succeeded and the leaf verified against the CA, so there is no
/// partially-initialized state to leak into later stages.
#[derive(Debug, Clone)]
pub struct IssuedTrustChain {
    /// `CERTIFICATE` block of the CA, used as the webhook's CA bundle
    pub ca_cert_pem: Vec<u8>,
    /// `CERTIFICATE` block of the serving certificate
    pub server_cert_pem: Vec<u8>,
    /// `RSA PRIVATE KEY` block (PKCS#1) of the serving certificate
    pub server_key_pem: Unloggable<Vec<u8>>,
}

impl IssuedTrustChain {
    /// Checks that the serving certificate chains to the CA and is valid for `hostname`.
    pub fn verify(&self, hostname: &str) -> Result<(), VerifyError> {
        verify_leaf(&self.ca_cert_pem, &self.server_cert_pem, hostname)
    }
}

/// Mints a fresh CA and issues a serving certificate for `identity` signed by it.
pub fn issue_trust_chain(identity: &ServiceIdentity) -> Result<IssuedTrustChain> {
    let ca = CertificateAuthority::new_self_signed().context(ProvisionCaSnafu)?;
    issue_trust_chain_with_ca(&ca, identity)
}

/// Generates a server keypair and signs a serving certificate for `identity` with `ca`.
pub fn issue_trust_chain_with_ca(
    ca: &CertificateAuthority,
    identity: &ServiceIdentity,
) -> Result<IssuedTrustChain> {
    let not_before = OffsetDateTime::now_utc();
    // A certificate must not outlive its issuer
    let not_after = min(not_before + LEAF_LIFETIME, ca.not_after);
    let dns_names = identity.dns_names();

    let conf = Conf::new(ConfMethod::default()).context(BuildCertificateSnafu)?;
    let server_rsa = Rsa::generate(KEY_SIZE_BITS).context(GenerateKeySnafu)?;
    let server_key_pem = server_rsa
        .private_key_to_pem()
        .context(SerializeSnafu {
            tpe: PemType::ServerKey,
        })?;
    let server_key = PKey::from_rsa(server_rsa).context(GenerateKeySnafu)?;
    let server_cert = X509Builder::new()
        .and_then(|mut x509| {
            let subject_name = subject_name(Some(&identity.common_name()))?;
            x509.set_subject_name(&subject_name)?;
            x509.set_issuer_name(ca.ca_cert.subject_name())?;
            x509.set_not_before(Asn1Time::from_unix(not_before.unix_timestamp())?.as_ref())?;
            x509.set_not_after(Asn1Time::from_unix(not_after.unix_timestamp())?.as_ref())?;
            x509.set_pubkey(&server_key)?;
            x509.set_version(
                3 - 1, // zero-indexed
            )?;
            let mut serial = BigNum::new()?;
            serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
            x509.set_serial_number(Asn1Integer::from_bn(&serial)?.as_ref())?;
            let ctx = x509.x509v3_context(Some(&ca.ca_cert), Some(&conf));
            let mut san_ext = SubjectAlternativeName::new();
            for dns in &dns_names {
                san_ext.dns(dns);
            }
            let exts = [
                BasicConstraints::new().critical().build()?,
                KeyUsage::new().critical().digital_signature().build()?,
                ExtendedKeyUsage::new()
                    .client_auth()
                    .server_auth()
                    .build()?,
                SubjectKeyIdentifier::new().build(&ctx)?,
                AuthorityKeyIdentifier::new()
                    .issuer(true)
                    .keyid(true)
                    .build(&ctx)?,
                san_ext.build(&ctx)?,
            ];
            for ext in exts {
                x509.append_extension(ext)?;
            }
            x509.sign(&ca.ca_key, MessageDigest::sha256())?;
            Ok(x509)
        })
        .context(BuildCertificateSnafu)?
        .build();

    let chain = IssuedTrustChain {
        ca_cert_pem: ca.cert_pem().context(SerializeCaSnafu)?,
        server_cert_pem: server_cert.to_pem().context(SerializeSnafu {
            tpe: PemType::ServerCertificate,
        })?,
        server_key_pem: Unloggable(server_key_pem),
    };
    for hostname in &dns_names {
        chain
            .verify(hostname)
            .with_context(|_| VerifyIssuedSnafu { hostname })?;
    }

    let ca_fingerprint = ca
        .ca_cert
        .digest(MessageDigest::sha256())
        .context(SerializeCaSnafu)?;
    info!(
        service = %identity,
        ?dns_names,
        %not_after,
        ca.sha256 = %format_args!("{:x}", FmtByteSlice(&ca_fingerprint)),
        "Issued webhook serving certificate"
    );
    Ok(chain)
}

/// Verifies `leaf_pem` against a trust store holding only `ca_pem`, including hostname checks.
pub fn verify_leaf(ca_pem: &[u8], leaf_pem: &[u8], hostname: &str) -> Result<(), VerifyError> {
    let ca_cert = X509::from_pem(ca_pem).context(ParsePemSnafu { what: "CA" })?;
    let leaf = X509::from_pem(leaf_pem).context(ParsePemSnafu {
        what: "leaf certificate",
    })?;
    let store = X509StoreBuilder::new()
        .and_then(|mut store| {
            let mut param = X509VerifyParam::new()?;
            param.set_host(hostname)?;
            store.set_param(&param)?;
            store.add_cert(ca_cert)?;
            Ok(store)
        })
        .context(SetupSnafu)?
        .build();
    let chain = Stack::new().context(SetupSnafu)?;
    let (valid, result) = X509StoreContext::new()
        .and_then(|mut ctx| {
            ctx.init(&store, &leaf, &chain, |ctx| {
                let valid = ctx.verify_cert()?;
                Ok((valid, ctx.error()))
            })
        })
        .context(SetupSnafu)?;
    if valid {
        Ok(())
    } else {
        RejectedSnafu {
            reason: result.error_string(),
        }
        .fail()
    }
}

/// The fixed distinguished name shared by the CA and the serving certificate.
fn subject_name(common_name: Option<&str>) -> Result<X509Name, openssl::error::ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COUNTRYNAME, SUBJECT_COUNTRY)?;
    name.append_entry_by_nid(Nid::STATEORPROVINCENAME, SUBJECT_PROVINCE)?;
    name.append_entry_by_nid(Nid::LOCALITYNAME, SUBJECT_LOCALITY)?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, SUBJECT_ORGANIZATION)?;
    name.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, SUBJECT_ORGANIZATIONAL_UNIT)?;
    if let Some(common_name) = common_name {
        name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    }
    Ok(name.build())
}
