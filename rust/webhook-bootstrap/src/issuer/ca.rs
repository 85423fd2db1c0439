use std::collections::BTreeMap;

use async_trait::async_trait;
use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::{BigNum, MsbOption},
    conf::{Conf, ConfMethod},
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectKeyIdentifier,
        },
        X509Builder, X509,
    },
};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::ObjectMeta, ByteString,
    },
    kube::{
        self,
        api::{Api, PostParams},
        runtime::reflector::ObjectRef,
    },
    time::Duration,
};
use time::OffsetDateTime;
use tracing::info;

use crate::utils::{asn1time_to_offsetdatetime, Asn1TimeParseError};

use super::{subject_name, KEY_SIZE_BITS};

pub const SECRET_KEY_CERT: &str = "ca.crt";
pub const SECRET_KEY_KEY: &str = "ca.key";

/// Lifetime of a freshly minted CA.
pub const CA_LIFETIME: Duration = Duration::from_days_unchecked(10 * 365);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate CA key"))]
    GenerateKey { source: openssl::error::ErrorStack },

    #[snafu(display("failed to build CA certificate"))]
    BuildCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("failed to serialize CA {tpe}"))]
    SerializeCertificate {
        source: openssl::error::ErrorStack,
        tpe: &'static str,
    },

    #[snafu(display("failed to load CA {secret}"))]
    FindCa {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("CA {secret} is missing required key {key:?}"))]
    MissingCaData {
        key: &'static str,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to load CA material from key {key:?} of {secret}"))]
    LoadCertificate {
        source: openssl::error::ErrorStack,
        key: &'static str,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to parse CA lifetime from {secret}"))]
    ParseLifetime {
        source: Asn1TimeParseError,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("CA {secret} expired at {expired_at}"))]
    CaExpired {
        secret: ObjectRef<Secret>,
        expired_at: OffsetDateTime,
    },

    #[snafu(display("failed to save CA certificate to {secret}"))]
    SaveCaCertificate {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// A self-signed CA used to sign the webhook's serving certificate.
pub struct CertificateAuthority {
    pub ca_cert: X509,
    pub ca_key: PKey<Private>,
    pub not_after: OffsetDateTime,
}

impl CertificateAuthority {
    pub fn new_self_signed() -> Result<Self> {
        let subject_name = subject_name(None).context(BuildCertificateSnafu)?;
        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + CA_LIFETIME;
        let conf = Conf::new(ConfMethod::default()).context(BuildCertificateSnafu)?;
        let ca_key = Rsa::generate(KEY_SIZE_BITS)
            .and_then(PKey::try_from)
            .context(GenerateKeySnafu)?;
        let ca_cert = X509Builder::new()
            .and_then(|mut x509| {
                x509.set_subject_name(&subject_name)?;
                x509.set_issuer_name(&subject_name)?;
                x509.set_not_before(Asn1Time::from_unix(not_before.unix_timestamp())?.as_ref())?;
                x509.set_not_after(Asn1Time::from_unix(not_after.unix_timestamp())?.as_ref())?;
                x509.set_pubkey(&ca_key)?;
                let mut serial = BigNum::new()?;
                serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
                x509.set_serial_number(Asn1Integer::from_bn(&serial)?.as_ref())?;
                x509.set_version(
                    3 - 1, // zero-indexed
                )?;
                let ctx = x509.x509v3_context(None, Some(&conf));
                let exts = [
                    BasicConstraints::new().critical().ca().build()?,
                    SubjectKeyIdentifier::new().build(&ctx)?,
                    AuthorityKeyIdentifier::new()
                        .issuer(false)
                        .keyid(false)
                        .build(&ctx)?,
                    KeyUsage::new()
                        .critical()
                        .digital_signature()
                        .key_cert_sign()
                        .build()?,
                    ExtendedKeyUsage::new()
                        .client_auth()
                        .server_auth()
                        .build()?,
                ];
                for ext in exts {
                    x509.append_extension(ext)?;
                }
                x509.sign(&ca_key, MessageDigest::sha256())?;
                Ok(x509)
            })
            .context(BuildCertificateSnafu)?
            .build();
        Ok(Self {
            ca_cert,
            ca_key,
            not_after,
        })
    }

    fn from_secret(
        secret_data: &BTreeMap<String, ByteString>,
        secret_ref: impl Fn() -> ObjectRef<Secret>,
    ) -> Result<Self> {
        let read_key = |key: &'static str| {
            secret_data
                .get(key)
                .map(|value| value.0.as_slice())
                .with_context(|| MissingCaDataSnafu {
                    key,
                    secret: secret_ref(),
                })
        };
        let ca_cert = X509::from_pem(read_key(SECRET_KEY_CERT)?).with_context(|_| {
            LoadCertificateSnafu {
                key: SECRET_KEY_CERT,
                secret: secret_ref(),
            }
        })?;
        let ca_key = PKey::private_key_from_pem(read_key(SECRET_KEY_KEY)?).with_context(|_| {
            LoadCertificateSnafu {
                key: SECRET_KEY_KEY,
                secret: secret_ref(),
            }
        })?;
        let not_after = asn1time_to_offsetdatetime(ca_cert.not_after())
            .with_context(|_| ParseLifetimeSnafu {
                secret: secret_ref(),
            })?;
        if not_after <= OffsetDateTime::now_utc() {
            return CaExpiredSnafu {
                secret: secret_ref(),
                expired_at: not_after,
            }
            .fail();
        }
        Ok(Self {
            ca_cert,
            ca_key,
            not_after,
        })
    }

    /// The PEM-encoded CA certificate, as distributed to verifiers in the CA bundle.
    pub fn cert_pem(&self) -> Result<Vec<u8>> {
        self.ca_cert.to_pem().context(SerializeCertificateSnafu {
            tpe: "certificate",
        })
    }

    fn to_secret_data(&self) -> Result<BTreeMap<String, ByteString>> {
        let key = self
            .ca_key
            .private_key_to_pem_pkcs8()
            .context(SerializeCertificateSnafu { tpe: "key" })?;
        Ok([
            (SECRET_KEY_CERT.to_string(), ByteString(self.cert_pem()?)),
            (SECRET_KEY_KEY.to_string(), ByteString(key)),
        ]
        .into())
    }
}

/// Source of the CA that signs the serving certificate.
#[async_trait]
pub trait CaProvider: Send + Sync {
    async fn certificate_authority(&self) -> Result<CertificateAuthority>;
}

/// Mints a brand-new CA on every call.
///
/// Every run invalidates trust in previously issued certificates.
pub struct EphemeralCa;

#[async_trait]
impl CaProvider for EphemeralCa {
    async fn certificate_authority(&self) -> Result<CertificateAuthority> {
        info!("Provisioning an ephemeral CA certificate");
        CertificateAuthority::new_self_signed()
    }
}

/// Cluster-side storage of the `Secret` holding a persisted CA.
///
/// Implemented for [`Api`], and by in-memory fakes in tests.
#[async_trait]
pub trait CaSecretStore: Send + Sync {
    async fn get_opt(&self, name: &str) -> kube::Result<Option<Secret>>;

    /// Creates the `Secret`; the server rejects the write if it already exists.
    async fn create(&self, secret: &Secret) -> kube::Result<Secret>;
}

#[async_trait]
impl CaSecretStore for Api<Secret> {
    async fn get_opt(&self, name: &str) -> kube::Result<Option<Secret>> {
        Api::get_opt(self, name).await
    }

    async fn create(&self, secret: &Secret) -> kube::Result<Secret> {
        Api::create(self, &PostParams::default(), secret).await
    }
}

/// Keeps the CA in a Kubernetes `Secret`, so that it survives bootstrap runs.
///
/// If the `Secret` does not exist yet, a new CA is generated and stored. An existing `Secret` is
/// never overwritten, even if it is incomplete.
pub struct SecretCa<S = Api<Secret>> {
    secrets: S,
    name: String,
    namespace: String,
}

impl<S: CaSecretStore> SecretCa<S> {
    /// `secrets` must be scoped to `namespace`.
    pub fn new(secrets: S, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            secrets,
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    fn secret_ref(&self) -> ObjectRef<Secret> {
        ObjectRef::new(&self.name).within(&self.namespace)
    }
}

#[async_trait]
impl<S: CaSecretStore> CaProvider for SecretCa<S> {
    async fn certificate_authority(&self) -> Result<CertificateAuthority> {
        let secret_ref = || self.secret_ref();
        let existing = self
            .secrets
            .get_opt(&self.name)
            .await
            .with_context(|_| FindCaSnafu {
                secret: secret_ref(),
            })?;
        if let Some(existing) = existing {
            let empty = BTreeMap::new();
            let ca_data = existing.data.as_ref().unwrap_or(&empty);
            let ca = CertificateAuthority::from_secret(ca_data, secret_ref)?;
            info!(
                secret = %secret_ref(),
                ca_expires_at = %ca.not_after,
                "Loaded existing CA certificate"
            );
            return Ok(ca);
        }

        info!(
            secret = %secret_ref(),
            "Provisioning a new CA certificate, because it could not be found"
        );
        let ca = CertificateAuthority::new_self_signed()?;
        let ca_secret = Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..ObjectMeta::default()
            },
            data: Some(ca.to_secret_data()?),
            ..Secret::default()
        };
        // Create-only: a CA that another run already distributed must never be replaced, so a
        // racing create fails with a conflict
        self.secrets
            .create(&ca_secret)
            .await
            .with_context(|_| SaveCaCertificateSnafu {
                secret: secret_ref(),
            })?;
        Ok(ca)
    }
}
