//! The one-shot bootstrap sequence: obtain CA, issue, publish, register
//!
//! Every stage must succeed before the next one starts. In particular the webhook is never
//! registered with a CA bundle that does not match the certificate on disk.

use std::{path::PathBuf, time::Duration};

use snafu::{ResultExt, Snafu};
use tokio::time::{error::Elapsed, timeout};
use tracing::info;

use crate::{
    config::BootstrapConfig,
    issuer::{self, ca, issue_trust_chain_with_ca, CaProvider},
    publish::{self, publish_identity, PublishedIdentity},
    registrar::{self, reconcile_mutating_webhook, ReconcileOutcome, WebhookConfigurationStore},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("timed out after {timeout:?} while {stage}"))]
    Timeout {
        source: Elapsed,
        stage: &'static str,
        timeout: Duration,
    },

    #[snafu(display("failed to obtain signing CA"))]
    ObtainCa { source: ca::Error },

    #[snafu(display("failed to issue serving certificate"))]
    Issue { source: issuer::Error },

    #[snafu(display("failed to publish serving certificate to {}", certs_dir.display()))]
    Publish {
        source: publish::Error,
        certs_dir: PathBuf,
    },

    #[snafu(display("failed to register webhook"))]
    Register { source: registrar::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub struct BootstrapOutcome {
    pub published: PublishedIdentity,
    /// The CA bundle that was (or would have been) registered
    pub ca_bundle: Vec<u8>,
    pub registration: ReconcileOutcome,
}

pub async fn bootstrap(
    config: &BootstrapConfig,
    ca_provider: &impl CaProvider,
    store: &impl WebhookConfigurationStore,
) -> Result<BootstrapOutcome> {
    let cluster_timeout = config.cluster_timeout;

    let ca = timeout(cluster_timeout, ca_provider.certificate_authority())
        .await
        .context(TimeoutSnafu {
            stage: "obtaining the signing CA",
            timeout: cluster_timeout,
        })?
        .context(ObtainCaSnafu)?;

    let chain = issue_trust_chain_with_ca(&ca, &config.identity).context(IssueSnafu)?;

    let published = publish_identity(
        &config.certs_dir,
        &chain.server_cert_pem,
        &chain.server_key_pem,
    )
    .await
    .with_context(|_| PublishSnafu {
        certs_dir: &config.certs_dir,
    })?;

    let registration = timeout(
        cluster_timeout,
        reconcile_mutating_webhook(store, &config.registration, &chain.ca_cert_pem),
    )
    .await
    .context(TimeoutSnafu {
        stage: "registering the webhook",
        timeout: cluster_timeout,
    })?
    .context(RegisterSnafu)?;

    info!(
        service = %config.identity,
        ?registration,
        "Webhook bootstrap completed"
    );
    Ok(BootstrapOutcome {
        published,
        ca_bundle: chain.ca_cert_pem,
        registration,
    })
}
