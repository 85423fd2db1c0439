use std::{path::PathBuf, time::Duration};

use snafu::{ensure, Snafu};
use stackable_operator::logging::TracingTarget;

use crate::{
    identity::{ServiceIdentity, DEFAULT_CLUSTER_DOMAIN},
    publish::DEFAULT_CERTS_DIR,
    registrar::{Registration, WebhookRegistration, DEFAULT_MUTATE_PATH, DEFAULT_WEBHOOK_NAME},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{field} must not be empty"))]
    EmptyField { field: &'static str },

    #[snafu(display(
        "CA secret requires both --ca-secret-name and --ca-secret-namespace, only {given} was set"
    ))]
    IncompleteCaSecret { given: &'static str },

    #[snafu(display("cluster timeout must be at least one second"))]
    ZeroTimeout,
}

#[derive(clap::Parser)]
#[clap(author, version, about)]
pub struct BootstrapArgs {
    /// Directory the serving certificate (tls.crt) and key (tls.key) are written to
    #[arg(long, env, default_value = DEFAULT_CERTS_DIR)]
    pub certs_dir: PathBuf,

    /// Name of the Service in front of the webhook server
    #[arg(long, env)]
    pub webhook_service: String,

    /// Namespace of the Service in front of the webhook server
    #[arg(long, env)]
    pub webhook_namespace: String,

    /// DNS suffix of the cluster, used for the fully qualified service name
    #[arg(long, env, default_value = DEFAULT_CLUSTER_DOMAIN)]
    pub cluster_domain: String,

    /// Name of the MutatingWebhookConfiguration to maintain, registration is skipped if unset
    #[arg(long, env)]
    pub mutate_config: Option<String>,

    /// Path the API server sends admission reviews to
    #[arg(long, env, default_value = DEFAULT_MUTATE_PATH)]
    pub mutate_path: String,

    /// Name of the webhook entry inside the MutatingWebhookConfiguration
    #[arg(long, env, default_value = DEFAULT_WEBHOOK_NAME)]
    pub webhook_name: String,

    /// Secret to keep the CA in, a new CA is minted on every run if unset
    #[arg(long, env)]
    pub ca_secret_name: Option<String>,

    /// Namespace of the CA Secret, required together with --ca-secret-name
    #[arg(long, env)]
    pub ca_secret_namespace: Option<String>,

    /// Upper bound for each round of Kubernetes API calls
    #[arg(long, env, default_value_t = 30)]
    pub cluster_timeout_secs: u64,

    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: TracingTarget,
}

/// Where the signing CA comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaSource {
    Ephemeral,
    Secret { name: String, namespace: String },
}

/// Validated inputs for a bootstrap run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapConfig {
    pub identity: ServiceIdentity,
    pub certs_dir: PathBuf,
    pub ca_source: CaSource,
    pub registration: Registration,
    pub cluster_timeout: Duration,
}

impl BootstrapArgs {
    pub fn into_config(self) -> Result<BootstrapConfig, Error> {
        ensure!(
            !self.webhook_service.is_empty(),
            EmptyFieldSnafu {
                field: "webhook service"
            }
        );
        ensure!(
            !self.webhook_namespace.is_empty(),
            EmptyFieldSnafu {
                field: "webhook namespace"
            }
        );
        ensure!(self.cluster_timeout_secs > 0, ZeroTimeoutSnafu);

        let ca_source = match (
            non_empty(self.ca_secret_name),
            non_empty(self.ca_secret_namespace),
        ) {
            (None, None) => CaSource::Ephemeral,
            (Some(name), Some(namespace)) => CaSource::Secret { name, namespace },
            (Some(_), None) => {
                return IncompleteCaSecretSnafu {
                    given: "--ca-secret-name",
                }
                .fail()
            }
            (None, Some(_)) => {
                return IncompleteCaSecretSnafu {
                    given: "--ca-secret-namespace",
                }
                .fail()
            }
        };

        let registration = match non_empty(self.mutate_config) {
            None => Registration::Disabled,
            Some(configuration_name) => Registration::Enabled(WebhookRegistration {
                configuration_name,
                webhook_name: self.webhook_name,
                service_name: self.webhook_service.clone(),
                service_namespace: self.webhook_namespace.clone(),
                path: self.mutate_path,
            }),
        };

        Ok(BootstrapConfig {
            identity: ServiceIdentity::new(self.webhook_service, self.webhook_namespace)
                .with_cluster_domain(self.cluster_domain),
            certs_dir: self.certs_dir,
            ca_source,
            registration,
            cluster_timeout: Duration::from_secs(self.cluster_timeout_secs),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}
