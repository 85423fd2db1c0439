use anyhow::Result;
use clap::{crate_description, crate_version, Parser};
use stackable_operator::{
    client,
    k8s_openapi::api::{
        admissionregistration::v1::MutatingWebhookConfiguration, core::v1::Secret,
    },
    kube::Api,
    logging, utils,
};
use webhook_bootstrap::{
    bootstrap,
    config::{BootstrapArgs, BootstrapConfig, CaSource},
    issuer::{EphemeralCa, SecretCa},
    utils::error_full_message,
    BootstrapOutcome,
};

pub const APP_NAME: &str = "webhook-bootstrap";
pub const ENV_VAR_LOGGING: &str = "WEBHOOK_BOOTSTRAP_LOG";

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = BootstrapArgs::parse();
    logging::initialize_logging(ENV_VAR_LOGGING, APP_NAME, args.tracing_target);
    utils::print_startup_string(
        crate_description!(),
        crate_version!(),
        built_info::GIT_VERSION,
        built_info::TARGET,
        built_info::BUILT_TIME_UTC,
        built_info::RUSTC_VERSION,
    );

    let config = args.into_config()?;
    match run(&config).await {
        Ok(outcome) => {
            tracing::info!(
                cert.path = %outcome.published.cert_path.display(),
                registration = ?outcome.registration,
                "Webhook TLS trust is in place"
            );
            Ok(())
        }
        Err(err) => {
            tracing::error!(error = %error_full_message(&*err), "Webhook bootstrap failed");
            Err(err)
        }
    }
}

async fn run(config: &BootstrapConfig) -> Result<BootstrapOutcome> {
    let client = client::create_client(Some(APP_NAME.to_string())).await?;
    let store = Api::<MutatingWebhookConfiguration>::all(client.as_kube_client());
    let outcome = match &config.ca_source {
        CaSource::Ephemeral => bootstrap(config, &EphemeralCa, &store).await?,
        CaSource::Secret { name, namespace } => {
            let secrets = Api::<Secret>::namespaced(client.as_kube_client(), namespace);
            let ca = SecretCa::new(secrets, name.clone(), namespace.clone());
            bootstrap(config, &ca, &store).await?
        }
    };
    Ok(outcome)
}
