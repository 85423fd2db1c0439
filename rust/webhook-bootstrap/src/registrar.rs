//! Registers the webhook with the API server
//!
//! The desired [`MutatingWebhookConfiguration`] is derived entirely from the
//! [`WebhookRegistration`] and the current CA bundle, and is then written over whatever the
//! cluster currently holds.

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::admissionregistration::v1::{
            MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
            WebhookClientConfig,
        },
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
        ByteString,
    },
    kube::{
        self,
        api::{Api, PostParams},
        error::ErrorResponse,
    },
};
use tracing::{debug, info};

pub const DEFAULT_WEBHOOK_NAME: &str = "kube-sidecar-injector.k8s.io";
pub const DEFAULT_MUTATE_PATH: &str = "/mutate";

const OPERATIONS: &[&str] = &["CREATE", "UPDATE"];
const ADMISSION_REVIEW_VERSION: &str = "v1";
const SIDE_EFFECTS_NONE: &str = "None";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get MutatingWebhookConfiguration {name:?}"))]
    GetWebhookConfiguration { source: kube::Error, name: String },

    #[snafu(display("failed to create MutatingWebhookConfiguration {name:?}"))]
    CreateWebhookConfiguration { source: kube::Error, name: String },

    #[snafu(display("failed to replace MutatingWebhookConfiguration {name:?}"))]
    ReplaceWebhookConfiguration { source: kube::Error, name: String },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Whether (and where) the webhook should be registered with the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Registration {
    Disabled,
    Enabled(WebhookRegistration),
}

/// Everything that identifies the registered webhook, apart from its CA bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookRegistration {
    /// Name of the `MutatingWebhookConfiguration` object
    pub configuration_name: String,
    /// Name of the single webhook entry inside the configuration
    pub webhook_name: String,
    pub service_name: String,
    pub service_namespace: String,
    /// HTTP path the API server posts admission reviews to
    pub path: String,
}

/// What [`reconcile_mutating_webhook`] did to the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Disabled,
    Created,
    Replaced,
}

/// Cluster-side storage of `MutatingWebhookConfiguration` objects.
///
/// Implemented for [`Api`], and by in-memory fakes in tests.
#[async_trait]
pub trait WebhookConfigurationStore: Send + Sync {
    async fn get(&self, name: &str) -> kube::Result<MutatingWebhookConfiguration>;

    async fn create(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> kube::Result<MutatingWebhookConfiguration>;

    /// Replaces the whole object.
    ///
    /// The server rejects the write if `metadata.resourceVersion` is stale.
    async fn replace(
        &self,
        name: &str,
        config: &MutatingWebhookConfiguration,
    ) -> kube::Result<MutatingWebhookConfiguration>;
}

#[async_trait]
impl WebhookConfigurationStore for Api<MutatingWebhookConfiguration> {
    async fn get(&self, name: &str) -> kube::Result<MutatingWebhookConfiguration> {
        Api::get(self, name).await
    }

    async fn create(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> kube::Result<MutatingWebhookConfiguration> {
        Api::create(self, &PostParams::default(), config).await
    }

    async fn replace(
        &self,
        name: &str,
        config: &MutatingWebhookConfiguration,
    ) -> kube::Result<MutatingWebhookConfiguration> {
        Api::replace(self, name, &PostParams::default(), config).await
    }
}

/// Builds the desired configuration: a single webhook mutating pod CREATE/UPDATE requests,
/// trusting `ca_bundle` for the service's serving certificate.
pub fn build_webhook_configuration(
    registration: &WebhookRegistration,
    ca_bundle: &[u8],
) -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(registration.configuration_name.clone()),
            ..ObjectMeta::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: registration.webhook_name.clone(),
            client_config: WebhookClientConfig {
                ca_bundle: Some(ByteString(ca_bundle.to_vec())),
                service: Some(ServiceReference {
                    name: registration.service_name.clone(),
                    namespace: registration.service_namespace.clone(),
                    path: Some(registration.path.clone()),
                    port: None,
                }),
                url: None,
            },
            rules: Some(vec![RuleWithOperations {
                api_groups: Some(vec!["".to_string()]),
                api_versions: Some(vec!["v1".to_string()]),
                operations: Some(OPERATIONS.iter().map(|op| op.to_string()).collect()),
                resources: Some(vec!["pods".to_string()]),
                scope: None,
            }]),
            admission_review_versions: vec![ADMISSION_REVIEW_VERSION.to_string()],
            side_effects: SIDE_EFFECTS_NONE.to_string(),
            ..MutatingWebhook::default()
        }]),
    }
}

/// Drives the cluster's `MutatingWebhookConfiguration` to the desired state.
///
/// Creates the object if it does not exist, and otherwise replaces it wholesale. The replacement
/// carries the `resourceVersion` that was read, so a concurrent writer makes this call fail
/// instead of being silently overwritten. Nothing is retried.
pub async fn reconcile_mutating_webhook(
    store: &impl WebhookConfigurationStore,
    registration: &Registration,
    ca_bundle: &[u8],
) -> Result<ReconcileOutcome> {
    let registration = match registration {
        Registration::Disabled => {
            info!("No MutatingWebhookConfiguration name configured, skipping webhook registration");
            return Ok(ReconcileOutcome::Disabled);
        }
        Registration::Enabled(registration) => registration,
    };
    let name = &registration.configuration_name;
    let mut desired = build_webhook_configuration(registration, ca_bundle);

    match store.get(name).await {
        Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
            debug!(name = %name, "MutatingWebhookConfiguration not found, creating it");
            store
                .create(&desired)
                .await
                .context(CreateWebhookConfigurationSnafu { name })?;
            info!(name = %name, "Created MutatingWebhookConfiguration");
            Ok(ReconcileOutcome::Created)
        }
        Err(err) => Err(err).context(GetWebhookConfigurationSnafu { name }),
        Ok(existing) => {
            desired.metadata.resource_version = existing.metadata.resource_version;
            store
                .replace(name, &desired)
                .await
                .context(ReplaceWebhookConfigurationSnafu { name })?;
            info!(name = %name, "Replaced MutatingWebhookConfiguration");
            Ok(ReconcileOutcome::Replaced)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{collections::BTreeMap, sync::Mutex};

    use async_trait::async_trait;
    use stackable_operator::{
        k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration,
        kube::{self, error::ErrorResponse},
    };

    use super::{
        build_webhook_configuration, reconcile_mutating_webhook, Error, ReconcileOutcome,
        Registration, WebhookConfigurationStore, WebhookRegistration,
    };

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} (fake)"),
            reason: reason.to_string(),
            code,
        })
    }

    /// In-memory stand-in for the API server, enforcing optimistic concurrency like the real one.
    #[derive(Default)]
    pub(crate) struct FakeStore {
        objects: Mutex<BTreeMap<String, MutatingWebhookConfiguration>>,
        next_version: Mutex<u64>,
        pub gets: Mutex<usize>,
        pub creates: Mutex<Vec<MutatingWebhookConfiguration>>,
        pub replaces: Mutex<Vec<MutatingWebhookConfiguration>>,
        pub get_error: Mutex<Option<u16>>,
    }

    impl FakeStore {
        pub fn with_object(config: MutatingWebhookConfiguration) -> Self {
            let store = Self::default();
            store.insert(config);
            store
        }

        fn insert(&self, mut config: MutatingWebhookConfiguration) -> MutatingWebhookConfiguration {
            let mut version = self.next_version.lock().unwrap();
            *version += 1;
            config.metadata.resource_version = Some(version.to_string());
            let name = config.metadata.name.clone().unwrap_or_default();
            self.objects.lock().unwrap().insert(name, config.clone());
            config
        }

        pub fn object(&self, name: &str) -> Option<MutatingWebhookConfiguration> {
            self.objects.lock().unwrap().get(name).cloned()
        }

        /// Simulates another writer modifying the object behind our back.
        pub fn bump(&self, name: &str) {
            let existing = self.object(name).unwrap();
            self.insert(existing);
        }
    }

    #[async_trait]
    impl WebhookConfigurationStore for FakeStore {
        async fn get(&self, name: &str) -> kube::Result<MutatingWebhookConfiguration> {
            *self.gets.lock().unwrap() += 1;
            if let Some(code) = *self.get_error.lock().unwrap() {
                return Err(api_error(code, "Forbidden"));
            }
            self.object(name).ok_or_else(|| api_error(404, "NotFound"))
        }

        async fn create(
            &self,
            config: &MutatingWebhookConfiguration,
        ) -> kube::Result<MutatingWebhookConfiguration> {
            self.creates.lock().unwrap().push(config.clone());
            let name = config.metadata.name.clone().unwrap_or_default();
            if self.object(&name).is_some() {
                return Err(api_error(409, "AlreadyExists"));
            }
            Ok(self.insert(config.clone()))
        }

        async fn replace(
            &self,
            name: &str,
            config: &MutatingWebhookConfiguration,
        ) -> kube::Result<MutatingWebhookConfiguration> {
            self.replaces.lock().unwrap().push(config.clone());
            let current = self.object(name).ok_or_else(|| api_error(404, "NotFound"))?;
            if current.metadata.resource_version != config.metadata.resource_version {
                return Err(api_error(409, "Conflict"));
            }
            Ok(self.insert(config.clone()))
        }
    }

    pub(crate) fn registration() -> WebhookRegistration {
        WebhookRegistration {
            configuration_name: "sidecar-injector-webhook".to_string(),
            webhook_name: "kube-sidecar-injector.k8s.io".to_string(),
            service_name: "kube-sidecar-injector".to_string(),
            service_namespace: "debug".to_string(),
            path: "/mutate".to_string(),
        }
    }

    fn ca_bundle(config: &MutatingWebhookConfiguration) -> Vec<u8> {
        config.webhooks.as_ref().unwrap()[0]
            .client_config
            .ca_bundle
            .as_ref()
            .unwrap()
            .0
            .clone()
    }

    #[test]
    fn desired_configuration_shape() {
        let config = build_webhook_configuration(&registration(), b"ca");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "apiVersion": "admissionregistration.k8s.io/v1",
                "kind": "MutatingWebhookConfiguration",
                "metadata": { "name": "sidecar-injector-webhook" },
                "webhooks": [{
                    "name": "kube-sidecar-injector.k8s.io",
                    "admissionReviewVersions": ["v1"],
                    "clientConfig": {
                        // base64 of "ca"
                        "caBundle": "Y2E=",
                        "service": {
                            "name": "kube-sidecar-injector",
                            "namespace": "debug",
                            "path": "/mutate",
                        },
                    },
                    "rules": [{
                        "apiGroups": [""],
                        "apiVersions": ["v1"],
                        "operations": ["CREATE", "UPDATE"],
                        "resources": ["pods"],
                    }],
                    "sideEffects": "None",
                }],
            })
        );
    }

    #[tokio::test]
    async fn creates_missing_configuration() {
        let store = FakeStore::default();
        let outcome =
            reconcile_mutating_webhook(&store, &Registration::Enabled(registration()), b"ca-1")
                .await
                .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created);
        assert_eq!(store.creates.lock().unwrap().len(), 1);
        assert_eq!(store.replaces.lock().unwrap().len(), 0);
        assert_eq!(
            ca_bundle(&store.object("sidecar-injector-webhook").unwrap()),
            b"ca-1"
        );
    }

    #[tokio::test]
    async fn replaces_existing_configuration() {
        let store = FakeStore::with_object(build_webhook_configuration(&registration(), b"stale"));
        let outcome =
            reconcile_mutating_webhook(&store, &Registration::Enabled(registration()), b"fresh")
                .await
                .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Replaced);
        assert_eq!(store.creates.lock().unwrap().len(), 0);
        assert_eq!(store.replaces.lock().unwrap().len(), 1);
        assert_eq!(
            ca_bundle(&store.object("sidecar-injector-webhook").unwrap()),
            b"fresh"
        );
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let store = FakeStore::default();
        let registration = Registration::Enabled(registration());
        reconcile_mutating_webhook(&store, &registration, b"ca")
            .await
            .unwrap();
        let first = store.object("sidecar-injector-webhook").unwrap();
        let outcome = reconcile_mutating_webhook(&store, &registration, b"ca")
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Replaced);
        let second = store.object("sidecar-injector-webhook").unwrap();
        assert_eq!(first.webhooks, second.webhooks);
        assert_eq!(first.metadata.name, second.metadata.name);
    }

    #[tokio::test]
    async fn disabled_registration_does_not_touch_cluster() {
        let store = FakeStore::default();
        let outcome = reconcile_mutating_webhook(&store, &Registration::Disabled, b"ca")
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Disabled);
        assert_eq!(*store.gets.lock().unwrap(), 0);
        assert!(store.creates.lock().unwrap().is_empty());
        assert!(store.replaces.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_failures_are_not_treated_as_absent() {
        let store = FakeStore::default();
        *store.get_error.lock().unwrap() = Some(403);
        let err = reconcile_mutating_webhook(&store, &Registration::Enabled(registration()), b"ca")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::GetWebhookConfiguration {
                source: kube::Error::Api(ErrorResponse { code: 403, .. }),
                ..
            }
        ));
        assert!(store.creates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_carries_read_resource_version() {
        let store = FakeStore::with_object(build_webhook_configuration(&registration(), b"stale"));
        reconcile_mutating_webhook(&store, &Registration::Enabled(registration()), b"fresh")
            .await
            .unwrap();
        let replaced = &store.replaces.lock().unwrap()[0];
        assert_eq!(replaced.metadata.resource_version.as_deref(), Some("1"));
    }

    /// Store whose object changes between our read and our write.
    struct RacingStore(FakeStore);

    #[async_trait]
    impl WebhookConfigurationStore for RacingStore {
        async fn get(&self, name: &str) -> kube::Result<MutatingWebhookConfiguration> {
            let existing = self.0.get(name).await;
            self.0.bump(name);
            existing
        }

        async fn create(
            &self,
            config: &MutatingWebhookConfiguration,
        ) -> kube::Result<MutatingWebhookConfiguration> {
            self.0.create(config).await
        }

        async fn replace(
            &self,
            name: &str,
            config: &MutatingWebhookConfiguration,
        ) -> kube::Result<MutatingWebhookConfiguration> {
            self.0.replace(name, config).await
        }
    }

    #[tokio::test]
    async fn concurrent_modification_fails_reconcile() {
        let store = RacingStore(FakeStore::with_object(build_webhook_configuration(
            &registration(),
            b"theirs",
        )));
        let registration = Registration::Enabled(registration());
        let err = reconcile_mutating_webhook(&store, &registration, b"ours")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ReplaceWebhookConfiguration {
                source: kube::Error::Api(ErrorResponse { code: 409, .. }),
                ..
            }
        ));
        assert_eq!(
            ca_bundle(&store.0.object("sidecar-injector-webhook").unwrap()),
            b"theirs"
        );
    }

    #[tokio::test]
    async fn create_conflict_is_surfaced() {
        // Someone else created the object between our read and our create
        struct LateCreator(FakeStore);

        #[async_trait]
        impl WebhookConfigurationStore for LateCreator {
            async fn get(&self, name: &str) -> kube::Result<MutatingWebhookConfiguration> {
                let existing = self.0.get(name).await;
                self.0
                    .insert(build_webhook_configuration(&registration(), b"theirs"));
                existing
            }

            async fn create(
                &self,
                config: &MutatingWebhookConfiguration,
            ) -> kube::Result<MutatingWebhookConfiguration> {
                self.0.create(config).await
            }

            async fn replace(
                &self,
                name: &str,
                config: &MutatingWebhookConfiguration,
            ) -> kube::Result<MutatingWebhookConfiguration> {
                self.0.replace(name, config).await
            }
        }

        let store = LateCreator(FakeStore::default());
        let registration = Registration::Enabled(registration());
        let err = reconcile_mutating_webhook(&store, &registration, b"ours")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CreateWebhookConfiguration { .. }));
    }
}
