//! DNS identity of the webhook service inside the cluster

use std::fmt::Display;

pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// The Kubernetes `Service` fronting the webhook server.
///
/// The API server reaches the webhook through this service, so the serving certificate has to be
/// valid for every name the service can be addressed by.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub name: String,
    pub namespace: String,
    pub cluster_domain: String,
}

impl ServiceIdentity {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
        }
    }

    pub fn with_cluster_domain(mut self, cluster_domain: impl Into<String>) -> Self {
        self.cluster_domain = cluster_domain.into();
        self
    }

    /// `<name>.<namespace>.svc`, the host the API server dials for service references.
    pub fn common_name(&self) -> String {
        format!("{}.{}.svc", self.name, self.namespace)
    }

    /// Every hostname the serving certificate must be valid for, shortest first.
    pub fn dns_names(&self) -> Vec<String> {
        let Self {
            name,
            namespace,
            cluster_domain,
        } = self;
        vec![
            name.clone(),
            format!("{name}.{namespace}"),
            self.common_name(),
            format!("{name}.{namespace}.svc.{cluster_domain}"),
        ]
    }
}

impl Display for ServiceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
