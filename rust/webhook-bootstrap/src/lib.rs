//! Bootstraps TLS trust for a mutating admission webhook.
//!
//! A run mints (or loads) a CA, issues the webhook's serving certificate, writes it to the
//! certificate directory and points the `MutatingWebhookConfiguration` at the new CA bundle.

pub mod bootstrap;
pub mod config;
pub mod identity;
pub mod issuer;
pub mod publish;
pub mod registrar;
pub mod utils;

pub use bootstrap::{bootstrap, BootstrapOutcome};
