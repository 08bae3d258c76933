use crate::metrics::InstrumentLayer;

use kube::client::ClientBuilder;
use kube::{Client, Config, Result};
use prometheus_client::registry::Registry;

/// Client wired for the build namespace: unqualified requests default to
/// it, and every apiserver call is measured into the given registry by
/// verb and resource.
pub fn build_namespace_client(
    mut config: Config,
    build_namespace: &str,
    registry: &mut Registry,
) -> Result<Client> {
    config.default_namespace = build_namespace.to_string();
    let instrument = InstrumentLayer::new(registry);
    Ok(ClientBuilder::try_from(config)?
        .with_layer(&instrument)
        .build())
}
