//! Shared Kubernetes utilities using kube-rs

use std::future::Future;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tracing::trace;

use crate::Error;

/// Default connection timeout for member cluster clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for member cluster clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Build an `ApiResource` from an apiVersion string and kind
///
/// # Example
/// ```ignore
/// let ar = build_api_resource("rbac.authorization.k8s.io/v1", "ClusterRole");
/// let api: Api<DynamicObject> = Api::all_with(client, &ar);
/// ```
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use lattice_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("rbac.authorization.k8s.io/v1");
/// assert_eq!(group, "rbac.authorization.k8s.io");
/// assert_eq!(version, "v1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

const KIND_PLURALS: &[(&str, &str)] = &[
    ("namespace", "namespaces"),
    ("clusterrole", "clusterroles"),
    ("clusterrolebinding", "clusterrolebindings"),
    ("role", "roles"),
    ("rolebinding", "rolebindings"),
    ("serviceaccount", "serviceaccounts"),
];

/// Pluralize a Kubernetes resource kind
///
/// Uses a lookup table for the kinds federation projects, falling back to
/// simple pluralization rules for unknown types.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(s, _)| *s == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Poll until a condition is met or timeout is reached
///
/// Repeatedly calls `check_fn` until it returns `Ok(true)`. Errors from the
/// check are treated as "not yet" and polling continues. When the timeout
/// elapses `on_timeout` is returned.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    on_timeout: Error,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = std::time::Instant::now();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("Polling condition not yet met, retrying..."),
            Err(e) => trace!("Polling check returned error (retrying): {}", e),
        }

        if start.elapsed() >= timeout {
            return Err(on_timeout);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Create a kube client from kubeconfig YAML with custom timeouts
///
/// Member clusters hand us their kubeconfig as text, so there is no file
/// path involved.
pub async fn create_client_from_kubeconfig(
    kubeconfig_yaml: &str,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig_yaml).map_err(|e| {
        Error::validation_for("kubeconfig", format!("failed to parse kubeconfig: {}", e))
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to load kubeconfig: {}", e),
            )
        })?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}
