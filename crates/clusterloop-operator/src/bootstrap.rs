//! Startup wiring
//!
//! Decides whether the operator talks to kcp or to a plain Kubernetes cluster,
//! and in the kcp case points the client at the APIExport's virtual workspace.

use crate::config::{startup_backoff, ResolverConfig};
use crate::crds::{ApiExport, Widget};
use crate::error::{Error, Result};
use crate::resolver::VirtualWorkspaceResolver;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use clusterloop_core::{ClientError, KcpClient, LogicalCluster, Scheme};
use kube::Config;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

/// API group discovery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApiDiscovery: Send + Sync {
    async fn serves_group(&self, group: &str, version: &str) -> Result<bool, ClientError>;
}

#[async_trait]
impl ApiDiscovery for KcpClient {
    async fn serves_group(&self, group: &str, version: &str) -> Result<bool, ClientError> {
        KcpClient::serves_group(self, group, version).await
    }
}

/// Whether the server serves `group/version`, retrying transient failures.
pub async fn kcp_apis_present<D: ApiDiscovery + ?Sized>(
    discovery: &D,
    group: &str,
    version: &str,
    backoff: ExponentialBackoff,
    cancel: &CancellationToken,
) -> Result<bool> {
    let attempt = retry(backoff, move || async move {
        match discovery.serves_group(group, version).await {
            Ok(present) => Ok(present),
            Err(e @ ClientError::InvalidUrl(_)) => Err(backoff::Error::permanent(e)),
            Err(e) => {
                warn!(error = %e, group, "API discovery failed, retrying");
                Err(backoff::Error::transient(e))
            }
        }
    });

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = attempt => result.map_err(Error::Discovery),
    }
}

/// Client and cluster selector the controllers run with.
pub struct Session {
    pub client: Arc<KcpClient>,
    /// Selector covering every cluster the controllers may see.
    pub all_clusters: LogicalCluster,
    /// Set when running against an APIExport virtual workspace.
    pub virtual_workspace_url: Option<String>,
}

/// Connect using `base`. Against kcp, waits for the virtual workspace URL of
/// the export serving this operator's group.
pub async fn connect(
    base: Config,
    scheme: &Scheme,
    mut resolver_config: ResolverConfig,
    cancel: &CancellationToken,
) -> Result<Session> {
    let apis = scheme
        .lookup::<ApiExport>()
        .ok_or(Error::NotRegistered("APIExport"))?;
    let widgets = scheme
        .lookup::<Widget>()
        .ok_or(Error::NotRegistered("Widget"))?;
    resolver_config.group = widgets.group.clone();

    let client = Arc::new(KcpClient::new(base.clone()));
    let is_kcp = kcp_apis_present(
        client.as_ref(),
        &apis.group,
        &apis.version,
        startup_backoff(),
        cancel,
    )
    .await?;

    if !is_kcp {
        info!(url = %client.base_url(), "kcp APIs not found, running against a single cluster");
        return Ok(Session {
            client,
            all_clusters: LogicalCluster::empty(),
            virtual_workspace_url: None,
        });
    }

    info!(
        export = %resolver_config.export_name,
        "kcp APIs found, resolving APIExport virtual workspace"
    );
    let mut resolver = VirtualWorkspaceResolver::new(client, resolver_config);
    let url = resolver.resolve(cancel).await?;
    let client = KcpClient::with_host(&base, &url)?;
    Ok(Session {
        client: Arc::new(client),
        all_clusters: LogicalCluster::wildcard(),
        virtual_workspace_url: Some(url),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use std::time::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_backoff() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_elapsed_time: Some(Duration::from_secs(5)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_detects_kcp() {
        let mut discovery = MockApiDiscovery::new();
        discovery
            .expect_serves_group()
            .with(eq("apis.kcp.dev"), eq("v1alpha1"))
            .times(1)
            .returning(|_, _| Ok(true));

        let present = kcp_apis_present(
            &discovery,
            "apis.kcp.dev",
            "v1alpha1",
            fast_backoff(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(present);
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut discovery = MockApiDiscovery::new();
        discovery.expect_serves_group().returning(move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ClientError::NotFound {
                    kind: "APIGroupList".into(),
                    key: "/apis".into(),
                })
            } else {
                Ok(false)
            }
        });

        let present = kcp_apis_present(
            &discovery,
            "apis.kcp.dev",
            "v1alpha1",
            fast_backoff(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(!present);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalid_url_is_permanent() {
        let mut discovery = MockApiDiscovery::new();
        discovery
            .expect_serves_group()
            .times(1)
            .returning(|_, _| Err(ClientError::InvalidUrl("nope".into())));

        let err = kcp_apis_present(
            &discovery,
            "apis.kcp.dev",
            "v1alpha1",
            fast_backoff(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Discovery(ClientError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_cancelled_while_retrying() {
        let mut discovery = MockApiDiscovery::new();
        discovery
            .expect_serves_group()
            .returning(|_, _| Err(ClientError::MissingName));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = kcp_apis_present(
            &discovery,
            "apis.kcp.dev",
            "v1alpha1",
            ExponentialBackoff::default(),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_connect_requires_registered_kinds() {
        let config = Config::new("https://kcp.example:6443".parse().unwrap());
        let scheme = Scheme::new().register::<Widget>();
        let err = connect(config, &scheme, ResolverConfig::default(), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::NotRegistered("APIExport")));
    }
}
