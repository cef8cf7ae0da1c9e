use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::core::error::UpdateServiceError;
use crate::core::model::{ExtensionVersion, UpdateCheckParams, UpdateCheckReport};
use crate::plugins::http::client::HttpFetcher;
use crate::plugins::http::manifest::{build_fetch_url, ManifestQuery, UpdateManifest};
use crate::plugins::registry::{ExtensionService, UpdateService};

/// Batched check against one manifest endpoint. Reports which extensions have
/// a newer version; it does not download or install anything.
pub struct HttpUpdateService {
    fetcher: HttpFetcher,
    endpoint: Url,
    service: Arc<dyn ExtensionService>,
}

impl HttpUpdateService {
    pub fn new(fetcher: HttpFetcher, endpoint: Url, service: Arc<dyn ExtensionService>) -> Self {
        Self { fetcher, endpoint, service }
    }
}

#[async_trait]
impl UpdateService for HttpUpdateService {
    fn name(&self) -> &'static str {
        "http-update-service"
    }

    async fn start_update_check(&self, params: UpdateCheckParams) -> Result<UpdateCheckReport, UpdateServiceError> {
        let mut queries = vec![];
        for (id, data) in &params.update_info {
            // a corrupt install reports no version so the server offers a full copy
            let version = if data.is_corrupt_reinstall {
                None
            } else {
                self.service.get_extension(id).await.map(|e| e.version)
            };
            queries.push(ManifestQuery { id: id.clone(), version, ping: None, update_url_data: None });
        }
        if queries.is_empty() {
            return Ok(UpdateCheckReport::default());
        }

        let url = build_fetch_url(&self.endpoint, &queries);
        debug!(count = queries.len(), priority = ?params.priority, "batched manifest request");
        let (body, _) = self
            .fetcher
            .get(&url, params.priority)
            .await
            .map_err(|(e, _)| UpdateServiceError::Unavailable(e.to_string()))?;
        let manifest = UpdateManifest::parse(&body).map_err(|e| UpdateServiceError::InvalidResponse(e.to_string()))?;

        let mut report = UpdateCheckReport::default();
        for q in &queries {
            let Some(entry) = manifest.entry(&q.id).filter(|e| e.is_ok()) else {
                continue;
            };
            let Some(offered) = entry.version.as_deref().and_then(ExtensionVersion::parse) else {
                continue;
            };
            let newer = match q.version.as_deref().and_then(ExtensionVersion::parse) {
                Some(installed) => offered.is_newer_than(&installed),
                None => true,
            };
            if newer {
                report.updates_available.push((q.id.clone(), offered.to_string()));
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::ExtensionUpdateData;
    use crate::plugins::local::inventory::{Inventory, InventoryFile, InstalledRecord};
    use crate::plugins::registry::FetchContext;
    use crate::testing::installed;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(body: &'static str) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = sock.read(&mut buf).await.unwrap();
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", body.len());
            sock.write_all(head.as_bytes()).await.unwrap();
            sock.write_all(body.as_bytes()).await.unwrap();
        });
        Url::parse(&format!("http://{}/service/update2/json", addr)).unwrap()
    }

    fn service(endpoint: Url) -> HttpUpdateService {
        let inventory = Inventory::in_memory(InventoryFile {
            installed: vec![
                InstalledRecord { info: installed("a", "1.0"), in_use: false },
                InstalledRecord { info: installed("b", "3.0"), in_use: false },
            ],
            ..Default::default()
        });
        let fetcher = HttpFetcher::new(FetchContext { retries: 0, timeout_secs: 5, ..FetchContext::default() }).unwrap();
        HttpUpdateService::new(fetcher, endpoint, Arc::new(inventory))
    }

    fn params(ids: &[(&str, bool)]) -> UpdateCheckParams {
        UpdateCheckParams {
            update_info: ids
                .iter()
                .map(|(id, corrupt)| (id.to_string(), ExtensionUpdateData { is_corrupt_reinstall: *corrupt }))
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn reports_only_newer_versions() {
        let url = serve_once(
            r#"{"extensions": [{"id": "a", "version": "1.1"}, {"id": "b", "version": "3.0"},
                               {"id": "c", "status": "noupdate"}]}"#,
        )
        .await;
        let report = service(url).start_update_check(params(&[("a", false), ("b", false), ("c", false)])).await.unwrap();
        assert_eq!(report.updates_available, vec![("a".to_string(), "1.1".to_string())]);
    }

    #[tokio::test]
    async fn corrupt_reinstall_is_always_offered() {
        let url = serve_once(r#"{"extensions": [{"id": "b", "version": "3.0"}]}"#).await;
        let report = service(url).start_update_check(params(&[("b", true)])).await.unwrap();
        assert_eq!(report.updates_available, vec![("b".to_string(), "3.0".to_string())]);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unavailable() {
        let svc = service(Url::parse("http://127.0.0.1:1/update").unwrap());
        let err = svc.start_update_check(params(&[("a", false)])).await.unwrap_err();
        assert!(matches!(err, UpdateServiceError::Unavailable(_)));
        assert_eq!(svc.start_update_check(params(&[])).await.unwrap(), UpdateCheckReport::default());
    }
}
