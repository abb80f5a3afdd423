use crate::error::BalancerError;
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;

/// Consul /v1/health/service response: the `Service` object.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsulService {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Address", default)]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
}

/// Consul node structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsulNode {
    #[serde(rename = "Address", default)]
    pub address: String,
}

/// A single entry from the /v1/health/service response.
#[derive(Debug, Deserialize)]
pub(crate) struct ConsulHealthEntry {
    #[serde(rename = "Node")]
    node: ConsulNode,
    #[serde(rename = "Service")]
    service: ConsulService,
}

/// Exposed service instance information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsulServiceNode {
    pub service_id: String,
    pub address: String,
    pub port: u16,
}

impl From<ConsulHealthEntry> for ConsulServiceNode {
    fn from(entry: ConsulHealthEntry) -> Self {
        // An empty service address means "use the node's address".
        let address = if entry.service.address.is_empty() {
            entry.node.address
        } else {
            entry.service.address
        };
        Self {
            service_id: entry.service.id,
            address,
            port: entry.service.port,
        }
    }
}

/// Result of one blocking health query.
#[derive(Debug, Clone)]
pub struct HealthQueryResult {
    pub nodes: Vec<ConsulServiceNode>,
    /// Value of `X-Consul-Index`, 0 if the header was absent.
    pub last_index: u64,
}

/// Consul HTTP client.
#[derive(Clone)]
pub struct ConsulClient {
    base_url: String,
    client: reqwest::Client,
    token: Option<String>,
    datacenter: Option<String>,
}

impl ConsulClient {
    /// `max_wait` is the longest blocking query this client will issue; the
    /// request timeout is sized so Consul's own wait (plus its jitter) always
    /// finishes first.
    pub fn new(
        consul_addr: &str,
        token: Option<String>,
        datacenter: Option<String>,
        max_wait: Duration,
    ) -> Result<Self, BalancerError> {
        let base_url = if consul_addr.starts_with("http://") || consul_addr.starts_with("https://")
        {
            consul_addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", consul_addr.trim_end_matches('/'))
        };

        let client = reqwest::Client::builder()
            .timeout(max_wait + max_wait / 16 + Duration::from_secs(5))
            .connect_timeout(Duration::from_secs(5))
            .no_proxy()
            .build()
            .map_err(|e| BalancerError::Config(format!("consul http client: {}", e)))?;

        Ok(Self {
            base_url,
            client,
            token,
            datacenter,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Inject the Consul ACL token into a request builder if configured.
    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("X-Consul-Token", token),
            None => req,
        }
    }

    /// `service_name` and `dc` are percent-encoded, so neither can reshape the request.
    fn health_request(
        &self,
        service_name: &str,
        wait_index: u64,
        wait: Duration,
    ) -> Result<reqwest::Request, BalancerError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| BalancerError::Config(format!("consul address: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| BalancerError::Config(format!("consul address: {}", self.base_url)))?
            .pop_if_empty()
            .extend(["v1", "health", "service", service_name]);

        let index = wait_index.to_string();
        let wait = format!("{}s", wait.as_secs().max(1));
        let mut req = self.client.get(url).query(&[
            ("passing", "true"),
            ("index", index.as_str()),
            ("wait", wait.as_str()),
        ]);
        if let Some(dc) = &self.datacenter {
            req = req.query(&[("dc", dc.as_str())]);
        }

        Ok(self.authed(req).build()?)
    }

    /// Blocking query for the passing instances of a service.
    ///
    /// Consul holds the response until the service's index moves past
    /// `wait_index` or `wait` elapses; both outcomes return the full current
    /// list. A `wait_index` of 0 returns immediately.
    pub async fn query_healthy_service(
        &self,
        service_name: &str,
        wait_index: u64,
        wait: Duration,
    ) -> Result<HealthQueryResult, BalancerError> {
        let req = self.health_request(service_name, wait_index, wait)?;
        let resp = self.client.execute(req).await?;

        if !resp.status().is_success() {
            return Err(BalancerError::RegistryTransient(format!(
                "non-200 response: status={}",
                resp.status()
            )));
        }

        let last_index = resp
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let entries: Vec<ConsulHealthEntry> = resp.json().await?;
        let nodes = entries.into_iter().map(ConsulServiceNode::from).collect();

        Ok(HealthQueryResult { nodes, last_index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalization() {
        let wait = Duration::from_secs(10);
        let c = ConsulClient::new("127.0.0.1:8500/", None, None, wait).unwrap();
        assert_eq!(c.base_url(), "http://127.0.0.1:8500");
        let c = ConsulClient::new("https://consul.internal/", None, None, wait).unwrap();
        assert_eq!(c.base_url(), "https://consul.internal");
    }

    #[test]
    fn test_decode_health_entries() {
        let body = r#"[
            {
                "Node": {"Node": "node-1", "Address": "10.0.0.1"},
                "Service": {"ID": "backend-1", "Service": "backend", "Address": "host.docker.internal", "Port": 8081, "Meta": null},
                "Checks": [{"CheckID": "serfHealth", "Status": "passing"}]
            },
            {
                "Node": {"Node": "node-2", "Address": "10.0.0.2"},
                "Service": {"ID": "backend-2", "Service": "backend", "Address": "", "Port": 8082, "Meta": {"zone": "b"}},
                "Checks": []
            }
        ]"#;
        let entries: Vec<ConsulHealthEntry> = serde_json::from_str(body).unwrap();
        let nodes: Vec<ConsulServiceNode> =
            entries.into_iter().map(ConsulServiceNode::from).collect();

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].service_id, "backend-1");
        assert_eq!(nodes[0].address, "host.docker.internal");
        assert_eq!(nodes[0].port, 8081);
        // empty service address falls back to the node address
        assert_eq!(nodes[1].address, "10.0.0.2");
    }

    #[test]
    fn test_health_request_escapes_name_and_dc() {
        let c = ConsulClient::new(
            "http://127.0.0.1:8500",
            Some("secret".into()),
            Some("dc1&stale=1".into()),
            Duration::from_secs(10),
        )
        .unwrap();
        let req = c
            .health_request("web/../x?passing=false", 42, Duration::from_secs(5))
            .unwrap();
        let url = req.url();

        assert_eq!(url.path(), "/v1/health/service/web%2F..%2Fx%3Fpassing=false");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("passing".to_string(), "true".to_string()),
                ("index".to_string(), "42".to_string()),
                ("wait".to_string(), "5s".to_string()),
                ("dc".to_string(), "dc1&stale=1".to_string()),
            ]
        );
        assert_eq!(req.headers().get("X-Consul-Token").unwrap(), "secret");
    }

    #[test]
    fn test_health_request_keeps_address_prefix() {
        let c = ConsulClient::new("http://gw.internal/consul/", None, None, Duration::from_secs(1))
            .unwrap();
        let req = c.health_request("web", 0, Duration::from_millis(200)).unwrap();
        assert_eq!(req.url().path(), "/consul/v1/health/service/web");
        assert!(req.url().query().unwrap().contains("wait=1s"));
    }
}
