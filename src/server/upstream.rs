use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;

fn build_upstream_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let rel = path.trim_start_matches('/');
    format!("{base}/{rel}")
}

/// Pass-through JSON client for the demo transport -- trimmed down to the one call the
/// gateway binary needs, the way the teacher's `UpstreamClient` has one method per shape
/// of call its gateway makes.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent("acctgate/0.1")
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self { client }
    }

    pub async fn post_json(
        &self,
        base_url: &str,
        path: &str,
        payload: &Value,
        api_key: Option<&str>,
        timeout_seconds: u64,
    ) -> Result<(u16, Value), reqwest::Error> {
        let url = build_upstream_url(base_url, path);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key {
            if let Ok(hv) = HeaderValue::from_str(&format!("Bearer {key}")) {
                headers.insert(AUTHORIZATION, hv);
            }
        }

        let response = self
            .client
            .post(url)
            .headers(headers)
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .json(payload)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok((status, body))
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}
