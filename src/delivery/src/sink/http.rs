use std::time::Duration;

use async_trait::async_trait;
use common::{Destination, Record, SignalType};
use reqwest::header::CONTENT_TYPE;
use url::Url;

use super::SinkClient;
use crate::{DeliveryError, DeliveryResult};

/// POSTs each record to `{endpoint}/{logs|metrics|traces}`
pub struct HttpSink {
    client: reqwest::Client,
    base_url: Url,
    /// Indexed like `SignalType::ALL`
    signal_urls: [Url; 3],
    credential: Option<String>,
    timeout: Duration,
}

impl HttpSink {
    pub fn new(
        client: reqwest::Client,
        destination: &Destination,
        timeout: Duration,
    ) -> DeliveryResult<Self> {
        let base_url = destination
            .http_base_url()
            .ok_or_else(|| DeliveryError::InvalidDestination("not an HTTP destination".into()))?
            .map_err(|e| DeliveryError::InvalidDestination(e.to_string()))?;

        let signal_urls = [
            signal_url(&base_url, SignalType::Logs)?,
            signal_url(&base_url, SignalType::Metrics)?,
            signal_url(&base_url, SignalType::Traces)?,
        ];

        Ok(Self {
            client,
            base_url,
            signal_urls,
            credential: destination.credential.clone(),
            timeout,
        })
    }

    pub fn url_for(&self, signal: SignalType) -> &Url {
        match signal {
            SignalType::Logs => &self.signal_urls[0],
            SignalType::Metrics => &self.signal_urls[1],
            SignalType::Traces => &self.signal_urls[2],
        }
    }
}

fn signal_url(base: &Url, signal: SignalType) -> DeliveryResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| DeliveryError::InvalidDestination(format!("{base} cannot be a base URL")))?
        .pop_if_empty()
        .push(signal.as_str());
    Ok(url)
}

#[async_trait]
impl SinkClient for HttpSink {
    fn describe(&self) -> String {
        format!("http:{}", self.base_url)
    }

    fn retries(&self) -> bool {
        true
    }

    async fn send(&self, record: &Record) -> DeliveryResult<()> {
        let url = self.url_for(record.signal_type());
        let body = record.to_json()?;

        let mut request = self
            .client
            .post(url.clone())
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(credential) = &self.credential {
            request = request.bearer_auth(credential);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("POST {url} failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Transient(format!(
                "POST {url} returned {status}"
            )))
        }
    }
}
