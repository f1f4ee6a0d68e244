//! Parallel authorization callouts to operator-configured URLs.

use async_trait::async_trait;
use reqwest::{Certificate, Client, Identity, Method, StatusCode};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::CalloutConfig;
use crate::error::{Error, ErrorKind};
use crate::models::PolicyRequest;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CalloutRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub operation: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub subject_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub subject_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub object_type: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: BTreeMap<String, String>,
}

impl CalloutRequest {
    /// Request describing an authorization decision that already passed the
    /// policy check.
    pub fn from_policy(pr: &PolicyRequest) -> Self {
        let subject_type = pr.subject_type.map(|t| t.as_str()).unwrap_or_default();
        let object_type = pr.object_type.map(|t| t.as_str()).unwrap_or_default();

        let payload = [
            ("domain", pr.domain.as_str()),
            ("subject", pr.subject.as_str()),
            ("subject_type", subject_type),
            ("subject_kind", pr.subject_kind.map(|k| k.as_str()).unwrap_or_default()),
            ("subject_relation", pr.subject_relation.as_str()),
            ("object", pr.object.as_str()),
            ("object_type", object_type),
            ("object_kind", pr.object_kind.as_str()),
            ("relation", pr.relation.as_str()),
            ("permission", pr.permission.as_str()),
        ]
        .into_iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            operation: pr.action().to_string(),
            subject_id: pr.subject.clone(),
            subject_type: subject_type.to_string(),
            object_type: object_type.to_string(),
            payload,
        }
    }

    fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("operation".to_string(), self.operation.clone()),
            ("subject_id".to_string(), self.subject_id.clone()),
            ("subject_type".to_string(), self.subject_type.clone()),
            ("object_type".to_string(), self.object_type.clone()),
        ];
        pairs.extend(self.payload.iter().map(|(k, v)| (k.clone(), v.clone())));
        pairs
    }
}

#[async_trait]
pub trait Callout: Send + Sync {
    async fn callout(&self, req: &CalloutRequest) -> Result<(), Error>;
}

/// Callout that always allows.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallout;

#[async_trait]
impl Callout for NoopCallout {
    async fn callout(&self, _req: &CalloutRequest) -> Result<(), Error> {
        Ok(())
    }
}

pub struct HttpCallout {
    client: Client,
    urls: Vec<String>,
    method: Method,
    allowed_operations: HashSet<String>,
}

impl HttpCallout {
    pub fn new(config: &CalloutConfig) -> Result<Self, Error> {
        let method = match config.method.as_str() {
            "GET" => Method::GET,
            "POST" => Method::POST,
            other => {
                return Err(Error::new(ErrorKind::Callout)
                    .with_context(format!("unsupported callout method {other}")))
            }
        };

        let client = tls_client(config)?;

        Ok(Self {
            client,
            urls: config.urls.clone(),
            method,
            allowed_operations: config.operations.iter().cloned().collect(),
        })
    }
}

fn read_pem(path: &str) -> Result<Vec<u8>, Error> {
    std::fs::read(path)
        .map_err(|e| Error::wrap(ErrorKind::Callout, e).with_context(path.to_string()))
}

fn tls_client(config: &CalloutConfig) -> Result<Client, Error> {
    let mut builder = Client::builder()
        .use_rustls_tls()
        .timeout(Duration::from_secs(config.timeout_seconds))
        .danger_accept_invalid_certs(!config.tls_verification);

    if let Some(path) = &config.ca_cert {
        let ca = Certificate::from_pem(&read_pem(path)?)
            .map_err(|e| Error::wrap(ErrorKind::Callout, e).with_context(path.clone()))?;
        builder = builder.add_root_certificate(ca);
    }

    match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => {
            let mut pem = read_pem(cert)?;
            pem.push(b'\n');
            pem.extend(read_pem(key)?);
            let identity = Identity::from_pem(&pem)
                .map_err(|e| Error::wrap(ErrorKind::Callout, e).with_context(cert.clone()))?;
            builder = builder.identity(identity);
        }
        (None, None) => {}
        _ => {
            return Err(Error::new(ErrorKind::Callout)
                .with_context("client certificate and key must be set together"))
        }
    }

    builder
        .build()
        .map_err(|e| Error::wrap(ErrorKind::Callout, e))
}

async fn send(
    client: Client,
    method: Method,
    url: String,
    req: CalloutRequest,
) -> Result<(), Error> {
    let builder = if method == Method::GET {
        client.get(&url).query(&req.query_pairs())
    } else {
        client.post(&url).json(&req)
    };

    let response = builder
        .send()
        .await
        .map_err(|e| Error::wrap(ErrorKind::Callout, e).with_context(url.clone()))?;

    let status = response.status();
    if status != StatusCode::OK {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(url = %url, status = %status, "Callout rejected request");
        return Err(Error::new(ErrorKind::Callout).with_context(format!("{status}: {body}")));
    }
    Ok(())
}

#[async_trait]
impl Callout for HttpCallout {
    async fn callout(&self, req: &CalloutRequest) -> Result<(), Error> {
        if self.urls.is_empty() || !self.allowed_operations.contains(&req.operation) {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let mut set = JoinSet::new();
        for url in &self.urls {
            let cancel = cancel.clone();
            let request = send(
                self.client.clone(),
                self.method.clone(),
                url.clone(),
                req.clone(),
            );
            set.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(Error::new(ErrorKind::Canceled)),
                    result = request => result,
                }
            });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let outcome = joined
                .map_err(|e| Error::wrap(ErrorKind::Callout, e))
                .and_then(|r| r);
            if let Err(err) = outcome {
                if first_error.is_none() {
                    cancel.cancel();
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
