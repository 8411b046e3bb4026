//! Open Build Service client.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{BuildService, SubmissionHandle};
use crate::error::ServiceError;
use crate::verdict::RemoteStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObsConfig {
    pub api_url: String,
    pub username: String,
    pub password: String,
    pub project: String,
    pub repository: String,
    pub architecture: String,
    pub request_timeout_secs: u64,
}

impl Default for ObsConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.opensuse.org".into(),
            username: String::new(),
            password: String::new(),
            project: String::new(),
            repository: "openSUSE_Factory_RISCV".into(),
            architecture: "riscv64".into(),
            request_timeout_secs: 600,
        }
    }
}

pub struct ObsClient {
    client: Client,
    config: ObsConfig,
}

impl ObsClient {
    pub fn new(config: ObsConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn base(&self) -> &str {
        self.config.api_url.trim_end_matches('/')
    }

    fn build_url(&self, package: &str, leaf: &str) -> String {
        format!(
            "{}/build/{}/{}/{}/{}/{}",
            self.base(),
            self.config.project,
            self.config.repository,
            self.config.architecture,
            package,
            leaf
        )
    }

    async fn get_text(&self, url: &str) -> Result<String, ServiceError> {
        let response = self
            .client
            .get(url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header("Accept", "application/xml")
            .send()
            .await?;
        check_status(response).await?.text().await.map_err(Into::into)
    }

    async fn fetch_log(&self, package: &str) -> Result<String, ServiceError> {
        self.get_text(&self.build_url(package, "_log")).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
    let status = response.status().as_u16();
    if response.status().is_success() {
        return Ok(response);
    }
    if status == 401 || status == 403 {
        return Err(ServiceError::Auth);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ServiceError::Http { status, body })
}

#[async_trait]
impl BuildService for ObsClient {
    async fn upload(
        &self,
        package: &str,
        root: &Path,
        files: &[String],
    ) -> Result<SubmissionHandle, ServiceError> {
        if !files.iter().any(|f| f.ends_with(".spec")) {
            return Err(ServiceError::Rejected(format!(
                "no .spec file in upload set for {package}"
            )));
        }

        for file in files {
            let bytes = tokio::fs::read(root.join(file))
                .await
                .map_err(|e| ServiceError::Rejected(format!("cannot read {file}: {e}")))?;
            let url = format!(
                "{}/source/{}/{}/{}",
                self.base(),
                self.config.project,
                package,
                file
            );
            debug!(package, file = %file, bytes = bytes.len(), "uploading source file");
            let response = self
                .client
                .put(&url)
                .basic_auth(&self.config.username, Some(&self.config.password))
                .header("Content-Type", "application/octet-stream")
                .header("Accept", "application/xml")
                .body(bytes)
                .send()
                .await?;
            check_status(response).await?;
        }

        info!(package, files = files.len(), "uploaded sources to OBS");
        Ok(SubmissionHandle {
            package: package.to_string(),
            id: package.to_string(),
            submitted_at: Utc::now(),
        })
    }

    async fn status(&self, handle: &SubmissionHandle) -> Result<RemoteStatus, ServiceError> {
        let body = self
            .get_text(&self.build_url(&handle.package, "_status"))
            .await?;
        let status = parse_status(&body)?;
        debug!(package = %handle.package, code = %status.code, "OBS status");

        Ok(match status.code.as_str() {
            "succeeded" => RemoteStatus::Success,
            "failed" => RemoteStatus::Failure {
                log: self.fetch_log(&handle.package).await?,
            },
            "broken" => RemoteStatus::Failure {
                log: format!(
                    "Build broken: the sources contain no usable build description, \
                     source processing failed, or a merge conflict exists. {}",
                    status.details
                ),
            },
            "unresolvable" => RemoteStatus::Failure {
                log: format!(
                    "Build unresolvable: required packages are missing or not \
                     explicitly defined. {}",
                    status.details
                ),
            },
            "disabled" | "excluded" => RemoteStatus::Error {
                reason: format!("package is {} for this repository", status.code),
            },
            _ => RemoteStatus::Pending { code: status.code },
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ObsStatus {
    pub code: String,
    pub details: String,
}

/// Parse `<status package=".." code=".."><details>..</details></status>`.
pub(crate) fn parse_status(xml: &str) -> Result<ObsStatus, ServiceError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut code = None;
    let mut details = String::new();
    let mut in_details = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"status" => {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"code" {
                            code = Some(String::from_utf8_lossy(&attr.value).into_owned());
                        }
                    }
                }
                b"details" => in_details = true,
                _ => {}
            },
            Ok(Event::Text(t)) if in_details => {
                details.push_str(&String::from_utf8_lossy(&t));
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"details" => in_details = false,
            Ok(Event::Eof) => break,
            Err(e) => return Err(ServiceError::Protocol(format!("bad status xml: {e}"))),
            _ => {}
        }
        buf.clear();
    }

    code.map(|code| ObsStatus { code, details })
        .ok_or_else(|| ServiceError::Protocol("status xml has no code attribute".into()))
}
