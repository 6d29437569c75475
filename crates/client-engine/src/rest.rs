use std::io::SeekFrom;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use skylift_core::profile::ClientProfile;

use crate::platform::{
    Analysis, AnalysisVersion, CreatedJob, JobRequest, PlatformClient, TransferDirection,
    UploadParams, UploadedFile,
};

const UPLOAD_PART_BYTES: u64 = 8 * 1024 * 1024;

/// Production [`PlatformClient`] backed by the platform's REST API.
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct UploadInitRequest<'a> {
    name: &'a str,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct UploadInitResponse {
    upload_id: String,
}

#[derive(Debug, Deserialize)]
struct UploadCompleteResponse {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateJobResponse {
    job_id: String,
}

#[derive(Debug, Serialize)]
struct ProjectAssignmentRequest<'a> {
    project_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnalysisDto {
    code: String,
    #[serde(default)]
    versions: Vec<AnalysisVersionDto>,
}

#[derive(Debug, Deserialize)]
struct AnalysisVersionDto {
    version: String,
    id: String,
}

impl RestClient {
    /// Build a client from the user's connection profile.
    pub fn new(profile: &ClientProfile) -> anyhow::Result<Self> {
        let base = profile
            .api_base_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("profile has no API base URL"))?;
        let base_url = Url::parse(base)?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            http,
            base_url,
            token: profile.api_token.clone(),
        })
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

async fn check(res: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    anyhow::bail!("http {status}: {body}")
}

#[async_trait]
impl PlatformClient for RestClient {
    async fn get_analyses(&self) -> anyhow::Result<Vec<Analysis>> {
        let url = self.base_url.join("api/v2/analyses/")?;
        let res = self.authed(self.http.get(url)).send().await?;
        let list: Vec<AnalysisDto> = check(res).await?.json().await?;
        Ok(list
            .into_iter()
            .map(|dto| Analysis {
                code: dto.code,
                versions: dto
                    .versions
                    .into_iter()
                    .map(|v| AnalysisVersion {
                        display_name: v.version,
                        version_code: v.id,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn upload_file(&self, params: UploadParams) -> anyhow::Result<UploadedFile> {
        let meta = tokio::fs::metadata(&params.local_path).await?;
        let size = meta.len();
        let name = params
            .local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow::anyhow!("invalid upload path: {}", params.local_path.display()))?;

        let init_url = match &params.folder_id {
            Some(folder) => self
                .base_url
                .join(&format!("api/v2/folders/{folder}/uploads/"))?,
            None => self.base_url.join("api/v2/files/uploads/")?,
        };
        let res = self
            .authed(self.http.post(init_url))
            .json(&UploadInitRequest { name: &name, size })
            .send()
            .await?;
        let init: UploadInitResponse = check(res).await?.json().await?;

        let part_count = size.div_ceil(UPLOAD_PART_BYTES).max(1);
        let concurrency = params.parallel_parts.max(1) as usize;
        let sent = Arc::new(AtomicU64::new(0));

        let mut parts = tokio::task::JoinSet::new();
        let mut next_part: u64 = 0;
        loop {
            while next_part < part_count && parts.len() < concurrency {
                let part = next_part;
                next_part += 1;

                let offset = part * UPLOAD_PART_BYTES;
                let len = UPLOAD_PART_BYTES.min(size.saturating_sub(offset)) as usize;
                let url = self.base_url.join(&format!(
                    "api/v2/files/uploads/{}/parts/{}/",
                    init.upload_id,
                    part + 1
                ))?;
                let http = self.http.clone();
                let token = self.token.clone();
                let path = params.local_path.clone();
                let sent = sent.clone();
                let progress = params.progress.clone();

                parts.spawn(async move {
                    let mut file = tokio::fs::File::open(&path).await?;
                    file.seek(SeekFrom::Start(offset)).await?;
                    let mut buf = vec![0u8; len];
                    file.read_exact(&mut buf).await?;

                    let mut req = http.put(url).body(buf);
                    if let Some(token) = &token {
                        req = req.bearer_auth(token);
                    }
                    check(req.send().await?).await?;

                    let done = sent.fetch_add(len as u64, Ordering::Relaxed) + len as u64;
                    if let Some(progress) = &progress {
                        let fraction = if size == 0 {
                            1.0
                        } else {
                            (done as f64 / size as f64).min(1.0)
                        };
                        progress(TransferDirection::Upload, fraction);
                    }
                    anyhow::Ok(())
                });
            }

            match parts.join_next().await {
                Some(res) => res??,
                None => break,
            }
        }

        let complete_url = self
            .base_url
            .join(&format!("api/v2/files/uploads/{}/complete/", init.upload_id))?;
        let res = self.authed(self.http.post(complete_url)).send().await?;
        let done: UploadCompleteResponse = check(res).await?.json().await?;
        Ok(UploadedFile {
            file_id: done.file_id,
        })
    }

    async fn create_job(&self, request: &JobRequest) -> anyhow::Result<CreatedJob> {
        let url = self.base_url.join("api/v2/jobs/")?;
        let res = self.authed(self.http.post(url)).json(request).send().await?;
        let created: CreateJobResponse = check(res).await?.json().await?;
        Ok(CreatedJob {
            job_id: created.job_id,
        })
    }

    async fn assign_project_to_job(
        &self,
        org_code: &str,
        job_id: &str,
        project_id: &str,
    ) -> anyhow::Result<()> {
        let url = self.base_url.join(&format!(
            "api/v2/organizations/{org_code}/jobs/{job_id}/project-assignment/"
        ))?;
        let res = self
            .authed(self.http.post(url))
            .json(&ProjectAssignmentRequest { project_id })
            .send()
            .await?;
        check(res).await?;
        Ok(())
    }

    async fn submit_job(&self, job_id: &str) -> anyhow::Result<()> {
        let url = self.base_url.join(&format!("api/v2/jobs/{job_id}/submit/"))?;
        let res = self.authed(self.http.post(url)).send().await?;
        check(res).await?;
        Ok(())
    }

    async fn warmup_proxy(&self) -> anyhow::Result<()> {
        let url = self.base_url.join("api/v2/users/me/")?;
        let res = self.authed(self.http.get(url)).send().await?;
        check(res).await?;
        Ok(())
    }
}
