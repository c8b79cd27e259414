//! External collaborators C6 calls: job lifecycle and payload transfer on the inference
//! platform (§4.6). These are trait seams; the platform's actual wire protocol is out of scope
//! (§1) beyond the optional `reqwest`-backed implementation below.
use crate::types::{JobReceipt, Priority};
use camino::Utf8Path;

/// `createJob` / `startJob` (§4.6 steps 1 and 3).
#[async_trait::async_trait]
pub trait JobsService: Send + Sync {
    async fn create_job(
        &self,
        pipeline_id: &str,
        job_name: &str,
        priority: Priority,
    ) -> anyhow::Result<JobReceipt>;

    async fn start_job(&self, receipt: &JobReceipt) -> anyhow::Result<()>;
}

/// `uploadPayload` (§4.6 step 2).
#[async_trait::async_trait]
pub trait PayloadsService: Send + Sync {
    async fn upload_payload(&self, payload_id: &str, files: &[&Utf8Path]) -> anyhow::Result<()>;
}

#[cfg(feature = "reqwest-client")]
pub mod http {
    //! Concrete `reqwest`-based implementation of [`JobsService`]/[`PayloadsService`] against a
    //! JSON HTTP API, gated behind the `reqwest-client` feature (default-on).
    use super::*;
    use serde::{Deserialize, Serialize};

    pub struct HttpPlatformClient {
        base_url: String,
        client: reqwest::Client,
    }

    impl HttpPlatformClient {
        pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
            Self {
                base_url: base_url.into(),
                client,
            }
        }
    }

    #[derive(Serialize)]
    struct CreateJobRequest<'a> {
        pipeline_id: &'a str,
        job_name: &'a str,
        priority: Priority,
    }

    #[derive(Deserialize)]
    struct CreateJobResponse {
        job_id: String,
        payload_id: String,
    }

    #[async_trait::async_trait]
    impl JobsService for HttpPlatformClient {
        async fn create_job(
            &self,
            pipeline_id: &str,
            job_name: &str,
            priority: Priority,
        ) -> anyhow::Result<JobReceipt> {
            let url = format!("{}/jobs", self.base_url);
            let response = self
                .client
                .post(&url)
                .json(&CreateJobRequest {
                    pipeline_id,
                    job_name,
                    priority,
                })
                .send()
                .await?
                .error_for_status()?
                .json::<CreateJobResponse>()
                .await?;
            Ok(JobReceipt {
                job_id: response.job_id,
                payload_id: response.payload_id,
            })
        }

        async fn start_job(&self, receipt: &JobReceipt) -> anyhow::Result<()> {
            let url = format!("{}/jobs/{}/start", self.base_url, receipt.job_id);
            self.client.post(&url).send().await?.error_for_status()?;
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl PayloadsService for HttpPlatformClient {
        async fn upload_payload(&self, payload_id: &str, files: &[&Utf8Path]) -> anyhow::Result<()> {
            let url = format!("{}/payloads/{}/files", self.base_url, payload_id);
            for file in files {
                let bytes = fs_err::tokio::read(file).await?;
                let part = reqwest::multipart::Part::bytes(bytes)
                    .file_name(file.file_name().unwrap_or("instance.dcm").to_string());
                let form = reqwest::multipart::Form::new().part("file", part);
                self.client
                    .post(&url)
                    .multipart(form)
                    .send()
                    .await?
                    .error_for_status()?;
            }
            Ok(())
        }
    }
}

/// In-memory fakes used by integration tests (§10.4: fake collaborators for C6).
#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeJobsService {
        pub create_job_calls: AtomicUsize,
        pub always_fail_create_job: bool,
        pub created: Mutex<Vec<(String, String, Priority)>>,
    }

    #[async_trait::async_trait]
    impl JobsService for FakeJobsService {
        async fn create_job(
            &self,
            pipeline_id: &str,
            job_name: &str,
            priority: Priority,
        ) -> anyhow::Result<JobReceipt> {
            self.create_job_calls.fetch_add(1, Ordering::SeqCst);
            if self.always_fail_create_job {
                anyhow::bail!("simulated createJob failure");
            }
            self.created
                .lock()
                .unwrap()
                .push((pipeline_id.to_string(), job_name.to_string(), priority));
            Ok(JobReceipt {
                job_id: format!("job-{}", job_name),
                payload_id: format!("payload-{}", job_name),
            })
        }

        async fn start_job(&self, _receipt: &JobReceipt) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakePayloadsService {
        pub uploads: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait::async_trait]
    impl PayloadsService for FakePayloadsService {
        async fn upload_payload(&self, payload_id: &str, files: &[&Utf8Path]) -> anyhow::Result<()> {
            self.uploads
                .lock()
                .unwrap()
                .push((payload_id.to_string(), files.len()));
            Ok(())
        }
    }
}
