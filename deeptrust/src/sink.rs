// deeptrust/src/sink.rs
//
// Append-only JSONL output for queued jobs.
//
//   reports.jsonl    - one ApiResponse per completed job (tagged with job_id)
//   failures.jsonl   - InvalidMedia / PipelineTimeout / Cancelled, one per job
//   audit_log.jsonl  - full AnalysisResult, including per-model timings
//
// Wire these files to the result transport / persistence layer in production.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::analysis::AnalysisResult;
use crate::error::PipelineError;
use crate::report::ApiResponse;

#[derive(Serialize)]
struct ReportLine<'a> {
    job_id: &'a str,
    #[serde(flatten)]
    response: &'a ApiResponse,
}

#[derive(Serialize)]
struct FailureLine<'a> {
    job_id:    &'a str,
    path:      &'a Path,
    error:     &'static str,
    message:   String,
    timestamp: DateTime<Utc>,
}

pub struct ReportSink {
    out: PathBuf,
}

impl ReportSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let out: PathBuf = output_dir.into();
        std::fs::create_dir_all(&out)?;
        Ok(Self { out })
    }

    pub fn dir(&self) -> &Path {
        &self.out
    }

    pub async fn record_result(&self, job_id: &str, result: &AnalysisResult) -> Result<ApiResponse> {
        let response = ApiResponse::from(result);
        let line = serde_json::to_string(&ReportLine { job_id, response: &response })? + "\n";
        self.write("reports.jsonl", &line).await?;
        self.write("audit_log.jsonl", &(result.to_jsonl() + "\n")).await?;
        Ok(response)
    }

    pub async fn record_failure(&self, job_id: &str, path: &Path, err: &PipelineError) -> Result<()> {
        let line = FailureLine {
            job_id,
            path,
            error:     err.code(),
            message:   err.to_string(),
            timestamp: Utc::now(),
        };
        self.write("failures.jsonl", &(serde_json::to_string(&line)? + "\n")).await?;
        info!("JOB_FAILED job={} code={} path={}", job_id, err.code(), path.display());
        Ok(())
    }

    async fn write(&self, file: &str, content: &str) -> Result<()> {
        let mut f = OpenOptions::new().create(true).append(true)
            .open(self.out.join(file)).await?;
        f.write_all(content.as_bytes()).await?;
        Ok(())
    }
}
