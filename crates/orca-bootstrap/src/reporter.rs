//! Streams bootstrap output to the orchestrator.

use async_trait::async_trait;
use chrono::Utc;
use orca_protocol::{BootstrapLogChunk, BootstrapRunMetadata};
use orca_runner::{ChunkRejected, ChunkSink};
use tracing::{debug, warn};

use crate::BootstrapApi;

const CHEF_BANNERS: [&str; 2] = ["Chef Infra Client, version ", "Chef Client, version "];
const ANSIBLE_BANNER: &str = "ansible-playbook ";

/// Uploads each chunk together with the run metadata of one policyfile.
/// An upload failure rejects the chunk, which aborts the policyfile's run.
pub struct BootstrapLogReporter<'a, A: ?Sized> {
    api: &'a A,
    metadata: BootstrapRunMetadata,
    chunks_sent: usize,
}

impl<'a, A: BootstrapApi + ?Sized> BootstrapLogReporter<'a, A> {
    pub fn new(api: &'a A, metadata: BootstrapRunMetadata) -> Self {
        Self {
            api,
            metadata,
            chunks_sent: 0,
        }
    }

    pub fn cms_version(&self) -> Option<&str> {
        self.metadata.cms_version.as_deref()
    }

    pub fn chunks_sent(&self) -> usize {
        self.chunks_sent
    }
}

#[async_trait]
impl<'a, A: BootstrapApi + ?Sized> ChunkSink for BootstrapLogReporter<'a, A> {
    async fn deliver(&mut self, chunk: String) -> Result<(), ChunkRejected> {
        if self.metadata.cms_version.is_none() {
            if let Some(version) = detect_cms_version(&chunk) {
                debug!(policyfile = %self.metadata.policyfile_id, %version, "detected cms version");
                self.metadata.cms_version = Some(version);
            }
        }

        let payload = BootstrapLogChunk {
            stdout: chunk,
            metadata: self.metadata.clone(),
            reported_at: Utc::now(),
        };
        if let Err(err) = self.api.report_bootstrap_log_chunk(&payload).await {
            warn!(
                policyfile = %self.metadata.policyfile_id,
                error = %err,
                "failed to upload bootstrap log chunk"
            );
            return Err(ChunkRejected(err.to_string()));
        }
        self.chunks_sent += 1;
        Ok(())
    }
}

/// Finds the tool version in a Chef or Ansible start-up banner.
pub fn detect_cms_version(output: &str) -> Option<String> {
    for line in output.lines() {
        for banner in CHEF_BANNERS {
            if let Some(idx) = line.find(banner) {
                if let Some(version) = first_token(&line[idx + banner.len()..]) {
                    return Some(version);
                }
            }
        }

        if let Some(rest) = line.trim_start().strip_prefix(ANSIBLE_BANNER) {
            let rest = rest.trim_start();
            let rest = rest.strip_prefix("[core ").unwrap_or(rest);
            if let Some(version) = first_token(rest) {
                if version.starts_with(|c: char| c.is_ascii_digit()) {
                    return Some(version);
                }
            }
        }
    }
    None
}

fn first_token(text: &str) -> Option<String> {
    let token = text
        .split_whitespace()
        .next()?
        .trim_end_matches([',', ']']);
    (!token.is_empty()).then(|| token.to_string())
}
