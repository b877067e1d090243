//! Filesystem permission mailbox.
//!
//! The executing side writes `request-<channel>.json` into the mailbox
//! directory and polls for `response-<channel>.json`. The deciding side polls
//! the directory, claims requests by deleting them, and answers with an
//! atomic write so the response file only ever appears complete.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use warden_core::permission::model::REASON_TIMEOUT;
use warden_core::permission::{
    InboundRequest, MailboxRequest, MailboxResponse, PermissionClient, PermissionMailbox,
};
use warden_core::{Result, WardenError};

use crate::storage::{read_json, remove_if_exists, write_json_atomic};

const REQUEST_PREFIX: &str = "request-";
const RESPONSE_PREFIX: &str = "response-";
const FILE_SUFFIX: &str = ".json";

/// Maps a channel id to a filename-safe stem.
pub fn channel_file_stem(channel_id: &str) -> String {
    channel_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn request_path(dir: &Path, channel_id: &str) -> PathBuf {
    dir.join(format!(
        "{REQUEST_PREFIX}{}{FILE_SUFFIX}",
        channel_file_stem(channel_id)
    ))
}

pub fn response_path(dir: &Path, channel_id: &str) -> PathBuf {
    dir.join(format!(
        "{RESPONSE_PREFIX}{}{FILE_SUFFIX}",
        channel_file_stem(channel_id)
    ))
}

/// Deciding side of the filesystem mailbox.
pub struct FsMailbox {
    dir: PathBuf,
    poll_interval: Duration,
    queue: Mutex<VecDeque<InboundRequest>>,
    closed: CancellationToken,
}

impl FsMailbox {
    /// Opens the mailbox, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        tracing::info!(
            "[FsMailbox] Watching {} every {:?}",
            dir.display(),
            poll_interval
        );
        Ok(Self {
            dir,
            poll_interval,
            queue: Mutex::new(VecDeque::new()),
            closed: CancellationToken::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stops delivering requests; pending `next_request` calls return `None`.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Claims every request file currently in the directory.
    async fn scan(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut found = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name
                .strip_prefix(REQUEST_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
            {
                found.push((stem.to_string(), entry.path()));
            }
        }
        found.sort();

        for (stem, path) in found {
            match read_json::<MailboxRequest>(&path).await {
                Ok(Some(request)) => {
                    remove_if_exists(&path).await?;
                    tracing::debug!(
                        "[FsMailbox] Claimed request {} for tool '{}' on channel {}",
                        request.request_id,
                        request.tool_name,
                        request.channel_id
                    );
                    self.queue
                        .lock()
                        .await
                        .push_back(InboundRequest::Request(request));
                }
                // Claimed by someone else between listing and reading.
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        "[FsMailbox] Unreadable request {}: {}",
                        path.display(),
                        e
                    );
                    remove_if_exists(&path).await?;
                    self.queue
                        .lock()
                        .await
                        .push_back(InboundRequest::Malformed {
                            channel_id: stem,
                            message: format!("Malformed permission request: {e}"),
                        });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PermissionMailbox for FsMailbox {
    async fn next_request(&self) -> Result<Option<InboundRequest>> {
        loop {
            if self.closed.is_cancelled() {
                return Ok(None);
            }
            if let Some(request) = self.queue.lock().await.pop_front() {
                return Ok(Some(request));
            }

            self.scan().await?;
            if !self.queue.lock().await.is_empty() {
                continue;
            }

            tokio::select! {
                _ = self.closed.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn respond(&self, response: MailboxResponse) -> Result<()> {
        let path = response_path(&self.dir, &response.channel_id);
        write_json_atomic(&path, &response).await.map_err(|e| {
            WardenError::mailbox(format!("Failed to write {}: {}", path.display(), e))
        })?;
        tracing::debug!(
            "[FsMailbox] Answered {} (allow={}) on channel {}",
            response.request_id,
            response.allow,
            response.channel_id
        );
        Ok(())
    }

    fn transport(&self) -> &'static str {
        "filesystem"
    }
}

/// Executing side of the filesystem mailbox.
#[derive(Debug, Clone)]
pub struct FsMailboxClient {
    dir: PathBuf,
    poll_interval: Duration,
}

impl FsMailboxClient {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
        }
    }
}

#[async_trait]
impl PermissionClient for FsMailboxClient {
    async fn request(
        &self,
        request: MailboxRequest,
        timeout: Duration,
    ) -> Result<MailboxResponse> {
        let request_file = request_path(&self.dir, &request.channel_id);
        let response_file = response_path(&self.dir, &request.channel_id);

        // A response left over from an interrupted turn must not answer this one.
        remove_if_exists(&response_file).await?;
        write_json_atomic(&request_file, &request).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match read_json::<MailboxResponse>(&response_file).await {
                Ok(Some(response)) => {
                    remove_if_exists(&response_file).await?;
                    if response.request_id.is_empty() || response.request_id == request.request_id
                    {
                        return Ok(response);
                    }
                    tracing::warn!(
                        "[FsMailboxClient] Discarding response for unrelated request {}",
                        response.request_id
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("[FsMailboxClient] Unreadable response: {}", e);
                    remove_if_exists(&response_file).await?;
                }
            }

            if tokio::time::Instant::now() >= deadline {
                remove_if_exists(&request_file).await?;
                tracing::warn!(
                    "[FsMailboxClient] No answer for {} within {:?}, denying",
                    request.request_id,
                    timeout
                );
                return Ok(MailboxResponse::deny(&request, REASON_TIMEOUT));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
