//! Attachment staging and upload.
//!
//! Callers hand attachments in whatever form the API accepted (data URLs,
//! raw base64, remote URLs, local paths); everything is materialized into
//! the staging directory first, then attached to the page's file input in
//! one batch. A failing item is recorded and skipped, never aborting the
//! batch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cdp_bridge::PageDriver;
use chatrelay_selectors::{LogicalElement, SelectorResolver};

use crate::config::RelayConfig;
use crate::errors::{RelayError, RelayResult};
use crate::models::UploadFailure;

/// One attachment as supplied by the caller.
#[derive(Clone, Debug)]
pub enum AttachmentSource {
    /// `data:<mime>;base64,<payload>`
    DataUrl(String),
    /// Raw base64 with out-of-band metadata (API file parts).
    Base64 {
        data: String,
        mime: String,
        filename: Option<String>,
    },
    /// Remote resource, fetched server-side.
    Url(String),
    /// Already on local disk; used as-is.
    LocalPath(PathBuf),
}

impl AttachmentSource {
    /// Classify a bare string the way the API layer receives them.
    pub fn classify(raw: &str) -> Self {
        if raw.starts_with("data:") {
            AttachmentSource::DataUrl(raw.to_string())
        } else if raw.starts_with("http://") || raw.starts_with("https://") {
            AttachmentSource::Url(raw.to_string())
        } else {
            AttachmentSource::LocalPath(PathBuf::from(raw))
        }
    }

    /// Short label for failure reports.
    fn label(&self) -> String {
        match self {
            AttachmentSource::DataUrl(d) => format!("data-url ({} bytes)", d.len()),
            AttachmentSource::Base64 { filename, mime, .. } => filename
                .clone()
                .unwrap_or_else(|| format!("base64 ({mime})")),
            AttachmentSource::Url(u) => u.clone(),
            AttachmentSource::LocalPath(p) => p.display().to_string(),
        }
    }
}

/// Result of staging a batch: what made it to disk and what did not.
#[derive(Debug, Default)]
pub struct StagedUpload {
    pub staged: Vec<PathBuf>,
    pub failures: Vec<UploadFailure>,
}

pub struct UploadPipeline {
    staging_dir: PathBuf,
    http: reqwest::Client,
    selector_timeout: Duration,
    settle_base: Duration,
    settle_per_file: Duration,
}

impl UploadPipeline {
    pub fn new(cfg: &RelayConfig) -> Self {
        Self {
            staging_dir: cfg.staging_dir.clone(),
            http: reqwest::Client::new(),
            selector_timeout: Duration::from_millis(cfg.selector_timeout_ms),
            settle_base: Duration::from_millis(cfg.upload_settle_base_ms),
            settle_per_file: Duration::from_millis(cfg.upload_settle_per_file_ms),
        }
    }

    /// Materialize every source into the staging directory. Per-item
    /// failures are collected, not propagated.
    pub async fn stage(&self, sources: &[AttachmentSource]) -> StagedUpload {
        let mut out = StagedUpload::default();
        for source in sources {
            match self.stage_one(source).await {
                Ok(path) => {
                    debug!(target: "upload", path = %path.display(), "staged attachment");
                    out.staged.push(path);
                }
                Err(reason) => {
                    warn!(target: "upload", source = %source.label(), %reason, "attachment failed to stage");
                    out.failures.push(UploadFailure {
                        source: source.label(),
                        reason,
                    });
                }
            }
        }
        out
    }

    async fn stage_one(&self, source: &AttachmentSource) -> Result<PathBuf, String> {
        match source {
            AttachmentSource::DataUrl(raw) => {
                let (mime, payload) = split_data_url(raw)?;
                let bytes = BASE64
                    .decode(payload)
                    .map_err(|e| format!("base64 decode failed: {e}"))?;
                self.write_staged(&bytes, ext_for_mime(&mime), None)
            }
            AttachmentSource::Base64 {
                data,
                mime,
                filename,
            } => {
                let bytes = BASE64
                    .decode(data.trim())
                    .map_err(|e| format!("base64 decode failed: {e}"))?;
                self.write_staged(&bytes, ext_for_mime(mime), filename.as_deref())
            }
            AttachmentSource::Url(url) => {
                let resp = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| format!("fetch failed: {e}"))?;
                if !resp.status().is_success() {
                    return Err(format!("fetch returned {}", resp.status()));
                }
                let mime = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
                let ext = mime
                    .as_deref()
                    .map(ext_for_mime)
                    .or_else(|| ext_from_url(url))
                    .unwrap_or("bin");
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| format!("body read failed: {e}"))?;
                self.write_staged(&bytes, ext, None)
            }
            AttachmentSource::LocalPath(path) => {
                if path.is_file() {
                    Ok(path.clone())
                } else {
                    Err(format!("no such file: {}", path.display()))
                }
            }
        }
    }

    fn write_staged(
        &self,
        bytes: &[u8],
        ext: &str,
        filename: Option<&str>,
    ) -> Result<PathBuf, String> {
        std::fs::create_dir_all(&self.staging_dir)
            .map_err(|e| format!("staging dir unavailable: {e}"))?;
        let name = match filename {
            Some(name) => format!("{}-{}", short_id(), sanitize_filename(name)),
            None => format!("{}.{ext}", short_id()),
        };
        let path = self.staging_dir.join(name);
        std::fs::write(&path, bytes).map_err(|e| format!("write failed: {e}"))?;
        Ok(path)
    }

    /// Attach staged files to the page's hidden file input in one batch and
    /// wait for the app to ingest them.
    pub async fn attach(
        &self,
        driver: &dyn PageDriver,
        resolver: &SelectorResolver,
        staged: &[PathBuf],
    ) -> RelayResult<()> {
        if staged.is_empty() {
            return Ok(());
        }
        // The file input is sometimes only rendered after the attach button
        // has been clicked.
        if let Ok(None) = resolver
            .resolve_now(driver, LogicalElement::FileUploadInput)
            .await
        {
            if let Ok(Some(button)) = resolver
                .resolve_now(driver, LogicalElement::AttachButton)
                .await
            {
                debug!(target: "upload", "clicking attach button to reveal file input");
                if let Err(err) = driver.click(&button, self.selector_timeout).await {
                    warn!(target: "upload", %err, "attach button click failed");
                }
            }
        }
        let selector = resolver
            .resolve(driver, LogicalElement::FileUploadInput, self.selector_timeout)
            .await?;

        let absolute: Result<Vec<String>, String> = staged
            .iter()
            .map(|p| {
                std::fs::canonicalize(p)
                    .map(|abs| abs.to_string_lossy().into_owned())
                    .map_err(|e| format!("{}: {e}", p.display()))
            })
            .collect();
        let paths = absolute.map_err(RelayError::Internal)?;

        driver.set_input_files(&selector, &paths).await?;

        let settle = self.settle_base + self.settle_per_file * staged.len() as u32;
        info!(target: "upload", files = staged.len(), settle_ms = settle.as_millis() as u64, "attached files, settling");
        tokio::time::sleep(settle).await;
        Ok(())
    }
}

pub(crate) fn split_data_url(raw: &str) -> Result<(String, &str), String> {
    let rest = raw
        .strip_prefix("data:")
        .ok_or_else(|| "not a data URL".to_string())?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| "data URL has no payload".to_string())?;
    if !meta.ends_with(";base64") {
        return Err("only base64 data URLs are supported".to_string());
    }
    let mime = meta.trim_end_matches(";base64");
    Ok((mime.to_string(), payload))
}

fn ext_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        "text/csv" => "csv",
        "application/json" => "json",
        "text/markdown" => "md",
        _ => "bin",
    }
}

fn ext_from_url(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next()?;
    let ext = Path::new(path).extension()?.to_str()?;
    (ext.len() <= 5).then_some(ext)
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(staging: &Path) -> UploadPipeline {
        let cfg = RelayConfig {
            staging_dir: staging.to_path_buf(),
            ..RelayConfig::default()
        };
        UploadPipeline::new(&cfg)
    }

    #[tokio::test]
    async fn stages_a_data_url() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        // "hello" as a png-flavored payload
        let source = AttachmentSource::DataUrl("data:image/png;base64,aGVsbG8=".into());
        let out = p.stage(&[source]).await;
        assert!(out.failures.is_empty());
        assert_eq!(out.staged.len(), 1);
        assert_eq!(out.staged[0].extension().unwrap(), "png");
        assert_eq!(std::fs::read(&out.staged[0]).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn one_bad_item_does_not_abort_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("notes.txt");
        std::fs::write(&local, "hi").unwrap();

        let p = pipeline(dir.path());
        let out = p
            .stage(&[
                AttachmentSource::Url("http://127.0.0.1:1/unreachable.png".into()),
                AttachmentSource::LocalPath(local.clone()),
            ])
            .await;
        assert_eq!(out.staged, vec![local]);
        assert_eq!(out.failures.len(), 1);
        assert!(out.failures[0].source.contains("unreachable.png"));
    }

    #[tokio::test]
    async fn missing_local_path_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let out = p
            .stage(&[AttachmentSource::LocalPath(dir.path().join("gone.pdf"))])
            .await;
        assert!(out.staged.is_empty());
        assert!(out.failures[0].reason.contains("no such file"));
    }

    #[test]
    fn classification_covers_all_forms() {
        assert!(matches!(
            AttachmentSource::classify("data:text/plain;base64,eA=="),
            AttachmentSource::DataUrl(_)
        ));
        assert!(matches!(
            AttachmentSource::classify("https://x.test/a.png"),
            AttachmentSource::Url(_)
        ));
        assert!(matches!(
            AttachmentSource::classify("./local/file.pdf"),
            AttachmentSource::LocalPath(_)
        ));
    }

    #[test]
    fn data_url_without_base64_marker_is_rejected() {
        assert!(split_data_url("data:text/plain,plain%20text").is_err());
    }
}
