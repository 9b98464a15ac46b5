//! Generated-image handling: detect images in the last assistant turn,
//! download them through the page's own fetch (the CDN requires the
//! session's cookies), and persist them under the images directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use cdp_bridge::PageDriver;

use crate::models::ImageInfo;
use crate::upload::split_data_url;

/// Collects candidate images from the last assistant turn. Matches the
/// explicit generated-image markers first, then falls back to large CDN
/// images; duplicates by URL are dropped. The prompt title, when the app
/// renders one, appears after a bullet in the enclosing figure's text.
const DETECT_IMAGES_JS: &str = r#"(() => {
  const articles = document.querySelectorAll('article');
  if (!articles.length) return [];
  const last = articles[articles.length - 1];
  const found = [];
  const push = (img) => {
    if (!img || !img.src) return;
    if (found.some((f) => f.url === img.src)) return;
    let title = '';
    const scope = img.closest('figure, div');
    const label = scope ? (scope.innerText || '') : '';
    const bullet = label.split('•');
    if (bullet.length > 1) title = bullet[1].trim().split('\n')[0];
    found.push({ url: img.src, alt: img.alt || '', title });
  };
  last.querySelectorAll('img[alt="Generated image"]').forEach(push);
  last.querySelectorAll('div[id^="image-"] img').forEach(push);
  for (const img of last.querySelectorAll('img')) {
    if (img.src.includes('backend-api/estuary') && img.naturalWidth > 256) push(img);
  }
  return found;
})()"#;

/// Text of the last turn with image-chrome labels stripped, used instead of
/// the plain extraction path when a turn carries images.
const IMAGE_TURN_TEXT_JS: &str = r#"(() => {
  const articles = document.querySelectorAll('article');
  if (!articles.length) return '';
  let text = articles[articles.length - 1].innerText || '';
  for (const noise of ['ChatGPT said:', 'Generated image', 'Copy image']) {
    text = text.split(noise).join('');
  }
  return text.trim();
})()"#;

#[derive(Debug, Deserialize)]
struct DetectedImage {
    url: String,
    #[serde(default)]
    alt: String,
    #[serde(default)]
    title: String,
}

pub struct ImageExtractor {
    driver: Arc<dyn PageDriver>,
    images_dir: PathBuf,
}

impl ImageExtractor {
    pub fn new(driver: Arc<dyn PageDriver>, images_dir: PathBuf) -> Self {
        Self { driver, images_dir }
    }

    /// Detect and download images in the last assistant turn. Download
    /// failures keep the entry with `local_path: None`; detection failures
    /// read as an empty turn.
    pub async fn extract(&self) -> Vec<ImageInfo> {
        let detected: Vec<DetectedImage> = match self.driver.evaluate(DETECT_IMAGES_JS).await {
            Ok(value) => serde_json::from_value(value).unwrap_or_default(),
            Err(err) => {
                debug!(target: "images", %err, "image detection failed");
                return Vec::new();
            }
        };

        let mut images = Vec::with_capacity(detected.len());
        for item in detected {
            let local_path = match self.download(&item).await {
                Ok(path) => Some(path),
                Err(reason) => {
                    warn!(target: "images", url = %item.url, %reason, "image download failed");
                    None
                }
            };
            images.push(ImageInfo {
                url: item.url,
                alt: item.alt,
                prompt_title: item.title,
                local_path,
            });
        }
        images
    }

    async fn download(&self, item: &DetectedImage) -> Result<PathBuf, String> {
        let data_url = self
            .driver
            .fetch_as_data_url(&item.url)
            .await
            .map_err(|e| e.to_string())?;
        let (mime, payload) = split_data_url(&data_url)?;
        let bytes = BASE64
            .decode(payload)
            .map_err(|e| format!("base64 decode failed: {e}"))?;

        std::fs::create_dir_all(&self.images_dir)
            .map_err(|e| format!("images dir unavailable: {e}"))?;

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let hint = title_hint(&item.title, &item.alt);
        let path = self
            .images_dir
            .join(format!("{hint}-{stamp}.{}", ext_for_image_mime(&mime)));
        std::fs::write(&path, bytes).map_err(|e| format!("write failed: {e}"))?;
        debug!(target: "images", path = %path.display(), "saved generated image");
        Ok(path)
    }

    /// Text extraction variant for image-bearing turns.
    pub async fn image_turn_text(&self) -> String {
        match self.driver.evaluate(IMAGE_TURN_TEXT_JS).await {
            Ok(Value::String(text)) => text,
            _ => String::new(),
        }
    }
}

fn ext_for_image_mime(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

fn title_hint(title: &str, alt: &str) -> String {
    let raw = if !title.is_empty() { title } else { alt };
    let cleaned: String = raw
        .chars()
        .take(40)
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "image".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cdp_bridge::{BridgeError, BridgeErrorKind, PageEvent};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct ImagePage {
        detected: Value,
        fetch_ok: bool,
        bus: broadcast::Sender<PageEvent>,
    }

    impl ImagePage {
        fn new(detected: Value, fetch_ok: bool) -> Self {
            let (bus, _) = broadcast::channel(4);
            Self {
                detected,
                fetch_ok,
                bus,
            }
        }
    }

    #[async_trait]
    impl PageDriver for ImagePage {
        async fn navigate(&self, _url: &str, _deadline: Duration) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn evaluate(&self, expr: &str) -> Result<Value, BridgeError> {
            if expr.contains("found.push") {
                Ok(self.detected.clone())
            } else {
                Ok(Value::String("a cat\n".into()))
            }
        }
        async fn click(&self, _selector: &str, _deadline: Duration) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn insert_text(&self, _selector: &str, _text: &str) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn press_key(&self, _key: &str) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn read_text(&self, _selector: &str) -> Result<String, BridgeError> {
            Ok(String::new())
        }
        async fn query_visible(&self, _selector: &str) -> Result<bool, BridgeError> {
            Ok(false)
        }
        async fn set_input_files(
            &self,
            _selector: &str,
            _paths: &[String],
        ) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn fetch_as_data_url(&self, _url: &str) -> Result<String, BridgeError> {
            if self.fetch_ok {
                Ok("data:image/png;base64,aGVsbG8=".into())
            } else {
                Err(BridgeError::new(BridgeErrorKind::CdpIo))
            }
        }
        async fn current_url(&self) -> Result<String, BridgeError> {
            Ok("about:blank".into())
        }
        fn events(&self) -> broadcast::Receiver<PageEvent> {
            self.bus.subscribe()
        }
    }

    #[tokio::test]
    async fn downloads_detected_images() {
        let dir = tempfile::tempdir().unwrap();
        let page = ImagePage::new(
            json!([{ "url": "https://cdn.test/img1", "alt": "Generated image", "title": "A red fox" }]),
            true,
        );
        let extractor = ImageExtractor::new(Arc::new(page), dir.path().to_path_buf());

        let images = extractor.extract().await;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].prompt_title, "A red fox");
        let path = images[0].local_path.as_ref().unwrap();
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("a-red-fox-"));
        assert_eq!(std::fs::read(path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn failed_download_keeps_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let page = ImagePage::new(json!([{ "url": "https://cdn.test/img1" }]), false);
        let extractor = ImageExtractor::new(Arc::new(page), dir.path().to_path_buf());

        let images = extractor.extract().await;
        assert_eq!(images.len(), 1);
        assert!(images[0].local_path.is_none());
    }

    #[tokio::test]
    async fn empty_turn_detects_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let page = ImagePage::new(json!([]), true);
        let extractor = ImageExtractor::new(Arc::new(page), dir.path().to_path_buf());
        assert!(extractor.extract().await.is_empty());
    }

    #[test]
    fn title_hint_sanitizes() {
        assert_eq!(title_hint("A red fox!", ""), "a-red-fox");
        assert_eq!(title_hint("", ""), "image");
    }
}
