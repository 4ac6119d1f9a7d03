use crate::errors::CoreError;
use crate::http::build_client;
use crate::models::ImagePayload;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::warn;

/// Outcome of resolving the submitted images: stable references for the
/// product record, plus the primary photo's bytes when they could be
/// obtained. Pricing runs without them if not.
#[derive(Debug)]
pub struct ResolvedImages {
    pub refs: Vec<String>,
    pub primary: Option<Vec<u8>>,
}

/// Turns submitted image payloads into stable references. Inline uploads are
/// content-addressed so resubmitting the same photo yields the same ref;
/// URLs pass through after scheme validation.
#[derive(Clone)]
pub struct MediaStore {
    http: Client,
}

impl MediaStore {
    pub fn new() -> Self {
        Self {
            http: build_client(),
        }
    }

    pub async fn resolve(&self, payloads: &[ImagePayload]) -> Result<ResolvedImages, CoreError> {
        if payloads.is_empty() {
            return Err(CoreError::validation("at least one image is required"));
        }
        if payloads.len() > max_images_allowed() {
            return Err(CoreError::validation(format!(
                "too many images: limit is {}",
                max_images_allowed()
            )));
        }

        let mut refs = Vec::with_capacity(payloads.len());
        let mut primary: Option<Vec<u8>> = None;
        for payload in payloads {
            match payload {
                ImagePayload::Url(url) => {
                    validate_image_url(url)?;
                    if primary.is_none() && refs.is_empty() {
                        primary = self.fetch_primary(url).await;
                    }
                    refs.push(url.clone());
                }
                ImagePayload::Inline { data, content_type } => {
                    let bytes = BASE64.decode(data.trim()).map_err(|err| {
                        CoreError::validation(format!("image is not valid base64: {err}"))
                    })?;
                    if bytes.is_empty() {
                        return Err(CoreError::validation("image payload is empty"));
                    }
                    refs.push(content_ref(&bytes, content_type.as_deref()));
                    if primary.is_none() && refs.len() == 1 {
                        primary = Some(bytes);
                    }
                }
            }
        }

        Ok(ResolvedImages { refs, primary })
    }

    /// Best effort fetch of the first image so URL-only submissions still get
    /// vision signals. A failure here is logged and pricing proceeds on the
    /// declared attributes alone.
    async fn fetch_primary(&self, url: &str) -> Option<Vec<u8>> {
        let response = match self.http.get(url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(
                    target = "restitch.media",
                    url,
                    status = %response.status(),
                    "primary image fetch failed"
                );
                return None;
            }
            Err(err) => {
                warn!(
                    target = "restitch.media",
                    url,
                    error = %err,
                    "primary image fetch failed"
                );
                return None;
            }
        };
        match response.bytes().await {
            Ok(bytes) => Some(bytes.to_vec()),
            Err(err) => {
                warn!(
                    target = "restitch.media",
                    url,
                    error = %err,
                    "primary image body unreadable"
                );
                None
            }
        }
    }
}

impl Default for MediaStore {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_image_url(url: &str) -> Result<(), CoreError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|_| CoreError::validation(format!("invalid image url: {url}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(CoreError::validation(format!(
            "unsupported url scheme: {url}"
        )));
    }
    Ok(())
}

fn content_ref(bytes: &[u8], content_type: Option<&str>) -> String {
    let digest = Sha256::digest(bytes);
    let short = hex::encode(&digest[..8]);
    let ext = match content_type {
        Some("image/jpeg") | Some("image/jpg") => "jpg",
        Some("image/png") => "png",
        Some("image/webp") => "webp",
        _ => "bin",
    };
    format!("media/sha256-{short}.{ext}")
}

fn max_images_allowed() -> usize {
    std::env::var("MAX_IMAGES")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value >= 1)
        .unwrap_or(8)
}
