//! Model capability lookup and the cached remote model listing.
//!
//! Lookup is fail-open: an unregistered model id gets a permissive default
//! record rather than an error. The remote listing is split into a pure
//! fetch function and a disk-cache wrapper so the cache policy is testable
//! on its own.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use reqwest::Client;
use serde_json::json;

use crate::models::capability::ModelCapability;

/// How long a cached model listing is served before a refetch.
pub const CACHE_TTL_SECS: u64 = 30 * 60;

/// Passing this as the refresh argument bypasses the cache unconditionally.
pub const REFRESH_SENTINEL: &str = "refresh";

fn record(
    value: &str,
    title: &str,
    context: u32,
    max_tokens: u32,
    tool_use: bool,
    vision_enable: bool,
    thinking: bool,
) -> ModelCapability {
    ModelCapability {
        value: value.to_string(),
        title: title.to_string(),
        context,
        max_tokens,
        input_price: 0.0,
        output_price: 0.0,
        tool_use,
        vision_enable,
        audio_enable: false,
        image_generation: false,
        system_message_enable: true,
        thinking,
    }
}

lazy_static! {
    /// Compiled-in capability records for known model ids.
    pub static ref MODEL_TABLE: Vec<ModelCapability> = vec![
        record("gpt-4o", "GPT-4o", 128_000, 16_384, true, true, false),
        record("gpt-4o-mini", "GPT-4o mini", 128_000, 16_384, true, true, false),
        record("o3-mini", "o3-mini", 200_000, 100_000, true, false, true),
        record(
            "claude-sonnet-4-20250514",
            "Claude Sonnet 4",
            200_000,
            64_000,
            true,
            true,
            true,
        ),
        record(
            "claude-3-5-haiku-20241022",
            "Claude 3.5 Haiku",
            200_000,
            8_192,
            true,
            true,
            false,
        ),
        record("gemini-2.0-flash", "Gemini 2.0 Flash", 1_048_576, 8_192, true, true, false),
        record("gemini-1.5-pro", "Gemini 1.5 Pro", 2_097_152, 8_192, true, true, false),
        record("llama3.2", "Llama 3.2", 128_000, 4_096, true, false, false),
        record("qwen2.5", "Qwen 2.5", 128_000, 4_096, true, false, false),
    ];
}

/// The capability record for a model id, or the permissive fallback when the
/// id is not registered. Never errors.
pub fn lookup(model_id: &str) -> ModelCapability {
    MODEL_TABLE
        .iter()
        .find(|capability| capability.value == model_id)
        .cloned()
        .unwrap_or_else(|| ModelCapability::fallback(model_id))
}

/// Fetch a model listing from a remote endpoint returning either a bare JSON
/// array of capability records or `{"models": [...]}`. Pure with respect to
/// the cache: no disk side effects.
pub async fn fetch_model_list(client: &Client, url: &str) -> Result<Vec<ModelCapability>> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("model list fetch failed ({status}): {body}"));
    }
    let body: serde_json::Value = response.json().await?;
    let records = match &body {
        serde_json::Value::Array(_) => body.clone(),
        other => other.get("models").cloned().unwrap_or(json!([])),
    };
    Ok(serde_json::from_value(records)?)
}

/// Disk cache for the model listing. Writes are whole-file replace-on-success
/// (write to a sibling temp file, then rename); there is no locking, and
/// staleness is decided by the file's modification timestamp.
pub struct ModelListCache {
    path: PathBuf,
    ttl: Duration,
}

impl ModelListCache {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        ModelListCache {
            path: path.into(),
            ttl: Duration::from_secs(CACHE_TTL_SECS),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// The conventional cache location under the user cache directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("omnichat").join("models.json"))
    }

    fn is_fresh(&self) -> bool {
        let Ok(modified) = std::fs::metadata(&self.path).and_then(|meta| meta.modified()) else {
            return false;
        };
        match SystemTime::now().duration_since(modified) {
            Ok(age) => age <= self.ttl,
            // Clock moved backwards; treat the file as fresh.
            Err(_) => true,
        }
    }

    /// Read the cached listing regardless of freshness. Unreadable or
    /// undecodable files count as absent.
    pub fn read(&self) -> Option<Vec<ModelCapability>> {
        let bytes = std::fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Replace the cache contents atomically.
    pub fn write(&self, records: &[ModelCapability]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let staging = self.path.with_extension("tmp");
        std::fs::write(&staging, serde_json::to_vec(records)?)?;
        std::fs::rename(&staging, &self.path)?;
        Ok(())
    }

    /// The cached listing if fresh, otherwise the result of `fetch`, written
    /// back on success. `refresh = Some("refresh")` bypasses the cache. When
    /// the fetch fails and any cached copy exists, the stale copy is served
    /// with a warning instead of the error.
    pub async fn get_list<F, Fut>(
        &self,
        refresh: Option<&str>,
        fetch: F,
    ) -> Result<Vec<ModelCapability>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<ModelCapability>>>,
    {
        let force = refresh == Some(REFRESH_SENTINEL);
        if !force && self.is_fresh() {
            if let Some(records) = self.read() {
                return Ok(records);
            }
        }

        match fetch().await {
            Ok(records) => {
                if let Err(error) = self.write(&records) {
                    tracing::warn!("could not write model list cache: {error}");
                }
                Ok(records)
            }
            Err(error) => match self.read() {
                Some(records) => {
                    tracing::warn!("model list fetch failed, serving stale cache: {error}");
                    Ok(records)
                }
                None => Err(error),
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
