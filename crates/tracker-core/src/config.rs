use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracker_client::ClientConfig;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3000;
pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const DEFAULT_ADVANCE_DELAY_MS: u64 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    /// Status poll cadence
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Cadence of the pull-request status watcher
    #[serde(default = "default_poll_interval_ms")]
    pub pr_poll_interval_ms: u64,
    /// Layers requested per page
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Pause between a slice completing and switching to the next one
    #[serde(default = "default_advance_delay_ms")]
    pub advance_delay_ms: u64,
    /// Max characters of tool parameters shown in reconstructed timeline rows
    #[serde(default = "default_activity_preview_chars")]
    pub activity_preview_chars: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Directory for the file-backed session cache; `None` keeps the cache in memory
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000/api".to_string()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_advance_delay_ms() -> u64 {
    DEFAULT_ADVANCE_DELAY_MS
}

fn default_activity_preview_chars() -> usize {
    80
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_token: None,
            poll_interval_ms: default_poll_interval_ms(),
            pr_poll_interval_ms: default_poll_interval_ms(),
            page_size: default_page_size(),
            advance_delay_ms: default_advance_delay_ms(),
            activity_preview_chars: default_activity_preview_chars(),
            request_timeout_ms: default_request_timeout_ms(),
            cache_dir: None,
        }
    }
}

impl EngineConfig {
    /// Defaults, then the JSON file at `path` (if readable), then `TRACKER_*` environment
    /// variables. Unreadable or malformed layers are skipped.
    pub fn load(path: Option<&Path>) -> Self {
        let file_layer = path.map(read_json_file).unwrap_or_else(empty_object);
        Self::from_layers(&file_layer, &env_layer())
    }

    fn from_layers(file_layer: &Value, env: &Value) -> Self {
        let mut merged = serde_json::to_value(Self::default()).unwrap_or_else(|_| empty_object());
        deep_merge(&mut merged, file_layer);
        deep_merge(&mut merged, env);
        match serde_json::from_value::<EngineConfig>(merged) {
            Ok(config) => config.normalized(),
            Err(e) => {
                tracing::warn!("Ignoring invalid tracker config: {}", e);
                Self::default()
            }
        }
    }

    fn normalized(mut self) -> Self {
        if self.page_size == 0 {
            self.page_size = DEFAULT_PAGE_SIZE;
        }
        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = DEFAULT_POLL_INTERVAL_MS;
        }
        if self.pr_poll_interval_ms == 0 {
            self.pr_poll_interval_ms = self.poll_interval_ms;
        }
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn pr_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pr_poll_interval_ms)
    }

    pub fn advance_delay(&self) -> Duration {
        Duration::from_millis(self.advance_delay_ms)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.base_url.clone(),
            api_token: self.api_token.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn resolved_cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|dir| dir.join("codegen-tracker").join("cache")))
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn read_json_file(path: &Path) -> Value {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return empty_object();
    };
    serde_json::from_str::<Value>(&raw).unwrap_or_else(|e| {
        tracing::warn!("Failed to parse config {}: {}", path.display(), e);
        empty_object()
    })
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(url) = non_empty("TRACKER_BASE_URL") {
        deep_merge(&mut root, &json!({ "base_url": url.trim() }));
    }
    if let Some(token) = non_empty("TRACKER_API_TOKEN") {
        deep_merge(&mut root, &json!({ "api_token": token.trim() }));
    }
    if let Some(dir) = non_empty("TRACKER_CACHE_DIR") {
        deep_merge(&mut root, &json!({ "cache_dir": dir.trim() }));
    }
    for (var, field) in [
        ("TRACKER_POLL_INTERVAL_MS", "poll_interval_ms"),
        ("TRACKER_PR_POLL_INTERVAL_MS", "pr_poll_interval_ms"),
        ("TRACKER_ADVANCE_DELAY_MS", "advance_delay_ms"),
        ("TRACKER_REQUEST_TIMEOUT_MS", "request_timeout_ms"),
    ] {
        if let Some(ms) = non_empty(var).and_then(|v| v.trim().parse::<u64>().ok()) {
            let mut patch = Map::new();
            patch.insert(field.to_string(), json!(ms));
            deep_merge(&mut root, &Value::Object(patch));
        }
    }
    if let Some(size) = non_empty("TRACKER_PAGE_SIZE").and_then(|v| v.trim().parse::<u32>().ok())
    {
        deep_merge(&mut root, &json!({ "page_size": size }));
    }

    root
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
