use std::{
    collections::BTreeMap,
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use time::{UtcOffset, Weekday};

use crate::models::{
    AssetDescriptor, HostResolver, HttpAssetSource, SecondaryAsset, StaticHostResolver,
    SystemResolver, DEFAULT_SIZE_TOLERANCE_BYTES,
};
use crate::quota::{
    HttpDateTimeSource, QuotaPolicy, WeeklyBoundary, DEFAULT_MAX_REGULAR, DEFAULT_TIME_URL,
};

const CONFIG_FILE: &str = "config.json";
const STORE_FILE: &str = "gatekeeper-state.json";
const MODELS_DIR: &str = "ai_models";

pub const ENV_MODEL_BASE_URL: &str = "GATEKEEPER_MODEL_BASE_URL";
pub const ENV_DATA_DIR: &str = "GATEKEEPER_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct GatekeeperConfig {
    /// Overrides the platform data directory.
    pub data_dir: Option<PathBuf>,
    pub model: ModelSettings,
    pub quota: QuotaSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelSettings {
    pub display_name: String,
    pub version: String,
    pub base_url: String,
    pub object_key: String,
    pub file_name: String,
    pub expected_size_bytes: u64,
    pub size_tolerance_bytes: u64,
    pub sha256: Option<String>,
    pub secondary: Option<SecondaryAsset>,
    /// Hosts pinned to fixed addresses instead of system DNS. Empty by
    /// default, so every host goes through the system resolver.
    pub host_overrides: BTreeMap<String, IpAddr>,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            display_name: "LiquidAI LFM2".into(),
            version: "lfm2-1.2b-q4_0".into(),
            base_url: "https://cdn.emozleep.space/models".into(),
            object_key: "models/LFM2-1.2B-Q4_0.gguf".into(),
            file_name: "LFM2-1.2B-Q4_0.gguf".into(),
            expected_size_bytes: 695_749_568,
            size_tolerance_bytes: DEFAULT_SIZE_TOLERANCE_BYTES,
            sha256: None,
            secondary: None,
            host_overrides: BTreeMap::new(),
            connect_timeout_secs: 30,
            read_timeout_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct QuotaSettings {
    pub max_regular: u32,
    pub time_url: String,
    pub time_timeout_secs: u64,
    pub reset_weekday: String,
    pub reset_utc_offset_hours: i8,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            max_regular: DEFAULT_MAX_REGULAR,
            time_url: DEFAULT_TIME_URL.into(),
            time_timeout_secs: 5,
            reset_weekday: "monday".into(),
            reset_utc_offset_hours: 9,
        }
    }
}

impl GatekeeperConfig {
    /// Reads `config.json` from the platform config directory and applies
    /// environment overrides. A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = resolve_config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(path).with_context(|| format!("failed reading {path:?}"))?;
        serde_json::from_slice(&bytes).context("config json could not be parsed")
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create dir {parent:?}"))?;
        }
        let serialized =
            serde_json::to_vec_pretty(self).context("serialize config to json failed")?;
        fs::write(path, serialized).with_context(|| format!("write config to {path:?}"))?;
        Ok(())
    }

    pub(crate) fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base_url) = lookup(ENV_MODEL_BASE_URL).filter(|value| !value.is_empty()) {
            tracing::debug!(%base_url, "model base url overridden from environment");
            self.model.base_url = base_url;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|value| !value.is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        Ok(project_dirs()?.data_dir().to_path_buf())
    }

    pub fn store_path(&self) -> Result<PathBuf> {
        Ok(self.resolve_data_dir()?.join(STORE_FILE))
    }

    pub fn models_root(&self) -> Result<PathBuf> {
        Ok(self.resolve_data_dir()?.join(MODELS_DIR))
    }

    pub fn descriptor(&self) -> AssetDescriptor {
        let model = &self.model;
        AssetDescriptor {
            display_name: model.display_name.clone(),
            version: model.version.clone(),
            base_url: model.base_url.clone(),
            object_key: model.object_key.clone(),
            file_name: model.file_name.clone(),
            expected_size_bytes: model.expected_size_bytes,
            size_tolerance_bytes: model.size_tolerance_bytes,
            sha256: model.sha256.clone().filter(|digest| !digest.is_empty()),
            secondary: model
                .secondary
                .clone()
                .filter(|asset| !asset.object_key.is_empty() && !asset.file_name.is_empty()),
        }
    }

    pub fn resolver(&self) -> Arc<dyn HostResolver> {
        if self.model.host_overrides.is_empty() {
            Arc::new(SystemResolver)
        } else {
            Arc::new(StaticHostResolver::from_table(&self.model.host_overrides))
        }
    }

    pub fn asset_source(&self) -> HttpAssetSource {
        HttpAssetSource::new(self.resolver()).with_timeouts(
            Duration::from_secs(self.model.connect_timeout_secs),
            Duration::from_secs(self.model.read_timeout_secs),
        )
    }

    pub fn time_source(&self) -> HttpDateTimeSource {
        HttpDateTimeSource::new(
            self.quota.time_url.clone(),
            Duration::from_secs(self.quota.time_timeout_secs),
        )
    }

    pub fn policy(&self) -> Result<QuotaPolicy> {
        let weekday = parse_weekday(&self.quota.reset_weekday)?;
        let offset = UtcOffset::from_hms(self.quota.reset_utc_offset_hours, 0, 0)
            .with_context(|| {
                format!(
                    "invalid reset utc offset {} hours",
                    self.quota.reset_utc_offset_hours
                )
            })?;
        Ok(QuotaPolicy {
            max_regular: self.quota.max_regular,
            boundary: WeeklyBoundary::new(weekday, offset),
        })
    }
}

pub fn resolve_config_path() -> Result<PathBuf> {
    let dirs = project_dirs()?;
    let dir = dirs.config_dir();
    fs::create_dir_all(dir).context("creating config directory failed")?;
    Ok(dir.join(CONFIG_FILE))
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("space", "Emozleep", "WardrobeGatekeeper")
        .context("missing project directories")
}

fn parse_weekday(value: &str) -> Result<Weekday> {
    let weekday = match value.trim().to_ascii_lowercase().as_str() {
        "monday" | "mon" => Weekday::Monday,
        "tuesday" | "tue" => Weekday::Tuesday,
        "wednesday" | "wed" => Weekday::Wednesday,
        "thursday" | "thu" => Weekday::Thursday,
        "friday" | "fri" => Weekday::Friday,
        "saturday" | "sat" => Weekday::Saturday,
        "sunday" | "sun" => Weekday::Sunday,
        other => bail!("unknown reset weekday {other:?}"),
    };
    Ok(weekday)
}
