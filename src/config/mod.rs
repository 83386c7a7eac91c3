// SPDX-License-Identifier: MIT

use serde::Deserialize;
use std::path::Path;
use tracing::error;

const DEFAULT_CACHE_SIZE: usize = 256;
const DEFAULT_HANDLE_TTL_SECS: u64 = 600;
const DEFAULT_CN_BATCH: u64 = 512;
const DEFAULT_FOLDER_EID_RANGE: u64 = 0x1_0000;
const DEFAULT_MAX_RULE_RECIPIENTS: usize = 128;
const DEFAULT_NAMED_PROP_NAME_LIMIT: usize = 128;
const DEFAULT_MAX_FAI_SCAN: usize = 1024;
const DEFAULT_BATCH_THRESHOLD: usize = 20;

/// `{base_dir}/exmstore.toml` — all fields are optional overrides.
/// Priority: explicit constructor args  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Maximum number of mailbox DB handles kept open (default: 256).
    cache_size: Option<usize>,
    /// Seconds an idle handle survives before the janitor evicts it (default: 600).
    handle_ttl_secs: Option<u64>,
    /// Change numbers reserved per allocation round trip (default: 512).
    cn_batch: Option<u64>,
    /// EIDs reserved per folder for adjacent allocation (default: 65536).
    folder_eid_range: Option<u64>,
    /// Hard cap on FORWARD/DELEGATE rule recipients (default: 128).
    max_rule_recipients: Option<usize>,
    /// Byte cap on named-property names (default: 128).
    named_prop_name_limit: Option<usize>,
    /// FAI messages scanned when loading extended rules (default: 1024).
    max_fai_scan: Option<usize>,
    /// Batch size at which multi-message ops switch to one transaction (default: 20).
    batch_threshold: Option<usize>,
}

fn load_toml(base_dir: &Path) -> Option<TomlConfig> {
    let path = base_dir.join("exmstore.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse exmstore.toml — using defaults");
            None
        }
    }
}

/// Engine-wide tunables. Mailbox directories are passed per call; this only
/// carries behavior knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cache_size: usize,
    pub handle_ttl_secs: u64,
    pub cn_batch: u64,
    pub folder_eid_range: u64,
    pub max_rule_recipients: usize,
    pub named_prop_name_limit: usize,
    pub max_fai_scan: usize,
    pub batch_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            cache_size: DEFAULT_CACHE_SIZE,
            handle_ttl_secs: DEFAULT_HANDLE_TTL_SECS,
            cn_batch: DEFAULT_CN_BATCH,
            folder_eid_range: DEFAULT_FOLDER_EID_RANGE,
            max_rule_recipients: DEFAULT_MAX_RULE_RECIPIENTS,
            named_prop_name_limit: DEFAULT_NAMED_PROP_NAME_LIMIT,
            max_fai_scan: DEFAULT_MAX_FAI_SCAN,
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `{base_dir}/exmstore.toml` if present.
    pub fn load(base_dir: &Path) -> Self {
        let mut cfg = EngineConfig::default();
        let Some(toml_cfg) = load_toml(base_dir) else {
            return cfg;
        };
        if let Some(v) = toml_cfg.cache_size {
            cfg.cache_size = v.max(1);
        }
        if let Some(v) = toml_cfg.handle_ttl_secs {
            cfg.handle_ttl_secs = v;
        }
        if let Some(v) = toml_cfg.cn_batch {
            cfg.cn_batch = v.clamp(1, 0x10000);
        }
        if let Some(v) = toml_cfg.folder_eid_range {
            cfg.folder_eid_range = v.max(0x100);
        }
        if let Some(v) = toml_cfg.max_rule_recipients {
            cfg.max_rule_recipients = v;
        }
        if let Some(v) = toml_cfg.named_prop_name_limit {
            cfg.named_prop_name_limit = v;
        }
        if let Some(v) = toml_cfg.max_fai_scan {
            cfg.max_fai_scan = v;
        }
        if let Some(v) = toml_cfg.batch_threshold {
            cfg.batch_threshold = v.max(1);
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig::load(dir.path());
        assert_eq!(cfg.cache_size, DEFAULT_CACHE_SIZE);
        assert_eq!(cfg.max_rule_recipients, 128);
    }

    #[test]
    fn test_toml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("exmstore.toml"),
            "cache_size = 8\ncn_batch = 64\n",
        )
        .unwrap();
        let cfg = EngineConfig::load(dir.path());
        assert_eq!(cfg.cache_size, 8);
        assert_eq!(cfg.cn_batch, 64);
        assert_eq!(cfg.handle_ttl_secs, DEFAULT_HANDLE_TTL_SECS);
    }
}
