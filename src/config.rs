//! Layered runtime configuration (§6.5, §6.6).
//!
//! Precedence, lowest to highest: built-in defaults, `.devteam/runner.toml`,
//! process environment, CLI flags. Each layer only overrides fields it
//! actually sets — the TOML layer is an all-optional struct merged over
//! `RunnerConfig::default()`, mirroring the teacher's
//! `SandboxConfig::load`/`SandboxToml` merge pattern.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Fully resolved configuration used by every subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// `GLOBAL_CONCURRENCY` — max concurrent executions across projects.
    pub global_concurrency: usize,
    /// `CONTAINER_CPU` — vCPUs granted to each project's container.
    pub container_cpu: f64,
    /// `CONTAINER_MEM_MIB` — memory granted to each project's container.
    pub container_mem_mib: u64,
    /// `CACHE_TTL_DAYS` — repo cache eviction age.
    pub cache_ttl_days: u32,
    /// `CACHE_SWEEP_CRON` — cron expression for the eviction sweep.
    pub cache_sweep_cron: String,
    /// `IDEMPOTENCY_TTL_HOURS` — event dedup window.
    pub idempotency_ttl_hours: u32,
    /// `VERIFY_TIMEOUT_SECONDS` — total VERIFY budget including retries.
    pub verify_timeout_seconds: u64,
    /// `IMPLEMENT_TIMEOUT_SECONDS`.
    pub implement_timeout_seconds: u64,
    /// `PREP_TIMEOUT_SECONDS`.
    pub prep_timeout_seconds: u64,
    /// `WS_MAX_FRAME_BYTES` — oversize frames are dropped, not truncated.
    pub ws_max_frame_bytes: usize,
    /// `WS_COALESCE_MS` — bursty log coalescing window.
    pub ws_coalesce_ms: u64,
    /// `TOOL_BINARY_PATH` — absolute path inside the container to the
    /// code-change tool. No default: a missing value is only an error once
    /// the Code-Change Executor actually needs it.
    pub tool_binary_path: Option<String>,
    /// HTTP listen port. Not part of §6.5's enumerated list but needed to
    /// run the server at all; defaults match the teacher's `ServerConfig`.
    pub port: u16,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 5,
            container_cpu: 1.0,
            container_mem_mib: 1024,
            cache_ttl_days: 7,
            cache_sweep_cron: "daily".to_string(),
            idempotency_ttl_hours: 6,
            verify_timeout_seconds: 60,
            implement_timeout_seconds: 30,
            prep_timeout_seconds: 2,
            ws_max_frame_bytes: 65536,
            ws_coalesce_ms: 50,
            tool_binary_path: None,
            port: 3141,
        }
    }
}

/// `.devteam/runner.toml` — every field optional, absent fields leave the
/// layer below untouched.
#[derive(Debug, Clone, Default, Deserialize)]
struct RunnerConfigToml {
    global_concurrency: Option<usize>,
    container_cpu: Option<f64>,
    container_mem_mib: Option<u64>,
    cache_ttl_days: Option<u32>,
    cache_sweep_cron: Option<String>,
    idempotency_ttl_hours: Option<u32>,
    verify_timeout_seconds: Option<u64>,
    implement_timeout_seconds: Option<u64>,
    prep_timeout_seconds: Option<u64>,
    ws_max_frame_bytes: Option<usize>,
    ws_coalesce_ms: Option<u64>,
    tool_binary_path: Option<String>,
    port: Option<u16>,
}

impl RunnerConfigToml {
    fn merge_over(self, mut base: RunnerConfig) -> RunnerConfig {
        if let Some(v) = self.global_concurrency {
            base.global_concurrency = v;
        }
        if let Some(v) = self.container_cpu {
            base.container_cpu = v;
        }
        if let Some(v) = self.container_mem_mib {
            base.container_mem_mib = v;
        }
        if let Some(v) = self.cache_ttl_days {
            base.cache_ttl_days = v;
        }
        if let Some(v) = self.cache_sweep_cron {
            base.cache_sweep_cron = v;
        }
        if let Some(v) = self.idempotency_ttl_hours {
            base.idempotency_ttl_hours = v;
        }
        if let Some(v) = self.verify_timeout_seconds {
            base.verify_timeout_seconds = v;
        }
        if let Some(v) = self.implement_timeout_seconds {
            base.implement_timeout_seconds = v;
        }
        if let Some(v) = self.prep_timeout_seconds {
            base.prep_timeout_seconds = v;
        }
        if let Some(v) = self.ws_max_frame_bytes {
            base.ws_max_frame_bytes = v;
        }
        if let Some(v) = self.ws_coalesce_ms {
            base.ws_coalesce_ms = v;
        }
        if let Some(v) = self.tool_binary_path {
            base.tool_binary_path = Some(v);
        }
        if let Some(v) = self.port {
            base.port = v;
        }
        base
    }
}

impl RunnerConfig {
    /// Load `.devteam/runner.toml` under `project_dir` (if present), merge
    /// it over the defaults, then apply process-environment overrides.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config = Self::default();
        let config = Self::merge_toml_file(config, &project_dir.join(".devteam/runner.toml"))?;
        Ok(Self::apply_env(config))
    }

    fn merge_toml_file(base: Self, path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(base);
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let parsed: RunnerConfigToml = toml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(parsed.merge_over(base))
    }

    fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("GLOBAL_CONCURRENCY") {
            if let Ok(v) = v.parse() {
                self.global_concurrency = v;
            }
        }
        if let Ok(v) = std::env::var("CONTAINER_CPU") {
            if let Ok(v) = v.parse() {
                self.container_cpu = v;
            }
        }
        if let Ok(v) = std::env::var("CONTAINER_MEM_MIB") {
            if let Ok(v) = v.parse() {
                self.container_mem_mib = v;
            }
        }
        if let Ok(v) = std::env::var("CACHE_TTL_DAYS") {
            if let Ok(v) = v.parse() {
                self.cache_ttl_days = v;
            }
        }
        if let Ok(v) = std::env::var("CACHE_SWEEP_CRON") {
            self.cache_sweep_cron = v;
        }
        if let Ok(v) = std::env::var("IDEMPOTENCY_TTL_HOURS") {
            if let Ok(v) = v.parse() {
                self.idempotency_ttl_hours = v;
            }
        }
        if let Ok(v) = std::env::var("VERIFY_TIMEOUT_SECONDS") {
            if let Ok(v) = v.parse() {
                self.verify_timeout_seconds = v;
            }
        }
        if let Ok(v) = std::env::var("IMPLEMENT_TIMEOUT_SECONDS") {
            if let Ok(v) = v.parse() {
                self.implement_timeout_seconds = v;
            }
        }
        if let Ok(v) = std::env::var("PREP_TIMEOUT_SECONDS") {
            if let Ok(v) = v.parse() {
                self.prep_timeout_seconds = v;
            }
        }
        if let Ok(v) = std::env::var("WS_MAX_FRAME_BYTES") {
            if let Ok(v) = v.parse() {
                self.ws_max_frame_bytes = v;
            }
        }
        if let Ok(v) = std::env::var("WS_COALESCE_MS") {
            if let Ok(v) = v.parse() {
                self.ws_coalesce_ms = v;
            }
        }
        if let Ok(v) = std::env::var("TOOL_BINARY_PATH") {
            self.tool_binary_path = Some(v);
        }
        if let Ok(v) = std::env::var("PORT") {
            if let Ok(v) = v.parse() {
                self.port = v;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn load_with_no_toml_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let config = RunnerConfig::load(dir.path()).unwrap();
        assert_eq!(config.global_concurrency, 5);
        assert_eq!(config.idempotency_ttl_hours, 6);
        assert_eq!(config.ws_max_frame_bytes, 65536);
    }

    #[test]
    fn load_merges_partial_toml_over_defaults() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".devteam")).unwrap();
        fs::write(
            dir.path().join(".devteam/runner.toml"),
            "global_concurrency = 10\nverify_timeout_seconds = 90\n",
        )
        .unwrap();
        let config = RunnerConfig::load(dir.path()).unwrap();
        assert_eq!(config.global_concurrency, 10);
        assert_eq!(config.verify_timeout_seconds, 90);
        // untouched fields keep their defaults
        assert_eq!(config.container_mem_mib, 1024);
    }

    #[test]
    fn load_rejects_invalid_toml() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".devteam")).unwrap();
        fs::write(dir.path().join(".devteam/runner.toml"), "not valid = [ toml").unwrap();
        assert!(RunnerConfig::load(dir.path()).is_err());
    }

    #[test]
    fn default_matches_spec_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.container_cpu, 1.0);
        assert_eq!(config.cache_ttl_days, 7);
        assert_eq!(config.implement_timeout_seconds, 30);
        assert_eq!(config.prep_timeout_seconds, 2);
        assert_eq!(config.ws_coalesce_ms, 50);
    }
}
