use crate::update::semantics::SemanticsMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration of the update handler and its commit trackers.
///
/// A bound of `-1` disables the corresponding trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateHandlerConfig {
    pub auto_commit_max_docs: i64,
    pub auto_commit_max_time_ms: i64,
    pub auto_commit_open_searcher: bool,
    pub auto_soft_commit_max_docs: i64,
    pub auto_soft_commit_max_time_ms: i64,
    /// Route `commit_within` requests to the soft tracker instead of the
    /// hard one.
    pub commit_within_soft_commit: bool,
    pub index_writer_close_waits_for_merges: bool,
    /// Run a minimal commit before the writer closes when the log still has
    /// uncommitted changes.
    pub commit_on_close: bool,
    /// Cluster-aware shards refuse rollback.
    pub cluster_aware: bool,
    pub semantics_mode: SemanticsMode,
}

impl Default for UpdateHandlerConfig {
    fn default() -> Self {
        UpdateHandlerConfig {
            auto_commit_max_docs: -1,
            auto_commit_max_time_ms: -1,
            auto_commit_open_searcher: true,
            auto_soft_commit_max_docs: -1,
            auto_soft_commit_max_time_ms: -1,
            commit_within_soft_commit: true,
            index_writer_close_waits_for_merges: true,
            commit_on_close: true,
            cluster_aware: false,
            semantics_mode: SemanticsMode::default(),
        }
    }
}

impl UpdateHandlerConfig {
    /// Load configuration from `{data_dir}/update.json`, falling back to
    /// `GRIDDLE_*` environment variables and then to the defaults.
    pub fn load_or_default(data_dir: &Path) -> Self {
        let path = data_dir.join("update.json");
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<UpdateHandlerConfig>(&content) {
                    Ok(config) => {
                        tracing::info!(
                            "Loaded update config: semantics={}, autoCommitMaxDocs={}",
                            config.semantics_mode,
                            config.auto_commit_max_docs
                        );
                        return config;
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse update.json: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to read update.json: {}, using defaults", e);
                }
            }
        }
        Self::from_env()
    }

    pub fn from_env() -> Self {
        let mut config = UpdateHandlerConfig::default();
        config.auto_commit_max_docs = env_i64("GRIDDLE_AUTOCOMMIT_MAX_DOCS", config.auto_commit_max_docs);
        config.auto_commit_max_time_ms =
            env_i64("GRIDDLE_AUTOCOMMIT_MAX_TIME_MS", config.auto_commit_max_time_ms);
        config.auto_soft_commit_max_docs = env_i64(
            "GRIDDLE_AUTOSOFTCOMMIT_MAX_DOCS",
            config.auto_soft_commit_max_docs,
        );
        config.auto_soft_commit_max_time_ms = env_i64(
            "GRIDDLE_AUTOSOFTCOMMIT_MAX_TIME_MS",
            config.auto_soft_commit_max_time_ms,
        );
        config.commit_within_soft_commit = env_bool(
            "GRIDDLE_COMMIT_WITHIN_SOFT_COMMIT",
            config.commit_within_soft_commit,
        );
        config.cluster_aware = env_bool("GRIDDLE_CLUSTER_AWARE", config.cluster_aware);
        if let Ok(mode) = std::env::var("GRIDDLE_SEMANTICS_MODE") {
            match mode.parse() {
                Ok(m) => config.semantics_mode = m,
                Err(e) => tracing::error!("Ignoring GRIDDLE_SEMANTICS_MODE: {}", e),
            }
        }
        config
    }
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // Env-var tests share process-wide state; serialize them.
    static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn defaults_disable_autocommit() {
        let config = UpdateHandlerConfig::default();
        assert_eq!(config.auto_commit_max_docs, -1);
        assert_eq!(config.auto_commit_max_time_ms, -1);
        assert!(config.commit_within_soft_commit);
        assert!(config.commit_on_close);
        assert!(!config.cluster_aware);
        assert_eq!(config.semantics_mode, SemanticsMode::VersionHybrid);
    }

    #[test]
    fn load_or_default_no_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::remove_var("GRIDDLE_AUTOCOMMIT_MAX_DOCS");
        std::env::remove_var("GRIDDLE_SEMANTICS_MODE");
        let dir = tempfile::tempdir().unwrap();
        let config = UpdateHandlerConfig::load_or_default(dir.path());
        assert_eq!(config.auto_commit_max_docs, -1);
    }

    #[test]
    fn load_or_default_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("update.json")).unwrap();
        file.write_all(br#"{"auto_commit_max_docs": 500, "semantics_mode": "strict-insert"}"#)
            .unwrap();

        let config = UpdateHandlerConfig::load_or_default(dir.path());
        assert_eq!(config.auto_commit_max_docs, 500);
        assert_eq!(config.semantics_mode, SemanticsMode::StrictInsert);
        // unspecified fields keep their defaults
        assert_eq!(config.auto_commit_max_time_ms, -1);
    }

    #[test]
    fn load_or_default_invalid_file_falls_back() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::remove_var("GRIDDLE_AUTOCOMMIT_MAX_DOCS");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("update.json"), b"not json").unwrap();
        let config = UpdateHandlerConfig::load_or_default(dir.path());
        assert_eq!(config.auto_commit_max_docs, -1);
    }

    #[test]
    fn env_overrides_apply() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::set_var("GRIDDLE_AUTOCOMMIT_MAX_DOCS", "100");
        std::env::set_var("GRIDDLE_SEMANTICS_MODE", "classic");

        let config = UpdateHandlerConfig::from_env();

        std::env::remove_var("GRIDDLE_AUTOCOMMIT_MAX_DOCS");
        std::env::remove_var("GRIDDLE_SEMANTICS_MODE");

        assert_eq!(config.auto_commit_max_docs, 100);
        assert_eq!(config.semantics_mode, SemanticsMode::Classic);
    }

    #[test]
    fn bad_env_values_are_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::set_var("GRIDDLE_AUTOCOMMIT_MAX_DOCS", "many");
        std::env::set_var("GRIDDLE_SEMANTICS_MODE", "nonsense");

        let config = UpdateHandlerConfig::from_env();

        std::env::remove_var("GRIDDLE_AUTOCOMMIT_MAX_DOCS");
        std::env::remove_var("GRIDDLE_SEMANTICS_MODE");

        assert_eq!(config.auto_commit_max_docs, -1);
        assert_eq!(config.semantics_mode, SemanticsMode::VersionHybrid);
    }
}
