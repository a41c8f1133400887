use serde::Deserialize;
use std::path::PathBuf;

/// Static configuration loaded from a YAML file at startup, following this
/// codebase's pattern of a typed config struct deserialized once rather
/// than scattered env lookups (ambient stack, SPEC_FULL §7.1).
#[derive(Debug, Deserialize)]
pub struct HubConfig {
    /// Connection string for the metadata/source database (build
    /// configurations, source master docs, upload journal, raw source
    /// collections).
    pub source_db_uri: String,
    pub source_db_name: String,

    /// Connection string for the target database the merged collections
    /// are written to. Defaults to `source_db_uri`/`source_db_name` when
    /// omitted, matching a typical single-cluster deployment.
    pub target_db_uri: Option<String>,
    pub target_db_name: Option<String>,

    /// Path to the `merge-worker` sidecar binary.
    pub worker_binary: PathBuf,

    /// Number of worker processes in the process pool (SPEC_FULL §4.1).
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Memory ceiling (bytes) the Job Manager admits submissions against.
    #[serde(default = "default_max_memory_usage")]
    pub max_memory_usage: u64,

    /// Cron expression for the Builder Manager's poll loop. If absent, the
    /// poll loop is not started and builds only run on explicit `merge`
    /// commands.
    pub poll_schedule: Option<String>,

    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub max_build_status: Option<usize>,
    #[serde(default)]
    pub keep_archive: Option<usize>,
    #[serde(default = "default_log_folder")]
    pub log_folder: String,
}

fn default_num_workers() -> usize {
    4
}

fn default_max_memory_usage() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_log_folder() -> String {
    "logs/build".to_string()
}

impl HubConfig {
    pub fn load(path: &std::path::Path) -> Result<Self, anyhow::Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
        let config: HubConfig = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing config file {}: {e}", path.display()))?;
        Ok(config)
    }

    pub fn target_db_uri(&self) -> &str {
        self.target_db_uri.as_deref().unwrap_or(&self.source_db_uri)
    }

    pub fn target_db_name(&self) -> &str {
        self.target_db_name.as_deref().unwrap_or(&self.source_db_name)
    }

    pub fn builder_config(&self) -> builder::BuilderConfig {
        let defaults = builder::BuilderConfig::default();
        builder::BuilderConfig {
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            max_build_status: self.max_build_status.unwrap_or(defaults.max_build_status),
            keep_archive: self.keep_archive.unwrap_or(defaults.keep_archive),
            log_folder: self.log_folder.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_config_fills_in_every_default() {
        let file = write_config(
            "source_db_uri: mongodb://localhost:27017\n\
             source_db_name: src\n\
             worker_binary: /usr/local/bin/merge-worker\n",
        );
        let config = HubConfig::load(file.path()).unwrap();

        assert_eq!(config.num_workers, default_num_workers());
        assert_eq!(config.max_memory_usage, default_max_memory_usage());
        assert_eq!(config.target_db_uri(), config.source_db_uri);
        assert_eq!(config.target_db_name(), config.source_db_name);
        assert!(config.poll_schedule.is_none());

        let builder_config = config.builder_config();
        let defaults = builder::BuilderConfig::default();
        assert_eq!(builder_config.batch_size, defaults.batch_size);
        assert_eq!(builder_config.keep_archive, defaults.keep_archive);
    }

    #[test]
    fn explicit_target_and_overrides_take_precedence() {
        let file = write_config(
            "source_db_uri: mongodb://localhost:27017\n\
             source_db_name: src\n\
             target_db_uri: mongodb://target:27017\n\
             target_db_name: tgt\n\
             worker_binary: /usr/local/bin/merge-worker\n\
             num_workers: 8\n\
             batch_size: 500\n\
             poll_schedule: \"0 * * * * *\"\n",
        );
        let config = HubConfig::load(file.path()).unwrap();

        assert_eq!(config.target_db_uri(), "mongodb://target:27017");
        assert_eq!(config.target_db_name(), "tgt");
        assert_eq!(config.num_workers, 8);
        assert_eq!(config.builder_config().batch_size, 500);
        assert_eq!(config.poll_schedule.as_deref(), Some("0 * * * * *"));
    }

    #[test]
    fn missing_file_is_a_readable_error() {
        let err = HubConfig::load(std::path::Path::new("/no/such/hub.yaml")).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }
}
