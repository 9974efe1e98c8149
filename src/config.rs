use std::env;
use std::fs;

use log::{info, warn};
use once_cell::sync::OnceCell;

use crate::error::{CoreError, CoreResult};

/// Name of the env var that points at the config file, mirroring the
/// `envVar` lookup the kit used to locate `shore.conf`.
pub const CONFIG_PATH_VAR: &str = "SMALLDB_CONFIG";

/// Which scheduling flavor a binary was compiled for. Carried alongside the
/// config so startup can refuse to run a `baseline`-compiled binary against
/// a `dora`-configured environment or vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Baseline,
    Dora,
}

impl Flavor {
    fn parse(s: &str) -> CoreResult<Flavor> {
        match s.trim().to_ascii_lowercase().as_str() {
            "baseline" => Ok(Flavor::Baseline),
            "dora" => Ok(Flavor::Dora),
            other => Err(CoreError::Config(format!("unknown flavor tag: {}", other))),
        }
    }
}

/// The flavor this binary was built for. The kit refuses to start if the
/// configured flavor disagrees (see SPEC_FULL §6.1).
pub const COMPILED_FLAVOR: Flavor = Flavor::Dora;

#[derive(Debug, Clone)]
pub struct Config {
    pub device_path: String,
    pub scale_factor: f64,
    pub loader_threads: usize,
    pub queue_loops_before_sleep: u32,
    pub queue_wake_threshold: usize,
    pub sli_enabled: bool,
    pub flavor: Flavor,
    pub max_retries: u32,
    pub bulk_load_group_size: usize,
    pub bulk_load_line_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_path: "./dora.db".to_string(),
            scale_factor: 1.0,
            loader_threads: 1,
            queue_loops_before_sleep: 2000,
            queue_wake_threshold: 0,
            sli_enabled: false,
            flavor: Flavor::Dora,
            max_retries: 10,
            bulk_load_group_size: 1000,
            bulk_load_line_limit: 4096,
        }
    }
}

impl Config {
    /// Parses `key=value` lines (blank lines and `#`-comments ignored), the
    /// same shape as the kit's `.conf` files and the shell's `SET k=v`
    /// command.
    pub fn parse(text: &str) -> CoreResult<Config> {
        let mut cfg = Config::default();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, '=');
            let key = parts.next().unwrap_or("").trim();
            let value = parts.next().ok_or_else(|| {
                CoreError::Config(format!("line {}: missing '=' in {:?}", lineno + 1, raw))
            })?;
            cfg.set(key, value.trim())?;
        }
        Ok(cfg)
    }

    pub fn set(&mut self, key: &str, value: &str) -> CoreResult<()> {
        match key {
            "device_path" => self.device_path = value.to_string(),
            "sf" | "scale_factor" => {
                self.scale_factor = value
                    .parse()
                    .map_err(|_| CoreError::Config(format!("bad scale factor: {}", value)))?
            }
            "loader_threads" => {
                self.loader_threads = value
                    .parse()
                    .map_err(|_| CoreError::Config(format!("bad loader_threads: {}", value)))?
            }
            "queue_loops_before_sleep" => {
                self.queue_loops_before_sleep = value.parse().map_err(|_| {
                    CoreError::Config(format!("bad queue_loops_before_sleep: {}", value))
                })?
            }
            "queue_wake_threshold" => {
                self.queue_wake_threshold = value.parse().map_err(|_| {
                    CoreError::Config(format!("bad queue_wake_threshold: {}", value))
                })?
            }
            "sli" | "sli_enabled" => {
                self.sli_enabled = matches!(value, "1" | "true" | "yes")
            }
            "flavor" => self.flavor = Flavor::parse(value)?,
            "max_retries" => {
                self.max_retries = value
                    .parse()
                    .map_err(|_| CoreError::Config(format!("bad max_retries: {}", value)))?
            }
            other => {
                warn!("ignoring unknown config key: {}", other);
            }
        }
        Ok(())
    }

    /// Loads the config file named by `SMALLDB_CONFIG`, falling back to
    /// defaults if the variable is unset. Aborts (returns an error) if the
    /// configured flavor doesn't match the binary's compiled flavor.
    pub fn load_from_env() -> CoreResult<Config> {
        let cfg = match env::var(CONFIG_PATH_VAR) {
            Ok(path) => {
                info!("loading config from {} ({})", CONFIG_PATH_VAR, path);
                let text = fs::read_to_string(&path)
                    .map_err(|e| CoreError::Config(format!("reading {}: {}", path, e)))?;
                Config::parse(&text)?
            }
            Err(_) => {
                info!("{} not set, using default config", CONFIG_PATH_VAR);
                Config::default()
            }
        };
        if cfg.flavor != COMPILED_FLAVOR {
            return Err(CoreError::Config(format!(
                "configured flavor {:?} does not match compiled flavor {:?}",
                cfg.flavor, COMPILED_FLAVOR
            )));
        }
        Ok(cfg)
    }
}

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

/// Installs the process-wide config. Must be called at most once; later
/// calls are ignored (matching the `Database`/`Unique` singleton discipline
/// the rest of the crate follows).
pub fn install(cfg: Config) {
    if GLOBAL_CONFIG.set(cfg).is_err() {
        warn!("config already installed, ignoring");
    }
}

pub fn global() -> &'static Config {
    GLOBAL_CONFIG.get_or_init(Config::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_lines() {
        let cfg = Config::parse("sf=2.5\nloader_threads=4\nflavor=dora\n# comment\n").unwrap();
        assert_eq!(cfg.scale_factor, 2.5);
        assert_eq!(cfg.loader_threads, 4);
        assert_eq!(cfg.flavor, Flavor::Dora);
    }

    #[test]
    fn rejects_unknown_flavor() {
        let err = Config::parse("flavor=quantum\n").unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn set_overrides_default() {
        let mut cfg = Config::default();
        cfg.set("sli", "true").unwrap();
        assert!(cfg.sli_enabled);
    }
}
