use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

fn default_event_reconnect_secs() -> u64 {
    5
}

fn default_overlay_network() -> String {
    "rise_net".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeSettings {
    /// Name of the overlay network shared by app and proxy containers.
    #[serde(default = "default_overlay_network")]
    pub overlay_network: String,
    /// Fixed retry delay for the container event stream after a non-EOF error.
    #[serde(default = "default_event_reconnect_secs")]
    pub event_reconnect_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            overlay_network: default_overlay_network(),
            event_reconnect_secs: default_event_reconnect_secs(),
        }
    }
}

fn default_http01_port() -> u16 {
    9080
}

fn default_cert_renewal_window_days() -> i64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CertificatesSettings {
    /// Directory holding ACME account keys and issued certificate bundles.
    pub cert_dir: String,
    /// Use the Let's Encrypt staging directory instead of production.
    #[serde(default)]
    pub tls_staging: bool,
    /// Port the shared HTTP-01 challenge responder listens on.
    #[serde(default = "default_http01_port")]
    pub http01_port: u16,
    /// Canonical domain for the API endpoint itself ("infrastructure" domain).
    #[serde(default)]
    pub infra_domain: Option<String>,
    /// Contact email used to register/renew the infrastructure domain.
    #[serde(default)]
    pub infra_email: Option<String>,
    /// Renew when less than this many days remain before expiry.
    #[serde(default = "default_cert_renewal_window_days")]
    pub renewal_window_days: i64,
}

fn default_proxy_config_file() -> String {
    "haproxy.cfg".to_string()
}

fn default_template_path() -> String {
    "templates/proxy_config.tera".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    /// Directory the rendered proxy configuration is written into.
    pub config_dir: String,
    /// Filename of the rendered proxy configuration within `config_dir`.
    #[serde(default = "default_proxy_config_file")]
    pub proxy_config_file: String,
    /// Path to the Tera template used to render the proxy configuration.
    #[serde(default = "default_template_path")]
    pub template_path: String,
    /// Render and log the config but skip writing/reloading (spec §9).
    #[serde(default)]
    pub dry_run: bool,
    /// Seconds to poll for a running proxy container before giving up.
    #[serde(default = "default_proxy_locate_timeout_secs")]
    pub locate_timeout_secs: u64,
}

fn default_proxy_locate_timeout_secs() -> u64 {
    30
}

fn default_debounce_secs() -> u64 {
    3
}

fn default_cert_debounce_secs() -> u64 {
    5
}

fn default_reconcile_timeout_secs() -> u64 {
    120
}

fn default_cert_reconcile_timeout_secs() -> u64 {
    60
}

fn default_maintenance_interval_secs() -> u64 {
    1800
}

fn default_health_check_deadline_secs() -> u64 {
    30
}

fn default_log_retention_days() -> i64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpdaterSettings {
    /// Per-appName event debounce window.
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    /// Debounce window for the certificate-renewal keyed debouncer.
    #[serde(default = "default_cert_debounce_secs")]
    pub cert_debounce_secs: u64,
    /// Upper bound for a single `AppUpdated`/`Periodic` reconcile.
    #[serde(default = "default_reconcile_timeout_secs")]
    pub reconcile_timeout_secs: u64,
    /// Upper bound for a certificate-only reconcile triggered by a renewal signal.
    #[serde(default = "default_cert_reconcile_timeout_secs")]
    pub cert_reconcile_timeout_secs: u64,
    /// Interval of the maintenance ticker (pruning, log retention, periodic reconcile).
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    /// Per-instance deadline for `healthCheckNewContainers`.
    #[serde(default = "default_health_check_deadline_secs")]
    pub health_check_deadline_secs: u64,
    /// Delete log files under `logs_dir` older than this many days.
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: i64,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            debounce_secs: default_debounce_secs(),
            cert_debounce_secs: default_cert_debounce_secs(),
            reconcile_timeout_secs: default_reconcile_timeout_secs(),
            cert_reconcile_timeout_secs: default_cert_reconcile_timeout_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            health_check_deadline_secs: default_health_check_deadline_secs(),
            log_retention_days: default_log_retention_days(),
        }
    }
}

fn default_logs_dir() -> String {
    "/var/log/rise".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub runtime: RuntimeSettings,
    pub certificates: CertificatesSettings,
    pub proxy: ProxySettings,
    #[serde(default)]
    pub updater: UpdaterSettings,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = env::var("RISE_CONFIG_DIR").unwrap_or_else(|_| "/config".into());

        let settings: Settings = Config::builder()
            .add_source(File::with_name(&format!("{}/default.toml", config_dir)).required(false))
            .add_source(File::with_name(&format!("{}/{}", config_dir, run_mode)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_dir)).required(false))
            .add_source(Environment::with_prefix("RISE").separator("__"))
            .build()?
            .try_deserialize()?;

        if settings.certificates.cert_dir.is_empty() {
            return Err(ConfigError::Message(
                "certificates.cert_dir must be set".to_string(),
            ));
        }
        if settings.proxy.config_dir.is_empty() {
            return Err(ConfigError::Message(
                "proxy.config_dir must be set".to_string(),
            ));
        }

        Ok(settings)
    }
}
