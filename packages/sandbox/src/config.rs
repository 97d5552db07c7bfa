// ABOUTME: Sandbox configuration, defaults and eager validation
// ABOUTME: Detects yaml vs appengine-web.xml layouts and parses the application config file

use crate::error::{Result, SandboxError};
use crate::probe::{DEFAULT_INTERVAL, DEFAULT_MAX_ATTEMPTS};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_APP_PORT: u16 = 8080;
pub const DEFAULT_ADMIN_PORT: u16 = 8000;
pub const DEFAULT_INTERNAL_ADMIN_PORT: u16 = 32768;
pub const DEFAULT_INTERNAL_API_PORT: u16 = 32769;
pub const DEFAULT_INTERNAL_PROXY_PORT: u16 = 32770;
pub const DEFAULT_STORAGE_PATH: &str = "/tmp/appengine/storage";
pub const DEFAULT_LOG_PATH: &str = "/tmp/log/appengine";
pub const DEFAULT_APPLICATION_ID: &str = "temp";

/// File name Java applications must use for their config
pub const JAVA_CONFIG_NAME: &str = "appengine-web.xml";
pub const WEB_XML_NAME: &str = "web.xml";
/// Offset of Java config files inside the application directory
pub const JAVA_OFFSET: &str = "WEB-INF/";

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Application config file (`*.yaml` or `appengine-web.xml`)
    pub config_file: Option<PathBuf>,
    /// Prebuilt application image; when unset the image is built from the app directory
    pub image_name: Option<String>,
    pub application_id: String,
    /// Host port the application is published on
    pub app_port: u16,
    /// Host port the admin console is published on
    pub admin_port: u16,
    pub internal_admin_port: u16,
    pub internal_api_port: u16,
    pub internal_proxy_port: u16,
    pub storage_path: PathBuf,
    pub log_path: PathBuf,
    pub run_api_server: bool,
    pub use_cache: bool,
    pub probe_interval: Duration,
    pub probe_attempts: u32,
    /// Run this inside the application container to check readiness instead of connecting over TCP
    pub readiness_command: Option<Vec<String>>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            config_file: None,
            image_name: None,
            application_id: DEFAULT_APPLICATION_ID.to_string(),
            app_port: DEFAULT_APP_PORT,
            admin_port: DEFAULT_ADMIN_PORT,
            internal_admin_port: DEFAULT_INTERNAL_ADMIN_PORT,
            internal_api_port: DEFAULT_INTERNAL_API_PORT,
            internal_proxy_port: DEFAULT_INTERNAL_PROXY_PORT,
            storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            run_api_server: true,
            use_cache: true,
            probe_interval: DEFAULT_INTERVAL,
            probe_attempts: DEFAULT_MAX_ATTEMPTS,
            readiness_command: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    Yaml,
    Xml,
}

impl ConfigKind {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") => Ok(ConfigKind::Yaml),
            Some("xml") => Ok(ConfigKind::Xml),
            _ => Err(SandboxError::Configuration(format!(
                "{} is not a valid configuration file. Use either a .yaml or .xml file.",
                path.display()
            ))),
        }
    }

    /// Where the config lives relative to the API server's `/app` directory
    pub fn internal_offset(&self) -> &'static str {
        match self {
            ConfigKind::Yaml => "",
            ConfigKind::Xml => JAVA_OFFSET,
        }
    }
}

/// What the sandbox needs to know from the application's config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfiguration {
    pub is_java: bool,
    pub health_checks_enabled: bool,
}

#[derive(Deserialize, Default)]
struct YamlConfig {
    #[serde(default)]
    vm: Option<serde_yaml::Value>,
    #[serde(default)]
    health_check: Option<YamlHealthCheck>,
}

#[derive(Deserialize, Default)]
struct YamlHealthCheck {
    #[serde(default)]
    enable_health_check: Option<serde_yaml::Value>,
}

/// Truthiness of a loosely typed yaml scalar
fn truthy(value: &serde_yaml::Value) -> bool {
    match value {
        serde_yaml::Value::Bool(b) => *b,
        serde_yaml::Value::Null => false,
        serde_yaml::Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        serde_yaml::Value::String(s) => !matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "" | "false" | "no" | "off"
        ),
        _ => true,
    }
}

/// True when the element's first child is a text node reading exactly `true`
fn first_text_is_true(node: roxmltree::Node<'_, '_>) -> bool {
    node.first_child()
        .is_some_and(|child| child.is_text() && child.text() == Some("true"))
}

impl AppConfiguration {
    pub fn from_file(path: &Path) -> Result<Self> {
        let kind = ConfigKind::from_path(path)?;
        let name = file_name(path);
        if kind == ConfigKind::Xml && name != JAVA_CONFIG_NAME {
            return Err(SandboxError::Configuration(format!(
                "XML configuration files must be named {}, found {}",
                JAVA_CONFIG_NAME, name
            )));
        }

        let contents = fs::read_to_string(path)?;
        match kind {
            ConfigKind::Yaml => Self::from_yaml_str(&name, &contents),
            ConfigKind::Xml => Self::from_xml_str(&name, &contents),
        }
    }

    pub fn from_yaml_str(name: &str, contents: &str) -> Result<Self> {
        let parsed: YamlConfig = if contents.trim().is_empty() {
            YamlConfig::default()
        } else {
            serde_yaml::from_str(contents).map_err(|e| {
                SandboxError::Configuration(format!("Could not parse {}: {}", name, e))
            })?
        };

        if !parsed.vm.as_ref().is_some_and(truthy) {
            return Err(SandboxError::Configuration(format!(
                "\"vm: true\" must be set in {}",
                name
            )));
        }

        let health_checks_enabled = parsed
            .health_check
            .and_then(|hc| hc.enable_health_check)
            .map_or(true, |v| truthy(&v));

        Ok(Self {
            is_java: false,
            health_checks_enabled,
        })
    }

    pub fn from_xml_str(name: &str, contents: &str) -> Result<Self> {
        let document = roxmltree::Document::parse(contents).map_err(|e| {
            SandboxError::Configuration(format!("Could not parse {}: {}", name, e))
        })?;
        let root = document.root_element();

        let vm_enabled = root
            .descendants()
            .find(|node| node.has_tag_name("vm"))
            .is_some_and(first_text_is_true);
        if !vm_enabled {
            return Err(SandboxError::Configuration(format!(
                "\"<vm>true</vm>\" must be set in {}",
                name
            )));
        }

        // Health checks stay on unless the flag holds something other than `true`
        let health_checks_enabled = root
            .descendants()
            .find(|node| node.has_tag_name("health-check"))
            .and_then(|health| {
                health
                    .descendants()
                    .find(|node| node.has_tag_name("enable-health-check"))
            })
            .map_or(true, |check| {
                check.first_child().is_none() || first_text_is_true(check)
            });

        Ok(Self {
            is_java: true,
            health_checks_enabled,
        })
    }
}

/// Resolved on-disk layout of the application
#[derive(Debug, Clone)]
pub struct AppLayout {
    /// Absolute path to the config file
    pub config_path: PathBuf,
    pub kind: ConfigKind,
    /// Directory holding the application's Dockerfile
    pub app_dir: PathBuf,
    pub configuration: AppConfiguration,
}

impl AppLayout {
    pub fn config_name(&self) -> String {
        file_name(&self.config_path)
    }

    /// `web.xml` next to a Java config; `None` for yaml configs
    pub fn web_xml(&self) -> Option<PathBuf> {
        match self.kind {
            ConfigKind::Xml => Some(web_xml_path(&self.config_path)),
            ConfigKind::Yaml => None,
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Where the `web.xml` of a Java config must live
pub fn web_xml_path(config: &Path) -> PathBuf {
    config
        .parent()
        .map(|dir| dir.join(WEB_XML_NAME))
        .unwrap_or_else(|| PathBuf::from(WEB_XML_NAME))
}

/// Application root for a config file
///
/// Yaml configs sit in the application root. Java configs sit in
/// `<root>/WEB-INF/`, so the root is one level further up.
pub fn app_directory_from_config(config: &Path) -> PathBuf {
    let parent = config.parent().unwrap_or_else(|| Path::new("/"));
    match ConfigKind::from_path(config) {
        Ok(ConfigKind::Xml) => parent.parent().unwrap_or(parent).to_path_buf(),
        _ => parent.to_path_buf(),
    }
}

impl SandboxConfig {
    /// Check everything that can be checked without touching the runtime
    ///
    /// Returns the resolved application layout, or `None` when the sandbox
    /// runs a prebuilt image without a config file.
    pub fn validate(&self) -> Result<Option<AppLayout>> {
        if self.probe_attempts == 0 {
            return Err(SandboxError::Configuration(
                "The readiness probe needs at least one attempt".to_string(),
            ));
        }
        if self.application_id.trim().is_empty() {
            return Err(SandboxError::Configuration(
                "The application id must not be empty".to_string(),
            ));
        }
        if self.run_api_server && self.app_port == self.admin_port {
            return Err(SandboxError::Configuration(format!(
                "The application and admin ports must differ (both are {})",
                self.app_port
            )));
        }
        if let Some(command) = &self.readiness_command {
            if command.is_empty() {
                return Err(SandboxError::Configuration(
                    "The readiness command must not be empty".to_string(),
                ));
            }
        }

        let Some(config_file) = &self.config_file else {
            return match &self.image_name {
                Some(_) => Ok(None),
                None => Err(SandboxError::Configuration(
                    "Either a config file or an image name must be provided".to_string(),
                )),
            };
        };

        let layout = resolve_layout(config_file)?;

        if self.image_name.is_none() && !layout.app_dir.join("Dockerfile").is_file() {
            return Err(SandboxError::Configuration(format!(
                "No Dockerfile found in the application directory {}",
                layout.app_dir.display()
            )));
        }

        Ok(Some(layout))
    }
}

/// Resolve and check a config file and the files it depends on
pub fn resolve_layout(config_file: &Path) -> Result<AppLayout> {
    if !config_file.exists() {
        return Err(SandboxError::Configuration(format!(
            "The path {} could not be resolved.",
            config_file.display()
        )));
    }
    let config_path = fs::canonicalize(config_file)?;
    let kind = ConfigKind::from_path(&config_path)?;

    if kind == ConfigKind::Xml {
        let web_xml = web_xml_path(&config_path);
        if !web_xml.is_file() {
            return Err(SandboxError::Configuration(format!(
                "Could not find web.xml at: {}",
                web_xml.display()
            )));
        }
    }

    let configuration = AppConfiguration::from_file(&config_path)?;
    let app_dir = app_directory_from_config(&config_path);
    debug!(
        "Resolved {} (app directory {}, health checks {})",
        config_path.display(),
        app_dir.display(),
        if configuration.health_checks_enabled {
            "enabled"
        } else {
            "disabled"
        }
    );

    Ok(AppLayout {
        config_path,
        kind,
        app_dir,
        configuration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.app_port, 8080);
        assert_eq!(config.admin_port, 8000);
        assert_eq!(config.internal_admin_port, 32768);
        assert_eq!(config.internal_api_port, 32769);
        assert_eq!(config.internal_proxy_port, 32770);
        assert_eq!(config.application_id, "temp");
        assert_eq!(config.probe_attempts, 30);
        assert_eq!(config.probe_interval, Duration::from_secs(1));
        assert!(config.run_api_server);
        assert!(config.use_cache);
    }

    #[test]
    fn test_yaml_health_checks_on() {
        let with_block = "vm: true\nhealth_check:\n  enable_health_check: True\n  check_interval_sec: 5\n";
        for contents in [with_block, "vm: true"] {
            let conf = AppConfiguration::from_yaml_str("app.yaml", contents).unwrap();
            assert!(conf.health_checks_enabled, "{}", contents);
            assert!(!conf.is_java);
        }
    }

    #[test]
    fn test_yaml_health_checks_off() {
        let contents = "vm: true\nhealth_check:\n  enable_health_check: False\n";
        let conf = AppConfiguration::from_yaml_str("app.yaml", contents).unwrap();
        assert!(!conf.health_checks_enabled);
    }

    #[test]
    fn test_yaml_vm_not_set() {
        for contents in ["health_check:\n  enable_health_check: true\n", "vm: false", ""] {
            let result = AppConfiguration::from_yaml_str("app.yaml", contents);
            assert!(
                matches!(result, Err(SandboxError::Configuration(_))),
                "{:?} should be rejected",
                contents
            );
        }
    }

    #[test]
    fn test_xml_health_checks() {
        let on = [
            "<appengine-web-app><vm>true</vm><health-check><enable-health-check>true</enable-health-check></health-check></appengine-web-app>",
            "<appengine-web-app><vm>true</vm><health-check><enable-health-check></enable-health-check></health-check></appengine-web-app>",
            "<appengine-web-app>\n    <vm>true</vm>\n</appengine-web-app>",
            "<appengine-web-app xmlns=\"http://appengine.google.com/ns/1.0\">\n  <vm >true</vm >\n</appengine-web-app>",
            "<appengine-web-app><vm><![CDATA[true]]></vm></appengine-web-app>",
        ];
        for contents in on {
            let conf = AppConfiguration::from_xml_str("appengine-web.xml", contents).unwrap();
            assert!(conf.health_checks_enabled, "{}", contents);
            assert!(conf.is_java);
        }

        let off = "<appengine-web-app><vm>true</vm><health-check>\n  <enable-health-check>false</enable-health-check>\n</health-check></appengine-web-app>";
        let conf = AppConfiguration::from_xml_str("appengine-web.xml", off).unwrap();
        assert!(!conf.health_checks_enabled);

        // The flag is compared verbatim
        let padded = "<appengine-web-app><vm>true</vm><health-check><enable-health-check> true </enable-health-check></health-check></appengine-web-app>";
        let conf = AppConfiguration::from_xml_str("appengine-web.xml", padded).unwrap();
        assert!(!conf.health_checks_enabled);
    }

    #[test]
    fn test_xml_vm_not_set() {
        let rejected = [
            "<appengine-web-app></appengine-web-app>",
            "<appengine-web-app><vm></vm></appengine-web-app>",
            "<appengine-web-app><vm>false</vm></appengine-web-app>",
            "<appengine-web-app><!-- <vm>true</vm> --></appengine-web-app>",
            "<appengine-web-app><![CDATA[<vm>true</vm>]]></appengine-web-app>",
            "<appengine-web-app><vm>\n  true\n</vm></appengine-web-app>",
            "<appengine-web-app><vm>true</vm><unclosed></appengine-web-app>",
            "<appengine-web-app><vm>true</vm></appengine-web-app><trailing/>",
            "malformed xml file",
        ];
        for contents in rejected {
            assert!(
                AppConfiguration::from_xml_str("appengine-web.xml", contents).is_err(),
                "{} should be rejected",
                contents
            );
        }
    }

    #[test]
    fn test_web_xml_path() {
        assert_eq!(
            web_xml_path(Path::new("/conf/appengine-web.xml")),
            PathBuf::from("/conf/web.xml")
        );
    }

    #[test]
    fn test_app_directory_from_config() {
        assert_eq!(
            app_directory_from_config(Path::new("/app/blah/app-web.xml")),
            PathBuf::from("/app")
        );
        assert_eq!(
            app_directory_from_config(Path::new("/app/app.yaml")),
            PathBuf::from("/app")
        );
    }

    #[test]
    fn test_validate_missing_config_file() {
        let config = SandboxConfig {
            config_file: Some(PathBuf::from("/no/such/dir/app.yaml")),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("could not be resolved"));
    }

    #[test]
    fn test_validate_wrong_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "app.json", "{}");
        let config = SandboxConfig {
            config_file: Some(path),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SandboxError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_xml_requires_web_xml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "WEB-INF/appengine-web.xml",
            "<appengine-web-app><vm>true</vm></appengine-web-app>",
        );
        write(dir.path(), "Dockerfile", "FROM java\n");
        let config = SandboxConfig {
            config_file: Some(path.clone()),
            ..Default::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("web.xml"));

        write(dir.path(), "WEB-INF/web.xml", "<web-app/>");
        let layout = config.validate().unwrap().unwrap();
        assert_eq!(layout.kind, ConfigKind::Xml);
        assert_eq!(layout.app_dir, fs::canonicalize(dir.path()).unwrap());
        assert_eq!(layout.config_name(), "appengine-web.xml");
        assert!(layout.web_xml().is_some());
    }

    #[test]
    fn test_validate_xml_must_be_appengine_web() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "WEB-INF/other.xml", "<vm>true</vm>");
        write(dir.path(), "WEB-INF/web.xml", "<web-app/>");
        let config = SandboxConfig {
            config_file: Some(path),
            image_name: Some("app".to_string()),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("appengine-web.xml"));
    }

    #[test]
    fn test_validate_requires_dockerfile_without_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "app.yaml", "vm: true\n");
        let mut config = SandboxConfig {
            config_file: Some(path),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.image_name = Some("prebuilt".to_string());
        assert!(config.validate().unwrap().is_some());
    }

    #[test]
    fn test_validate_needs_config_or_image() {
        let config = SandboxConfig::default();
        assert!(matches!(
            config.validate(),
            Err(SandboxError::Configuration(_))
        ));

        let image_only = SandboxConfig {
            image_name: Some("prebuilt".to_string()),
            ..Default::default()
        };
        assert!(image_only.validate().unwrap().is_none());
    }

    #[test]
    fn test_validate_rejects_zero_attempts_and_port_clash() {
        let base = SandboxConfig {
            image_name: Some("prebuilt".to_string()),
            ..Default::default()
        };

        let no_attempts = SandboxConfig {
            probe_attempts: 0,
            ..base.clone()
        };
        assert!(no_attempts.validate().is_err());

        let clash = SandboxConfig {
            admin_port: 8080,
            ..base.clone()
        };
        assert!(clash.validate().is_err());

        let clash_without_api = SandboxConfig {
            admin_port: 8080,
            run_api_server: false,
            ..base
        };
        assert!(clash_without_api.validate().is_ok());
    }
}
