//! Plugin manifest types and the manifest reader.
//!
//! A [`PluginManifest`] declares everything the loader needs to know about a
//! plugin: its name, version, entry point, and resource quotas. Manifests are
//! read from a `plugin.json` file in the plugin directory and validated
//! structurally on read. Quotas are kept in their raw form and only resolved
//! when execution is requested, so a manifest without quotas is a
//! [`PluginError::Quota`] failure rather than a structural one.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PluginError;

/// File name of the manifest inside each plugin directory.
pub const MANIFEST_FILE_NAME: &str = "plugin.json";

/// Resolved resource quotas: both values are positive.
///
/// # Example
///
/// ```
/// use enclave_plugins::Quotas;
///
/// let quotas = Quotas::new(500, 2048);
/// assert_eq!(quotas.cpu_ms(), 500);
/// assert_eq!(quotas.mem_kb(), 2048);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quotas {
    cpu_ms: u64,
    mem_kb: u64,
}

impl Quotas {
    /// Creates a quota pair.
    #[must_use]
    pub const fn new(cpu_ms: u64, mem_kb: u64) -> Self {
        Self { cpu_ms, mem_kb }
    }

    /// CPU-time quota per execution, in milliseconds.
    #[must_use]
    pub const fn cpu_ms(&self) -> u64 {
        self.cpu_ms
    }

    /// Memory quota, in kilobytes.
    #[must_use]
    pub const fn mem_kb(&self) -> u64 {
        self.mem_kb
    }
}

/// Identity fields shared by every plugin.
///
/// Groups the name and version into a single parameter object, reducing the
/// argument count of [`PluginManifest::new`].
///
/// # Example
///
/// ```
/// use enclave_plugins::PluginMetadata;
///
/// let meta = PluginMetadata::new("greeter", "1.0.0");
/// assert_eq!(meta.name(), "greeter");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMetadata {
    name: String,
    version: String,
}

impl PluginMetadata {
    /// Creates a new metadata bundle.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Returns the plugin name.
    #[must_use]
    pub const fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the plugin version.
    #[must_use]
    pub const fn version(&self) -> &str {
        self.version.as_str()
    }
}

/// On-disk shape of `plugin.json`. Every field is optional here so that
/// missing fields are reported by name rather than by `serde`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDocument {
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
    entry_point: Option<String>,
    quotas: Option<Value>,
}

/// Declarative description of a plugin.
///
/// # Example
///
/// ```
/// use enclave_plugins::{PluginManifest, PluginMetadata, Quotas};
///
/// let manifest = PluginManifest::new(
///     PluginMetadata::new("greeter", "1.0.0"),
///     "main.lua",
///     "/srv/plugins/greeter",
/// )
/// .with_quotas(Quotas::new(500, 2048));
///
/// assert_eq!(manifest.name(), "greeter");
/// assert!(manifest.validate().is_ok());
/// assert_eq!(manifest.quotas().ok(), Some(Quotas::new(500, 2048)));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PluginManifest {
    name: String,
    version: String,
    description: Option<String>,
    entry_point: PathBuf,
    base_dir: PathBuf,
    quotas: Option<Value>,
}

impl PluginManifest {
    /// Creates a manifest without quotas or a description.
    #[must_use]
    pub fn new(
        metadata: PluginMetadata,
        entry_point: impl Into<PathBuf>,
        base_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: metadata.name,
            version: metadata.version,
            description: None,
            entry_point: entry_point.into(),
            base_dir: base_dir.into(),
            quotas: None,
        }
    }

    /// Sets the human-readable description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets explicit quotas, replacing whatever the manifest declared.
    #[must_use]
    pub fn with_quotas(mut self, quotas: Quotas) -> Self {
        self.quotas = Some(serde_json::json!({
            "cpuMs": quotas.cpu_ms(),
            "memKb": quotas.mem_kb(),
        }));
        self
    }

    /// Parses manifest JSON for a plugin rooted at `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidManifest`] if the text is not a JSON
    /// object, a field has the wrong type, or [`PluginManifest::validate`]
    /// rejects the result.
    pub fn from_json_str(text: &str, base_dir: impl Into<PathBuf>) -> Result<Self, PluginError> {
        let root = base_dir.into();
        let source = root.join(MANIFEST_FILE_NAME);
        let document: ManifestDocument =
            serde_json::from_str(text).map_err(|error| PluginError::InvalidManifest {
                path: source.clone(),
                message: error.to_string(),
            })?;

        let name = required_field(&source, "name", document.name)?;
        let version = required_field(&source, "version", document.version)?;
        let entry_point = required_field(&source, "entryPoint", document.entry_point)?;

        let manifest = Self {
            name,
            version,
            description: document.description,
            entry_point: PathBuf::from(entry_point),
            base_dir: root,
            quotas: document.quotas,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validates the structural fields.
    ///
    /// Quotas are not checked here; see [`PluginManifest::quotas`].
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidManifest`] if `name`, `version`, or
    /// `entryPoint` is blank, or if the entry point is absolute or escapes
    /// the plugin directory.
    pub fn validate(&self) -> Result<(), PluginError> {
        for (field, value) in [("name", &self.name), ("version", &self.version)] {
            if value.trim().is_empty() {
                return Err(self.invalid(format!("'{field}' must not be blank")));
            }
        }
        if self.entry_point.as_os_str().is_empty() {
            return Err(self.invalid("'entryPoint' must not be blank"));
        }
        if self.entry_point.is_absolute() {
            return Err(self.invalid(format!(
                "'entryPoint' must be relative to the plugin directory, got '{}'",
                self.entry_point.display()
            )));
        }
        let escapes = self.entry_point.components().any(|component| {
            matches!(
                component,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            return Err(self.invalid(format!(
                "'entryPoint' must stay inside the plugin directory, got '{}'",
                self.entry_point.display()
            )));
        }
        Ok(())
    }

    /// Resolves the declared quotas.
    ///
    /// Each of `quotas.cpuMs` and `quotas.memKb` must be a positive JSON
    /// integer, an integral float such as `500.0`, or a string holding a
    /// positive decimal integer. Nothing is defaulted.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Quota`] naming the missing or invalid field.
    pub fn quotas(&self) -> Result<Quotas, PluginError> {
        let Some(raw) = self.quotas.as_ref() else {
            return Err(self.quota_error("quotas", "quotas are required"));
        };
        let Some(fields) = raw.as_object() else {
            return Err(self.quota_error("quotas", format!("expected an object, got {raw}")));
        };
        let cpu_ms = self.resolve_quota(fields, "cpuMs")?;
        let mem_kb = self.resolve_quota(fields, "memKb")?;
        Ok(Quotas::new(cpu_ms, mem_kb))
    }

    /// Returns the plugin name.
    #[must_use]
    pub const fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the plugin version.
    #[must_use]
    pub const fn version(&self) -> &str {
        self.version.as_str()
    }

    /// Returns the description, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Returns the entry point relative to the plugin directory.
    #[must_use]
    pub fn entry_point(&self) -> &Path {
        &self.entry_point
    }

    /// Returns the plugin directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the entry point joined onto the plugin directory.
    #[must_use]
    pub fn entry_point_path(&self) -> PathBuf {
        self.base_dir.join(&self.entry_point)
    }

    fn invalid(&self, message: impl Into<String>) -> PluginError {
        PluginError::InvalidManifest {
            path: self.base_dir.join(MANIFEST_FILE_NAME),
            message: message.into(),
        }
    }

    fn quota_error(&self, field: &str, message: impl Into<String>) -> PluginError {
        PluginError::Quota {
            name: self.name.clone(),
            field: field.to_owned(),
            message: message.into(),
        }
    }

    fn resolve_quota(&self, fields: &Map<String, Value>, key: &str) -> Result<u64, PluginError> {
        let field = format!("quotas.{key}");
        let value = fields
            .get(key)
            .ok_or_else(|| self.quota_error(&field, "missing"))?;
        positive_integer(value).ok_or_else(|| {
            self.quota_error(&field, format!("expected a positive integer, got {value}"))
        })
    }
}

fn required_field(
    source: &Path,
    field: &str,
    value: Option<String>,
) -> Result<String, PluginError> {
    value
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| PluginError::InvalidManifest {
            path: source.to_path_buf(),
            message: format!("'{field}' is required"),
        })
}

fn positive_integer(value: &Value) -> Option<u64> {
    let resolved = match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| integral_float(&number.to_string())),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }?;
    (resolved > 0).then_some(resolved)
}

/// `serde_json` renders integral floats with a `.0` suffix (`500.0`).
fn integral_float(rendered: &str) -> Option<u64> {
    rendered.strip_suffix(".0")?.parse().ok()
}

/// Reads and validates the manifest at `path`.
///
/// The manifest's directory becomes the plugin's base directory.
///
/// # Errors
///
/// Returns [`PluginError::ManifestNotFound`] if no file exists at `path`,
/// and [`PluginError::InvalidManifest`] if it cannot be read or fails
/// [`PluginManifest::from_json_str`].
pub fn read_manifest(path: &Path) -> Result<PluginManifest, PluginError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            return Err(PluginError::ManifestNotFound {
                path: path.to_path_buf(),
            });
        }
        Err(error) => {
            return Err(PluginError::InvalidManifest {
                path: path.to_path_buf(),
                message: format!("cannot read manifest: {error}"),
            });
        }
    };
    let base_dir = path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    PluginManifest::from_json_str(&text, base_dir)
}
