use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, PassThruError};
use crate::j2534::types::Protocol;

/// Protocols an adapter advertises in its registry entry or manifest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub can: bool,
    #[serde(default)]
    pub iso15765: bool,
    #[serde(default)]
    pub iso9141: bool,
    /// KWP2000
    #[serde(default)]
    pub iso14230: bool,
    #[serde(default)]
    pub j1850vpw: bool,
    #[serde(default)]
    pub j1850pwm: bool,
    #[serde(default)]
    pub sci_a_engine: bool,
    #[serde(default)]
    pub sci_a_trans: bool,
    #[serde(default)]
    pub sci_b_engine: bool,
    #[serde(default)]
    pub sci_b_trans: bool,
}

impl Capabilities {
    pub fn supports(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Can => self.can,
            Protocol::Iso15765 => self.iso15765,
            Protocol::Iso9141 => self.iso9141,
            Protocol::Iso14230 => self.iso14230,
            Protocol::J1850Vpw => self.j1850vpw,
            Protocol::J1850Pwm => self.j1850pwm,
            Protocol::SciAEngine => self.sci_a_engine,
            Protocol::SciATrans => self.sci_a_trans,
            Protocol::SciBEngine => self.sci_b_engine,
            Protocol::SciBTrans => self.sci_b_trans,
        }
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        Protocol::ALL
            .into_iter()
            .filter(|p| self.supports(*p))
            .collect()
    }
}

/// One discoverable adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    pub vendor: String,
    /// Driver library implementing the PassThru API
    #[serde(alias = "drv_path")]
    pub library_path: PathBuf,
    #[serde(flatten)]
    pub capabilities: Capabilities,
}

/// Version info from a J2534 device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub fw_version: String,
    pub api_version: String,
    pub dll_version: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadDeviceError {
    #[error("No device name attribute")]
    NoName,
    #[error("No device vendor attribute")]
    NoVendor,
    #[error("No device function library attribute")]
    NoFunctionLib,
    #[error("No permission reading {0}")]
    NoPermission(PathBuf),
    #[error("Device JSON file malformed: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Library load error: {0}")]
    LibLoad(String),
}

impl From<LoadDeviceError> for PassThruError {
    fn from(e: LoadDeviceError) -> Self {
        let kind = match e {
            LoadDeviceError::LibLoad(_) => ErrorKind::LibraryLoad,
            _ => ErrorKind::Config,
        };
        PassThruError::with_detail(kind, e.to_string())
    }
}

/// PassThru device manifest as installed for Unix drivers
#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(rename = "NAME")]
    name: Option<String>,
    #[serde(rename = "VENDOR")]
    vendor: Option<String>,
    #[serde(rename = "FUNCTION_LIB")]
    function_lib: Option<String>,
    #[serde(rename = "CAN", default)]
    can: bool,
    #[serde(rename = "ISO15765", default)]
    iso15765: bool,
    #[serde(rename = "ISO9141", default)]
    iso9141: bool,
    #[serde(rename = "ISO14230", default)]
    iso14230: bool,
    #[serde(rename = "J1850VPW", default)]
    j1850vpw: bool,
    #[serde(rename = "J1850PWM", default)]
    j1850pwm: bool,
    #[serde(rename = "SCI_A_ENGINE", default)]
    sci_a_engine: bool,
    // Some vendors ship the misspelled key
    #[serde(rename = "SCI_A_TRANS", alias = "SCN_A_TRANS", default)]
    sci_a_trans: bool,
    #[serde(rename = "SCI_B_ENGINE", default)]
    sci_b_engine: bool,
    #[serde(rename = "SCI_B_TRANS", default)]
    sci_b_trans: bool,
}

impl TryFrom<Manifest> for DeviceDescriptor {
    type Error = LoadDeviceError;

    fn try_from(m: Manifest) -> Result<Self, Self::Error> {
        let library = m.function_lib.ok_or(LoadDeviceError::NoFunctionLib)?;
        let name = m.name.ok_or(LoadDeviceError::NoName)?;
        let vendor = m.vendor.ok_or(LoadDeviceError::NoVendor)?;
        Ok(Self {
            name,
            vendor,
            library_path: expand_home(&library),
            capabilities: Capabilities {
                can: m.can,
                iso15765: m.iso15765,
                iso9141: m.iso9141,
                iso14230: m.iso14230,
                j1850vpw: m.j1850vpw,
                j1850pwm: m.j1850pwm,
                sci_a_engine: m.sci_a_engine,
                sci_a_trans: m.sci_a_trans,
                sci_b_engine: m.sci_b_engine,
                sci_b_trans: m.sci_b_trans,
            },
        })
    }
}

/// Parse a device manifest JSON file into a descriptor
pub fn load_manifest(path: &Path) -> Result<DeviceDescriptor, LoadDeviceError> {
    let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => LoadDeviceError::NoPermission(path.to_path_buf()),
        _ => LoadDeviceError::Io(e),
    })?;
    let manifest: Manifest = serde_json::from_str(&text)?;
    DeviceDescriptor::try_from(manifest)
}

/// Replace a leading `~` with the user's home directory
pub fn expand_home(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

/// Read every `*.json` manifest in a directory.
/// A missing directory means no devices. Broken manifests are skipped.
pub fn discover_manifests(dir: &Path) -> Result<Vec<DeviceDescriptor>, LoadDeviceError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("Manifest directory {} does not exist", dir.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut devices: Vec<DeviceDescriptor> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .filter_map(|path| match load_manifest(&path) {
            Ok(device) => Some(device),
            Err(e) => {
                log::warn!("Skipping manifest {}: {}", path.display(), e);
                None
            }
        })
        .collect();
    devices.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}

/// Discover J2534 devices from the Windows registry.
/// Searches both native and WOW6432Node views, deduplicated by library path.
#[cfg(target_os = "windows")]
pub fn discover_registry(key_path: &str) -> Result<Vec<DeviceDescriptor>, LoadDeviceError> {
    use std::collections::HashSet;

    use winreg::enums::*;
    use winreg::RegKey;

    fn read_bool(key: &RegKey, name: &str) -> bool {
        key.get_value::<u32, _>(name).map(|v| v != 0).unwrap_or(false)
    }

    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    let views = [KEY_READ | KEY_WOW64_64KEY, KEY_READ | KEY_WOW64_32KEY];

    let mut devices = Vec::new();
    let mut seen = HashSet::new();

    for flags in views {
        let Ok(root) = hklm.open_subkey_with_flags(key_path, flags) else {
            continue;
        };
        for name in root.enum_keys().filter_map(|k| k.ok()) {
            let Ok(sub) = root.open_subkey_with_flags(&name, KEY_READ) else {
                continue;
            };
            let Ok(library) = sub.get_value::<String, _>("FunctionLibrary") else {
                log::warn!("Registry entry {} has no FunctionLibrary", name);
                continue;
            };
            if !seen.insert(library.to_lowercase()) {
                continue;
            }
            devices.push(DeviceDescriptor {
                name: sub
                    .get_value::<String, _>("Name")
                    .unwrap_or_else(|_| name.clone()),
                vendor: sub.get_value::<String, _>("Vendor").unwrap_or_default(),
                library_path: PathBuf::from(library),
                capabilities: Capabilities {
                    can: read_bool(&sub, "CAN"),
                    iso15765: read_bool(&sub, "ISO15765"),
                    iso9141: read_bool(&sub, "ISO9141"),
                    iso14230: read_bool(&sub, "ISO14230"),
                    j1850vpw: read_bool(&sub, "J1850VPW"),
                    j1850pwm: read_bool(&sub, "J1850PWM"),
                    sci_a_engine: read_bool(&sub, "SCI_A_ENGINE"),
                    sci_a_trans: read_bool(&sub, "SCI_A_TRANS"),
                    sci_b_engine: read_bool(&sub, "SCI_B_ENGINE"),
                    sci_b_trans: read_bool(&sub, "SCI_B_TRANS"),
                },
            });
        }
    }

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_load_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "macchina.json",
            r#"{
                "NAME": "Macchina A0",
                "VENDOR": "Macchina",
                "FUNCTION_LIB": "/usr/lib/libm2_a0.so",
                "CAN": true,
                "ISO15765": true,
                "SCN_A_TRANS": true
            }"#,
        );
        let dev = load_manifest(&path).unwrap();
        assert_eq!(dev.name, "Macchina A0");
        assert_eq!(dev.vendor, "Macchina");
        assert_eq!(dev.library_path, PathBuf::from("/usr/lib/libm2_a0.so"));
        assert!(dev.capabilities.can);
        assert!(dev.capabilities.iso15765);
        assert!(dev.capabilities.sci_a_trans);
        assert!(!dev.capabilities.iso9141);
        assert_eq!(
            dev.capabilities.protocols(),
            vec![Protocol::Can, Protocol::Iso15765, Protocol::SciATrans]
        );
    }

    #[test]
    fn test_manifest_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let no_lib = write(dir.path(), "a.json", r#"{"NAME": "x", "VENDOR": "y"}"#);
        assert!(matches!(
            load_manifest(&no_lib),
            Err(LoadDeviceError::NoFunctionLib)
        ));
        let no_name = write(dir.path(), "b.json", r#"{"FUNCTION_LIB": "l", "VENDOR": "y"}"#);
        assert!(matches!(load_manifest(&no_name), Err(LoadDeviceError::NoName)));
        let no_vendor = write(dir.path(), "c.json", r#"{"FUNCTION_LIB": "l", "NAME": "x"}"#);
        assert!(matches!(
            load_manifest(&no_vendor),
            Err(LoadDeviceError::NoVendor)
        ));
    }

    #[test]
    fn test_manifest_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "bad.json", "{ not json");
        let err = load_manifest(&path).unwrap_err();
        assert!(matches!(err, LoadDeviceError::InvalidJson(_)));
        let converted: PassThruError = err.into();
        assert_eq!(converted.kind, ErrorKind::Config);
    }

    #[test]
    fn test_manifest_missing_file() {
        let err = load_manifest(Path::new("/nonexistent/device.json")).unwrap_err();
        assert!(matches!(err, LoadDeviceError::Io(_)));
    }

    #[test]
    fn test_discover_skips_broken_and_non_json() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "b.json",
            r#"{"NAME": "Beta", "VENDOR": "V", "FUNCTION_LIB": "/b.so"}"#,
        );
        write(
            dir.path(),
            "a.json",
            r#"{"NAME": "Alpha", "VENDOR": "V", "FUNCTION_LIB": "/a.so"}"#,
        );
        write(dir.path(), "broken.json", r#"{"NAME": "Broken"}"#);
        write(dir.path(), "readme.txt", "not a manifest");

        let devices = discover_manifests(dir.path()).unwrap();
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "Beta"]);
    }

    #[test]
    fn test_discover_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let devices = discover_manifests(&dir.path().join("absent")).unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn test_expand_home() {
        let home = PathBuf::from(shellexpand::tilde("~").as_ref());
        assert_eq!(
            expand_home("~/.passthru/lib.so"),
            home.join(".passthru/lib.so")
        );
        assert_eq!(expand_home("/abs/lib.so"), PathBuf::from("/abs/lib.so"));
        assert_eq!(expand_home("~other/x"), PathBuf::from("~other/x"));
    }

    #[test]
    fn test_descriptor_json_shape() {
        let dev = DeviceDescriptor {
            name: "Mongoose".into(),
            vendor: "Drew".into(),
            library_path: PathBuf::from("mongoose.dll"),
            capabilities: Capabilities {
                iso15765: true,
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&dev).unwrap();
        assert_eq!(json["name"], "Mongoose");
        assert_eq!(json["iso15765"], true);
        assert_eq!(json["can"], false);

        // Older front-ends send drv_path
        let back: DeviceDescriptor = serde_json::from_str(
            r#"{"name":"Mongoose","vendor":"Drew","drv_path":"mongoose.dll","iso15765":true}"#,
        )
        .unwrap();
        assert_eq!(back, dev);
    }
}
