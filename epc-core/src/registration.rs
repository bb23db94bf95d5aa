//! Container Registration - Limits and Identities from OCI Bundles
//!
//! Quota configuration and container identities are produced outside the
//! aggregator, at container creation time.  An OCI prestart hook receives the
//! container state on stdin, reads the bundle's `config.json`, and derives:
//!
//! - the container key (the runtime-assigned id from `linux.cgroupsPath`)
//! - the numeric cgroup id (inode of the container's cgroup v2 directory)
//! - the EPC limit (the `SGX_EPC_SIZE*` environment variable, as a
//!   Kubernetes resource quantity)
//!
//! The poststop hook only needs the key to undo the registration.

use crate::error::{AccountingError, Result};
use serde::Deserialize;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable prefix carrying the requested EPC size.
pub const EPC_SIZE_ENV: &str = "SGX_EPC_SIZE";

/// Annotation that opts a container into EPC accounting.
pub const EPC_ANNOTATION: &str = "com.intel.sgx.map";

/// Required value of [`EPC_ANNOTATION`].
pub const EPC_ANNOTATION_VALUE: &str = "container_sgx_epc_limit";

/// Container keys are truncated to this many bytes.
pub const MAX_CONTAINER_KEY_LEN: usize = 64;

const CGROUP_FS_PATH: &str = "/sys/fs/cgroup";
const KUBEPODS_SLICE: &str = "kubepods.slice";

/// Everything needed to register one container with the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub container_key: String,
    pub cgroup_id: u64,
    pub limit_bytes: u64,
}

/// Parse a Kubernetes-style resource quantity into bytes.
///
/// Accepts a non-negative integer with an optional binary (`Ki`, `Mi`, `Gi`,
/// `Ti`, `Pi`, `Ei`) or decimal (`k`, `M`, `G`, `T`, `P`, `E`) suffix.
pub fn parse_quantity(input: &str) -> Result<u64> {
    let invalid = |reason: &str| AccountingError::InvalidQuantity {
        input: input.to_owned(),
        reason: reason.to_owned(),
    };

    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    if digits.is_empty() {
        return Err(invalid("expected a non-negative integer"));
    }

    let multiplier: u64 = match suffix {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        _ => return Err(invalid("unknown suffix")),
    };

    let value: u64 = digits.parse().map_err(|_| invalid("number out of range"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| invalid("quantity overflows 64 bits"))
}

/// Find the EPC limit in a container's `KEY=VALUE` environment.
pub fn epc_limit_from_env<S: AsRef<str>>(env: &[S]) -> Result<u64> {
    for entry in env {
        let mut parts = entry.as_ref().splitn(2, '=');
        let name = parts.next().unwrap_or_default();
        if name.starts_with(EPC_SIZE_ENV) {
            return parse_quantity(parts.next().unwrap_or_default());
        }
    }
    Err(AccountingError::MissingEpcSize(EPC_SIZE_ENV))
}

/// Split a systemd-style `slice:prefix:id` cgroups path.
fn split_cgroups_path(cgroups_path: &str) -> Result<(&str, &str, &str)> {
    let mut parts = cgroups_path.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(slice), Some(prefix), Some(id))
            if !slice.is_empty() && !prefix.is_empty() && !id.is_empty() =>
        {
            Ok((slice, prefix, id))
        }
        _ => Err(AccountingError::InvalidCgroupsPath(cgroups_path.to_owned())),
    }
}

/// The runtime container id from a `slice:prefix:id` cgroups path.
pub fn container_key_from_cgroups_path(cgroups_path: &str) -> Result<String> {
    let (_, _, id) = split_cgroups_path(cgroups_path)?;
    let mut end = id.len().min(MAX_CONTAINER_KEY_LEN);
    while !id.is_char_boundary(end) {
        end -= 1;
    }
    Ok(id[..end].to_owned())
}

/// Root of the cgroup v2 hierarchy on this host.
pub fn cgroup_v2_root() -> PathBuf {
    let root = PathBuf::from(CGROUP_FS_PATH);
    if root.join("cgroup.controllers").exists() {
        root
    } else {
        // Hybrid hierarchy: v2 is mounted under "unified".
        root.join("unified")
    }
}

/// Directory of a Kubernetes container scope under `cgroup_root`.
///
/// `kubepods-besteffort-pod<uid>.slice:cri-containerd:<id>` maps to
/// `<root>/kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod<uid>.slice/cri-containerd-<id>.scope`.
/// Guaranteed pods have no QoS level in between.
pub fn scope_path(cgroup_root: &Path, cgroups_path: &str) -> Result<PathBuf> {
    let (slice, prefix, id) = split_cgroups_path(cgroups_path)?;

    let mut path = cgroup_root.join(KUBEPODS_SLICE);
    for qos in ["besteffort", "burstable"] {
        if slice.starts_with(&format!("kubepods-{qos}")) {
            path.push(format!("kubepods-{qos}.slice"));
            break;
        }
    }
    path.push(slice);
    path.push(format!("{prefix}-{id}.scope"));
    Ok(path)
}

/// Numeric cgroup id of a cgroup v2 directory (its inode number).
pub fn cgroup_id(path: &Path) -> Result<u64> {
    Ok(std::fs::metadata(path)?.ino())
}

/// Container state an OCI runtime passes to hooks on stdin.
#[derive(Debug, Clone, Deserialize)]
pub struct HookState {
    #[serde(default)]
    pub annotations: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub bundle: String,
}

impl HookState {
    /// Parse and validate hook input.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let state: Self = serde_json::from_reader(reader)?;

        match state.annotations.get(EPC_ANNOTATION) {
            None => {
                return Err(AccountingError::InvalidConfig(format!(
                    "annotation {EPC_ANNOTATION} is not set"
                )))
            }
            Some(value) if value != EPC_ANNOTATION_VALUE => {
                return Err(AccountingError::InvalidConfig(format!(
                    "annotation {EPC_ANNOTATION} has incorrect value '{value}'"
                )))
            }
            Some(_) => {}
        }

        if state.bundle.is_empty() {
            return Err(AccountingError::InvalidConfig(
                "'bundle' field is not set".into(),
            ));
        }
        if !Path::new(&state.bundle).is_dir() {
            return Err(AccountingError::InvalidConfig(format!(
                "bundle directory {} does not exist",
                state.bundle
            )));
        }
        Ok(state)
    }

    /// Load the bundle's `config.json`.
    pub fn bundle_config(&self) -> Result<BundleConfig> {
        BundleConfig::load(&Path::new(&self.bundle).join("config.json"))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BundleProcess {
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BundleLinux {
    #[serde(default, rename = "cgroupsPath")]
    pub cgroups_path: String,
}

/// The parts of an OCI runtime `config.json` registration needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BundleConfig {
    #[serde(default)]
    pub process: BundleProcess,
    #[serde(default)]
    pub linux: BundleLinux,
}

impl BundleConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(file)?;
        if config.process.env.is_empty() {
            return Err(AccountingError::InvalidConfig(format!(
                "{}: process.env is empty",
                path.display()
            )));
        }
        if config.linux.cgroups_path.is_empty() {
            return Err(AccountingError::InvalidConfig(format!(
                "{}: linux.cgroupsPath is not set",
                path.display()
            )));
        }
        Ok(config)
    }

    /// Container key only, enough for cleanup.
    pub fn container_key(&self) -> Result<String> {
        container_key_from_cgroups_path(&self.linux.cgroups_path)
    }

    /// Resolve a full registration against the cgroup tree at `cgroup_root`.
    pub fn registration(&self, cgroup_root: &Path) -> Result<Registration> {
        let container_key = self.container_key()?;
        let scope = scope_path(cgroup_root, &self.linux.cgroups_path)?;
        let cgroup_id = cgroup_id(&scope)?;
        let limit_bytes = epc_limit_from_env(&self.process.env)?;
        debug!(
            container_key = %container_key,
            scope = %scope.display(),
            cgroup_id,
            limit_bytes,
            "Resolved container registration"
        );
        Ok(Registration {
            container_key,
            cgroup_id,
            limit_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("512").unwrap(), 512);
        assert_eq!(parse_quantity("64Mi").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_quantity("1Gi").unwrap(), 1 << 30);
        assert_eq!(parse_quantity("500k").unwrap(), 500_000);
        assert_eq!(parse_quantity("2M").unwrap(), 2_000_000);
        assert_eq!(parse_quantity(" 1G ").unwrap(), 1_000_000_000);
    }

    #[test]
    fn test_parse_quantity_rejects_garbage() {
        for bad in ["", "-1", "1.5Gi", "10Qi", "Mi", "16Ei"] {
            assert!(parse_quantity(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_epc_limit_from_env() {
        let env = ["PATH=/bin", "SGX_EPC_SIZE_0=32Mi"];
        assert_eq!(epc_limit_from_env(&env).unwrap(), 32 << 20);

        let missing: [&str; 1] = ["PATH=/bin"];
        assert!(matches!(
            epc_limit_from_env(&missing),
            Err(AccountingError::MissingEpcSize(_))
        ));
    }

    #[test]
    fn test_container_key_from_cgroups_path() {
        let key = container_key_from_cgroups_path(
            "kubepods-besteffort-pod1.slice:cri-containerd:abcdef",
        )
        .unwrap();
        assert_eq!(key, "abcdef");

        let long = format!("slice:prefix:{}", "a".repeat(100));
        assert_eq!(container_key_from_cgroups_path(&long).unwrap().len(), 64);

        assert!(container_key_from_cgroups_path("/kubepods/pod1/abc").is_err());
    }

    #[test]
    fn test_scope_path_with_qos() {
        let path = scope_path(
            Path::new("/sys/fs/cgroup"),
            "kubepods-burstable-pod42.slice:cri-containerd:c0ffee",
        )
        .unwrap();
        assert_eq!(
            path,
            PathBuf::from(
                "/sys/fs/cgroup/kubepods.slice/kubepods-burstable.slice/\
                 kubepods-burstable-pod42.slice/cri-containerd-c0ffee.scope"
            )
        );
    }

    #[test]
    fn test_scope_path_guaranteed() {
        let path = scope_path(Path::new("/cg"), "kubepods-pod7.slice:crio:abc").unwrap();
        assert_eq!(
            path,
            PathBuf::from("/cg/kubepods.slice/kubepods-pod7.slice/crio-abc.scope")
        );
    }

    #[test]
    fn test_bundle_registration() {
        let root = tempfile::tempdir().unwrap();
        let scope = root
            .path()
            .join("kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod1.slice/cri-containerd-abc.scope");
        std::fs::create_dir_all(&scope).unwrap();

        let bundle = tempfile::tempdir().unwrap();
        std::fs::write(
            bundle.path().join("config.json"),
            r#"{
                "process": { "env": ["SGX_EPC_SIZE=16Mi"] },
                "linux": { "cgroupsPath": "kubepods-besteffort-pod1.slice:cri-containerd:abc" }
            }"#,
        )
        .unwrap();

        let stdin = format!(
            r#"{{ "annotations": {{ "com.intel.sgx.map": "container_sgx_epc_limit" }}, "bundle": "{}" }}"#,
            bundle.path().display()
        );
        let state = HookState::from_reader(stdin.as_bytes()).unwrap();
        let registration = state.bundle_config().unwrap().registration(root.path()).unwrap();

        assert_eq!(registration.container_key, "abc");
        assert_eq!(registration.limit_bytes, 16 << 20);
        assert_eq!(registration.cgroup_id, cgroup_id(&scope).unwrap());
    }

    #[test]
    fn test_hook_state_rejects_wrong_annotation() {
        let stdin = r#"{ "annotations": { "com.intel.sgx.map": "other" }, "bundle": "/" }"#;
        assert!(HookState::from_reader(stdin.as_bytes()).is_err());

        let stdin = r#"{ "bundle": "/" }"#;
        assert!(HookState::from_reader(stdin.as_bytes()).is_err());
    }

    #[test]
    fn test_hook_state_rejects_missing_bundle() {
        let stdin = r#"{ "annotations": { "com.intel.sgx.map": "container_sgx_epc_limit" } }"#;
        assert!(HookState::from_reader(stdin.as_bytes()).is_err());

        let stdin = r#"{ "annotations": { "com.intel.sgx.map": "container_sgx_epc_limit" }, "bundle": "/does/not/exist" }"#;
        assert!(HookState::from_reader(stdin.as_bytes()).is_err());
    }
}
