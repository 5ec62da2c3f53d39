//! Isolation profiles.
//!
//! Builtin profiles are seeded at startup; user profiles come from
//! configuration. The store is immutable once built and shared read-only.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Result, bail, ensure};
use serde::Serialize;
use tracing::debug;
use wsbox_config::{BindConfig, ProfileConfig};
use wsbox_runner::BindMount;

pub const RESTRICTED: &str = "restricted";
pub const STANDARD: &str = "standard";
pub const NETWORK: &str = "network";

const SYSTEM_DIRS: &[&str] = &["/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64"];
const SYSTEM_CONFIG: &[&str] = &[
    "/etc/alternatives",
    "/etc/ld.so.cache",
    "/etc/ld.so.conf",
    "/etc/ld.so.conf.d",
    "/etc/localtime",
    "/etc/ssl",
    "/etc/ca-certificates",
];
const IDENTITY_FILES: &[&str] = &["/etc/passwd", "/etc/group", "/etc/nsswitch.conf"];
const RESOLVER_FILES: &[&str] = &["/etc/resolv.conf", "/etc/hosts"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileBind {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
}

impl ProfileBind {
    pub fn to_mount(&self) -> BindMount {
        BindMount {
            host: self.host_path.clone(),
            target: self.container_path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IsolationProfile {
    pub id: String,
    pub name: String,
    pub description: String,
    pub network_access: bool,
    pub read_only_binds: Vec<ProfileBind>,
    pub read_write_binds: Vec<ProfileBind>,
    pub environment: BTreeMap<String, String>,
    pub hostname: String,
    pub builtin: bool,
}

impl IsolationProfile {
    pub fn read_only_mounts(&self) -> Vec<BindMount> {
        self.read_only_binds.iter().map(ProfileBind::to_mount).collect()
    }

    pub fn read_write_mounts(&self) -> Vec<BindMount> {
        self.read_write_binds.iter().map(ProfileBind::to_mount).collect()
    }
}

fn existing_binds(paths: &[&[&str]], exists: &dyn Fn(&Path) -> bool) -> Vec<ProfileBind> {
    paths
        .iter()
        .flat_map(|group| group.iter())
        .map(Path::new)
        .filter(|path| exists(path))
        .map(|path| ProfileBind {
            host_path: path.to_path_buf(),
            container_path: path.to_path_buf(),
        })
        .collect()
}

fn base_environment() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("HOME".to_string(), "/tmp".to_string()),
        ("TMPDIR".to_string(), "/tmp".to_string()),
    ])
}

fn builtin_profiles(exists: &dyn Fn(&Path) -> bool) -> Vec<IsolationProfile> {
    let restricted = IsolationProfile {
        id: RESTRICTED.to_string(),
        name: "Restricted".to_string(),
        description: "System directories read-only, no network".to_string(),
        network_access: false,
        read_only_binds: existing_binds(&[SYSTEM_DIRS, SYSTEM_CONFIG], exists),
        read_write_binds: Vec::new(),
        environment: base_environment(),
        hostname: "sandbox".to_string(),
        builtin: true,
    };
    let standard = IsolationProfile {
        id: STANDARD.to_string(),
        name: "Standard".to_string(),
        description: "Restricted plus user and group databases, no network".to_string(),
        read_only_binds: existing_binds(&[SYSTEM_DIRS, SYSTEM_CONFIG, IDENTITY_FILES], exists),
        ..restricted.clone()
    };
    let network = IsolationProfile {
        id: NETWORK.to_string(),
        name: "Network".to_string(),
        description: "Standard with host networking and DNS".to_string(),
        network_access: true,
        read_only_binds: existing_binds(
            &[SYSTEM_DIRS, SYSTEM_CONFIG, IDENTITY_FILES, RESOLVER_FILES],
            exists,
        ),
        ..standard.clone()
    };
    vec![restricted, standard, network]
}

fn convert_binds(
    profile: &str,
    binds: &[BindConfig],
    exists: &dyn Fn(&Path) -> bool,
) -> Result<Vec<ProfileBind>> {
    let mut out = Vec::with_capacity(binds.len());
    for bind in binds {
        ensure!(
            bind.host.is_absolute(),
            "profile '{profile}': bind host path {} must be absolute",
            bind.host.display()
        );
        let target = bind.target.clone().unwrap_or_else(|| bind.host.clone());
        ensure!(
            target.is_absolute(),
            "profile '{profile}': bind target {} must be absolute",
            target.display()
        );
        if !exists(&bind.host) {
            if bind.optional {
                debug!(profile, host = %bind.host.display(), "skipping missing optional bind");
                continue;
            }
            bail!(
                "profile '{profile}': bind host path {} does not exist",
                bind.host.display()
            );
        }
        out.push(ProfileBind {
            host_path: bind.host.clone(),
            container_path: target,
        });
    }
    Ok(out)
}

fn user_profile(
    config: &ProfileConfig,
    exists: &dyn Fn(&Path) -> bool,
) -> Result<IsolationProfile> {
    let id = config.id.trim();
    ensure!(!id.is_empty(), "isolation profile id must not be empty");
    let read_only_binds = convert_binds(id, &config.read_only_binds, exists)?;
    let read_write_binds = convert_binds(id, &config.read_write_binds, exists)?;

    let ro_targets: BTreeSet<&Path> = read_only_binds
        .iter()
        .map(|bind| bind.container_path.as_path())
        .collect();
    if let Some(clash) = read_write_binds
        .iter()
        .find(|bind| ro_targets.contains(bind.container_path.as_path()))
    {
        bail!(
            "profile '{id}': {} is bound both read-only and read-write",
            clash.container_path.display()
        );
    }

    Ok(IsolationProfile {
        id: id.to_string(),
        name: config.name.clone().unwrap_or_else(|| id.to_string()),
        description: config.description.clone(),
        network_access: config.network_access,
        read_only_binds,
        read_write_binds,
        environment: config.environment.clone(),
        hostname: config
            .hostname
            .clone()
            .unwrap_or_else(|| "sandbox".to_string()),
        builtin: false,
    })
}

#[derive(Debug, Clone)]
pub struct ProfileStore {
    profiles: Vec<IsolationProfile>,
}

impl ProfileStore {
    /// Builtins plus `user` profiles, checking bind paths on the real host.
    pub fn load(user: &[ProfileConfig]) -> Result<Self> {
        Self::load_with(user, &|path: &Path| path.exists())
    }

    pub fn load_with(user: &[ProfileConfig], exists: &dyn Fn(&Path) -> bool) -> Result<Self> {
        let mut profiles = builtin_profiles(exists);
        for config in user {
            let profile = user_profile(config, exists)?;
            ensure!(
                !profiles.iter().any(|p| p.id == profile.id),
                "isolation profile '{}' is already defined",
                profile.id
            );
            profiles.push(profile);
        }
        Ok(Self { profiles })
    }

    /// Look a profile up by id, then by display name.
    pub fn get(&self, key: &str) -> Option<&IsolationProfile> {
        self.profiles
            .iter()
            .find(|p| p.id == key)
            .or_else(|| self.profiles.iter().find(|p| p.name == key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn all(&self) -> &[IsolationProfile] {
        &self.profiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn everything_exists(_: &Path) -> bool {
        true
    }

    #[test]
    fn builtins_are_seeded() -> Result<()> {
        let store = ProfileStore::load_with(&[], &everything_exists)?;
        let ids: Vec<&str> = store.all().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec![RESTRICTED, STANDARD, NETWORK]);
        assert!(store.all().iter().all(|p| p.builtin));
        assert!(!store.get(RESTRICTED).is_some_and(|p| p.network_access));
        assert!(store.get(NETWORK).is_some_and(|p| p.network_access));
        assert!(store.get("Standard").is_some());
        Ok(())
    }

    #[test]
    fn missing_system_paths_are_skipped() -> Result<()> {
        let store = ProfileStore::load_with(&[], &|path: &Path| path == Path::new("/usr"))?;
        let restricted = store.get(RESTRICTED).map(|p| p.read_only_binds.clone());
        assert_eq!(
            restricted,
            Some(vec![ProfileBind {
                host_path: PathBuf::from("/usr"),
                container_path: PathBuf::from("/usr"),
            }])
        );
        Ok(())
    }

    #[test]
    fn overlapping_binds_are_rejected() {
        let mut config = ProfileConfig::named("ci");
        config.read_only_binds = vec![BindConfig {
            host: PathBuf::from("/opt/cache"),
            target: Some(PathBuf::from("/cache")),
            optional: false,
        }];
        config.read_write_binds = vec![BindConfig {
            host: PathBuf::from("/var/cache"),
            target: Some(PathBuf::from("/cache")),
            optional: false,
        }];
        let err = ProfileStore::load_with(&[config], &everything_exists).unwrap_err();
        assert!(err.to_string().contains("both read-only and read-write"));
    }

    #[test]
    fn required_binds_must_exist() {
        let mut config = ProfileConfig::named("ci");
        config.read_only_binds = vec![BindConfig {
            host: PathBuf::from("/nope"),
            target: None,
            optional: false,
        }];
        assert!(ProfileStore::load_with(&[config.clone()], &|_: &Path| false).is_err());

        config.read_only_binds[0].optional = true;
        let store = ProfileStore::load_with(&[config], &|_: &Path| false);
        assert!(store.is_ok_and(|s| s.get("ci").is_some_and(|p| p.read_only_binds.is_empty())));
    }

    #[test]
    fn builtin_ids_cannot_be_redefined() {
        let err = ProfileStore::load_with(&[ProfileConfig::named(RESTRICTED)], &everything_exists)
            .unwrap_err();
        assert!(err.to_string().contains("already defined"));
    }
}
