//! Content-addressed ConfigMaps for container files.
//!
//! The literal entries of a container's `filepathToContent` become one
//! ConfigMap whose name is the SHA-1 of the map content. The hash name
//! doubles as change detection (a new name forces a pod restart) and as
//! stateless coordination between the ConfigMap sync and the deployment
//! builder — both derive the same name independently. Containers with
//! identical file maps share a single ConfigMap.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{ConfigMap, ConfigMapVolumeSource, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use kelda_blueprint::{divide_container_values, ContainerValue};
use kelda_db::Container;

use crate::hash::{hash_str, hash_string_map};

/// Volume name under which the file ConfigMap is mounted into a pod.
pub(crate) const FILES_VOLUME_NAME: &str = "filepath-to-content";

/// ConfigMap entries must be usable as both object names and volume
/// sub-paths, so files are read-only for everyone.
const FILE_MODE: i32 = 0o444;

/// The literal (non-secret) file entries of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMap {
    files: BTreeMap<String, String>,
}

impl FileMap {
    pub fn new(filepath_to_content: &BTreeMap<String, ContainerValue>) -> FileMap {
        let (files, _) = divide_container_values(filepath_to_content);
        FileMap { files }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// The ConfigMap name: a consistent hash of the map content.
    pub fn name(&self) -> String {
        hash_string_map(&self.files)
    }

    /// The ConfigMap holding the file contents, keyed by hashed path
    /// (ConfigMap keys must be flat names, paths are not).
    pub fn config_map(&self) -> ConfigMap {
        let data: BTreeMap<String, String> = self
            .files
            .iter()
            .map(|(path, content)| (path_key(path), content.clone()))
            .collect();
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    /// The pod volume referencing this map's ConfigMap.
    pub fn volume(&self) -> Volume {
        Volume {
            name: FILES_VOLUME_NAME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(self.name()),
                default_mode: Some(FILE_MODE),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// One mount per file, sorted by mount path so the pod spec is
    /// byte-identical across rebuilds.
    pub fn volume_mounts(&self) -> Vec<VolumeMount> {
        let mut mounts: Vec<VolumeMount> = self
            .files
            .keys()
            .map(|path| VolumeMount {
                name: FILES_VOLUME_NAME.to_string(),
                mount_path: path.clone(),
                sub_path: Some(path_key(path)),
                read_only: Some(true),
                ..Default::default()
            })
            .collect();
        mounts.sort_by(|a, b| a.mount_path.cmp(&b.mount_path));
        mounts
    }
}

/// ConfigMap keys must be flat lowercase names; hash the path.
pub(crate) fn path_key(path: &str) -> String {
    hash_str(path)
}

/// The ConfigMaps the cluster should hold for `containers`, deduplicated
/// by content hash.
pub fn desired_config_maps(containers: &[Container]) -> Vec<ConfigMap> {
    let mut seen = BTreeSet::new();
    let mut maps = Vec::new();
    for dbc in containers {
        let file_map = FileMap::new(&dbc.filepath_to_content);
        if file_map.is_empty() {
            continue;
        }
        if seen.insert(file_map.name()) {
            maps.push(file_map.config_map());
        }
    }
    maps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container_with_files(entries: &[(&str, &str)]) -> Container {
        let mut files = BTreeMap::new();
        for (path, content) in entries {
            files.insert(path.to_string(), ContainerValue::literal(*content));
        }
        Container {
            filepath_to_content: files,
            ..Default::default()
        }
    }

    #[test]
    fn identical_maps_share_one_config_map() {
        let a = container_with_files(&[("/etc/a", "x")]);
        let b = container_with_files(&[("/etc/a", "x")]);

        let maps = desired_config_maps(&[a, b]);
        assert_eq!(maps.len(), 1);
    }

    #[test]
    fn different_maps_get_distinct_names() {
        let a = container_with_files(&[("/etc/a", "x")]);
        let b = container_with_files(&[("/etc/a", "x"), ("/etc/b", "y")]);

        let maps = desired_config_maps(&[a, b]);
        assert_eq!(maps.len(), 2);
        assert_ne!(maps[0].metadata.name, maps[1].metadata.name);
    }

    #[test]
    fn containers_without_files_produce_nothing() {
        let maps = desired_config_maps(&[Container::default()]);
        assert!(maps.is_empty());
    }

    #[test]
    fn secret_entries_are_excluded() {
        let mut files = BTreeMap::new();
        files.insert("/etc/s".to_string(), ContainerValue::secret("token"));
        let file_map = FileMap::new(&files);
        assert!(file_map.is_empty());
    }

    #[test]
    fn volume_and_mounts_reference_the_same_name() {
        let dbc = container_with_files(&[("/etc/b", "2"), ("/etc/a", "1")]);
        let file_map = FileMap::new(&dbc.filepath_to_content);

        let volume = file_map.volume();
        assert_eq!(volume.config_map.unwrap().name, Some(file_map.name()));

        let mounts = file_map.volume_mounts();
        assert_eq!(mounts.len(), 2);
        // Sorted by mount path.
        assert_eq!(mounts[0].mount_path, "/etc/a");
        assert_eq!(mounts[1].mount_path, "/etc/b");
        assert_eq!(mounts[0].sub_path, Some(path_key("/etc/a")));
        assert_eq!(mounts[0].name, volume.name);
    }

    #[test]
    fn name_is_content_addressed() {
        let a = FileMap::new(&container_with_files(&[("/etc/a", "x")]).filepath_to_content);
        let b = FileMap::new(&container_with_files(&[("/etc/a", "x")]).filepath_to_content);
        let c = FileMap::new(&container_with_files(&[("/etc/a", "y")]).filepath_to_content);

        assert_eq!(a.name(), b.name());
        assert_ne!(a.name(), c.name());
    }
}
