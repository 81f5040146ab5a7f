//! Entities observed on disk and the episode records they become.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntity {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub modification_time: DateTime<Utc>,
    pub parent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntity {
    pub path: String,
    pub name: String,
    pub parent: Option<String>,
}

/// How the episode body is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeSource {
    Json,
}

/// What the episode describes; serialized as the source description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpisodeKind {
    #[serde(rename = "file_metadata")]
    File,
    #[serde(rename = "directory_metadata")]
    Directory,
    #[serde(rename = "deletion")]
    Deletion,
}

impl EpisodeKind {
    pub fn description(self) -> &'static str {
        match self {
            EpisodeKind::File => "file_metadata",
            EpisodeKind::Directory => "directory_metadata",
            EpisodeKind::Deletion => "deletion",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub name: String,
    pub body: String,
    pub source: EpisodeSource,
    #[serde(rename = "source_description")]
    pub kind: EpisodeKind,
    pub path: String,
    pub reference_time: DateTime<Utc>,
}

#[derive(Serialize)]
struct FilesBody<'a> {
    files: [&'a FileEntity; 1],
}

#[derive(Serialize)]
struct DirectoriesBody<'a> {
    directories: [&'a DirectoryEntity; 1],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMarker {
    pub path: String,
    pub deleted: bool,
}

impl Episode {
    pub fn for_file(entity: &FileEntity) -> serde_json::Result<Self> {
        let body = serde_json::to_string(&FilesBody { files: [entity] })?;
        Ok(Self::new(format!("File_{}", entity.name), body, EpisodeKind::File, &entity.path))
    }

    pub fn for_directory(entity: &DirectoryEntity) -> serde_json::Result<Self> {
        let body = serde_json::to_string(&DirectoriesBody { directories: [entity] })?;
        Ok(Self::new(format!("Dir_{}", entity.name), body, EpisodeKind::Directory, &entity.path))
    }

    pub fn for_deletion(path: &Path) -> serde_json::Result<Self> {
        let path = path.display().to_string();
        let body = serde_json::to_string(&DeletionMarker { path: path.clone(), deleted: true })?;
        Ok(Self::new(format!("Delete_{}", base_name(Path::new(&path))), body, EpisodeKind::Deletion, &path))
    }

    fn new(name: String, body: String, kind: EpisodeKind, path: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            body,
            source: EpisodeSource::Json,
            kind,
            path: path.to_string(),
            reference_time: Utc::now(),
        }
    }

    pub fn source_description(&self) -> &'static str {
        self.kind.description()
    }

    /// The file entity carried by a `file_metadata` episode.
    pub fn file_entity(&self) -> Option<FileEntity> {
        if self.kind != EpisodeKind::File {
            return None;
        }
        let mut body: serde_json::Value = serde_json::from_str(&self.body).ok()?;
        serde_json::from_value(body.get_mut("files")?.get_mut(0)?.take()).ok()
    }

    pub fn directory_entity(&self) -> Option<DirectoryEntity> {
        if self.kind != EpisodeKind::Directory {
            return None;
        }
        let mut body: serde_json::Value = serde_json::from_str(&self.body).ok()?;
        serde_json::from_value(body.get_mut("directories")?.get_mut(0)?.take()).ok()
    }

    pub fn deletion_marker(&self) -> Option<DeletionMarker> {
        if self.kind != EpisodeKind::Deletion {
            return None;
        }
        serde_json::from_str(&self.body).ok()
    }
}

/// Final path component as a string; falls back to the whole path for roots.
pub fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
