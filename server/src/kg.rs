use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::episode::{Episode, EpisodeKind};

/// Append-only sink for episodes.
pub trait GraphStore: Send + Sync {
	/// Persist one episode and return the sequence number it was stored under.
	fn append_episode(&self, episode: &Episode) -> Result<u64>;
}

impl GraphStore for sled::Db {
	fn append_episode(&self, episode: &Episode) -> Result<u64> {
		append_episode(self, episode)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEpisode {
	pub seq: u64,
	#[serde(flatten)]
	pub episode: Episode,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GraphCounts {
	pub episodes: u64,
	pub nodes: u64,
	pub edges: u64,
}

pub fn append_episode(db: &sled::Db, episode: &Episode) -> Result<u64> {
	let episodes = db.open_tree("episodes")?;
	let by_path = db.open_tree("episodes_by_path")?;
	let seq = db.generate_id()?;
	let stored = StoredEpisode { seq, episode: episode.clone() };
	episodes.insert(seq.to_be_bytes(), serde_json::to_vec(&stored)?)?;
	by_path.insert(path_index_key(&episode.path, seq).as_bytes(), seq.to_be_bytes().to_vec())?;
	// The derived graph is a view over the episodes; a failure here must not
	// make the caller believe the append itself failed.
	if let Err(err) = project_episode(db, episode) {
		warn!(episode = %episode.id, error = %err, "failed to project episode into graph");
	}
	Ok(seq)
}

fn path_index_key(path: &str, seq: u64) -> String {
	format!("{}\u{0}{:020}", path, seq)
}

fn project_episode(db: &sled::Db, episode: &Episode) -> Result<()> {
	let created_at = episode.reference_time.timestamp_millis();
	ensure_episode_node(db, episode, created_at)?;
	let episode_key = format!("Episode::{}", episode.id);
	match episode.kind {
		EpisodeKind::File => {
			if let Some(file) = episode.file_entity() {
				let node_key = format!("File::{}", file.path);
				let val = serde_json::json!({
					"type": "File",
					"path": file.path,
					"name": file.name,
					"size": file.size,
					"modification_time": file.modification_time,
					"parent": file.parent,
					"deleted": false,
					"last_episode": episode.id,
					"updated_at": created_at,
				});
				upsert_node(db, &node_key, val)?;
				add_edge_generic(db, &episode_key, &node_key, "OBSERVED", created_at)?;
				add_edge_generic(db, &node_key, &format!("Directory::{}", file.parent), "CONTAINED_IN", created_at)?;
			}
		}
		EpisodeKind::Directory => {
			if let Some(dir) = episode.directory_entity() {
				let node_key = format!("Directory::{}", dir.path);
				let val = serde_json::json!({
					"type": "Directory",
					"path": dir.path,
					"name": dir.name,
					"parent": dir.parent,
					"deleted": false,
					"last_episode": episode.id,
					"updated_at": created_at,
				});
				upsert_node(db, &node_key, val)?;
				add_edge_generic(db, &episode_key, &node_key, "OBSERVED", created_at)?;
				if let Some(parent) = dir.parent.as_deref() {
					add_edge_generic(db, &node_key, &format!("Directory::{}", parent), "CONTAINED_IN", created_at)?;
				}
			}
		}
		EpisodeKind::Deletion => {
			let nodes = db.open_tree("kg_nodes")?;
			for node_key in [format!("File::{}", episode.path), format!("Directory::{}", episode.path)] {
				if let Some(raw) = nodes.get(node_key.as_bytes())? {
					let mut node: serde_json::Value = serde_json::from_slice(&raw)?;
					node["deleted"] = serde_json::json!(true);
					node["last_episode"] = serde_json::json!(episode.id);
					node["updated_at"] = serde_json::json!(created_at);
					nodes.insert(node_key.as_bytes(), serde_json::to_vec(&node)?)?;
					add_edge_generic(db, &episode_key, &node_key, "DELETED", created_at)?;
				}
			}
		}
	}
	Ok(())
}

pub fn ensure_episode_node(db: &sled::Db, episode: &Episode, created_at: i64) -> Result<()> {
	let nodes = db.open_tree("kg_nodes")?;
	let key = format!("Episode::{}", episode.id);
	if nodes.get(key.as_bytes())?.is_none() {
		let val = serde_json::json!({
			"type": "Episode",
			"id": episode.id,
			"name": episode.name,
			"source_description": episode.source_description(),
			"path": episode.path,
			"created_at": created_at,
		});
		nodes.insert(key.as_bytes(), serde_json::to_vec(&val)?)?;
	}
	Ok(())
}

fn upsert_node(db: &sled::Db, key: &str, val: serde_json::Value) -> Result<()> {
	let nodes = db.open_tree("kg_nodes")?;
	nodes.insert(key.as_bytes(), serde_json::to_vec(&val)?)?;
	Ok(())
}

pub fn add_edge_generic(db: &sled::Db, src: &str, dst: &str, relation: &str, created_at: i64) -> Result<()> {
	let edges = db.open_tree("kg_edges")?;
	let key = format!("{}->{}::{}", src, dst, relation);
	let val = serde_json::json!({ "src": src, "dst": dst, "relation": relation, "created_at": created_at });
	edges.insert(key.as_bytes(), serde_json::to_vec(&val)?)?;
	Ok(())
}

/// Episode history for one path, oldest first.
pub fn episodes_for_path(db: &sled::Db, path: &str, limit: usize) -> Result<Vec<StoredEpisode>> {
	let episodes = db.open_tree("episodes")?;
	let by_path = db.open_tree("episodes_by_path")?;
	let prefix = format!("{}\u{0}", path);
	let mut out = Vec::new();
	for kv in by_path.scan_prefix(prefix.as_bytes()) {
		if out.len() >= limit { break; }
		let (_, seq) = kv?;
		if let Some(raw) = episodes.get(seq)? {
			out.push(serde_json::from_slice::<StoredEpisode>(&raw)?);
		}
	}
	Ok(out)
}

/// Most recent episodes across all paths, newest first.
pub fn recent_episodes(db: &sled::Db, limit: usize) -> Result<Vec<StoredEpisode>> {
	let episodes = db.open_tree("episodes")?;
	let mut out = Vec::new();
	for kv in episodes.iter().rev() {
		if out.len() >= limit { break; }
		let (_, v) = kv?;
		out.push(serde_json::from_slice::<StoredEpisode>(&v)?);
	}
	Ok(out)
}

/// Search entity nodes whose path matches `pattern`.
pub fn search_nodes(db: &sled::Db, node_type: Option<&str>, pattern: &Regex, include_deleted: bool, limit: usize) -> Result<Vec<serde_json::Value>> {
	let nodes = db.open_tree("kg_nodes")?;
	let mut results: Vec<serde_json::Value> = Vec::new();

	for kv in nodes.iter() {
		if results.len() >= limit { break; }
		let (k, v) = kv?;
		let key = String::from_utf8(k.to_vec()).unwrap_or_default();
		if key.starts_with("Episode::") { continue; }
		let Ok(node) = serde_json::from_slice::<serde_json::Value>(&v) else { continue };
		if let Some(nt) = node_type {
			if node.get("type").and_then(|t| t.as_str()) != Some(nt) { continue; }
		}
		if !include_deleted && node.get("deleted").and_then(|d| d.as_bool()).unwrap_or(false) { continue; }
		let path = node.get("path").and_then(|p| p.as_str()).unwrap_or_default();
		if !pattern.is_match(path) { continue; }
		let mut result = node.clone();
		result["nodeKey"] = serde_json::json!(key);
		results.push(result);
	}

	Ok(results)
}

/// `CONTAINED_IN` edges as (child, parent) node keys.
pub fn containment_edges(db: &sled::Db, limit: usize) -> Result<Vec<(String, String)>> {
	let edges = db.open_tree("kg_edges")?;
	let mut out = Vec::new();
	for kv in edges.iter() {
		if out.len() >= limit { break; }
		let (_, v) = kv?;
		let Ok(edge) = serde_json::from_slice::<serde_json::Value>(&v) else { continue };
		if edge.get("relation").and_then(|r| r.as_str()) != Some("CONTAINED_IN") { continue; }
		let src = edge.get("src").and_then(|s| s.as_str()).unwrap_or_default().to_string();
		let dst = edge.get("dst").and_then(|s| s.as_str()).unwrap_or_default().to_string();
		out.push((src, dst));
	}
	Ok(out)
}

pub fn graph_counts(db: &sled::Db) -> Result<GraphCounts> {
	Ok(GraphCounts {
		episodes: db.open_tree("episodes")?.len() as u64,
		nodes: db.open_tree("kg_nodes")?.len() as u64,
		edges: db.open_tree("kg_edges")?.len() as u64,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::episode::{DirectoryEntity, FileEntity};
	use std::path::Path;

	fn open_db() -> (tempfile::TempDir, sled::Db) {
		let dir = tempfile::TempDir::new().unwrap();
		let db = sled::open(dir.path().join("graph")).unwrap();
		(dir, db)
	}

	fn file_episode(path: &str, size: u64) -> Episode {
		let p = Path::new(path);
		Episode::for_file(&FileEntity {
			path: path.to_string(),
			name: p.file_name().unwrap().to_string_lossy().into_owned(),
			size,
			modification_time: chrono::Utc::now(),
			parent: p.parent().unwrap().display().to_string(),
		}).unwrap()
	}

	#[test]
	fn appends_accumulate_history_per_path() {
		let (_dir, db) = open_db();
		let first = db.append_episode(&file_episode("/data/a.txt", 10)).unwrap();
		let second = db.append_episode(&file_episode("/data/a.txt", 20)).unwrap();
		db.append_episode(&file_episode("/data/b.txt", 1)).unwrap();
		assert!(second > first);

		let history = episodes_for_path(&db, "/data/a.txt", 100).unwrap();
		let sizes: Vec<u64> = history.iter().map(|e| e.episode.file_entity().unwrap().size).collect();
		assert_eq!(sizes, vec![10, 20]);
	}

	#[test]
	fn path_prefixes_do_not_leak_into_history() {
		let (_dir, db) = open_db();
		db.append_episode(&file_episode("/data/a", 1)).unwrap();
		db.append_episode(&file_episode("/data/a.txt", 2)).unwrap();
		assert_eq!(episodes_for_path(&db, "/data/a", 10).unwrap().len(), 1);
	}

	#[test]
	fn deletion_flags_node_but_keeps_episodes() {
		let (_dir, db) = open_db();
		db.append_episode(&file_episode("/data/a.txt", 10)).unwrap();
		db.append_episode(&Episode::for_deletion(Path::new("/data/a.txt")).unwrap()).unwrap();

		let history = episodes_for_path(&db, "/data/a.txt", 10).unwrap();
		assert_eq!(history.len(), 2);
		assert_eq!(history[1].episode.kind, EpisodeKind::Deletion);

		let any = Regex::new("a\\.txt").unwrap();
		assert!(search_nodes(&db, Some("File"), &any, false, 10).unwrap().is_empty());
		let with_deleted = search_nodes(&db, Some("File"), &any, true, 10).unwrap();
		assert_eq!(with_deleted.len(), 1);
		assert_eq!(with_deleted[0]["deleted"], true);
	}

	#[test]
	fn directory_projection_links_to_parent() {
		let (_dir, db) = open_db();
		let dir = DirectoryEntity { path: "/data/sub".into(), name: "sub".into(), parent: Some("/data".into()) };
		db.append_episode(&Episode::for_directory(&dir).unwrap()).unwrap();
		db.append_episode(&file_episode("/data/sub/f.txt", 3)).unwrap();

		let edges = containment_edges(&db, 10).unwrap();
		assert!(edges.contains(&("Directory::/data/sub".to_string(), "Directory::/data".to_string())));
		assert!(edges.contains(&("File::/data/sub/f.txt".to_string(), "Directory::/data/sub".to_string())));
	}

	#[test]
	fn recent_episodes_are_newest_first() {
		let (_dir, db) = open_db();
		db.append_episode(&file_episode("/data/one", 1)).unwrap();
		db.append_episode(&file_episode("/data/two", 2)).unwrap();
		let recent = recent_episodes(&db, 1).unwrap();
		assert_eq!(recent.len(), 1);
		assert_eq!(recent[0].episode.path, "/data/two");
	}

	#[test]
	fn counts_cover_episodes_nodes_and_edges() {
		let (_dir, db) = open_db();
		db.append_episode(&file_episode("/data/a.txt", 10)).unwrap();
		let counts = graph_counts(&db).unwrap();
		assert_eq!(counts.episodes, 1);
		// Episode node + File node.
		assert_eq!(counts.nodes, 2);
		// OBSERVED + CONTAINED_IN.
		assert_eq!(counts.edges, 2);
	}
}
