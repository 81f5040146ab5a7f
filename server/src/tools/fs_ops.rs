use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use super::{parse_args, FileTool, ToolContext, ToolError};
use crate::episode::base_name;

#[derive(Deserialize)]
struct TwoPaths {
    #[serde(alias = "old_path")]
    source: String,
    #[serde(alias = "new_path")]
    destination: String,
}

#[derive(Deserialize)]
struct OnePath {
    path: String,
}

#[derive(Deserialize)]
struct CreateFileArgs {
    path: String,
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct ZipArgs {
    zip_path: String,
    file_paths: Vec<String>,
}

fn two_path_schema(a: &str, b: &str) -> Value {
    json!({
        "type": "object",
        "properties": { a: {"type": "string"}, b: {"type": "string"} },
        "required": [a, b]
    })
}

fn one_path_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "path": {"type": "string"} },
        "required": ["path"]
    })
}

/// `dest` itself, or `dest/<name of src>` when `dest` is an existing directory.
fn landing_path(src: &Path, dest: PathBuf) -> PathBuf {
    if dest.is_dir() {
        dest.join(base_name(src))
    } else {
        dest
    }
}

#[cfg(unix)]
fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(18) // EXDEV
}

#[cfg(not(unix))]
fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(17) // ERROR_NOT_SAME_DEVICE
}

pub struct RenameFileTool;

impl FileTool for RenameFileTool {
    fn name(&self) -> &'static str {
        "rename_file"
    }

    fn description(&self) -> &'static str {
        "Rename a file from old_path to new_path."
    }

    fn input_schema(&self) -> Value {
        two_path_schema("old_path", "new_path")
    }

    fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let args: TwoPaths = parse_args(args)?;
        let resolved = ctx.authorize(&[args.source.as_str(), args.destination.as_str()])?;
        std::fs::rename(&resolved[0], &resolved[1])?;
        info!(from = %args.source, to = %args.destination, "renamed");
        Ok(format!("Successfully renamed {} to {}", args.source, args.destination))
    }
}

pub struct MoveFileTool;

impl FileTool for MoveFileTool {
    fn name(&self) -> &'static str {
        "move_file"
    }

    fn description(&self) -> &'static str {
        "Move a file from source to destination. A destination directory keeps the file name."
    }

    fn input_schema(&self) -> Value {
        two_path_schema("source", "destination")
    }

    fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let args: TwoPaths = parse_args(args)?;
        let resolved = ctx.authorize(&[args.source.as_str(), args.destination.as_str()])?;
        let (src, dest) = (&resolved[0], landing_path(&resolved[0], resolved[1].clone()));
        ctx.authorize_derived(&dest)?;
        match std::fs::rename(src, &dest) {
            Ok(()) => {}
            Err(err) if is_cross_device(&err) && src.is_file() => {
                std::fs::copy(src, &dest)?;
                std::fs::remove_file(src)?;
            }
            Err(err) => return Err(err.into()),
        }
        info!(from = %args.source, to = %dest.display(), "moved");
        Ok(format!("Successfully moved {} to {}", args.source, args.destination))
    }
}

pub struct CopyFileTool;

impl FileTool for CopyFileTool {
    fn name(&self) -> &'static str {
        "copy_file"
    }

    fn description(&self) -> &'static str {
        "Copy a file from source to destination. A destination directory keeps the file name."
    }

    fn input_schema(&self) -> Value {
        two_path_schema("source", "destination")
    }

    fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let args: TwoPaths = parse_args(args)?;
        let resolved = ctx.authorize(&[args.source.as_str(), args.destination.as_str()])?;
        let dest = landing_path(&resolved[0], resolved[1].clone());
        ctx.authorize_derived(&dest)?;
        std::fs::copy(&resolved[0], &dest)?;
        info!(from = %args.source, to = %dest.display(), "copied");
        Ok(format!("Successfully copied {} to {}", args.source, args.destination))
    }
}

pub struct DeleteFileTool;

impl FileTool for DeleteFileTool {
    fn name(&self) -> &'static str {
        "delete_file"
    }

    fn description(&self) -> &'static str {
        "Delete the file at path. Directories are refused."
    }

    fn input_schema(&self) -> Value {
        one_path_schema()
    }

    fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let args: OnePath = parse_args(args)?;
        let resolved = ctx.authorize(&[args.path.as_str()])?;
        if resolved[0].is_dir() {
            return Err(io::Error::new(io::ErrorKind::Other, format!("{} is a directory", args.path)).into());
        }
        std::fs::remove_file(&resolved[0])?;
        info!(path = %args.path, "deleted");
        Ok(format!("Successfully deleted {}", args.path))
    }
}

pub struct CreateFileTool;

impl FileTool for CreateFileTool {
    fn name(&self) -> &'static str {
        "create_file"
    }

    fn description(&self) -> &'static str {
        "Create a file at path with optional text content, replacing any existing file."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string", "default": ""}
            },
            "required": ["path"]
        })
    }

    fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let args: CreateFileArgs = parse_args(args)?;
        let resolved = ctx.authorize(&[args.path.as_str()])?;
        std::fs::write(&resolved[0], args.content.as_bytes())?;
        info!(path = %args.path, bytes = args.content.len(), "created file");
        Ok(format!("Successfully created {}", args.path))
    }
}

pub struct CreateDirectoryTool;

impl FileTool for CreateDirectoryTool {
    fn name(&self) -> &'static str {
        "create_directory"
    }

    fn description(&self) -> &'static str {
        "Create a directory and any missing parents."
    }

    fn input_schema(&self) -> Value {
        one_path_schema()
    }

    fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let args: OnePath = parse_args(args)?;
        let resolved = ctx.authorize(&[args.path.as_str()])?;
        std::fs::create_dir_all(&resolved[0])?;
        info!(path = %args.path, "created directory");
        Ok(format!("Successfully created {}", args.path))
    }
}

pub struct ZipFilesTool;

impl FileTool for ZipFilesTool {
    fn name(&self) -> &'static str {
        "zip_files"
    }

    fn description(&self) -> &'static str {
        "Create a zip archive at zip_path holding the listed files, stored under their base names."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "zip_path": {"type": "string"},
                "file_paths": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["zip_path", "file_paths"]
        })
    }

    fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let args: ZipArgs = parse_args(args)?;
        let mut all: Vec<&str> = vec![args.zip_path.as_str()];
        all.extend(args.file_paths.iter().map(String::as_str));
        // Always plural: the archive plus its members are checked together.
        let resolved = ctx.authorize(&all).map_err(|_| ToolError::NotAllowed("Paths"))?;
        let (zip_path, members) = resolved.split_first().ok_or(ToolError::NotAllowed("Paths"))?;

        let mut names = HashSet::new();
        let mut inputs = Vec::with_capacity(members.len());
        for member in members {
            let name = base_name(member);
            if !names.insert(name.clone()) {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("duplicate entry name {}", name)).into());
            }
            inputs.push((name, File::open(member)?));
        }

        // Build next to the target and swap it in only once the archive is complete.
        let dir = match zip_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut zip = ZipWriter::new(NamedTempFile::new_in(dir)?);
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, mut file) in inputs {
            zip.start_file(name, options)?;
            io::copy(&mut file, &mut zip)?;
        }
        zip.finish()?.persist(zip_path).map_err(|err| err.error)?;
        info!(zip = %args.zip_path, entries = members.len(), "created zip");
        Ok(format!("Successfully created zip {}", args.zip_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::render;
    use crate::tools::tests::Sandbox;
    use std::io::Read;

    fn run(tool: &dyn FileTool, args: Value, sb: &Sandbox) -> String {
        render(tool.execute(args, &sb.ctx))
    }

    #[test]
    fn rename_inside_root() {
        let sb = Sandbox::new();
        std::fs::write(sb.root.join("a.txt"), b"a").unwrap();
        let (old, new) = (sb.path("a.txt"), sb.path("b.txt"));
        let msg = run(&RenameFileTool, json!({"old_path": old, "new_path": new}), &sb);
        assert_eq!(msg, format!("Successfully renamed {} to {}", old, new));
        assert!(sb.root.join("b.txt").exists());
        assert!(!sb.root.join("a.txt").exists());
    }

    #[test]
    fn move_out_of_root_is_refused_without_side_effects() {
        let sb = Sandbox::new();
        let outside = tempfile::TempDir::new().unwrap();
        std::fs::write(sb.root.join("a.txt"), b"a").unwrap();

        let msg = run(
            &MoveFileTool,
            json!({"source": sb.path("a.txt"), "destination": outside.path().join("a.txt")}),
            &sb,
        );
        assert_eq!(msg, "Error: Paths not allowed");
        assert!(sb.root.join("a.txt").exists());
        assert!(!outside.path().join("a.txt").exists());
    }

    #[test]
    fn move_into_existing_directory_keeps_name() {
        let sb = Sandbox::new();
        std::fs::create_dir(sb.root.join("dest")).unwrap();
        std::fs::write(sb.root.join("a.txt"), b"a").unwrap();

        let msg = run(&MoveFileTool, json!({"source": sb.path("a.txt"), "destination": sb.path("dest")}), &sb);
        assert!(msg.starts_with("Successfully moved"));
        assert!(sb.root.join("dest/a.txt").exists());
    }

    #[test]
    fn copy_keeps_source() {
        let sb = Sandbox::new();
        std::fs::write(sb.root.join("a.txt"), b"hello").unwrap();
        let msg = run(&CopyFileTool, json!({"source": sb.path("a.txt"), "destination": sb.path("b.txt")}), &sb);
        assert!(msg.starts_with("Successfully copied"));
        assert_eq!(std::fs::read(sb.root.join("b.txt")).unwrap(), b"hello");
        assert!(sb.root.join("a.txt").exists());
    }

    #[cfg(unix)]
    fn dest_with_outward_link(sb: &Sandbox) -> tempfile::TempDir {
        let outside = tempfile::TempDir::new().unwrap();
        std::fs::write(outside.path().join("victim.txt"), b"original").unwrap();
        std::fs::create_dir(sb.root.join("dest")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("victim.txt"), sb.root.join("dest/a.txt")).unwrap();
        std::fs::write(sb.root.join("a.txt"), b"overwritten").unwrap();
        outside
    }

    #[cfg(unix)]
    #[test]
    fn copy_into_directory_refuses_outward_link_at_landing_name() {
        let sb = Sandbox::new();
        let outside = dest_with_outward_link(&sb);

        let msg = run(&CopyFileTool, json!({"source": sb.path("a.txt"), "destination": sb.path("dest")}), &sb);
        assert_eq!(msg, "Error: Paths not allowed");
        assert_eq!(std::fs::read(outside.path().join("victim.txt")).unwrap(), b"original");
    }

    #[cfg(unix)]
    #[test]
    fn move_into_directory_refuses_outward_link_at_landing_name() {
        let sb = Sandbox::new();
        let outside = dest_with_outward_link(&sb);

        let msg = run(&MoveFileTool, json!({"source": sb.path("a.txt"), "destination": sb.path("dest")}), &sb);
        assert_eq!(msg, "Error: Paths not allowed");
        assert!(sb.root.join("a.txt").exists());
        assert!(std::fs::symlink_metadata(sb.root.join("dest/a.txt")).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read(outside.path().join("victim.txt")).unwrap(), b"original");
    }

    #[cfg(unix)]
    #[test]
    fn create_file_through_dangling_outward_link_is_refused() {
        let sb = Sandbox::new();
        let outside = tempfile::TempDir::new().unwrap();
        let planted = outside.path().join("planted.txt");
        std::os::unix::fs::symlink(&planted, sb.root.join("link.txt")).unwrap();

        let msg = run(&CreateFileTool, json!({"path": sb.path("link.txt"), "content": "pwned"}), &sb);
        assert_eq!(msg, "Error: Path not allowed");
        assert!(!planted.exists());
    }

    #[test]
    fn copy_of_missing_source_reports_io_error() {
        let sb = Sandbox::new();
        let msg = run(&CopyFileTool, json!({"source": sb.path("nope.txt"), "destination": sb.path("b.txt")}), &sb);
        assert!(msg.starts_with("Error: "));
        assert!(!sb.root.join("b.txt").exists());
    }

    #[test]
    fn delete_refuses_directories_and_outside_paths() {
        let sb = Sandbox::new();
        std::fs::create_dir(sb.root.join("d")).unwrap();
        std::fs::write(sb.root.join("f.txt"), b"f").unwrap();

        assert!(run(&DeleteFileTool, json!({"path": sb.path("d")}), &sb).starts_with("Error: "));
        assert!(sb.root.join("d").is_dir());
        assert_eq!(run(&DeleteFileTool, json!({"path": "/etc/hosts"}), &sb), "Error: Path not allowed");
        assert_eq!(run(&DeleteFileTool, json!({"path": sb.path("f.txt")}), &sb), format!("Successfully deleted {}", sb.path("f.txt")));
        assert!(!sb.root.join("f.txt").exists());
    }

    #[test]
    fn create_file_defaults_to_empty_content() {
        let sb = Sandbox::new();
        run(&CreateFileTool, json!({"path": sb.path("empty.txt")}), &sb);
        run(&CreateFileTool, json!({"path": sb.path("full.txt"), "content": "abc"}), &sb);
        assert_eq!(std::fs::metadata(sb.root.join("empty.txt")).unwrap().len(), 0);
        assert_eq!(std::fs::read_to_string(sb.root.join("full.txt")).unwrap(), "abc");
    }

    #[test]
    fn create_directory_is_recursive_and_idempotent() {
        let sb = Sandbox::new();
        let nested = sb.path("x/y/z");
        assert!(run(&CreateDirectoryTool, json!({"path": nested}), &sb).starts_with("Successfully created"));
        assert!(run(&CreateDirectoryTool, json!({"path": nested}), &sb).starts_with("Successfully created"));
        assert!(sb.root.join("x/y/z").is_dir());
    }

    #[test]
    fn zip_entries_are_base_names() {
        let sb = Sandbox::new();
        std::fs::create_dir(sb.root.join("sub")).unwrap();
        std::fs::write(sb.root.join("a.txt"), b"alpha").unwrap();
        std::fs::write(sb.root.join("sub/b.txt"), b"beta").unwrap();

        let msg = run(
            &ZipFilesTool,
            json!({"zip_path": sb.path("out.zip"), "file_paths": [sb.path("a.txt"), sb.path("sub/b.txt")]}),
            &sb,
        );
        assert_eq!(msg, format!("Successfully created zip {}", sb.path("out.zip")));

        let mut archive = zip::ZipArchive::new(File::open(sb.root.join("out.zip")).unwrap()).unwrap();
        let mut names: Vec<String> = (0..archive.len()).map(|i| archive.by_index(i).unwrap().name().to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "b.txt"]);

        let mut body = String::new();
        archive.by_name("b.txt").unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "beta");
    }

    #[test]
    fn zip_with_outside_member_creates_nothing() {
        let sb = Sandbox::new();
        std::fs::write(sb.root.join("a.txt"), b"alpha").unwrap();
        let msg = run(
            &ZipFilesTool,
            json!({"zip_path": sb.path("out.zip"), "file_paths": [sb.path("a.txt"), "/etc/hostname"]}),
            &sb,
        );
        assert_eq!(msg, "Error: Paths not allowed");
        assert!(!sb.root.join("out.zip").exists());
    }

    #[test]
    fn failed_zip_leaves_existing_archive_untouched() {
        let sb = Sandbox::new();
        std::fs::create_dir(sb.root.join("x")).unwrap();
        std::fs::create_dir(sb.root.join("y")).unwrap();
        std::fs::write(sb.root.join("x/a.txt"), b"one").unwrap();
        std::fs::write(sb.root.join("y/a.txt"), b"two").unwrap();
        std::fs::write(sb.root.join("out.zip"), b"precious existing bytes").unwrap();

        let msg = run(
            &ZipFilesTool,
            json!({"zip_path": sb.path("out.zip"), "file_paths": [sb.path("x/a.txt"), sb.path("y/a.txt")]}),
            &sb,
        );
        assert!(msg.starts_with("Error: duplicate entry name a.txt"), "{}", msg);
        assert_eq!(std::fs::read(sb.root.join("out.zip")).unwrap(), b"precious existing bytes");
        assert_eq!(std::fs::read_dir(&sb.root).unwrap().count(), 3);
    }

    #[test]
    fn zip_replaces_existing_archive_on_success() {
        let sb = Sandbox::new();
        std::fs::write(sb.root.join("a.txt"), b"alpha").unwrap();
        std::fs::write(sb.root.join("out.zip"), b"stale").unwrap();

        let msg = run(&ZipFilesTool, json!({"zip_path": sb.path("out.zip"), "file_paths": [sb.path("a.txt")]}), &sb);
        assert!(msg.starts_with("Successfully created zip"));
        let archive = zip::ZipArchive::new(File::open(sb.root.join("out.zip")).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
    }
}
