use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::EngineError;
use crate::language::LanguageProfile;

const WORKSPACE_DIR_PERMISSIONS: u32 = 0o755;
// The sandbox identity is unprivileged and must be able to write build output
const BUILD_DIR_PERMISSIONS: u32 = 0o777;
const SOURCE_FILE_PERMISSIONS: u32 = 0o644;

pub const BUILD_DIR_NAME: &str = "build";

/// Ids of workspaces currently owned by an in-flight request
#[derive(Debug, Clone, Default)]
pub struct ActiveWorkspaces(Arc<Mutex<HashSet<String>>>);

impl ActiveWorkspaces {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, id: &str) -> bool {
        self.0.lock().insert(id.to_string())
    }

    fn remove(&self, id: &str) -> bool {
        self.0.lock().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// A point-in-time copy, so callers never hold the lock across I/O
    pub fn snapshot(&self) -> HashSet<String> {
        self.0.lock().clone()
    }
}

/// Allocates per-request scratch directories under a single root
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
    active: ActiveWorkspaces,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            EngineError::workspace_io(format!("creating root {}", root.display()), e)
        })?;

        log::info!("Workspace root at {}", root.display());
        Ok(Self {
            root,
            active: ActiveWorkspaces::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn active(&self) -> &ActiveWorkspaces {
        &self.active
    }

    /// Creates a fresh workspace and materializes the source file in it
    ///
    /// The returned guard removes everything it created when released or dropped,
    /// including when this function itself fails halfway.
    pub fn acquire(
        &self,
        profile: &'static LanguageProfile,
        source_code: &str,
    ) -> Result<Workspace, EngineError> {
        let id = Uuid::new_v4().simple().to_string();
        let dir = self.root.join(&id);
        let source_name = if profile.fixed_entry_name {
            profile.source_name.to_string()
        } else {
            format!("{id}.{}", profile.source_extension)
        };

        // Registered before the directory exists so a concurrent sweep never sees it unowned
        self.active.insert(&id);
        let workspace = Workspace {
            source_path: dir.join(source_name),
            build_dir: dir.join(BUILD_DIR_NAME),
            compiled_artifact_path: None,
            profile,
            id,
            dir,
            active: self.active.clone(),
            released: false,
        };

        workspace.materialize(source_code)?;
        log::debug!("Acquired workspace {}", workspace.id);
        Ok(workspace)
    }
}

/// One execution attempt's scratch area, exclusively owned by its request
#[derive(Debug)]
pub struct Workspace {
    id: String,
    dir: PathBuf,
    source_path: PathBuf,
    build_dir: PathBuf,
    compiled_artifact_path: Option<PathBuf>,
    profile: &'static LanguageProfile,
    active: ActiveWorkspaces,
    released: bool,
}

impl Workspace {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    pub fn compiled_artifact_path(&self) -> Option<&Path> {
        self.compiled_artifact_path.as_deref()
    }

    pub fn profile(&self) -> &'static LanguageProfile {
        self.profile
    }

    /// Records where a successful compile left its artifact
    pub fn mark_compiled(&mut self) {
        self.compiled_artifact_path = self
            .profile
            .artifact_name
            .map(|name| self.build_dir.join(name));
    }

    fn materialize(&self, source_code: &str) -> Result<(), EngineError> {
        fs::create_dir(&self.dir)
            .and_then(|_| {
                fs::set_permissions(
                    &self.dir,
                    fs::Permissions::from_mode(WORKSPACE_DIR_PERMISSIONS),
                )
            })
            .map_err(|e| EngineError::workspace_io("creating workspace directory", e))?;

        fs::create_dir(&self.build_dir)
            .and_then(|_| {
                fs::set_permissions(
                    &self.build_dir,
                    fs::Permissions::from_mode(BUILD_DIR_PERMISSIONS),
                )
            })
            .map_err(|e| EngineError::workspace_io("creating build directory", e))?;

        fs::write(&self.source_path, format!("{source_code}\n"))
            .and_then(|_| {
                fs::set_permissions(
                    &self.source_path,
                    fs::Permissions::from_mode(SOURCE_FILE_PERMISSIONS),
                )
            })
            .map_err(|e| EngineError::workspace_io("writing source file", e))?;

        Ok(())
    }

    /// Removes the workspace from disk and from the active set
    ///
    /// Releasing twice is a no-op. The id leaves the active set even when removal fails,
    /// leaving the leftovers to the reclaimer.
    pub fn release(&mut self) -> Result<(), EngineError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let removed = match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::workspace_io(
                format!("removing workspace {}", self.id),
                e,
            )),
        };
        self.active.remove(&self.id);

        if removed.is_ok() {
            log::debug!("Released workspace {}", self.id);
        }
        removed
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("Failed to clean up workspace on drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::Language;

    fn manager() -> (tempfile::TempDir, WorkspaceManager) {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path().join("ws")).unwrap();
        (tmp, manager)
    }

    fn dir_count(path: &Path) -> usize {
        fs::read_dir(path).unwrap().count()
    }

    #[test]
    fn test_acquire_materializes_source() {
        let (_tmp, manager) = manager();
        let ws = manager
            .acquire(Language::Python.profile(), "print(input())")
            .unwrap();

        assert!(ws.dir().starts_with(manager.root()));
        assert!(ws.build_dir().is_dir());
        assert_eq!(
            ws.source_path().file_name().unwrap().to_string_lossy(),
            format!("{}.py", ws.id())
        );
        assert_eq!(
            fs::read_to_string(ws.source_path()).unwrap(),
            "print(input())\n"
        );
        let mode = fs::metadata(ws.build_dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, BUILD_DIR_PERMISSIONS);
        assert!(manager.active().contains(ws.id()));
    }

    #[test]
    fn test_java_uses_canonical_file_name() {
        let (_tmp, manager) = manager();
        let ws = manager
            .acquire(Language::Java.profile(), "public class Solution {}")
            .unwrap();
        assert_eq!(ws.source_path().file_name().unwrap(), "Solution.java");
    }

    #[test]
    fn test_release_removes_everything_once() {
        let (_tmp, manager) = manager();
        let mut ws = manager.acquire(Language::Cpp.profile(), "int main(){}").unwrap();
        ws.mark_compiled();
        fs::write(ws.compiled_artifact_path().unwrap(), b"ELF").unwrap();
        let dir = ws.dir().to_path_buf();

        ws.release().unwrap();
        assert!(!dir.exists());
        assert!(manager.active().is_empty());

        // Second release is a no-op
        ws.release().unwrap();
        assert!(ws.is_released());
    }

    #[test]
    fn test_release_tolerates_missing_directory() {
        let (_tmp, manager) = manager();
        let mut ws = manager.acquire(Language::Python.profile(), "pass").unwrap();
        fs::remove_dir_all(ws.dir()).unwrap();
        ws.release().unwrap();
        assert!(manager.active().is_empty());
    }

    #[test]
    fn test_drop_releases() {
        let (_tmp, manager) = manager();
        {
            let _ws = manager.acquire(Language::Python.profile(), "pass").unwrap();
            assert_eq!(dir_count(manager.root()), 1);
        }
        assert_eq!(dir_count(manager.root()), 0);
        assert!(manager.active().is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let (_tmp, manager) = manager();
        let workspaces: Vec<_> = (0..32)
            .map(|_| manager.acquire(Language::Python.profile(), "pass").unwrap())
            .collect();
        let ids: HashSet<_> = workspaces.iter().map(|w| w.id().to_string()).collect();
        assert_eq!(ids.len(), 32);
        assert_eq!(manager.active().len(), 32);
        drop(workspaces);
        assert_eq!(dir_count(manager.root()), 0);
    }

    #[test]
    fn test_failed_release_still_leaves_active_set() {
        let (_tmp, manager) = manager();
        let mut ws = manager.acquire(Language::Python.profile(), "pass").unwrap();
        let id = ws.id().to_string();

        // A plain file where the directory was makes removal fail with something other than NotFound
        fs::remove_dir_all(ws.dir()).unwrap();
        fs::write(ws.dir(), "x").unwrap();

        let err = ws.release().unwrap_err();
        assert!(matches!(err, EngineError::WorkspaceIo { .. }), "{err:?}");
        assert!(ws.is_released());
        assert!(!manager.active().contains(&id));
        assert!(ws.release().is_ok());
    }

    #[test]
    fn test_mark_compiled_without_artifact() {
        let (_tmp, manager) = manager();
        let mut ws = manager.acquire(Language::Python.profile(), "pass").unwrap();
        ws.mark_compiled();
        assert!(ws.compiled_artifact_path().is_none());
    }
}
