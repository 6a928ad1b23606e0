//! Per-turn working folders under the configured workspace root.

use std::path::{Path, PathBuf};

use taskline_types::ChatOptions;

pub fn project_folder(root: &Path, options: &ChatOptions, project_id: &str) -> PathBuf {
    root.join(options.user_slug())
        .join(format!("project_{project_id}"))
}

pub fn turn_folder(root: &Path, options: &ChatOptions, project_id: &str, turn_id: &str) -> PathBuf {
    project_folder(root, options, project_id).join(format!("task_{turn_id}"))
}

/// Where the engine for this task writes its artifacts. An explicit
/// directory in the options wins over the derived turn folder.
pub fn working_directory(root: &Path, options: &ChatOptions) -> PathBuf {
    match options.working_directory.as_deref() {
        Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => turn_folder(root, options, &options.project_id, &options.task_id),
    }
}

pub async fn prepare_turn_folder(
    root: &Path,
    options: &ChatOptions,
    project_id: &str,
    turn_id: &str,
) -> std::io::Result<PathBuf> {
    let folder = turn_folder(root, options, project_id, turn_id);
    tokio::fs::create_dir_all(&folder).await?;
    Ok(folder)
}

async fn is_empty_dir(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

/// Removes a turn folder nobody wrote into, and its project folder when that
/// is left empty too. Returns true if the turn folder was removed.
pub async fn remove_if_empty(folder: &Path) -> bool {
    if !is_empty_dir(folder).await {
        return false;
    }
    if let Err(err) = tokio::fs::remove_dir(folder).await {
        tracing::warn!("failed to remove empty folder {}: {}", folder.display(), err);
        return false;
    }
    if let Some(parent) = folder.parent() {
        if is_empty_dir(parent).await {
            let _ = tokio::fs::remove_dir(parent).await;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ChatOptions {
        ChatOptions {
            project_id: "p1".to_string(),
            task_id: "t1".to_string(),
            email: "jo smith@example.com".to_string(),
            ..ChatOptions::default()
        }
    }

    #[test]
    fn turn_folder_layout() {
        let root = Path::new("/srv/ws");
        assert_eq!(
            turn_folder(root, &options(), "p1", "t2"),
            PathBuf::from("/srv/ws/jo_smith/project_p1/task_t2")
        );
        let mut explicit = options();
        explicit.working_directory = Some("/tmp/explicit".to_string());
        assert_eq!(
            working_directory(root, &explicit),
            PathBuf::from("/tmp/explicit")
        );
    }

    #[tokio::test]
    async fn empty_turn_folder_is_removed_with_project() {
        let root = tempfile::tempdir().expect("tempdir");
        let folder = prepare_turn_folder(root.path(), &options(), "p1", "t2")
            .await
            .expect("create");
        assert!(folder.is_dir());
        assert!(remove_if_empty(&folder).await);
        assert!(!folder.exists());
        assert!(!project_folder(root.path(), &options(), "p1").exists());
    }

    #[tokio::test]
    async fn folder_with_output_is_kept() {
        let root = tempfile::tempdir().expect("tempdir");
        let folder = prepare_turn_folder(root.path(), &options(), "p1", "t3")
            .await
            .expect("create");
        tokio::fs::write(folder.join("out.md"), "x").await.expect("write");
        assert!(!remove_if_empty(&folder).await);
        assert!(folder.join("out.md").exists());
    }
}
