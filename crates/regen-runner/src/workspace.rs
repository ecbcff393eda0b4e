use anyhow::{Context, Result};
use regen_core::{ensure_dir, RegenConfig, RunKey};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Remove-then-recreate the workspace so no state leaks between
/// attempts, seeding it from the test's template directory when one
/// exists. Called before every test-runner invocation.
pub fn prepare(config: &RegenConfig, key: &RunKey) -> Result<()> {
    let root = &config.workspace_root;
    if root.exists() {
        fs::remove_dir_all(root)
            .with_context(|| format!("failed to clear workspace {}", root.display()))?;
    }
    fs::create_dir_all(root)
        .with_context(|| format!("failed to create workspace {}", root.display()))?;
    if let Some(template) = config.template_dir(key) {
        copy_tree(&template, root)?;
    }
    Ok(())
}

pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(entry.path(), &target)
                .with_context(|| format!("failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}
