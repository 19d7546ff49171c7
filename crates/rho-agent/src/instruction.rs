//! Project instruction files
//!
//! Instructions come from three places, in this order:
//! 1. `AGENTS.md` / `RHO.md` in the working directory and each parent up to
//!    the repository root (nearest first)
//! 2. The global `AGENTS.md` under the rho config directory
//! 3. Paths listed in the `instructions` config key
//!
//! Each file is rendered as `Instructions from: {path}` followed by its
//! content.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::Config;

const INSTRUCTION_FILES: &[&str] = &["AGENTS.md", "RHO.md"];

/// Find the repository root by looking for a .git entry
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Instruction files that exist for `directory`, deduplicated, in load order
pub fn paths(directory: &Path, config: &Config) -> Vec<PathBuf> {
    paths_with_global(directory, config, &Config::config_dir())
}

fn paths_with_global(directory: &Path, config: &Config, global_dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = Vec::new();
    let mut add = |path: PathBuf| {
        if path.is_file() && !found.contains(&path) {
            found.push(path);
        }
    };

    let root = find_repo_root(directory).unwrap_or_else(|| directory.to_path_buf());
    for dir in directory.ancestors() {
        for name in INSTRUCTION_FILES {
            add(dir.join(name));
        }
        if dir == root {
            break;
        }
    }

    add(global_dir.join("AGENTS.md"));

    for instruction in &config.instructions {
        if instruction.starts_with("https://") || instruction.starts_with("http://") {
            debug!(url = %instruction, "skipping remote instruction");
            continue;
        }
        let path = expand_home(instruction);
        add(if path.is_absolute() {
            path
        } else {
            directory.join(path)
        });
    }
    found
}

fn render(paths: Vec<PathBuf>) -> Vec<String> {
    paths
        .into_iter()
        .filter_map(|path| {
            let content = fs::read_to_string(&path).ok()?;
            let content = content.trim();
            if content.is_empty() {
                return None;
            }
            Some(format!("Instructions from: {}\n{}", path.display(), content))
        })
        .collect()
}

/// Instruction blocks for the system prompt
pub fn system(directory: &Path, config: &Config) -> Vec<String> {
    render(paths(directory, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walks_up_to_repo_root() {
        let repo = tempfile::tempdir().unwrap();
        let root = repo.path();
        fs::create_dir(root.join(".git")).unwrap();
        let nested = root.join("crates/core");
        fs::create_dir_all(&nested).unwrap();
        fs::write(root.join("AGENTS.md"), "root rules").unwrap();
        fs::write(nested.join("AGENTS.md"), "crate rules").unwrap();
        fs::write(root.join("extra.md"), "extra rules").unwrap();
        let empty_global = tempfile::tempdir().unwrap();

        let config = Config {
            instructions: vec!["../../extra.md".into(), "https://example.com/rules.md".into()],
            ..Default::default()
        };
        let found = paths_with_global(&nested, &config, empty_global.path());
        assert_eq!(found.len(), 3);
        assert_eq!(found[0], nested.join("AGENTS.md"));
        assert_eq!(found[1], root.join("AGENTS.md"));

        let blocks = render(found);
        assert!(blocks[0].starts_with("Instructions from: "));
        assert!(blocks[0].ends_with("crate rules"));
        assert!(blocks[2].ends_with("extra rules"));
    }

    #[test]
    fn test_global_file_is_included() {
        let project = tempfile::tempdir().unwrap();
        let global = tempfile::tempdir().unwrap();
        fs::write(global.path().join("AGENTS.md"), "global rules").unwrap();

        let found = paths_with_global(project.path(), &Config::default(), global.path());
        assert_eq!(found, vec![global.path().join("AGENTS.md")]);
    }

    #[test]
    fn test_find_repo_root() {
        let repo = tempfile::tempdir().unwrap();
        fs::create_dir(repo.path().join(".git")).unwrap();
        let nested = repo.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_repo_root(&nested).unwrap(), repo.path());
    }
}
