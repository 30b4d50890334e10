//! On-disk workspace for a script session
//!
//! Every session owns one directory tree:
//!
//! ```text
//! {root}/
//! ├── data/             ← inputs the scripts read
//! ├── outputs/          ← intermediate files
//! ├── visualizations/   ← charts (matplotlib runs headless)
//! └── reports/          ← final write-ups
//! ```
//!
//! The tree is created idempotently and re-ensured before every execution,
//! so a script that deletes a subdirectory cannot break the next call.

use std::io;
use std::path::{Path, PathBuf};

/// Subdirectories created under every workspace root, in creation order
pub const SUBDIRECTORIES: [&str; 4] = ["data", "outputs", "visualizations", "reports"];

/// Binding name for the workspace root
pub const WORKSPACE_PATH: &str = "WORKSPACE_PATH";
/// Binding name for `data/`
pub const DATA_DIR: &str = "DATA_DIR";
/// Binding name for `outputs/`
pub const OUTPUT_DIR: &str = "OUTPUT_DIR";
/// Binding name for `visualizations/`
pub const VIZ_DIR: &str = "VIZ_DIR";
/// Binding name for `reports/`
pub const REPORTS_DIR: &str = "REPORTS_DIR";
/// Binding name for the supporting document, when one is configured
pub const DOCUMENT_PATH: &str = "DOCUMENT_PATH";

/// An absolute workspace root with its fixed layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Resolve `path` to an absolute location and create the directory tree
    ///
    /// Calling this again for the same path is a no-op apart from re-creating
    /// missing subdirectories.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let workspace = Self {
            root: absolutize(path.as_ref())?,
        };
        workspace.ensure_layout()?;
        Ok(workspace)
    }

    /// Create any missing part of the layout
    pub fn ensure_layout(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        for dir in SUBDIRECTORIES {
            std::fs::create_dir_all(self.root.join(dir))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join("outputs")
    }

    pub fn visualizations_dir(&self) -> PathBuf {
        self.root.join("visualizations")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    /// Named path constants exposed to every script
    pub fn constants(&self) -> Vec<(&'static str, PathBuf)> {
        vec![
            (WORKSPACE_PATH, self.root.clone()),
            (DATA_DIR, self.data_dir()),
            (OUTPUT_DIR, self.outputs_dir()),
            (VIZ_DIR, self.visualizations_dir()),
            (REPORTS_DIR, self.reports_dir()),
        ]
    }

    /// Human-readable description of the layout
    pub fn describe(&self) -> String {
        [
            format!("Workspace: {}", self.root.display()),
            format!("Data directory: {}", self.data_dir().display()),
            format!("Outputs directory: {}", self.outputs_dir().display()),
            format!(
                "Visualizations directory: {}",
                self.visualizations_dir().display()
            ),
            format!("Reports directory: {}", self.reports_dir().display()),
        ]
        .join("\n")
    }
}

/// Make a path absolute against the current directory without touching the
/// filesystem (the target may not exist yet)
pub fn absolutize(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
