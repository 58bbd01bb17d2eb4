use crate::error::{ErrorKind, Result};
use crate::path::extension;
use exn::OptionExt;
use std::path::{Path, PathBuf};

/// One enabled category: a directory under the upload root with its own cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub name: String,
    pub max_files: usize,
    pub display_name: String,
    pub description: String,
}
impl Category {
    pub fn new(name: impl Into<String>, max_files: usize) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            description: String::new(),
            name,
            max_files,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Everything the store needs to know about its directory tree.
///
/// Only enabled categories are passed in; a category missing from this list
/// does not exist as far as the store is concerned.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Upload root; every category is a direct child of it.
    pub root: PathBuf,
    /// Scratch directory for in-flight uploads and staged evictions. Must be
    /// on the same volume as the category directories.
    pub temp_dir: PathBuf,
    /// Lowercase extensions with their leading dot, e.g. `.zip`.
    pub allowed_extensions: Vec<String>,
    pub categories: Vec<Category>,
}
impl StoreSettings {
    /// Settings with the scratch directory at `root/temp`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            temp_dir: root.join("temp"),
            root,
            allowed_extensions: vec![".zip".to_string()],
            categories: Vec::new(),
        }
    }

    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_extensions = extensions
            .into_iter()
            .map(|ext| format!(".{}", ext.as_ref().trim_start_matches('.').to_ascii_lowercase()))
            .collect();
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.categories.push(category);
        self
    }

    pub fn category(&self, name: &str) -> Result<&Category> {
        self.categories
            .iter()
            .find(|category| category.name == name)
            .ok_or_raise(|| ErrorKind::UnknownCategory(name.to_string()))
    }

    pub fn category_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Returns `true` if `filename` carries one of the allowed extensions.
    pub fn is_allowed(&self, filename: &str) -> bool {
        extension(filename).is_some_and(|ext| self.allowed_extensions.iter().any(|allowed| *allowed == ext))
    }
}
