//! Path filtering for the ingestion pipeline's walk and watch paths.

use std::path::Path;

use crate::config::IngestionConfig;

pub struct FileFilter {
    ignore_folders: Vec<String>,
    ignore_prefixes: Vec<String>,
    ignore_suffixes: Vec<String>,
}

impl FileFilter {
    pub fn new(config: &IngestionConfig) -> Self {
        Self {
            ignore_folders: config.ignore_folders.clone(),
            ignore_prefixes: config.ignore_prefixes.clone(),
            ignore_suffixes: config.ignore_suffixes.clone(),
        }
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        for component in path.components() {
            if let Some(name) = component.as_os_str().to_str() {
                if self.ignore_folders.iter().any(|f| f == name) {
                    return true;
                }
            }
        }

        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return true;
        };

        if self.ignore_prefixes.iter().any(|p| file_name.starts_with(p.as_str())) {
            return true;
        }
        if self.ignore_suffixes.iter().any(|s| file_name.ends_with(s.as_str())) {
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> IngestionConfig {
        IngestionConfig::default()
    }

    #[test]
    fn ignores_configured_folder() {
        let filter = FileFilter::new(&config());
        assert!(filter.is_ignored(&PathBuf::from("workspace/.git/HEAD")));
    }

    #[test]
    fn ignores_dotfile_prefix() {
        let filter = FileFilter::new(&config());
        assert!(filter.is_ignored(&PathBuf::from("workspace/.hidden.md")));
    }

    #[test]
    fn ignores_tmp_suffix() {
        let filter = FileFilter::new(&config());
        assert!(filter.is_ignored(&PathBuf::from("workspace/note.md.tmp")));
    }

    #[test]
    fn keeps_ordinary_file() {
        let filter = FileFilter::new(&config());
        assert!(!filter.is_ignored(&PathBuf::from("workspace/diary/2024-01-01.md")));
    }
}
