use std::path::Path;

use anyhow::Result;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::Match;

const DEFAULT_PATTERNS: &[&str] = &[
    "node_modules/",
    "vendor/",
    "dist/",
    "build/",
    "out/",
    "target/",
    "bin/",
    "obj/",
    "coverage/",
    "__pycache__/",
    "venv/",
    "env/",
    "site-packages/",
    "bower_components/",
    "Pods/",
    "DerivedData/",
];

const SOURCE_EXTENSIONS: &[&str] = &[
    "c", "cc", "cpp", "cs", "css", "cxx", "dart", "ex", "exs", "go", "gradle", "groovy", "h",
    "hpp", "html", "java", "js", "jsx", "kt", "kts", "less", "lua", "m", "mm", "php", "pl", "py",
    "r", "rb", "rs", "scala", "scss", "sh", "sql", "swift", "ts", "tsx", "vue", "yaml", "yml",
];

#[derive(Clone)]
pub struct SourceFilter {
    matcher: Gitignore,
    rules: Vec<String>,
}

impl SourceFilter {
    pub fn new(root: &Path) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);
        let mut rules = Vec::new();
        for pattern in DEFAULT_PATTERNS {
            builder
                .add_line(None, pattern)
                .map_err(|err| anyhow::anyhow!("invalid ignore pattern {pattern}: {err}"))?;
            rules.push(pattern.to_string());
        }
        let matcher = builder
            .build()
            .map_err(|err| anyhow::anyhow!("failed to build ignore matcher: {err}"))?;
        Ok(Self { matcher, rules })
    }

    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        let hidden = path
            .file_name()
            .map(|name| name.to_string_lossy().starts_with('.'))
            .unwrap_or(false);
        if hidden {
            return true;
        }
        match self.matcher.matched(path, is_dir) {
            Match::None | Match::Whitelist(_) => false,
            Match::Ignore(_) => true,
        }
    }

    pub fn rules(&self) -> &[String] {
        &self.rules
    }
}

pub fn source_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
    SOURCE_EXTENSIONS
        .binary_search(&ext.as_str())
        .ok()
        .map(|_| ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_table_is_sorted_for_lookup() {
        assert!(SOURCE_EXTENSIONS.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn recognizes_source_extensions_case_insensitively() {
        assert_eq!(source_extension(Path::new("src/main.RS")).as_deref(), Some("rs"));
        assert_eq!(source_extension(Path::new("a/b.tsx")).as_deref(), Some("tsx"));
        assert_eq!(source_extension(Path::new("README.md")), None);
        assert_eq!(source_extension(Path::new("Makefile")), None);
    }

    #[test]
    fn skips_hidden_and_listed_directories() {
        let root = Path::new("/scratch/repo");
        let filter = SourceFilter::new(root).unwrap();
        assert!(filter.is_ignored(&root.join(".git"), true));
        assert!(filter.is_ignored(&root.join(".eslintrc.js"), false));
        assert!(filter.is_ignored(&root.join("node_modules"), true));
        assert!(filter.is_ignored(&root.join("web/dist"), true));
        assert!(!filter.is_ignored(&root.join("src"), true));
        assert!(!filter.is_ignored(&root.join("src/build.rs"), false));
        assert!(!filter.rules().is_empty());
    }
}
