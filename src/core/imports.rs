//! Per-file import tables and their resolution to files inside the repository.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use super::ImportBinding;

/// What an imported local name refers to once resolved against the repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedImport {
    /// A function (or other member) `name` defined in `file`
    Member { file: PathBuf, name: String },
    /// A whole module backed by `file`
    Module { file: PathBuf },
}

/// Mapping from locally-bound name to the module it was imported from
#[derive(Debug, Clone, Default)]
pub struct ImportTable {
    bindings: HashMap<String, ImportBinding>,
}

impl ImportTable {
    /// Later bindings shadow earlier ones, as rebinding does at runtime
    pub fn from_bindings(bindings: Vec<ImportBinding>) -> Self {
        let mut table = Self::default();
        for binding in bindings {
            table.bindings.insert(binding.local_name.clone(), binding);
        }
        table
    }

    pub fn get(&self, local_name: &str) -> Option<&ImportBinding> {
        self.bindings.get(local_name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Resolve a local name to a repository file; external modules yield `None`
    pub fn resolve(&self, local_name: &str, importing_file: &Path, repo_root: &Path) -> Option<ResolvedImport> {
        let binding = self.bindings.get(local_name)?;

        match &binding.symbol {
            None => resolve_module(&binding.module, importing_file, repo_root)
                .map(|file| ResolvedImport::Module { file }),
            Some(symbol) => {
                // `from pkg import mod` may bind a submodule rather than a member
                let submodule = join_module(&binding.module, symbol);
                if let Some(file) = resolve_module(&submodule, importing_file, repo_root) {
                    return Some(ResolvedImport::Module { file });
                }
                resolve_module(&binding.module, importing_file, repo_root).map(|file| {
                    ResolvedImport::Member {
                        file,
                        name: symbol.clone(),
                    }
                })
            }
        }
    }

    /// Resolve a dotted receiver such as `utils` or `pkg.utils` to a module file
    pub fn resolve_receiver(&self, receiver: &str, importing_file: &Path, repo_root: &Path) -> Option<PathBuf> {
        let mut segments = receiver.split('.');
        let head = segments.next()?;
        let rest: Vec<&str> = segments.collect();

        let base = match self.resolve(head, importing_file, repo_root)? {
            ResolvedImport::Module { file } => file,
            ResolvedImport::Member { .. } => return None,
        };
        if rest.is_empty() {
            return Some(base);
        }

        let binding = self.bindings.get(head)?;
        let base_module = match &binding.symbol {
            Some(symbol) => join_module(&binding.module, symbol),
            None => binding.module.clone(),
        };
        resolve_module(&join_module(&base_module, &rest.join(".")), importing_file, repo_root)
    }
}

fn join_module(module: &str, member: &str) -> String {
    if module.is_empty() || module.ends_with('.') {
        format!("{}{}", module, member)
    } else {
        format!("{}.{}", module, member)
    }
}

/// Map a (possibly relative) dotted module to `<dir>/<mod>.py` or `<dir>/<mod>/__init__.py`.
///
/// Relative modules are anchored at the importing file's package. Absolute modules
/// are tried against the repository root first, then next to the importing file.
pub fn resolve_module(module: &str, importing_file: &Path, repo_root: &Path) -> Option<PathBuf> {
    let module = module.trim();
    if module.is_empty() {
        return None;
    }

    let package_dir = importing_file.parent().unwrap_or(repo_root);

    if module.starts_with('.') {
        let dots = module.chars().take_while(|c| *c == '.').count();
        let mut base = package_dir.to_path_buf();
        for _ in 1..dots {
            if !base.pop() || !base.starts_with(repo_root) {
                return None;
            }
        }
        let rest = &module[dots..];
        if rest.is_empty() {
            return module_file(&base, &[]);
        }
        let parts: Vec<&str> = rest.split('.').filter(|p| !p.is_empty()).collect();
        return module_file(&base, &parts);
    }

    let parts: Vec<&str> = module.split('.').filter(|p| !p.is_empty()).collect();
    module_file(repo_root, &parts).or_else(|| {
        if package_dir != repo_root {
            module_file(package_dir, &parts)
        } else {
            None
        }
    })
}

fn module_file(base: &Path, parts: &[&str]) -> Option<PathBuf> {
    let mut dir = base.to_path_buf();
    for part in parts {
        dir.push(part);
    }

    if !parts.is_empty() {
        let file = dir.with_extension("py");
        if file.is_file() {
            return Some(normalize(&file));
        }
    }
    let init = dir.join("__init__.py");
    if init.is_file() {
        return Some(normalize(&init));
    }
    None
}

/// Lexically drop `.` components so ids stay stable
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(local: &str, module: &str, symbol: Option<&str>) -> ImportBinding {
        ImportBinding {
            local_name: local.to_string(),
            module: module.to_string(),
            symbol: symbol.map(str::to_string),
            line: 1,
        }
    }

    fn fixture() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::create_dir_all(root.join("backend/services")).unwrap();
        std::fs::write(root.join("backend/__init__.py"), "").unwrap();
        std::fs::write(root.join("backend/services/__init__.py"), "").unwrap();
        std::fs::write(root.join("backend/services/analytics.py"), "def run():\n    pass\n").unwrap();
        std::fs::write(root.join("backend/services/processor.py"), "def process():\n    pass\n").unwrap();
        std::fs::write(root.join("backend/util.py"), "def helper():\n    pass\n").unwrap();
        (dir, root)
    }

    #[test]
    fn relative_from_import_resolves_member() {
        let (_dir, root) = fixture();
        let importing = root.join("backend/services/analytics.py");
        let table = ImportTable::from_bindings(vec![
            binding("process", ".processor", Some("process")),
            binding("h", "..util", Some("helper")),
        ]);

        assert_eq!(
            table.resolve("process", &importing, &root),
            Some(ResolvedImport::Member {
                file: root.join("backend/services/processor.py"),
                name: "process".to_string(),
            })
        );
        assert_eq!(
            table.resolve("h", &importing, &root),
            Some(ResolvedImport::Member {
                file: root.join("backend/util.py"),
                name: "helper".to_string(),
            })
        );
    }

    #[test]
    fn absolute_imports_and_submodules() {
        let (_dir, root) = fixture();
        let importing = root.join("main.py");
        let table = ImportTable::from_bindings(vec![
            binding("processor", "backend.services", Some("processor")),
            binding("backend", "backend", None),
            binding("requests", "requests", None),
        ]);

        assert_eq!(
            table.resolve("processor", &importing, &root),
            Some(ResolvedImport::Module {
                file: root.join("backend/services/processor.py"),
            })
        );
        assert_eq!(
            table.resolve_receiver("backend.util", &importing, &root),
            Some(root.join("backend/util.py"))
        );
        assert_eq!(table.resolve("requests", &importing, &root), None);
        assert_eq!(table.resolve("unknown", &importing, &root), None);
    }

    #[test]
    fn relative_import_cannot_escape_repository() {
        let (_dir, root) = fixture();
        let importing = root.join("main.py");
        let table = ImportTable::from_bindings(vec![binding("x", "...outside", Some("x"))]);
        assert_eq!(table.resolve("x", &importing, &root), None);
    }
}
