//! Compilation units and import linking
//!
//! One unit per source file: its arena, top-level node list and scope
//! stacks. The unit manager loads `USING` imports idempotently,
//! detects cycles, and keeps units in dependency order so generation
//! can lower imports before their importers.

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::frontend::ast::{Ast, NodeId};
use crate::frontend::lexer::Lexer;
use crate::frontend::parser::Parser;
use crate::frontend::semantic::{Resolver, ScopeStack, Symbol, TypeScopes};
use crate::utils::{Error, Result};

/// One source file's parsed and resolved state
#[derive(Debug, Default)]
pub struct CompilationUnit {
    /// Display name (file stem or REPL label)
    pub name: String,
    /// Import key this unit is registered under; empty for the root
    pub key: String,
    /// Namespace path; empty for the root unit
    pub namespace: Vec<String>,
    pub file_id: u32,
    pub ast: Ast,
    /// Top-level nodes in file order
    pub roots: Vec<NodeId>,
    /// Finished object scopes; the bottom scope holds the globals
    pub objects: ScopeStack,
    /// Finished type scopes
    pub types: TypeScopes,
    /// Keys of units linked through USING, in import order
    pub links: Vec<String>,
    /// Signatures of every callable this unit references, keyed by
    /// mangled name
    pub callables: IndexMap<String, Symbol>,
}

/// Loads, resolves and tracks compilation units
pub struct UnitManager {
    search_paths: Vec<PathBuf>,
    units: IndexMap<String, CompilationUnit>,
    /// Import keys currently being resolved, for cycle detection
    loading: Vec<String>,
    next_file_id: u32,
}

impl UnitManager {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            units: IndexMap::new(),
            loading: Vec::new(),
            next_file_id: 0,
        }
    }

    pub fn add_search_path(&mut self, path: PathBuf) {
        if !self.search_paths.contains(&path) {
            self.search_paths.push(path);
        }
    }

    /// Load, parse and resolve the root source file. The file's
    /// directory joins the search paths so sibling imports resolve.
    pub fn load_root(&mut self, path: &Path) -> Result<CompilationUnit> {
        let source = fs::read_to_string(path)
            .map_err(|e| Error::Io(format!("{}: {}", path.display(), e)))?;
        if let Some(dir) = path.parent() {
            self.add_search_path(dir.to_path_buf());
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("main")
            .to_string();
        self.compile_unit(&source, &name, String::new(), Vec::new())
    }

    /// Parse and resolve a source string as a root unit (REPL, tests)
    pub fn load_source(&mut self, source: &str, name: &str) -> Result<CompilationUnit> {
        self.compile_unit(source, name, String::new(), Vec::new())
    }

    /// Idempotently load, resolve and register an imported path.
    /// Returns the unit key; an already-loaded path is not re-parsed.
    pub fn link_import(&mut self, path: &[String]) -> Result<String> {
        let key = path.join(".");
        if self.units.contains_key(&key) {
            return Ok(key);
        }
        if self.loading.contains(&key) {
            return Err(Error::UnresolvedImport {
                path: key.clone(),
                reason: format!("circular import: {} -> {}", self.loading.join(" -> "), key),
            });
        }

        let file = self.find_import_file(path).ok_or_else(|| Error::UnresolvedImport {
            path: key.clone(),
            reason: format!("no file found under {:?}", self.search_paths),
        })?;
        let source = fs::read_to_string(&file)
            .map_err(|e| Error::Io(format!("{}: {}", file.display(), e)))?;
        log::debug!("loading import {} from {}", key, file.display());

        self.loading.push(key.clone());
        let result = self.compile_unit(
            &source,
            path.last().expect("import path never empty"),
            key.clone(),
            path.to_vec(),
        );
        self.loading.pop();

        let unit = result?;
        self.units.insert(key.clone(), unit);
        Ok(key)
    }

    pub fn unit(&self, key: &str) -> Option<&CompilationUnit> {
        self.units.get(key)
    }

    /// Loaded units in dependency order: a unit is registered only
    /// after everything it imports.
    pub fn units_in_order(&self) -> impl Iterator<Item = &CompilationUnit> {
        self.units.values()
    }

    fn find_import_file(&self, path: &[String]) -> Option<PathBuf> {
        for sp in &self.search_paths {
            let mut candidate = sp.clone();
            for seg in path {
                candidate.push(seg);
            }
            candidate.set_extension("veld");
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    fn compile_unit(
        &mut self,
        source: &str,
        name: &str,
        key: String,
        namespace: Vec<String>,
    ) -> Result<CompilationUnit> {
        let file_id = self.next_file_id;
        self.next_file_id += 1;

        let mut ast = Ast::new();
        let roots = {
            let lexer = Lexer::new(source, file_id);
            let mut parser = Parser::new(lexer, &mut ast);
            parser.parse_unit()?
        };
        log::debug!("parsed unit {} ({} top-level nodes)", name, roots.len());

        let mut unit = CompilationUnit {
            name: name.to_string(),
            key,
            namespace: namespace.clone(),
            file_id,
            ast,
            roots,
            ..Default::default()
        };
        let mut resolver = Resolver::new(&mut *self, namespace);
        resolver.resolve_unit(&mut unit)?;
        Ok(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn manager_with_lib(files: &[(&str, &str)]) -> (tempfile::TempDir, UnitManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        for (name, source) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).expect("mkdir");
            }
            fs::write(&path, source).expect("write");
        }
        let manager = UnitManager::new(vec![dir.path().to_path_buf()]);
        (dir, manager)
    }

    #[test]
    fn test_import_links_symbols() {
        let (_dir, mut manager) = manager_with_lib(&[(
            "mathlib.veld",
            "FUNC Int r = twice(Int a) DO RETURN a + a END Int base = 10",
        )]);
        let unit = manager
            .load_source("USING mathlib mathlib.twice(3)", "main")
            .unwrap();
        assert_eq!(unit.links, vec!["mathlib".to_string()]);
        let lib = manager.unit("mathlib").unwrap();
        let twice = lib.objects.globals().get("twice").unwrap();
        assert_eq!(twice.mangled, "vdiNmathlibN_twice_i");
    }

    #[test]
    fn test_import_is_idempotent() {
        let (_dir, mut manager) =
            manager_with_lib(&[("lib.veld", "Int marker = 1")]);
        manager
            .load_source("USING lib USING lib lib.marker", "main")
            .unwrap();
        assert_eq!(manager.units_in_order().count(), 1);
    }

    #[test]
    fn test_circular_import_detected() {
        let (_dir, mut manager) = manager_with_lib(&[
            ("a.veld", "USING b Int x = 1"),
            ("b.veld", "USING a Int y = 2"),
        ]);
        let err = manager.load_source("USING a", "main").unwrap_err();
        assert!(matches!(err, Error::UnresolvedImport { .. }));
    }

    #[test]
    fn test_missing_import() {
        let (_dir, mut manager) = manager_with_lib(&[]);
        let err = manager.load_source("USING nothere", "main").unwrap_err();
        assert!(matches!(err, Error::UnresolvedImport { .. }));
    }

    #[test]
    fn test_nested_import_path() {
        let (_dir, mut manager) = manager_with_lib(&[(
            "geo/shapes.veld",
            "STRUCT Point DO Int x Int y END",
        )]);
        let unit = manager
            .load_source("USING geo.shapes geo.shapes.Point p p.x = 1", "main")
            .unwrap();
        assert_eq!(unit.links, vec!["geo.shapes".to_string()]);
    }

    #[test]
    fn test_imported_global_reference() {
        let (_dir, mut manager) =
            manager_with_lib(&[("cfg.veld", "Long limit = 100")]);
        let unit = manager
            .load_source("USING cfg Long x = cfg.limit", "main")
            .unwrap();
        // The dot node resolved to the imported global's mangled name
        let last = *unit.roots.last().unwrap();
        if let crate::frontend::ast::NodeKind::VarDef {
            init: Some(init), ..
        } = &unit.ast.node(last).kind
        {
            match &unit.ast.node(*init).res {
                crate::frontend::ast::Resolution::Global { mangled } => {
                    assert_eq!(mangled, "vdlNcfgN_limit");
                }
                other => panic!("expected global resolution, got {:?}", other),
            }
        } else {
            panic!("expected var-def");
        }
    }
}
