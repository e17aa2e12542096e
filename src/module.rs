//! Module graph: dependency resolution and processing order
//!
//! The middle-end receives one type-checked AST per module together with
//! its declared imports. Modules are compiled in topological order of the
//! import graph; a dependency cycle is a compile error naming every module
//! on the cycle.

use std::collections::{HashMap, HashSet};

use crate::ast::Exp;
use crate::errors::{name_err, CResult};
use crate::loc::FileId;
use crate::symtab::Id;

/// The distinguished module whose definitions get no mangling prefix
pub const BUILTINS_MODULE: &str = "Builtins";

/// Unique identifier for a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u32);

/// A single input module: its symbol, its type-checked top-level
/// statements, and the modules it imports
#[derive(Debug, Clone)]
pub struct Module {
    pub id: ModuleId,
    /// Module symbol; its prefix is the module name
    pub sym: Id,
    pub name: String,
    pub file: FileId,
    pub ast: Vec<Exp>,
    pub deps: Vec<ModuleId>,
    /// True for the entrypoint module (drives `main` emission)
    pub is_main: bool,
}

impl Module {
    pub fn is_builtins(&self) -> bool {
        self.name == BUILTINS_MODULE
    }
}

/// Dependency graph over the compilation's modules
#[derive(Debug, Default)]
pub struct ModuleGraph {
    modules: Vec<Module>,
    by_name: HashMap<String, ModuleId>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module; ids are handed out densely in registration order
    pub fn add_module(
        &mut self,
        sym: Id,
        name: &str,
        file: FileId,
        ast: Vec<Exp>,
        is_main: bool,
    ) -> ModuleId {
        let id = ModuleId(self.modules.len() as u32);
        self.by_name.insert(name.to_string(), id);
        self.modules.push(Module {
            id,
            sym,
            name: name.to_string(),
            file,
            ast,
            deps: Vec::new(),
            is_main,
        });
        id
    }

    pub fn add_dependency(&mut self, from: ModuleId, to: ModuleId) {
        let deps = &mut self.modules[from.0 as usize].deps;
        if !deps.contains(&to) {
            deps.push(to);
        }
    }

    pub fn get(&self, id: ModuleId) -> &Module {
        &self.modules[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ModuleId) -> &mut Module {
        &mut self.modules[id.0 as usize]
    }

    pub fn id_by_name(&self, name: &str) -> Option<ModuleId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.iter()
    }

    /// Topologically sort modules so every dependency precedes its
    /// dependents. A cycle yields exactly one diagnostic listing the
    /// members of the cycle in import order.
    pub fn topological_sort(&self) -> CResult<Vec<ModuleId>> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut visiting = HashSet::new();
        let mut stack = Vec::new();

        for id in 0..self.modules.len() {
            let id = ModuleId(id as u32);
            if !visited.contains(&id) {
                self.topo_visit(id, &mut visited, &mut visiting, &mut stack, &mut result)?;
            }
        }

        Ok(result)
    }

    fn topo_visit(
        &self,
        id: ModuleId,
        visited: &mut HashSet<ModuleId>,
        visiting: &mut HashSet<ModuleId>,
        stack: &mut Vec<ModuleId>,
        result: &mut Vec<ModuleId>,
    ) -> CResult<()> {
        if visited.contains(&id) {
            return Ok(());
        }

        if visiting.contains(&id) {
            // The cycle is the tail of the visit stack starting at the
            // first occurrence of `id`.
            let start = stack.iter().position(|&m| m == id).unwrap_or(0);
            let members: Vec<&str> =
                stack[start..].iter().map(|&m| self.get(m).name.as_str()).collect();
            return Err(name_err(
                crate::loc::Loc::NONE,
                format!("cyclic module dependency: {}", members.join(" -> ")),
            ));
        }

        visiting.insert(id);
        stack.push(id);

        for &dep in &self.get(id).deps {
            self.topo_visit(dep, visited, visiting, stack, result)?;
        }

        visiting.remove(&id);
        stack.pop();
        visited.insert(id);
        result.push(id);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loc::FileId;
    use crate::symtab::Compilation;

    fn mk_graph(comp: &mut Compilation, names: &[&str], edges: &[(usize, usize)]) -> ModuleGraph {
        let mut graph = ModuleGraph::new();
        for name in names {
            let sym = comp.new_val(name);
            comp.set_ast_info(sym, crate::ast::AstInfo::Module).unwrap();
            graph.add_module(sym, name, FileId(0), Vec::new(), false);
        }
        for &(from, to) in edges {
            graph.add_dependency(ModuleId(from as u32), ModuleId(to as u32));
        }
        graph
    }

    #[test]
    fn dependencies_precede_dependents() {
        let mut comp = Compilation::new();
        // C imports B imports A
        let graph = mk_graph(&mut comp, &["A", "B", "C"], &[(2, 1), (1, 0)]);
        let order = graph.topological_sort().unwrap();
        let pos = |id: u32| order.iter().position(|&m| m == ModuleId(id)).unwrap();
        assert!(pos(0) < pos(1));
        assert!(pos(1) < pos(2));
    }

    #[test]
    fn cycle_error_names_all_members() {
        let mut comp = Compilation::new();
        let graph = mk_graph(&mut comp, &["A", "B", "C"], &[(0, 1), (1, 2), (2, 0)]);
        let err = graph.topological_sort().unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("cyclic module dependency"));
        assert!(msg.contains('A') && msg.contains('B') && msg.contains('C'));
    }

    #[test]
    fn diamond_imports_are_fine() {
        let mut comp = Compilation::new();
        let graph =
            mk_graph(&mut comp, &["A", "B", "C", "D"], &[(3, 1), (3, 2), (1, 0), (2, 0)]);
        let order = graph.topological_sort().unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(order.last(), Some(&ModuleId(3)));
    }
}
