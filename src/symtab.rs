//! Symbol table and identifiers
//!
//! Every name in the compiler is an `Id`: either an unresolved textual
//! `Name` (only seen in fragments coming straight from the parser), or a
//! resolved `Val`/`Temp` carrying an interned prefix plus a globally unique
//! integer `k`. Equality and hashing of resolved ids use `k` only; the
//! prefix is purely descriptive.
//!
//! `k` indexes three parallel, append-only info tables (AST-level, K-form,
//! C-form) owned by the `Compilation`. Allocating a new id appends an empty
//! slot to all three, so the tables stay length-synchronized for the whole
//! batch. Each table can be frozen once its producing stage is done; writes
//! to a frozen table are internal errors.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::ast::AstInfo;
use crate::codegen::cform::CInfo;
use crate::codegen::kform::KInfo;
use crate::errors::{internal_err, CompileError, CResult};
use crate::loc::{FileId, Loc};

// ============================================================================
// Interned strings
// ============================================================================

/// Index into the compilation-wide string table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrId(pub u32);

/// Append-only string interner. Slot 0 is always the empty string, which
/// backs the distinguished `Id::NONE`.
#[derive(Debug, Default)]
pub struct Interner {
    strings: Vec<String>,
    lookup: HashMap<String, StrId>,
}

impl Interner {
    pub fn new() -> Self {
        let mut interner = Interner { strings: Vec::new(), lookup: HashMap::new() };
        interner.intern("");
        interner
    }

    pub fn intern(&mut self, s: &str) -> StrId {
        if let Some(&id) = self.lookup.get(s) {
            return id;
        }
        let id = StrId(self.strings.len() as u32);
        self.strings.push(s.to_string());
        self.lookup.insert(s.to_string(), id);
        id
    }

    pub fn get(&self, id: StrId) -> &str {
        &self.strings[id.0 as usize]
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// A possibly-resolved identifier.
///
/// `Val` is a user-visible value, `Temp` a compiler-generated temporary;
/// both carry the unique integer `k` that indexes the info tables.
#[derive(Debug, Clone, Copy)]
pub enum Id {
    Name(StrId),
    Val(StrId, usize),
    Temp(StrId, usize),
}

impl Id {
    /// The distinguished empty id
    pub const NONE: Id = Id::Name(StrId(0));

    /// Table index of a resolved id; `None` for unresolved names
    pub fn idx(&self) -> Option<usize> {
        match self {
            Id::Name(_) => None,
            Id::Val(_, k) | Id::Temp(_, k) => Some(*k),
        }
    }

    pub fn prefix(&self) -> StrId {
        match self {
            Id::Name(s) | Id::Val(s, _) | Id::Temp(s, _) => *s,
        }
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, Id::Temp(..))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Id::Name(StrId(0)))
    }
}

// Resolved ids compare and hash by `k` alone; a `Val` and a `Temp` with the
// same `k` denote the same entity.
impl PartialEq for Id {
    fn eq(&self, other: &Id) -> bool {
        match (self, other) {
            (Id::Name(a), Id::Name(b)) => a == b,
            (Id::Val(_, a) | Id::Temp(_, a), Id::Val(_, b) | Id::Temp(_, b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Id {}

impl std::hash::Hash for Id {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Id::Name(s) => {
                0u8.hash(state);
                s.hash(state);
            }
            Id::Val(_, k) | Id::Temp(_, k) => {
                1u8.hash(state);
                k.hash(state);
            }
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Name(s) => write!(f, "<name#{}>", s.0),
            Id::Val(s, k) => write!(f, "<val#{}.{}>", s.0, k),
            Id::Temp(s, k) => write!(f, "<temp#{}.{}>", s.0, k),
        }
    }
}

// ============================================================================
// Scopes
// ============================================================================

/// One level of lexical nesting. A definition's scope is the full chain,
/// innermost first; the chain ends with the owning module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Block(u32),
    Loop(u32),
    Map(u32),
    Try(u32),
    Fun(Id),
    Module(Id),
}

pub type ScopeChain = Vec<Scope>;

/// True if the chain denotes module (global) scope
pub fn is_global_scope(sc: &[Scope]) -> bool {
    matches!(sc.first(), Some(Scope::Module(_)) | None)
}

/// The module at the outer end of the chain, if any
pub fn scope_module(sc: &[Scope]) -> Id {
    for s in sc.iter().rev() {
        if let Scope::Module(m) = s {
            return *m;
        }
    }
    Id::NONE
}

// ============================================================================
// The compilation state
// ============================================================================

/// Which of the three parallel info tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoTab {
    Ast,
    K,
    C,
}

/// Arena of everything that survives across passes: interner, file table,
/// the three info tables, accumulated diagnostics, and the caches shared by
/// the mangler and the C type generator. `init_all` resets the lot.
pub struct Compilation {
    interner: Interner,
    files: Vec<String>,

    ast_info: Vec<Option<AstInfo>>,
    k_info: Vec<Option<KInfo>>,
    c_info: Vec<Option<CInfo>>,
    frozen_ast: bool,
    frozen_k: bool,
    frozen_c: bool,

    /// User-level diagnostics accumulated by the active pass
    pub errors: Vec<CompileError>,

    /// Mangled C name -> id; doubles as the memo for materialized
    /// structural types (signature string -> `KDefTyp` id)
    pub mangle_map: HashMap<String, Id>,
    /// C type ids already declared in the current module's output
    pub declared_ctypes: HashSet<usize>,
    /// Recursive variants whose struct tag has been forward-declared
    pub fwd_declared: HashSet<usize>,
    /// Variant id -> companion enum id
    pub enum_cache: HashMap<usize, Id>,
    /// Next exception tag; standard exceptions grow downward from -1024
    pub exn_tag_next: i32,

    /// Tags captured while processing the `Builtins` module
    pub no_match_error: Id,
    pub out_of_range_error: Id,

    block_counter: u32,
}

impl Compilation {
    pub fn new() -> Self {
        Compilation {
            interner: Interner::new(),
            files: vec!["<builtin>".to_string()],
            ast_info: Vec::new(),
            k_info: Vec::new(),
            c_info: Vec::new(),
            frozen_ast: false,
            frozen_k: false,
            frozen_c: false,
            errors: Vec::new(),
            mangle_map: HashMap::new(),
            declared_ctypes: HashSet::new(),
            fwd_declared: HashSet::new(),
            enum_cache: HashMap::new(),
            exn_tag_next: -1024,
            no_match_error: Id::NONE,
            out_of_range_error: Id::NONE,
            block_counter: 0,
        }
    }

    /// Reset all process-wide state between compilations
    pub fn init_all(&mut self) {
        *self = Compilation::new();
    }

    // ------------------------------------------------------------------
    // Strings and files
    // ------------------------------------------------------------------

    pub fn intern(&mut self, s: &str) -> StrId {
        self.interner.intern(s)
    }

    pub fn str(&self, id: StrId) -> &str {
        self.interner.get(id)
    }

    pub fn register_file(&mut self, name: &str) -> FileId {
        let id = FileId(self.files.len() as u32);
        self.files.push(name.to_string());
        id
    }

    pub fn file_name(&self, id: FileId) -> &str {
        self.files.get(id.0 as usize).map(|s| s.as_str()).unwrap_or("<unknown>")
    }

    /// Textual form of an id: the prefix for values, `prefix@k` for
    /// temporaries so distinct temps stay distinguishable in dumps.
    pub fn id2str(&self, id: Id) -> String {
        match id {
            Id::Name(s) | Id::Val(s, _) => self.interner.get(s).to_string(),
            Id::Temp(s, k) => format!("{}@{}", self.interner.get(s), k),
        }
    }

    /// Render a diagnostic with its file name resolved
    pub fn render_error(&self, err: &CompileError) -> String {
        let loc = err.loc();
        format!("{}:{}", self.file_name(loc.file), err)
    }

    // ------------------------------------------------------------------
    // Id allocation
    // ------------------------------------------------------------------

    fn grow(&mut self) -> usize {
        let k = self.ast_info.len();
        self.ast_info.push(None);
        self.k_info.push(None);
        self.c_info.push(None);
        k
    }

    /// Number of allocated ids (identical for all three tables)
    pub fn len(&self) -> usize {
        self.ast_info.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ast_info.is_empty()
    }

    pub fn new_val(&mut self, prefix: &str) -> Id {
        let s = self.intern(prefix);
        let k = self.grow();
        Id::Val(s, k)
    }

    pub fn new_temp(&mut self, prefix: &str) -> Id {
        let s = self.intern(prefix);
        let k = self.grow();
        Id::Temp(s, k)
    }

    /// Fresh id with the same prefix and temp-ness as `id`
    pub fn dup_id(&mut self, id: Id) -> Id {
        let k = self.grow();
        match id {
            Id::Name(s) | Id::Val(s, _) => Id::Val(s, k),
            Id::Temp(s, _) => Id::Temp(s, k),
        }
    }

    pub fn new_block_scope(&mut self) -> Scope {
        self.block_counter += 1;
        Scope::Block(self.block_counter)
    }

    pub fn new_loop_scope(&mut self) -> Scope {
        self.block_counter += 1;
        Scope::Loop(self.block_counter)
    }

    pub fn new_map_scope(&mut self) -> Scope {
        self.block_counter += 1;
        Scope::Map(self.block_counter)
    }

    pub fn new_try_scope(&mut self) -> Scope {
        self.block_counter += 1;
        Scope::Try(self.block_counter)
    }

    // ------------------------------------------------------------------
    // Freezing
    // ------------------------------------------------------------------

    pub fn freeze(&mut self, tab: InfoTab, frozen: bool) {
        match tab {
            InfoTab::Ast => self.frozen_ast = frozen,
            InfoTab::K => self.frozen_k = frozen,
            InfoTab::C => self.frozen_c = frozen,
        }
    }

    fn check_write(&self, tab: InfoTab, loc: Loc) -> CResult<()> {
        let frozen = match tab {
            InfoTab::Ast => self.frozen_ast,
            InfoTab::K => self.frozen_k,
            InfoTab::C => self.frozen_c,
        };
        if frozen {
            Err(internal_err(loc, format!("write to frozen {:?} info table", tab)))
        } else {
            Ok(())
        }
    }

    fn check_idx(&self, id: Id, loc: Loc) -> CResult<usize> {
        match id.idx() {
            Some(k) if k < self.len() => Ok(k),
            Some(k) => Err(internal_err(
                loc,
                format!("id index {} out of range ({} ids allocated)", k, self.len()),
            )),
            None => Err(internal_err(loc, "attempt to access info of an unresolved name")),
        }
    }

    // ------------------------------------------------------------------
    // Info accessors. Reads of an empty entry are compile errors carrying
    // the requesting location; definitions are cloned out so passes can
    // mutate the tables while holding one.
    // ------------------------------------------------------------------

    pub fn set_ast_info(&mut self, id: Id, info: AstInfo) -> CResult<()> {
        let loc = Loc::NONE;
        self.check_write(InfoTab::Ast, loc)?;
        let k = self.check_idx(id, loc)?;
        self.ast_info[k] = Some(info);
        Ok(())
    }

    pub fn ast_info(&self, id: Id, loc: Loc) -> CResult<&AstInfo> {
        let k = self.check_idx(id, loc)?;
        self.ast_info[k]
            .as_ref()
            .ok_or_else(|| internal_err(loc, format!("no AST info for id #{}", k)))
    }

    pub fn ast_info_opt(&self, id: Id) -> Option<&AstInfo> {
        id.idx().and_then(|k| self.ast_info.get(k)).and_then(|e| e.as_ref())
    }

    pub fn set_k_info(&mut self, id: Id, info: KInfo) -> CResult<()> {
        let loc = Loc::NONE;
        self.check_write(InfoTab::K, loc)?;
        let k = self.check_idx(id, loc)?;
        self.k_info[k] = Some(info);
        Ok(())
    }

    pub fn k_info(&self, id: Id, loc: Loc) -> CResult<&KInfo> {
        let k = self.check_idx(id, loc)?;
        self.k_info[k]
            .as_ref()
            .ok_or_else(|| internal_err(loc, format!("no K-form info for id #{}", k)))
    }

    pub fn k_info_opt(&self, id: Id) -> Option<&KInfo> {
        id.idx().and_then(|k| self.k_info.get(k)).and_then(|e| e.as_ref())
    }

    pub fn set_c_info(&mut self, id: Id, info: CInfo) -> CResult<()> {
        let loc = Loc::NONE;
        self.check_write(InfoTab::C, loc)?;
        let k = self.check_idx(id, loc)?;
        self.c_info[k] = Some(info);
        Ok(())
    }

    pub fn c_info(&self, id: Id, loc: Loc) -> CResult<&CInfo> {
        let k = self.check_idx(id, loc)?;
        self.c_info[k]
            .as_ref()
            .ok_or_else(|| internal_err(loc, format!("no C-form info for id #{}", k)))
    }

    pub fn c_info_opt(&self, id: Id) -> Option<&CInfo> {
        id.idx().and_then(|k| self.c_info.get(k)).and_then(|e| e.as_ref())
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    pub fn push_err(&mut self, err: CompileError) {
        self.errors.push(err);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Take the accumulated diagnostics, leaving the list empty
    pub fn take_errors(&mut self) -> Vec<CompileError> {
        std::mem::take(&mut self.errors)
    }
}

impl Default for Compilation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of<T: Hash>(v: &T) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn id_equality_ignores_prefix() {
        let mut comp = Compilation::new();
        let a = comp.intern("a");
        let b = comp.intern("b");
        assert_eq!(Id::Val(a, 5), Id::Val(b, 5));
        assert_eq!(Id::Val(a, 5), Id::Temp(b, 5));
        assert_ne!(Id::Val(a, 5), Id::Val(a, 6));
    }

    #[test]
    fn id_hash_ignores_prefix() {
        let mut comp = Compilation::new();
        let a = comp.intern("a");
        let b = comp.intern("b");
        assert_eq!(hash_of(&Id::Val(a, 5)), hash_of(&Id::Temp(b, 5)));
    }

    #[test]
    fn none_id_is_name_of_empty_string() {
        assert!(Id::NONE.is_none());
        assert_eq!(Id::NONE.idx(), None);
    }

    #[test]
    fn tables_grow_in_lockstep() {
        let mut comp = Compilation::new();
        let x = comp.new_val("x");
        let t = comp.new_temp("t");
        assert_eq!(x.idx(), Some(0));
        assert_eq!(t.idx(), Some(1));
        assert_eq!(comp.len(), 2);
        // all three tables must have the same length
        assert!(comp.k_info_opt(x).is_none());
        assert!(comp.c_info_opt(t).is_none());
    }

    #[test]
    fn empty_entry_read_is_internal_error() {
        let mut comp = Compilation::new();
        let x = comp.new_val("x");
        let err = comp.k_info(x, Loc::NONE).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn frozen_table_rejects_writes() {
        let mut comp = Compilation::new();
        let x = comp.new_val("x");
        comp.freeze(InfoTab::Ast, true);
        let err = comp.set_ast_info(x, crate::ast::AstInfo::None).unwrap_err();
        assert!(err.is_fatal());
        comp.freeze(InfoTab::Ast, false);
        assert!(comp.set_ast_info(x, crate::ast::AstInfo::None).is_ok());
    }

    #[test]
    fn init_all_resets_state() {
        let mut comp = Compilation::new();
        comp.new_val("x");
        comp.exn_tag_next = -1030;
        comp.push_err(crate::errors::type_err(Loc::NONE, "x"));
        comp.init_all();
        assert_eq!(comp.len(), 0);
        assert_eq!(comp.exn_tag_next, -1024);
        assert!(!comp.has_errors());
    }

    #[test]
    fn temp_rendering_includes_index() {
        let mut comp = Compilation::new();
        let t = comp.new_temp("tmp");
        assert_eq!(comp.id2str(t), "tmp@0");
        let v = comp.new_val("x");
        assert_eq!(comp.id2str(v), "x");
    }
}
