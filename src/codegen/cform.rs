//! C-form: the statement-oriented IR mirroring the C output
//!
//! C-form corresponds 1:1 with the target C code: expressions carry no
//! type context of their own, statements own the control flow, and every
//! named C type carries the properties the code generator needs to place
//! destructor/copy calls (`scalar`, `complex`, `ptr`, `pass_by_ref`, the
//! free/copy macro-function pairs, and the constructor list).
//!
//! Field names, runtime functions and runtime macros are plain `Id::Name`
//! identifiers; only user entities occupy slots in the C info table.

use std::collections::HashSet;

use crate::ast::Lit;
use crate::loc::Loc;
use crate::symtab::Id;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum CTyp {
    Void,
    /// `int_`: the pointer-sized integer of the runtime
    Int,
    /// plain C `int`, used for status codes and tags
    CInt,
    SizeT,
    SInt(u8),
    UInt(u8),
    Float(u8),
    Bool,
    Char,
    /// `fx_str_t`
    Str,
    /// `fx_exn_t`
    Exn,
    /// `fx_arr_t`
    Arr,
    /// `fx_cptr_t`
    CPtr,
    Struct(Option<Id>, Vec<(Id, CTyp)>),
    Union(Option<Id>, Vec<(Id, CTyp)>),
    RawPtr(Box<CTyp>),
    RawArray(Box<CTyp>, Option<usize>),
    FunRawPtr(Vec<CTyp>, Box<CTyp>),
    Name(Id),
}

/// Properties of a named C type
#[derive(Debug, Clone, PartialEq)]
pub struct CTypProps {
    pub scalar: bool,
    /// needs a destructor
    pub complex: bool,
    /// pointer-sized, heap-allocated representation
    pub ptr: bool,
    pub pass_by_ref: bool,
    /// copying is more than a plain struct assignment
    pub custom_copy: bool,
    /// `(free_macro, free_fn)`; either may be `NONE`
    pub free: (Id, Id),
    /// `(copy_macro, copy_fn)`; either may be `NONE`
    pub copy: (Id, Id),
}

impl Default for CTypProps {
    fn default() -> Self {
        CTypProps {
            scalar: false,
            complex: false,
            ptr: false,
            pass_by_ref: false,
            custom_copy: false,
            free: (Id::NONE, Id::NONE),
            copy: (Id::NONE, Id::NONE),
        }
    }
}

impl CTypProps {
    pub fn scalar() -> Self {
        CTypProps { scalar: true, ..CTypProps::default() }
    }

    /// The preferred destructor for elements of this type: the macro for
    /// pointer-like and simple cases, the function for complex ones
    pub fn free_handle(&self) -> Id {
        if self.ptr && !self.free.0.is_none() {
            self.free.0
        } else if !self.free.1.is_none() {
            self.free.1
        } else {
            self.free.0
        }
    }

    pub fn copy_handle(&self) -> Id {
        if self.ptr && !self.copy.0.is_none() {
            self.copy.0
        } else if !self.copy.1.is_none() {
            self.copy.1
        } else {
            self.copy.0
        }
    }
}

// ============================================================================
// Expressions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LogAnd,
    LogOr,
    Assign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CUnOp {
    Neg,
    Not,
    BitNot,
    Deref,
    AddrOf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CExp {
    Ident(Id),
    Lit(Lit),
    Binary(CBinOp, Box<CExp>, Box<CExp>),
    Unary(CUnOp, Box<CExp>),
    Mem(Box<CExp>, Id),
    Arrow(Box<CExp>, Id),
    Cast(CTyp, Box<CExp>),
    Ternary(Box<CExp>, Box<CExp>, Box<CExp>),
    Call(Box<CExp>, Vec<CExp>),
    /// Brace initializer
    Init(Vec<CExp>),
    CCode(String),
}

impl CExp {
    pub fn ident(id: Id) -> CExp {
        CExp::Ident(id)
    }

    pub fn int(v: i64) -> CExp {
        CExp::Lit(Lit::Int(v))
    }

    pub fn call(f: Id, args: Vec<CExp>) -> CExp {
        CExp::Call(Box::new(CExp::Ident(f)), args)
    }

    pub fn arrow(e: CExp, field: Id) -> CExp {
        CExp::Arrow(Box::new(e), field)
    }

    pub fn mem(e: CExp, field: Id) -> CExp {
        CExp::Mem(Box::new(e), field)
    }

    pub fn addr(e: CExp) -> CExp {
        CExp::Unary(CUnOp::AddrOf, Box::new(e))
    }

    pub fn deref(e: CExp) -> CExp {
        CExp::Unary(CUnOp::Deref, Box::new(e))
    }

    pub fn eq(a: CExp, b: CExp) -> CExp {
        CExp::Binary(CBinOp::Eq, Box::new(a), Box::new(b))
    }

    pub fn assign(lhs: CExp, rhs: CExp) -> CExp {
        CExp::Binary(CBinOp::Assign, Box::new(lhs), Box::new(rhs))
    }
}

// ============================================================================
// Statements
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum CStmt {
    Nop(Loc),
    Exp(CExp),
    Block(Vec<CStmt>),
    If(CExp, Box<CStmt>, Box<CStmt>),
    For {
        init: Vec<CStmt>,
        cond: Option<CExp>,
        step: Vec<CExp>,
        body: Box<CStmt>,
    },
    While(CExp, Box<CStmt>),
    DoWhile(Box<CStmt>, CExp),
    /// `(values, body)` per case; an empty value list is `default:`
    Switch(CExp, Vec<(Vec<CExp>, Vec<CStmt>)>),
    Return(Option<CExp>),
    Break,
    Continue,
    Goto(Id),
    Label(Id),
    DefVal {
        name: Id,
        typ: CTyp,
        init: Option<CExp>,
    },
    /// Function definition; the body lives in the C info table
    DefFun(Id),
    /// Named type declaration (struct/union/typedef); def in the table
    DefTyp(Id),
    DefEnum(Id),
    Macro {
        name: Id,
        def: String,
    },
    Include(String),
    Pragma(String),
    ForwardTyp(Id),
    ForwardFun(Id),
}

// ============================================================================
// Definitions (C-form info table entries)
// ============================================================================

#[derive(Debug, Clone)]
pub struct CDefVal {
    pub name: Id,
    pub cname: String,
    pub typ: CTyp,
    pub loc: Loc,
}

#[derive(Debug, Clone)]
pub struct CDefFun {
    pub name: Id,
    pub cname: String,
    pub args: Vec<(Id, CTyp)>,
    pub rt: CTyp,
    pub body: Vec<CStmt>,
    pub is_static: bool,
    pub loc: Loc,
}

#[derive(Debug, Clone)]
pub struct CDefTyp {
    pub name: Id,
    pub cname: String,
    pub typ: CTyp,
    pub props: CTypProps,
    /// constructor function ids of this type
    pub ctors: Vec<Id>,
    pub loc: Loc,
}

#[derive(Debug, Clone)]
pub struct CDefEnum {
    pub name: Id,
    pub cname: String,
    pub members: Vec<(Id, Option<i64>)>,
    pub loc: Loc,
}

/// Exception bookkeeping: runtime tag plus the registered C name
#[derive(Debug, Clone)]
pub struct CDefExn {
    pub name: Id,
    pub cname: String,
    pub tag: i32,
    pub loc: Loc,
}

#[derive(Debug, Clone)]
pub enum CInfo {
    Val(CDefVal),
    Fun(Box<CDefFun>),
    Typ(CDefTyp),
    Enum(CDefEnum),
    Exn(CDefExn),
}

// ============================================================================
// Id collection (used by dead-type elimination)
// ============================================================================

pub fn collect_ctyp_ids(t: &CTyp, out: &mut HashSet<Id>) {
    match t {
        CTyp::Struct(tag, fields) | CTyp::Union(tag, fields) => {
            if let Some(tag) = tag {
                out.insert(*tag);
            }
            for (_, ft) in fields {
                collect_ctyp_ids(ft, out);
            }
        }
        CTyp::RawPtr(inner) | CTyp::RawArray(inner, _) => collect_ctyp_ids(inner, out),
        CTyp::FunRawPtr(args, rt) => {
            for a in args {
                collect_ctyp_ids(a, out);
            }
            collect_ctyp_ids(rt, out);
        }
        CTyp::Name(id) => {
            out.insert(*id);
        }
        _ => {}
    }
}

pub fn collect_cexp_ids(e: &CExp, out: &mut HashSet<Id>) {
    match e {
        CExp::Ident(id) => {
            out.insert(*id);
        }
        CExp::Lit(_) | CExp::CCode(_) => {}
        CExp::Binary(_, a, b) => {
            collect_cexp_ids(a, out);
            collect_cexp_ids(b, out);
        }
        CExp::Unary(_, a) => collect_cexp_ids(a, out),
        CExp::Mem(a, f) | CExp::Arrow(a, f) => {
            collect_cexp_ids(a, out);
            out.insert(*f);
        }
        CExp::Cast(t, a) => {
            collect_ctyp_ids(t, out);
            collect_cexp_ids(a, out);
        }
        CExp::Ternary(c, a, b) => {
            collect_cexp_ids(c, out);
            collect_cexp_ids(a, out);
            collect_cexp_ids(b, out);
        }
        CExp::Call(f, args) => {
            collect_cexp_ids(f, out);
            for a in args {
                collect_cexp_ids(a, out);
            }
        }
        CExp::Init(elems) => {
            for e in elems {
                collect_cexp_ids(e, out);
            }
        }
    }
}

pub fn collect_cstmt_ids(s: &CStmt, out: &mut HashSet<Id>) {
    match s {
        CStmt::Nop(_)
        | CStmt::Break
        | CStmt::Continue
        | CStmt::Include(_)
        | CStmt::Pragma(_) => {}
        CStmt::Exp(e) => collect_cexp_ids(e, out),
        CStmt::Block(stmts) => {
            for s in stmts {
                collect_cstmt_ids(s, out);
            }
        }
        CStmt::If(c, t, f) => {
            collect_cexp_ids(c, out);
            collect_cstmt_ids(t, out);
            collect_cstmt_ids(f, out);
        }
        CStmt::For { init, cond, step, body } => {
            for s in init {
                collect_cstmt_ids(s, out);
            }
            if let Some(c) = cond {
                collect_cexp_ids(c, out);
            }
            for e in step {
                collect_cexp_ids(e, out);
            }
            collect_cstmt_ids(body, out);
        }
        CStmt::While(c, body) => {
            collect_cexp_ids(c, out);
            collect_cstmt_ids(body, out);
        }
        CStmt::DoWhile(body, c) => {
            collect_cstmt_ids(body, out);
            collect_cexp_ids(c, out);
        }
        CStmt::Switch(e, cases) => {
            collect_cexp_ids(e, out);
            for (vals, stmts) in cases {
                for v in vals {
                    collect_cexp_ids(v, out);
                }
                for s in stmts {
                    collect_cstmt_ids(s, out);
                }
            }
        }
        CStmt::Return(e) => {
            if let Some(e) = e {
                collect_cexp_ids(e, out);
            }
        }
        CStmt::Goto(id) | CStmt::Label(id) => {
            out.insert(*id);
        }
        CStmt::DefVal { name, typ, init } => {
            out.insert(*name);
            collect_ctyp_ids(typ, out);
            if let Some(e) = init {
                collect_cexp_ids(e, out);
            }
        }
        CStmt::DefFun(id)
        | CStmt::DefTyp(id)
        | CStmt::DefEnum(id)
        | CStmt::ForwardTyp(id)
        | CStmt::ForwardFun(id)
        | CStmt::Macro { name: id, .. } => {
            out.insert(*id);
        }
    }
}
