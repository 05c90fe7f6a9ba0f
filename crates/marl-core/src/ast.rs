use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::env::EnvRef;
use crate::error::MarlError;
use crate::eval::Evaluator;
use crate::string_escape::escape_string_fragment;
use crate::symbols::Sym;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Pos {
    pub line: usize,
    pub col: usize,
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[derive(Clone, Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub pos: Pos,
}

impl Expr {
    pub fn new(kind: ExprKind, pos: Pos) -> Self {
        Self { kind, pos }
    }
}

/// One `name = expr;` binding inside an attribute set.
#[derive(Clone, Debug)]
pub struct Bind {
    pub name: Sym,
    pub expr: Rc<Expr>,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub struct Formal {
    pub name: Sym,
    pub default: Option<Rc<Expr>>,
}

#[derive(Clone, Debug)]
pub enum Pattern {
    /// A plain `x: body` parameter.
    Var(Sym),
    /// An `{ a, b ? default, ... } @ alias` parameter.
    Attrs {
        formals: Vec<Formal>,
        ellipsis: bool,
        alias: Option<Sym>,
    },
}

#[derive(Clone, Debug)]
pub enum ExprKind {
    Var(Sym),
    Int(i64),
    Str(String),
    Path(String),
    Attrs(Vec<Bind>),
    /// `rec { … }`. Recursive binds close over the set's own scope,
    /// non-recursive binds (from `inherit`) over the enclosing scope.
    Rec {
        rec_binds: Vec<Bind>,
        nonrec_binds: Vec<Bind>,
    },
    Select {
        subject: Rc<Expr>,
        name: Sym,
    },
    HasAttr {
        subject: Rc<Expr>,
        name: Sym,
    },
    Function {
        pattern: Rc<Pattern>,
        body: Rc<Expr>,
    },
    Call {
        fun: Rc<Expr>,
        arg: Rc<Expr>,
    },
    With {
        attrs: Rc<Expr>,
        body: Rc<Expr>,
    },
    List(Vec<Rc<Expr>>),
    OpEq(Rc<Expr>, Rc<Expr>),
    OpNEq(Rc<Expr>, Rc<Expr>),
    OpConcat(Rc<Expr>, Rc<Expr>),
    /// A `+` chain. Sums when the first element is an integer, stays a path
    /// when the first element is a path, concatenates strings otherwise.
    ConcatStrings(Vec<Rc<Expr>>),
    If {
        cond: Rc<Expr>,
        then: Rc<Expr>,
        els: Rc<Expr>,
    },
    Assert {
        cond: Rc<Expr>,
        body: Rc<Expr>,
    },
    OpNot(Rc<Expr>),
    OpImpl(Rc<Expr>, Rc<Expr>),
    OpAnd(Rc<Expr>, Rc<Expr>),
    OpOr(Rc<Expr>, Rc<Expr>),
    OpUpdate(Rc<Expr>, Rc<Expr>),
}

/// Store paths a string transitively depends on.
pub type Context = im::OrdSet<String>;

/// Attribute sets iterate in symbol order, which keeps selection, equality
/// and display deterministic.
pub type Attrs = im::OrdMap<Sym, ValueRef>;

/// Shared handle to a value cell. Thunks are overwritten in place through
/// this handle when forced.
pub type ValueRef = Rc<RefCell<Value>>;

pub type PrimOpFn = Box<dyn Fn(&mut Evaluator, &[ValueRef]) -> Result<ValueRef, MarlError>>;

pub struct PrimOp {
    name: String,
    arity: usize,
    fun: PrimOpFn,
}

impl PrimOp {
    pub fn new(
        name: impl Into<String>,
        arity: usize,
        fun: impl Fn(&mut Evaluator, &[ValueRef]) -> Result<ValueRef, MarlError> + 'static,
    ) -> Self {
        assert!(arity >= 1, "primops take at least one argument");
        Self {
            name: name.into(),
            arity,
            fun: Box::new(fun),
        }
    }

    pub fn call(
        &self,
        state: &mut Evaluator,
        args: &[ValueRef],
    ) -> Result<ValueRef, MarlError> {
        (self.fun)(state, args)
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Clone)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Null,
    Str {
        s: String,
        context: Context,
    },
    Path(String),
    Attrs(Attrs),
    List(Vec<ValueRef>),
    Lambda {
        env: EnvRef,
        pattern: Rc<Pattern>,
        body: Rc<Expr>,
    },
    PrimOp(Rc<PrimOp>),
    PrimOpApp {
        left: ValueRef,
        right: ValueRef,
        args_left: usize,
    },
    Thunk {
        env: EnvRef,
        expr: Rc<Expr>,
    },
    App {
        fun: ValueRef,
        arg: ValueRef,
    },
    Copy(ValueRef),
    Blackhole,
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::Str {
            s: s.into(),
            context: Context::new(),
        }
    }

    pub fn string_with_context(s: impl Into<String>, context: Context) -> Self {
        Value::Str {
            s: s.into(),
            context,
        }
    }

    /// Type description used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "an integer",
            Value::Bool(_) => "a Boolean",
            Value::Null => "null",
            Value::Str { .. } => "a string",
            Value::Path(_) => "a path",
            Value::Attrs(_) => "an attribute set",
            Value::List(_) => "a list",
            Value::Lambda { .. } => "a function",
            Value::PrimOp(_) => "a built-in function",
            Value::PrimOpApp { .. } => "a partially applied built-in function",
            Value::Thunk { .. } | Value::App { .. } | Value::Copy(_) => {
                "an unevaluated expression"
            }
            Value::Blackhole => "a value under evaluation",
        }
    }

    /// Short type tag as reported by `builtins.typeOf`.
    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Null => "null",
            Value::Str { .. } => "string",
            Value::Path(_) => "path",
            Value::Attrs(_) => "set",
            Value::List(_) => "list",
            Value::Lambda { .. } => "lambda",
            Value::PrimOp(_) | Value::PrimOpApp { .. } => "primop",
            Value::Thunk { .. } | Value::App { .. } | Value::Copy(_) | Value::Blackhole => {
                "internal"
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Null => write!(f, "null"),
            Value::Str { s, .. } => write!(f, "\"{}\"", escape_string_fragment(s)),
            Value::Path(p) => write!(f, "{}", p),
            Value::Attrs(map) => {
                write!(f, "{{ ")?;
                for (name, value) in map.iter() {
                    write!(f, "{} = {}; ", name, value.borrow())?;
                }
                write!(f, "}}")
            }
            Value::List(items) => {
                write!(f, "[ ")?;
                for item in items {
                    write!(f, "{} ", item.borrow())?;
                }
                write!(f, "]")
            }
            Value::Lambda { .. } => write!(f, "<lambda>"),
            Value::PrimOp(p) => write!(f, "<primop {}>", p.name()),
            Value::PrimOpApp { .. } => write!(f, "<primop-app>"),
            Value::Thunk { .. } | Value::App { .. } | Value::Copy(_) => write!(f, "<code>"),
            Value::Blackhole => write!(f, "<blackhole>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub fn new_value(v: Value) -> ValueRef {
    Rc::new(RefCell::new(v))
}
