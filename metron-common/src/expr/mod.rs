//! The expression mini-language used for dynamic configuration values.
//!
//! Expressions are compiled once at configuration-load time and evaluated
//! against a [`Scope`] whenever a collector ticks. The language is small
//! and side-effect free on its own: literals, scope lookups with dotted
//! paths, arithmetic, comparisons, boolean operators, indexing, list
//! literals, `value if condition else other`, and calls into functions
//! registered in the scope (custom functions and provider operations).

mod parser;

use std::fmt;

use crate::{
    error::ExprError,
    scope::{Scope, ScopeValue},
    value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
pub(crate) enum Ast {
    Lit(Value),
    Ident(String),
    Attr(Box<Ast>, String),
    Index(Box<Ast>, Box<Ast>),
    Call(Box<Ast>, Vec<Ast>),
    List(Vec<Ast>),
    Neg(Box<Ast>),
    Not(Box<Ast>),
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
    Arith(ArithOp, Box<Ast>, Box<Ast>),
    Compare(CmpOp, Box<Ast>, Box<Ast>),
    Ternary {
        condition: Box<Ast>,
        then: Box<Ast>,
        other: Box<Ast>,
    },
}

/// A compiled expression. Cheap to clone, re-evaluable against different
/// scopes.
#[derive(Debug, Clone)]
pub struct Expr {
    source: String,
    ast: Ast,
}

impl Expr {
    /// Compiles the expression source text.
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        let ast = parser::Parser::parse(source)?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the expression against the scope.
    pub fn eval(&self, scope: &Scope) -> Result<Value, ExprError> {
        eval_value(&self.ast, scope)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!py {}", self.source)
    }
}

/// A node mid-resolution: attribute chains may pass through callables and
/// component handles before they bottom out in a value.
enum Resolved {
    Value(Value),
    Entry(ScopeValue),
}

fn eval_value(ast: &Ast, scope: &Scope) -> Result<Value, ExprError> {
    match eval_node(ast, scope)? {
        Resolved::Value(v) | Resolved::Entry(ScopeValue::Value(v)) => Ok(v),
        Resolved::Entry(ScopeValue::Func(_)) => {
            Err(ExprError::type_error("a function is not a value; call it"))
        }
        Resolved::Entry(ScopeValue::Object(_)) => Err(ExprError::type_error(
            "a component reference is not a value",
        )),
    }
}

fn eval_node(ast: &Ast, scope: &Scope) -> Result<Resolved, ExprError> {
    match ast {
        Ast::Lit(v) => Ok(Resolved::Value(v.clone())),

        Ast::Ident(name) => scope
            .lookup(name)
            .map(Resolved::Entry)
            .ok_or_else(|| ExprError::Name(name.clone())),

        Ast::Attr(target, name) => match eval_node(target, scope)? {
            Resolved::Entry(ScopeValue::Object(object)) => object
                .attr(name)
                .map(Resolved::Entry)
                .ok_or_else(|| ExprError::type_error(format!("no attribute '{name}'"))),
            Resolved::Value(Value::Map(m)) | Resolved::Entry(ScopeValue::Value(Value::Map(m))) => {
                Ok(Resolved::Value(m.get(name).cloned().unwrap_or(Value::Null)))
            }
            Resolved::Value(other) | Resolved::Entry(ScopeValue::Value(other)) => Err(
                ExprError::type_error(format!("cannot access '{name}' on {}", other.type_name())),
            ),
            Resolved::Entry(ScopeValue::Func(_)) => Err(ExprError::type_error(format!(
                "cannot access '{name}' on a function"
            ))),
        },

        Ast::Index(target, index) => {
            let target = eval_value(target, scope)?;
            let index = eval_value(index, scope)?;
            match (target, index) {
                (Value::Seq(items), Value::Int(i)) => {
                    let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
                    let i = if i < 0 { i + len } else { i };
                    usize::try_from(i)
                        .ok()
                        .and_then(|i| items.get(i).cloned())
                        .map(Resolved::Value)
                        .ok_or_else(|| {
                            ExprError::type_error(format!("index {i} out of range (len {len})"))
                        })
                }
                (Value::Map(m), Value::Str(key)) => {
                    Ok(Resolved::Value(m.get(&key).cloned().unwrap_or(Value::Null)))
                }
                (target, index) => Err(ExprError::type_error(format!(
                    "cannot index {} with {}",
                    target.type_name(),
                    index.type_name()
                ))),
            }
        }

        Ast::Call(callee, args) => {
            let callee = eval_node(callee, scope)?;
            let Resolved::Entry(ScopeValue::Func(func)) = callee else {
                return Err(ExprError::type_error("the call target is not a function"));
            };
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_value(arg, scope)?);
            }
            func(&values).map(Resolved::Value)
        }

        Ast::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval_value(item, scope)?);
            }
            Ok(Resolved::Value(Value::Seq(values)))
        }

        Ast::Neg(inner) => match eval_value(inner, scope)? {
            Value::Int(v) => Ok(Resolved::Value(Value::Int(-v))),
            Value::Float(v) => Ok(Resolved::Value(Value::Float(-v))),
            other => Err(ExprError::type_error(format!(
                "cannot negate {}",
                other.type_name()
            ))),
        },

        Ast::Not(inner) => {
            let value = eval_value(inner, scope)?;
            Ok(Resolved::Value(Value::Bool(!value.truthy())))
        }

        Ast::And(left, right) => {
            let left = eval_value(left, scope)?;
            if left.truthy() {
                eval_value(right, scope).map(Resolved::Value)
            } else {
                Ok(Resolved::Value(left))
            }
        }

        Ast::Or(left, right) => {
            let left = eval_value(left, scope)?;
            if left.truthy() {
                Ok(Resolved::Value(left))
            } else {
                eval_value(right, scope).map(Resolved::Value)
            }
        }

        Ast::Arith(op, left, right) => {
            let left = eval_value(left, scope)?;
            let right = eval_value(right, scope)?;
            arith(*op, left, right).map(Resolved::Value)
        }

        Ast::Compare(op, left, right) => {
            let left = eval_value(left, scope)?;
            let right = eval_value(right, scope)?;
            compare(*op, &left, &right).map(Resolved::Value)
        }

        Ast::Ternary {
            condition,
            then,
            other,
        } => {
            if eval_value(condition, scope)?.truthy() {
                eval_value(then, scope).map(Resolved::Value)
            } else {
                eval_value(other, scope).map(Resolved::Value)
            }
        }
    }
}

fn arith(op: ArithOp, left: Value, right: Value) -> Result<Value, ExprError> {
    match (op, &left, &right) {
        (ArithOp::Add, Value::Str(a), Value::Str(b)) => {
            return Ok(Value::Str(format!("{a}{b}")));
        }
        (ArithOp::Add, Value::Seq(a), Value::Seq(b)) => {
            let mut joined = a.clone();
            joined.extend(b.iter().cloned());
            return Ok(Value::Seq(joined));
        }
        _ => {}
    }

    match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => match op {
            ArithOp::Add => Ok(Value::Int(a + b)),
            ArithOp::Sub => Ok(Value::Int(a - b)),
            ArithOp::Mul => Ok(Value::Int(a * b)),
            ArithOp::Div => {
                if *b == 0 {
                    Err(ExprError::type_error("division by zero"))
                } else {
                    Ok(Value::Float(*a as f64 / *b as f64))
                }
            }
            ArithOp::Rem => {
                if *b == 0 {
                    Err(ExprError::type_error("division by zero"))
                } else {
                    Ok(Value::Int(a % b))
                }
            }
        },
        _ => {
            let (a, b) = (
                left.as_f64().ok_or_else(|| {
                    ExprError::type_error(format!("cannot use {} in arithmetic", left.type_name()))
                })?,
                right.as_f64().ok_or_else(|| {
                    ExprError::type_error(format!("cannot use {} in arithmetic", right.type_name()))
                })?,
            );
            match op {
                ArithOp::Add => Ok(Value::Float(a + b)),
                ArithOp::Sub => Ok(Value::Float(a - b)),
                ArithOp::Mul => Ok(Value::Float(a * b)),
                ArithOp::Div => {
                    if b == 0.0 {
                        Err(ExprError::type_error("division by zero"))
                    } else {
                        Ok(Value::Float(a / b))
                    }
                }
                ArithOp::Rem => {
                    if b == 0.0 {
                        Err(ExprError::type_error("division by zero"))
                    } else {
                        Ok(Value::Float(a % b))
                    }
                }
            }
        }
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    use std::cmp::Ordering;

    let ordering = if left.is_number() && right.is_number() {
        left.as_f64()
            .unwrap_or(f64::NAN)
            .partial_cmp(&right.as_f64().unwrap_or(f64::NAN))
    } else {
        match (left, right) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    };

    let result = match (op, ordering) {
        (CmpOp::Eq, ordering) => ordering == Some(Ordering::Equal) || left == right,
        (CmpOp::Ne, ordering) => !(ordering == Some(Ordering::Equal) || left == right),
        (CmpOp::Lt, Some(ordering)) => ordering == Ordering::Less,
        (CmpOp::Le, Some(ordering)) => ordering != Ordering::Greater,
        (CmpOp::Gt, Some(ordering)) => ordering == Ordering::Greater,
        (CmpOp::Ge, Some(ordering)) => ordering != Ordering::Less,
        (_, None) => {
            return Err(ExprError::type_error(format!(
                "cannot order {} and {}",
                left.type_name(),
                right.type_name()
            )));
        }
    };
    Ok(Value::Bool(result))
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use super::*;
    use crate::{scope::ScopeObject, value_map};

    fn scope_with(entries: Vec<(&str, ScopeValue)>) -> Scope {
        let base: HashMap<String, ScopeValue> = entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Scope::new(Arc::new(base))
    }

    fn eval(source: &str, scope: &Scope) -> Value {
        Expr::compile(source).unwrap().eval(scope).unwrap()
    }

    #[test]
    fn literals_and_arithmetic() {
        let scope = Scope::default();
        assert_eq!(eval("1 + 2 * 3", &scope), Value::Int(7));
        assert_eq!(eval("(1 + 2) * 3", &scope), Value::Int(9));
        assert_eq!(eval("7 % 3", &scope), Value::Int(1));
        assert_eq!(eval("1 / 2", &scope), Value::Float(0.5));
        assert_eq!(eval("-2.5 * 2", &scope), Value::Float(-5.0));
        assert_eq!(eval("'a' + 'b'", &scope), Value::Str("ab".into()));
    }

    #[test]
    fn comparisons_and_boolean_logic() {
        let scope = Scope::default();
        assert_eq!(eval("1 < 2 and 2 <= 2", &scope), Value::Bool(true));
        assert_eq!(eval("1 == 1.0", &scope), Value::Bool(true));
        assert_eq!(eval("'a' != 'b'", &scope), Value::Bool(true));
        assert_eq!(eval("not null", &scope), Value::Bool(true));
        // `or` yields the first truthy operand
        assert_eq!(eval("0 or 5", &scope), Value::Int(5));
        assert_eq!(eval("3 and 5", &scope), Value::Int(5));
    }

    #[test]
    fn ternary() {
        let scope = Scope::default();
        assert_eq!(eval("'hot' if 30 > 25 else 'cold'", &scope), "hot".into());
        assert_eq!(eval("'hot' if 20 > 25 else 'cold'", &scope), "cold".into());
    }

    #[test]
    fn scope_lookup_and_paths() {
        let scope = Scope::default().with(
            "data",
            Value::Map(value_map! {
                "cpu" => Value::Float(0.25),
                "disk" => Value::Map(value_map! {"used" => Value::Int(10)}),
            }),
        );
        assert_eq!(eval("data.cpu * 100", &scope), Value::Float(25.0));
        assert_eq!(eval("data.disk.used", &scope), Value::Int(10));
        assert_eq!(eval("data['cpu']", &scope), Value::Float(0.25));
        // missing map members resolve to null
        assert_eq!(eval("data.missing", &scope), Value::Null);
    }

    #[test]
    fn undefined_name_is_an_error() {
        let err = Expr::compile("nope + 1")
            .unwrap()
            .eval(&Scope::default())
            .unwrap_err();
        assert!(matches!(err, ExprError::Name(name) if name == "nope"));
    }

    #[test]
    fn list_literals_and_indexing() {
        let scope = Scope::default();
        assert_eq!(eval("[1, 2, 3][1]", &scope), Value::Int(2));
        assert_eq!(eval("[1, 2, 3][-1]", &scope), Value::Int(3));
        assert_eq!(
            eval("[1] + [2]", &scope),
            Value::Seq(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn function_calls() {
        let scope = scope_with(vec![(
            "double",
            ScopeValue::func(|args| {
                let v = args[0].as_f64().unwrap_or(0.0);
                Ok(Value::Float(v * 2.0))
            }),
        )]);
        assert_eq!(eval("double(21)", &scope), Value::Float(42.0));
    }

    struct FakeProvider;

    impl ScopeObject for FakeProvider {
        fn attr(&self, name: &str) -> Option<ScopeValue> {
            match name {
                "field" => Some(ScopeValue::func(|args| {
                    Ok(Value::Str(format!("field:{}", args[0])))
                })),
                "count" => Some(ScopeValue::Value(Value::Int(3))),
                _ => None,
            }
        }
    }

    #[test]
    fn component_operations() {
        let scope = Scope::default().with_object("web", Arc::new(FakeProvider));
        assert_eq!(eval("web.field(0)", &scope), Value::Str("field:0".into()));
        assert_eq!(eval("web.count + 1", &scope), Value::Int(4));
        let err = Expr::compile("web.missing")
            .unwrap()
            .eval(&scope)
            .unwrap_err();
        assert!(matches!(err, ExprError::Type(_)));
    }

    #[test]
    fn display_round_trips_the_source() {
        let expr = Expr::compile("data.cpu * 100").unwrap();
        assert_eq!(expr.to_string(), "!py data.cpu * 100");
        assert_eq!(expr.source(), "data.cpu * 100");
    }

    #[test]
    fn python_style_literals() {
        let scope = Scope::default();
        assert_eq!(eval("True", &scope), Value::Bool(true));
        assert_eq!(eval("None", &scope), Value::Null);
        assert_eq!(eval("False or 1", &scope), Value::Int(1));
    }

    #[test]
    fn parse_errors_carry_positions() {
        let err = Expr::compile("1 +").unwrap_err();
        assert!(matches!(err, ExprError::Parse { .. }));
        assert!(Expr::compile("").is_err());
        assert!(Expr::compile("1 ~ 2").is_err());
        assert!(Expr::compile("'open").is_err());
    }

    #[test]
    fn eval_is_pure() {
        let scope = Scope::default().with("x", Value::Int(2));
        let expr = Expr::compile("x * x").unwrap();
        assert_eq!(expr.eval(&scope).unwrap(), Value::Int(4));
        assert_eq!(expr.eval(&scope).unwrap(), Value::Int(4));
    }

    #[test]
    fn map_in_scope_used_as_event_overlay() {
        let event = Value::Map(value_map! {
            "id" => Value::Str("sensors/room1/temp".into()),
            "time" => Value::Int(1_700_000_000),
            "data" => Value::Map(value_map! {"value" => Value::Float(21.5)}),
        });
        let scope = Scope::default().with("event", event);
        assert_eq!(eval("event.data.value", &scope), Value::Float(21.5));
        assert_eq!(eval("event.time", &scope), Value::Int(1_700_000_000));
    }
}
