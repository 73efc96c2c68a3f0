//! Node typing.
//!
//! Every expression node gets its result type here. The parser calls
//! [`add_type`] from its node constructors, so subtrees are always typed
//! before their parents.
//!
//! Error containment: if any operand has the Error type, the node silently
//! adopts Error too. Only the first diagnosis of a broken subexpression is
//! reported; everything built on top of it stays quiet. That is what keeps
//! one mistake from producing a cascade.

use crate::ast::{BinOp, Node, NodeKind};
use crate::types::{TypeId, TypeKind};
use crate::Compiler;
use cvm_core::source::Loc;

/// Wrap an expression in a cast to `ty` (no-op casts are elided).
pub fn new_cast(cc: &mut Compiler, expr: Node, ty: TypeId) -> Node {
    if expr.ty == Some(ty) {
        return expr;
    }
    let loc = expr.loc;
    let mut node = Node::typed(
        NodeKind::Cast {
            expr: Box::new(expr),
        },
        ty,
        loc,
    );
    // Keep Error flowing through casts.
    if let NodeKind::Cast { expr } = &node.kind {
        if expr.ty.is_some_and(|t| cc.types.is_error(t)) {
            node.ty = Some(cc.types.ty_error);
        }
    }
    node
}

/// Apply the usual arithmetic conversions to both operands.
pub fn usual_arith_conv(cc: &mut Compiler, lhs: &mut Node, rhs: &mut Node) -> TypeId {
    let (lt, rt) = (lhs.ty.unwrap(), rhs.ty.unwrap());
    let common = cc.types.common_type(lt, rt);
    take_and_cast(cc, lhs, common);
    take_and_cast(cc, rhs, common);
    common
}

fn take_and_cast(cc: &mut Compiler, slot: &mut Node, ty: TypeId) {
    if slot.ty == Some(ty) {
        return;
    }
    let owned = std::mem::replace(slot, Node::null(None));
    *slot = new_cast(cc, owned, ty);
}

/// Promote small integer types to int (for unary operators and shifts).
fn promote_int(cc: &mut Compiler, node: &mut Node) {
    let ty = node.ty.unwrap();
    if cc.types.is_integer(ty) && cc.types.get(ty).size < 4 {
        take_and_cast(cc, node, cc.types.ty_int);
    }
}

fn is_err(cc: &Compiler, node: &Node) -> bool {
    node.ty.is_some_and(|t| cc.types.is_error(t)) || node.is_error()
}

/// Report a type error unless the operands already failed; either way the
/// node decays to the Error type.
fn type_error(cc: &mut Compiler, loc: Option<Loc>, suppressed: bool, msg: String) -> TypeId {
    if !suppressed {
        cc.diags.error(loc, msg);
    }
    cc.types.ty_error
}

/// Compute and set the node's result type.
pub fn add_type(cc: &mut Compiler, node: &mut Node) {
    if node.ty.is_some() {
        return;
    }
    // Type children first; statements leave their ty as None.
    match &mut node.kind {
        NodeKind::Binary { lhs, rhs, .. }
        | NodeKind::LogAnd { lhs, rhs }
        | NodeKind::LogOr { lhs, rhs }
        | NodeKind::Assign { lhs, rhs }
        | NodeKind::Comma { lhs, rhs } => {
            add_type(cc, lhs);
            add_type(cc, rhs);
        }
        NodeKind::Neg { expr }
        | NodeKind::LogNot { expr }
        | NodeKind::BitNot { expr }
        | NodeKind::Deref { expr }
        | NodeKind::Addr { expr }
        | NodeKind::ExprStmt { expr }
        | NodeKind::GotoExpr { expr } => add_type(cc, expr),
        NodeKind::Member { base, .. } => add_type(cc, base),
        NodeKind::Cond {
            cond,
            then_expr,
            else_expr,
        } => {
            add_type(cc, cond);
            add_type(cc, then_expr);
            add_type(cc, else_expr);
        }
        NodeKind::Funcall { func, args } => {
            add_type(cc, func);
            for a in args.iter_mut() {
                add_type(cc, a);
            }
        }
        NodeKind::Cas {
            addr,
            expected,
            desired,
        } => {
            add_type(cc, addr);
            add_type(cc, expected);
            add_type(cc, desired);
        }
        NodeKind::Exch { addr, val } => {
            add_type(cc, addr);
            add_type(cc, val);
        }
        _ => {}
    }

    let loc = node.loc;
    let ty = match &mut node.kind {
        NodeKind::Num { val } => {
            if *val == *val as i32 as i64 {
                Some(cc.types.ty_int)
            } else {
                Some(cc.types.ty_long)
            }
        }
        NodeKind::FNum { .. } => Some(cc.types.ty_double),
        NodeKind::Var { obj } => Some(cc.objs.get(*obj).ty),
        NodeKind::NullExpr => Some(cc.types.ty_int),
        NodeKind::Error => Some(cc.types.ty_error),

        NodeKind::Binary { op, lhs, rhs } => {
            let suppressed = is_err(cc, lhs) || is_err(cc, rhs);
            if suppressed {
                Some(cc.types.ty_error)
            } else {
                match op {
                    BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                        let (lt, rt) = (lhs.ty.unwrap(), rhs.ty.unwrap());
                        if !cc.types.is_numeric(lt) && !cc.types.is_ptr(lt) {
                            Some(type_error(
                                cc,
                                loc,
                                false,
                                format!("invalid operands ({})", cc.types.display(lt)),
                            ))
                        } else if cc.types.is_ptr(lt) {
                            // Pointer arithmetic was already scaled by the
                            // parser; the pointer type wins.
                            Some(lt)
                        } else if matches!(op, BinOp::Mod) && !cc.types.is_integer(lt) {
                            Some(type_error(
                                cc,
                                loc,
                                false,
                                "invalid operands to %".to_string(),
                            ))
                        } else {
                            let _ = rt;
                            Some(usual_arith_conv(cc, lhs, rhs))
                        }
                    }
                    BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor => {
                        let (lt, rt) = (lhs.ty.unwrap(), rhs.ty.unwrap());
                        if !cc.types.is_integer(lt) || !cc.types.is_integer(rt) {
                            Some(type_error(
                                cc,
                                loc,
                                false,
                                "bitwise operator requires integer operands".to_string(),
                            ))
                        } else {
                            Some(usual_arith_conv(cc, lhs, rhs))
                        }
                    }
                    BinOp::Shl | BinOp::Shr => {
                        let lt = lhs.ty.unwrap();
                        if !cc.types.is_integer(lt) {
                            Some(type_error(
                                cc,
                                loc,
                                false,
                                "shift requires integer operands".to_string(),
                            ))
                        } else {
                            promote_int(cc, lhs);
                            promote_int(cc, rhs);
                            Some(lhs.ty.unwrap())
                        }
                    }
                    BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                        let (lt, rt) = (lhs.ty.unwrap(), rhs.ty.unwrap());
                        if cc.types.is_numeric(lt) && cc.types.is_numeric(rt) {
                            usual_arith_conv(cc, lhs, rhs);
                        }
                        Some(cc.types.ty_int)
                    }
                }
            }
        }

        NodeKind::LogAnd { lhs, rhs } | NodeKind::LogOr { lhs, rhs } => {
            if is_err(cc, lhs) || is_err(cc, rhs) {
                Some(cc.types.ty_error)
            } else {
                Some(cc.types.ty_int)
            }
        }

        NodeKind::Neg { expr } => {
            if is_err(cc, expr) {
                Some(cc.types.ty_error)
            } else if !cc.types.is_numeric(expr.ty.unwrap()) {
                Some(type_error(cc, loc, false, "invalid operand to unary minus".into()))
            } else {
                promote_int(cc, expr);
                Some(expr.ty.unwrap())
            }
        }
        NodeKind::LogNot { expr } => {
            if is_err(cc, expr) {
                Some(cc.types.ty_error)
            } else {
                Some(cc.types.ty_int)
            }
        }
        NodeKind::BitNot { expr } => {
            if is_err(cc, expr) {
                Some(cc.types.ty_error)
            } else if !cc.types.is_integer(expr.ty.unwrap()) {
                Some(type_error(cc, loc, false, "invalid operand to ~".into()))
            } else {
                promote_int(cc, expr);
                Some(expr.ty.unwrap())
            }
        }

        NodeKind::Assign { lhs, rhs } => {
            let suppressed = is_err(cc, lhs) || is_err(cc, rhs);
            if suppressed {
                Some(cc.types.ty_error)
            } else {
                let lt = lhs.ty.unwrap();
                if matches!(cc.types.get(lt).kind, TypeKind::Array { .. }) {
                    Some(type_error(cc, loc, false, "array is not an lvalue".into()))
                } else if cc.types.get(lt).is_const {
                    Some(type_error(
                        cc,
                        loc,
                        false,
                        "assignment of read-only location".into(),
                    ))
                } else {
                    if !cc.types.is_struct_or_union(lt) {
                        take_and_cast(cc, rhs, lt);
                    }
                    Some(lt)
                }
            }
        }

        NodeKind::Cond {
            cond,
            then_expr,
            else_expr,
        } => {
            if is_err(cc, cond) || is_err(cc, then_expr) || is_err(cc, else_expr) {
                Some(cc.types.ty_error)
            } else {
                let (tt, et) = (then_expr.ty.unwrap(), else_expr.ty.unwrap());
                if cc.types.is_void(tt) || cc.types.is_void(et) {
                    Some(cc.types.ty_void)
                } else if cc.types.is_struct_or_union(tt) || cc.types.is_ptr(tt) {
                    Some(tt)
                } else {
                    Some(usual_arith_conv(cc, then_expr, else_expr))
                }
            }
        }

        NodeKind::Comma { rhs, .. } => Some(rhs.ty.unwrap()),

        NodeKind::Member { base, member_idx } => {
            if is_err(cc, base) {
                Some(cc.types.ty_error)
            } else {
                let bt = base.ty.unwrap();
                let mty = cc.types.members_of(bt).get(*member_idx).map(|m| m.ty);
                match mty {
                    Some(t) => Some(t),
                    None => Some(type_error(cc, loc, false, "no such member".into())),
                }
            }
        }

        NodeKind::Addr { expr } => {
            if is_err(cc, expr) {
                Some(cc.types.ty_error)
            } else {
                let et = expr.ty.unwrap();
                match cc.types.get(et).kind {
                    TypeKind::Array { base, .. } => Some(cc.types.pointer_to(base)),
                    _ => Some(cc.types.pointer_to(et)),
                }
            }
        }

        NodeKind::Deref { expr } => {
            if is_err(cc, expr) {
                Some(cc.types.ty_error)
            } else {
                let et = expr.ty.unwrap();
                match cc.types.base_of(et) {
                    Some(base) if cc.types.is_void(base) => Some(type_error(
                        cc,
                        loc,
                        false,
                        "dereferencing a void pointer".into(),
                    )),
                    Some(base) => Some(base),
                    None => Some(type_error(cc, loc, false, "invalid pointer dereference".into())),
                }
            }
        }

        NodeKind::Funcall { func, args } => {
            let mut suppressed = is_err(cc, func);
            for a in args.iter() {
                suppressed |= is_err(cc, a);
            }
            if suppressed {
                Some(cc.types.ty_error)
            } else {
                let ft = func.ty.unwrap();
                let fty = match cc.types.get(ft).kind {
                    TypeKind::Func { .. } => Some(ft),
                    TypeKind::Ptr { base } if cc.types.is_func(base) => Some(base),
                    _ => None,
                };
                match fty.and_then(|f| cc.types.return_type_of(f)) {
                    Some(ret) => Some(ret),
                    None => Some(type_error(cc, loc, false, "called object is not a function".into())),
                }
            }
        }

        NodeKind::StmtExpr { body } => match body.last() {
            Some(Node {
                kind: NodeKind::ExprStmt { expr },
                ..
            }) => Some(expr.ty.unwrap_or(cc.types.ty_void)),
            _ => Some(cc.types.ty_void),
        },

        NodeKind::LabelVal { .. } => {
            let void = cc.types.ty_void;
            Some(cc.types.pointer_to(void))
        }
        NodeKind::VaStart => {
            let ch = cc.types.ty_char;
            Some(cc.types.pointer_to(ch))
        }
        NodeKind::Cas { .. } => Some(cc.types.ty_bool),
        NodeKind::Exch { val, .. } => Some(val.ty.unwrap()),
        NodeKind::VlaAlloc { .. } => Some(cc.types.ty_void),
        NodeKind::MemZero { .. } => None,
        NodeKind::Cast { .. } => unreachable!("casts are created typed"),

        // Statements carry no type.
        _ => None,
    };
    if let Some(ty) = ty {
        node.ty = Some(ty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typed_num(cc: &mut Compiler, v: i64) -> Node {
        let mut n = Node::num(v, None);
        add_type(cc, &mut n);
        n
    }

    #[test]
    fn binary_add_applies_conversions() {
        let mut cc = Compiler::new();
        let lhs = typed_num(&mut cc, 1);
        let rhs = {
            let mut n = Node::new(NodeKind::FNum { val: 2.0 }, None);
            add_type(&mut cc, &mut n);
            n
        };
        let mut add = Node::new(
            NodeKind::Binary {
                op: BinOp::Add,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            None,
        );
        add_type(&mut cc, &mut add);
        assert_eq!(add.ty, Some(cc.types.ty_double));
        // The int operand got a cast inserted.
        match &add.kind {
            NodeKind::Binary { lhs, .. } => {
                assert!(matches!(lhs.kind, NodeKind::Cast { .. }));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn error_operands_suppress_diagnostics() {
        let mut cc = Compiler::new();
        let mut bad = Node::error(None);
        add_type(&mut cc, &mut bad);
        let good = typed_num(&mut cc, 1);
        let mut add = Node::new(
            NodeKind::Binary {
                op: BinOp::Add,
                lhs: Box::new(bad),
                rhs: Box::new(good),
            },
            None,
        );
        add_type(&mut cc, &mut add);
        assert!(cc.types.is_error(add.ty.unwrap()));
        // No new diagnostic was emitted for the propagated error.
        assert_eq!(cc.diags.error_count(), 0);
    }

    #[test]
    fn comparisons_are_int() {
        let mut cc = Compiler::new();
        let lhs = typed_num(&mut cc, 1);
        let rhs = typed_num(&mut cc, 2);
        let mut cmp = Node::new(
            NodeKind::Binary {
                op: BinOp::Lt,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            None,
        );
        add_type(&mut cc, &mut cmp);
        assert_eq!(cmp.ty, Some(cc.types.ty_int));
    }
}
