//! # Pattern Match Lowering
//!
//! `match` lowers to a decision tree: a `switch` over integer tags where the
//! scrutinee is integral, then guard `cond_jump`s for class tests, string
//! equality, and arm guards. Arms are tried in textual order; without a
//! default arm over an open scrutinee the fall-through raises `MatchError`.

use crate::anvil::*;
use crate::lowering::FnLower;
use crate::CompilerResult;
use ember_typed_ast::{Expr, MatchArm, PrimKind, Type, TypedBody, TypedPattern};

impl<'s, 'p> FnLower<'s, 'p> {
    pub(crate) fn lower_match(
        &mut self,
        scrutinee: &'p Expr,
        arms: &'p [MatchArm],
        default: Option<&'p TypedBody>,
    ) -> CompilerResult<()> {
        let s = self.lower_expr(scrutinee)?;
        let exit = self.b.new_block();

        let is_integral = matches!(
            self.sh.types.type_of(scrutinee.ty),
            Type::Primitive(PrimKind::I8 | PrimKind::I32 | PrimKind::I64)
        );

        // Leading integer-literal arms with no guard collapse into one
        // switch; everything after chains as guarded tests.
        let mut rest_start = 0;
        if is_integral {
            let mut cases: Vec<(i64, BlockId)> = Vec::new();
            let mut case_blocks: Vec<(BlockId, &'p MatchArm)> = Vec::new();
            while rest_start < arms.len() {
                let arm = &arms[rest_start];
                match (&arm.pattern, &arm.guard) {
                    (TypedPattern::LitInt(v), None) => {
                        // Textual order breaks ties: first case for a value
                        // wins.
                        if !cases.iter().any(|(cv, _)| cv == v) {
                            let blk = self.b.new_block();
                            cases.push((*v, blk));
                            case_blocks.push((blk, arm));
                        }
                        rest_start += 1;
                    }
                    _ => break,
                }
            }
            if !cases.is_empty() {
                let chain = self.b.new_block();
                self.b.terminate(Terminator::Switch {
                    value: s,
                    cases,
                    default: chain,
                });
                for (blk, arm) in case_blocks {
                    self.enter_block(blk);
                    self.lower_body(&arm.body)?;
                    self.b.jump(exit);
                }
                self.enter_block(chain);
            }
        }

        for arm in &arms[rest_start..] {
            self.lower_arm(s, scrutinee, arm, exit)?;
        }

        // Fall-through: the default body, or an emitted MatchError trap for
        // a non-exhaustive match over an open type.
        if !self.b.is_terminated() {
            match default {
                Some(body) => {
                    self.lower_body(body)?;
                    self.b.jump(exit);
                }
                None => {
                    let match_error = self.sh.types.builtins().match_error;
                    let msg = self.sh.arena.intern("unmatched value");
                    let string_ty = self.sh.types.string_type();
                    let id = self.sh.module.intern_string(msg);
                    let msg_reg = self.b.const_string(id, string_ty);
                    let err_ty = self.sh.types.class_type(match_error);
                    let err = self.b.new_object(match_error, vec![msg_reg], err_ty);
                    self.b.terminate(Terminator::Throw { value: err });
                }
            }
        }

        self.enter_block(exit);
        Ok(())
    }

    fn lower_arm(
        &mut self,
        s: RegId,
        scrutinee: &'p Expr,
        arm: &'p MatchArm,
        exit: BlockId,
    ) -> CompilerResult<()> {
        if self.b.is_terminated() {
            return Ok(());
        }
        let body_blk = self.b.new_block();
        let next_blk = self.b.new_block();
        let bool_ty = self.sh.types.bool_type();

        match &arm.pattern {
            TypedPattern::LitInt(v) => {
                let c = self.b.const_int(*v, scrutinee.ty);
                let t = self.b.icmp(CmpPred::Eq, s, c, bool_ty);
                self.b.cond_jump(t, body_blk, next_blk);
                self.enter_block(body_blk);
            }
            TypedPattern::LitBool(v) => {
                let c = self.b.const_int(*v as i64, scrutinee.ty);
                let t = self.b.icmp(CmpPred::Eq, s, c, bool_ty);
                self.b.cond_jump(t, body_blk, next_blk);
                self.enter_block(body_blk);
            }
            TypedPattern::LitString(sym) => {
                let string_ty = self.sh.types.string_type();
                let id = self.sh.module.intern_string(*sym);
                let lit = self.b.const_string(id, string_ty);
                let t = self
                    .b
                    .call_intrinsic(Intrinsic::StringEquals, vec![s, lit], Some(bool_ty))
                    .expect("string_equals returns");
                self.b.cond_jump(t, body_blk, next_blk);
                self.enter_block(body_blk);
            }
            TypedPattern::Class {
                class,
                binding,
                name,
            } => {
                let t = self.b.fresh_reg(bool_ty);
                self.b.push(Op::InstanceOf {
                    dst: t,
                    object: s,
                    class: *class,
                });
                self.b.cond_jump(t, body_blk, next_blk);
                self.enter_block(body_blk);
                if let Some(binding) = binding {
                    let class_ty = self.sh.types.class_type(*class);
                    let narrowed = self.b.fresh_reg(class_ty);
                    self.b.push(Op::RefCast {
                        dst: narrowed,
                        src: s,
                        class: *class,
                    });
                    if self.machine.is_none() {
                        let name = name.unwrap_or(self.sh.wk.value);
                        self.declare_binding(*binding, name, class_ty);
                    }
                    self.write_binding(*binding, narrowed)?;
                }
            }
            TypedPattern::Wildcard { binding, name } => {
                self.b.jump(body_blk);
                self.enter_block(body_blk);
                if let Some(binding) = binding {
                    if self.machine.is_none() {
                        let name = name.unwrap_or(self.sh.wk.value);
                        self.declare_binding(*binding, name, scrutinee.ty);
                    }
                    self.write_binding(*binding, s)?;
                }
            }
        }

        if let Some(guard) = &arm.guard {
            let g = self.lower_expr(guard)?;
            let guarded = self.b.new_block();
            self.b.cond_jump(g, guarded, next_blk);
            self.enter_block(guarded);
        }

        self.lower_body(&arm.body)?;
        self.b.jump(exit);
        self.enter_block(next_blk);
        Ok(())
    }
}
