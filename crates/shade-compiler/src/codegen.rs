//! Bytecode generation from the shader AST
//!
//! Lowering walks the AST once, emitting through the append-only
//! [`Generator`]. Every statement begins with a `LINE` marker so the stepper
//! can attribute execution to source lines; jump targets are resolved with
//! forward patches. Local slot layout (parameters first, declaration order
//! after) is recorded into [`Symbols`] for the debugger.

use crate::ast::*;
use crate::dialect::Dialect;
use crate::error::{CompileError, CompileResult};
use crate::symbols::{FunctionSig, LocalVar, StorageQualifier, Symbols, Variable};
use rustc_hash::FxHashMap;
use shade_bytecode::{FunctionBuilder, Generator, Image, JumpPatch, Opcode, Param, StructureDef};
use shade_vm::ValueKind;

/// Generate an image for a full translation unit.
///
/// `symbols` arrives pre-seeded with the stage's built-in globals; declared
/// globals, structures, functions and per-function locals are added here.
pub fn generate(
    shader: &Shader,
    symbols: &mut Symbols,
    dialect: Dialect,
    entry: &str,
) -> CompileResult<Image> {
    if !shader.functions.iter().any(|f| f.name == entry) {
        return Err(CompileError::EntryNotFound(entry.to_string()));
    }

    let mut cg = CodeGen {
        dialect,
        symbols,
        gen: Generator::new(),
    };

    for s in &shader.structs {
        cg.declare_struct(s)?;
    }
    for g in &shader.globals {
        cg.declare_global(g)?;
    }
    for f in &shader.functions {
        cg.symbols.add_function(FunctionSig {
            name: f.name.clone(),
            ret: f.ret.clone(),
            params: f
                .params
                .iter()
                .map(|p| Variable {
                    name: p.name.clone(),
                    ty: p.ty.clone(),
                    qualifier: StorageQualifier::Global,
                    semantic: p.semantic.clone(),
                    array_size: None,
                })
                .collect(),
            line: f.line,
        });
    }

    for f in &shader.functions {
        let prologue = if f.name == entry {
            Some(&shader.globals[..])
        } else {
            None
        };
        cg.compile_function(f, prologue)?;
    }

    Ok(cg.gen.finalize())
}

/// Generate an image holding a single `$$immediate` function that evaluates
/// `expr` and stores the result into `result_global`.
pub fn generate_immediate(
    expr: &Expr,
    symbols: &mut Symbols,
    dialect: Dialect,
    result_global: &str,
) -> CompileResult<Image> {
    if expr.has_side_effects() {
        return Err(CompileError::ImmediateAssignment);
    }

    let mut cg = CodeGen {
        dialect,
        symbols,
        gen: Generator::new(),
    };

    let mut ctx = FuncCtx::new(FunctionBuilder::new("$$immediate", "void", vec![]), "void");
    cg.compile_expr(&mut ctx, expr)?;
    let id = cg.gen.define_string(result_global)?;
    ctx.fb.emit_store_global(id);
    ctx.fb.emit(Opcode::RetVoid);
    cg.gen.define_function(ctx.fb)?;

    Ok(cg.gen.finalize())
}

struct LoopCtx {
    break_patches: Vec<JumpPatch>,
    continue_patches: Vec<JumpPatch>,
}

struct FuncCtx {
    fb: FunctionBuilder,
    name: String,
    ret: String,
    scopes: Vec<FxHashMap<String, (u16, String)>>,
    loops: Vec<LoopCtx>,
}

impl FuncCtx {
    fn new(fb: FunctionBuilder, ret: &str) -> Self {
        let name = fb.name().to_string();
        Self {
            fb,
            name,
            ret: ret.to_string(),
            scopes: vec![FxHashMap::default()],
            loops: Vec::new(),
        }
    }

    fn lookup(&self, name: &str) -> Option<(u16, String)> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.get(name).cloned())
    }

    fn bind(&mut self, name: &str, slot: u16, ty: &str) {
        self.scopes
            .last_mut()
            .unwrap()
            .insert(name.to_string(), (slot, ty.to_string()));
    }
}

struct CodeGen<'s> {
    dialect: Dialect,
    symbols: &'s mut Symbols,
    gen: Generator,
}

impl CodeGen<'_> {
    // ===== Declarations =====

    fn declare_struct(&mut self, s: &StructDecl) -> CompileResult<()> {
        for (_, ty) in &s.fields {
            self.check_type(ty, s.line)?;
        }
        self.gen.define_structure(StructureDef {
            name: s.name.clone(),
            fields: s
                .fields
                .iter()
                .map(|(name, ty)| Param::new(name.clone(), ty.clone()))
                .collect(),
        })?;
        self.symbols.add_structure(crate::symbols::Structure {
            name: s.name.clone(),
            fields: s.fields.clone(),
        });
        Ok(())
    }

    fn declare_global(&mut self, g: &GlobalDecl) -> CompileResult<()> {
        self.check_type(&g.ty, g.line)?;
        self.symbols.add_global(Variable {
            name: g.name.clone(),
            ty: g.ty.clone(),
            qualifier: g.qualifier,
            semantic: g.semantic.clone(),
            array_size: g.array_size,
        });
        Ok(())
    }

    fn check_type(&self, ty: &str, line: u32) -> CompileResult<()> {
        if self.dialect.is_builtin_type(ty) || self.symbols.structure(ty).is_some() {
            Ok(())
        } else {
            Err(CompileError::UnknownType {
                name: ty.to_string(),
                line,
            })
        }
    }

    fn is_constructible(&self, name: &str) -> bool {
        self.dialect.vector_size(name).is_some()
            || self.dialect.matrix_size(name).is_some()
            || self.symbols.structure(name).is_some()
    }

    // ===== Functions =====

    fn compile_function(
        &mut self,
        f: &FunctionDecl,
        prologue_globals: Option<&[GlobalDecl]>,
    ) -> CompileResult<()> {
        if f.ret != "void" {
            self.check_type(&f.ret, f.line)?;
        }

        let params: Vec<Param> = f
            .params
            .iter()
            .map(|p| Param::new(p.name.clone(), p.ty.clone()))
            .collect();
        let mut ctx = FuncCtx::new(FunctionBuilder::new(f.name.clone(), f.ret.clone(), params), &f.ret);

        for (slot, p) in f.params.iter().enumerate() {
            self.check_type(&p.ty, f.line)?;
            ctx.bind(&p.name, slot as u16, &p.ty);
            self.symbols.add_local(
                &f.name,
                LocalVar {
                    name: p.name.clone(),
                    ty: p.ty.clone(),
                    slot: slot as u16,
                },
            );
        }

        // The entry function starts by running file-scope initializers, ahead
        // of the first line marker so stepping lands on real statements.
        if let Some(globals) = prologue_globals {
            for g in globals {
                self.compile_global_init(&mut ctx, g)?;
            }
        }

        self.compile_block(&mut ctx, &f.body)?;
        ctx.fb.emit(Opcode::RetVoid);

        self.gen.define_function(ctx.fb)?;
        Ok(())
    }

    fn compile_global_init(&mut self, ctx: &mut FuncCtx, g: &GlobalDecl) -> CompileResult<()> {
        // Inputs keep whatever the host injected; the prologue must not
        // overwrite them, declared defaults included.
        if matches!(
            g.qualifier,
            StorageQualifier::Uniform | StorageQualifier::In
        ) {
            return Ok(());
        }

        if let Some(init) = &g.init {
            self.compile_expr(ctx, init)?;
            self.emit_scalar_coerce(ctx, &g.ty);
            let id = self.gen.define_string(&g.name)?;
            ctx.fb.emit_store_global(id);
        } else if let Some(size) = g.array_size {
            ctx.fb.emit_new_array(size);
            let id = self.gen.define_string(&g.name)?;
            ctx.fb.emit_store_global(id);
        }
        Ok(())
    }

    // ===== Statements =====

    fn compile_block(&mut self, ctx: &mut FuncCtx, block: &Block) -> CompileResult<()> {
        ctx.scopes.push(FxHashMap::default());
        for stmt in &block.stmts {
            self.compile_stmt(ctx, stmt)?;
        }
        ctx.scopes.pop();
        Ok(())
    }

    fn compile_stmt(&mut self, ctx: &mut FuncCtx, stmt: &Stmt) -> CompileResult<()> {
        match stmt {
            Stmt::Decl {
                ty,
                declarators,
                line,
            } => self.compile_decl(ctx, ty, declarators, *line),
            Stmt::Expr { expr, line } => {
                ctx.fb.mark_line(*line);
                self.compile_expr(ctx, expr)?;
                ctx.fb.emit(Opcode::Pop);
                Ok(())
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
                line,
            } => {
                ctx.fb.mark_line(*line);
                self.compile_expr(ctx, cond)?;
                let to_else = ctx.fb.emit_jump(Opcode::JmpIfFalse);
                self.compile_block(ctx, then_branch)?;
                match else_branch {
                    Some(else_branch) => {
                        let to_end = ctx.fb.emit_jump(Opcode::Jmp);
                        ctx.fb.patch_jump(to_else);
                        self.compile_block(ctx, else_branch)?;
                        ctx.fb.patch_jump(to_end);
                    }
                    None => ctx.fb.patch_jump(to_else),
                }
                Ok(())
            }
            Stmt::While { cond, body, line } => {
                ctx.loops.push(LoopCtx {
                    break_patches: Vec::new(),
                    continue_patches: Vec::new(),
                });
                let top = ctx.fb.position();
                ctx.fb.mark_line(*line);
                self.compile_expr(ctx, cond)?;
                let exit = ctx.fb.emit_jump(Opcode::JmpIfFalse);
                self.compile_block(ctx, body)?;

                let lp = ctx.loops.pop().unwrap();
                for patch in lp.continue_patches {
                    ctx.fb.patch_jump(patch);
                }
                ctx.fb.emit_jump_back(Opcode::Jmp, top);
                ctx.fb.patch_jump(exit);
                for patch in lp.break_patches {
                    ctx.fb.patch_jump(patch);
                }
                Ok(())
            }
            Stmt::DoWhile { body, cond, line } => {
                ctx.loops.push(LoopCtx {
                    break_patches: Vec::new(),
                    continue_patches: Vec::new(),
                });
                let top = ctx.fb.position();
                self.compile_block(ctx, body)?;

                let lp = ctx.loops.pop().unwrap();
                for patch in lp.continue_patches {
                    ctx.fb.patch_jump(patch);
                }
                ctx.fb.mark_line(*line);
                self.compile_expr(ctx, cond)?;
                ctx.fb.emit_jump_back(Opcode::JmpIfTrue, top);
                for patch in lp.break_patches {
                    ctx.fb.patch_jump(patch);
                }
                Ok(())
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
                line,
            } => {
                ctx.scopes.push(FxHashMap::default());
                if let Some(init) = init {
                    self.compile_stmt(ctx, init)?;
                }

                ctx.loops.push(LoopCtx {
                    break_patches: Vec::new(),
                    continue_patches: Vec::new(),
                });
                let top = ctx.fb.position();
                ctx.fb.mark_line(*line);
                let exit = match cond {
                    Some(cond) => {
                        self.compile_expr(ctx, cond)?;
                        Some(ctx.fb.emit_jump(Opcode::JmpIfFalse))
                    }
                    None => None,
                };
                self.compile_block(ctx, body)?;

                let lp = ctx.loops.pop().unwrap();
                for patch in lp.continue_patches {
                    ctx.fb.patch_jump(patch);
                }
                if let Some(step) = step {
                    self.compile_expr(ctx, step)?;
                    ctx.fb.emit(Opcode::Pop);
                }
                ctx.fb.emit_jump_back(Opcode::Jmp, top);
                if let Some(exit) = exit {
                    ctx.fb.patch_jump(exit);
                }
                for patch in lp.break_patches {
                    ctx.fb.patch_jump(patch);
                }
                ctx.scopes.pop();
                Ok(())
            }
            Stmt::Return { value, line } => {
                ctx.fb.mark_line(*line);
                match value {
                    Some(value) => {
                        self.compile_expr(ctx, value)?;
                        let ret = ctx.ret.clone();
                        self.emit_scalar_coerce(ctx, &ret);
                        ctx.fb.emit(Opcode::Ret);
                    }
                    None => ctx.fb.emit(Opcode::RetVoid),
                }
                Ok(())
            }
            Stmt::Break { line } => {
                ctx.fb.mark_line(*line);
                let patch = ctx.fb.emit_jump(Opcode::Jmp);
                ctx.loops
                    .last_mut()
                    .ok_or(CompileError::InvalidBreak { line: *line })?
                    .break_patches
                    .push(patch);
                Ok(())
            }
            Stmt::Continue { line } => {
                ctx.fb.mark_line(*line);
                let patch = ctx.fb.emit_jump(Opcode::Jmp);
                ctx.loops
                    .last_mut()
                    .ok_or(CompileError::InvalidContinue { line: *line })?
                    .continue_patches
                    .push(patch);
                Ok(())
            }
            Stmt::Discard { line } => {
                ctx.fb.mark_line(*line);
                ctx.fb.emit(Opcode::Discard);
                Ok(())
            }
            Stmt::Block(block) => self.compile_block(ctx, block),
        }
    }

    fn compile_decl(
        &mut self,
        ctx: &mut FuncCtx,
        ty: &str,
        declarators: &[Declarator],
        line: u32,
    ) -> CompileResult<()> {
        self.check_type(ty, line)?;
        ctx.fb.mark_line(line);

        for d in declarators {
            let slot = ctx.fb.alloc_local()?;
            ctx.bind(&d.name, slot, ty);
            self.symbols.add_local(
                &ctx.name,
                LocalVar {
                    name: d.name.clone(),
                    ty: ty.to_string(),
                    slot,
                },
            );

            if let Some(size) = d.array_size {
                ctx.fb.emit_new_array(size);
            } else if let Some(init) = &d.init {
                self.compile_expr(ctx, init)?;
                self.emit_scalar_coerce(ctx, ty);
            } else {
                self.emit_default(ctx, ty)?;
            }
            ctx.fb.emit_store_local(slot);
        }
        Ok(())
    }

    fn emit_default(&mut self, ctx: &mut FuncCtx, ty: &str) -> CompileResult<()> {
        if let Some(kind) = self.dialect.scalar_kind(ty) {
            match kind {
                ValueKind::F32 => ctx.fb.emit_const_f32(0.0),
                ValueKind::Bool => ctx.fb.emit(Opcode::ConstFalse),
                ValueKind::U32 => {
                    ctx.fb.emit_const_i32(0);
                    ctx.fb.emit_coerce(ValueKind::U32.to_u8());
                }
                _ => ctx.fb.emit_const_i32(0),
            }
        } else if self.is_constructible(ty) {
            let id = self.gen.define_string(ty)?;
            ctx.fb.emit_new_object(id, 0);
        } else {
            // Opaque handles (samplers) start out null
            ctx.fb.emit(Opcode::ConstNull);
        }
        Ok(())
    }

    /// When the destination has a declared scalar type, force the stored
    /// value onto that kind (`float x = 2;` stores 2.0).
    fn emit_scalar_coerce(&mut self, ctx: &mut FuncCtx, ty: &str) {
        if let Some(kind) = self.dialect.scalar_kind(ty) {
            ctx.fb.emit_coerce(kind.to_u8());
        }
    }

    // ===== Expressions =====

    fn compile_expr(&mut self, ctx: &mut FuncCtx, expr: &Expr) -> CompileResult<()> {
        match expr {
            Expr::IntLit(v) => {
                ctx.fb.emit_const_i32(*v);
                Ok(())
            }
            Expr::FloatLit(v) => {
                ctx.fb.emit_const_f32(*v);
                Ok(())
            }
            Expr::BoolLit(v) => {
                ctx.fb.emit(if *v {
                    Opcode::ConstTrue
                } else {
                    Opcode::ConstFalse
                });
                Ok(())
            }
            Expr::Ident { name, line } => {
                if let Some((slot, _)) = ctx.lookup(name) {
                    ctx.fb.emit_load_local(slot);
                } else if self.symbols.global(name).is_some() {
                    let id = self.gen.define_string(name)?;
                    ctx.fb.emit_load_global(id);
                } else {
                    return Err(CompileError::UndefinedVariable {
                        name: name.clone(),
                        line: *line,
                    });
                }
                Ok(())
            }
            Expr::Unary { op, expr } => {
                self.compile_expr(ctx, expr)?;
                ctx.fb.emit(match op {
                    UnaryOp::Neg => Opcode::Neg,
                    UnaryOp::Not => Opcode::Not,
                });
                Ok(())
            }
            Expr::Binary { op, lhs, rhs } => self.compile_binary(ctx, *op, lhs, rhs),
            Expr::Assign {
                target,
                op,
                value,
                line,
            } => {
                match op {
                    Some(op) => {
                        self.compile_expr(ctx, target)?;
                        self.compile_expr(ctx, value)?;
                        ctx.fb.emit(arith_opcode(*op).ok_or(CompileError::Unsupported(
                            "compound assignment with a non-arithmetic operator".to_string(),
                        ))?);
                    }
                    None => self.compile_expr(ctx, value)?,
                }
                // Assignments are expressions; keep the stored value
                ctx.fb.emit(Opcode::Dup);
                self.compile_store(ctx, target, *line)
            }
            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.compile_expr(ctx, cond)?;
                let to_else = ctx.fb.emit_jump(Opcode::JmpIfFalse);
                self.compile_expr(ctx, then_expr)?;
                let to_end = ctx.fb.emit_jump(Opcode::Jmp);
                ctx.fb.patch_jump(to_else);
                self.compile_expr(ctx, else_expr)?;
                ctx.fb.patch_jump(to_end);
                Ok(())
            }
            Expr::Call { callee, args, line } => self.compile_call(ctx, callee, args, *line),
            Expr::Member { base, field } => {
                self.compile_expr(ctx, base)?;
                let id = self.gen.define_string(field)?;
                ctx.fb.emit_get_prop(id);
                Ok(())
            }
            Expr::Index { base, index } => {
                self.compile_expr(ctx, base)?;
                self.compile_expr(ctx, index)?;
                ctx.fb.emit(Opcode::Index);
                Ok(())
            }
            Expr::PreIncDec { target, inc, line } => {
                self.compile_expr(ctx, target)?;
                ctx.fb.emit_const_i32(1);
                ctx.fb.emit(if *inc { Opcode::Add } else { Opcode::Sub });
                ctx.fb.emit(Opcode::Dup);
                self.compile_store(ctx, target, *line)
            }
            Expr::PostIncDec { target, inc, line } => {
                // Old value stays under the updated one
                self.compile_expr(ctx, target)?;
                self.compile_expr(ctx, target)?;
                ctx.fb.emit_const_i32(1);
                ctx.fb.emit(if *inc { Opcode::Add } else { Opcode::Sub });
                self.compile_store(ctx, target, *line)
            }
        }
    }

    fn compile_binary(
        &mut self,
        ctx: &mut FuncCtx,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> CompileResult<()> {
        match op {
            // Short-circuit forms lower to branches
            BinaryOp::And => {
                self.compile_expr(ctx, lhs)?;
                ctx.fb.emit(Opcode::Dup);
                let end = ctx.fb.emit_jump(Opcode::JmpIfFalse);
                ctx.fb.emit(Opcode::Pop);
                self.compile_expr(ctx, rhs)?;
                ctx.fb.patch_jump(end);
                Ok(())
            }
            BinaryOp::Or => {
                self.compile_expr(ctx, lhs)?;
                ctx.fb.emit(Opcode::Dup);
                let end = ctx.fb.emit_jump(Opcode::JmpIfTrue);
                ctx.fb.emit(Opcode::Pop);
                self.compile_expr(ctx, rhs)?;
                ctx.fb.patch_jump(end);
                Ok(())
            }
            other => {
                self.compile_expr(ctx, lhs)?;
                self.compile_expr(ctx, rhs)?;
                let opcode = arith_opcode(other)
                    .or_else(|| cmp_opcode(other))
                    .expect("non-logical binary op");
                ctx.fb.emit(opcode);
                Ok(())
            }
        }
    }

    fn compile_call(
        &mut self,
        ctx: &mut FuncCtx,
        callee: &str,
        args: &[Expr],
        _line: u32,
    ) -> CompileResult<()> {
        // Scalar type names act as casts: float(x), int(x)
        if let Some(kind) = self.dialect.scalar_kind(callee) {
            if args.len() != 1 {
                return Err(CompileError::Unsupported(format!(
                    "{callee}() cast takes exactly one argument"
                )));
            }
            self.compile_expr(ctx, &args[0])?;
            ctx.fb.emit_coerce(kind.to_u8());
            return Ok(());
        }

        for arg in args {
            self.compile_expr(ctx, arg)?;
        }
        let id = self.gen.define_string(callee)?;

        if self.is_constructible(callee) {
            ctx.fb.emit_new_object(id, args.len() as u8);
        } else {
            // User functions and host intrinsics share the call opcode; the
            // program resolves the name at dispatch time.
            ctx.fb.emit_call(id, args.len() as u8);
        }
        Ok(())
    }

    /// Store the value on top of the stack into an lvalue. Nested member and
    /// index targets write back through their base chain.
    fn compile_store(&mut self, ctx: &mut FuncCtx, target: &Expr, line: u32) -> CompileResult<()> {
        match target {
            Expr::Ident { name, .. } => {
                if let Some((slot, ty)) = ctx.lookup(name) {
                    self.emit_scalar_coerce(ctx, &ty);
                    ctx.fb.emit_store_local(slot);
                } else if let Some(var) = self.symbols.global(name) {
                    let ty = var.ty.clone();
                    self.emit_scalar_coerce(ctx, &ty);
                    let id = self.gen.define_string(name)?;
                    ctx.fb.emit_store_global(id);
                } else {
                    return Err(CompileError::UndefinedVariable {
                        name: name.clone(),
                        line,
                    });
                }
                Ok(())
            }
            Expr::Member { base, field } => {
                self.compile_expr(ctx, base)?;
                ctx.fb.emit(Opcode::Swap);
                let id = self.gen.define_string(field)?;
                ctx.fb.emit_set_prop(id);
                self.compile_store(ctx, base, line)
            }
            Expr::Index { base, index } => {
                self.compile_expr(ctx, base)?;
                ctx.fb.emit(Opcode::Swap);
                self.compile_expr(ctx, index)?;
                ctx.fb.emit(Opcode::SetIndex);
                self.compile_store(ctx, base, line)
            }
            _ => Err(CompileError::InvalidAssignmentTarget { line }),
        }
    }
}

fn arith_opcode(op: BinaryOp) -> Option<Opcode> {
    Some(match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Mod => Opcode::Mod,
        _ => return None,
    })
}

fn cmp_opcode(op: BinaryOp) -> Option<Opcode> {
    Some(match op {
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Ne => Opcode::Ne,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Le => Opcode::Le,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Ge => Opcode::Ge,
        _ => return None,
    })
}
