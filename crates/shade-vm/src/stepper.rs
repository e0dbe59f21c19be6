//! The stepping interpreter
//!
//! A [`Stepper`] is one execution cursor over a [`Program`]: a frame stack
//! plus per-frame PC. [`step`](Stepper::step) advances by exactly one
//! *observable* instruction; `LINE` markers and `NOP`s are consumed on the
//! way and only update `current_line`. The caller drives dispatch; there is
//! no internal concurrency and no suspension inside a step.

use crate::object::Object;
use crate::program::Program;
use crate::value::{self, Arith, Cmp, Value, ValueKind};
use crate::{VmError, VmResult};
use shade_bytecode::{FunctionDef, Image, Opcode};
use std::rc::Rc;

/// Maximum call depth before the stepper reports stack overflow
const MAX_FRAME_DEPTH: usize = 256;

/// Result of one observable step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// One observable instruction executed; more remain
    Paused,
    /// The outermost frame returned; the result is available
    Terminated,
    /// The stepper or program was aborted; no state was changed
    Aborted,
}

/// One activation record
pub struct Frame {
    image: Rc<Image>,
    func: usize,
    /// Absolute PC into the owning image's code section
    pub pc: usize,
    /// Local slots; parameters occupy the first slots
    pub locals: Vec<Value>,
    /// Scratch operand stack
    pub stack: Vec<Value>,
}

impl Frame {
    /// Directory entry of the function this frame executes
    pub fn function(&self) -> &FunctionDef {
        &self.image.functions[self.func]
    }

    /// Function name
    pub fn name(&self) -> &str {
        &self.function().name
    }

    /// PC relative to the function body start
    pub fn rel_pc(&self) -> usize {
        self.pc - self.function().offset
    }

    /// Source line this frame is currently on, per the function's line map
    pub fn line(&self) -> Option<u32> {
        self.function().line_at_offset(self.rel_pc() as u32)
    }

    /// Read a local slot
    pub fn local(&self, slot: usize) -> Option<&Value> {
        self.locals.get(slot)
    }
}

/// The execution cursor; one per program run
pub struct Stepper {
    program: Rc<Program>,
    frames: Vec<Frame>,
    terminated: bool,
    aborted: bool,
    result: Value,
    steps: u64,
    step_limit: Option<u64>,
}

impl Stepper {
    /// Create a stepper positioned before the first instruction of `entry`.
    ///
    /// Arguments are bound to the entry's parameter slots left-to-right; the
    /// count must match the declared parameter list.
    pub fn new(program: Rc<Program>, entry: &str, args: &[Value]) -> VmResult<Self> {
        let mut stepper = Self {
            program,
            frames: Vec::new(),
            terminated: false,
            aborted: false,
            result: Value::Null,
            steps: 0,
            step_limit: None,
        };
        stepper.push_call(entry, args.to_vec())?;
        Ok(stepper)
    }

    /// Create a stepper, run it to completion and return a copy of the result.
    pub fn call(program: Rc<Program>, entry: &str, args: &[Value]) -> VmResult<Value> {
        let mut stepper = Self::new(program, entry, args)?;
        stepper.run_to_end()?;
        Ok(stepper.result.clone())
    }

    /// The program this stepper runs
    pub fn program(&self) -> &Rc<Program> {
        &self.program
    }

    /// Read-only view of the frame stack (outermost first)
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Current frame depth
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// The innermost frame
    pub fn current_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Name of the function the innermost frame executes
    pub fn current_function(&self) -> Option<&str> {
        self.frames.last().map(|f| f.image.functions[f.func].name.as_str())
    }

    /// The top-level return value (meaningful once terminated)
    pub fn result(&self) -> &Value {
        &self.result
    }

    /// Whether the outermost frame has returned
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Whether this stepper was aborted
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Observable steps executed so far
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Bound the number of observable steps; exceeding it is a runtime error
    pub fn set_step_limit(&mut self, limit: Option<u64>) {
        self.step_limit = limit;
    }

    /// Abort this stepper and its program. Irreversible for this instance:
    /// every subsequent dispatch yields without executing.
    pub fn abort(&mut self) {
        self.aborted = true;
        self.program.abort();
    }

    /// Relocate the innermost frame's PC to the first instruction whose
    /// source line is `>= line`. Fails if the current function has no such
    /// instruction.
    pub fn jump_to_line(&mut self, line: u32) -> VmResult<()> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| VmError::TypeMismatch("no active frame".to_string()))?;
        let def = &frame.image.functions[frame.func];
        let rel = def
            .offset_at_line(line)
            .ok_or_else(|| VmError::TypeMismatch(format!("no instruction at line {line}")))?;
        frame.pc = def.offset + rel as usize;
        Ok(())
    }

    /// Consume pending debug markers at the PC, updating `current_line`,
    /// and stop positioned at the next observable instruction.
    ///
    /// This is how the debugger lands *on* a source line before executing
    /// any of it; a plain [`step`](Self::step) consumes the markers itself.
    pub fn skip_markers(&mut self) -> VmResult<()> {
        if self.aborted || self.terminated || self.program.is_aborted() {
            return Ok(());
        }
        let frame = self.frames.last_mut().expect("stepper has no frames");
        let image = frame.image.clone();
        let def = &image.functions[frame.func];
        let end = def.offset + def.len;

        while frame.pc < end {
            match Opcode::from_u8(image.code[frame.pc]) {
                Some(Opcode::Nop) => frame.pc += 1,
                Some(Opcode::Line) => {
                    let at = frame.pc + 1;
                    if at + 4 > image.code.len() {
                        return Err(VmError::TruncatedCode(at));
                    }
                    let line = u32::from_le_bytes([
                        image.code[at],
                        image.code[at + 1],
                        image.code[at + 2],
                        image.code[at + 3],
                    ]);
                    frame.pc = at + 4;
                    self.program.set_current_line(line as i32);
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Execute exactly one observable step.
    pub fn step(&mut self) -> VmResult<StepOutcome> {
        if self.aborted || self.program.is_aborted() {
            self.aborted = true;
            return Ok(StepOutcome::Aborted);
        }
        if self.terminated {
            return Ok(StepOutcome::Terminated);
        }

        loop {
            if let Some(limit) = self.step_limit {
                if self.steps >= limit {
                    return Err(VmError::StepBudgetExhausted);
                }
            }

            match self.dispatch()? {
                Dispatch::Marker => continue,
                Dispatch::Observable => {
                    self.steps += 1;
                    // A host callback may have aborted the program mid-step
                    if self.program.is_aborted() {
                        self.aborted = true;
                        return Ok(StepOutcome::Aborted);
                    }
                    return Ok(StepOutcome::Paused);
                }
                Dispatch::Returned(outcome) => {
                    self.steps += 1;
                    return Ok(outcome);
                }
                Dispatch::Discarded => {
                    self.steps += 1;
                    return Ok(StepOutcome::Aborted);
                }
            }
        }
    }

    /// Run observable steps until `pred` holds after a step, the program
    /// terminates, or it is aborted.
    pub fn run_until<F>(&mut self, mut pred: F) -> VmResult<StepOutcome>
    where
        F: FnMut(&Stepper) -> bool,
    {
        loop {
            let outcome = self.step()?;
            match outcome {
                StepOutcome::Paused => {
                    if pred(self) {
                        return Ok(outcome);
                    }
                }
                other => return Ok(other),
            }
        }
    }

    /// Run to termination or abort.
    pub fn run_to_end(&mut self) -> VmResult<StepOutcome> {
        self.run_until(|_| false)
    }

    // ===== Dispatch =====

    fn dispatch(&mut self) -> VmResult<Dispatch> {
        let frame = self.frames.last_mut().expect("stepper has no frames");
        let image = frame.image.clone();
        let def = &image.functions[frame.func];
        let end = def.offset + def.len;

        // Falling off the end of the body is an implicit void return
        if frame.pc >= end {
            return Ok(Dispatch::Returned(self.do_return(Value::Null)));
        }

        let byte = image.code[frame.pc];
        let op = Opcode::from_u8(byte).ok_or(VmError::InvalidOpcode(byte))?;
        frame.pc += 1;

        // Decode operands up front so the frame borrow can end before
        // executing (calls and returns reshape the frame stack).
        let mut cursor = frame.pc;
        let code: &[u8] = &image.code;
        let read_u8 = |c: &mut usize| -> VmResult<u8> {
            let v = *code.get(*c).ok_or(VmError::TruncatedCode(*c))?;
            *c += 1;
            Ok(v)
        };
        let read_u16 = |c: &mut usize| -> VmResult<u16> {
            if *c + 2 > code.len() {
                return Err(VmError::TruncatedCode(*c));
            }
            let v = u16::from_le_bytes([code[*c], code[*c + 1]]);
            *c += 2;
            Ok(v)
        };
        let read_u32 = |c: &mut usize| -> VmResult<u32> {
            if *c + 4 > code.len() {
                return Err(VmError::TruncatedCode(*c));
            }
            let v = u32::from_le_bytes([code[*c], code[*c + 1], code[*c + 2], code[*c + 3]]);
            *c += 4;
            Ok(v)
        };

        let result = match op {
            Opcode::Nop => {
                frame.pc = cursor;
                return Ok(Dispatch::Marker);
            }
            Opcode::Line => {
                let line = read_u32(&mut cursor)?;
                frame.pc = cursor;
                self.program.set_current_line(line as i32);
                return Ok(Dispatch::Marker);
            }

            Opcode::Pop => {
                frame.pc = cursor;
                self.pop()?;
                Dispatch::Observable
            }
            Opcode::Dup => {
                frame.pc = cursor;
                let top = self.peek()?.clone();
                self.push(top);
                Dispatch::Observable
            }
            Opcode::Swap => {
                frame.pc = cursor;
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b);
                self.push(a);
                Dispatch::Observable
            }

            Opcode::ConstNull => {
                frame.pc = cursor;
                self.push(Value::Null);
                Dispatch::Observable
            }
            Opcode::ConstTrue => {
                frame.pc = cursor;
                self.push(Value::Bool(true));
                Dispatch::Observable
            }
            Opcode::ConstFalse => {
                frame.pc = cursor;
                self.push(Value::Bool(false));
                Dispatch::Observable
            }
            Opcode::ConstI32 => {
                let v = read_u32(&mut cursor)? as i32;
                frame.pc = cursor;
                self.push(Value::I32(v));
                Dispatch::Observable
            }
            Opcode::ConstF32 => {
                let v = f32::from_bits(read_u32(&mut cursor)?);
                frame.pc = cursor;
                self.push(Value::F32(v));
                Dispatch::Observable
            }
            Opcode::ConstStr => {
                let id = read_u32(&mut cursor)?;
                frame.pc = cursor;
                let s = Self::string(&image, id)?.to_string();
                self.push(Value::Str(s));
                Dispatch::Observable
            }

            Opcode::LoadLocal => {
                let slot = read_u16(&mut cursor)? as usize;
                frame.pc = cursor;
                let count = frame.locals.len();
                let v = frame
                    .locals
                    .get(slot)
                    .cloned()
                    .ok_or(VmError::LocalOutOfRange { slot, count })?;
                self.push(v);
                Dispatch::Observable
            }
            Opcode::StoreLocal => {
                let slot = read_u16(&mut cursor)? as usize;
                frame.pc = cursor;
                let v = self.pop()?;
                let frame = self.frames.last_mut().unwrap();
                let count = frame.locals.len();
                *frame
                    .locals
                    .get_mut(slot)
                    .ok_or(VmError::LocalOutOfRange { slot, count })? = v;
                Dispatch::Observable
            }
            Opcode::LoadGlobal => {
                let id = read_u32(&mut cursor)?;
                frame.pc = cursor;
                let name = Self::string(&image, id)?;
                let v = self
                    .program
                    .get_global(name)
                    .ok_or_else(|| VmError::UndefinedGlobal(name.to_string()))?;
                self.push(v);
                Dispatch::Observable
            }
            Opcode::StoreGlobal => {
                let id = read_u32(&mut cursor)?;
                frame.pc = cursor;
                let name = Self::string(&image, id)?.to_string();
                let v = self.pop()?;
                self.program.set_global(&name, v);
                Dispatch::Observable
            }

            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                frame.pc = cursor;
                let b = self.pop()?;
                let a = self.pop()?;
                let op = match op {
                    Opcode::Add => Arith::Add,
                    Opcode::Sub => Arith::Sub,
                    Opcode::Mul => Arith::Mul,
                    Opcode::Div => Arith::Div,
                    _ => Arith::Mod,
                };
                self.push(value::arith(op, &a, &b)?);
                Dispatch::Observable
            }
            Opcode::Neg => {
                frame.pc = cursor;
                let a = self.pop()?;
                self.push(value::negate(&a)?);
                Dispatch::Observable
            }
            Opcode::Coerce => {
                let code = read_u8(&mut cursor)?;
                frame.pc = cursor;
                let kind = ValueKind::from_u8(code)
                    .ok_or_else(|| VmError::TypeMismatch(format!("invalid coercion target {code}")))?;
                let a = self.pop()?;
                self.push(a.coerce(kind)?);
                Dispatch::Observable
            }

            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                frame.pc = cursor;
                let b = self.pop()?;
                let a = self.pop()?;
                let op = match op {
                    Opcode::Eq => Cmp::Eq,
                    Opcode::Ne => Cmp::Ne,
                    Opcode::Lt => Cmp::Lt,
                    Opcode::Le => Cmp::Le,
                    Opcode::Gt => Cmp::Gt,
                    _ => Cmp::Ge,
                };
                self.push(value::compare(op, &a, &b)?);
                Dispatch::Observable
            }
            Opcode::Not => {
                frame.pc = cursor;
                let a = self.pop()?;
                self.push(Value::Bool(!a.is_truthy()));
                Dispatch::Observable
            }

            Opcode::GetProp => {
                let id = read_u32(&mut cursor)?;
                frame.pc = cursor;
                let name = Self::string(&image, id)?.to_string();
                let target = self.pop()?;
                let obj = match target {
                    Value::Object(o) => o,
                    other => {
                        return Err(VmError::TypeMismatch(format!(
                            "property access on {}",
                            other.type_name()
                        )))
                    }
                };
                let v = match obj.get(&name) {
                    Some(v) => v.clone(),
                    None => {
                        let getter = self.program.property_getter();
                        getter
                            .and_then(|g| g(&self.program, &obj, &name))
                            .ok_or_else(|| VmError::UnknownProperty {
                                class: obj.class.clone(),
                                name: name.clone(),
                            })?
                    }
                };
                self.push(v);
                Dispatch::Observable
            }
            Opcode::SetProp => {
                let id = read_u32(&mut cursor)?;
                frame.pc = cursor;
                let name = Self::string(&image, id)?.to_string();
                let v = self.pop()?;
                let target = self.pop()?;
                let mut obj = match target {
                    Value::Object(o) => o,
                    other => {
                        return Err(VmError::TypeMismatch(format!(
                            "property write on {}",
                            other.type_name()
                        )))
                    }
                };
                if !obj.has(&name) {
                    return Err(VmError::UnknownProperty {
                        class: obj.class.clone(),
                        name,
                    });
                }
                // Numeric component slots keep their kind on write
                let existing = obj.get(&name).unwrap().kind();
                let v = if existing.is_numeric() && v.kind().is_numeric() {
                    v.coerce(existing)?
                } else {
                    v
                };
                obj.set(&name, v);
                self.push(Value::Object(obj));
                Dispatch::Observable
            }
            Opcode::NewObject => {
                let id = read_u32(&mut cursor)?;
                let argc = read_u8(&mut cursor)? as usize;
                frame.pc = cursor;
                let class = Self::string(&image, id)?.to_string();
                let args = self.pop_args(argc)?;
                let v = self.construct(&class, args)?;
                self.push(v);
                Dispatch::Observable
            }

            Opcode::Index => {
                frame.pc = cursor;
                let idx = self.pop_index()?;
                let target = self.pop()?;
                match target {
                    Value::Array(items) => {
                        let len = items.len();
                        let v = usize::try_from(idx)
                            .ok()
                            .and_then(|i| items.get(i).cloned())
                            .ok_or(VmError::IndexOutOfBounds { index: idx, len })?;
                        self.push(v);
                    }
                    // Vectors and matrices index their components positionally
                    Value::Object(o) => {
                        let len = o.len();
                        let v = usize::try_from(idx)
                            .ok()
                            .and_then(|i| o.props().get(i))
                            .map(|(_, v)| v.clone())
                            .ok_or(VmError::IndexOutOfBounds { index: idx, len })?;
                        self.push(v);
                    }
                    other => {
                        return Err(VmError::TypeMismatch(format!(
                            "indexing into {}",
                            other.type_name()
                        )))
                    }
                }
                Dispatch::Observable
            }
            Opcode::SetIndex => {
                frame.pc = cursor;
                let idx = self.pop_index()?;
                let v = self.pop()?;
                let target = self.pop()?;
                match target {
                    Value::Array(mut items) => {
                        let len = items.len();
                        let slot = usize::try_from(idx)
                            .ok()
                            .filter(|&i| i < len)
                            .ok_or(VmError::IndexOutOfBounds { index: idx, len })?;
                        items[slot] = v;
                        self.push(Value::Array(items));
                    }
                    Value::Object(mut o) => {
                        let len = o.len();
                        let slot = usize::try_from(idx)
                            .ok()
                            .filter(|&i| i < len)
                            .ok_or(VmError::IndexOutOfBounds { index: idx, len })?;
                        let (_, target_slot) = &mut o.props_mut()[slot];
                        *target_slot = if target_slot.kind().is_numeric() && v.kind().is_numeric() {
                            v.coerce(target_slot.kind())?
                        } else {
                            v
                        };
                        self.push(Value::Object(o));
                    }
                    other => {
                        return Err(VmError::TypeMismatch(format!(
                            "index write into {}",
                            other.type_name()
                        )))
                    }
                }
                Dispatch::Observable
            }
            Opcode::NewArray => {
                let len = read_u16(&mut cursor)? as usize;
                frame.pc = cursor;
                self.push(Value::Array(vec![Value::Null; len]));
                Dispatch::Observable
            }
            Opcode::ArrayLen => {
                frame.pc = cursor;
                let target = self.pop()?;
                match target {
                    Value::Array(items) => self.push(Value::I32(items.len() as i32)),
                    other => {
                        return Err(VmError::TypeMismatch(format!(
                            "length of {}",
                            other.type_name()
                        )))
                    }
                }
                Dispatch::Observable
            }

            Opcode::Jmp => {
                let off = read_u32(&mut cursor)? as i32;
                frame.pc = (cursor as i64 + off as i64) as usize;
                Dispatch::Observable
            }
            Opcode::JmpIfFalse => {
                let off = read_u32(&mut cursor)? as i32;
                frame.pc = cursor;
                let cond = self.pop()?;
                if !cond.is_truthy() {
                    let frame = self.frames.last_mut().unwrap();
                    frame.pc = (cursor as i64 + off as i64) as usize;
                }
                Dispatch::Observable
            }
            Opcode::JmpIfTrue => {
                let off = read_u32(&mut cursor)? as i32;
                frame.pc = cursor;
                let cond = self.pop()?;
                if cond.is_truthy() {
                    let frame = self.frames.last_mut().unwrap();
                    frame.pc = (cursor as i64 + off as i64) as usize;
                }
                Dispatch::Observable
            }

            Opcode::Call => {
                let id = read_u32(&mut cursor)?;
                let argc = read_u8(&mut cursor)? as usize;
                frame.pc = cursor;
                let name = Self::string(&image, id)?.to_string();
                let mut args = self.pop_args(argc)?;

                if let Some((callee_image, idx)) = self.program.resolve_function(&name) {
                    let def = &callee_image.functions[idx];
                    if def.params.len() != args.len() {
                        return Err(VmError::ArgumentCount {
                            name,
                            expected: def.params.len(),
                            got: args.len(),
                        });
                    }
                    self.push_frame(callee_image.clone(), idx, args)?;
                } else if let Some(host) = self.program.host_fn(&name) {
                    let ret = host(&self.program, &mut args);
                    self.push(ret);
                } else {
                    return Err(VmError::UndefinedFunction(name));
                }
                Dispatch::Observable
            }
            Opcode::Ret => {
                frame.pc = cursor;
                let v = self.pop()?;
                Dispatch::Returned(self.do_return(v))
            }
            Opcode::RetVoid => {
                frame.pc = cursor;
                Dispatch::Returned(self.do_return(Value::Null))
            }

            Opcode::Discard => {
                frame.pc = cursor;
                if let Some(host) = self.program.host_fn("$$discard") {
                    let mut args = Vec::new();
                    host(&self.program, &mut args);
                }
                self.aborted = true;
                self.program.abort();
                Dispatch::Discarded
            }
        };

        Ok(result)
    }

    // ===== Call/return protocol =====

    fn push_call(&mut self, name: &str, args: Vec<Value>) -> VmResult<()> {
        let (image, idx) = self
            .program
            .resolve_function(name)
            .ok_or_else(|| VmError::UndefinedFunction(name.to_string()))?;
        let def = &image.functions[idx];
        if def.params.len() != args.len() {
            return Err(VmError::ArgumentCount {
                name: name.to_string(),
                expected: def.params.len(),
                got: args.len(),
            });
        }
        self.push_frame(image.clone(), idx, args)
    }

    fn push_frame(&mut self, image: Rc<Image>, func: usize, args: Vec<Value>) -> VmResult<()> {
        if self.frames.len() >= MAX_FRAME_DEPTH {
            return Err(VmError::StackOverflow);
        }
        let def = &image.functions[func];
        let mut locals = vec![Value::Null; def.local_count];
        for (slot, arg) in args.into_iter().enumerate() {
            locals[slot] = arg;
        }
        let pc = def.offset;
        self.frames.push(Frame {
            image,
            func,
            pc,
            locals,
            stack: Vec::new(),
        });
        Ok(())
    }

    fn do_return(&mut self, value: Value) -> StepOutcome {
        self.frames.pop();
        if let Some(caller) = self.frames.last_mut() {
            caller.stack.push(value);
            // current_line tracks the resumed frame again, not the callee's
            // last marker
            if let Some(line) = caller.line() {
                self.program.set_current_line(line as i32);
            }
            StepOutcome::Paused
        } else {
            self.result = value;
            self.terminated = true;
            StepOutcome::Terminated
        }
    }

    // ===== Operand stack =====

    fn push(&mut self, value: Value) {
        self.frames.last_mut().unwrap().stack.push(value);
    }

    fn pop(&mut self) -> VmResult<Value> {
        self.frames
            .last_mut()
            .unwrap()
            .stack
            .pop()
            .ok_or(VmError::StackUnderflow)
    }

    fn peek(&self) -> VmResult<&Value> {
        self.frames
            .last()
            .unwrap()
            .stack
            .last()
            .ok_or(VmError::StackUnderflow)
    }

    /// Pop `argc` values and restore declaration order
    fn pop_args(&mut self, argc: usize) -> VmResult<Vec<Value>> {
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();
        Ok(args)
    }

    fn pop_index(&mut self) -> VmResult<i64> {
        let v = self.pop()?;
        match v.coerce(ValueKind::I32)? {
            Value::I32(i) => Ok(i as i64),
            _ => unreachable!(),
        }
    }

    fn string(image: &Image, id: u32) -> VmResult<&str> {
        image.string(id).ok_or(VmError::BadStringId(id))
    }

    // ===== Object construction =====

    fn construct(&self, class: &str, args: Vec<Value>) -> VmResult<Value> {
        // User structure layouts take precedence over the extension
        if let Some(def) = self.program.structure(class) {
            let fields = def.fields.clone();
            if !args.is_empty() && args.len() != fields.len() {
                return Err(VmError::ArgumentCount {
                    name: class.to_string(),
                    expected: fields.len(),
                    got: args.len(),
                });
            }
            let mut props: Vec<(String, Value)> = fields
                .into_iter()
                .map(|f| (f.name, Value::Null))
                .collect();
            for (slot, arg) in props.iter_mut().zip(args) {
                slot.1 = arg;
            }
            return Ok(Value::Object(Object::with_props(class, props)));
        }

        let ctor = self
            .program
            .default_constructor()
            .ok_or_else(|| VmError::UnknownType(class.to_string()))?;
        let base = ctor(&self.program, class).ok_or_else(|| VmError::UnknownType(class.to_string()))?;
        let mut obj = match base {
            Value::Object(o) => o,
            other => return Ok(other),
        };
        Self::fill_constructed(&mut obj, args)?;
        Ok(Value::Object(obj))
    }

    /// Shader constructor semantics: flatten vector arguments into
    /// components, then splat a single scalar or assign component-wise.
    fn fill_constructed(obj: &mut Object, args: Vec<Value>) -> VmResult<()> {
        if args.is_empty() {
            return Ok(());
        }

        let mut flat = Vec::new();
        for arg in args {
            match arg {
                Value::Object(o) if o.is_numeric() => {
                    flat.extend(o.props().iter().map(|(_, v)| v.clone()));
                }
                other => flat.push(other),
            }
        }

        if flat.len() == 1 && obj.is_numeric() {
            let scalar = flat.pop().unwrap();
            for (_, slot) in obj.props_mut().iter_mut() {
                *slot = scalar.coerce(slot.kind())?;
            }
            return Ok(());
        }

        if flat.len() != obj.len() {
            return Err(VmError::ArgumentCount {
                name: obj.class.clone(),
                expected: obj.len(),
                got: flat.len(),
            });
        }
        for (i, v) in flat.into_iter().enumerate() {
            let (_, slot) = &mut obj.props_mut()[i];
            *slot = if slot.kind().is_numeric() && v.kind().is_numeric() {
                v.coerce(slot.kind())?
            } else {
                v
            };
        }
        Ok(())
    }
}

enum Dispatch {
    /// A marker was consumed; not an observable step
    Marker,
    /// One observable instruction executed
    Observable,
    /// A frame returned (possibly the last)
    Returned(StepOutcome),
    /// The discard signal fired
    Discarded,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Program;
    use shade_bytecode::{FunctionBuilder, Generator, Param};
    use std::cell::Cell;

    fn instantiate(gen: &mut Generator) -> Rc<Program> {
        Program::instantiate(gen.finalize()).unwrap()
    }

    #[test]
    fn test_arithmetic_and_locals() {
        // main() { int x = 2 + 3 * 4; return x; }
        let mut gen = Generator::new();
        let mut main = FunctionBuilder::new("main", "int", vec![]);
        let x = main.alloc_local().unwrap();
        main.emit_const_i32(3);
        main.emit_const_i32(4);
        main.emit(Opcode::Mul);
        main.emit_const_i32(2);
        main.emit(Opcode::Add);
        main.emit_store_local(x);
        main.emit_load_local(x);
        main.emit(Opcode::Ret);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        let result = Stepper::call(program, "main", &[]).unwrap();
        assert_eq!(result, Value::I32(14));
    }

    #[test]
    fn test_line_markers_are_not_observable() {
        let mut gen = Generator::new();
        let mut main = FunctionBuilder::new("main", "void", vec![]);
        main.mark_line(1);
        main.mark_line(2);
        main.emit(Opcode::ConstTrue);
        main.emit(Opcode::RetVoid);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        let mut stepper = Stepper::new(program.clone(), "main", &[]).unwrap();

        // First observable step swallows both markers and runs ConstTrue
        assert_eq!(stepper.step().unwrap(), StepOutcome::Paused);
        assert_eq!(program.current_line(), 2);
        assert_eq!(stepper.steps(), 1);

        assert_eq!(stepper.step().unwrap(), StepOutcome::Terminated);
        assert!(stepper.is_terminated());
    }

    #[test]
    fn test_call_and_return() {
        // double(x) { return x * 2; }  main() { return double(21); }
        let mut gen = Generator::new();
        let double_id = gen.define_string("double").unwrap();

        let mut double = FunctionBuilder::new("double", "int", vec![Param::new("x", "int")]);
        double.emit_load_local(0);
        double.emit_const_i32(2);
        double.emit(Opcode::Mul);
        double.emit(Opcode::Ret);
        gen.define_function(double).unwrap();

        let mut main = FunctionBuilder::new("main", "int", vec![]);
        main.emit_const_i32(21);
        main.emit_call(double_id, 1);
        main.emit(Opcode::Ret);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        let mut stepper = Stepper::new(program, "main", &[]).unwrap();

        // const, call
        stepper.step().unwrap();
        stepper.step().unwrap();
        assert_eq!(stepper.depth(), 2);
        assert_eq!(stepper.current_function(), Some("double"));
        assert_eq!(
            stepper.frames()[1].local(0),
            Some(&Value::I32(21))
        );

        let outcome = stepper.run_to_end().unwrap();
        assert_eq!(outcome, StepOutcome::Terminated);
        assert_eq!(stepper.result(), &Value::I32(42));
    }

    #[test]
    fn test_host_call_creates_no_frame() {
        let mut gen = Generator::new();
        let host_id = gen.define_string("host_add").unwrap();
        let mut main = FunctionBuilder::new("main", "int", vec![]);
        main.emit_const_i32(40);
        main.emit_const_i32(2);
        main.emit_call(host_id, 2);
        main.emit(Opcode::Ret);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        program
            .add_function(
                "host_add",
                Rc::new(|_: &Program, args: &mut Vec<Value>| {
                    // Arguments arrive in declaration order
                    let a = args[0].as_i32().unwrap();
                    let b = args[1].as_i32().unwrap();
                    Value::I32(a + b)
                }),
            )
            .unwrap();

        let mut stepper = Stepper::new(program, "main", &[]).unwrap();
        stepper.step().unwrap();
        stepper.step().unwrap();
        stepper.step().unwrap(); // the host call
        assert_eq!(stepper.depth(), 1);

        stepper.run_to_end().unwrap();
        assert_eq!(stepper.result(), &Value::I32(42));
    }

    #[test]
    fn test_branch_not_taken_and_taken() {
        // if (false) 111 else 222
        let mut gen = Generator::new();
        let mut main = FunctionBuilder::new("main", "int", vec![]);
        main.emit(Opcode::ConstFalse);
        let to_else = main.emit_jump(Opcode::JmpIfFalse);
        main.emit_const_i32(111);
        let to_end = main.emit_jump(Opcode::Jmp);
        main.patch_jump(to_else);
        main.emit_const_i32(222);
        main.patch_jump(to_end);
        main.emit(Opcode::Ret);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        let result = Stepper::call(program, "main", &[]).unwrap();
        assert_eq!(result, Value::I32(222));
    }

    #[test]
    fn test_abort_is_sticky_and_state_preserving() {
        let mut gen = Generator::new();
        let mut main = FunctionBuilder::new("main", "int", vec![]);
        let x = main.alloc_local().unwrap();
        main.emit_const_i32(7);
        main.emit_store_local(x);
        main.emit_const_i32(8);
        main.emit_store_local(x);
        main.emit_load_local(x);
        main.emit(Opcode::Ret);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        let mut stepper = Stepper::new(program, "main", &[]).unwrap();
        stepper.step().unwrap();
        stepper.step().unwrap();
        assert_eq!(stepper.frames()[0].local(0), Some(&Value::I32(7)));

        stepper.abort();
        assert_eq!(stepper.step().unwrap(), StepOutcome::Aborted);
        assert_eq!(stepper.step().unwrap(), StepOutcome::Aborted);
        // No further state change happened
        assert_eq!(stepper.frames()[0].local(0), Some(&Value::I32(7)));
        assert!(!stepper.is_terminated());
    }

    #[test]
    fn test_discard_opcode_aborts_and_calls_host() {
        struct Hooks {
            discarded: Cell<bool>,
        }

        let mut gen = Generator::new();
        let mut main = FunctionBuilder::new("main", "void", vec![]);
        main.emit(Opcode::Discard);
        main.emit(Opcode::RetVoid);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        let hooks = Rc::new(Hooks {
            discarded: Cell::new(false),
        });
        program.set_user_data(Some(hooks.clone()));
        program
            .add_function(
                "$$discard",
                Rc::new(|p: &Program, _: &mut Vec<Value>| {
                    if let Some(data) = p.user_data() {
                        if let Some(hooks) = data.downcast_ref::<Hooks>() {
                            hooks.discarded.set(true);
                        }
                    }
                    p.abort();
                    Value::Null
                }),
            )
            .unwrap();

        let mut stepper = Stepper::new(program.clone(), "main", &[]).unwrap();
        assert_eq!(stepper.step().unwrap(), StepOutcome::Aborted);
        assert!(hooks.discarded.get());
        assert!(program.is_aborted());
        assert!(stepper.is_aborted());
    }

    #[test]
    fn test_undefined_call_is_fatal() {
        let mut gen = Generator::new();
        let missing = gen.define_string("missing").unwrap();
        let mut main = FunctionBuilder::new("main", "void", vec![]);
        main.emit_call(missing, 0);
        main.emit(Opcode::RetVoid);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        let mut stepper = Stepper::new(program, "main", &[]).unwrap();
        assert!(matches!(
            stepper.step(),
            Err(VmError::UndefinedFunction(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_local_out_of_range_is_fatal() {
        let mut gen = Generator::new();
        let mut main = FunctionBuilder::new("main", "void", vec![]);
        main.emit_load_local(5);
        main.emit(Opcode::RetVoid);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        let mut stepper = Stepper::new(program, "main", &[]).unwrap();
        assert!(matches!(
            stepper.step(),
            Err(VmError::LocalOutOfRange { slot: 5, count: 0 })
        ));
    }

    #[test]
    fn test_argument_count_checked() {
        let mut gen = Generator::new();
        let f_id = gen.define_string("f").unwrap();
        let mut f = FunctionBuilder::new("f", "void", vec![Param::new("a", "int")]);
        f.emit(Opcode::RetVoid);
        gen.define_function(f).unwrap();

        let mut main = FunctionBuilder::new("main", "void", vec![]);
        main.emit_call(f_id, 0);
        main.emit(Opcode::RetVoid);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        let mut stepper = Stepper::new(program, "main", &[]).unwrap();
        assert!(matches!(
            stepper.step(),
            Err(VmError::ArgumentCount { expected: 1, got: 0, .. })
        ));
    }

    #[test]
    fn test_step_budget() {
        // while (true) {}
        let mut gen = Generator::new();
        let mut main = FunctionBuilder::new("main", "void", vec![]);
        let top = main.position();
        main.emit(Opcode::ConstTrue);
        main.emit(Opcode::Pop);
        main.emit_jump_back(Opcode::Jmp, top);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        let mut stepper = Stepper::new(program, "main", &[]).unwrap();
        stepper.set_step_limit(Some(100));
        assert!(matches!(
            stepper.run_to_end(),
            Err(VmError::StepBudgetExhausted)
        ));
    }

    #[test]
    fn test_globals_roundtrip() {
        let mut gen = Generator::new();
        let name = gen.define_string("uTime").unwrap();
        let mut main = FunctionBuilder::new("main", "float", vec![]);
        main.emit_load_global(name);
        main.emit_const_f32(2.0);
        main.emit(Opcode::Mul);
        main.emit_store_global(name);
        main.emit_load_global(name);
        main.emit(Opcode::Ret);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        program.set_global("uTime", Value::F32(1.5));
        let result = Stepper::call(program.clone(), "main", &[]).unwrap();
        assert_eq!(result, Value::F32(3.0));
        assert_eq!(program.get_global("uTime"), Some(Value::F32(3.0)));
    }

    #[test]
    fn test_structure_construction_and_props() {
        let mut gen = Generator::new();
        gen.define_structure(shade_bytecode::StructureDef {
            name: "Point".to_string(),
            fields: vec![Param::new("x", "float"), Param::new("y", "float")],
        })
        .unwrap();
        let point = gen.define_string("Point").unwrap();
        let x = gen.define_string("x").unwrap();
        let y = gen.define_string("y").unwrap();

        // p = Point(1.0, 2.0); p.x = 5.0; return p.x + p.y
        let mut main = FunctionBuilder::new("main", "float", vec![]);
        let p = main.alloc_local().unwrap();
        main.emit_const_f32(1.0);
        main.emit_const_f32(2.0);
        main.emit_new_object(point, 2);
        main.emit_store_local(p);
        main.emit_load_local(p);
        main.emit_const_f32(5.0);
        main.emit_set_prop(x);
        main.emit_store_local(p);
        main.emit_load_local(p);
        main.emit_get_prop(x);
        main.emit_load_local(p);
        main.emit_get_prop(y);
        main.emit(Opcode::Add);
        main.emit(Opcode::Ret);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        let result = Stepper::call(program, "main", &[]).unwrap();
        assert_eq!(result, Value::F32(7.0));
    }

    #[test]
    fn test_default_constructor_and_property_getter() {
        let mut gen = Generator::new();
        let vec2 = gen.define_string("vec2").unwrap();
        let yx = gen.define_string("yx").unwrap();

        let mut main = FunctionBuilder::new("main", "vec2", vec![]);
        main.emit_const_f32(1.0);
        main.emit_const_f32(2.0);
        main.emit_new_object(vec2, 2);
        main.emit_get_prop(yx);
        main.emit(Opcode::Ret);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        program.set_default_constructor(Some(Rc::new(|_: &Program, class: &str| {
            if class == "vec2" {
                Some(Value::Object(Object::with_props(
                    "vec2",
                    vec![("x".into(), Value::F32(0.0)), ("y".into(), Value::F32(0.0))],
                )))
            } else {
                None
            }
        })));
        // A toy swizzle getter: reversed components
        program.set_property_getter(Some(Rc::new(|_: &Program, obj: &Object, name: &str| {
            if name == "yx" {
                Some(Value::Object(Object::with_props(
                    obj.class.clone(),
                    vec![
                        ("x".into(), obj.get("y")?.clone()),
                        ("y".into(), obj.get("x")?.clone()),
                    ],
                )))
            } else {
                None
            }
        })));

        let result = Stepper::call(program, "main", &[]).unwrap();
        let obj = result.as_object().unwrap();
        assert_eq!(obj.get("x"), Some(&Value::F32(2.0)));
        assert_eq!(obj.get("y"), Some(&Value::F32(1.0)));
    }

    #[test]
    fn test_constructor_scalar_splat() {
        let mut gen = Generator::new();
        let vec3 = gen.define_string("vec3").unwrap();
        let mut main = FunctionBuilder::new("main", "vec3", vec![]);
        main.emit_const_f32(0.5);
        main.emit_new_object(vec3, 1);
        main.emit(Opcode::Ret);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        program.set_default_constructor(Some(Rc::new(|_: &Program, class: &str| {
            if class == "vec3" {
                Some(Value::Object(Object::with_props(
                    "vec3",
                    vec![
                        ("x".into(), Value::F32(0.0)),
                        ("y".into(), Value::F32(0.0)),
                        ("z".into(), Value::F32(0.0)),
                    ],
                )))
            } else {
                None
            }
        })));

        let result = Stepper::call(program, "main", &[]).unwrap();
        let obj = result.as_object().unwrap();
        assert_eq!(obj.get("x"), Some(&Value::F32(0.5)));
        assert_eq!(obj.get("z"), Some(&Value::F32(0.5)));
    }

    #[test]
    fn test_arrays() {
        // a = array(3); a[1] = 42; return a[1] + a.length
        let mut gen = Generator::new();
        let mut main = FunctionBuilder::new("main", "int", vec![]);
        let a = main.alloc_local().unwrap();
        main.emit_new_array(3);
        main.emit_store_local(a);
        main.emit_load_local(a);
        main.emit_const_i32(42);
        main.emit_const_i32(1);
        main.emit(Opcode::SetIndex);
        main.emit_store_local(a);
        main.emit_load_local(a);
        main.emit_const_i32(1);
        main.emit(Opcode::Index);
        main.emit_load_local(a);
        main.emit(Opcode::ArrayLen);
        main.emit(Opcode::Add);
        main.emit(Opcode::Ret);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        let result = Stepper::call(program, "main", &[]).unwrap();
        assert_eq!(result, Value::I32(45));
    }

    #[test]
    fn test_index_out_of_bounds() {
        let mut gen = Generator::new();
        let mut main = FunctionBuilder::new("main", "int", vec![]);
        main.emit_new_array(2);
        main.emit_const_i32(5);
        main.emit(Opcode::Index);
        main.emit(Opcode::Ret);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        let mut stepper = Stepper::new(program, "main", &[]).unwrap();
        stepper.step().unwrap();
        stepper.step().unwrap();
        assert!(matches!(
            stepper.step(),
            Err(VmError::IndexOutOfBounds { index: 5, len: 2 })
        ));
    }

    #[test]
    fn test_implicit_void_return() {
        let mut gen = Generator::new();
        let mut main = FunctionBuilder::new("main", "void", vec![]);
        main.emit(Opcode::ConstTrue);
        main.emit(Opcode::Pop);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        let mut stepper = Stepper::new(program, "main", &[]).unwrap();
        stepper.step().unwrap();
        stepper.step().unwrap();
        assert_eq!(stepper.step().unwrap(), StepOutcome::Terminated);
        assert_eq!(stepper.result(), &Value::Null);
    }

    #[test]
    fn test_entry_args_bound_left_to_right() {
        let mut gen = Generator::new();
        let mut f = FunctionBuilder::new(
            "blend",
            "float",
            vec![Param::new("a", "float"), Param::new("b", "float")],
        );
        f.emit_load_local(0);
        f.emit_load_local(1);
        f.emit(Opcode::Sub);
        f.emit(Opcode::Ret);
        gen.define_function(f).unwrap();

        let program = instantiate(&mut gen);
        let result =
            Stepper::call(program, "blend", &[Value::F32(5.0), Value::F32(2.0)]).unwrap();
        assert_eq!(result, Value::F32(3.0));
    }

    #[test]
    fn test_skip_markers_lands_on_line_boundary() {
        let mut gen = Generator::new();
        let mut main = FunctionBuilder::new("main", "void", vec![]);
        main.mark_line(3);
        main.emit(Opcode::ConstTrue);
        main.emit(Opcode::Pop);
        main.emit(Opcode::RetVoid);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        let mut stepper = Stepper::new(program.clone(), "main", &[]).unwrap();

        // Markers consumed, nothing observable executed yet
        stepper.skip_markers().unwrap();
        assert_eq!(program.current_line(), 3);
        assert_eq!(stepper.steps(), 0);

        // Idempotent at a boundary
        stepper.skip_markers().unwrap();
        assert_eq!(stepper.steps(), 0);

        assert_eq!(stepper.step().unwrap(), StepOutcome::Paused);
        assert_eq!(stepper.steps(), 1);
    }

    #[test]
    fn test_return_restores_caller_line() {
        let mut gen = Generator::new();
        let helper_id = gen.define_string("helper").unwrap();

        let mut helper = FunctionBuilder::new("helper", "float", vec![]);
        helper.mark_line(2);
        helper.emit_const_f32(1.0);
        helper.emit(Opcode::Ret);
        gen.define_function(helper).unwrap();

        let mut main = FunctionBuilder::new("main", "void", vec![]);
        main.mark_line(5);
        main.emit_call(helper_id, 0);
        main.emit(Opcode::Pop);
        main.emit(Opcode::RetVoid);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        let mut stepper = Stepper::new(program.clone(), "main", &[]).unwrap();

        stepper.step().unwrap(); // call
        stepper.step().unwrap(); // const inside helper
        assert_eq!(program.current_line(), 2);

        stepper.step().unwrap(); // return
        assert_eq!(stepper.depth(), 1);
        assert_eq!(program.current_line(), 5);
    }

    #[test]
    fn test_jump_to_line() {
        let mut gen = Generator::new();
        let mut main = FunctionBuilder::new("main", "int", vec![]);
        let x = main.alloc_local().unwrap();
        main.mark_line(1);
        main.emit_const_i32(1);
        main.emit_store_local(x);
        main.mark_line(2);
        main.emit_const_i32(2);
        main.emit_store_local(x);
        main.mark_line(3);
        main.emit_load_local(x);
        main.emit(Opcode::Ret);
        gen.define_function(main).unwrap();

        let program = instantiate(&mut gen);
        let mut stepper = Stepper::new(program, "main", &[]).unwrap();
        // Skip line 2's store entirely
        stepper.step().unwrap(); // const 1
        stepper.step().unwrap(); // store
        stepper.jump_to_line(3).unwrap();
        stepper.run_to_end().unwrap();
        assert_eq!(stepper.result(), &Value::I32(1));

        let mut stepper = Stepper::new(
            Program::instantiate(gen.finalize()).unwrap(),
            "main",
            &[],
        )
        .unwrap();
        assert!(stepper.jump_to_line(99).is_err());
    }
}
