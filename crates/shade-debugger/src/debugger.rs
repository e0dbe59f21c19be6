//! The debugger controller
//!
//! [`Debugger`] couples a compiler front-end pair (normal + immediate) with
//! an instantiated program and its stepper: source install, source-line
//! stepping, breakpoints, state injection and inspection, the discard
//! protocol, and immediate-mode evaluation against paused state.

use crate::breakpoint::Breakpoint;
use crate::common;
use crate::texture::Texture;
use crate::{DebugError, DebugHooks};
use nalgebra_glm as glm;
use rustc_hash::FxHashMap;
use shade_bytecode::Image;
use shade_compiler::{Frontend, Stage, Variable, IMMEDIATE_FUNCTION, IMMEDIATE_RESULT};
use shade_vm::{Frame, Library, Program, StepOutcome, Stepper, Value, VmError};
use std::any::Any;
use std::rc::Rc;

/// Step budget for immediate evaluations and breakpoint conditions, so a
/// runaway expression cannot hang the session
const IMMEDIATE_STEP_LIMIT: u64 = 1_000_000;

/// Why a stepping command returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugStop {
    /// Landed on a new source line
    Paused,
    /// A breakpoint fired
    Breakpoint,
    /// The program ran to completion
    Terminated,
    /// The program was discarded/aborted
    Discarded,
}

enum StepMode {
    Into,
    Over,
    Out,
    Continue,
}

/// User-facing shader debugger
pub struct Debugger {
    compiler: Option<Box<dyn Frontend>>,
    imm_compiler: Option<Box<dyn Frontend>>,
    stage: Stage,
    entry: String,
    args: Vec<Value>,
    program: Option<Rc<Program>>,
    stepper: Option<Stepper>,
    breakpoints: Vec<Breakpoint>,
    semantics: FxHashMap<String, Value>,
    hooks: Rc<DebugHooks>,
    last_error: String,
}

impl Debugger {
    /// Create an empty debugger; install a shader with
    /// [`set_source`](Self::set_source).
    pub fn new() -> Self {
        Self {
            compiler: None,
            imm_compiler: None,
            stage: Stage::Fragment,
            entry: String::new(),
            args: Vec::new(),
            program: None,
            stepper: None,
            breakpoints: Vec::new(),
            semantics: FxHashMap::default(),
            hooks: Rc::new(DebugHooks::default()),
            last_error: String::new(),
        }
    }

    // ===== Source install =====

    /// Replace all prior state with a freshly compiled shader.
    ///
    /// Creates a normal and an immediate front-end of type `F`, parses,
    /// instantiates the program with the built-in library and the
    /// front-end's extensions, links the optional caller library, and
    /// positions a stepper before the first instruction of `entry`.
    pub fn set_source<F: Frontend + 'static>(
        &mut self,
        stage: Stage,
        source: &str,
        entry: &str,
        args: &[Value],
        library: Option<&Library>,
    ) -> Result<(), DebugError> {
        self.clear_session();

        let mut compiler = F::new();
        compiler.set_immediate(false);
        let mut imm_compiler = F::new();
        imm_compiler.set_immediate(true);

        self.stage = stage;
        self.entry = entry.to_string();
        self.args = args.to_vec();

        compiler
            .parse(stage, source, entry)
            .map_err(|e| self.fail(e))?;
        let image = compiler
            .image()
            .cloned()
            .ok_or_else(|| self.fail(shade_compiler::CompileError::EntryNotFound(entry.into())))?;

        let program = Program::instantiate(image).map_err(|e| self.fail(e))?;
        program.set_user_data(Some(self.hooks.clone() as Rc<dyn Any>));
        program
            .add_library(&common::common_library())
            .map_err(|e| self.fail(e))?;
        program.set_property_getter(compiler.property_getter());
        program.set_default_constructor(compiler.default_constructor());
        if let Some(library) = library {
            program.add_library(library).map_err(|e| self.fail(e))?;
        }

        for var in &compiler.symbols().globals {
            program.add_global(&var.name);
        }

        if program.function_def(entry).is_none() {
            return Err(self.fail(shade_compiler::CompileError::EntryNotFound(entry.into())));
        }

        let stepper = Stepper::new(program.clone(), entry, args).map_err(|e| self.fail(e))?;

        log::debug!("installed {:?} shader, entry `{}`", stage, entry);
        self.compiler = Some(Box::new(compiler));
        self.imm_compiler = Some(Box::new(imm_compiler));
        self.program = Some(program);
        self.stepper = Some(stepper);
        Ok(())
    }

    fn clear_session(&mut self) {
        self.compiler = None;
        self.imm_compiler = None;
        self.program = None;
        self.stepper = None;
        self.breakpoints.clear();
        self.last_error.clear();
        self.hooks.discarded.set(false);
    }

    fn fail(&mut self, err: impl Into<DebugError>) -> DebugError {
        let err = err.into();
        self.last_error = err.to_string();
        err
    }

    /// Diagnostic of the most recent failure
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// The normal-mode compiler of the installed source
    pub fn compiler(&self) -> Option<&dyn Frontend> {
        self.compiler.as_deref()
    }

    /// Mutable access to the normal-mode compiler (macro table etc.)
    pub fn compiler_mut(&mut self) -> Option<&mut (dyn Frontend + 'static)> {
        self.compiler.as_deref_mut()
    }

    /// The instantiated program
    pub fn program(&self) -> Option<&Rc<Program>> {
        self.program.as_ref()
    }

    // ===== Execution =====

    /// Run the entry function to termination or discard, returning a deep
    /// copy of its result.
    pub fn execute(&mut self) -> Result<Value, DebugError> {
        let entry = self.entry.clone();
        let args = self.args.clone();
        self.execute_fn(&entry, &args)
    }

    /// Run an arbitrary function to termination or discard.
    ///
    /// Starts a fresh run: the abort and discard flags are cleared and
    /// semantic values are applied to globals first.
    pub fn execute_fn(&mut self, name: &str, args: &[Value]) -> Result<Value, DebugError> {
        let program = self.program.clone().ok_or(DebugError::NoProgram)?;

        program.clear_abort();
        self.hooks.discarded.set(false);
        self.apply_semantics(&program);

        let stepper = Stepper::new(program, name, args).map_err(|e| self.fail(e))?;
        self.stepper = Some(stepper);

        let result = self.stepper.as_mut().unwrap().run_to_end();
        match result {
            Ok(_) => Ok(self.get_return_value()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Replace the argument stack used by [`execute`](Self::execute) and the
    /// next installed stepper
    pub fn set_arguments(&mut self, args: &[Value]) {
        self.args = args.to_vec();
    }

    fn apply_semantics(&self, program: &Rc<Program>) {
        let symbols = self.compiler.as_ref().map(|c| c.symbols());
        for (name, value) in &self.semantics {
            // Prefer a global declared with this semantic (HLSL), fall back
            // to a plain name match.
            let target = symbols
                .and_then(|s| {
                    s.globals
                        .iter()
                        .find(|v| v.semantic.as_deref() == Some(name.as_str()))
                })
                .map(|v| v.name.clone())
                .unwrap_or_else(|| name.clone());
            program.set_global(&target, value.clone());
        }
    }

    // ===== Stepping =====

    /// Advance to the next source line (stepping into calls).
    pub fn step(&mut self) -> Result<DebugStop, DebugError> {
        self.drive(StepMode::Into)
    }

    /// Advance to the next source line without descending into calls made
    /// on the current line.
    pub fn step_over(&mut self) -> Result<DebugStop, DebugError> {
        self.drive(StepMode::Over)
    }

    /// Run until the current function returns to its caller.
    pub fn step_out(&mut self) -> Result<DebugStop, DebugError> {
        self.drive(StepMode::Out)
    }

    /// Run until a breakpoint fires, the program terminates, or it is
    /// discarded.
    pub fn continue_(&mut self) -> Result<DebugStop, DebugError> {
        self.drive(StepMode::Continue)
    }

    fn drive(&mut self, mode: StepMode) -> Result<DebugStop, DebugError> {
        let mut stepper = self.stepper.take().ok_or(DebugError::NoProgram)?;
        let result = self.drive_inner(&mut stepper, mode);
        self.stepper = Some(stepper);
        result.map_err(|e| self.fail(e))
    }

    /// Stepping commands land on line boundaries: markers are consumed so
    /// `current_line` names the line about to run, but none of its
    /// observable instructions have executed yet.
    fn drive_inner(
        &mut self,
        stepper: &mut Stepper,
        mode: StepMode,
    ) -> Result<DebugStop, DebugError> {
        let program = stepper.program().clone();
        let start_line = program.current_line();
        let start_depth = stepper.depth();
        let mut last_line = start_line;

        loop {
            if stepper.is_aborted() || program.is_aborted() {
                return Ok(DebugStop::Discarded);
            }

            stepper.skip_markers().map_err(DebugError::Runtime)?;
            let line = program.current_line();

            // Breakpoints are consulted on every line entry, whatever the
            // stepping mode.
            if line != last_line {
                last_line = line;
                if self.breakpoint_fires(&program, stepper, line) {
                    return Ok(DebugStop::Breakpoint);
                }
            }

            let stop = match mode {
                StepMode::Into => line != start_line,
                StepMode::Over => line != start_line && stepper.depth() <= start_depth,
                StepMode::Out => stepper.depth() < start_depth,
                StepMode::Continue => false,
            };
            if stop {
                return Ok(DebugStop::Paused);
            }

            match stepper.step().map_err(DebugError::Runtime)? {
                StepOutcome::Terminated => return Ok(DebugStop::Terminated),
                StepOutcome::Aborted => return Ok(DebugStop::Discarded),
                StepOutcome::Paused => {}
            }
        }
    }

    /// Relocate the PC to the first instruction at source line `>= line`
    /// within the current function.
    pub fn jump(&mut self, line: u32) -> Result<(), DebugError> {
        let stepper = self.stepper.as_mut().ok_or(DebugError::NoProgram)?;
        stepper.jump_to_line(line).map_err(DebugError::Runtime)
    }

    // ===== Breakpoints =====

    /// Install an unconditional breakpoint; duplicates replace.
    pub fn add_breakpoint(&mut self, line: u32) {
        self.clear_breakpoint(line);
        self.breakpoints.push(Breakpoint::at(line));
    }

    /// Install a conditional breakpoint. The condition is compiled through
    /// the immediate front-end now; compile failures surface immediately.
    pub fn add_conditional_breakpoint(
        &mut self,
        line: u32,
        condition: &str,
    ) -> Result<(), DebugError> {
        let image = self.compile_condition(condition)?;
        self.clear_breakpoint(line);
        self.breakpoints
            .push(Breakpoint::conditional(line, condition, image));
        Ok(())
    }

    /// Whether a breakpoint is installed at `line`
    pub fn has_breakpoint(&self, line: u32) -> bool {
        self.breakpoints.iter().any(|b| b.line == line)
    }

    /// Remove the breakpoint at `line`
    pub fn clear_breakpoint(&mut self, line: u32) {
        self.breakpoints.retain(|b| b.line != line);
    }

    /// Remove every breakpoint
    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    fn compile_condition(&mut self, condition: &str) -> Result<Image, DebugError> {
        let compiler = self.compiler.as_ref().ok_or(DebugError::NoProgram)?;
        let symbols = compiler.symbols();

        // The paused frame is unknown at insertion time; prime with every
        // function's locals so the condition can name any of them.
        let mut primed: Vec<Variable> = symbols.globals.clone();
        for f in &symbols.functions {
            for local in symbols.locals(&f.name) {
                primed.push(Variable::global(local.name.clone(), local.ty.clone()));
            }
        }

        let imm = self.imm_compiler.as_mut().ok_or(DebugError::NoProgram)?;
        imm.clear_immediate();
        for var in primed {
            imm.add_immediate_global(var);
        }
        imm.parse(self.stage, condition, &self.entry)
            .map_err(DebugError::Compile)?;
        imm.image()
            .cloned()
            .ok_or_else(|| DebugError::Immediate("condition produced no bytecode".into()))
    }

    fn breakpoint_fires(&self, program: &Rc<Program>, stepper: &Stepper, line: i32) -> bool {
        if line < 0 {
            return false;
        }
        let Some(bp) = self.breakpoints.iter().find(|b| b.line == line as u32) else {
            return false;
        };
        match &bp.condition {
            None => true,
            Some(image) => {
                // Evaluation failures count as "condition is false"
                match self.run_spliced(program, stepper.current_frame(), image.clone()) {
                    Ok(value) => value.is_truthy(),
                    Err(e) => {
                        log::debug!("breakpoint condition at line {line} failed: {e}");
                        false
                    }
                }
            }
        }
    }

    // ===== Immediate mode =====

    /// Compile and evaluate an expression against the paused program state.
    ///
    /// The main program is left untouched: the synthesized function is
    /// spliced in as an overlay, run on an isolated stepper, and rolled back
    /// together with any mirrored locals.
    pub fn immediate(&mut self, command: &str) -> Result<Value, DebugError> {
        let program = self.program.clone().ok_or(DebugError::NoProgram)?;

        let compiler = self.compiler.as_ref().ok_or(DebugError::NoProgram)?;
        let symbols = compiler.symbols();
        let mut primed: Vec<Variable> = symbols.globals.clone();
        if let Some(frame) = self.stepper.as_ref().and_then(Stepper::current_frame) {
            for local in symbols.locals(frame.name()) {
                primed.push(Variable::global(local.name.clone(), local.ty.clone()));
            }
        }

        let imm = self.imm_compiler.as_mut().ok_or(DebugError::NoProgram)?;
        imm.clear_immediate();
        for var in primed {
            imm.add_immediate_global(var);
        }
        imm.parse(self.stage, command, &self.entry)
            .map_err(|e| DebugError::Immediate(e.to_string()))?;
        let image = imm
            .image()
            .cloned()
            .ok_or_else(|| DebugError::Immediate("expression produced no bytecode".into()))?;

        let frame = self.stepper.as_ref().and_then(Stepper::current_frame);
        self.run_spliced(&program, frame, image)
    }

    /// Splice an immediate image into the live program, run it to
    /// completion with the paused frame's locals mirrored as globals, and
    /// roll everything back.
    fn run_spliced(
        &self,
        program: &Rc<Program>,
        frame: Option<&Frame>,
        image: Image,
    ) -> Result<Value, DebugError> {
        let mut saved: Vec<(String, Option<Value>)> = Vec::new();
        if let Some(frame) = frame {
            if let Some(compiler) = self.compiler.as_ref() {
                for local in compiler.symbols().locals(frame.name()) {
                    let previous = program.get_global(&local.name);
                    let value = frame
                        .local(local.slot as usize)
                        .cloned()
                        .unwrap_or(Value::Null);
                    program.set_global(&local.name, value);
                    saved.push((local.name.clone(), previous));
                }
            }
        }
        let saved_result = program.get_global(IMMEDIATE_RESULT);

        program.splice(image);
        let outcome = (|| {
            let mut stepper = Stepper::new(program.clone(), IMMEDIATE_FUNCTION, &[])?;
            stepper.set_step_limit(Some(IMMEDIATE_STEP_LIMIT));
            stepper.run_to_end()?;
            Ok::<Value, VmError>(program.get_global(IMMEDIATE_RESULT).unwrap_or(Value::Null))
        })();
        program.unsplice();

        // Roll back mirrored locals and the sentinel, newest first
        match saved_result {
            Some(v) => program.set_global(IMMEDIATE_RESULT, v),
            None => {
                program.remove_global(IMMEDIATE_RESULT);
            }
        }
        for (name, previous) in saved.into_iter().rev() {
            match previous {
                Some(v) => program.set_global(&name, v),
                None => {
                    program.remove_global(&name);
                }
            }
        }

        outcome.map_err(|e| DebugError::Immediate(e.to_string()))
    }

    // ===== Inspection =====

    /// Source line of the most recently executed line marker
    pub fn current_line(&self) -> i32 {
        self.program.as_ref().map(|p| p.current_line()).unwrap_or(0)
    }

    /// Name of the function the innermost frame executes
    pub fn current_function(&self) -> Option<String> {
        self.stepper
            .as_ref()
            .and_then(|s| s.current_function())
            .map(str::to_string)
    }

    /// Function names on the call stack, outermost first
    pub fn function_stack(&self) -> Vec<String> {
        self.stepper
            .as_ref()
            .map(|s| s.frames().iter().map(|f| f.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Current frame depth
    pub fn frame_depth(&self) -> usize {
        self.stepper.as_ref().map(Stepper::depth).unwrap_or(0)
    }

    /// Names of the current function's locals, in slot order
    pub fn current_function_locals(&self) -> Vec<String> {
        let Some(func) = self.current_function() else {
            return Vec::new();
        };
        self.compiler
            .as_ref()
            .map(|c| {
                c.symbols()
                    .locals(&func)
                    .iter()
                    .map(|l| l.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Read a local of the paused frame by name (deep copy)
    pub fn get_local_value(&self, name: &str) -> Option<Value> {
        let stepper = self.stepper.as_ref()?;
        let frame = stepper.current_frame()?;
        let slot = self
            .compiler
            .as_ref()?
            .symbols()
            .local_slot(frame.name(), name)?;
        frame.local(slot as usize).cloned()
    }

    /// Read a global by name (deep copy)
    pub fn get_global_value(&self, name: &str) -> Option<Value> {
        self.program.as_ref()?.get_global(name)
    }

    /// Deep copy of the top-level return value of the last run
    pub fn get_return_value(&self) -> Value {
        self.stepper
            .as_ref()
            .map(|s| s.result().clone())
            .unwrap_or(Value::Null)
    }

    // ===== State injection =====

    /// Reserve a global slot by name
    pub fn add_global(&mut self, name: &str) -> Result<(), DebugError> {
        self.program
            .as_ref()
            .ok_or(DebugError::NoProgram)?
            .add_global(name);
        Ok(())
    }

    /// Write a raw value into a named global slot
    pub fn set_global_value(&mut self, name: &str, value: Value) -> Result<(), DebugError> {
        self.program
            .as_ref()
            .ok_or(DebugError::NoProgram)?
            .set_global(name, value);
        Ok(())
    }

    /// Write a float into a named global slot
    pub fn set_global_f32(&mut self, name: &str, value: f32) -> Result<(), DebugError> {
        self.set_global_value(name, Value::F32(value))
    }

    /// Build a vector object of the given class type and write it into a
    /// global. The class name is caller-supplied so GLSL `vec3` and HLSL
    /// `float3` both work.
    pub fn set_global_vector(
        &mut self,
        name: &str,
        class_type: &str,
        components: &[f32],
    ) -> Result<(), DebugError> {
        let mut value = self.construct(class_type)?;
        if let Value::Object(o) = &mut value {
            for (slot, c) in o.props_mut().iter_mut().zip(components) {
                slot.1 = Value::F32(*c);
            }
        }
        self.set_global_value(name, value)
    }

    /// Write a vec4 into a global under the given class type
    pub fn set_global_vec4(
        &mut self,
        name: &str,
        class_type: &str,
        value: glm::Vec4,
    ) -> Result<(), DebugError> {
        self.set_global_vector(name, class_type, &[value.x, value.y, value.z, value.w])
    }

    /// Write a mat4 into a global under the given class type
    pub fn set_global_mat4(
        &mut self,
        name: &str,
        class_type: &str,
        value: glm::Mat4,
    ) -> Result<(), DebugError> {
        let mut object = self.construct(class_type)?;
        if let Value::Object(o) = &mut object {
            for (j, (_, column)) in o.props_mut().iter_mut().enumerate() {
                if let Value::Object(col) = column {
                    for (i, (_, slot)) in col.props_mut().iter_mut().enumerate() {
                        *slot = Value::F32(value[(i, j)]);
                    }
                }
            }
        }
        self.set_global_value(name, object)
    }

    /// Wrap a borrowed texture into a sampler object and write it into a
    /// global. The caller keeps the texture alive through the `Rc`.
    pub fn set_global_texture(
        &mut self,
        name: &str,
        class_type: &str,
        texture: Rc<Texture>,
    ) -> Result<(), DebugError> {
        let mut value = self.construct(class_type)?;
        if let Value::Object(o) = &mut value {
            o.user = Some(texture as Rc<dyn Any>);
        }
        self.set_global_value(name, value)
    }

    /// Construct an object of a class type through the program's extension
    fn construct(&self, class_type: &str) -> Result<Value, DebugError> {
        let program = self.program.as_ref().ok_or(DebugError::NoProgram)?;
        let ctor = program
            .default_constructor()
            .ok_or_else(|| DebugError::Runtime(VmError::UnknownType(class_type.to_string())))?;
        ctor(program, class_type)
            .ok_or_else(|| DebugError::Runtime(VmError::UnknownType(class_type.to_string())))
    }

    // ===== Semantics =====

    /// Stage a named side-channel value, applied to globals before each
    /// execute (matched by declared semantic, then by name)
    pub fn set_semantic_value(&mut self, name: &str, value: Value) {
        self.semantics.insert(name.to_string(), value);
    }

    /// Read back a staged semantic value
    pub fn get_semantic_value(&self, name: &str) -> Option<&Value> {
        self.semantics.get(name)
    }

    // ===== Discard =====

    /// Set or clear the discard flag; setting it aborts the stepper and
    /// program, the same path the `$$discard` host call takes.
    pub fn set_discarded(&mut self, discarded: bool) {
        self.hooks.discarded.set(discarded);
        if discarded {
            if let Some(stepper) = self.stepper.as_mut() {
                stepper.abort();
            }
            if let Some(program) = self.program.as_ref() {
                program.abort();
            }
        }
    }

    /// Whether the program was discarded
    pub fn is_discarded(&self) -> bool {
        self.hooks.discarded.get()
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shade_compiler::GlslFrontend;

    #[test]
    fn test_set_source_failure_keeps_diagnostic() {
        let mut dbg = Debugger::new();
        let err = dbg.set_source::<GlslFrontend>(Stage::Fragment, "void main( {", "main", &[], None);
        assert!(err.is_err());
        assert!(!dbg.last_error().is_empty());
        assert!(dbg.program().is_none());
    }

    #[test]
    fn test_entry_lookup_failure() {
        let mut dbg = Debugger::new();
        let err = dbg.set_source::<GlslFrontend>(
            Stage::Fragment,
            "void main() { }",
            "missing_entry",
            &[],
            None,
        );
        assert!(err.is_err());
        assert!(dbg.last_error().contains("missing_entry"));
    }

    #[test]
    fn test_stepping_without_source() {
        let mut dbg = Debugger::new();
        assert!(matches!(dbg.step(), Err(DebugError::NoProgram)));
        assert!(matches!(dbg.execute(), Err(DebugError::NoProgram)));
    }

    #[test]
    fn test_breakpoint_management() {
        let mut dbg = Debugger::new();
        dbg.add_breakpoint(4);
        dbg.add_breakpoint(4);
        dbg.add_breakpoint(7);
        assert!(dbg.has_breakpoint(4));
        assert!(dbg.has_breakpoint(7));

        dbg.clear_breakpoint(4);
        assert!(!dbg.has_breakpoint(4));

        dbg.clear_breakpoints();
        assert!(!dbg.has_breakpoint(7));
    }

    #[test]
    fn test_semantics_staged_and_read_back() {
        let mut dbg = Debugger::new();
        dbg.set_semantic_value("COLOR0", Value::F32(0.5));
        assert_eq!(dbg.get_semantic_value("COLOR0"), Some(&Value::F32(0.5)));
        assert_eq!(dbg.get_semantic_value("COLOR1"), None);
    }
}
