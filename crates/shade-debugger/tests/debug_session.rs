//! End-to-end debugging sessions over real GLSL/HLSL sources

use nalgebra_glm as glm;
use shade_compiler::{GlslFrontend, HlslFrontend};
use shade_debugger::{DebugError, DebugStop, Debugger, Stage, Texture, Value};
use std::rc::Rc;

fn glsl(source: &str) -> Debugger {
    let mut dbg = Debugger::new();
    dbg.set_source::<GlslFrontend>(Stage::Fragment, source, "main", &[], None)
        .unwrap();
    dbg
}

fn component(dbg: &Debugger, global: &str, name: &str) -> f32 {
    match dbg.get_global_value(global) {
        Some(Value::Object(o)) => match o.get(name) {
            Some(Value::F32(f)) => *f,
            other => panic!("component {name} is {other:?}"),
        },
        other => panic!("global {global} is {other:?}"),
    }
}

// Scenario: identity fragment shader
#[test]
fn test_identity_fragment() {
    let mut dbg = glsl("void main(){ gl_FragColor = vec4(1.0,0.5,0.0,1.0); }");
    dbg.execute().unwrap();

    let color = dbg.get_global_value("gl_FragColor").unwrap();
    let obj = color.as_object().unwrap();
    assert_eq!(obj.class, "vec4");

    let expected = [1.0, 0.5, 0.0, 1.0];
    for (name, want) in ["x", "y", "z", "w"].iter().zip(expected) {
        assert!((component(&dbg, "gl_FragColor", name) - want).abs() < 1e-6);
    }
}

const STEP_SOURCE: &str = "float helper() {
  return 2.0;
}
void main() {
  float x = helper();
  x = x + 1.0;
}";

// Scenario: step-over of a call
#[test]
fn test_step_over_call() {
    let mut dbg = glsl(STEP_SOURCE);

    assert_eq!(dbg.step().unwrap(), DebugStop::Paused);
    assert_eq!(dbg.current_line(), 5);
    let depth = dbg.frame_depth();

    assert_eq!(dbg.step_over().unwrap(), DebugStop::Paused);
    assert_eq!(dbg.current_line(), 6);
    assert_eq!(dbg.frame_depth(), depth);
}

#[test]
fn test_step_into_and_out() {
    let mut dbg = glsl(STEP_SOURCE);

    dbg.step().unwrap(); // line 5
    assert_eq!(dbg.step().unwrap(), DebugStop::Paused);
    assert_eq!(dbg.current_line(), 2);
    assert_eq!(dbg.frame_depth(), 2);
    assert_eq!(dbg.current_function().as_deref(), Some("helper"));
    assert_eq!(dbg.function_stack(), vec!["main", "helper"]);

    assert_eq!(dbg.step_out().unwrap(), DebugStop::Paused);
    assert_eq!(dbg.frame_depth(), 1);
    assert_eq!(dbg.current_function().as_deref(), Some("main"));
    assert_eq!(dbg.current_line(), 5);
}

const LOOP_SOURCE: &str = "void main() {
  float s = 0.0;
  for (int i = 0; i < 6; i++) {
    s += float(i);
  }
}";

// Scenario: conditional breakpoint inside a loop
#[test]
fn test_conditional_breakpoint() {
    let mut dbg = glsl(LOOP_SOURCE);
    dbg.add_conditional_breakpoint(4, "i == 3").unwrap();
    assert!(dbg.has_breakpoint(4));

    assert_eq!(dbg.continue_().unwrap(), DebugStop::Breakpoint);
    assert_eq!(dbg.current_line(), 4);
    assert_eq!(dbg.get_local_value("i"), Some(Value::I32(3)));

    // The condition only holds once; the next continue runs to completion
    assert_eq!(dbg.continue_().unwrap(), DebugStop::Terminated);
}

#[test]
fn test_plain_breakpoint_once_per_iteration() {
    let mut dbg = glsl(LOOP_SOURCE);
    dbg.add_breakpoint(4);

    let mut hits = Vec::new();
    loop {
        match dbg.continue_().unwrap() {
            DebugStop::Breakpoint => {
                hits.push(dbg.get_local_value("i").unwrap());
            }
            DebugStop::Terminated => break,
            other => panic!("unexpected stop: {other:?}"),
        }
    }
    assert_eq!(
        hits,
        vec![
            Value::I32(0),
            Value::I32(1),
            Value::I32(2),
            Value::I32(3),
            Value::I32(4),
            Value::I32(5)
        ]
    );
}

#[test]
fn test_breakpoint_condition_error_means_false() {
    let mut dbg = glsl(LOOP_SOURCE);
    // `s + true_object` style failures cannot happen here, but an unknown
    // name fails at insertion; a runtime failure (null arithmetic) must act
    // as "condition is false".
    assert!(matches!(
        dbg.add_conditional_breakpoint(4, "no_such_var == 1"),
        Err(DebugError::Compile(_))
    ));

    dbg.add_conditional_breakpoint(4, "gl_FragCoord.x > 0.5")
        .unwrap();
    // gl_FragCoord was never injected, so the condition errors every time
    assert_eq!(dbg.continue_().unwrap(), DebugStop::Terminated);
}

const DISCARD_SOURCE: &str = "uniform float uKill;
void main() {
  gl_FragColor = vec4(1.0);
  if (uKill > 0.5) {
    discard;
  }
  gl_FragColor = vec4(0.0);
}";

// Scenario: discard driven by a uniform
#[test]
fn test_discard() {
    let mut dbg = glsl(DISCARD_SOURCE);
    dbg.set_global_f32("uKill", 1.0).unwrap();

    dbg.execute().unwrap();
    assert!(dbg.is_discarded());
    assert_eq!(dbg.current_line(), 5);
    // The write on line 7 never happened
    assert_eq!(component(&dbg, "gl_FragColor", "x"), 1.0);
}

#[test]
fn test_execute_after_discard_recovers() {
    let mut dbg = glsl(DISCARD_SOURCE);
    dbg.set_global_f32("uKill", 1.0).unwrap();
    dbg.execute().unwrap();
    assert!(dbg.is_discarded());

    dbg.set_global_f32("uKill", 0.0).unwrap();
    dbg.execute().unwrap();
    assert!(!dbg.is_discarded());
    assert_eq!(component(&dbg, "gl_FragColor", "x"), 0.0);
}

#[test]
fn test_set_discarded_is_sticky() {
    let mut dbg = glsl(LOOP_SOURCE);
    dbg.step().unwrap();
    let line = dbg.current_line();
    let s = dbg.get_local_value("s");

    dbg.set_discarded(true);
    assert!(dbg.is_discarded());
    assert_eq!(dbg.step().unwrap(), DebugStop::Discarded);
    assert_eq!(dbg.continue_().unwrap(), DebugStop::Discarded);
    // State is untouched
    assert_eq!(dbg.current_line(), line);
    assert_eq!(dbg.get_local_value("s"), s);
}

const IMMEDIATE_SOURCE: &str = "void main() {
  int x = 2;
  gl_FragColor = vec4(float(x));
}";

// Scenario: immediate evaluation against paused state
#[test]
fn test_immediate_after_pause() {
    let mut dbg = glsl(IMMEDIATE_SOURCE);
    dbg.step().unwrap(); // line 2
    dbg.step().unwrap(); // line 3, x is live
    assert_eq!(dbg.get_local_value("x"), Some(Value::I32(2)));

    let result = dbg.immediate("x*x + 1").unwrap();
    assert_eq!(result, Value::I32(5));

    // Resuming produces the same result as a run without the immediate
    assert_eq!(dbg.continue_().unwrap(), DebugStop::Terminated);
    let with_immediate = component(&dbg, "gl_FragColor", "x");

    let mut plain = glsl(IMMEDIATE_SOURCE);
    plain.execute().unwrap();
    assert_eq!(with_immediate, component(&plain, "gl_FragColor", "x"));
    assert_eq!(with_immediate, 2.0);
}

#[test]
fn test_immediate_reads_globals_and_uniforms() {
    let mut dbg = glsl("uniform float uGain;\nvoid main() { gl_FragColor = vec4(uGain); }");
    dbg.set_global_f32("uGain", 1.5).unwrap();
    dbg.execute().unwrap();

    assert_eq!(dbg.immediate("uGain * 2.0").unwrap(), Value::F32(3.0));
    assert_eq!(
        dbg.immediate("gl_FragColor.x + 0.5").unwrap(),
        Value::F32(2.0)
    );
}

#[test]
fn test_immediate_errors_are_contained() {
    let mut dbg = glsl(IMMEDIATE_SOURCE);
    dbg.step().unwrap();

    assert!(matches!(
        dbg.immediate("no_such_name + 1"),
        Err(DebugError::Immediate(_))
    ));
    assert!(matches!(
        dbg.immediate("x = 5"),
        Err(DebugError::Immediate(_))
    ));

    // The session is still usable and unchanged
    assert_eq!(dbg.continue_().unwrap(), DebugStop::Terminated);
    assert_eq!(component(&dbg, "gl_FragColor", "x"), 2.0);
    assert!(dbg.get_global_value("$$imm_result").is_none());
}

// Scenario: texture sampling through the host library
#[test]
fn test_texture_sample_fallback() {
    let mut texture = Texture::new();
    assert!(texture.allocate(2, 2, 1));
    texture.fill(glm::vec4(1.0, 0.0, 0.0, 1.0));
    let texture = Rc::new(texture);

    let mut dbg = glsl(
        "uniform sampler2D uTex;\nvoid main() { gl_FragColor = texture(uTex, vec2(0.25, 0.25)); }",
    );
    dbg.set_global_texture("uTex", "sampler2D", texture.clone())
        .unwrap();
    dbg.execute().unwrap();

    assert_eq!(component(&dbg, "gl_FragColor", "x"), 1.0);
    assert_eq!(component(&dbg, "gl_FragColor", "y"), 0.0);
    assert_eq!(component(&dbg, "gl_FragColor", "z"), 0.0);
    assert_eq!(component(&dbg, "gl_FragColor", "w"), 1.0);
}

#[test]
fn test_current_line_non_decreasing_in_straight_line_code() {
    let mut dbg = glsl(
        "void main() {\n  float a = 1.0;\n  float b = a + 1.0;\n  float c = b * 2.0;\n  gl_FragColor = vec4(c);\n}",
    );

    let mut lines = Vec::new();
    loop {
        match dbg.step().unwrap() {
            DebugStop::Paused => lines.push(dbg.current_line()),
            DebugStop::Terminated => break,
            other => panic!("unexpected stop: {other:?}"),
        }
    }
    assert!(!lines.is_empty());
    assert!(lines.windows(2).all(|w| w[0] <= w[1]), "lines: {lines:?}");
}

#[test]
fn test_jump_skips_a_statement() {
    let mut dbg = glsl(
        "void main() {\n  gl_FragColor = vec4(1.0);\n  gl_FragColor = vec4(0.5);\n  gl_FragColor.w = 0.25;\n}",
    );
    dbg.step().unwrap(); // at line 2
    dbg.step().unwrap(); // at line 3, line 2 executed
    dbg.jump(4).unwrap(); // skip the line-3 overwrite
    assert_eq!(dbg.continue_().unwrap(), DebugStop::Terminated);

    assert_eq!(component(&dbg, "gl_FragColor", "x"), 1.0);
    assert_eq!(component(&dbg, "gl_FragColor", "w"), 0.25);

    // Jumping to a line with no instruction fails
    let mut dbg = glsl("void main() { gl_FragColor = vec4(1.0); }");
    dbg.step().unwrap();
    assert!(dbg.jump(99).is_err());
}

#[test]
fn test_semantics_applied_before_execute() {
    let mut dbg = glsl("uniform float uTime;\nvoid main() { gl_FragColor = vec4(uTime); }");
    dbg.set_semantic_value("uTime", Value::F32(0.75));
    dbg.execute().unwrap();
    assert_eq!(component(&dbg, "gl_FragColor", "x"), 0.75);
    assert_eq!(dbg.get_semantic_value("uTime"), Some(&Value::F32(0.75)));
}

#[test]
fn test_execute_fn_with_arguments() {
    let mut dbg = glsl(
        "float blend(float a, float b) { return a * 0.5 + b; }\nvoid main() { gl_FragColor = vec4(blend(1.0, 0.0)); }",
    );
    let result = dbg
        .execute_fn("blend", &[Value::F32(2.0), Value::F32(0.25)])
        .unwrap();
    assert_eq!(result, Value::F32(1.25));
    assert_eq!(dbg.get_return_value(), Value::F32(1.25));
}

#[test]
fn test_locals_listing_and_types() {
    let mut dbg = glsl(STEP_SOURCE);
    dbg.step().unwrap();
    assert_eq!(dbg.current_function_locals(), vec!["x"]);

    let compiler = dbg.compiler().unwrap();
    assert_eq!(compiler.symbols().local_type("main", "x"), Some("float"));
}

#[test]
fn test_set_global_vec_and_mat() {
    let mut dbg = glsl(
        "uniform vec4 uColor;\nuniform mat4 uXform;\nvoid main() { gl_FragColor = uColor; }",
    );
    dbg.set_global_vec4("uColor", "vec4", glm::vec4(0.1, 0.2, 0.3, 0.4))
        .unwrap();
    dbg.set_global_mat4("uXform", "mat4", glm::Mat4::identity())
        .unwrap();

    dbg.execute().unwrap();
    assert!((component(&dbg, "gl_FragColor", "y") - 0.2).abs() < 1e-6);

    match dbg.get_global_value("uXform") {
        Some(Value::Object(m)) => {
            assert_eq!(m.class, "mat4");
            match m.get("c1") {
                Some(Value::Object(col)) => {
                    assert_eq!(col.get("y"), Some(&Value::F32(1.0)));
                    assert_eq!(col.get("x"), Some(&Value::F32(0.0)));
                }
                other => panic!("unexpected column: {other:?}"),
            }
        }
        other => panic!("unexpected: {other:?}"),
    }

    // Unknown class types are rejected
    assert!(dbg
        .set_global_vec4("uColor", "no_such_class", glm::vec4(0.0, 0.0, 0.0, 0.0))
        .is_err());
}

#[test]
fn test_hlsl_source_with_float4() {
    let mut dbg = Debugger::new();
    dbg.set_source::<HlslFrontend>(
        Stage::Fragment,
        "uniform float4 tint;\nfloat4 main() : SV_Target {\n  float4 c = tint;\n  c.x = c.x * 0.5;\n  return c;\n}",
        "main",
        &[],
        None,
    )
    .unwrap();

    dbg.set_global_vec4("tint", "float4", glm::vec4(1.0, 0.5, 0.25, 1.0))
        .unwrap();
    let result = dbg.execute().unwrap();

    let obj = result.as_object().unwrap();
    assert_eq!(obj.class, "float4");
    assert_eq!(obj.get("x"), Some(&Value::F32(0.5)));
    assert_eq!(obj.get("y"), Some(&Value::F32(0.5)));
}

#[test]
fn test_set_source_replaces_prior_state() {
    let mut dbg = glsl(LOOP_SOURCE);
    dbg.add_breakpoint(4);
    dbg.step().unwrap();

    dbg.set_source::<GlslFrontend>(
        Stage::Fragment,
        "void main() { gl_FragColor = vec4(0.5); }",
        "main",
        &[],
        None,
    )
    .unwrap();

    // Breakpoints from the previous generation are gone
    assert!(!dbg.has_breakpoint(4));
    assert_eq!(dbg.continue_().unwrap(), DebugStop::Terminated);
    assert_eq!(component(&dbg, "gl_FragColor", "x"), 0.5);
}

#[test]
fn test_runtime_error_leaves_postmortem_state() {
    let mut dbg = glsl(
        "void main() {\n  float w[2];\n  w[5] = 1.0;\n  gl_FragColor = vec4(0.0);\n}",
    );
    let err = dbg.execute();
    assert!(matches!(err, Err(DebugError::Runtime(_))));
    assert!(!dbg.last_error().is_empty());
    // The failing line is still inspectable
    assert_eq!(dbg.current_line(), 3);
}
