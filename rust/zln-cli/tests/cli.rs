//! End-to-end tests for the `zln` binary.

use std::path::PathBuf;
use std::process::{Command, Output};
use zln_vm::emit::asm::{halt, invoke, ldc_i32, op3, st_glb};
use zln_vm::emit::ProgramBuilder;
use zln_vm::{BuiltInFunction, Instruction, OpCode, Type};

// =============================================================================
// Helpers
// =============================================================================

/// Write `image` to a per-test file in the temp dir.
fn write_image(name: &str, image: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("zln-cli-{}-{}.zlb", name, std::process::id()));
    std::fs::write(&path, image).expect("temp dir should be writable");
    path
}

fn zln(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_zln"))
        .args(args)
        .current_dir(std::env::temp_dir())
        .env("RUST_LOG", "off")
        .output()
        .expect("zln binary should start")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

/// Prints "hello", then stores 100 + 200 in global 0.
fn hello_image() -> Vec<u8> {
    let mut b = ProgramBuilder::new();
    let hello = b.consts().str("hello");
    let main = b.begin_function("main", 0, 3, Type::Void);
    b.emit(Instruction::reg_imm(OpCode::LdcStr, 1, hello));
    b.emit(invoke(0, 1, BuiltInFunction::Print.id()));
    b.emit(ldc_i32(1, 100));
    b.emit(ldc_i32(2, 200));
    b.emit(op3(OpCode::AddI32, 3, 1, 2));
    b.emit(st_glb(OpCode::StGlbI32, 3, 0));
    b.emit(halt());
    b.image(main)
}

fn div_by_zero_image() -> Vec<u8> {
    let mut b = ProgramBuilder::new();
    let main = b.begin_function("main", 0, 3, Type::Void);
    b.emit(ldc_i32(1, 1));
    b.emit(ldc_i32(2, 0));
    b.emit(op3(OpCode::DivI32, 3, 1, 2));
    b.emit(halt());
    b.image(main)
}

// =============================================================================
// run
// =============================================================================

#[test]
fn run_prints_program_output() {
    let path = write_image("hello", &hello_image());
    let out = zln(&["run", path.to_str().unwrap()]);
    assert!(out.status.success(), "{}", stderr(&out));
    assert_eq!(stdout(&out), "hello\n");
}

#[test]
fn run_json_captures_output_and_heap() {
    let path = write_image("hello-json", &hello_image());
    let out = zln(&["run", path.to_str().unwrap(), "--json", "--dump-heap"]);
    assert!(out.status.success(), "{}", stderr(&out));

    let report: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(report["success"], true);
    assert_eq!(report["steps"], 7);
    assert_eq!(report["output"][0], "hello");
    assert_eq!(report["heap"][0]["type_name"], "UI8[]");
    assert_eq!(report["heap"][0]["text"], "hello");
    assert_eq!(report["heap"][0]["data_size"], 6);
}

#[test]
fn run_failure_exits_non_zero_with_trace() {
    let path = write_image("div", &div_by_zero_image());
    let out = zln(&["run", path.to_str().unwrap()]);
    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.contains("division by zero"), "{}", err);
    assert!(err.contains("#0: main"), "{}", err);
}

#[test]
fn run_failure_json_reports_the_error() {
    let path = write_image("div-json", &div_by_zero_image());
    let out = zln(&["run", path.to_str().unwrap(), "--json"]);
    assert!(!out.status.success());
    let report: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(report["success"], false);
    assert_eq!(report["error"]["message"], "division by zero");
    assert_eq!(report["error"]["stack_trace"][0]["function"], "main");
}

#[test]
fn trace_lists_each_instruction() {
    let path = write_image("trace", &hello_image());
    let out = zln(&["run", path.to_str().unwrap(), "--trace"]);
    assert!(out.status.success());
    let err = stderr(&out);
    assert!(err.contains("LdcStr r1"), "{}", err);
    assert!(err.contains("Halt"), "{}", err);
}

// =============================================================================
// disasm / validate
// =============================================================================

#[test]
fn disasm_prints_every_instruction() {
    let path = write_image("disasm", &hello_image());
    let out = zln(&["disasm", path.to_str().unwrap()]);
    assert!(out.status.success(), "{}", stderr(&out));
    let text = stdout(&out);
    assert!(text.contains("     0: LdcStr r1, "), "{}", text);
    assert!(text.contains("AddI32 r3, r1, r2"), "{}", text);
    assert!(text.trim_end().ends_with("Halt"), "{}", text);
}

#[test]
fn validate_accepts_a_good_image() {
    let path = write_image("valid", &hello_image());
    let out = zln(&["validate", path.to_str().unwrap(), "--json"]);
    assert!(out.status.success(), "{}", stderr(&out));
    let report: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(report["valid"], true);
    assert_eq!(report["header"]["major_version"], 0);
    assert_eq!(report["header"]["minor_version"], 1);
}

#[test]
fn validate_rejects_bad_magic() {
    let mut image = hello_image();
    image[0] = b'X';
    let path = write_image("bad-magic", &image);
    let out = zln(&["validate", path.to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("invalid program header"));
}

#[test]
fn missing_file_is_reported() {
    let out = zln(&["run", "/nonexistent/program.zlb"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("cannot read"));
}
