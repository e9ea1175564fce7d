//! End-to-end scenarios: source text piped through the `glint` binary,
//! checked against the stdout a human running the script would see.

use std::io::Write;
use std::process::{Command, Stdio};

fn run(source: &str) -> String {
    let mut file = tempfile::Builder::new().suffix(".glint").tempfile().expect("tempfile");
    file.write_all(source.as_bytes()).expect("write script");

    let output = Command::new(env!("CARGO_BIN_EXE_glint"))
        .arg(file.path())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("spawn glint");

    assert!(
        output.status.success(),
        "glint exited with {:?}, stderr: {}",
        output.status.code(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("utf8 stdout")
}

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("print 1 + 2 * 3;"), "7\n");
}

#[test]
fn string_concatenation_and_exponent() {
    assert_eq!(run("var a = \"hi\"; var b = \"!\"; print a * b ** 3;"), "hi!!!\n");
}

#[test]
fn while_loop_counts_up() {
    assert_eq!(run("var n = 0; while n < 3 { print n; n = n + 1; }"), "0\n1\n2\n");
}

#[test]
fn recursive_fibonacci() {
    assert_eq!(
        run("fun fib(n) { if n < 2 { return n; } return fib(n-1) + fib(n-2); } print fib(10);"),
        "55\n"
    );
}

#[test]
fn string_interpolation_evaluates_expressions() {
    assert_eq!(run("var x = 3; print \"x is ${x * 2}!\";"), "x is 6!\n");
}

#[test]
fn switch_fallthrough_runs_next_case() {
    assert_eq!(
        run(
            "switch 2 { case 1: print \"a\"; case 2: print \"b\"; fallthrough; case 3: print \"c\"; default: print \"d\"; }"
        ),
        "b\nc\n"
    );
}

#[test]
fn stdin_is_read_when_no_path_given() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_glint"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn glint");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(b"print 1 + 1;")
        .expect("write to stdin");
    let output = child.wait_with_output().expect("wait");
    assert!(output.status.success());
    assert_eq!(String::from_utf8(output.stdout).unwrap(), "2\n");
}

#[test]
fn compile_error_exits_65() {
    let mut file = tempfile::Builder::new().suffix(".glint").tempfile().expect("tempfile");
    file.write_all(b"1 +;").expect("write script");
    let output = Command::new(env!("CARGO_BIN_EXE_glint"))
        .arg(file.path())
        .output()
        .expect("spawn glint");
    assert_eq!(output.status.code(), Some(65));
}

#[test]
fn runtime_error_exits_70() {
    let mut file = tempfile::Builder::new().suffix(".glint").tempfile().expect("tempfile");
    file.write_all(b"print undeclared_name;").expect("write script");
    let output = Command::new(env!("CARGO_BIN_EXE_glint"))
        .arg(file.path())
        .output()
        .expect("spawn glint");
    assert_eq!(output.status.code(), Some(70));
}

#[test]
fn trace_flag_does_not_change_stdout_or_exit_code() {
    let mut file = tempfile::Builder::new().suffix(".glint").tempfile().expect("tempfile");
    file.write_all(b"print 1 + 2 * 3;").expect("write script");
    let output = Command::new(env!("CARGO_BIN_EXE_glint"))
        .arg(file.path())
        .arg("--trace")
        .output()
        .expect("spawn glint");
    assert!(output.status.success());
    assert_eq!(String::from_utf8(output.stdout).unwrap(), "7\n");
}
