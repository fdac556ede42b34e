//! Sandbox Integration Tests
//!
//! Small WAT guests exercising the executor's capabilities and outcome
//! classification.

use protoc_sandbox::config::SandboxConfig;
use protoc_sandbox::protocol::{CodeGeneratorRequest, CodeGeneratorResponse};
use protoc_sandbox::{
    CodeGenerator, CodegenError, DescriptorSource, ExitOutcome, GuestGenerator, GuestImage,
    SandboxCompiler, SandboxExecutor, SandboxLimits, StagedFilesystemView,
};

const HELLO: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "hello")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 5))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))
"#;

const EXIT_THREE: &str = r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "bad input")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 9))
    (drop (call $fd_write (i32.const 2) (i32.const 0) (i32.const 1) (i32.const 8)))
    (call $proc_exit (i32.const 3))))
"#;

const EXIT_ZERO: &str = r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (call $proc_exit (i32.const 0))
    unreachable))
"#;

const UNREACHABLE: &str = r#"(module (func (export "_start") unreachable))"#;

const SPIN: &str = r#"(module (func (export "_start") (loop $l (br $l))))"#;

const ECHO: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_read"
    (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 64))
    (i32.store (i32.const 4) (i32.const 256))
    (drop (call $fd_read (i32.const 0) (i32.const 0) (i32.const 1) (i32.const 8)))
    (i32.store (i32.const 4) (i32.load (i32.const 8)))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 12)))))
"#;

const NEEDS_TEN_PAGES: &str = r#"
(module
  (import "env" "memory" (memory 1))
  (func (export "_start")
    (if (i32.lt_u (memory.size) (i32.const 10))
      (then unreachable))))
"#;

/// Opens PATH through the preopen at fd 3 and copies it to stdout; exits 1 if
/// the open is refused
const CAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "path_open"
    (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_read"
    (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (data (i32.const 512) "PATH")
  (func (export "_start")
    (if (call $path_open (i32.const 3) (i32.const 0) (i32.const 512) (i32.const LEN)
                         (i32.const 0) (i64.const 2) (i64.const 0) (i32.const 0) (i32.const 16))
      (then (call $proc_exit (i32.const 1))))
    (i32.store (i32.const 0) (i32.const 1024))
    (i32.store (i32.const 4) (i32.const 4096))
    (drop (call $fd_read (i32.load (i32.const 16)) (i32.const 0) (i32.const 1) (i32.const 8)))
    (i32.store (i32.const 4) (i32.load (i32.const 8)))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 12)))))
"#;

/// Writes a FileDescriptorSet holding one empty `a.proto` descriptor
const COMPILER: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "\0a\09\0a\07a.proto")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 11))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))
"#;

/// Writes a truncated length-delimited field
const GARBAGE: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "\0a\05ab")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 4))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))
"#;

/// Writes a CodeGeneratorResponse with `error = "bad"`
const FAILING_GENERATOR: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "\0a\03bad")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 5))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))
"#;

fn image(name: &str, wat: &str) -> GuestImage {
    GuestImage::from_bytes(name, wat).unwrap()
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn cat(path: &str) -> GuestImage {
    let wat = CAT.replace("PATH", path).replace("LEN", &path.len().to_string());
    image("cat", &wat)
}

// =============================================================================
// Outcome classification
// =============================================================================

#[test]
fn test_stdout_is_captured() {
    let executor = SandboxExecutor::default();
    let execution = executor
        .execute(&image("hello", HELLO), &args(&["hello"]), None, &StagedFilesystemView::new())
        .unwrap();

    assert_eq!(execution.outcome, ExitOutcome::Success);
    assert_eq!(execution.output.stdout, b"hello");
    assert!(execution.output.stderr.is_empty());
}

#[test]
fn test_exit_zero_is_success() {
    let executor = SandboxExecutor::default();
    let execution = executor
        .execute(&image("exit0", EXIT_ZERO), &args(&["exit0"]), None, &StagedFilesystemView::new())
        .unwrap();
    assert_eq!(execution.outcome, ExitOutcome::Success);
}

#[test]
fn test_non_zero_exit_carries_code_and_stderr() {
    let executor = SandboxExecutor::default();
    let err = executor
        .run(&image("exit3", EXIT_THREE), &args(&["protoc-wrapper"]), None, &StagedFilesystemView::new())
        .unwrap_err();

    match err {
        CodegenError::NonZeroExit { program, code, output } => {
            assert_eq!(program, "protoc-wrapper");
            assert_eq!(code, 3);
            assert_eq!(output.stderr, b"bad input");
        }
        other => panic!("Expected NonZeroExit, got {:?}", other),
    }
}

#[test]
fn test_trap_is_fatal() {
    let executor = SandboxExecutor::default();
    let execution = executor
        .execute(&image("trap", UNREACHABLE), &args(&["trap"]), None, &StagedFilesystemView::new())
        .unwrap();
    assert!(matches!(execution.outcome, ExitOutcome::Trap(_)));

    let err = executor
        .run(&image("trap", UNREACHABLE), &args(&["trap"]), None, &StagedFilesystemView::new())
        .unwrap_err();
    assert!(matches!(err, CodegenError::Trap { .. }));
    assert_eq!(err.stage(), "sandbox");
}

#[test]
fn test_fuel_exhaustion_traps() {
    let executor = SandboxExecutor::new(SandboxLimits {
        fuel: Some(100_000),
        ..SandboxLimits::default()
    });
    let execution = executor
        .execute(&image("spin", SPIN), &args(&["spin"]), None, &StagedFilesystemView::new())
        .unwrap();
    assert!(matches!(execution.outcome, ExitOutcome::Trap(_)));
}

// =============================================================================
// Capabilities
// =============================================================================

#[test]
fn test_stdin_is_delivered() {
    let executor = SandboxExecutor::default();
    let stdout = executor
        .run(
            &image("echo", ECHO),
            &args(&["echo"]),
            Some(b"ping".to_vec()),
            &StagedFilesystemView::new(),
        )
        .unwrap();
    assert_eq!(stdout, b"ping");
}

#[test]
fn test_imported_memory_gets_minimum_pages() {
    let executor = SandboxExecutor::default();
    let execution = executor
        .execute(
            &image("memory", NEEDS_TEN_PAGES),
            &args(&["memory"]),
            None,
            &StagedFilesystemView::new(),
        )
        .unwrap();
    assert_eq!(execution.outcome, ExitOutcome::Success);
}

#[test]
fn test_guest_reads_staged_files() {
    let mut view = StagedFilesystemView::new();
    view.insert_file("common/money.proto", "message Money {}");

    let stdout = SandboxExecutor::default()
        .run(&cat("common/money.proto"), &args(&["cat"]), None, &view)
        .unwrap();
    assert_eq!(stdout, b"message Money {}");
}

#[test]
fn test_guest_cannot_escape_view() {
    let mut view = StagedFilesystemView::new();
    view.insert_file("a.proto", "a");

    for path in ["../a.proto", "/etc/passwd"] {
        let execution = SandboxExecutor::default()
            .execute(&cat(path), &args(&["cat"]), None, &view)
            .unwrap();
        assert_eq!(execution.outcome, ExitOutcome::Exit(1), "path {}", path);
    }
}

// =============================================================================
// Compiler and generators
// =============================================================================

#[test]
fn test_compiler_output_is_decoded() {
    let mut view = StagedFilesystemView::new();
    view.insert_file("a.proto", "syntax = \"proto3\";");

    let mut compiler = SandboxCompiler::new(image("compiler", COMPILER), &SandboxConfig::default(), view);
    assert!(compiler.locate("a.proto"));
    assert!(!compiler.locate("b.proto"));

    let set = compiler.compile(&args(&["a.proto"])).unwrap();
    assert_eq!(set.file.len(), 1);
    assert_eq!(set.file[0].name(), "a.proto");
}

#[test]
fn test_garbage_compiler_output_is_a_decode_error() {
    let mut compiler = SandboxCompiler::new(
        image("garbage", GARBAGE),
        &SandboxConfig::default(),
        StagedFilesystemView::new(),
    );
    let err = compiler.compile(&args(&["a.proto"])).unwrap_err();
    assert!(matches!(err, CodegenError::Decode { .. }));
}

#[test]
fn test_guest_generator_response() {
    let generator = GuestGenerator::new(
        "grpc-java",
        "protoc-wrapper",
        image("generator", FAILING_GENERATOR),
        args(&["grpc-java"]),
        SandboxExecutor::default(),
    );
    let response: CodeGeneratorResponse = generator
        .generate(&CodeGeneratorRequest::default(), &StagedFilesystemView::new())
        .unwrap();

    assert_eq!(generator.id(), "grpc-java");
    assert_eq!(response.error.as_deref(), Some("bad"));
}
