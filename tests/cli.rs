mod common;

use std::io::Write;
use std::process::{Command, Output};

use common::FIB;

fn run_cli(image: &[u8], args: &[&str]) -> Output {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(image).unwrap();
    file.flush().unwrap();
    Command::new(env!("CARGO_BIN_EXE_aero-dbt"))
        .arg(file.path())
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("AERO_DBT_BUDGET")
        .env_remove("AERO_DBT_SAFETY")
        .output()
        .unwrap()
}

#[test]
fn runs_an_image_and_prints_registers() {
    let out = run_cli(&FIB, &["--regions"]);
    assert!(out.status.success(), "{out:?}");
    let stdout = String::from_utf8(out.stdout).unwrap();
    assert!(stdout.contains("rax=0x0000000000000037"), "{stdout}");
    assert!(stdout.contains("exit: Return after 65 instructions"), "{stdout}");
    assert!(stdout.contains("image"), "{stdout}");
}

#[test]
fn budget_flag_stops_the_run_cleanly() {
    let out = run_cli(&FIB, &["--budget", "3"]);
    assert!(out.status.success(), "{out:?}");
    let stdout = String::from_utf8(out.stdout).unwrap();
    assert!(
        stdout.contains("exit: BudgetExceeded after 3 instructions"),
        "{stdout}"
    );
}

#[test]
fn disasm_lists_the_image() {
    let out = run_cli(&FIB, &["--disasm", "10", "--load-address", "0x4000"]);
    assert!(out.status.success(), "{out:?}");
    let stdout = String::from_utf8(out.stdout).unwrap();
    assert!(stdout.contains("0x00004000"), "{stdout}");
    assert!(stdout.contains("mov ebx, 0x1"), "{stdout}");
}

#[test]
fn faults_exit_with_an_error() {
    let out = run_cli(&[0x06], &[]);
    assert!(!out.status.success());
    let stderr = String::from_utf8(out.stderr).unwrap();
    assert!(stderr.contains("decode fault"), "{stderr}");
}

#[test]
fn missing_image_is_reported() {
    let out = Command::new(env!("CARGO_BIN_EXE_aero-dbt"))
        .arg("/nonexistent/image.bin")
        .output()
        .unwrap();
    assert!(!out.status.success());
    let stderr = String::from_utf8(out.stderr).unwrap();
    assert!(stderr.contains("failed to read image"), "{stderr}");
}
