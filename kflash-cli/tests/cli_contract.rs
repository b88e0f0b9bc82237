//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, std::path::Path, tempfile::tempdir};

const KEY: &str = "000102030405060708090a0b0c0d0e0f";

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::cargo::cargo_bin_cmd!("kflash")
}

/// A command that ignores config files and environment on the host.
fn isolated_cmd(dir: &Path) -> assert_cmd::Command {
    let mut cmd = cli_cmd();
    cmd.current_dir(dir)
        .env("HOME", dir)
        .env("XDG_CONFIG_HOME", dir.join(".config"))
        .env("APPDATA", dir)
        .env_remove("KFLASH_PORT")
        .env_remove("KFLASH_BAUD")
        .env_remove("KFLASH_BOARD")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("kflash"))
        .stdout(predicate::str::contains("Usage"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("kflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn subcommand_help_lists_flash_options() {
    let mut cmd = cli_cmd();
    cmd.args(["flash", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--bootloader"))
        .stdout(predicate::str::contains("--key"))
        .stdout(predicate::str::contains("--io-mode"));
}

#[test]
fn list_ports_json_returns_valid_json() {
    let dir = tempdir().expect("tempdir should be created");
    let output = isolated_cmd(dir.path())
        .args(["list-ports", "--json"])
        .assert()
        .success()
        .get_output()
        .clone();

    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    let parsed: serde_json::Value =
        serde_json::from_str(&stdout).expect("list-ports --json should print JSON");
    assert!(parsed.is_array(), "list-ports --json should return an array");
}

// ============================================================================
// Exit Code Tests
// ============================================================================

#[test]
fn exit_code_two_for_unknown_command() {
    let mut cmd = cli_cmd();
    cmd.arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn exit_code_two_for_invalid_flag() {
    let mut cmd = cli_cmd();
    cmd.arg("--invalid-flag-xyz").assert().failure().code(2);
}

#[test]
fn exit_code_two_for_missing_firmware() {
    let mut cmd = cli_cmd();
    cmd.arg("flash")
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("<FIRMWARE>"));
}

#[test]
fn exit_code_two_for_unknown_board() {
    let mut cmd = cli_cmd();
    cmd.args(["--board", "maix3", "list-ports"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unknown board"));
}

#[test]
fn exit_code_two_for_bad_flash_chip() {
    let mut cmd = cli_cmd();
    cmd.args(["flash", "fw.bin", "--flash-chip", "2"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_bad_io_mode() {
    let mut cmd = cli_cmd();
    cmd.args(["flash", "fw.bin", "--io-mode", "octal"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_short_key() {
    let dir = tempdir().expect("tempdir should be created");
    isolated_cmd(dir.path())
        .args(["flash", "fw.bin", "-l", "stub.bin", "--key", "0011"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--key"));
}

#[test]
fn exit_code_two_for_non_hex_key() {
    let dir = tempdir().expect("tempdir should be created");
    isolated_cmd(dir.path())
        .args(["flash", "fw.bin", "-l", "stub.bin", "--key"])
        .arg("zz".repeat(16))
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_without_bootloader() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("fw.bin"), [0u8; 16]).expect("write firmware");

    isolated_cmd(dir.path())
        .args(["flash", "fw.bin", "--key", KEY])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--bootloader"));
}

#[test]
fn exit_code_one_for_missing_firmware_file() {
    let dir = tempdir().expect("tempdir should be created");
    isolated_cmd(dir.path())
        .args(["flash", "does_not_exist.bin", "-l", "stub.bin"])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Failed to read firmware"));
}

#[test]
fn elf_cannot_be_flashed() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("app.elf"), b"\x7fELF\x02\x01\x01").expect("write elf");
    fs::write(dir.path().join("stub.bin"), [0u8; 16]).expect("write stub");

    isolated_cmd(dir.path())
        .args(["flash", "app.elf", "-l", "stub.bin"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Unsupported image format"));
}

#[test]
fn kfpkg_cannot_be_loaded_to_sram() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("app.kfpkg"), b"PK\x03\x04").expect("write kfpkg");

    isolated_cmd(dir.path())
        .args(["sram", "app.kfpkg"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Unsupported image format"));
}

#[test]
fn exit_code_two_for_misaligned_erase() {
    let dir = tempdir().expect("tempdir should be created");
    isolated_cmd(dir.path())
        .args(["erase", "-l", "stub.bin", "--addr", "0x1001", "--length", "0x1000"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Invalid erase range"));
}

#[test]
fn exit_code_two_for_oversized_erase() {
    let dir = tempdir().expect("tempdir should be created");
    isolated_cmd(dir.path())
        .args(["erase", "-l", "stub.bin", "--addr", "0x3fff000", "--length", "0x2000"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn erase_requires_length() {
    let mut cmd = cli_cmd();
    cmd.arg("erase")
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("--length"));
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn invalid_config_file_warns_and_continues() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("kflash.toml"), "invalid toml [[[").expect("write config");

    let output = isolated_cmd(dir.path())
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");
    assert!(
        output.status.success(),
        "command should succeed despite config warning"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}

#[test]
fn config_bootloader_is_used() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(
        dir.path().join("kflash.toml"),
        "[flash]\nbootloader = \"missing_stub.bin\"\n",
    )
    .expect("write config");
    fs::write(dir.path().join("fw.bin"), [0u8; 16]).expect("write firmware");

    // the stub path comes from the config file, so the failure is reading it
    isolated_cmd(dir.path())
        .args(["flash", "fw.bin"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("missing_stub.bin"));
}

#[test]
fn bad_board_in_config_is_usage_error() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join(".kflash.toml"), "[port]\nboard = \"nope\"\n")
        .expect("write config");

    isolated_cmd(dir.path())
        .args(["sram", "app.bin"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("port.board"));
}

// ============================================================================
// Completions
// ============================================================================

#[test]
fn completions_command_writes_to_stdout() {
    let mut cmd = cli_cmd();
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .stderr(predicate::str::is_empty())
        .stdout(predicate::str::contains("_kflash()"));
}

#[test]
fn completions_require_a_shell() {
    let mut cmd = cli_cmd();
    cmd.arg("completions").assert().failure().code(2);
}

#[test]
fn option_terminator_allows_dash_prefixed_operand() {
    let dir = tempdir().expect("tempdir should be created");
    isolated_cmd(dir.path())
        .args(["sram", "--", "-program.bin"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("-program.bin"));
}

#[test]
fn colors_disabled_when_not_tty() {
    let output = cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .clone();

    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    assert!(
        !stdout.contains("\x1b["),
        "Colors should be disabled in non-TTY mode"
    );
}
