use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_kith<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_kith"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute kith binary: {err}"))
}

fn run_json(dir: &Path, args: &[&str]) -> Value {
    let mut full = vec!["--dir", path_str(dir), "--json"];
    full.extend_from_slice(args);
    let output = run_kith(&full);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "kith command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

#[test]
fn add_list_remove_lifecycle() {
    let dir = unique_temp_dir("kith-lifecycle");

    let added = run_json(&dir, &["add", "--name", "ada"]);
    assert_eq!(as_str(&added, "added"), "ada");
    assert_eq!(as_str(&added, "contract_version"), "cli.v1");
    let salt = as_str(&added, "salt");
    assert_eq!(salt.len(), 64, "salt should be 32 hex-encoded bytes");

    run_json(&dir, &["add", "--name", "zoe"]);
    run_json(&dir, &["add", "--name", "mira"]);

    let listed = run_json(&dir, &["list"]);
    let names: Vec<&str> =
        as_array(&listed, "contacts").iter().filter_map(Value::as_str).collect();
    assert_eq!(names, vec!["ada", "mira", "zoe"], "listing should be sorted");

    run_json(&dir, &["remove", "--name", "mira"]);
    let listed = run_json(&dir, &["list"]);
    let names: Vec<&str> =
        as_array(&listed, "contacts").iter().filter_map(Value::as_str).collect();
    assert_eq!(names, vec!["ada", "zoe"]);
}

#[test]
fn re_adding_a_contact_keeps_the_original_salt() {
    let dir = unique_temp_dir("kith-readd");
    let added = run_json(&dir, &["add", "--name", "ada"]);
    let original_salt = as_str(&added, "salt").to_string();

    let output = run_kith(["--dir", path_str(&dir), "add", "--name", "ada"]);
    assert!(!output.status.success(), "re-adding should be rejected");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("already exists"), "unexpected stderr: {stderr}");

    let stored = fs::read_to_string(dir.join("contact_ada").join("contact.json"))
        .unwrap_or_else(|err| panic!("stored contact missing: {err}"));
    assert!(stored.contains(&original_salt), "salt must never be regenerated");
}

#[test]
fn batch_add_skips_existing_names() {
    let dir = unique_temp_dir("kith-batch");
    run_json(&dir, &["add", "--name", "ada"]);

    let batch_file = dir.join("names.txt");
    fs::write(&batch_file, "ada\nbrahe\n\n  \nceres\n")
        .unwrap_or_else(|err| panic!("failed to write batch file: {err}"));
    let result = run_json(&dir, &["batch-add", "--file", path_str(&batch_file)]);

    let added: Vec<&str> = as_array(&result, "added").iter().filter_map(Value::as_str).collect();
    let skipped: Vec<&str> =
        as_array(&result, "skipped_existing").iter().filter_map(Value::as_str).collect();
    assert_eq!(added, vec!["brahe", "ceres"]);
    assert_eq!(skipped, vec!["ada"]);
}

#[test]
fn dry_recs_is_deterministic_for_a_fixed_date() {
    let dir = unique_temp_dir("kith-determinism");
    run_json(&dir, &["add", "--name", "ada"]);
    run_json(&dir, &["add", "--name", "brahe"]);

    let first = run_json(&dir, &["dry-recs", "--date", "2018-03-04"]);
    let second = run_json(&dir, &["dry-recs", "--date", "2018-03-04"]);
    assert_eq!(first, second);
    assert_eq!(as_str(&first, "date"), "2018-03-04");
    assert_eq!(as_str(&first, "policy"), "even_split");
}

#[test]
fn dry_recs_on_the_next_emailing_day_reports_an_emailing_day() {
    let dir = unique_temp_dir("kith-nextday");
    run_json(&dir, &["add", "--name", "ada"]);

    let next = run_json(&dir, &["next-day", "--date", "2018-01-01"]);
    let next_day = as_str(&next, "next_emailing_day").to_string();
    assert!(next_day.as_str() >= "2018-01-01", "next day {next_day} went backwards");

    let recs = run_json(&dir, &["dry-recs", "--date", &next_day]);
    assert_eq!(recs.get("emailing_day"), Some(&Value::Bool(true)));
    assert_eq!(as_str(&recs, "next_emailing_day"), next_day);
}

#[test]
fn plan_selects_every_contact_exactly_twice_a_year() {
    let dir = unique_temp_dir("kith-plan");
    for name in ["ada", "brahe", "ceres"] {
        run_json(&dir, &["add", "--name", name]);
    }

    let plan = run_json(&dir, &["plan", "--year", "2018"]);
    assert_eq!(plan.get("days_in_year"), Some(&Value::from(365)));

    for name in ["ada", "brahe", "ceres"] {
        let hits = as_array(&plan, "emailing_days")
            .iter()
            .filter(|day| {
                as_array(day, "selected").iter().filter_map(Value::as_str).any(|n| n == name)
            })
            .count();
        assert_eq!(hits, 2, "{name} should be selected exactly twice in 2018");
    }
}

#[test]
fn periodic_policy_is_selectable() {
    let dir = unique_temp_dir("kith-periodic");
    let next = run_json(&dir, &["--policy", "periodic-bucket", "next-day", "--date", "2018-03-15"]);
    assert_eq!(as_str(&next, "policy"), "periodic_bucket");
    // ISO week 18 of 2018 opens the second campaign on Monday, April 30.
    assert_eq!(as_str(&next, "next_emailing_day"), "2018-04-30");
}

#[test]
fn recs_without_settings_is_a_clear_error() {
    let dir = unique_temp_dir("kith-nosettings");
    let output = run_kith(["--dir", path_str(&dir), "recs", "--date", "2018-03-04"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("kith setup"), "unexpected stderr: {stderr}");
}

#[test]
fn setup_writes_settings_and_gitignore() {
    let dir = unique_temp_dir("kith-setup");
    run_json(
        &dir,
        &[
            "setup",
            "--domain",
            "example.org",
            "--api-key",
            "key-123",
            "--dest-email",
            "me@example.org",
        ],
    );
    let settings = fs::read_to_string(dir.join("settings.json"))
        .unwrap_or_else(|err| panic!("settings missing: {err}"));
    assert!(settings.contains("example.org"));
    let gitignore = fs::read_to_string(dir.join(".gitignore"))
        .unwrap_or_else(|err| panic!("gitignore missing: {err}"));
    assert!(gitignore.contains("settings.json"));
}

#[test]
fn invalid_date_is_rejected() {
    let dir = unique_temp_dir("kith-baddate");
    let output = run_kith(["--dir", path_str(&dir), "dry-recs", "--date", "soon"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid date"), "unexpected stderr: {stderr}");
}
