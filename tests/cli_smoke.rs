use std::path::Path;
use std::process::Command;

use tempfile::tempdir;

fn write_dataset(dir: &Path, rows: usize) -> std::path::PathBuf {
    let mut csv = String::from("id,text,lang\n");
    for i in 0..rows {
        let text = if i % 4 == 0 {
            format!("the weather forecast says rain tomorrow, report {i}")
        } else {
            format!("stock market prices fell sharply today, report {i}")
        };
        csv.push_str(&format!("{i},\"{text}\",en\n"));
    }
    let path = dir.join("data.csv");
    std::fs::write(&path, csv).unwrap();
    path
}

fn level() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_level"));
    cmd.env("RUST_LOG", "off");
    cmd
}

#[test]
fn offline_analyze_then_export() {
    let dir = tempdir().unwrap();
    let input = write_dataset(dir.path(), 60);
    let snapshot_path = dir.path().join("snapshot.json");

    let status = level()
        .args(["analyze", "--offline", "--input"])
        .arg(&input)
        .arg("--out")
        .arg(&snapshot_path)
        .status()
        .unwrap();
    assert!(status.success());

    let snapshot: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&snapshot_path).unwrap()).unwrap();
    assert_eq!(snapshot["base"]["totalPoints"], 60);
    let peaks = snapshot["base"]["peaks"].as_array().unwrap();
    assert!(!peaks.is_empty());
    let total: u64 = peaks.iter().map(|p| p["sampleCount"].as_u64().unwrap()).sum();
    assert_eq!(total, 60);
    assert!(snapshot["ai"].is_null());

    // Drop the first cluster entirely; the rest export unchanged.
    let first = &peaks[0];
    let dropped = first["sampleCount"].as_u64().unwrap() as usize;
    let adjust_path = dir.path().join("adjust.json");
    std::fs::write(
        &adjust_path,
        format!(r#"[{{"id": {}, "newCount": 0}}]"#, first["id"]),
    )
    .unwrap();

    let out_path = dir.path().join("balanced.csv");
    let status = level()
        .args(["export", "--offline", "--annotate", "--policy", "prune", "--input"])
        .arg(&input)
        .arg("--adjust")
        .arg(&adjust_path)
        .arg("--out")
        .arg(&out_path)
        .status()
        .unwrap();

    if peaks.len() == 1 {
        // Nothing left to export.
        assert!(!status.success());
        return;
    }
    assert!(status.success());

    let csv = std::fs::read_to_string(&out_path).unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("id,text,lang,cluster_id,weight"));
    assert_eq!(lines.count(), 60 - dropped);
}

#[test]
fn too_few_rows_fails() {
    let dir = tempdir().unwrap();
    let input = write_dataset(dir.path(), 10);

    let output = level()
        .args(["analyze", "--offline", "--input"])
        .arg(&input)
        .arg("--out")
        .arg(dir.path().join("snapshot.json"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(!dir.path().join("snapshot.json").exists());
}

#[test]
fn config_file_lowers_min_rows() {
    let dir = tempdir().unwrap();
    let input = write_dataset(dir.path(), 12);
    let config = dir.path().join("level.toml");
    std::fs::write(&config, "[ingest]\nmin_rows = 10\n").unwrap();
    let out_path = dir.path().join("out.csv");

    let status = level()
        .args(["export", "--offline", "--input"])
        .arg(&input)
        .arg("--config")
        .arg(&config)
        .arg("--out")
        .arg(&out_path)
        .status()
        .unwrap();
    assert!(status.success());

    let csv = std::fs::read_to_string(&out_path).unwrap();
    assert_eq!(csv.lines().count(), 13);
    assert!(csv.starts_with("id,text,lang\n"));
}
