use std::fs;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn gcv_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_gcv"))
}

const MANIFEST: &str = r#"
[[assets]]
object_path = "/Game/Characters/Hero.Hero"
class_name = "SkeletalMesh"

[assets.tags]
Vertices = "18432"
file_size_mb = "12.5"

[[assets]]
object_path = "/Game/Props/Crate.Crate"
class_name = "StaticMesh"

[[assets]]
object_path = "/Game/Audio/Hit.Hit"
class_name = "SoundWave"
renderable = false
"#;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn setup_test_env() -> (TempDir, PathBuf, u16) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let port = free_port();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(root.join("content.toml"), MANIFEST).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/gcv.sqlite"

[engine]
address = "127.0.0.1:{port}"
connect_timeout_secs = 2
request_timeout_secs = 30

[engine_host]
bind = "127.0.0.1:{port}"
content_manifest = "{root}/content.toml"

[thumbnails]
cache_dir = "{root}/cache"
batch_size = 2
"#,
        root = root.display(),
        port = port
    );

    let config_path = config_dir.join("gcv.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path, port)
}

fn run_gcv(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = gcv_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run gcv binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

/// A `gcv engine serve` child process, killed on drop.
struct EngineProcess {
    child: Child,
}

impl EngineProcess {
    fn start(config_path: &Path, port: u16) -> Self {
        let child = Command::new(gcv_binary())
            .arg("--config")
            .arg(config_path)
            .args(["engine", "serve"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn engine host");

        let deadline = Instant::now() + Duration::from_secs(15);
        while TcpStream::connect(("127.0.0.1", port)).is_err() {
            assert!(Instant::now() < deadline, "engine host never started listening");
            std::thread::sleep(Duration::from_millis(50));
        }
        Self { child }
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        false
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path, _) = setup_test_env();

    let (stdout, stderr, success) = run_gcv(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path, _) = setup_test_env();

    let (_, _, success1) = run_gcv(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_gcv(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_invalid_config_is_rejected() {
    let (tmp, _, _) = setup_test_env();
    let bad = tmp.path().join("config/bad.toml");
    fs::write(&bad, "[db]\npath = \"x.sqlite\"\n[sync]\npage_size = 0\n").unwrap();

    let (_, stderr, success) = run_gcv(&bad, &["stats"]);
    assert!(!success);
    assert!(stderr.contains("page_size"), "stderr={}", stderr);
}

#[test]
fn test_sync_without_engine_fails_and_records_scan() {
    let (_tmp, config_path, _) = setup_test_env();
    run_gcv(&config_path, &["init"]);

    let (stdout, stderr, success) = run_gcv(&config_path, &["sync", ""]);
    assert!(!success, "sync should fail: stdout={}", stdout);
    assert!(stdout.contains("(failed)"), "stdout={}", stdout);
    assert!(stderr.contains("cannot connect"), "stderr={}", stderr);

    let (stats, _, ok) = run_gcv(&config_path, &["stats"]);
    assert!(ok);
    assert!(stats.contains("failed"));
}

#[test]
fn test_exec_relays_output_and_status() {
    let (_tmp, config_path, port) = setup_test_env();
    let _engine = EngineProcess::start(&config_path, port);

    let (stdout, _, success) = run_gcv(
        &config_path,
        &["exec", "print(#editor.list_assets(''))"],
    );
    assert!(success);
    assert_eq!(stdout.trim(), "3");

    let (_, stderr, success) = run_gcv(&config_path, &["exec", "error('no such thing')"]);
    assert!(!success);
    assert!(stderr.contains("no such thing"));
}

#[test]
fn test_exec_from_file() {
    let (tmp, config_path, port) = setup_test_env();
    let _engine = EngineProcess::start(&config_path, port);
    let script = tmp.path().join("query.lua");
    fs::write(
        &script,
        "local d = editor.find_asset('/Game/Characters/Hero.Hero')\nprint(d.class_name)\n",
    )
    .unwrap();

    let (stdout, stderr, success) =
        run_gcv(&config_path, &["exec", "--file", script.to_str().unwrap()]);
    assert!(success, "stderr={}", stderr);
    assert_eq!(stdout.trim(), "SkeletalMesh");
}

#[test]
fn test_full_catalogue_flow() {
    let (tmp, config_path, port) = setup_test_env();
    let mut engine = EngineProcess::start(&config_path, port);

    let (_, _, ok) = run_gcv(&config_path, &["init"]);
    assert!(ok);

    // First sync inserts everything.
    let (stdout, stderr, success) = run_gcv(&config_path, &["sync", ""]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("inserted: 3"), "stdout={}", stdout);
    assert!(stdout.contains("ok"));

    // Second sync with no change is a no-op merge.
    let (stdout, _, success) = run_gcv(&config_path, &["sync", ""]);
    assert!(success);
    assert!(stdout.contains("inserted: 0"));
    assert!(stdout.contains("updated: 3"));
    assert!(stdout.contains("pruned: 0"));

    // First refresh: nothing resident yet, so placeholders.
    let (stdout, stderr, success) =
        run_gcv(&config_path, &["thumbnails", "refresh", "", "--resolution", "128"]);
    assert!(success, "refresh failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("requested: 3"), "stdout={}", stdout);
    assert!(stdout.contains("placeholder: 2"), "stdout={}", stdout);
    assert!(stdout.contains("failed: 1"), "stdout={}", stdout);

    // Second refresh converges.
    let (stdout, _, success) =
        run_gcv(&config_path, &["thumbnails", "refresh", "", "--resolution", "128"]);
    assert!(success);
    assert!(stdout.contains("final: 2"), "stdout={}", stdout);

    // Third refresh skips what is already final.
    let (stdout, _, success) =
        run_gcv(&config_path, &["thumbnails", "refresh", "", "--resolution", "128"]);
    assert!(success);
    assert!(stdout.contains("skipped: 2"), "stdout={}", stdout);
    assert!(stdout.contains("processed: 1"), "stdout={}", stdout);

    let (stdout, _, success) = run_gcv(
        &config_path,
        &["get", "/Game/Characters/Hero.Hero", "--json"],
    );
    assert!(success);
    let asset: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(asset["class_name"], "SkeletalMesh");
    assert_eq!(asset["tags"]["Vertices"], "18432");
    assert_eq!(asset["thumbnails"][0]["state"], "final");
    assert_eq!(asset["thumbnails"][0]["resolution"], 128);
    let cached = asset["thumbnails"][0]["cache_path"].as_str().unwrap();
    assert!(Path::new(cached).exists());

    // Remove the crate from the content tree; the next full sync prunes it.
    std::thread::sleep(Duration::from_millis(1100));
    fs::write(
        tmp.path().join("content.toml"),
        MANIFEST.replace(
            "[[assets]]\nobject_path = \"/Game/Props/Crate.Crate\"\nclass_name = \"StaticMesh\"\n",
            "",
        ),
    )
    .unwrap();
    let (stdout, _, success) = run_gcv(&config_path, &["sync", ""]);
    assert!(success);
    assert!(stdout.contains("pruned: 1"), "stdout={}", stdout);

    let (_, _, found) = run_gcv(&config_path, &["get", "/Game/Props/Crate.Crate"]);
    assert!(!found);

    let (stdout, _, success) = run_gcv(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Assets:      2"), "stdout={}", stdout);
    assert!(stdout.contains("Content:     12.500 MB"), "stdout={}", stdout);
    assert!(stdout.contains("SkeletalMesh"));

    let (stdout, _, success) = run_gcv(&config_path, &["engine", "stop"]);
    assert!(success);
    assert!(stdout.contains("shutting down"));
    assert!(engine.wait_for_exit(Duration::from_secs(10)));
}
