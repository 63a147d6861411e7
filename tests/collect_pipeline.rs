use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use predicates::prelude::*;
use trustmed_collect::formats::Item;

const SOURCES_YAML: &str = r#"
topics:
  - topic: diabetes
    sub_sources: [diabetes]
    sorts: [hot, new]
    keywords: [sugar]
    target_count: 10
"#;

fn post(id: &str, title: &str, num_comments: u64) -> serde_json::Value {
    serde_json::json!({
        "kind": "t3",
        "data": {
            "id": id,
            "title": title,
            "selftext": "Checking my levels twice a day.",
            "author": "poster",
            "subreddit": "diabetes",
            "created_utc": 1_700_000_000.0,
            "score": 7,
            "num_comments": num_comments,
            "upvote_ratio": 0.93,
            "permalink": format!("/r/diabetes/comments/{id}/post/"),
        }
    })
}

fn listing(children: Vec<serde_json::Value>) -> String {
    serde_json::json!({"kind": "Listing", "data": {"children": children, "after": null}}).to_string()
}

fn thread_body(id: &str) -> String {
    serde_json::json!([
        {"kind": "Listing", "data": {"children": [post(id, "thread", 1)]}},
        {"kind": "Listing", "data": {"children": [
            {"kind": "t1", "data": {
                "author": "helper",
                "body": "Try walking after meals",
                "score": 5,
                "created_utc": 1_700_000_100.0,
                "replies": "",
            }},
        ]}},
    ])
    .to_string()
}

struct StubReddit {
    base_url: String,
    comment_hits: Arc<AtomicUsize>,
    shutdown: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Drop for StubReddit {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_reddit_stub() -> StubReddit {
    let server = tiny_http::Server::http("127.0.0.1:0").expect("start tiny_http server");
    let base_url = format!("http://{}", server.server_addr());
    let comment_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&comment_hits);

    let (shutdown, shutdown_rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }
            let request = match server.recv_timeout(Duration::from_millis(50)) {
                Ok(Some(req)) => req,
                Ok(None) => continue,
                Err(_) => break,
            };

            let url = request.url().to_string();
            let path = url.split('?').next().unwrap_or(&url).to_string();
            let body = match path.as_str() {
                "/r/diabetes/hot.json" => listing(vec![
                    post("d1", "Blood sugar spikes after breakfast", 2),
                    post("d2", "Sugar cravings at night", 3),
                    post("d3", "Low sugar while running", 0),
                ]),
                "/r/diabetes/new.json" => listing(vec![
                    post("d2", "Sugar cravings at night", 3),
                    post("d4", "New to sugar tracking", 0),
                    post("x1", "Knee surgery recovery", 1),
                ]),
                p if p.starts_with("/comments/") => {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let id = p
                        .trim_start_matches("/comments/")
                        .trim_end_matches(".json")
                        .to_string();
                    thread_body(&id)
                }
                _ => listing(Vec::new()),
            };
            let header = tiny_http::Header::from_bytes("Content-Type", "application/json")
                .expect("content-type header");
            let _ = request.respond(tiny_http::Response::from_string(body).with_header(header));
        }
    });

    StubReddit {
        base_url,
        comment_hits,
        shutdown,
        handle: Some(handle),
    }
}

fn remote_flags(base_url: &str) -> Vec<String> {
    [
        "--base-url",
        base_url,
        "--min-delay-ms",
        "0",
        "--max-delay-ms",
        "0",
        "--backoff-ms",
        "0",
        "--forbidden-backoff-ms",
        "0",
        "--retry-delay-ms",
        "0",
        "--max-retries",
        "1",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

fn load_ids(path: &Path) -> BTreeSet<String> {
    let items: Vec<Item> =
        serde_json::from_str(&fs::read_to_string(path).expect("read artifact")).expect("parse artifact");
    items.into_iter().map(|i| i.stable_id).collect()
}

fn ids(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

#[test]
fn collect_resume_replies_combine_prepare_upload() {
    let stub = spawn_reddit_stub();
    let temp = tempfile::TempDir::new().expect("tempdir");
    let sources = temp.path().join("sources.yaml");
    fs::write(&sources, SOURCES_YAML).expect("write sources");
    let data = temp.path().join("data");
    let prepared = temp.path().join("prepared");
    let bucket = temp.path().join("bucket");
    let sources = sources.to_str().expect("utf-8 path");
    let data_arg = data.to_str().expect("utf-8 path");

    // First run stops at the target of two new threads.
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("trustmed-collect");
    cmd.args(["collect", "--out", data_arg, "--sources", sources])
        .args(["--target", "2", "--min-total", "0"])
        .args(remote_flags(&stub.base_url))
        .assert()
        .success();
    let incremental = data.join("diabetes_threads_incremental.json");
    assert_eq!(load_ids(&incremental), ids(&["d1", "d2"]));

    // Second run resumes: only unseen relevant threads are added.
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("trustmed-collect");
    cmd.args(["collect", "--out", data_arg, "--sources", sources])
        .args(["--min-total", "4"])
        .args(remote_flags(&stub.base_url))
        .assert()
        .success();
    assert_eq!(load_ids(&incremental), ids(&["d1", "d2", "d3", "d4"]));

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("trustmed-collect");
    cmd.args(["fetch-replies", "--data", data_arg, "--sources", sources])
        .args(remote_flags(&stub.base_url))
        .assert()
        .success();
    // d1 and d2 sit in every snapshot but are requested once; d3 and d4
    // report no comments.
    let first_pass = stub.comment_hits.load(Ordering::SeqCst);
    assert_eq!(first_pass, 2);

    // Threads that already carry replies are not fetched again.
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("trustmed-collect");
    cmd.args(["fetch-replies", "--data", data_arg, "--sources", sources])
        .args(remote_flags(&stub.base_url))
        .assert()
        .success();
    assert_eq!(stub.comment_hits.load(Ordering::SeqCst), first_pass);

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("trustmed-collect");
    cmd.args(["combine", "--data", data_arg, "--sources", sources])
        .assert()
        .success();
    let combined = data.join("diabetes_threads_combined.json");
    assert_eq!(load_ids(&combined), ids(&["d1", "d2", "d3", "d4"]));
    assert!(data.join("diabetes_threads_combined.csv").is_file());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("trustmed-collect");
    cmd.args(["prepare", "--data", data_arg, "--out"])
        .arg(&prepared)
        .assert()
        .success();
    let doc = fs::read_to_string(prepared.join("forums/diabetes/d1.txt")).expect("read d1 doc");
    assert!(doc.starts_with("Thread ID: d1\n"));
    assert!(doc.contains("1. u/helper [score=5, "));
    assert!(doc.contains("Try walking after meals"));
    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(prepared.join("manifest.json")).expect("read manifest"))
            .expect("parse manifest");
    assert_eq!(manifest.as_array().map(Vec::len), Some(4));

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("trustmed-collect");
    cmd.args(["upload", "--prefix", "kb/"])
        .arg("--input")
        .arg(&prepared)
        .arg("--dest")
        .arg(&bucket)
        .assert()
        .success();
    assert!(bucket.join("kb/manifest.json").is_file());
    assert!(bucket.join("kb/forums/diabetes/d4.txt").is_file());
}

#[test]
fn collect_below_minimum_total_fails() {
    let stub = spawn_reddit_stub();
    let temp = tempfile::TempDir::new().expect("tempdir");
    let sources = temp.path().join("sources.yaml");
    fs::write(&sources, SOURCES_YAML).expect("write sources");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("trustmed-collect");
    cmd.arg("collect")
        .arg("--out")
        .arg(temp.path().join("data"))
        .arg("--sources")
        .arg(&sources)
        .args(["--min-total", "100"])
        .args(remote_flags(&stub.base_url))
        .assert()
        .failure()
        .stderr(predicate::str::contains("below the minimum of 100"));
}

#[test]
fn unknown_topic_is_rejected() {
    let temp = tempfile::TempDir::new().expect("tempdir");
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("trustmed-collect");
    cmd.arg("combine")
        .arg("--data")
        .arg(temp.path())
        .args(["--topic", "gout"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown topic: gout"));
}

#[test]
fn rust_log_debug_emits_debug_line_to_stderr() {
    let temp = tempfile::TempDir::new().expect("tempdir");
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("trustmed-collect");
    cmd.env("RUST_LOG", "debug")
        .arg("combine")
        .arg("--data")
        .arg(temp.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("parsed cli"));
}
