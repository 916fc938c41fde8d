//! End-to-end scenarios for the turn-observation pipeline: a watcher armed on
//! a real file with a byte baseline, fed by real filesystem appends.

use std::fs::OpenOptions;
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ccbridge_core::config::BridgePaths;
use ccbridge_core::notify_surface::spawn_notifier;
use ccbridge_core::transcript::types::{AttachedSession, Baseline};
use ccbridge_core::watch::manager::{WatchHooks, WatcherManager};
use ccbridge_core::watch::turn::{self, TurnCallbacks, TurnWatcherOptions};
use ccbridge_core::SessionIndex;

fn assistant_line(cwd: &str, text: &str) -> String {
    format!(
        r#"{{"type":"assistant","cwd":"{}","message":{{"content":[{{"type":"text","text":"{}"}}]}}}}"#,
        cwd, text
    ) + "\n"
}

fn result_line() -> String {
    r#"{"type":"result","subtype":"success"}"#.to_string() + "\n"
}

fn append(path: &Path, content: &str) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
}

struct Collected {
    texts: Arc<Mutex<Vec<String>>>,
    completions: Arc<AtomicUsize>,
}

fn collecting_callbacks() -> (TurnCallbacks, Collected) {
    let texts: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let completions = Arc::new(AtomicUsize::new(0));

    let texts_cb = texts.clone();
    let completions_cb = completions.clone();
    let mut callbacks = TurnCallbacks::new(Arc::new(move |turn_text: turn::TurnText| {
        texts_cb.lock().unwrap().push(turn_text.text);
    }));
    callbacks.on_complete = Some(Arc::new(move || {
        completions_cb.fetch_add(1, Ordering::SeqCst);
    }));

    (
        callbacks,
        Collected {
            texts,
            completions,
        },
    )
}

async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

fn watch_opts(path: PathBuf, baseline: u64) -> TurnWatcherOptions {
    TurnWatcherOptions::new(path, baseline, "sess-1", "/tmp/p", "p")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn text_block_after_baseline_then_result_completes_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sess-1.jsonl");
    std::fs::write(&path, "").unwrap();

    let (callbacks, collected) = collecting_callbacks();
    let handle = turn::spawn(watch_opts(path.clone(), 0), callbacks);

    append(&path, &assistant_line("/tmp/p", "Build succeeded."));

    assert!(
        wait_until(Duration::from_millis(1500), || {
            collected.texts.lock().unwrap().len() == 1
        })
        .await,
        "text event should arrive promptly"
    );
    assert_eq!(collected.texts.lock().unwrap()[0], "Build succeeded.");
    assert_eq!(collected.completions.load(Ordering::SeqCst), 0);

    append(&path, &result_line());
    assert!(
        wait_until(Duration::from_secs(3), || {
            collected.completions.load(Ordering::SeqCst) == 1
        })
        .await,
        "result record should complete the turn"
    );

    // Completion fires exactly once; late stop is a no-op.
    handle.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(collected.completions.load(Ordering::SeqCst), 1);
    assert_eq!(collected.texts.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pre_baseline_blocks_are_invisible() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sess-1.jsonl");
    std::fs::write(&path, assistant_line("/tmp/p", "Old message.")).unwrap();
    let baseline = std::fs::metadata(&path).unwrap().len();

    let (callbacks, collected) = collecting_callbacks();
    let handle = turn::spawn(watch_opts(path.clone(), baseline), callbacks);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(collected.texts.lock().unwrap().is_empty());
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_appends_fire_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sess-1.jsonl");
    std::fs::write(&path, "").unwrap();

    let (callbacks, collected) = collecting_callbacks();
    let handle = turn::spawn(watch_opts(path.clone(), 0), callbacks);

    let line = assistant_line("/tmp/p", "Same block.");
    append(&path, &line);
    append(&path, &line);

    assert!(
        wait_until(Duration::from_millis(1500), || {
            !collected.texts.lock().unwrap().is_empty()
        })
        .await
    );
    // Give a duplicate a chance to slip through before asserting.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(collected.texts.lock().unwrap().len(), 1);
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interleaved_blocks_arrive_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sess-1.jsonl");
    std::fs::write(&path, "").unwrap();

    let (callbacks, collected) = collecting_callbacks();
    let handle = turn::spawn(watch_opts(path.clone(), 0), callbacks);

    append(&path, &assistant_line("/tmp/p", "Block A"));
    append(&path, &assistant_line("/tmp/p", "Block B"));

    assert!(
        wait_until(Duration::from_millis(1500), || {
            collected.texts.lock().unwrap().len() == 2
        })
        .await
    );
    assert_eq!(
        *collected.texts.lock().unwrap(),
        vec!["Block A".to_string(), "Block B".to_string()]
    );
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rotation_rearms_on_newest_file_with_zero_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let paths = BridgePaths::new(dir.path().join("cfg"), dir.path().join("projects"));
    let project_dir = dir.path().join("projects").join("-work-alpha");
    std::fs::create_dir_all(&project_dir).unwrap();

    let old = project_dir.join("old.jsonl");
    std::fs::write(&old, assistant_line("/work/alpha", "from before")).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    let fresh = project_dir.join("new.jsonl");
    std::fs::write(&fresh, "{\"type\":\"file-history-snapshot\",\"snapshot\":{}}\n").unwrap();

    let index = Arc::new(SessionIndex::new(&paths));

    // The metadata-only file is still the newest and must be picked.
    let (session_id, latest) = index.latest_session_file_for_cwd("/work/alpha").await.unwrap();
    assert_eq!(session_id, "new");
    assert_eq!(latest, fresh);

    // Arm a watch against the stale file; the compaction poll must re-arm
    // against new.jsonl with baseline 0 within 3.5 s of rotation.
    let surface = Arc::new(test_surface::NullSurface);
    let notifier = spawn_notifier(surface);
    let manager = Arc::new(WatcherManager::new(index.clone(), notifier));
    index.write_attached("old", "/work/alpha").await.unwrap();

    let texts: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let completions = Arc::new(AtomicUsize::new(0));
    let texts_cb = texts.clone();
    let completions_cb = completions.clone();

    let old_size = std::fs::metadata(&old).unwrap().len();
    manager
        .start_injection_watcher(
            &AttachedSession {
                session_id: "old".into(),
                cwd: "/work/alpha".into(),
            },
            7,
            WatchHooks {
                on_text: Some(Arc::new(move |turn_text: turn::TurnText| {
                    texts_cb.lock().unwrap().push(turn_text.text);
                })),
                on_complete: Some(Box::new(move || {
                    completions_cb.fetch_add(1, Ordering::SeqCst);
                })),
            },
            Some(Baseline {
                file_path: old.clone(),
                session_id: "old".into(),
                size: old_size,
            }),
        )
        .await;

    // Content already in new.jsonl before the re-arm must be seen, because
    // the rotated watch starts from byte 0.
    append(&fresh, &assistant_line("/work/alpha", "after rotation"));

    assert!(
        wait_until(Duration::from_millis(4500), || {
            texts.lock().unwrap().contains(&"after rotation".to_string())
        })
        .await,
        "compaction poll should re-arm on the rotated file"
    );

    manager.stop_and_flush();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(completions.load(Ordering::SeqCst), 1, "exactly one completion");
}

mod test_surface {
    use async_trait::async_trait;
    use ccbridge_core::notify_surface::{ChatSurface, InlineButton, MessageRef};

    pub struct NullSurface;

    #[async_trait]
    impl ChatSurface for NullSurface {
        async fn send_text(&self, chat_id: i64, _text: &str) -> anyhow::Result<MessageRef> {
            Ok(MessageRef {
                chat_id,
                message_id: 0,
            })
        }
        async fn send_text_with_keyboard(
            &self,
            chat_id: i64,
            _text: &str,
            _keyboard: &[Vec<InlineButton>],
        ) -> anyhow::Result<MessageRef> {
            Ok(MessageRef {
                chat_id,
                message_id: 0,
            })
        }
        async fn edit_text(&self, _message: &MessageRef, _text: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn edit_keyboard(
            &self,
            _message: &MessageRef,
            _keyboard: &[Vec<InlineButton>],
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn send_photo(
            &self,
            _chat_id: i64,
            _data: Vec<u8>,
            _caption: Option<&str>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn send_voice(&self, _chat_id: i64, _data: Vec<u8>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn send_typing(&self, _chat_id: i64) -> anyhow::Result<()> {
            Ok(())
        }
        async fn answer_callback(&self, _callback_id: &str, _text: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn download_file(
            &self,
            _file_id: &str,
        ) -> anyhow::Result<(Vec<u8>, Option<String>)> {
            Ok((Vec::new(), None))
        }
    }
}
