// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Drives the real process transport and control plane against small shell
//! scripts standing in for the assistant binary.

#![cfg(unix)]

use futures::StreamExt;
use grimoire_session::{
    AssistantConfig, Conversation, LineageState, RewindOptions, SessionError, TurnEvent,
    TurnFailureKind,
};
use serial_test::serial;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Records stdin, args and env per invocation, then emits a short turn on the
/// resumed session (or a new one when asked to fork).
const RECORDING_ASSISTANT: &str = r#"#!/bin/sh
dir="$(dirname "$0")"
n=$(cat "$dir/count" 2>/dev/null || echo 0)
n=$((n + 1))
echo "$n" > "$dir/count"
cat > "$dir/input-$n.jsonl"
echo "$@" > "$dir/args-$n.txt"
echo "${CLAUDE_CONFIG_DIR:-unset} ${CLAUDE_CODE_ENABLE_SDK_FILE_CHECKPOINTING:-unset}" > "$dir/env-$n.txt"
pwd > "$dir/cwd-$n.txt"
sid="sess-1"
prev=""
for arg in "$@"; do
  if [ "$prev" = "--resume" ]; then sid="$arg"; fi
  prev="$arg"
done
case " $* " in
  *" --fork-session "*) sid="sess-fork-$n" ;;
esac
echo '{"type":"system","subtype":"init","session_id":"'"$sid"'"}'
echo '{"type":"user","session_id":"'"$sid"'","uuid":"msg-'"$n"'","message":{"role":"user","content":[{"type":"text","text":"echo"}]}}'
echo 'this line is not json'
echo '{"type":"assistant","session_id":"'"$sid"'","message":{"content":[{"type":"text","text":"reply '"$n"'"}]}}'
echo '{"type":"result","subtype":"success","is_error":false,"result":"reply '"$n"'","session_id":"'"$sid"'"}'
"#;

const FAILING_ASSISTANT: &str = r#"#!/bin/sh
cat > /dev/null
echo "Invalid API key. Please run /login" >&2
exit 3
"#;

const TRUNCATED_ASSISTANT: &str = r#"#!/bin/sh
cat > /dev/null
echo '{"type":"system","subtype":"init","session_id":"sess-1"}'
echo '{"type":"assistant","session_id":"sess-1","message":{"content":[{"type":"text","text":"partial"}]}}'
exit 0
"#;

const HANGING_ASSISTANT: &str = r#"#!/bin/sh
cat > /dev/null
echo '{"type":"system","subtype":"init","session_id":"sess-1"}'
exec sleep 30
"#;

struct Fixture {
    bin_dir: TempDir,
    work_dir: TempDir,
    script: PathBuf,
}

impl Fixture {
    fn new(script: &str) -> Self {
        let bin_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let path = bin_dir.path().join("fake-claude");
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        Self {
            bin_dir,
            work_dir,
            script: path,
        }
    }

    fn config(&self) -> AssistantConfig {
        AssistantConfig::default().binary(&self.script)
    }

    fn conversation(&self) -> Conversation {
        Conversation::new(self.work_dir.path(), self.config())
    }

    fn recorded(&self, name: &str) -> String {
        read(&self.bin_dir.path().join(name))
    }
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

#[tokio::test]
#[serial]
async fn test_turn_round_trip_through_process() {
    let fixture = Fixture::new(RECORDING_ASSISTANT);
    let conversation = fixture.conversation();

    let transcript = conversation.send_message("hello").await.unwrap().collect_turn().await;
    assert_eq!(transcript.session_id(), Some("sess-1"));
    assert_eq!(transcript.checkpoints(), vec!["msg-1"]);
    assert_eq!(transcript.final_text(), Some("reply 1"));
    assert_eq!(conversation.session_id().as_deref(), Some("sess-1"));

    let input = fixture.recorded("input-1.jsonl");
    let envelope: serde_json::Value = serde_json::from_str(input.trim()).unwrap();
    assert_eq!(envelope["type"], "user");
    assert_eq!(envelope["message"]["content"][0]["text"], "hello");

    let args = fixture.recorded("args-1.txt");
    assert!(args.contains("--input-format stream-json"));
    assert!(args.contains("--replay-user-messages"));
    assert!(!args.contains("--resume"));

    assert!(fixture.recorded("env-1.txt").trim().ends_with(" 1"));

    let cwd = PathBuf::from(fixture.recorded("cwd-1.txt").trim());
    assert_eq!(
        cwd.canonicalize().unwrap(),
        fixture.work_dir.path().canonicalize().unwrap()
    );
}

#[tokio::test]
#[serial]
async fn test_second_turn_resumes_session() {
    let fixture = Fixture::new(RECORDING_ASSISTANT);
    let conversation = fixture.conversation();

    conversation.send_message("one").await.unwrap().collect_turn().await;
    conversation.send_message("two").await.unwrap().collect_turn().await;

    assert!(fixture.recorded("args-2.txt").contains("--resume sess-1"));
    assert_eq!(conversation.list_rewind_points().len(), 2);
}

#[tokio::test]
#[serial]
async fn test_config_dir_is_exported() {
    let fixture = Fixture::new(RECORDING_ASSISTANT);
    let config_dir = TempDir::new().unwrap();
    let conversation = Conversation::new(
        fixture.work_dir.path(),
        fixture.config().config_dir(config_dir.path()),
    );

    conversation.send_message("hello").await.unwrap().collect_turn().await;

    let env = fixture.recorded("env-1.txt");
    assert!(env.starts_with(&config_dir.path().display().to_string()));
}

#[tokio::test]
#[serial]
async fn test_fork_rewind_through_control_plane() {
    let fixture = Fixture::new(RECORDING_ASSISTANT);
    let conversation = fixture.conversation();

    conversation.send_message("one").await.unwrap().collect_turn().await;
    conversation.send_message("two").await.unwrap().collect_turn().await;

    let outcome = conversation
        .rewind("msg-1", RewindOptions::new().rewind_files(true))
        .await
        .unwrap();

    assert_eq!(outcome.session_id, "sess-fork-3");
    assert_eq!(conversation.list_rewind_points().len(), 1);
    // The script never answers the file rewind request
    assert!(outcome.file_warning.is_some());

    let args = fixture.recorded("args-3.txt");
    assert!(args.contains("--resume sess-1 --resume-session-at msg-1 --fork-session"));

    let input = fixture.recorded("input-3.jsonl");
    let records: Vec<serde_json::Value> = input
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0]["request"]["subtype"], "initialize");
    assert_eq!(records[1]["request"]["subtype"], "rewind_files");
    assert_eq!(records[1]["request"]["user_message_id"], "msg-1");
    assert_eq!(records[2]["message"]["content"][0]["text"], "continue");

    // Later turns resume the fork
    conversation.send_message("three").await.unwrap().collect_turn().await;
    assert!(fixture.recorded("args-4.txt").contains("--resume sess-fork-3"));
    assert_eq!(conversation.session_id().as_deref(), Some("sess-fork-3"));
}

#[tokio::test]
#[serial]
async fn test_failed_launch_reports_stderr() {
    let fixture = Fixture::new(FAILING_ASSISTANT);
    let conversation = fixture.conversation();

    let transcript = conversation.send_message("hello").await.unwrap().collect_turn().await;
    let failure = transcript.failure().expect("expected a failure").clone();
    assert_eq!(failure.kind, TurnFailureKind::ProcessLaunch);
    assert!(failure.stderr.unwrap().contains("Invalid API key"));
    assert!(matches!(conversation.state(), LineageState::Error { .. }));
    assert!(conversation.list_rewind_points().is_empty());
}

#[tokio::test]
#[serial]
async fn test_exit_without_result_is_incomplete() {
    let fixture = Fixture::new(TRUNCATED_ASSISTANT);
    let conversation = fixture.conversation();

    let transcript = conversation.send_message("hello").await.unwrap().collect_turn().await;
    assert_eq!(transcript.assistant_text(), "partial");
    assert_eq!(
        transcript.failure().map(|f| f.kind),
        Some(TurnFailureKind::Incomplete)
    );
    // A session was established, so the lineage stays active
    assert_eq!(conversation.session_id().as_deref(), Some("sess-1"));
}

#[tokio::test]
#[serial]
async fn test_abort_kills_running_turn() {
    let fixture = Fixture::new(HANGING_ASSISTANT);
    let conversation = fixture.conversation();

    let mut turn = conversation.send_message("hello").await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(10), turn.next())
        .await
        .unwrap();
    assert!(matches!(first, Some(TurnEvent::SessionMarker { .. })));

    turn.abort();
    let rest = tokio::time::timeout(Duration::from_secs(10), turn.collect_turn())
        .await
        .unwrap();
    assert!(rest.is_aborted());
    assert!(!conversation.is_busy());
}

#[tokio::test]
#[serial]
async fn test_missing_binary_fails_send() {
    let work_dir = TempDir::new().unwrap();
    let conversation = Conversation::new(
        work_dir.path(),
        AssistantConfig::default().binary("/nonexistent/grimoire/claude"),
    );

    let err = conversation.send_message("hello").await.unwrap_err();
    assert!(matches!(err, SessionError::ProcessLaunch { .. }));
    assert!(!conversation.is_busy());
}
