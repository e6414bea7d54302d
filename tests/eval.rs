//! 評価器のエンドツーエンドテスト。
//!
//! 実プロセスを spawn し、リダイレクト先のファイル経由で出力を観測する。
//! プロセス全体の標準 fd やカレントディレクトリを触るため、
//! すべてのテストをひとつのロックで直列化する。

use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use marsh::executor;
use marsh::job::{self, JobState, MAXJOBS};
use marsh::parser;
use marsh::shell::Shell;

static PROCESS_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> MutexGuard<'static, ()> {
    PROCESS_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// テストランナーのターミナルへ触らないシェルを作る。
fn test_shell() -> Shell {
    let mut shell = Shell::new();
    shell.terminal_fd = -1;
    shell
}

fn eval(shell: &mut Shell, line: &str) -> i32 {
    let expr = parser::parse(line).unwrap().unwrap();
    executor::evaluate(shell, &expr)
}

/// ファイルが期待した内容になるまで待つ（バックグラウンドステージ用）。
fn wait_for_file(path: &Path, expected: &str) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let content = fs::read_to_string(path).unwrap_or_default();
        if content == expected || Instant::now() > deadline {
            return content;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

// ── 単純コマンドとビルトイン ─────────────────────────────────────────

#[test]
fn echo_writes_through_redirect() {
    let _g = lock();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let mut shell = test_shell();

    let status = eval(&mut shell, &format!("echo hello > {}", out.display()));
    assert_eq!(status, 0);
    assert_eq!(fs::read_to_string(&out).unwrap(), "hello\n");
}

#[test]
fn external_command_statuses() {
    let _g = lock();
    let mut shell = test_shell();
    assert_eq!(eval(&mut shell, "true"), 0);
    assert_eq!(eval(&mut shell, "false"), 1);
}

#[test]
fn last_status_feeds_echo_substitution() {
    let _g = lock();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let mut shell = test_shell();

    eval(&mut shell, "false");
    eval(&mut shell, &format!("echo $? > {}", out.display()));
    assert_eq!(fs::read_to_string(&out).unwrap(), "1 \n");
}

#[test]
fn cd_changes_working_directory() {
    let _g = lock();
    let dir = tempfile::tempdir().unwrap();
    let before = std::env::current_dir().unwrap();
    let mut shell = test_shell();

    let status = eval(&mut shell, &format!("cd {}", dir.path().display()));
    assert_eq!(status, 0);
    assert_eq!(
        std::env::current_dir().unwrap().canonicalize().unwrap(),
        dir.path().canonicalize().unwrap(),
    );

    std::env::set_current_dir(before).unwrap();
}

// ── 短絡評価 ─────────────────────────────────────────────────────────

#[test]
fn and_or_short_circuit_observable() {
    let _g = lock();
    let dir = tempfile::tempdir().unwrap();
    let skipped = dir.path().join("skipped");
    let ran = dir.path().join("ran");
    let mut shell = test_shell();

    // 左辺が失敗 → 右辺は走らない
    let status = eval(&mut shell, &format!("false && echo x > {}", skipped.display()));
    assert_ne!(status, 0);
    assert!(!skipped.exists());

    // 左辺が成功 → 右辺が走る
    let status = eval(&mut shell, &format!("true && echo x > {}", ran.display()));
    assert_eq!(status, 0);
    assert_eq!(fs::read_to_string(&ran).unwrap(), "x\n");
}

// ── リダイレクト ─────────────────────────────────────────────────────

#[test]
fn redirect_roundtrip_through_file() {
    let _g = lock();
    let dir = tempfile::tempdir().unwrap();
    let t1 = dir.path().join("t1");
    let t2 = dir.path().join("t2");
    let mut shell = test_shell();

    let line = format!(
        "echo a > {t1} ; cat < {t1} > {t2}",
        t1 = t1.display(),
        t2 = t2.display(),
    );
    let status = eval(&mut shell, &line);
    assert_eq!(status, 0);
    assert_eq!(fs::read_to_string(&t2).unwrap(), "a\n");
}

#[test]
fn append_redirect_accumulates() {
    let _g = lock();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let mut shell = test_shell();

    eval(&mut shell, &format!("echo a > {}", out.display()));
    eval(&mut shell, &format!("echo b >> {}", out.display()));
    assert_eq!(fs::read_to_string(&out).unwrap(), "a\nb\n");
}

#[test]
fn stderr_redirect_captures_diagnostics() {
    let _g = lock();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let mut shell = test_shell();

    let line = format!("sh -c 'echo oops 1>&2' &> {}", out.display());
    let status = eval(&mut shell, &line);
    assert_eq!(status, 0);
    assert_eq!(wait_for_file(&out, "oops\n"), "oops\n");
}

#[test]
fn missing_input_file_fails_without_running_command() {
    let _g = lock();
    let mut shell = test_shell();
    let status = eval(&mut shell, "cat < /definitely/not/a/file");
    assert_ne!(status, 0);
}

#[test]
fn std_fds_survive_redirections() {
    let _g = lock();

    fn fd_identity(fd: i32) -> (libc::dev_t, libc::ino_t) {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        assert_eq!(unsafe { libc::fstat(fd, &mut st) }, 0);
        (st.st_dev, st.st_ino)
    }

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let before: Vec<_> = (0..3).map(fd_identity).collect();

    let mut shell = test_shell();
    eval(&mut shell, &format!("echo x > {0} ; cat < {0} &> /dev/null", out.display()));

    let after: Vec<_> = (0..3).map(fd_identity).collect();
    assert_eq!(before, after);
}

// ── パイプライン ─────────────────────────────────────────────────────

#[test]
fn pipeline_connects_stages() {
    let _g = lock();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let mut shell = test_shell();

    let status = eval(&mut shell, &format!("echo one | cat > {}", out.display()));
    assert_eq!(status, 0);
    assert_eq!(wait_for_file(&out, "one\n"), "one\n");
}

#[test]
fn pipeline_three_stages() {
    let _g = lock();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let mut shell = test_shell();

    let status = eval(&mut shell, &format!("echo abc | cat | cat > {}", out.display()));
    assert_eq!(status, 0);
    assert_eq!(wait_for_file(&out, "abc\n"), "abc\n");
}

#[test]
fn pipeline_status_is_leftmost_stage() {
    let _g = lock();
    let mut shell = test_shell();
    assert_eq!(eval(&mut shell, "false | cat"), 1);
    assert_eq!(eval(&mut shell, "true | cat"), 0);
}

#[test]
fn pipeline_under_input_redirect_does_not_hang() {
    let _g = lock();
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    let out = dir.path().join("out");
    fs::write(&input, "line\n").unwrap();
    let mut shell = test_shell();

    let line = format!(
        "cat < {input} | cat > {out}",
        input = input.display(),
        out = out.display(),
    );
    let status = eval(&mut shell, &line);
    assert_eq!(status, 0);
    assert_eq!(wait_for_file(&out, "line\n"), "line\n");
}

// ── バックグラウンドジョブ ───────────────────────────────────────────

#[test]
fn background_job_lifecycle() {
    let _g = lock();
    let mut shell = test_shell();

    let status = eval(&mut shell, "sleep 0.2 &");
    assert_eq!(status, 0);

    // ジョブテーブルに登録されている
    let job = shell.jobs.iter().find(|j| j.cmd == "sleep").expect("job registered");
    assert!(job.background);
    let pid = job.pid;
    assert_eq!(shell.jobs.find(pid), Some(job.jid));

    // 完了を reap で観測する
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        job::reap_jobs(&mut shell.jobs);
        match shell.jobs.find(pid).and_then(|jid| shell.jobs.get(jid)) {
            Some(job) if job.state == JobState::Done => break,
            Some(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            other => panic!("job lost before completion: {other:?}"),
        }
    }

    // Done スロットは通知パスで解放される
    job::notify_and_clean(&mut shell.jobs, false);
    assert!(shell.jobs.find(pid).is_none());
}

#[test]
fn background_sequence_runs_to_completion() {
    let _g = lock();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let mut shell = test_shell();

    let status = eval(&mut shell, &format!("sleep 0.1 && echo done > {} &", out.display()));
    assert_eq!(status, 0);

    // 親には Sequence ジョブとして登録される
    assert!(shell.jobs.iter().any(|j| j.cmd == "Sequence"));
    assert_eq!(wait_for_file(&out, "done\n"), "done\n");
}

#[test]
fn job_table_overflow_reports_error() {
    let _g = lock();
    let mut shell = test_shell();

    // 全スロットを生きた PID（自分自身）で埋める
    let own_pid = std::process::id() as libc::pid_t;
    for _ in 0..MAXJOBS {
        assert!(shell.jobs.register(own_pid, own_pid, true, "filler").is_some());
    }

    let status = eval(&mut shell, "sleep 0.1 &");
    assert_eq!(status, 1);
}

// ── シグナル死 ───────────────────────────────────────────────────────

#[test]
fn foreground_segfault_yields_signal_status() {
    let _g = lock();
    let mut shell = test_shell();
    let status = eval(&mut shell, "sh -c 'kill -SEGV $$'");
    assert_eq!(status, 128 + libc::SIGSEGV);
}

#[test]
fn foreground_termination_yields_signal_status() {
    let _g = lock();
    let mut shell = test_shell();
    let status = eval(&mut shell, "sh -c 'kill -TERM $$'");
    assert_eq!(status, 128 + libc::SIGTERM);
}
