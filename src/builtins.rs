//! ビルトインコマンドの実装。
//!
//! ビルトインは fork/exec を経由せずシェルプロセス内で直接実行される。
//! `try_exec()` が `Some(status)` を返せばビルトインとして処理済み、
//! `None` なら外部コマンドとして executor に委ねる。
//!
//! ディスパッチはコマンド名のハッシュ（位置依存の乗数付き加算）で
//! 一致候補を絞り、名前の完全一致で確定する。出力先は呼び出し側から
//! `Write` として注入され、テストではバッファに差し替えられる。

use std::env;
use std::io::Write;
use std::path::Path;

use crate::job::{self, JobState};
use crate::shell::Shell;

// ── コマンドハッシュ ─────────────────────────────────────────────────

const CD: i32 = 0x15d9;
const CBG: i32 = 0x1665;
const CFG: i32 = 0x1681;
const HASH: i32 = 0x47ee6;
const HELP: i32 = 0x4c151;
const ECHO: i32 = 0x4b21d;
const EXIT: i32 = 0x4e65e;
const JOBS: i32 = 0x4d206;
/// `echo $?` の置換対象を示す番兵ハッシュ。
const ECHO_STATUS: i32 = 0xd0b;

/// コマンド名のハッシュを計算する。
///
/// 各バイトに 7 の冪を掛けて加算し、`i32::MAX` で剰余を取る。
/// 乗数はラップアラウンドさせる（衝突は名前比較で排除される）。
pub fn hash_cmd(s: &str) -> i32 {
    let mut hash: i32 = 0;
    let mut mult: i32 = 7;
    for &c in s.as_bytes() {
        hash = hash.wrapping_add((c as i32).wrapping_mul(mult)) % i32::MAX;
        mult = mult.wrapping_mul(7);
    }
    hash
}

// ── ディスパッチ ─────────────────────────────────────────────────────

/// ビルトインコマンドの実行を試みる。
///
/// 戻り値:
/// - `Some(status)` — ビルトインとして実行済み
/// - `None` — 該当するビルトインなし（外部コマンドとして実行すべき）
pub fn try_exec(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> Option<i32> {
    let name = args[0];
    match hash_cmd(name) {
        CD if name == "cd" => Some(builtin_cd(args)),
        ECHO if name == "echo" => Some(builtin_echo(shell, args, out)),
        EXIT if name == "exit" => Some(builtin_exit(shell)),
        HELP if name == "help" => Some(builtin_help(out)),
        HASH if name == "hash" => Some(builtin_hash(args, out)),
        JOBS if name == "jobs" => Some(builtin_jobs(shell, out)),
        CFG if name == "fg" => Some(job_control(shell, args.get(1).copied(), false, out)),
        CBG if name == "bg" => Some(job_control(shell, args.get(1).copied(), true, out)),
        _ => None,
    }
}

// ── 各ビルトイン ─────────────────────────────────────────────────────

/// `cd [dir]` — カレントディレクトリを変更する。引数省略時は何もしない。
fn builtin_cd(args: &[&str]) -> i32 {
    let dir = match args.get(1) {
        Some(dir) => *dir,
        None => return 0,
    };

    match env::set_current_dir(Path::new(dir)) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Unable to change directory: {e} ({dir})");
            1
        }
    }
}

/// `echo [$? | arg ...]` — 引数を空白区切りで出力する。
///
/// 先頭引数が `$?` なら直前の終了ステータスと空白を先に出力する。
/// 引数なしは何も出力しない。
fn builtin_echo(shell: &Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    if args.len() == 1 {
        return 0;
    }

    let mut rest = &args[1..];
    if hash_cmd(rest[0]) == ECHO_STATUS && rest[0] == "$?" {
        let _ = write!(out, "{} ", shell.last_status);
        rest = &rest[1..];
    }

    let _ = writeln!(out, "{}", rest.join(" "));
    0
}

/// `exit` — シェルを終了させる。REPL ループが終了コード 0 で抜ける。
fn builtin_exit(shell: &mut Shell) -> i32 {
    shell.should_exit = true;
    0
}

/// `help` — ビルトイン一覧とキーボードショートカットを表示する。
fn builtin_help(out: &mut dyn Write) -> i32 {
    let _ = writeln!(
        out,
        "marsh - a job-controlling mini shell\n\n\
         These shell commands are defined internally.\n\n\
         \tcd [dir]\n\
         \techo [$? | arg ...]\n\
         \texit\n\
         \thash [text]\n\
         \tjobs\n\
         \tfg [name]\n\
         \tbg [name]\n\
         \thelp\n\n\
         Keyboard shortcuts:\n\
         \t- Ctrl-Z: Suspend the current foreground job\n\
         \t- Ctrl-C: Interrupt the current foreground job\n",
    );
    0
}

/// `hash <text>` — コマンドハッシュを 16 進で表示する。
fn builtin_hash(args: &[&str], out: &mut dyn Write) -> i32 {
    match args.get(1) {
        Some(text) => {
            let _ = writeln!(out, "{:x}", hash_cmd(text));
            0
        }
        None => {
            eprintln!("hash: no argument to hash");
            1
        }
    }
}

/// `jobs` — 使用中のジョブスロットをすべて表示する。
fn builtin_jobs(shell: &Shell, out: &mut dyn Write) -> i32 {
    for job in shell.jobs.iter() {
        let _ = writeln!(out, "{}", job.format_line());
    }
    0
}

// ── fg / bg ──────────────────────────────────────────────────────────

/// `fg [name]` / `bg [name]` の共通実装。
///
/// 名前指定ならラベルが一致する最初のジョブ、省略なら記憶している最終ジョブ
/// （死んでいれば走査で補充）のうち最も新しい（pid が最大の）未完了ジョブを
/// 選ぶ。`bg` を実行中のジョブへ適用するのはエラー。
fn job_control(shell: &mut Shell, name: Option<&str>, bg: bool, out: &mut dyn Write) -> i32 {
    let verb = if bg { "bg" } else { "fg" };

    let jid = match name {
        Some(name) => {
            match shell.jobs.iter().find(|j| j.cmd == name).map(|j| j.jid) {
                Some(jid) => jid,
                None => {
                    eprintln!("{verb}: job not found: {name}");
                    return 1;
                }
            }
        }
        None => {
            let mut candidate = shell
                .last_job
                .and_then(|jid| shell.jobs.get(jid))
                .filter(|j| j.state != JobState::Done)
                .map(|j| j.jid);

            if candidate.is_none() {
                candidate = shell
                    .jobs
                    .iter()
                    .find(|j| j.state != JobState::Done)
                    .map(|j| j.jid);
            }

            let mut jid = match candidate {
                Some(jid) => jid,
                None => {
                    eprintln!("{verb}: no job to resume");
                    return 1;
                }
            };

            // より新しい（pid が大きい）未完了ジョブがあればそちらを選ぶ
            let mut best_pid = shell.jobs.get(jid).map_or(0, |j| j.pid);
            for job in shell.jobs.iter() {
                if job.state != JobState::Done && job.pid >= best_pid {
                    best_pid = job.pid;
                    jid = job.jid;
                }
            }
            jid
        }
    };

    let (state, cmd) = match shell.jobs.get(jid) {
        Some(job) => (job.state, job.cmd.clone()),
        None => return 1,
    };

    if bg && state == JobState::Running {
        eprintln!("{cmd}: job already in background");
        return 1;
    }

    let _ = writeln!(out, "[{jid}]+ Resumed\t{cmd}");

    if bg {
        job::send_to_background(shell, jid);
    } else {
        job::send_to_foreground(shell, jid);
    }

    0
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_captured(shell: &mut Shell, args: &[&str]) -> (Option<i32>, String) {
        let mut buf: Vec<u8> = Vec::new();
        let status = try_exec(shell, args, &mut buf);
        (status, String::from_utf8(buf).unwrap())
    }

    // ── ハッシュ ──

    #[test]
    fn hash_matches_known_constants() {
        assert_eq!(hash_cmd("cd"), CD);
        assert_eq!(hash_cmd("bg"), CBG);
        assert_eq!(hash_cmd("fg"), CFG);
        assert_eq!(hash_cmd("hash"), HASH);
        assert_eq!(hash_cmd("help"), HELP);
        assert_eq!(hash_cmd("echo"), ECHO);
        assert_eq!(hash_cmd("exit"), EXIT);
        assert_eq!(hash_cmd("jobs"), JOBS);
        assert_eq!(hash_cmd("$?"), ECHO_STATUS);
    }

    #[test]
    fn hash_of_long_input_does_not_panic() {
        // 乗数がラップしても落ちない
        let _ = hash_cmd("a-very-long-command-name-that-wraps-the-multiplier");
    }

    // ── ディスパッチ ──

    #[test]
    fn unknown_command_is_not_builtin() {
        let mut shell = Shell::new();
        let (status, _) = exec_captured(&mut shell, &["ls"]);
        assert_eq!(status, None);
    }

    // ── echo ──

    #[test]
    fn echo_joins_arguments() {
        let mut shell = Shell::new();
        let (status, out) = exec_captured(&mut shell, &["echo", "hello", "world"]);
        assert_eq!(status, Some(0));
        assert_eq!(out, "hello world\n");
    }

    #[test]
    fn echo_without_arguments_prints_nothing() {
        let mut shell = Shell::new();
        let (status, out) = exec_captured(&mut shell, &["echo"]);
        assert_eq!(status, Some(0));
        assert_eq!(out, "");
    }

    #[test]
    fn echo_status_substitution() {
        let mut shell = Shell::new();
        shell.last_status = 7;
        let (status, out) = exec_captured(&mut shell, &["echo", "$?", "done"]);
        assert_eq!(status, Some(0));
        assert_eq!(out, "7 done\n");
    }

    // ── exit ──

    #[test]
    fn exit_sets_flag() {
        let mut shell = Shell::new();
        let (status, _) = exec_captured(&mut shell, &["exit"]);
        assert_eq!(status, Some(0));
        assert!(shell.should_exit);
    }

    // ── cd ──

    #[test]
    fn cd_without_argument_is_noop() {
        let before = env::current_dir().unwrap();
        let status = builtin_cd(&["cd"]);
        assert_eq!(status, 0);
        assert_eq!(env::current_dir().unwrap(), before);
    }

    #[test]
    fn cd_to_missing_directory_fails() {
        let status = builtin_cd(&["cd", "/definitely/not/a/directory"]);
        assert_eq!(status, 1);
    }

    // ── hash ──

    #[test]
    fn hash_prints_hex() {
        let mut shell = Shell::new();
        let (status, out) = exec_captured(&mut shell, &["hash", "cd"]);
        assert_eq!(status, Some(0));
        assert_eq!(out, "15d9\n");
    }

    #[test]
    fn hash_without_argument_fails() {
        let mut shell = Shell::new();
        let (status, out) = exec_captured(&mut shell, &["hash"]);
        assert_eq!(status, Some(1));
        assert_eq!(out, "");
    }

    // ── jobs ──

    #[test]
    fn jobs_lists_occupied_slots() {
        let mut shell = Shell::new();
        shell.jobs.register(100, 100, true, "sleep");
        shell.jobs.register(200, 200, true, "cat");
        let (status, out) = exec_captured(&mut shell, &["jobs"]);
        assert_eq!(status, Some(0));
        assert_eq!(
            out,
            "[0]+ Running\tsleep\tPID: 100\n[1]+ Running\tcat\tPID: 200\n",
        );
    }

    // ── fg / bg ──

    #[test]
    fn fg_without_jobs_fails() {
        let mut shell = Shell::new();
        let (status, out) = exec_captured(&mut shell, &["fg"]);
        assert_eq!(status, Some(1));
        assert_eq!(out, "");
    }

    #[test]
    fn bg_on_running_job_fails() {
        let mut shell = Shell::new();
        shell.jobs.register(100, 100, true, "sleep");
        let (status, out) = exec_captured(&mut shell, &["bg"]);
        assert_eq!(status, Some(1));
        assert_eq!(out, "");
    }

    #[test]
    fn bg_by_name_not_found() {
        let mut shell = Shell::new();
        let (status, _) = exec_captured(&mut shell, &["bg", "nosuch"]);
        assert_eq!(status, Some(1));
    }

    #[test]
    fn bg_resumes_stopped_job() {
        let mut shell = Shell::new();
        // 存在しない PID なので SIGCONT は届かないが、状態遷移だけ検証する
        let jid = shell.jobs.register(99999999, 99999999, true, "sleep").unwrap();
        shell.jobs.get_mut(jid).unwrap().state = JobState::Stopped;
        shell.last_job = Some(jid);

        let (status, out) = exec_captured(&mut shell, &["bg"]);
        assert_eq!(status, Some(0));
        assert_eq!(out, "[0]+ Resumed\tsleep\n");
        assert_eq!(shell.jobs.get(jid).unwrap().state, JobState::Running);
    }
}
