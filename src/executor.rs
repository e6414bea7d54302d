//! コマンド評価器: コマンドツリーを再帰的に辿り、シーケンス条件付き実行、
//! パイプライン接続、リダイレクト適用、ビルトイン判定、ジョブ起動を行う。
//!
//! ## 評価の流れ
//!
//! - [`evaluate`]: トップレベル。初回呼び出しでシェルを初期化し、
//!   ツリーを評価 → reap → ステータス正規化 → 通知 → Done スロット解放。
//! - [`eval_expr`]: ノード種別によるディスパッチ。
//! - シーケンス（`;` / `&&` / `||`）: 左辺のステータスで右辺の実行を決める。
//!   バックグラウンド文脈では fork した子がシーケンス全体を前面実行する。
//! - パイプ: 読み端を stdin に配線して右辺を BG 起動 → 書き端を stdout に
//!   配線して左辺を実行。ステータスは最左ステージのもの。
//! - リダイレクト: 標準 fd 3 本を close-on-exec で退避 → 対象を開いて配線 →
//!   部分木を評価 → 復元。
//!
//! ## 内部ステータス
//!
//! ジョブを起動しただけでまだ終了コードを持たない評価は
//! [`INTERN_STATUS`] を返す。[`normalize_status`] が負の内部値を
//! `-INTERN_STATUS` だけずらし、ユーザに見える `$?` には 0 以上の値だけが
//! 届く（OS 失敗の -1 は 127 になる）。

use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::IntoRawFd;

use crate::builtins;
use crate::job;
use crate::parser::{Expr, RedirKind, SeqOp};
use crate::shell::Shell;
use crate::signal;
use crate::spawn;

/// ジョブ起動済み・終了コード未確定を表す内部ステータス。
pub const INTERN_STATUS: i32 = -128;

/// 内部ステータスをユーザに見える終了コードへ変換する。
///
/// `INTERN_STATUS → 0`、`INTERN_STATUS + 1 → 1`、OS 失敗の `-1 → 127`。
/// 0 以上の実ステータスはそのまま通す。
pub fn normalize_status(status: i32) -> i32 {
    if status < 0 {
        status - INTERN_STATUS
    } else {
        status
    }
}

// ── トップレベルドライバ ─────────────────────────────────────────────

/// コマンドツリーを 1 本評価し、終了ステータスを返す。
///
/// 初回呼び出しでシグナル・プロセスグループ・ターミナルの初期化を行う。
/// 評価後は reap パスを走らせ、フォアグラウンドジョブの異常終了を通知し、
/// Done のバックグラウンドスロットを（インタラクティブなら通知付きで）
/// 解放する。戻り値は `shell.last_status` にも反映される。
pub fn evaluate(shell: &mut Shell, expr: &Expr<'_>) -> i32 {
    if !shell.initialized {
        init_shell(shell);
    }

    let mut status = eval_expr(shell, expr, false, shell.interactive);

    job::reap_jobs(&mut shell.jobs);

    status = normalize_status(status);

    // フォアグラウンドジョブが異常終了していればそちらのステータスを優先
    if let Some(fg) = shell.fg_job.and_then(|jid| shell.jobs.get(jid)) {
        if fg.status != 0 {
            status = fg.status;
        }
    }

    shell.last_status = status;

    // フォアグラウンドジョブのシグナル死を通知
    if shell.interactive {
        if let Some(fg) = shell.fg_job.and_then(|jid| shell.jobs.get(jid)) {
            match fg.termsig {
                Some(libc::SIGSEGV) => eprintln!("{}: Segmentation fault.", fg.cmd),
                Some(libc::SIGKILL) | Some(libc::SIGTERM) => eprintln!("{}: Terminated.", fg.cmd),
                _ => {}
            }
        }
    }

    job::notify_and_clean(&mut shell.jobs, shell.interactive);

    // 解放済みスロットを指したままの最終ジョブ記録は捨てる
    if shell.last_job.is_some_and(|jid| shell.jobs.get(jid).is_none()) {
        shell.last_job = None;
    }

    shell.fg_job = None;
    signal::clear_foreground();

    status
}

/// シェルの初期化シーケンス。最初の評価で一度だけ走る。
///
/// 自身をプロセスグループリーダーにし、ターミナルを掌握できなければ
/// 非インタラクティブモードへ落とす。プロセスグループの確立に再試行しても
/// 失敗した場合のみ致命的エラーとしてプロセスを終える。
fn init_shell(shell: &mut Shell) {
    shell.pid = unsafe { libc::getpid() };

    let mut attempts = 0;
    loop {
        if unsafe { libc::setpgid(shell.pid, shell.pid) } == 0
            || unsafe { libc::getpgrp() } == shell.pid
        {
            break;
        }
        attempts += 1;
        if attempts >= 2 {
            eprintln!(
                "marsh: unable to put the shell in its own process group: {}",
                io::Error::last_os_error(),
            );
            std::process::exit(1);
        }
    }
    shell.pgid = unsafe { libc::getpgrp() };

    // ターミナルを掌握できなければ非インタラクティブとして動く
    if unsafe { libc::tcsetpgrp(shell.terminal_fd, shell.pgid) } < 0 {
        shell.interactive = false;
    }

    signal::init(shell.pgid, shell.terminal_fd);

    shell.initialized = true;
}

// ── ノードディスパッチ ───────────────────────────────────────────────

/// ノード種別によるディスパッチ。`background` は評価文脈が `&` の中か
/// どうか、`notify` はジョブ起動・完了をユーザへ表示するかどうか。
fn eval_expr(shell: &mut Shell, expr: &Expr<'_>, background: bool, notify: bool) -> i32 {
    match expr {
        Expr::Empty => INTERN_STATUS,
        Expr::Simple { args } => start_cmd(shell, args, background, notify),
        Expr::Seq { .. } => eval_sequence(shell, expr, background, notify),
        Expr::Pipe { left, right } => eval_pipeline(shell, left, right, background),
        Expr::Background { body } => eval_expr(shell, body, true, notify),
        Expr::Redirect { kind, target, body } => {
            eval_redirect(shell, *kind, target, body, background)
        }
    }
}

// ── シーケンス ───────────────────────────────────────────────────────

/// `;` / `&&` / `||` ノードを評価する。
///
/// バックグラウンド文脈では fork し、子がシーケンス全体をフォアグラウンドで
/// 評価して正規化済みステータスで exit する。親は子を `Sequence` ジョブとして
/// 登録して起動し、[`INTERN_STATUS`] を返す（`$?` を汚さないため）。
fn eval_sequence(shell: &mut Shell, expr: &Expr<'_>, background: bool, notify: bool) -> i32 {
    let (op, left, right) = match expr {
        Expr::Seq { op, left, right } => (*op, left.as_ref(), right.as_ref()),
        _ => return INTERN_STATUS,
    };

    if background {
        // fork で stdio バッファが二重に flush されないよう先に掃く
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            eprintln!("marsh: unable to fork: {}", io::Error::last_os_error());
            return -1;
        }

        if pid == 0 {
            // 子: デフォルトシグナル + 自身のグループでシーケンスを前面実行。
            // ターミナルの所有権は主張しない。
            signal::install_default();
            unsafe {
                libc::setpgid(0, 0);
            }
            shell.interactive = false;
            let status = normalize_status(eval_expr(shell, expr, false, false));
            std::process::exit(status);
        }

        let jid = match shell.jobs.register(pid, pid, true, "Sequence") {
            Some(jid) => jid,
            None => {
                eprintln!(
                    "unable to register a new job, terminate some jobs first (max: {})",
                    job::MAXJOBS,
                );
                return INTERN_STATUS + 1;
            }
        };

        job::launch_job(shell, jid, notify);
        return INTERN_STATUS;
    }

    let mut status = normalize_status(eval_expr(shell, left, false, false));

    match op {
        SeqOp::Always => status = eval_expr(shell, right, false, false),
        SeqOp::And if status == 0 => status = eval_expr(shell, right, false, false),
        SeqOp::Or if status != 0 => status = eval_expr(shell, right, false, false),
        _ => {}
    }

    normalize_status(status)
}

// ── パイプライン ─────────────────────────────────────────────────────

/// `dup2` の薄いラッパー。失敗時は文脈付きでエラーを報告する。
fn rewire(from: i32, to: i32, what: &str) -> bool {
    if unsafe { libc::dup2(from, to) } < 0 {
        eprintln!("marsh: {}: {}", what, io::Error::last_os_error());
        return false;
    }
    true
}

/// 開いている fd をまとめて閉じる（負の値は無視）。
fn close_fds(fds: &[i32]) {
    for &fd in fds {
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// fd を close-on-exec 付きで複製する。
///
/// 退避コピーが exec した子に漏れてパイプの EOF を失わせないための要。
fn dup_cloexec(fd: i32) -> i32 {
    unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) }
}

/// `A | B` を評価する。
///
/// 読み端を stdin に配線して B をバックグラウンドで起動し、stdin を復元
/// してから書き端を stdout に配線して A を呼び出し元の文脈で実行する。
/// パイプ両端は O_CLOEXEC で作り、配線後すぐシェル側のコピーを閉じる。
/// ステータスは最左ステージのもの。
fn eval_pipeline(shell: &mut Shell, left: &Expr<'_>, right: &Expr<'_>, background: bool) -> i32 {
    let mut pipefd = [0i32; 2];
    if unsafe { libc::pipe2(pipefd.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        eprintln!(
            "marsh: unable to set up pipe: {}",
            io::Error::last_os_error(),
        );
        return -1;
    }

    let saved_in = dup_cloexec(libc::STDIN_FILENO);
    let saved_out = dup_cloexec(libc::STDOUT_FILENO);
    if saved_in < 0 || saved_out < 0 {
        eprintln!(
            "marsh: unable to set up pipe: {}",
            io::Error::last_os_error(),
        );
        close_fds(&[pipefd[0], pipefd[1], saved_in, saved_out]);
        return -1;
    }

    // 読み端 → stdin、右辺をバックグラウンドで起動
    if !rewire(pipefd[0], libc::STDIN_FILENO, "unable to set up pipe") {
        close_fds(&[pipefd[0], pipefd[1], saved_in, saved_out]);
        return -1;
    }
    unsafe {
        libc::close(pipefd[0]);
    }
    eval_expr(shell, right, true, false);

    // stdin を復元し、書き端 → stdout で左辺を実行
    let wired = rewire(saved_in, libc::STDIN_FILENO, "unable to restore stdin")
        && rewire(pipefd[1], libc::STDOUT_FILENO, "unable to set up pipe");
    unsafe {
        libc::close(pipefd[1]);
    }
    if !wired {
        let _ = rewire(saved_out, libc::STDOUT_FILENO, "unable to restore stdout");
        close_fds(&[saved_in, saved_out]);
        return -1;
    }

    let status = eval_expr(shell, left, background, false);

    let _ = io::stdout().flush();
    let _ = rewire(saved_out, libc::STDOUT_FILENO, "unable to restore stdout");
    close_fds(&[saved_in, saved_out]);

    status
}

// ── リダイレクト ─────────────────────────────────────────────────────

/// リダイレクト対象ファイルを種別に応じたフラグで開く。
///
/// std の open は O_CLOEXEC 付きなので、exec した子に素の fd は漏れない。
fn open_redirect_target(kind: RedirKind, target: &str) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    match kind {
        RedirKind::Input => {
            opts.read(true);
        }
        RedirKind::Append => {
            opts.write(true).create(true).append(true);
        }
        RedirKind::Output | RedirKind::Stderr | RedirKind::StderrOut => {
            opts.write(true).create(true).truncate(true);
        }
    }
    opts.open(target)
}

/// リダイレクトノードを評価する。
///
/// 連鎖したリダイレクトが順に巻き戻せるよう、標準 fd は 3 本とも
/// 無条件に退避する。失敗時は `"<path>: <reason>"` を stderr に出して
/// -1 を返す（正規化後は非 0）。
fn eval_redirect(
    shell: &mut Shell,
    kind: RedirKind,
    target: &str,
    body: &Expr<'_>,
    background: bool,
) -> i32 {
    let saved_in = dup_cloexec(libc::STDIN_FILENO);
    let saved_out = dup_cloexec(libc::STDOUT_FILENO);
    let saved_err = dup_cloexec(libc::STDERR_FILENO);
    if saved_in < 0 || saved_out < 0 || saved_err < 0 {
        eprintln!("{}: {}", target, io::Error::last_os_error());
        close_fds(&[saved_in, saved_out, saved_err]);
        return -1;
    }

    let fd = match open_redirect_target(kind, target) {
        Ok(file) => file.into_raw_fd(),
        Err(e) => {
            eprintln!("{target}: {e}");
            close_fds(&[saved_in, saved_out, saved_err]);
            return -1;
        }
    };

    let wired = match kind {
        RedirKind::Input => rewire(fd, libc::STDIN_FILENO, target),
        RedirKind::Output | RedirKind::Append => rewire(fd, libc::STDOUT_FILENO, target),
        RedirKind::Stderr => rewire(fd, libc::STDERR_FILENO, target),
        RedirKind::StderrOut => {
            rewire(fd, libc::STDERR_FILENO, target) && rewire(fd, libc::STDOUT_FILENO, target)
        }
    };
    if !wired {
        close_fds(&[fd, saved_in, saved_out, saved_err]);
        return -1;
    }

    let status = eval_expr(shell, body, background, false);

    // 書き戻す前にビルトインの出力をバッファから掃き出す
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    let _ = rewire(saved_in, libc::STDIN_FILENO, "unable to restore stdin");
    let _ = rewire(saved_out, libc::STDOUT_FILENO, "unable to restore stdout");
    let _ = rewire(saved_err, libc::STDERR_FILENO, "unable to restore stderr");
    close_fds(&[fd, saved_in, saved_out, saved_err]);

    status
}

// ── コマンド起動 ─────────────────────────────────────────────────────

/// SIMPLE ノードを実行する。
///
/// まずビルトインを試し、該当しなければ `posix_spawnp` で外部コマンドを
/// 起動してジョブ登録する。フォアグラウンドなら完了（または停止）まで
/// 待ってジョブの終了コードを、バックグラウンドなら [`INTERN_STATUS`] を返す。
fn start_cmd(shell: &mut Shell, args: &[Cow<'_, str>], background: bool, notify: bool) -> i32 {
    let argv: Vec<&str> = args.iter().map(|arg| arg.as_ref()).collect();
    if argv.is_empty() {
        return INTERN_STATUS;
    }

    // ビルトインなら fork せずその場で実行
    if let Some(status) = builtins::try_exec(shell, &argv, &mut io::stdout()) {
        return status;
    }

    let pid = match spawn::spawn(&argv, 0) {
        Ok(pid) => pid,
        Err(e) => {
            eprintln!("{e}");
            return e.exit_status();
        }
    };

    let jid = match shell.jobs.register(pid, pid, background, argv[0]) {
        Some(jid) => jid,
        None => {
            eprintln!(
                "unable to register a new job, terminate some jobs first (max: {})",
                job::MAXJOBS,
            );
            return INTERN_STATUS + 1;
        }
    };

    job::launch_job(shell, jid, notify);

    if background {
        INTERN_STATUS
    } else {
        shell.jobs.get(jid).map_or(0, |job| job.status)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
