//! シグナル配送: ハンドラの登録・解除と非同期シグナルの振り分け。
//!
//! シェルは SIGCHLD / SIGINT / SIGTSTP / SIGTTIN / SIGTTOU を捕捉する。
//! ハンドラ内で行えるのは async-signal-safe な操作だけなので、
//! ジョブテーブルの更新はここでは行わない:
//!
//! - SIGCHLD → atomic フラグを立て self-pipe に 1 バイト書く。
//!   reap 本体はメインループが [`take_child_event`] を見て実行する。
//! - SIGINT / SIGTSTP → atomic に複製されたフォアグラウンド PID へ転送する。
//!   停止の記帳は `waitpid(WUNTRACED)` の復帰側で行われる。
//! - SIGTTIN / SIGTTOU → ターミナル制御をシェルのグループへ取り戻す。
//!
//! フォアグラウンドジョブの待機中は [`install_default`] で 5 シグナルとも
//! OS デフォルトに戻し、復帰時に [`install_handlers`] で再登録する。

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Once;

use libc::{c_int, pid_t};

/// シェルが捕捉するシグナル一覧。登録・解除はこの順で行う。
const SIGNALS: [c_int; 5] = [
    libc::SIGCHLD,
    libc::SIGINT,
    libc::SIGTSTP,
    libc::SIGTTIN,
    libc::SIGTTOU,
];

// ハンドラから参照されるミラー。メインスレッドだけが書き込む。
static FG_PID: AtomicI32 = AtomicI32::new(0);
static SHELL_PGID: AtomicI32 = AtomicI32::new(0);
static TERMINAL_FD: AtomicI32 = AtomicI32::new(-1);

// SIGCHLD の保留フラグと起床用 self-pipe
static CHLD_PENDING: AtomicBool = AtomicBool::new(false);
static WAKE_READ: AtomicI32 = AtomicI32::new(-1);
static WAKE_WRITE: AtomicI32 = AtomicI32::new(-1);

static PIPE_INIT: Once = Once::new();

// ── 初期化 ───────────────────────────────────────────────────────────

/// シグナル配送を初期化する。シェル初期化シーケンスから一度だけ呼ばれる。
///
/// self-pipe（O_CLOEXEC | O_NONBLOCK）を作成し、ハンドラが参照する
/// シェルのプロセスグループとターミナル fd を複製してから、
/// カスタムハンドラ一式を登録する。
pub fn init(shell_pgid: pid_t, terminal_fd: i32) {
    PIPE_INIT.call_once(|| {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if ret < 0 {
            eprintln!(
                "marsh: unable to set up signal pipe: {}",
                io::Error::last_os_error(),
            );
            return;
        }
        WAKE_READ.store(fds[0], Ordering::SeqCst);
        WAKE_WRITE.store(fds[1], Ordering::SeqCst);
    });

    SHELL_PGID.store(shell_pgid, Ordering::SeqCst);
    TERMINAL_FD.store(terminal_fd, Ordering::SeqCst);

    install_handlers();
}

// ── ハンドラの登録・解除 ─────────────────────────────────────────────

/// 5 シグナルへ同じ disposition を設定する。
fn install(disposition: libc::sighandler_t, flags: c_int) {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = flags;
        action.sa_sigaction = disposition;

        for &sig in &SIGNALS {
            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                eprintln!(
                    "marsh: unable to register signal handler: {}",
                    io::Error::last_os_error(),
                );
            }
        }
    }
}

/// シェルのカスタムハンドラ一式を登録する。
///
/// SA_RESTART を指定し、ブロッキングプリミティブが EINTR で中断されない
/// ようにする。
pub fn install_handlers() {
    install(handle_signal as extern "C" fn(c_int) as libc::sighandler_t, libc::SA_RESTART);
}

/// 5 シグナルを OS デフォルトに戻す。
///
/// フォアグラウンドジョブへターミナルを渡す間、および fork / spawn 直後の
/// 子プロセスで使う。
pub fn install_default() {
    install(libc::SIG_DFL, 0);
}

// ── フォアグラウンド PID ミラー ──────────────────────────────────────

/// ハンドラが SIGINT / SIGTSTP を転送する先を設定する。
pub fn set_foreground(pid: pid_t) {
    FG_PID.store(pid, Ordering::SeqCst);
}

/// フォアグラウンドジョブの記録をクリアする。評価の終わりに呼ばれる。
pub fn clear_foreground() {
    FG_PID.store(0, Ordering::SeqCst);
}

// ── SIGCHLD イベント ─────────────────────────────────────────────────

/// SIGCHLD が保留されていれば true を返し、保留状態を消費する。
///
/// self-pipe に溜まったバイトもここで読み捨てる。メインループが
/// reap を走らせるかどうかの判定に使う。
pub fn take_child_event() -> bool {
    if !CHLD_PENDING.swap(false, Ordering::SeqCst) {
        return false;
    }

    let fd = WAKE_READ.load(Ordering::SeqCst);
    if fd >= 0 {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    true
}

// ── ハンドラ本体 ─────────────────────────────────────────────────────

/// シグナルハンドラ。async-signal-safe な操作のみ行う。
extern "C" fn handle_signal(signo: c_int) {
    match signo {
        // 子プロセスの状態変化: フラグを立て、self-pipe で起床させる
        libc::SIGCHLD => {
            CHLD_PENDING.store(true, Ordering::SeqCst);
            let fd = WAKE_WRITE.load(Ordering::SeqCst);
            if fd >= 0 {
                let byte = [1u8];
                unsafe {
                    libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
                }
            }
        }

        // フォアグラウンドジョブへ転送
        libc::SIGINT | libc::SIGTSTP => {
            let pid = FG_PID.load(Ordering::SeqCst);
            if pid > 0 {
                unsafe {
                    libc::kill(pid, signo);
                }
            }
        }

        // ターミナル制御をシェルへ取り戻す
        libc::SIGTTIN | libc::SIGTTOU => {
            let pgid = SHELL_PGID.load(Ordering::SeqCst);
            let fd = TERMINAL_FD.load(Ordering::SeqCst);
            if pgid > 0 && fd >= 0 {
                unsafe {
                    libc::tcsetpgrp(fd, pgid);
                }
            }
        }

        _ => {}
    }
}

// ── Tests ───────────────────────────────────────────────────────────
