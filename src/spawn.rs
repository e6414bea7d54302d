//! `posix_spawnp()` の安全な Rust ラッパー。
//!
//! 外部コマンドの起動に `posix_spawnp` を使い、プロセスグループの割り当てと
//! シグナル disposition のリセットを exec 前の子プロセス内で原子的に行う。
//! リダイレクトとパイプはシェル側で標準 fd を配線してから spawn するため、
//! 子はそれをそのまま継承する。
//!
//! ## 構成
//!
//! | 型 | 役割 |
//! |-----|------|
//! | [`SpawnAttr`] | `posix_spawnattr_t` の RAII ラッパー（プロセスグループ、シグナル設定） |
//! | [`spawn`] | argv を組み立てて `posix_spawnp` を呼ぶ公開関数 |

use std::ffi::CString;

use thiserror::Error;

// ── エラー型 ──────────────────────────────────────────────────────

/// errno をユーザ向けの説明へ変換する。
fn errno_message(errno: &i32) -> &'static str {
    match *errno {
        libc::ENOENT => "command not found",
        libc::EACCES => "permission denied",
        _ => "spawn failed",
    }
}

/// `posix_spawnp` の失敗を表すエラー。
#[derive(Debug, Error)]
#[error("marsh: {command}: {}", errno_message(.errno))]
pub struct SpawnError {
    /// errno 値。
    pub errno: i32,
    /// コマンド名（エラーメッセージ用）。
    pub command: String,
}

impl SpawnError {
    /// エラーに対応する終了ステータスを返す。
    /// 127 = command not found, 126 = permission denied, 1 = その他。
    pub fn exit_status(&self) -> i32 {
        match self.errno {
            libc::ENOENT => 127,
            libc::EACCES => 126,
            _ => 1,
        }
    }
}

// ── SpawnAttr ─────────────────────────────────────────────────────

/// `posix_spawnattr_t` の RAII ラッパー。Drop で自動 destroy。
struct SpawnAttr {
    inner: libc::posix_spawnattr_t,
}

impl SpawnAttr {
    /// `posix_spawnattr_init` で初期化する。
    fn new() -> Self {
        unsafe {
            let mut attr: libc::posix_spawnattr_t = std::mem::zeroed();
            libc::posix_spawnattr_init(&mut attr);
            Self { inner: attr }
        }
    }

    /// プロセスグループを設定する。
    ///
    /// `POSIX_SPAWN_SETPGROUP` フラグを立て、子プロセスのプロセスグループを
    /// `pgid` に設定する。`pgid == 0` の場合、子の PID がグループリーダーになる。
    fn set_pgroup(&mut self, pgid: libc::pid_t) {
        unsafe {
            let mut flags: libc::c_short = 0;
            libc::posix_spawnattr_getflags(&self.inner, &mut flags);
            flags |= libc::POSIX_SPAWN_SETPGROUP as libc::c_short;
            libc::posix_spawnattr_setflags(&mut self.inner, flags);
            libc::posix_spawnattr_setpgroup(&mut self.inner, pgid);
        }
    }

    /// シグナルをデフォルトにリセットする。
    ///
    /// `POSIX_SPAWN_SETSIGDEF` フラグを立て、シェルが捕捉している
    /// SIGCHLD, SIGINT, SIGTSTP, SIGTTOU, SIGTTIN を子で `SIG_DFL` に戻す。
    fn set_sigdefault(&mut self) {
        unsafe {
            let mut flags: libc::c_short = 0;
            libc::posix_spawnattr_getflags(&self.inner, &mut flags);
            flags |= libc::POSIX_SPAWN_SETSIGDEF as libc::c_short;
            libc::posix_spawnattr_setflags(&mut self.inner, flags);

            let mut sigset: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut sigset);
            libc::sigaddset(&mut sigset, libc::SIGCHLD);
            libc::sigaddset(&mut sigset, libc::SIGINT);
            libc::sigaddset(&mut sigset, libc::SIGTSTP);
            libc::sigaddset(&mut sigset, libc::SIGTTOU);
            libc::sigaddset(&mut sigset, libc::SIGTTIN);
            libc::posix_spawnattr_setsigdefault(&mut self.inner, &sigset);
        }
    }

    fn as_ptr(&self) -> *const libc::posix_spawnattr_t {
        &self.inner
    }
}

impl Drop for SpawnAttr {
    fn drop(&mut self) {
        unsafe {
            libc::posix_spawnattr_destroy(&mut self.inner);
        }
    }
}

// ── spawn 関数 ────────────────────────────────────────────────────

/// `posix_spawnp` で子プロセスを起動する。成功時は子 PID を返す。
///
/// - `args`: コマンドと引数（`args[0]` がコマンド名、PATH 検索付き）
/// - `pgid`: プロセスグループ ID（0 なら子 PID をリーダーにする）
///
/// 標準 fd は呼び出し時点のシェルの配線をそのまま継承する。
pub fn spawn(args: &[&str], pgid: libc::pid_t) -> Result<libc::pid_t, SpawnError> {
    // argv: CString の所有を関数スコープに置いたまま NULL 終端ポインタ配列を作る。
    // 内部 NUL を含む引数は exec しても一致するコマンドがないので空文字列に落とす。
    let owned: Vec<CString> = args
        .iter()
        .map(|s| CString::new(*s).unwrap_or_default())
        .collect();
    let mut argv = Vec::with_capacity(owned.len() + 1);
    for s in &owned {
        argv.push(s.as_ptr() as *mut libc::c_char);
    }
    argv.push(std::ptr::null_mut());

    // 属性: プロセスグループ + シグナルリセット
    let mut attr = SpawnAttr::new();
    attr.set_pgroup(pgid);
    attr.set_sigdefault();

    // environ を継承（`cd` などで変化した環境がそのまま渡る）
    extern "C" {
        static environ: *const *mut libc::c_char;
    }

    let mut pid: libc::pid_t = 0;

    let ret = unsafe {
        libc::posix_spawnp(
            &mut pid,
            argv[0] as *const libc::c_char,
            std::ptr::null(),
            attr.as_ptr(),
            argv.as_ptr(),
            environ as *const *mut libc::c_char,
        )
    };

    if ret != 0 {
        return Err(SpawnError {
            errno: ret,
            command: args[0].to_string(),
        });
    }

    Ok(pid)
}

// ── Tests ───────────────────────────────────────────────────────────
