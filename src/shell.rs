//! シェルのプロセス全体状態を保持するモジュール。
//!
//! グローバル変数ではなく [`Shell`] を評価器へ明示的に渡すことで、
//! テストごとに独立した状態を構築できるようにする。
//! シグナルハンドラから参照される最小限のミラー（フォアグラウンド PID 等）のみ
//! [`signal`](crate::signal) モジュールの atomic に複製される。

use libc::pid_t;

use crate::job::JobTable;

/// シェルの実行状態。REPL ループと評価器全体で共有される。
pub struct Shell {
    /// シェル自身の PID。初期化時に取得。
    pub pid: pid_t,
    /// シェルのプロセスグループ ID。初期化時に自身のグループを作って取得。
    pub pgid: pid_t,
    /// ターミナル制御に使う fd（通常は stdin）。
    pub terminal_fd: i32,
    /// ターミナルを掌握できたかどうか。失敗時は非インタラクティブモード。
    pub interactive: bool,
    /// 初回評価でシグナル・プロセスグループ初期化を済ませたら true。
    pub initialized: bool,
    /// 直前のコマンドの終了ステータス。プロンプト表示と `echo $?` に使う。
    pub last_status: i32,
    /// `exit` ビルトインで true にセットされ、REPL ループを終了させる。
    pub should_exit: bool,
    /// ジョブテーブル。
    pub jobs: JobTable,
    /// 現在のフォアグラウンドジョブの jid。評価の終わりに必ずクリアされる。
    pub fg_job: Option<usize>,
    /// 最後に起動・停止したバックグラウンドジョブの jid。`fg`/`bg` の既定対象。
    pub last_job: Option<usize>,
}

impl Shell {
    pub fn new() -> Self {
        Self {
            pid: 0,
            pgid: 0,
            terminal_fd: libc::STDIN_FILENO,
            interactive: true,
            initialized: false,
            last_status: 0,
            should_exit: false,
            jobs: JobTable::new(),
            fg_job: None,
            last_job: None,
        }
    }
}

impl Default for Shell {
    fn default() -> Self {
        Self::new()
    }
}
