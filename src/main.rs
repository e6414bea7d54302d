//! marsh — ジョブ制御を備えた Rust 製ミニシェル
//!
//! REPL ループ: ジョブ通知 → プロンプト表示 → 入力読み取り → パース → 評価 → ループ
//!
//! 現在の機能:
//! - 構文解析: シーケンス `;`/`&&`/`||`、パイプライン、リダイレクト、末尾 `&`（[`parser`]）
//! - コマンド評価: 条件付き実行、パイプ接続、リダイレクト、ジョブ起動（[`executor`]）
//! - ビルトイン: `cd`, `echo`, `exit`, `help`, `hash`, `jobs`, `fg`, `bg`（[`builtins`]）
//! - ジョブコントロール: バックグラウンド実行 (`&`)、Ctrl-Z サスペンド、`fg`/`bg` 復帰（[`job`]）
//!
//! シグナル・プロセスグループ・ターミナルの初期化は最初の評価時に
//! [`executor::evaluate`] が行う。

mod builtins;
mod executor;
mod job;
mod parser;
mod shell;
mod signal;
mod spawn;

use std::io::{self, BufRead, Write};

use shell::Shell;

fn main() {
    let mut shell = Shell::new();

    // stdin/stdout のロックを保持し、毎回の mutex ロックオーバーヘッドを回避
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut stdin = stdin.lock();
    let mut stdout = stdout.lock();
    let mut line = String::new();

    loop {
        // プロンプト前に SIGCHLD 分の reap と完了通知を済ませる
        if signal::take_child_event() {
            job::reap_jobs(&mut shell.jobs);
        }
        job::notify_and_clean(&mut shell.jobs, shell.interactive);

        // プロンプト表示: 直前が失敗なら終了ステータスを接頭辞に付ける
        if shell.last_status == 0 {
            let _ = write!(stdout, "marsh$ ");
        } else {
            let _ = write!(stdout, "[{}] marsh$ ", shell.last_status);
        }
        let _ = stdout.flush();

        // バッファを再利用して読み取り（アロケーション回避）
        line.clear();
        match stdin.read_line(&mut line) {
            Ok(0) => {
                // EOF (Ctrl+D): 改行を出力して終了
                let _ = writeln!(stdout);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("marsh: read error: {e}");
                break;
            }
        }

        // パース: Expr<'_> は line を借用 → 評価後に drop → line.clear() は安全
        match parser::parse(&line) {
            Ok(Some(expr)) => {
                executor::evaluate(&mut shell, &expr);
            }
            Ok(None) => continue,
            Err(e) => {
                eprintln!("marsh: {e}");
                shell.last_status = 2;
                continue;
            }
        }

        if shell.should_exit {
            break;
        }
    }

    std::process::exit(shell.last_status);
}
