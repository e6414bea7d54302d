//! marsh ライブラリ — テスト・ベンチマーク用にモジュールを公開する。
//!
//! バイナリ本体は `main.rs` の REPL ループ。
//! この `lib.rs` は `tests/eval.rs` や `benches/bench_main.rs` から
//! パーサー・評価器・ジョブテーブルへ直接アクセスするために存在する。
//!
//! ## モジュール構成
//!
//! | モジュール | 役割 |
//! |-----------|------|
//! | [`parser`] | 構文解析（シーケンス `;`/`&&`/`\|\|`、パイプライン、リダイレクト、末尾 `&`、クォート） |
//! | [`shell`] | シェルのプロセス全体状態（終了ステータス、ジョブテーブル、プロセスグループ） |
//! | [`job`] | ジョブテーブルとジョブ制御（登録・reap・完了通知・fg/bg 遷移・ターミナル制御） |
//! | [`signal`] | シグナル配送（ハンドラ登録・解除、SIGCHLD の self-pipe 遅延処理、fg への転送） |
//! | [`spawn`] | `posix_spawnp` ラッパー（プロセスグループ設定 + シグナルリセット付き起動） |
//! | [`builtins`] | ビルトイン（`cd`, `echo`, `exit`, `help`, `hash`, `jobs`, `fg`, `bg`） |
//! | [`executor`] | コマンドツリー評価（シーケンス条件付き実行、パイプ接続、リダイレクト、ジョブ起動） |

pub mod builtins;
pub mod executor;
pub mod job;
pub mod parser;
pub mod shell;
pub mod signal;
pub mod spawn;
