//! ジョブテーブルとジョブ制御ヘルパー。
//!
//! 固定容量（[`MAXJOBS`]）のスロットテーブルでジョブを管理し、
//! フォアグラウンド待機 ([`send_to_foreground`])、非ブロッキング reap ([`reap_jobs`])、
//! 完了通知 ([`notify_and_clean`])、ターミナル制御 ([`give_terminal_to`] / [`take_terminal_back`])
//! を提供する。executor と builtins の両方から利用し、循環依存を回避する。

use std::io;

use libc::pid_t;

use crate::shell::Shell;
use crate::signal;

// ── データ構造 ───────────────────────────────────────────────────────

/// 同時に追跡できるジョブの最大数。
pub const MAXJOBS: usize = 32;
/// ジョブ表示に保持するコマンド名の最大文字数。
pub const CMD_LABEL: usize = 15;

/// ジョブの状態。[`Job::set_wait_status`] が `waitpid` の結果から遷移させる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// 実行中。
    Running,
    /// SIGTSTP 等で停止中。
    Stopped,
    /// 終了済み。`status` または `termsig` が有効。
    Done,
}

/// ジョブ。fork / spawn された子プロセス 1 つに対応する。
#[derive(Debug, Clone)]
pub struct Job {
    /// ジョブ ID。スロット番号と一致し、解放後は再利用される。
    pub jid: usize,
    /// リーダープロセスの PID。
    pub pid: pid_t,
    /// プロセスグループ ID。各ジョブは自身のグループを持つため pid と等しい。
    pub pgid: pid_t,
    /// バックグラウンドジョブなら true。Ctrl-Z 停止時にも true に遷移する。
    pub background: bool,
    /// 現在の状態。
    pub state: JobState,
    /// 終了ステータス。シグナル死は `128 + termsig` を格納する。
    pub status: i32,
    /// シグナルで終了した場合のシグナル番号。
    pub termsig: Option<i32>,
    /// 表示用コマンド名（先頭 [`CMD_LABEL`] 文字）。
    pub cmd: String,
}

impl Job {
    /// `waitpid` の raw status からジョブの状態を更新する。
    ///
    /// - 正常終了 → Done、`status` = 終了コード
    /// - 停止 → Stopped、`status` = 0
    /// - シグナル終了 → Done、`termsig` = シグナル番号、`status` = 128 + シグナル番号
    pub fn set_wait_status(&mut self, wstatus: i32) {
        if libc::WIFEXITED(wstatus) {
            self.status = libc::WEXITSTATUS(wstatus);
            self.state = JobState::Done;
        } else if libc::WIFSTOPPED(wstatus) {
            self.status = 0;
            self.state = JobState::Stopped;
        } else if libc::WIFSIGNALED(wstatus) {
            let sig = libc::WTERMSIG(wstatus);
            self.termsig = Some(sig);
            self.status = 128 + sig;
            self.state = JobState::Done;
        }
    }

    /// ジョブのステータス表示文字列を返す。
    fn state_str(&self) -> &'static str {
        match self.state {
            JobState::Running => "Running",
            JobState::Stopped => "Suspended",
            JobState::Done => "Done",
        }
    }

    /// `jobs` ビルトインと完了通知で使う表示行を組み立てる。
    ///
    /// `[0]+ Running\tsleep\tPID: 1234` 形式。Done のときは末尾に
    /// `\tExit n` または `\tTerminated with signal n` が付く。
    pub fn format_line(&self) -> String {
        let mut line = format!(
            "[{}]+ {}\t{}\tPID: {}",
            self.jid,
            self.state_str(),
            self.cmd,
            self.pid,
        );
        if self.state == JobState::Done {
            match self.termsig {
                Some(sig) => line.push_str(&format!("\tTerminated with signal {sig}")),
                None => line.push_str(&format!("\tExit {}", self.status)),
            }
        }
        line
    }
}

// ── JobTable ─────────────────────────────────────────────────────────

/// ジョブテーブル。固定 [`MAXJOBS`] スロットで、jid = スロット番号。
///
/// [`Shell`] が所有し、executor と builtins の両方からアクセスされる。
pub struct JobTable {
    slots: Vec<Option<Job>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self {
            slots: vec![None; MAXJOBS],
        }
    }

    /// 最初の空きスロットにジョブを登録し、jid を返す。
    ///
    /// 空きがなければ `None`（呼び出し側がユーザへエラーを報告する）。
    /// コマンド名は先頭 [`CMD_LABEL`] 文字だけ保持する。
    pub fn register(
        &mut self,
        pid: pid_t,
        pgid: pid_t,
        background: bool,
        cmd: &str,
    ) -> Option<usize> {
        let jid = self.slots.iter().position(|slot| slot.is_none())?;
        self.slots[jid] = Some(Job {
            jid,
            pid,
            pgid,
            background,
            state: JobState::Running,
            status: 0,
            termsig: None,
            cmd: cmd.chars().take(CMD_LABEL).collect(),
        });
        Some(jid)
    }

    /// スロットを解放する。jid は以後のジョブに再利用される。
    pub fn unregister(&mut self, jid: usize) {
        if let Some(slot) = self.slots.get_mut(jid) {
            *slot = None;
        }
    }

    /// jid でジョブを検索する。
    pub fn get(&self, jid: usize) -> Option<&Job> {
        self.slots.get(jid).and_then(Option::as_ref)
    }

    /// jid でジョブを検索する（可変参照）。
    pub fn get_mut(&mut self, jid: usize) -> Option<&mut Job> {
        self.slots.get_mut(jid).and_then(Option::as_mut)
    }

    /// PID からジョブの jid を検索する。
    pub fn find(&self, pid: pid_t) -> Option<usize> {
        self.iter().find(|job| job.pid == pid).map(|job| job.jid)
    }

    /// 使用中スロットのイテレータ（jid 昇順）。
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.slots.iter().filter_map(Option::as_ref)
    }
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

// ── reap / 通知 ──────────────────────────────────────────────────────

/// 非ブロッキングで全ジョブの状態変化を回収する。
///
/// 使用中の各スロットに対し `waitpid(pid, WNOHANG | WUNTRACED | WCONTINUED)` を
/// 発行し、変化があれば状態へ反映する。変化がないのに対象プロセスが
/// 存在しない（ESRCH）場合はスロットを解放する。ブロックは決してしない。
/// Done のスロットは通知が済むまで触らない。
pub fn reap_jobs(jobs: &mut JobTable) {
    for jid in 0..MAXJOBS {
        let pid = match jobs.get(jid) {
            Some(job) if job.state != JobState::Done => job.pid,
            _ => continue,
        };

        let mut wstatus: i32 = 0;
        let ret = unsafe {
            libc::waitpid(
                pid,
                &mut wstatus,
                libc::WNOHANG | libc::WUNTRACED | libc::WCONTINUED,
            )
        };

        if ret > 0 {
            if let Some(job) = jobs.get_mut(jid) {
                job.set_wait_status(wstatus);
            }
        } else if unsafe { libc::kill(pid, 0) } < 0
            && io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
        {
            // スロットは残っているが対応するプロセスが消えている
            jobs.unregister(jid);
        }
    }
}

/// Done ジョブのスロットを解放する。`notify` ならバックグラウンドジョブの
/// 完了行を stdout に出力してから解放する（フォアグラウンドジョブは通知しない）。
pub fn notify_and_clean(jobs: &mut JobTable, notify: bool) {
    for jid in 0..MAXJOBS {
        let done = match jobs.get(jid) {
            Some(job) if job.state == JobState::Done => {
                if notify && job.background {
                    println!("{}", job.format_line());
                }
                true
            }
            _ => false,
        };
        if done {
            jobs.unregister(jid);
        }
    }
}

// ── フォアグラウンド / バックグラウンド遷移 ──────────────────────────

/// 登録直後のジョブを起動する。
///
/// いったん Stopped とし、親側でも `setpgid` でグループを確定させてから
/// フォアグラウンドなら [`send_to_foreground`]、バックグラウンドなら
/// [`send_to_background`] で走らせる。`notify` ならバックグラウンド起動を
/// `[jid] pid` 形式で stdout に表示する。
pub fn launch_job(shell: &mut Shell, jid: usize, notify: bool) {
    let (pid, background) = match shell.jobs.get_mut(jid) {
        Some(job) => {
            job.state = JobState::Stopped;
            (job.pid, job.background)
        }
        None => return,
    };

    // 子プロセス側の設定とどちらが先でも結果が同じになるよう親側でも呼ぶ
    unsafe {
        libc::setpgid(pid, pid);
    }

    if background {
        send_to_background(shell, jid);
        if notify {
            println!("[{jid}] {pid}");
        }
    } else {
        send_to_foreground(shell, jid);
    }
}

/// ジョブをフォアグラウンドへ送り、完了または停止までブロック待機する。
///
/// 待機中はシェルのハンドラをデフォルトへ戻し、インタラクティブなら
/// ターミナル制御をジョブへ渡す。`waitpid(WUNTRACED)` の結果をジョブへ
/// 反映し、Ctrl-Z による停止ならバックグラウンドへ移して最終ジョブとして
/// 記録する。復帰時にハンドラとターミナルを取り戻す。
pub fn send_to_foreground(shell: &mut Shell, jid: usize) {
    let (pid, stopped) = match shell.jobs.get(jid) {
        Some(job) => (job.pid, job.state == JobState::Stopped),
        None => return,
    };

    signal::install_default();

    if shell.interactive {
        give_terminal_to(shell.terminal_fd, pid);
    }

    shell.fg_job = Some(jid);
    signal::set_foreground(pid);

    if stopped && unsafe { libc::kill(pid, libc::SIGCONT) } < 0 {
        eprintln!(
            "unable to send continue to job {}: {}",
            jid,
            io::Error::last_os_error(),
        );
    }

    let mut wstatus: i32 = 0;
    if unsafe { libc::waitpid(pid, &mut wstatus, libc::WUNTRACED) } < 0 {
        eprintln!("marsh: waitpid: {}", io::Error::last_os_error());
    } else if let Some(job) = shell.jobs.get_mut(jid) {
        job.set_wait_status(wstatus);
        // Ctrl-Z による停止はバックグラウンドへ移す
        if job.state == JobState::Stopped {
            job.background = true;
            shell.last_job = Some(jid);
        }
    }

    signal::install_handlers();

    if shell.interactive {
        take_terminal_back(shell.terminal_fd, shell.pgid);
    }
}

/// ジョブをバックグラウンドで走らせる。停止中なら SIGCONT で再開する。
pub fn send_to_background(shell: &mut Shell, jid: usize) {
    if let Some(job) = shell.jobs.get_mut(jid) {
        if job.state == JobState::Stopped && unsafe { libc::kill(job.pid, libc::SIGCONT) } < 0 {
            eprintln!(
                "unable to send continue to job {}: {}",
                jid,
                io::Error::last_os_error(),
            );
        }
        job.state = JobState::Running;
        shell.last_job = Some(jid);
    }
}

// ── ターミナル制御ヘルパー ───────────────────────────────────────────

/// `tcsetpgrp` でターミナルのフォアグラウンドプロセスグループを `pgid` に設定する。
///
/// フォアグラウンドジョブの実行前、および `fg` ビルトインから呼ばれる。
pub fn give_terminal_to(terminal_fd: i32, pgid: pid_t) {
    unsafe {
        libc::tcsetpgrp(terminal_fd, pgid);
    }
}

/// `tcsetpgrp` でターミナルのフォアグラウンドプロセスグループをシェルに戻す。
///
/// フォアグラウンドジョブの完了後・停止後に呼ばれ、シェルがターミナル入力を
/// 再び受け取れるようにする。
pub fn take_terminal_back(terminal_fd: i32, shell_pgid: pid_t) {
    unsafe {
        libc::tcsetpgrp(terminal_fd, shell_pgid);
    }
}

// ── Tests ───────────────────────────────────────────────────────────
