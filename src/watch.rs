//! Live Dashboard Loop
//!
//! Drives a [`Dashboard`] from two sources at once: commands typed at the
//! prompt and events from the dashboard itself (feed changes, session
//! changes, highlight deadlines). The view is redrawn after each.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::dashboard::{AddForm, Dashboard, Route};
use crate::render::render_dashboard;

const HELP: &str = "\
Commands:
  add <title> <url>   Save a bookmark (the last word is the URL)
  rm <n|id>           Delete the bookmark at position n, or by id
  refresh             Reload the list
  logout              Sign out and leave
  quit                Leave without signing out
";

/// A line typed at the prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add { title: String, url: String },
    Remove(String),
    Refresh,
    Logout,
    Quit,
    Help,
    Redraw,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        match verb.to_lowercase().as_str() {
            "" => Command::Redraw,
            "add" | "a" => match rest.rsplit_once(char::is_whitespace) {
                Some((title, url)) => Command::Add {
                    title: title.trim().to_string(),
                    url: url.to_string(),
                },
                // Let validation report what is missing
                None => Command::Add {
                    title: String::new(),
                    url: rest.to_string(),
                },
            },
            "rm" | "del" | "delete" if !rest.is_empty() => Command::Remove(rest.to_string()),
            "refresh" | "r" => Command::Refresh,
            "logout" => Command::Logout,
            "quit" | "exit" | "q" => Command::Quit,
            "help" | "?" => Command::Help,
            _ => Command::Unknown(line.to_string()),
        }
    }
}

/// How the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    Quit,
    SignedOut,
    EndOfInput,
}

/// Run until the user quits, signs out, or input ends
pub async fn run<R, W>(dashboard: &mut Dashboard, input: R, out: &mut W) -> std::io::Result<WatchExit>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    redraw(dashboard, out).await?;

    loop {
        tokio::select! {
            biased;

            Some(event) = dashboard.next_event() => {
                if dashboard.dispatch(event).await == Route::Login {
                    out.write_all(b"\nSession ended. Sign in again with `linkshelf login`.\n").await?;
                    out.flush().await?;
                    return Ok(WatchExit::SignedOut);
                }
                redraw(dashboard, out).await?;
            }

            line = lines.next_line() => {
                let Some(line) = line? else {
                    dashboard.deactivate();
                    return Ok(WatchExit::EndOfInput);
                };
                if let Some(exit) = execute(dashboard, Command::parse(&line), out).await? {
                    return Ok(exit);
                }
            }
        }
    }
}

async fn execute<W>(dashboard: &mut Dashboard, command: Command, out: &mut W) -> std::io::Result<Option<WatchExit>>
where
    W: AsyncWrite + Unpin,
{
    match command {
        Command::Add { title, url } => {
            dashboard.form = AddForm::new(&title, &url);
            if let Some(pending) = dashboard.begin_add() {
                redraw(dashboard, out).await?;
                let result = pending.run().await;
                // The row itself shows up when the feed delivers it
                dashboard.finish_add(result);
            }
            redraw(dashboard, out).await?;
        }
        Command::Remove(target) => {
            let id = dashboard.resolve(&target).map(|b| b.id.clone());
            let Some(id) = id else {
                return write_line(out, &format!("No bookmark matches {}", target))
                    .await
                    .map(|_| None);
            };
            match dashboard.begin_delete(&id) {
                Ok(pending) => {
                    redraw(dashboard, out).await?;
                    let result = pending.run().await;
                    match dashboard.finish_delete(result) {
                        Ok(()) => redraw(dashboard, out).await?,
                        Err(_) => write_line(out, "Failed to delete bookmark.").await?,
                    }
                }
                Err(_) => write_line(out, "Failed to delete bookmark.").await?,
            }
        }
        Command::Refresh => {
            dashboard.load_bookmarks().await;
            redraw(dashboard, out).await?;
        }
        Command::Logout => {
            dashboard.sign_out().await;
            write_line(out, "Signed out.").await?;
            return Ok(Some(WatchExit::SignedOut));
        }
        Command::Quit => {
            dashboard.deactivate();
            return Ok(Some(WatchExit::Quit));
        }
        Command::Help => {
            out.write_all(HELP.as_bytes()).await?;
            prompt(out).await?;
        }
        Command::Redraw => redraw(dashboard, out).await?,
        Command::Unknown(line) => {
            write_line(out, &format!("Unknown command: {} (try `help`)", line)).await?;
        }
    }
    Ok(None)
}

async fn redraw<W: AsyncWrite + Unpin>(dashboard: &Dashboard, out: &mut W) -> std::io::Result<()> {
    out.write_all(b"\n").await?;
    out.write_all(render_dashboard(dashboard).as_bytes()).await?;
    prompt(out).await
}

async fn write_line<W: AsyncWrite + Unpin>(out: &mut W, text: &str) -> std::io::Result<()> {
    out.write_all(text.as_bytes()).await?;
    out.write_all(b"\n").await?;
    prompt(out).await
}

async fn prompt<W: AsyncWrite + Unpin>(out: &mut W) -> std::io::Result<()> {
    out.write_all(b"> ").await?;
    out.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend};
    use crate::clock::ManualClock;
    use crate::config::DashboardConfig;
    use crate::model::{NewBookmark, User};
    use crate::storage::LocalStore;
    use std::sync::Arc;
    use tempfile::TempDir;
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

    async fn setup() -> (Arc<MemoryBackend>, Dashboard, Arc<LocalStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let memory = Arc::new(MemoryBackend::with_user(User::new("u1")));
        let local = Arc::new(LocalStore::open(dir.path()).unwrap());
        let mut dashboard = Dashboard::new(
            Backend::in_memory(Arc::clone(&memory)),
            Arc::clone(&local),
            Arc::new(ManualClock::default()),
            DashboardConfig::default(),
        );
        dashboard.activate().await;
        (memory, dashboard, local, dir)
    }

    /// Read rendered output until `marker` shows up, then let held writes finish
    async fn release_when_shown<R: AsyncRead + Unpin>(memory: &MemoryBackend, mut output: R, marker: &str) {
        let mut seen = String::new();
        let mut buf = [0u8; 4096];
        while !seen.contains(marker) {
            let n = output.read(&mut buf).await.unwrap();
            assert!(n > 0, "output ended before {} was shown", marker);
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        memory.release_writes();
    }

    async fn run_script(dashboard: &mut Dashboard, script: &str) -> (WatchExit, String) {
        let mut out = Vec::new();
        let exit = run(dashboard, BufReader::new(script.as_bytes()), &mut out)
            .await
            .unwrap();
        (exit, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("add My Site example.com"),
            Command::Add {
                title: "My Site".into(),
                url: "example.com".into()
            }
        );
        assert_eq!(
            Command::parse("add example.com"),
            Command::Add {
                title: String::new(),
                url: "example.com".into()
            }
        );
        assert_eq!(Command::parse("rm 2"), Command::Remove("2".into()));
        assert_eq!(Command::parse("rm"), Command::Unknown("rm".into()));
        assert_eq!(Command::parse("  QUIT "), Command::Quit);
        assert_eq!(Command::parse(""), Command::Redraw);
        assert_eq!(Command::parse("logout"), Command::Logout);
        assert_eq!(Command::parse("dance"), Command::Unknown("dance".into()));
    }

    #[tokio::test]
    async fn test_add_appears_via_feed() {
        let (memory, mut dashboard, _local, _dir) = setup().await;

        let (exit, out) = run_script(&mut dashboard, "add My Site example.com\nquit\n").await;

        assert_eq!(exit, WatchExit::Quit);
        let inserts = memory.calls().await.inserts;
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].url, "https://example.com");
        assert!(out.contains("No bookmarks yet"));
        assert!(out.lines().any(|l| l.contains("My Site") && l.contains("[new]")));
        assert_eq!(memory.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_add_reports_error() {
        let (memory, mut dashboard, _local, _dir) = setup().await;

        let (_, out) = run_script(&mut dashboard, "add example.com\nquit\n").await;

        assert!(out.contains("Both URL and title are required."));
        assert!(memory.calls().await.inserts.is_empty());
    }

    #[tokio::test]
    async fn test_remove_by_position() {
        let (memory, mut dashboard, _local, _dir) = setup().await;
        let target = memory
            .insert_row(NewBookmark {
                url: "https://example.com".into(),
                title: "Example".into(),
                user_id: "u1".into(),
            })
            .await;

        let (_, out) = run_script(&mut dashboard, "rm 1\nrm 9\nquit\n").await;

        assert_eq!(memory.calls().await.deletes, vec![target.id]);
        assert!(out.contains("No bookmark matches 9"));
        assert!(dashboard.bookmarks().is_empty());
    }

    #[tokio::test]
    async fn test_deleting_marker_shown_while_delete_pending() {
        let (memory, mut dashboard, _local, _dir) = setup().await;
        memory
            .insert_row(NewBookmark {
                url: "https://example.com".into(),
                title: "Example".into(),
                user_id: "u1".into(),
            })
            .await;
        memory.hold_writes();
        let (mut out, rendered) = tokio::io::duplex(1 << 20);

        let (exit, ()) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(
                run(&mut dashboard, BufReader::new("rm 1\nquit\n".as_bytes()), &mut out),
                release_when_shown(&memory, rendered, "[deleting]"),
            )
        })
        .await
        .expect("delete never showed as pending");

        assert_eq!(exit.unwrap(), WatchExit::Quit);
        assert_eq!(memory.calls().await.deletes.len(), 1);
        assert!(memory.rows().await.is_empty());
    }

    #[tokio::test]
    async fn test_saving_shown_while_insert_pending() {
        let (memory, mut dashboard, _local, _dir) = setup().await;
        memory.hold_writes();
        let (mut out, rendered) = tokio::io::duplex(1 << 20);

        let (exit, ()) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(
                run(&mut dashboard, BufReader::new("add Docs docs.example\nquit\n".as_bytes()), &mut out),
                release_when_shown(&memory, rendered, "Saving..."),
            )
        })
        .await
        .expect("insert never showed as saving");

        assert_eq!(exit.unwrap(), WatchExit::Quit);
        assert_eq!(memory.rows().await.len(), 1);
        assert!(!dashboard.is_adding());
    }

    #[tokio::test]
    async fn test_logout_signs_out() {
        let (memory, mut dashboard, local, _dir) = setup().await;
        local.set("auth-token", "{}".into()).unwrap();

        let (exit, out) = run_script(&mut dashboard, "logout\n").await;

        assert_eq!(exit, WatchExit::SignedOut);
        assert!(out.contains("Signed out."));
        assert_eq!(memory.calls().await.sign_outs, 1);
        assert!(local.is_empty());
        assert_eq!(dashboard.route(), Route::Login);
    }

    #[tokio::test]
    async fn test_external_sign_out_ends_loop() {
        let (memory, mut dashboard, _local, _dir) = setup().await;
        memory.end_session().await;

        let (_client, server) = tokio::io::duplex(64);
        let mut out = Vec::new();
        let exit = run(&mut dashboard, BufReader::new(server), &mut out)
            .await
            .unwrap();

        assert_eq!(exit, WatchExit::SignedOut);
        assert!(String::from_utf8(out).unwrap().contains("Session ended"));
    }

    #[tokio::test]
    async fn test_end_of_input_unsubscribes() {
        let (memory, mut dashboard, _local, _dir) = setup().await;

        let (exit, _) = run_script(&mut dashboard, "").await;

        assert_eq!(exit, WatchExit::EndOfInput);
        assert!(!dashboard.is_subscribed());
        assert_eq!(memory.subscriber_count().await, 0);
    }
}
