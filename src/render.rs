//! Terminal Views
//!
//! Plain-text renderings of the landing view and the dashboard.

use chrono::{DateTime, Utc};
use url::Url;

use crate::dashboard::{Dashboard, Route};

const TITLE_WIDTH: usize = 32;
const DOMAIN_WIDTH: usize = 24;

pub fn render_landing() -> String {
    let mut out = String::new();
    out.push_str("Linkshelf\n\n");
    out.push_str("Save, organize, and reach your bookmarks from anywhere,\n");
    out.push_str("synced in real-time, private to you.\n\n");
    out.push_str("Sign in to manage your personal bookmarks:\n");
    out.push_str("  linkshelf login    Continue with Google\n");
    out
}

/// The dashboard as it currently stands, or the landing view when signed out
pub fn render_dashboard(dashboard: &Dashboard) -> String {
    let Some(user) = dashboard.user() else {
        return render_landing();
    };
    if dashboard.route() != Route::Dashboard {
        return render_landing();
    }

    let config = dashboard.config();
    let list = dashboard.bookmarks();
    let mut out = String::new();

    match &user.email {
        Some(email) if email != user.display_name() => {
            out.push_str(&format!("Signed in as {} <{}>\n", user.display_name(), email));
        }
        _ => out.push_str(&format!("Signed in as {}\n", user.display_name())),
    }

    let noun = if list.len() == 1 { "link" } else { "links" };
    if dashboard.is_subscribed() {
        out.push_str(&format!("{} saved {} · updates in real-time\n", list.len(), noun));
    } else {
        out.push_str(&format!("{} saved {}\n", list.len(), noun));
    }

    if let Some(error) = dashboard.error() {
        out.push_str(&format!("! {}\n", error));
    }
    if dashboard.is_adding() {
        out.push_str("Saving...\n");
    }
    out.push('\n');

    if dashboard.is_loading() {
        out.push_str("Loading bookmarks...\n");
        return out;
    }
    if list.is_empty() {
        out.push_str("No bookmarks yet\n");
        out.push_str("Add your first link above to get started\n");
        return out;
    }

    out.push_str(&format!(
        "{:>3}  {:<tw$}  {:<dw$}  {}\n",
        "#",
        "Title",
        "Domain",
        "Added",
        tw = TITLE_WIDTH,
        dw = DOMAIN_WIDTH
    ));
    out.push_str(&format!("{}\n", "-".repeat(TITLE_WIDTH + DOMAIN_WIDTH + 22)));

    for (i, bookmark) in list.iter().enumerate() {
        let marker = if dashboard.is_deleting(&bookmark.id) {
            "  [deleting]"
        } else if dashboard.is_new(&bookmark.id) {
            "  [new]"
        } else {
            ""
        };
        out.push_str(&format!(
            "{:>3}  {:<tw$}  {:<dw$}  {}{}\n",
            i + 1,
            truncate(&bookmark.title, TITLE_WIDTH),
            truncate(&domain_of(&bookmark.url), DOMAIN_WIDTH),
            format_date(&bookmark.created_at, &config.date_format),
            marker,
            tw = TITLE_WIDTH,
            dw = DOMAIN_WIDTH
        ));
    }

    out
}

/// Host of `url` without a leading `www.`; the raw string when it doesn't parse
pub fn domain_of(url: &str) -> String {
    match Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string)) {
        Some(host) => host
            .strip_prefix("www.")
            .map(str::to_string)
            .unwrap_or(host),
        None => url.to_string(),
    }
}

/// Format an RFC 3339 timestamp (UTC); unparseable input is shown as-is
pub fn format_date(created_at: &str, format: &str) -> String {
    match created_at.parse::<DateTime<Utc>>() {
        Ok(dt) => dt.format(format).to_string(),
        Err(_) => created_at.to_string(),
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let kept: String = text.chars().take(width.saturating_sub(3)).collect();
    format!("{}...", kept)
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

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("https://www.example.com/path"), "example.com");
        assert_eq!(domain_of("http://docs.rs/tokio"), "docs.rs");
        assert_eq!(domain_of("https://sub.www.example.com"), "sub.www.example.com");
        assert_eq!(domain_of("not a url"), "not a url");
    }

    #[test]
    fn test_format_date() {
        assert_eq!(format_date("2024-01-05T12:00:00Z", "%b %-d, %Y"), "Jan 5, 2024");
        assert_eq!(
            format_date("2024-03-15T08:30:00.123456+00:00", "%b %-d, %Y"),
            "Mar 15, 2024"
        );
        assert_eq!(format_date("yesterday", "%b %-d, %Y"), "yesterday");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer title", 10), "a much ...");
    }

    #[test]
    fn test_landing_offers_sign_in() {
        assert!(render_landing().contains("Continue with Google"));
    }

    async fn dashboard_for(memory: Arc<MemoryBackend>, dir: &std::path::Path) -> Dashboard {
        let mut dashboard = Dashboard::new(
            Backend::in_memory(memory),
            Arc::new(LocalStore::open(dir).unwrap()),
            Arc::new(ManualClock::default()),
            DashboardConfig::default(),
        );
        dashboard.activate().await;
        dashboard
    }

    #[tokio::test]
    async fn test_render_empty_dashboard() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryBackend::with_user(
            User::new("u1").email("ada@example.com").full_name("Ada"),
        ));
        let dashboard = dashboard_for(memory, dir.path()).await;

        let text = render_dashboard(&dashboard);
        assert!(text.contains("Signed in as Ada <ada@example.com>"));
        assert!(text.contains("0 saved links · updates in real-time"));
        assert!(text.contains("No bookmarks yet"));
    }

    #[tokio::test]
    async fn test_render_rows_and_new_marker() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryBackend::with_user(User::new("u1")));
        memory
            .insert_row(NewBookmark {
                url: "https://www.example.com/a".into(),
                title: "Example".into(),
                user_id: "u1".into(),
            })
            .await;
        let mut dashboard = dashboard_for(Arc::clone(&memory), dir.path()).await;
        memory
            .insert_row(NewBookmark {
                url: "https://docs.rs".into(),
                title: "Docs".into(),
                user_id: "u1".into(),
            })
            .await;
        let event = dashboard.next_event().await.unwrap();
        dashboard.dispatch(event).await;

        let text = render_dashboard(&dashboard);
        assert!(text.contains("Signed in as u1"));
        assert!(text.contains("2 saved links"));

        let rows: Vec<&str> = text.lines().filter(|l| l.contains("Docs") || l.contains("Example")).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("  1  Docs"));
        assert!(rows[0].contains("docs.rs"));
        assert!(rows[0].ends_with("[new]"));
        assert!(rows[1].contains("example.com"));
        assert!(!rows[1].contains("[new]"));
    }

    #[tokio::test]
    async fn test_render_signed_out_is_landing() {
        let dir = tempfile::tempdir().unwrap();
        let dashboard = dashboard_for(Arc::new(MemoryBackend::new()), dir.path()).await;
        assert_eq!(render_dashboard(&dashboard), render_landing());
    }
}
