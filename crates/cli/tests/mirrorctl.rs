//! Black-box tests for `mirrorctl` commands against a temporary database.

use clap::Parser;

use mirrorline_cli::{run, Cli};

struct Ctl {
    dir: tempfile::TempDir,
}

impl Ctl {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    async fn try_run(&self, args: &[&str]) -> anyhow::Result<String> {
        let db = self.dir.path().join("mirrorline.db");
        let mut argv = vec!["mirrorctl", "--database", db.to_str().unwrap()];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv)?;
        let mut out = Vec::new();
        run(cli, &mut out).await?;
        Ok(String::from_utf8(out).unwrap())
    }

    async fn run(&self, args: &[&str]) -> String {
        self.try_run(args).await.unwrap()
    }
}

#[tokio::test]
async fn enqueued_jobs_are_listed_and_shown() {
    let ctl = Ctl::new();
    let out = ctl
        .run(&["enqueue", "mirror-item", r#"{"source_id":"t3_abc"}"#])
        .await;
    assert_eq!(out.trim(), "enqueued mirror-item job 1");

    let listing = ctl.run(&["jobs", "--status", "queued"]).await;
    assert!(listing.contains("mirror-item"));
    assert!(listing.contains("queued"));

    let shown: serde_json::Value =
        serde_json::from_str(&ctl.run(&["show", "1"]).await).unwrap();
    assert_eq!(shown["status"], "queued");
    assert_eq!(shown["payload"]["source_id"], "t3_abc");

    let stats: serde_json::Value =
        serde_json::from_str(&ctl.run(&["stats", "--json"]).await).unwrap();
    assert_eq!(stats["jobs"]["queued"], 1);
}

#[tokio::test]
async fn ignored_items_are_not_enqueued() {
    let ctl = Ctl::new();
    ctl.run(&["ignore", "t3_gone", "deleted by author"]).await;

    let out = ctl
        .run(&["enqueue", "mirror-item", r#"{"source_id":"t3_gone"}"#])
        .await;
    assert!(out.contains("ignored"));

    let mappings = ctl.run(&["mappings"]).await;
    assert!(mappings.contains("ignored"));
    assert!(mappings.trim_end().ends_with('1'));

    let listing = ctl.run(&["jobs"]).await;
    assert!(listing.trim().is_empty());
}

#[tokio::test]
async fn reply_passes_are_queued_once_per_item() {
    let ctl = Ctl::new();
    let payload = r#"{"source_id":"t3_abc"}"#;
    let first = ctl.run(&["enqueue", "mirror-replies", payload]).await;
    assert_eq!(first.trim(), "enqueued mirror-replies job 1");

    let second = ctl.run(&["enqueue", "mirror-replies", payload]).await;
    assert_eq!(second.trim(), "mirror-replies job 1 already queued");

    let other = ctl
        .run(&["enqueue", "mirror-replies", r#"{"source_id":"t3_xyz"}"#])
        .await;
    assert_eq!(other.trim(), "enqueued mirror-replies job 2");

    let listing = ctl.run(&["jobs", "--type", "mirror-replies"]).await;
    assert_eq!(listing.lines().count(), 2);
}

#[tokio::test]
async fn invalid_input_is_reported() {
    let ctl = Ctl::new();
    assert!(ctl.try_run(&["enqueue", "mirror-item", "not json"]).await.is_err());
    assert!(ctl
        .try_run(&["enqueue", "mirror-item", r#"{"community":"rust"}"#])
        .await
        .is_err());
    assert!(ctl.try_run(&["enqueue", "mirror-replies", "{}"]).await.is_err());
    assert!(ctl.try_run(&["enqueue", "unknown-type", "{}"]).await.is_err());
    assert!(ctl.try_run(&["show", "42"]).await.is_err());
}

#[tokio::test]
async fn maintenance_commands_report_counts() {
    let ctl = Ctl::new();
    ctl.run(&["enqueue", "discovery", r#"{"community":"rust"}"#])
        .await;

    assert_eq!(ctl.run(&["reclaim"]).await.trim(), "reclaimed 0 job(s)");
    assert_eq!(
        ctl.run(&["requeue-failed", "--type", "discovery"]).await.trim(),
        "requeued 0 job(s)"
    );
}
