use std::path::Path;

use clap::Parser;
use harvest::{run, Cli};
use tempfile::tempdir;

const DOCUMENT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9"
        xmlns:rs="http://www.openarchives.org/rs/terms/"
        xmlns:x="https://sis.id.ethz.ch/software/#openbis/xdterms/"
        xmlns:xmd="https://sis.id.ethz.ch/software/#openbis/xmdterms/">
  <rs:md capability="resourcelist" at="2024-05-01T12:00:00Z"/>
  <url>
    <loc>https://source/openbis/MASTER_DATA/MASTER_DATA/M</loc>
    <lastmod>2024-05-01T12:00:00Z</lastmod>
    <xmd:masterData>
      <xmd:objectTypes><xmd:objectType code="CELL"/></xmd:objectTypes>
    </xmd:masterData>
  </url>
  <url>
    <loc>https://source/openbis/PROJECT/20240501000000000-1/M</loc>
    <lastmod>2024-05-01T10:00:00Z</lastmod>
    <x:xd kind="PROJECT" code="PRJ1" type="DEFAULT" space="LAB"/>
  </url>
  <url>
    <loc>https://source/openbis/SAMPLE/20240501000000000-2/M</loc>
    <lastmod>2024-05-01T10:00:00Z</lastmod>
    <x:xd kind="SAMPLE" code="S1" type="CELL" space="LAB"/>
  </url>
</urlset>
"#;

fn write_fixture(dir: &Path) -> anyhow::Result<(String, String)> {
    let document = dir.join("resource-list.xml");
    std::fs::write(&document, DOCUMENT)?;
    let config = dir.join("harvester.json");
    let state_dir = dir.join("state");
    std::fs::write(
        &config,
        serde_json::json!({ "state_dir": state_dir, "data_source_alias": "SRC" }).to_string(),
    )?;
    Ok((
        config.display().to_string(),
        document.display().to_string(),
    ))
}

#[tokio::test]
async fn inspect_reports_counts() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_, document) = write_fixture(dir.path())?;

    let cli = Cli::try_parse_from(["harvest", "inspect", "--document", &document])?;
    let output: serde_json::Value = serde_json::from_str(&run(cli).await?)?;

    assert_eq!(output["entities"]["projects"], 1);
    assert_eq!(output["entities"]["objects"], 1);
    assert_eq!(output["master_data"]["object_types"], 1);
    assert_eq!(output["spaces"], serde_json::json!(["LAB"]));
    Ok(())
}

#[tokio::test]
async fn plan_then_sync_from_a_document() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (config, document) = write_fixture(dir.path())?;

    let plan = Cli::try_parse_from(["harvest", "plan", "--config", &config, "--document", &document])?;
    let report = run(plan).await?;
    assert!(report.contains("dry run"), "{report}");
    assert!(report.contains("would create spaces [SRC_LAB]"), "{report}");
    assert!(!dir.path().join("state/last-sync-timestamp").exists());

    let sync = Cli::try_parse_from(["harvest", "sync", "--config", &config, "--document", &document])?;
    let report = run(sync).await?;
    assert!(report.contains("projects: 1 added"), "{report}");
    assert!(dir.path().join("state/last-sync-timestamp").exists());
    assert!(dir.path().join("state/catalog.db").exists());
    Ok(())
}

#[test]
fn sync_requires_a_config() {
    assert!(Cli::try_parse_from(["harvest", "sync"]).is_err());
}
