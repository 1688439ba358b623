#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use harvester::{
    config::HarvesterConfig,
    memory::MemoryCatalog,
    store::DocumentSource,
    Harvester,
};
use tempfile::TempDir;

pub const HEAD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9"
        xmlns:rs="http://www.openarchives.org/rs/terms/"
        xmlns:x="https://sis.id.ethz.ch/software/#openbis/xdterms/"
        xmlns:xmd="https://sis.id.ethz.ch/software/#openbis/xmdterms/">"#;

pub const MASTER_DATA: &str = r#"
    <xmd:controlledVocabularies>
      <xmd:controlledVocabulary code="COLOR" chosenFromList="true">
        <xmd:term code="RED" ordinal="1"/>
        <xmd:term code="BLUE" ordinal="2"/>
      </xmd:controlledVocabulary>
    </xmd:controlledVocabularies>
    <xmd:propertyTypes>
      <xmd:propertyType code="TINT" dataType="CONTROLLEDVOCABULARY" vocabulary="COLOR"/>
      <xmd:propertyType code="NOTES" dataType="VARCHAR"/>
    </xmd:propertyTypes>
    <xmd:objectTypes>
      <xmd:objectType code="CELL">
        <xmd:propertyAssignments>
          <xmd:propertyAssignment propertyTypeCode="TINT" ordinal="1"/>
        </xmd:propertyAssignments>
      </xmd:objectType>
    </xmd:objectTypes>
    <xmd:dataSetTypes>
      <xmd:dataSetType code="RAW"/>
    </xmd:dataSetTypes>"#;

/// Remote permId with the timestamp-counter shape data sources publish.
pub fn pid(n: u32) -> String {
    format!("20240501000000000-{n}")
}

/// One `<url>` entry of a resource list.
#[derive(Clone)]
pub struct Entry {
    loc: String,
    lastmod: String,
    attrs: Vec<(String, String)>,
    connections: Vec<(String, String)>,
    properties: Vec<(String, String)>,
    files: Vec<(String, u64, i64)>,
    attachments: Vec<(String, u32, String)>,
}

impl Entry {
    fn new(loc: String, kind: &str, code: &str, type_code: &str, lastmod: &str) -> Self {
        let mut attrs = vec![
            ("kind".to_string(), kind.to_string()),
            ("code".to_string(), code.to_string()),
        ];
        if !type_code.is_empty() {
            attrs.push(("type".to_string(), type_code.to_string()));
        }
        Self {
            loc,
            lastmod: lastmod.to_string(),
            attrs,
            connections: Vec::new(),
            properties: Vec::new(),
            files: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn project(perm_id: &str, code: &str, space: &str, lastmod: &str) -> Self {
        let loc = format!("https://source/openbis/PROJECT/{perm_id}/M");
        Self::new(loc, "PROJECT", code, "DEFAULT", lastmod).attr("space", space)
    }

    pub fn collection(perm_id: &str, code: &str, space: &str, project: &str, lastmod: &str) -> Self {
        let loc = format!("https://source/openbis/EXPERIMENT/{perm_id}/M");
        Self::new(loc, "EXPERIMENT", code, "DEFAULT", lastmod)
            .attr("space", space)
            .attr("project", project)
    }

    /// An object in a collection of `space`/`project`.
    pub fn object(
        perm_id: &str,
        code: &str,
        space: &str,
        project: &str,
        collection: &str,
        lastmod: &str,
    ) -> Self {
        let loc = format!("https://source/openbis/SAMPLE/{perm_id}/M");
        Self::new(loc, "SAMPLE", code, "CELL", lastmod)
            .attr("space", space)
            .attr("project", project)
            .attr("experiment", &format!("/{space}/{project}/{collection}"))
    }

    /// An object without a space.
    pub fn new_shared_object(perm_id: &str, code: &str) -> Self {
        let loc = format!("https://source/openbis/SAMPLE/{perm_id}/M");
        Self::new(loc, "SAMPLE", code, "CELL", "2024-05-01T10:00:00Z")
    }

    pub fn data_set(code: &str, object_identifier: &str, lastmod: &str) -> Self {
        let loc = format!("https://source/openbis/DATA_SET/{code}/M");
        Self::new(loc, "DATA_SET", code, "RAW", lastmod).attr("sample", object_identifier)
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.retain(|(n, _)| n != name);
        self.attrs.push((name.to_string(), value.to_string()));
        self
    }

    pub fn connect(mut self, to: &str, kind: &str) -> Self {
        self.connections.push((to.to_string(), kind.to_string()));
        self
    }

    pub fn property(mut self, code: &str, value: &str) -> Self {
        self.properties.push((code.to_string(), value.to_string()));
        self
    }

    pub fn file(mut self, path: &str, length: u64, crc32: i64) -> Self {
        self.files.push((path.to_string(), length, crc32));
        self
    }

    pub fn attachment(mut self, file_name: &str, version: u32, title: &str) -> Self {
        self.attachments
            .push((file_name.to_string(), version, title.to_string()));
        self
    }

    fn render(&self) -> String {
        let attrs: Vec<String> = self
            .attrs
            .iter()
            .map(|(name, value)| format!("{name}=\"{value}\""))
            .collect();
        let mut xd = format!("      <x:xd {}>\n", attrs.join(" "));
        if !self.connections.is_empty() {
            xd.push_str("        <x:connections>\n");
            for (to, kind) in &self.connections {
                xd.push_str(&format!(
                    "          <x:connection to=\"{to}\" type=\"{kind}\"/>\n"
                ));
            }
            xd.push_str("        </x:connections>\n");
        }
        if !self.properties.is_empty() {
            xd.push_str("        <x:properties>\n");
            for (code, value) in &self.properties {
                xd.push_str(&format!(
                    "          <x:property><x:code>{code}</x:code><x:value>{value}</x:value></x:property>\n"
                ));
            }
            xd.push_str("        </x:properties>\n");
        }
        if !self.files.is_empty() || !self.attachments.is_empty() {
            xd.push_str("        <x:binaryData>\n");
            for (path, length, crc32) in &self.files {
                xd.push_str(&format!(
                    "          <x:fileNode path=\"{path}\" length=\"{length}\" crc32checksum=\"{crc32}\"/>\n"
                ));
            }
            for (file_name, version, title) in &self.attachments {
                xd.push_str(&format!(
                    "          <x:attachment fileName=\"{file_name}\" latestVersion=\"{version}\" title=\"{title}\" description=\"\" permlink=\"https://source/attachment/{file_name}\"/>\n"
                ));
            }
            xd.push_str("        </x:binaryData>\n");
        }
        xd.push_str("      </x:xd>");
        format!(
            "\n  <url>\n    <loc>{}</loc>\n    <lastmod>{}</lastmod>\n{xd}\n  </url>",
            self.loc, self.lastmod
        )
    }
}

/// Renders a complete resource list published at `at`.
pub fn resource_list(at: &str, entries: &[Entry]) -> String {
    resource_list_with_master_data(at, MASTER_DATA, entries)
}

pub fn resource_list_with_master_data(at: &str, master_data: &str, entries: &[Entry]) -> String {
    let mut doc = format!(
        "{HEAD}\n  <rs:md capability=\"resourcelist\" at=\"{at}\"/>\n  <url>\n    <loc>https://source/openbis/MASTER_DATA/MASTER_DATA/M</loc>\n    <lastmod>{at}</lastmod>\n    <xmd:masterData>{master_data}\n    </xmd:masterData>\n  </url>"
    );
    for entry in entries {
        doc.push_str(&entry.render());
    }
    doc.push_str("\n</urlset>\n");
    doc
}

/// A data source whose document the test swaps between runs.
#[derive(Default)]
pub struct StaticSource {
    document: Mutex<String>,
}

impl StaticSource {
    pub fn set(&self, document: String) {
        *self.document.lock().unwrap() = document;
    }
}

#[async_trait]
impl DocumentSource for StaticSource {
    async fn fetch_resource_list(&self) -> harvester::Result<String> {
        Ok(self.document.lock().unwrap().clone())
    }
}

pub struct TestContext {
    pub temp_dir: TempDir,
    pub config: HarvesterConfig,
    pub source: Arc<StaticSource>,
    pub catalog: Arc<MemoryCatalog>,
}

impl TestContext {
    pub fn harvester(&self) -> Harvester {
        self.harvester_with(self.config.clone())
    }

    pub fn harvester_with(&self, config: HarvesterConfig) -> Harvester {
        Harvester::new(
            config,
            self.source.clone(),
            self.catalog.clone(),
            self.catalog.clone(),
        )
    }
}

pub fn init_test_context() -> anyhow::Result<TestContext> {
    let _ = env_logger::builder().is_test(true).try_init();
    let temp_dir = tempfile::tempdir()?;
    let config = HarvesterConfig {
        state_dir: temp_dir.path().join("state"),
        max_parallel_registrations: Some(2),
        ..HarvesterConfig::default()
    };
    Ok(TestContext {
        temp_dir,
        config,
        source: Arc::new(StaticSource::default()),
        catalog: Arc::new(MemoryCatalog::new()),
    })
}
