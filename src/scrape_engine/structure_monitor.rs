//! Structural drift detection
//!
//! A baseline snapshot of the selectors extraction depends on is captured once
//! per run. Later snapshots are diffed against it; the result is a list of
//! advisory changes. Nothing here stops extraction.

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};

use super::polling::ProbeError;
use crate::driver::{DriverResult, PageDriver};

/// Attributes whose change means the element was renamed/restyled
pub const IDENTIFYING_ATTRIBUTES: &[&str] = &["class", "id"];

/// A selector extraction relies on
#[derive(Debug, Clone)]
pub struct CriticalSelector {
    pub name: String,
    pub css: String,
    /// Losing a critical element is a HIGH severity change
    pub critical: bool,
    /// Extra attributes to track beyond class/id/data-*
    pub key_attributes: Vec<String>,
    selector: Selector,
}

impl CriticalSelector {
    pub fn new(name: &str, css: &str, critical: bool) -> Result<Self, ProbeError> {
        let selector = Selector::parse(css).map_err(|e| ProbeError::InvalidSelector {
            selector: css.to_string(),
            message: format!("{e:?}"),
        })?;
        Ok(Self {
            name: name.to_string(),
            css: css.to_string(),
            critical,
            key_attributes: Vec::new(),
            selector,
        })
    }

    #[must_use]
    pub fn with_key_attribute(mut self, attribute: &str) -> Self {
        self.key_attributes.push(attribute.to_string());
        self
    }

    fn is_identifying(&self, attribute: &str) -> bool {
        IDENTIFYING_ATTRIBUTES.contains(&attribute)
            || attribute.starts_with("data-")
            || self.key_attributes.iter().any(|a| a == attribute)
    }
}

/// Snapshot of one selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementSnapshot {
    pub exists: bool,
    pub count: usize,
    /// Identifying attributes of the first match
    pub key_attributes: BTreeMap<String, String>,
}

/// Cheap whole-page markers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PageMetadata {
    pub has_tables: bool,
    pub table_count: usize,
    pub link_count: usize,
    pub form_count: usize,
    pub script_count: usize,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureSnapshot {
    pub elements: BTreeMap<String, ElementSnapshot>,
    pub metadata: PageMetadata,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureChange {
    pub element: String,
    pub severity: Severity,
    pub message: String,
}

fn element_snapshot(document: &Html, selector: &CriticalSelector) -> ElementSnapshot {
    let matches: Vec<ElementRef<'_>> = document.select(&selector.selector).collect();
    let key_attributes = matches
        .first()
        .map(|el| {
            el.value()
                .attrs()
                .filter(|(name, _)| selector.is_identifying(name))
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect()
        })
        .unwrap_or_default();
    ElementSnapshot {
        exists: !matches.is_empty(),
        count: matches.len(),
        key_attributes,
    }
}

fn count(document: &Html, css: &str) -> usize {
    Selector::parse(css)
        .map(|s| document.select(&s).count())
        .unwrap_or(0)
}

fn page_metadata(document: &Html) -> PageMetadata {
    let table_count = count(document, "table");
    let title = Selector::parse("title").ok().and_then(|s| {
        document
            .select(&s)
            .next()
            .map(|t| t.text().collect::<String>().trim().to_string())
    });
    PageMetadata {
        has_tables: table_count > 0,
        table_count,
        link_count: count(document, "a[href]"),
        form_count: count(document, "form"),
        script_count: count(document, "script"),
        title,
    }
}

/// Compare a snapshot against a baseline
#[must_use]
pub fn diff_snapshots(
    selectors: &[CriticalSelector],
    baseline: &StructureSnapshot,
    current: &StructureSnapshot,
) -> Vec<StructureChange> {
    let mut changes = Vec::new();
    let missing = ElementSnapshot {
        exists: false,
        count: 0,
        key_attributes: BTreeMap::new(),
    };

    for selector in selectors {
        let before = baseline.elements.get(&selector.name).unwrap_or(&missing);
        let after = current.elements.get(&selector.name).unwrap_or(&missing);
        let name = &selector.name;

        if before.exists && !after.exists {
            changes.push(StructureChange {
                element: name.clone(),
                severity: if selector.critical { Severity::High } else { Severity::Medium },
                message: format!("'{}' ({}) no longer present", name, selector.css),
            });
            continue;
        }
        if !before.exists && after.exists {
            changes.push(StructureChange {
                element: name.clone(),
                severity: Severity::Low,
                message: format!("'{name}' appeared with {} matches", after.count),
            });
            continue;
        }
        if !before.exists {
            continue;
        }

        for (attribute, old_value) in &before.key_attributes {
            let new_value = after.key_attributes.get(attribute);
            if new_value != Some(old_value) {
                changes.push(StructureChange {
                    element: name.clone(),
                    severity: if selector.critical { Severity::High } else { Severity::Low },
                    message: format!(
                        "'{name}' attribute {attribute} changed from {old_value:?} to {:?}",
                        new_value.map(String::as_str).unwrap_or("<removed>")
                    ),
                });
            }
        }
        for attribute in after.key_attributes.keys() {
            if !before.key_attributes.contains_key(attribute) {
                changes.push(StructureChange {
                    element: name.clone(),
                    severity: Severity::Low,
                    message: format!("'{name}' gained attribute {attribute}"),
                });
            }
        }

        if before.count != after.count {
            changes.push(StructureChange {
                element: name.clone(),
                severity: Severity::Medium,
                message: format!("'{name}' count changed from {} to {}", before.count, after.count),
            });
        }
    }

    let (b, c) = (&baseline.metadata, &current.metadata);
    let mut metadata_change = |field: &str, old: String, new: String| {
        if old != new {
            changes.push(StructureChange {
                element: format!("page.{field}"),
                severity: Severity::Low,
                message: format!("{field} changed from {old} to {new}"),
            });
        }
    };
    metadata_change("has_tables", b.has_tables.to_string(), c.has_tables.to_string());
    metadata_change("table_count", b.table_count.to_string(), c.table_count.to_string());
    metadata_change("link_count", b.link_count.to_string(), c.link_count.to_string());
    metadata_change("form_count", b.form_count.to_string(), c.form_count.to_string());
    metadata_change("script_count", b.script_count.to_string(), c.script_count.to_string());
    metadata_change("title", format!("{:?}", b.title), format!("{:?}", c.title));

    changes
}

/// Holds the run's baseline and diffs later pages against it
#[derive(Debug)]
pub struct StructureChangeMonitor {
    selectors: Vec<CriticalSelector>,
    baseline: parking_lot::RwLock<Option<StructureSnapshot>>,
    checks: AtomicU64,
    alerts: AtomicU64,
}

impl StructureChangeMonitor {
    #[must_use]
    pub fn new(selectors: Vec<CriticalSelector>) -> Self {
        Self {
            selectors,
            baseline: parking_lot::RwLock::new(None),
            checks: AtomicU64::new(0),
            alerts: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn selectors(&self) -> &[CriticalSelector] {
        &self.selectors
    }

    /// Snapshot a page's HTML
    #[must_use]
    pub fn snapshot_html(&self, html: &str) -> StructureSnapshot {
        let document = Html::parse_document(html);
        StructureSnapshot {
            elements: self
                .selectors
                .iter()
                .map(|s| (s.name.clone(), element_snapshot(&document, s)))
                .collect(),
            metadata: page_metadata(&document),
            captured_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn baseline(&self) -> Option<StructureSnapshot> {
        self.baseline.read().clone()
    }

    #[must_use]
    pub fn has_baseline(&self) -> bool {
        self.baseline.read().is_some()
    }

    /// Capture the baseline from HTML; later calls return the existing one
    pub fn establish_baseline_from_html(&self, html: &str) -> StructureSnapshot {
        let mut slot = self.baseline.write();
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }
        let snapshot = self.snapshot_html(html);
        let present = snapshot.elements.values().filter(|e| e.exists).count();
        info!(
            "Structure baseline established: {present}/{} selectors present",
            self.selectors.len()
        );
        *slot = Some(snapshot.clone());
        snapshot
    }

    pub async fn establish_baseline(&self, page: &dyn PageDriver) -> DriverResult<StructureSnapshot> {
        if let Some(existing) = self.baseline() {
            return Ok(existing);
        }
        let html = page.content().await?;
        Ok(self.establish_baseline_from_html(&html))
    }

    /// Diff HTML against the baseline. Without a baseline, this one becomes it.
    pub fn detect_changes_from_html(&self, html: &str) -> Vec<StructureChange> {
        let Some(baseline) = self.baseline() else {
            self.establish_baseline_from_html(html);
            return Vec::new();
        };
        self.checks.fetch_add(1, Ordering::Relaxed);

        let current = self.snapshot_html(html);
        let changes = diff_snapshots(&self.selectors, &baseline, &current);
        self.report(&changes);
        changes
    }

    pub async fn detect_changes(&self, page: &dyn PageDriver) -> DriverResult<Vec<StructureChange>> {
        let html = page.content().await?;
        Ok(self.detect_changes_from_html(&html))
    }

    fn report(&self, changes: &[StructureChange]) {
        let Some(worst) = changes.iter().map(|c| c.severity).max() else {
            return;
        };
        self.alerts.fetch_add(1, Ordering::Relaxed);
        match worst {
            Severity::High => {
                for change in changes.iter().filter(|c| c.severity == Severity::High) {
                    error!(element = %change.element, "Site structure changed: {}", change.message);
                }
            }
            Severity::Medium => warn!("{} structural differences from baseline", changes.len()),
            Severity::Low => info!("{} minor structural differences from baseline", changes.len()),
        }
    }

    /// (diff checks run, checks that found changes)
    #[must_use]
    pub fn counters(&self) -> (u64, u64) {
        (
            self.checks.load(Ordering::Relaxed),
            self.alerts.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> StructureChangeMonitor {
        StructureChangeMonitor::new(vec![
            CriticalSelector::new("ladder_table", "table.ladder", true).unwrap(),
            CriticalSelector::new("fixture_rows", "ul.fixtures li", true).unwrap(),
            CriticalSelector::new("sponsor_banner", "div.sponsor", false).unwrap(),
        ])
    }

    const PAGE: &str = r#"<html><head><title>Ladder</title></head><body>
        <table class="ladder" data-testid="ladder"><tr><td>A</td></tr></table>
        <ul class="fixtures"><li>R1</li><li>R2</li></ul>
        <div class="sponsor"></div><a href="/x">x</a></body></html>"#;

    #[test]
    fn test_identical_snapshot_has_no_changes() {
        let m = monitor();
        m.establish_baseline_from_html(PAGE);
        assert!(m.detect_changes_from_html(PAGE).is_empty());
    }

    #[test]
    fn test_missing_critical_element_is_high() {
        let m = monitor();
        m.establish_baseline_from_html(PAGE);
        let changed = PAGE.replace(r#"class="ladder""#, r#"class="standings""#);
        let changes = m.detect_changes_from_html(&changed);
        assert!(changes.iter().any(|c| c.element == "ladder_table" && c.severity == Severity::High));
    }

    #[test]
    fn test_renamed_data_attribute_is_high() {
        let m = monitor();
        m.establish_baseline_from_html(PAGE);
        let changed = PAGE.replace(r#"data-testid="ladder""#, r#"data-testid="standings""#);
        let changes = m.detect_changes_from_html(&changed);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].severity, Severity::High);
    }

    #[test]
    fn test_count_change_is_medium_and_metadata_low() {
        let m = monitor();
        m.establish_baseline_from_html(PAGE);
        let changed = PAGE.replace("<li>R2</li>", "").replace(r#"<a href="/x">x</a>"#, "");
        let changes = m.detect_changes_from_html(&changed);
        assert!(changes.iter().any(|c| c.element == "fixture_rows" && c.severity == Severity::Medium));
        assert!(changes.iter().any(|c| c.element == "page.link_count" && c.severity == Severity::Low));
    }

    #[test]
    fn test_baseline_captured_once() {
        let m = monitor();
        let first = m.establish_baseline_from_html(PAGE);
        let second = m.establish_baseline_from_html("<html></html>");
        assert_eq!(first.elements, second.elements);
    }
}
