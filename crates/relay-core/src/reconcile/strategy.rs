//! Match strategies and patch construction.
//!
//! Strategies are tried in `MatchStrategy` order; the first that matches a
//! document decides how it is patched.

use crate::config::FieldSet;
use crate::ledger::MigrationRow;
use crate::models::MatchStrategy;
use crate::store::{Filter, Patch};
use serde_json::Value;

/// The asset a reconciliation is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileTarget {
    pub id: String,
    pub old_locator: String,
    pub new_locator: String,
}

impl ReconcileTarget {
    pub fn new(
        id: impl Into<String>,
        old_locator: impl Into<String>,
        new_locator: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            old_locator: old_locator.into(),
            new_locator: new_locator.into(),
        }
    }

    /// Trailing filename of the old locator.
    pub fn filename(&self) -> Option<&str> {
        filename_segment(&self.old_locator)
    }
}

impl From<&MigrationRow> for ReconcileTarget {
    fn from(row: &MigrationRow) -> Self {
        Self::new(
            row.identifier.clone(),
            row.source_locator.clone(),
            row.destination_locator.clone(),
        )
    }
}

/// Last path segment of a locator with any query string or fragment removed.
pub fn filename_segment(locator: &str) -> Option<&str> {
    let end = locator.find(['?', '#']).unwrap_or(locator.len());
    let name = locator[..end].rsplit('/').next()?;
    (!name.is_empty() && !name.contains(':')).then_some(name)
}

/// Whether a single locator string satisfies a field-based strategy.
fn locator_hit(strategy: MatchStrategy, value: &str, target: &ReconcileTarget) -> bool {
    match strategy {
        MatchStrategy::ExactUrl => !target.old_locator.is_empty() && value == target.old_locator,
        MatchStrategy::SubstringId => !target.id.is_empty() && value.contains(&target.id),
        MatchStrategy::SubstringFilename => target.filename().is_some_and(|f| value.contains(f)),
        MatchStrategy::ExactId | MatchStrategy::ContentScan => false,
    }
}

fn value_hit(strategy: MatchStrategy, value: &Value, target: &ReconcileTarget) -> bool {
    match value {
        Value::String(s) => locator_hit(strategy, s, target),
        Value::Array(items) => items
            .iter()
            .any(|v| v.as_str().is_some_and(|s| locator_hit(strategy, s, target))),
        _ => false,
    }
}

/// Whether `strategy` on its own matches a document body.
pub fn matches(
    strategy: MatchStrategy,
    body: &Value,
    target: &ReconcileTarget,
    fields: &FieldSet,
) -> bool {
    match strategy {
        MatchStrategy::ExactId => {
            !target.id.is_empty()
                && Filter::eq(fields.external_id.as_str(), target.id.as_str()).matches(body)
        }
        MatchStrategy::ContentScan => {
            !target.id.is_empty()
                && body
                    .get(&fields.content)
                    .and_then(Value::as_str)
                    .is_some_and(|c| c.contains(&target.id))
        }
        _ => fields
            .locator_fields()
            .filter_map(|f| body.get(f))
            .any(|v| value_hit(strategy, v, target)),
    }
}

/// First strategy, in priority order, that matches the document.
pub fn classify(body: &Value, target: &ReconcileTarget, fields: &FieldSet) -> Option<MatchStrategy> {
    MatchStrategy::ALL
        .into_iter()
        .find(|s| matches(*s, body, target, fields))
}

/// Query that fetches every document any strategy could match.
pub fn candidate_filter(target: &ReconcileTarget, fields: &FieldSet) -> Filter {
    let mut any = Vec::new();
    if !target.id.is_empty() {
        any.push(Filter::eq(fields.external_id.as_str(), target.id.as_str()));
    }
    for field in fields.locator_fields() {
        if !target.old_locator.is_empty() {
            any.push(Filter::eq(field, target.old_locator.as_str()));
        }
        any.push(Filter::contains(field, target.id.as_str()));
        if let Some(name) = target.filename() {
            any.push(Filter::contains(field, name));
        }
    }
    any.push(Filter::contains(fields.content.as_str(), target.id.as_str()));
    any.retain(|f| !matches!(f, Filter::Contains(_, needle) if needle.is_empty()));
    Filter::Any(any)
}

/// Replace every array element satisfying `hit`; `None` when nothing changed.
/// Replace `old` with `new` in `text`, leaving occurrences of `old` that
/// already sit inside an occurrence of `new` untouched.
pub(crate) fn replace_locator(text: &str, old: &str, new: &str) -> String {
    if old.is_empty() {
        return text.to_string();
    }
    let settled: Vec<(usize, usize)> = if new.contains(old) {
        text.match_indices(new).map(|(i, m)| (i, i + m.len())).collect()
    } else {
        Vec::new()
    };

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (i, m) in text.match_indices(old) {
        let end = i + m.len();
        if settled.iter().any(|&(start, stop)| start <= i && end <= stop) {
            continue;
        }
        out.push_str(&text[last..i]);
        out.push_str(new);
        last = end;
    }
    out.push_str(&text[last..]);
    out
}

fn replace_elements(
    items: &[Value],
    replacement: &str,
    hit: impl Fn(&str) -> bool,
) -> Option<Value> {
    let mut modified = false;
    let replaced = items
        .iter()
        .map(|v| match v.as_str() {
            Some(s) if hit(s) && s != replacement => {
                modified = true;
                Value::String(replacement.to_string())
            }
            _ => v.clone(),
        })
        .collect();
    modified.then_some(Value::Array(replaced))
}

/// Changes that bring a matched document up to date.
///
/// Entries equal to the current value are dropped, so an empty patch means
/// the document already references the new locator.
pub fn build_patch(
    body: &Value,
    strategy: MatchStrategy,
    target: &ReconcileTarget,
    fields: &FieldSet,
) -> Patch {
    let mut patch = Patch::new();
    let new_locator = target.new_locator.as_str();

    match strategy {
        MatchStrategy::ExactId | MatchStrategy::ContentScan => {
            // Rewrite any locator field that still points at the asset; the
            // primary field is only set when nothing references it yet.
            let hit = |s: &str| {
                locator_hit(MatchStrategy::ExactUrl, s, target)
                    || locator_hit(MatchStrategy::SubstringId, s, target)
                    || locator_hit(MatchStrategy::SubstringFilename, s, target)
            };
            let mut referenced = false;
            for field in fields.locator_fields() {
                match body.get(field) {
                    Some(Value::String(s)) if s == new_locator => referenced = true,
                    Some(Value::String(s)) if hit(s) => {
                        patch.insert(field.to_string(), Value::String(new_locator.to_string()));
                        referenced = true;
                    }
                    Some(Value::Array(items)) => {
                        if items.iter().any(|v| v.as_str() == Some(new_locator)) {
                            referenced = true;
                        }
                        if let Some(updated) = replace_elements(items, new_locator, hit) {
                            patch.insert(field.to_string(), updated);
                            referenced = true;
                        }
                    }
                    _ => {}
                }
            }
            if !referenced {
                let value = match body.get(&fields.primary) {
                    Some(Value::Array(_)) => Value::Array(vec![Value::String(new_locator.to_string())]),
                    _ => Value::String(new_locator.to_string()),
                };
                patch.insert(fields.primary.clone(), value);
            }
        }
        _ => {
            for field in fields.locator_fields() {
                match body.get(field) {
                    Some(Value::String(s)) if locator_hit(strategy, s, target) => {
                        patch.insert(field.to_string(), Value::String(new_locator.to_string()));
                    }
                    Some(Value::Array(items)) => {
                        let hit = |s: &str| locator_hit(strategy, s, target);
                        if let Some(updated) = replace_elements(items, new_locator, hit) {
                            patch.insert(field.to_string(), updated);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    if !target.old_locator.is_empty() {
        if let Some(content) = body.get(&fields.content).and_then(Value::as_str) {
            let replaced = replace_locator(content, &target.old_locator, new_locator);
            if replaced != content {
                patch.insert(fields.content.clone(), Value::String(replaced));
            }
        }
    }

    patch.insert(fields.external_id.clone(), Value::String(target.id.clone()));
    patch.retain(|field, value| body.get(field) != Some(value));
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target() -> ReconcileTarget {
        ReconcileTarget::new(
            "folder/abc123",
            "https://old/abc123.jpg",
            "https://new/abc123.jpg",
        )
    }

    #[test]
    fn test_filename_segment() {
        assert_eq!(filename_segment("https://old/a/b/abc.jpg"), Some("abc.jpg"));
        assert_eq!(filename_segment("https://old/abc.jpg?v=2#top"), Some("abc.jpg"));
        assert_eq!(filename_segment("abc.jpg"), Some("abc.jpg"));
        assert_eq!(filename_segment(""), None);
        assert_eq!(filename_segment("https://"), None);
    }

    #[test]
    fn test_each_strategy_independently() {
        let fields = FieldSet::default();
        let t = target();
        let by_id = json!({"imgId": "folder/abc123"});
        let by_url = json!({"image": "https://old/abc123.jpg"});
        let by_sub_id = json!({"photos": ["x", "https://cdn/folder/abc123.png"]});
        let by_name = json!({"gallery": "https://mirror/abc123.jpg"});
        let by_content = json!({"content": "<img data-id=\"folder/abc123\">"});

        assert!(matches(MatchStrategy::ExactId, &by_id, &t, &fields));
        assert!(matches(MatchStrategy::ExactUrl, &by_url, &t, &fields));
        assert!(matches(MatchStrategy::SubstringId, &by_sub_id, &t, &fields));
        assert!(matches(MatchStrategy::SubstringFilename, &by_name, &t, &fields));
        assert!(matches(MatchStrategy::ContentScan, &by_content, &t, &fields));

        assert!(!matches(MatchStrategy::ExactUrl, &by_name, &t, &fields));
        assert!(!matches(MatchStrategy::ExactId, &by_url, &t, &fields));
    }

    #[test]
    fn test_classify_takes_first_in_priority_order() {
        let fields = FieldSet::default();
        let both = json!({"imgId": "folder/abc123", "image": "https://old/abc123.jpg"});
        assert_eq!(classify(&both, &target(), &fields), Some(MatchStrategy::ExactId));
        let url = json!({"image": "https://old/abc123.jpg"});
        assert_eq!(classify(&url, &target(), &fields), Some(MatchStrategy::ExactUrl));
        assert_eq!(classify(&json!({"image": "other"}), &target(), &fields), None);
    }

    #[test]
    fn test_candidate_filter_covers_classification() {
        let fields = FieldSet::default();
        let filter = candidate_filter(&target(), &fields);
        for body in [
            json!({"imgId": "folder/abc123"}),
            json!({"image": "https://old/abc123.jpg"}),
            json!({"images": ["https://mirror/abc123.jpg"]}),
            json!({"content": "see folder/abc123"}),
        ] {
            assert!(filter.matches(&body), "{}", body);
        }
        assert!(!filter.matches(&json!({"image": "https://old/zzz.jpg"})));
    }

    #[test]
    fn test_patch_replaces_field_content_and_sets_id() {
        let fields = FieldSet::default();
        let body = json!({
            "image": "https://old/abc123.jpg",
            "gallery": ["https://old/abc123.jpg", "keep"],
            "content": "a https://old/abc123.jpg b https://old/abc123.jpg",
        });
        let patch = build_patch(&body, MatchStrategy::ExactUrl, &target(), &fields);
        assert_eq!(patch["image"], "https://new/abc123.jpg");
        assert_eq!(patch["gallery"], json!(["https://new/abc123.jpg", "keep"]));
        assert_eq!(
            patch["content"],
            "a https://new/abc123.jpg b https://new/abc123.jpg"
        );
        assert_eq!(patch["imgId"], "folder/abc123");
    }

    #[test]
    fn test_patch_empty_when_current() {
        let fields = FieldSet::default();
        let body = json!({"image": "https://new/abc123.jpg", "imgId": "folder/abc123"});
        let patch = build_patch(&body, MatchStrategy::ExactId, &target(), &fields);
        assert!(patch.is_empty());
    }

    #[test]
    fn test_exact_id_targets_primary_field() {
        let fields = FieldSet::default();
        let body = json!({"imgId": "folder/abc123", "image": "https://elsewhere/old.png"});
        let patch = build_patch(&body, MatchStrategy::ExactId, &target(), &fields);
        assert_eq!(patch.len(), 1);
        assert_eq!(patch["image"], "https://new/abc123.jpg");
    }

    #[test]
    fn test_replace_locator_skips_settled_occurrences() {
        let old = "https://cdn/a.jpg";
        let new = "https://cdn/a.jpg?v=2";
        let once = replace_locator("<img src=\"https://cdn/a.jpg\">", old, new);
        assert_eq!(once, "<img src=\"https://cdn/a.jpg?v=2\">");
        assert_eq!(replace_locator(&once, old, new), once);
        assert_eq!(
            replace_locator("x https://cdn/a.jpg?v=2 y https://cdn/a.jpg", old, new),
            "x https://cdn/a.jpg?v=2 y https://cdn/a.jpg?v=2"
        );
        assert_eq!(replace_locator("abc", "", "x"), "abc");
    }

    #[test]
    fn test_content_patch_converges_when_new_contains_old() {
        let fields = FieldSet::default();
        let t = ReconcileTarget::new("a", "https://cdn/a.jpg", "https://cdn/a.jpg?v=2");
        let mut body = json!({"imgId": "a", "content": "<img src=\"https://cdn/a.jpg\">"});

        let patch = build_patch(&body, MatchStrategy::ExactId, &t, &fields);
        assert_eq!(patch["content"], "<img src=\"https://cdn/a.jpg?v=2\">");
        let doc = body.as_object_mut().unwrap();
        for (field, value) in patch {
            doc.insert(field, value);
        }

        assert!(build_patch(&body, MatchStrategy::ExactId, &t, &fields).is_empty());
    }
}
