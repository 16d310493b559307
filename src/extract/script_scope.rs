use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use super::{shape, ExtractionResult, Strategy};
use crate::browser::BrowserSession;

pub const DEFAULT_GLOBALS: &[&str] = &[
    "reportData",
    "vesselsData",
    "vessels",
    "tableData",
    "gridData",
    "initialData",
];

/// Collects JSON-safe globals: the known names first, then every enumerable
/// plain object or array on `window`. Returns a JSON string so the result
/// survives by-reference evaluation.
const SCAN_JS: &str = r#"(() => {
  const known = __KNOWN__;
  const skip = new Set(['window', 'self', 'top', 'parent', 'frames', 'document',
    'globalThis', 'location', 'navigator', 'history', 'localStorage', 'sessionStorage']);
  const seen = new Set();
  const out = [];
  const take = (name, value) => {
    if (value === null || typeof value !== 'object' || seen.has(name)) return;
    seen.add(name);
    try {
      const text = JSON.stringify(value);
      if (text && text.length < 20000000) out.push({ name, value: JSON.parse(text) });
    } catch (e) {}
  };
  for (const name of known) {
    try { take(name, window[name]); } catch (e) {}
  }
  for (const name of Object.keys(window)) {
    if (skip.has(name) || seen.has(name)) continue;
    let value;
    try { value = window[name]; } catch (e) { continue; }
    if (value === null || typeof value !== 'object') continue;
    if (typeof Node !== 'undefined' && value instanceof Node) continue;
    if (Array.isArray(value) || Object.getPrototypeOf(value) === Object.prototype) take(name, value);
  }
  return JSON.stringify(out);
})()"#;

#[derive(Debug, Deserialize)]
pub struct GlobalCandidate {
    pub name: String,
    pub value: Value,
}

/// Looks for vessel records parked in page globals.
pub struct ScriptScopeExtractor {
    known: Vec<String>,
}

impl Default for ScriptScopeExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_GLOBALS.iter().map(|s| s.to_string()).collect())
    }
}

impl ScriptScopeExtractor {
    pub fn new(known: Vec<String>) -> Self {
        Self { known }
    }

    pub fn scan_script(&self) -> String {
        let names = serde_json::to_string(&self.known).unwrap_or_else(|_| "[]".into());
        SCAN_JS.replace("__KNOWN__", &names)
    }

    /// First candidate whose records carry an `imo`/`mmsi` key, in scan order.
    pub fn select(candidates: Vec<GlobalCandidate>) -> ExtractionResult {
        candidates
            .into_iter()
            .find(|c| shape::is_vessel_shaped_strict(&c.value))
            .map(|c| ExtractionResult::found(c.value, format!("global window.{}", c.name)))
            .unwrap_or(ExtractionResult::NotFound)
    }
}

impl Strategy for ScriptScopeExtractor {
    fn name(&self) -> &'static str {
        "script-scope"
    }

    fn attempt(&self, page: &dyn BrowserSession) -> Result<ExtractionResult> {
        let raw = page.evaluate(&self.scan_script())?;
        let candidates: Vec<GlobalCandidate> = match raw {
            Value::String(text) => {
                serde_json::from_str(&text).context("Global scan returned malformed JSON")?
            }
            Value::Null => Vec::new(),
            other => serde_json::from_value(other).context("Unexpected global scan result")?,
        };
        Ok(Self::select(candidates))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::extract::tests::StaticPage;

    fn page(eval: Value) -> StaticPage {
        StaticPage {
            html: String::new(),
            eval,
        }
    }

    #[test]
    fn finds_report_data() {
        let scan = json!([
            {"name": "config", "value": {"theme": "dark"}},
            {"name": "reportData", "value": {"data": [{"imo": "123", "mmsi": "456"}]}}
        ]);
        let result = ScriptScopeExtractor::default()
            .attempt(&page(Value::String(scan.to_string())))
            .unwrap();
        match result {
            ExtractionResult::Found(e) => {
                assert_eq!(e.source, "global window.reportData");
                assert_eq!(e.payload["data"][0]["imo"], "123");
            }
            ExtractionResult::NotFound => panic!("expected reportData"),
        }
    }

    #[test]
    fn bare_array_global() {
        let scan = json!([{"name": "ships", "value": [{"MMSI": 1}]}]);
        let result = ScriptScopeExtractor::default().attempt(&page(scan)).unwrap();
        assert!(result.is_found());
    }

    #[test]
    fn shapeless_globals_are_not_found() {
        let scan = json!([
            {"name": "dataLayer", "value": [{"event": "gtm.js"}]},
            {"name": "state", "value": {"results": []}}
        ]);
        let result = ScriptScopeExtractor::default()
            .attempt(&page(Value::String(scan.to_string())))
            .unwrap();
        assert_eq!(result, ExtractionResult::NotFound);
    }

    #[test]
    fn unrelated_object_global_does_not_shadow_fleet() {
        let candidates = vec![
            GlobalCandidate {
                name: "chartConfig".into(),
                value: json!({"data": [{"x": 1, "y": 2}]}),
            },
            GlobalCandidate {
                name: "fleet".into(),
                value: json!([{"IMO": "9321483"}]),
            },
        ];
        match ScriptScopeExtractor::select(candidates) {
            ExtractionResult::Found(e) => {
                assert_eq!(e.source, "global window.fleet");
                assert_eq!(e.payload[0]["IMO"], "9321483");
            }
            ExtractionResult::NotFound => panic!("expected the fleet global"),
        }
    }

    #[test]
    fn malformed_scan_result_is_an_error() {
        let result = ScriptScopeExtractor::default().attempt(&page(Value::String("{oops".into())));
        assert!(result.is_err());
    }

    #[test]
    fn scan_embeds_known_names() {
        let script = ScriptScopeExtractor::new(vec!["a".into(), "b\"c".into()]).scan_script();
        assert!(script.contains(r#"const known = ["a","b\"c"];"#));
    }
}
