use itertools::Itertools;
use serde::{Serialize, Serializer};
use std::{collections::BTreeMap, fmt};

const PARAMS_OPEN: &str = " ( ";
const PARAMS_CLOSE: &str = " )";

/// Identity of one benchmark across runs: the base name plus its parameterization.
///
/// Tools such as JMH embed parameters into the reported name, e.g.
/// `pkg.Bench.read ( {"size":"100","mode":"hot"} )`. Parameters are kept sorted,
/// so two names that only differ in parameter order map to the same key.
/// Values are held as their JSON text, `4` and `"4"` stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BenchmarkKey {
    name: String,
    params: BTreeMap<String, String>,
}

impl BenchmarkKey {
    pub fn new<T: Into<String>>(name: T) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add a string parameter.
    pub fn with_param<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        let value = serde_json::Value::String(value.into()).to_string();
        self.params.insert(key.into(), value);
        self
    }

    /// Split a reported measurement name into base name and parameters.
    ///
    /// Anything that does not parse as `base ( {json object} )` is taken verbatim as
    /// the base name without parameters.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();

        raw.strip_suffix(PARAMS_CLOSE)
            .and_then(|inner| inner.split_once(PARAMS_OPEN))
            .and_then(|(name, params)| {
                let params = parse_params(params)?;

                Some(Self {
                    name: name.trim().to_owned(),
                    params,
                })
            })
            .unwrap_or_else(|| Self::new(raw))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_params(&self) -> bool {
        !self.params.is_empty()
    }

    /// Value of parameter `key`, strings unquoted and anything else as reported.
    pub fn param(&self, key: &str) -> Option<String> {
        let text = self.params.get(key)?;

        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(serde_json::Value::String(string)) => Some(string),
            _ => Some(text.clone()),
        }
    }

    /// Class or namespace segment of the base name, `Bench` for `pkg.Bench.read`.
    pub fn namespace(&self) -> Option<&str> {
        let mut segments = self.name.rsplit('.');
        segments.next()?;
        segments.next().filter(|segment| !segment.is_empty())
    }
}

fn parse_params(raw: &str) -> Option<BTreeMap<String, String>> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;

    let params = value
        .as_object()?
        .iter()
        .map(|(key, value)| (key.clone(), value.to_string()))
        .collect();

    Some(params)
}

impl fmt::Display for BenchmarkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            return f.write_str(&self.name);
        }

        let params = self
            .params
            .iter()
            .map(|(key, value)| format!("{}:{value}", serde_json::Value::String(key.clone())))
            .join(",");

        write!(f, "{}{PARAMS_OPEN}{{{params}}}{PARAMS_CLOSE}", self.name)
    }
}

impl Serialize for BenchmarkKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
