//! Pipeline configuration documents.
//!
//! A configuration is a TOML document where every top-level section names a
//! task and holds the parameters of that task. One section is reserved:
//! `version` records the version strings of the libraries that produced the
//! configuration.
//!
//! ```toml
//! [PointCloud]
//! upstream_task = "Voxels"
//! level_set_value = 1.0
//!
//! [version]
//! plantdash = "0.4.0"
//! ```
//!
//! Parsing only checks the shape of the document. Whether the tasks form a
//! valid dependency graph is decided by [`crate::graph::build`].

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Name of the reserved section holding library versions.
pub const VERSION_SECTION: &str = "version";

/// File name used for configurations stored alongside a dataset.
pub const CONFIG_FILE_NAME: &str = "pipeline.toml";

const DEFAULT_TEMPLATE: &str = include_str!("../assets/geom_pipe_real.toml");

/// Parameters of a single task, in document order.
pub type Params = IndexMap<String, ParamValue>;

/// A parameter value as found in a configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<ParamValue>),
    Table(IndexMap<String, ParamValue>),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }

    fn from_toml(value: toml::Value) -> Self {
        match value {
            toml::Value::String(s) => ParamValue::String(s),
            toml::Value::Integer(i) => ParamValue::Integer(i),
            toml::Value::Float(f) => ParamValue::Float(f),
            toml::Value::Boolean(b) => ParamValue::Boolean(b),
            // Datetimes have no meaning for the pipeline, keep their text.
            toml::Value::Datetime(d) => ParamValue::String(d.to_string()),
            toml::Value::Array(items) => {
                ParamValue::Array(items.into_iter().map(ParamValue::from_toml).collect())
            }
            toml::Value::Table(table) => ParamValue::Table(
                table
                    .into_iter()
                    .map(|(k, v)| (k, ParamValue::from_toml(v)))
                    .collect(),
            ),
        }
    }

    fn to_toml(&self) -> toml::Value {
        match self {
            ParamValue::String(s) => toml::Value::String(s.clone()),
            ParamValue::Integer(i) => toml::Value::Integer(*i),
            ParamValue::Float(f) => toml::Value::Float(*f),
            ParamValue::Boolean(b) => toml::Value::Boolean(*b),
            ParamValue::Array(items) => {
                toml::Value::Array(items.iter().map(ParamValue::to_toml).collect())
            }
            ParamValue::Table(table) => toml::Value::Table(
                table
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_toml()))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Boolean(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Integer(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

/// Ordered mapping from task name to task parameters, plus the optional
/// `version` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    tasks: IndexMap<String, Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<BTreeMap<String, String>>,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// The geometric reconstruction pipeline shipped with the dashboard,
    /// loaded when a dataset has no configuration of its own.
    pub fn default_template() -> Self {
        // The template is compiled in and covered by tests.
        parse(DEFAULT_TEMPLATE).unwrap_or_default()
    }

    /// Text of the default template, comments included.
    pub fn default_template_text() -> &'static str {
        DEFAULT_TEMPLATE
    }

    /// Adds or replaces a task section.
    pub fn with_task<I, K>(mut self, name: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = (K, ParamValue)>,
        K: Into<String>,
    {
        let params = params.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.tasks.insert(name.into(), params);
        self
    }

    pub fn task(&self, name: &str) -> Option<&Params> {
        self.tasks.get(name)
    }

    pub fn contains_task(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Task names in document order.
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn tasks(&self) -> impl Iterator<Item = (&str, &Params)> {
        self.tasks.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Library versions recorded by the run that produced this configuration.
    pub fn version(&self) -> Option<&BTreeMap<String, String>> {
        self.version.as_ref()
    }

    /// Returns a copy whose `version` section is replaced by `versions`.
    pub fn stamped(&self, versions: &BTreeMap<String, String>) -> Self {
        Self {
            tasks: self.tasks.clone(),
            version: Some(versions.clone()),
        }
    }

    /// Serialises the configuration back into a TOML document.
    pub fn to_toml_string(&self) -> String {
        let mut table = toml::Table::new();

        for (name, params) in &self.tasks {
            let section = params
                .iter()
                .map(|(k, v)| (k.clone(), v.to_toml()))
                .collect();
            table.insert(name.clone(), toml::Value::Table(section));
        }

        if let Some(version) = &self.version {
            let section = version
                .iter()
                .map(|(k, v)| (k.clone(), toml::Value::String(v.clone())))
                .collect();
            table.insert(VERSION_SECTION.to_string(), toml::Value::Table(section));
        }

        // Every value is a plain TOML value, serialisation can't fail.
        toml::to_string(&table).unwrap_or_default()
    }
}

/// Parses configuration text.
///
/// Only the document shape is validated: sections must be tables and the
/// `version` section must map names to strings.
pub fn parse(text: &str) -> Result<PipelineConfig, ParseError> {
    let table: toml::Table = text.parse()?;

    let mut config = PipelineConfig::new();

    for (key, value) in table {
        let toml::Value::Table(section) = value else {
            return Err(ParseError::NotASection(key));
        };

        if key == VERSION_SECTION {
            let mut version = BTreeMap::new();
            for (library, value) in section {
                match value {
                    toml::Value::String(v) => {
                        version.insert(library, v);
                    }
                    _ => return Err(ParseError::InvalidVersion(library)),
                }
            }
            config.version = Some(version);
            continue;
        }

        if !is_valid_task_name(&key) {
            return Err(ParseError::InvalidTaskName(key));
        }

        let params = section
            .into_iter()
            .map(|(k, v)| (k, ParamValue::from_toml(v)))
            .collect();
        config.tasks.insert(key, params);
    }

    Ok(config)
}

/// Task names end up in file names of the working area.
pub fn is_valid_task_name(name: &str) -> bool {
    !name.trim().is_empty() && !name.contains(['/', '\\', '\0']) && !name.contains("..")
}

/// Holds the configuration text being edited and the last configuration that
/// parsed successfully.
///
/// Invalid text never replaces the accepted configuration, so views derived
/// from it (task graph, task list) stay on screen while the user types.
#[derive(Debug, Clone)]
pub struct ConfigEditor {
    text: String,
    accepted: PipelineConfig,
    error: Option<String>,
}

impl ConfigEditor {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            text: config.to_toml_string(),
            accepted: config,
            error: None,
        }
    }

    /// Starts from raw text, keeping comments and layout for display.
    pub fn from_text(text: impl Into<String>) -> Result<Self, ParseError> {
        let text = text.into();
        let accepted = parse(&text)?;
        Ok(Self {
            text,
            accepted,
            error: None,
        })
    }

    /// Replaces the edited text. Returns whether the accepted configuration
    /// changed; on a parse error the previous one is kept.
    pub fn update(&mut self, text: impl Into<String>) -> Result<bool, ParseError> {
        self.text = text.into();

        match parse(&self.text) {
            Ok(config) => {
                self.error = None;
                let changed = config != self.accepted;
                self.accepted = config;
                Ok(changed)
            }
            Err(err) => {
                tracing::debug!("keeping last accepted configuration: {err}");
                self.error = Some(err.to_string());
                Err(err)
            }
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn accepted(&self) -> &PipelineConfig {
        &self.accepted
    }

    /// Error of the latest edit, if it didn't parse.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}
