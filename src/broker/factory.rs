//! 对象工厂：按 subtype 注册构造器，把持久化配置变成活动对象

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::BrokerObject;
use crate::error::{BrokerError, Result};

/// 对象类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Channel,
    DocumentRepository,
    Resource,
    Task,
    Tool,
    Tracker,
    Worker,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Channel => "channel",
            ObjectKind::DocumentRepository => "document_repository",
            ObjectKind::Resource => "resource",
            ObjectKind::Task => "task",
            ObjectKind::Tool => "tool",
            ObjectKind::Tracker => "tracker",
            ObjectKind::Worker => "worker",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 持久化的对象配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub subtype: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub variables: serde_json::Value,
}

impl ObjectConfig {
    pub fn new(id: impl Into<String>, kind: ObjectKind, subtype: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            subtype: subtype.into(),
            name: String::new(),
            variables: serde_json::Value::Null,
        }
    }

    pub fn with_variables(mut self, variables: serde_json::Value) -> Self {
        self.variables = variables;
        self
    }

    pub fn variable(&self, name: &str) -> Option<&serde_json::Value> {
        self.variables.get(name)
    }
}

type Constructor<A> = Box<dyn Fn(&ObjectConfig) -> anyhow::Result<A> + Send + Sync>;

pub struct ObjectFactory<A> {
    constructors: HashMap<String, Constructor<A>>,
}

impl<A: BrokerObject> ObjectFactory<A> {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// 注册 subtype 构造器（同名覆盖）
    pub fn register<F>(mut self, subtype: &str, constructor: F) -> Self
    where
        F: Fn(&ObjectConfig) -> anyhow::Result<A> + Send + Sync + 'static,
    {
        self.constructors.insert(subtype.to_string(), Box::new(constructor));
        self
    }

    pub fn supports(&self, subtype: &str) -> bool {
        self.constructors.contains_key(subtype)
    }

    pub fn create(&self, config: &ObjectConfig) -> Result<Arc<A>> {
        let constructor = self
            .constructors
            .get(&config.subtype)
            .ok_or_else(|| BrokerError::UnsupportedSubtype(config.subtype.clone()))?;
        constructor(config).map(Arc::new).map_err(|e| {
            tracing::error!(object_id = %config.id, subtype = %config.subtype, error = %e, "Failed to construct object");
            BrokerError::Backend(format!("failed to construct {} {}: {}", config.kind, config.id, e))
        })
    }
}

impl<A: BrokerObject> Default for ObjectFactory<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_wire_format() {
        let config: ObjectConfig = serde_json::from_str(
            r#"{"id":"ch-1","type":"channel","subtype":"mock","variables":{"endCount":2}}"#,
        )
        .unwrap();
        assert_eq!(config.kind, ObjectKind::Channel);
        assert_eq!(config.variable("endCount"), Some(&serde_json::json!(2)));
        assert_eq!(ObjectKind::DocumentRepository.as_str(), "document_repository");
    }
}
