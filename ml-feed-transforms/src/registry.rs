//! Lookup of node factories by kind

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::node::{NodeKind, TransformNode};
use crate::nodes::{BrightnessNode, CopyNode, FlipNode};
use crate::params::{FloatParam, IntParam};

type NodeFactory = dyn Fn(&Value) -> Result<Box<dyn TransformNode>> + Send + Sync;

/// Factories that create nodes from a kind name and JSON arguments
pub struct NodeRegistry {
    factories: HashMap<&'static str, Box<NodeFactory>>,
}

impl NodeRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in nodes registered
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(NodeKind::COPY, |_| Ok(Box::new(CopyNode)));
        registry.register(NodeKind::BRIGHTNESS, |args| {
            let factor = match args.get("factor") {
                Some(value) => serde_json::from_value::<FloatParam>(value.clone())?,
                None => FloatParam::Fixed(1.0),
            };
            Ok(Box::new(BrightnessNode::new(factor)?))
        });
        registry.register(NodeKind::FLIP, |args| {
            let node = match args.get("flag") {
                Some(value) => FlipNode::new(serde_json::from_value::<IntParam>(value.clone())?)?,
                None => FlipNode::default(),
            };
            Ok(Box::new(node))
        });
        registry
    }

    /// Register a factory for `kind`, replacing any previous one
    pub fn register<F>(&mut self, kind: NodeKind, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn TransformNode>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.name(), Box::new(factory));
    }

    /// Whether a factory is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Create a node of kind `name`
    pub fn create(&self, name: &str, args: &Value) -> Result<Box<dyn TransformNode>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownKind(name.to_string()))?;
        factory(args)
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins() {
        let registry = NodeRegistry::with_builtins();
        let node = registry
            .create("brightness", &json!({"factor": {"uniform": {"low": 0.5, "high": 1.5}}}))
            .unwrap();
        assert_eq!(node.kind(), NodeKind::BRIGHTNESS);
        assert_eq!(registry.create("flip", &json!({})).unwrap().kind(), NodeKind::FLIP);
        assert!(registry
            .create("brightness", &json!({"factor": {"choice": []}}))
            .is_err());
    }

    #[test]
    fn test_unknown_and_custom_kinds() {
        let mut registry = NodeRegistry::new();
        assert!(matches!(
            registry.create("copy", &Value::Null),
            Err(Error::UnknownKind(_))
        ));
        registry.register(NodeKind::custom("identity"), |_| Ok(Box::new(CopyNode)));
        assert!(registry.contains("identity"));
        assert_eq!(
            registry.create("identity", &Value::Null).unwrap().kind(),
            NodeKind::COPY
        );
    }
}
