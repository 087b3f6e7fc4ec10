//! Live module graph addressed by dotted paths
//!
//! Paths follow the usual checkpoint naming: named children are looked up by
//! attribute name, numeric segments index into ordered lists, and leaves are
//! either layers or bare parameters.

use std::collections::{BTreeMap, BTreeSet};

use crate::layers::{DenseLinear, Layer};
use candle_core::Tensor;
use lorapatch_common::{LoraError, Result};
use tracing::debug;

#[derive(Debug)]
pub enum Module {
    /// Named children
    Block(BTreeMap<String, Module>),
    /// Ordered children addressed by index
    List(Vec<Module>),
    Layer(Box<dyn Layer>),
    Param(Tensor),
}

fn join(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() { segment.to_string() } else { format!("{prefix}.{segment}") }
}

impl Module {
    pub fn block() -> Self {
        Self::Block(BTreeMap::new())
    }

    pub fn list(items: Vec<Module>) -> Self {
        Self::List(items)
    }

    pub fn layer(layer: impl Layer + 'static) -> Self {
        Self::Layer(Box::new(layer))
    }

    /// Builder-style child insertion; only blocks take named children
    pub fn with(mut self, name: impl Into<String>, child: Module) -> Self {
        if let Self::Block(children) = &mut self {
            children.insert(name.into(), child);
        }
        self
    }

    /// One hop: list index for numeric segments, attribute lookup otherwise
    pub fn child(&self, segment: &str) -> Option<&Module> {
        match self {
            Self::Block(children) => children.get(segment),
            Self::List(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            Self::Layer(_) | Self::Param(_) => None,
        }
    }

    pub fn child_mut(&mut self, segment: &str) -> Option<&mut Module> {
        match self {
            Self::Block(children) => children.get_mut(segment),
            Self::List(items) => segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
            Self::Layer(_) | Self::Param(_) => None,
        }
    }

    /// Walk a dotted path; any failed hop is `None`
    pub fn get(&self, path: &str) -> Option<&Module> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.').try_fold(self, |node, segment| node.child(segment))
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Module> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.').try_fold(self, |node, segment| node.child_mut(segment))
    }

    pub fn as_layer(&self) -> Option<&dyn Layer> {
        match self {
            Self::Layer(layer) => Some(layer.as_ref()),
            _ => None,
        }
    }

    pub fn as_layer_mut(&mut self) -> Option<&mut dyn Layer> {
        match self {
            Self::Layer(layer) => Some(layer.as_mut()),
            _ => None,
        }
    }

    /// Layer at `path`, if the path exists and ends on a layer
    pub fn layer_at(&self, path: &str) -> Option<&dyn Layer> {
        self.get(path).and_then(Module::as_layer)
    }

    pub fn layer_at_mut(&mut self, path: &str) -> Option<&mut dyn Layer> {
        self.get_mut(path).and_then(Module::as_layer_mut)
    }

    /// Insert `module` at `path`, creating intermediate blocks
    pub fn insert_path(&mut self, path: &str, module: Module) -> Result<()> {
        let segments: Vec<&str> = path.split('.').collect();
        let Some((last, parents)) = segments.split_last().filter(|_| !path.is_empty()) else {
            return Err(LoraError::Validation("empty module path".to_string()));
        };

        let mut node = self;
        for segment in parents {
            node = match node {
                Self::Block(children) => {
                    children.entry(segment.to_string()).or_insert_with(Module::block)
                }
                Self::List(items) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get_mut(i))
                    .ok_or_else(|| LoraError::Validation(format!("no list entry '{segment}' in '{path}'")))?,
                Self::Layer(_) | Self::Param(_) => {
                    return Err(LoraError::Validation(format!(
                        "'{path}' passes through a leaf at '{segment}'"
                    )));
                }
            };
        }

        match node {
            Self::Block(children) => {
                if children.contains_key(*last) {
                    return Err(LoraError::Validation(format!("duplicate module path '{path}'")));
                }
                children.insert(last.to_string(), module);
                Ok(())
            }
            _ => Err(LoraError::Validation(format!("cannot add a named child at '{path}'"))),
        }
    }

    pub fn visit_layers<F: FnMut(&str, &dyn Layer)>(&self, mut f: F) {
        self.walk("", &mut f);
    }

    /// Call `f` with the path and layer of every layer in the graph
    pub fn visit_layers_mut<F: FnMut(&str, &mut dyn Layer)>(&mut self, mut f: F) {
        self.walk_mut("", &mut f);
    }

    pub fn layer_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.visit_layers(|path, _| paths.push(path.to_string()));
        paths
    }

    fn walk<F: FnMut(&str, &dyn Layer)>(&self, path: &str, f: &mut F) {
        match self {
            Self::Layer(layer) => f(path, layer.as_ref()),
            Self::Block(children) => {
                for (name, child) in children {
                    child.walk(&join(path, name), f);
                }
            }
            Self::List(items) => {
                for (i, child) in items.iter().enumerate() {
                    child.walk(&join(path, &i.to_string()), f);
                }
            }
            Self::Param(_) => {}
        }
    }

    fn walk_mut<F: FnMut(&str, &mut dyn Layer)>(&mut self, path: &str, f: &mut F) {
        match self {
            Self::Layer(layer) => f(path, layer.as_mut()),
            Self::Block(children) => {
                for (name, child) in children.iter_mut() {
                    child.walk_mut(&join(path, name), f);
                }
            }
            Self::List(items) => {
                for (i, child) in items.iter_mut().enumerate() {
                    child.walk_mut(&join(path, &i.to_string()), f);
                }
            }
            Self::Param(_) => {}
        }
    }

    /// Build a graph of dense layers from a flat checkpoint.
    ///
    /// Every rank-2 `X.weight` becomes a [`DenseLinear`] at `X` (taking `X.bias`
    /// when present); everything else is kept as a parameter.
    pub fn from_weights(weights: impl IntoIterator<Item = (String, Tensor)>) -> Result<Self> {
        let weights: BTreeMap<String, Tensor> = weights.into_iter().collect();
        let mut root = Module::block();
        let mut consumed = BTreeSet::new();

        for (name, tensor) in &weights {
            let Some(stem) = name.strip_suffix(".weight") else { continue };
            if tensor.rank() != 2 || stem.is_empty() {
                continue;
            }
            let bias_name = format!("{stem}.bias");
            let bias = weights.get(&bias_name).filter(|b| b.rank() == 1).cloned();
            if bias.is_some() {
                consumed.insert(bias_name);
            }
            root.insert_path(stem, Module::layer(DenseLinear::new(tensor.clone(), bias)?))?;
            consumed.insert(name.clone());
        }

        for (name, tensor) in weights {
            if !consumed.contains(&name) {
                root.insert_path(&name, Module::Param(tensor))?;
            }
        }

        debug!(layers = root.layer_paths().len(), "built module graph from weights");
        Ok(root)
    }

    /// Flatten back into checkpoint naming
    pub fn named_tensors(&self) -> Result<BTreeMap<String, Tensor>> {
        let mut out = BTreeMap::new();
        self.collect_tensors("", &mut out)?;
        Ok(out)
    }

    fn collect_tensors(&self, path: &str, out: &mut BTreeMap<String, Tensor>) -> Result<()> {
        match self {
            Self::Layer(layer) => {
                out.insert(join(path, "weight"), layer.weight()?);
                if let Some(bias) = layer.bias() {
                    out.insert(join(path, "bias"), bias.clone());
                }
            }
            Self::Param(tensor) => {
                out.insert(path.to_string(), tensor.clone());
            }
            Self::Block(children) => {
                for (name, child) in children {
                    child.collect_tensors(&join(path, name), out)?;
                }
            }
            Self::List(items) => {
                for (i, child) in items.iter().enumerate() {
                    child.collect_tensors(&join(path, &i.to_string()), out)?;
                }
            }
        }
        Ok(())
    }
}
